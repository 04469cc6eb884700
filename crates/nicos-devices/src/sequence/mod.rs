//! Sequence execution.
//!
//! A sequence is an ordered list of [`Step`]s; each step groups one or more
//! [`SequenceItem`]s. The [`SequenceExecutor`] walks the list in a background
//! task, one step at a time, retrying failed items per its [`RetryPolicy`]
//! and [`SequenceHooks`]. [`BaseSequencer`] wraps an executor and a
//! [`SequenceGenerator`] into an ordinary [`nicos_core::Moveable`].
//!
//! ```text
//! start(target)
//!     │
//!     ▼
//! generate(target) ──▶ [step 1] ──▶ [step 2] ──▶ ... ──▶ Done
//!                        │ run all items
//!                        │ wait all items
//!                        └ stop flag? ──▶ Stopped
//! ```
//!
//! [`RetryPolicy`]: nicos_core::RetryPolicy

pub mod base;
pub mod executor;
pub mod hooks;
pub mod items;

pub use base::{BaseSequencer, SequenceGenerator};
pub use executor::{SequenceExecutor, SequenceExecutorBuilder, SequenceState};
pub use hooks::{DefaultHooks, FailureContext, Recovery, SequenceHooks};
pub use items::{FixAction, SeqCall, SeqDev, SeqFix, SeqNop, SeqSleep, SequenceItem, Step};
