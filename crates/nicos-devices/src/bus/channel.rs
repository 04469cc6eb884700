//! One communication channel shared by many logical devices.

use async_trait::async_trait;
use nicos_core::error::{NicosError, NicosResult};
use nicos_core::timing::CHANNEL_LOCK_TIMEOUT;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Line-oriented request/response transport.
///
/// Implementations own the physical connection (serial line, socket, or
/// simulation). They are only ever driven by one caller at a time through
/// [`SharedBus`].
#[async_trait]
pub trait BusTransport: Send {
    /// Write one request line.
    async fn send(&mut self, line: &str) -> NicosResult<()>;

    /// Read one reply line.
    async fn receive(&mut self) -> NicosResult<String>;
}

/// Serialized access to a [`BusTransport`].
///
/// Clones share the same transport. Every `query`/`command` holds the
/// channel for the whole request/response exchange, so replies can never be
/// interleaved between logical devices.
#[derive(Clone)]
pub struct SharedBus {
    name: Arc<str>,
    port: Arc<Mutex<Box<dyn BusTransport>>>,
    lock_timeout: Duration,
    reply_timeout: Duration,
}

impl SharedBus {
    pub fn new(name: impl Into<String>, transport: impl BusTransport + 'static) -> Self {
        Self {
            name: Arc::from(name.into()),
            port: Arc::new(Mutex::new(Box::new(transport))),
            lock_timeout: CHANNEL_LOCK_TIMEOUT,
            reply_timeout: Duration::from_secs(1),
        }
    }

    /// Maximum time to wait for the channel to become free.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Maximum time to wait for a reply once the request was sent.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self, owner: &str) -> NicosResult<MutexGuard<'_, Box<dyn BusTransport>>> {
        tokio::time::timeout(self.lock_timeout, self.port.lock())
            .await
            .map_err(|_| {
                NicosError::timeout(
                    owner,
                    format!("{} busy for more than {:?}", self.name, self.lock_timeout),
                )
            })
    }

    /// Send `request` and return the reply line.
    pub async fn query(&self, owner: &str, request: &str) -> NicosResult<String> {
        let mut port = self.acquire(owner).await?;
        tracing::trace!(bus = %self.name, device = owner, "-> {}", request);
        port.send(request).await?;
        let reply = tokio::time::timeout(self.reply_timeout, port.receive())
            .await
            .map_err(|_| {
                NicosError::timeout(owner, format!("no reply to '{}' on {}", request, self.name))
            })??;
        tracing::trace!(bus = %self.name, device = owner, "<- {}", reply);
        Ok(reply)
    }

    /// Send `request` without waiting for a reply.
    pub async fn command(&self, owner: &str, request: &str) -> NicosResult<()> {
        let mut port = self.acquire(owner).await?;
        tracing::trace!(bus = %self.name, device = owner, "-> {}", request);
        port.send(request).await
    }
}
