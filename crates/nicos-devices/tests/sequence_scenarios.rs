//! End-to-end sequences over simulated motors.

use nicos_core::capabilities::{Moveable, Readable};
use nicos_core::error::NicosError;
use nicos_core::error_recovery::RetryPolicy;
use nicos_core::status::StatusCode;
use nicos_core::value::Value;
use nicos_devices::sequence::{SeqDev, SeqSleep, SequenceExecutor, SequenceState, Step};
use nicos_devices::{ErrorConfig, ErrorScenario, Switcher, VirtualMotor};
use std::sync::Arc;
use std::time::Duration;

fn motor(name: &str, errors: ErrorConfig) -> Arc<VirtualMotor> {
    Arc::new(
        VirtualMotor::builder(name)
            .limits(-100.0, 100.0)
            .error_config(errors)
            .build()
            .unwrap(),
    )
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff_delay: Duration::from_millis(5),
    }
}

fn move_sleep_move(a: &Arc<VirtualMotor>, b: &Arc<VirtualMotor>) -> Vec<Step> {
    vec![
        SeqDev::new(a.clone(), 10.0).into(),
        SeqSleep::new(Duration::from_millis(100)).into(),
        SeqDev::new(b.clone(), 5.0).into(),
    ]
}

#[tokio::test]
async fn failing_twice_within_budget_completes() {
    let a = motor(
        "a",
        ErrorConfig::scenario(ErrorScenario::FailFirstStarts { count: 2 }),
    );
    let b = motor("b", ErrorConfig::none());
    let executor = SequenceExecutor::builder("seq").policy(policy(3)).build();

    executor.start(move_sleep_move(&a, &b)).await.unwrap();
    executor.wait().await.unwrap();

    assert_eq!(executor.state(), SequenceState::Done);
    assert_eq!(a.start_count(), 3);
    assert_eq!(b.start_count(), 1);
    assert_eq!(a.read(None).await.unwrap(), Value::Float(10.0));
    assert_eq!(b.read(None).await.unwrap(), Value::Float(5.0));
}

#[tokio::test]
async fn failing_beyond_budget_needs_manual_fixing() {
    let a = motor(
        "a",
        ErrorConfig::scenario(ErrorScenario::FailFirstStarts { count: 3 }),
    );
    let b = motor("b", ErrorConfig::none());
    let executor = SequenceExecutor::builder("seq").policy(policy(3)).build();

    executor.start(move_sleep_move(&a, &b)).await.unwrap();
    let err = executor.wait().await.unwrap_err();

    assert!(matches!(err, NicosError::Communication { .. }));
    assert_eq!(executor.state(), SequenceState::Failed);
    assert_eq!(a.start_count(), 3);
    assert_eq!(b.start_count(), 0);
    let st = executor.status();
    assert_eq!(st.code, StatusCode::Error);
    assert!(st.message.contains("needs manual fixing"));

    // stays latched until an explicit reset
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(executor.status().message.contains("needs manual fixing"));
    executor.reset().unwrap();
    executor.start(move_sleep_move(&a, &b)).await.unwrap();
    executor.wait().await.unwrap();
}

#[tokio::test]
async fn motion_fault_is_retried_by_wait() {
    let a = motor(
        "a",
        ErrorConfig::scenario(ErrorScenario::FaultFirstMotions { count: 1 }),
    );
    let executor = SequenceExecutor::builder("seq").policy(policy(2)).build();
    executor
        .start(vec![SeqDev::new(a.clone(), 7.0).into()])
        .await
        .unwrap();
    executor.wait().await.unwrap();
    assert_eq!(a.start_count(), 2);
    assert_eq!(a.read(None).await.unwrap(), Value::Float(7.0));
}

#[tokio::test]
async fn stop_lets_the_current_step_finish() {
    let a = Arc::new(
        VirtualMotor::builder("a")
            .limits(-100.0, 100.0)
            .speed(50.0)
            .build()
            .unwrap(),
    );
    let b = motor("b", ErrorConfig::none());
    let executor = SequenceExecutor::new("seq");
    executor
        .start(vec![
            SeqDev::new(a.clone(), 10.0).into(),
            SeqDev::new(b.clone(), 5.0).into(),
        ])
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    executor.stop().await.unwrap();
    let err = executor.wait().await.unwrap_err();

    assert!(matches!(err, NicosError::Stopped { .. }));
    // step 1 ran to its end, step 2 never began
    assert_eq!(a.read(None).await.unwrap(), Value::Float(10.0));
    assert_eq!(b.start_count(), 0);
    assert_eq!(executor.status().code, StatusCode::NotReached);
}

#[tokio::test]
async fn switcher_inside_a_sequence() {
    let axis = motor("slit", ErrorConfig::none());
    let slit = Arc::new(
        Switcher::builder("slit_pos", axis.clone())
            .position("open", 20.0)
            .position("closed", 0.0)
            .precision(0.01)
            .build()
            .unwrap(),
    );
    let executor = SequenceExecutor::new("seq");

    let bad = executor
        .start(vec![SeqDev::new(slit.clone(), "half").into()])
        .await;
    assert!(bad.is_err());
    assert_eq!(axis.start_count(), 0);

    executor
        .start(vec![SeqDev::new(slit.clone(), "open").into()])
        .await
        .unwrap();
    executor.wait().await.unwrap();
    assert_eq!(slit.read(None).await.unwrap(), Value::from("open"));
    assert_eq!(slit.target(), Some(Value::from("open")));
}
