//! Companion poller for devices sharing a bus.

use nicos_core::capabilities::Readable;
use nicos_core::status::DeviceStatus;
use nicos_core::value::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

/// One refresh result of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device: String,
    /// `None` if the read failed; the status then carries the error.
    pub value: Option<Value>,
    pub status: DeviceStatus,
}

/// A single background task refreshing every registered device in turn.
///
/// Devices on one bus are polled one after another, never concurrently, so
/// the poller adds at most one request at a time to the channel. Readings are
/// published on a broadcast channel; dropping the poller stops the task.
pub struct BusPoller {
    tx: broadcast::Sender<Reading>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl BusPoller {
    pub fn spawn(devices: Vec<Arc<dyn Readable>>, period: Duration) -> Self {
        let (tx, _) = broadcast::channel(256);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let publisher = tx.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for dev in &devices {
                            let reading = refresh(dev.as_ref()).await;
                            // no subscribers is fine, the refresh still warms caches
                            let _ = publisher.send(reading);
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            tracing::debug!("bus poller stopped");
        });

        Self {
            tx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Reading> {
        self.tx.subscribe()
    }

    /// Stop the task and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!("bus poller task failed: {}", err);
            }
        }
    }
}

async fn refresh(dev: &dyn Readable) -> Reading {
    let fresh = Some(Duration::ZERO);
    let value = dev.read(fresh).await;
    let status = dev.status(fresh).await;
    let status = match (&value, &status) {
        (Err(err), _) | (_, Err(err)) => {
            tracing::warn!(device = dev.name(), "poll failed: {}", err);
            DeviceStatus::error(err.to_string())
        }
        (Ok(_), Ok(status)) => status.clone(),
    };
    Reading {
        device: dev.name().to_string(),
        value: value.ok(),
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusAxis, SharedBus, SimulatedBus};

    #[tokio::test]
    async fn test_publishes_readings() {
        let sim = SimulatedBus::new([1, 2]);
        let bus = SharedBus::new("bus", sim.clone());
        let a: Arc<dyn Readable> = Arc::new(BusAxis::new("a", 1, bus.clone()));
        let b: Arc<dyn Readable> = Arc::new(BusAxis::new("b", 2, bus));
        let poller = BusPoller::spawn(vec![a, b], Duration::from_millis(10));
        let mut rx = poller.subscribe();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.device, "a");
        assert_eq!(second.device, "b");
        assert_eq!(second.value, Some(Value::Float(0.0)));
        assert!(second.status.is_ok());
        assert_eq!(sim.overlaps(), 0);
        poller.stop().await;
    }

    #[tokio::test]
    async fn test_failed_read_reported_as_error() {
        let sim = SimulatedBus::new([1]);
        let bus = SharedBus::new("bus", sim);
        // address 7 does not exist on the controller
        let ghost: Arc<dyn Readable> = Arc::new(BusAxis::new("ghost", 7, bus));
        let poller = BusPoller::spawn(vec![ghost], Duration::from_millis(10));
        let mut rx = poller.subscribe();
        let reading = rx.recv().await.unwrap();
        assert_eq!(reading.value, None);
        assert_eq!(reading.status.code, nicos_core::status::StatusCode::Error);
        poller.stop().await;
    }
}
