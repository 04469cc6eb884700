//! Device registry: turns a [`Setup`] into live, attached devices.
//!
//! Devices are created in dependency order regardless of their order in the
//! setup file. Each pass creates every device whose attachments already
//! exist; a pass that creates nothing means the remaining devices attach to
//! each other in a cycle.

use crate::setup::{DeviceConfig, Setup};
use futures::future::join_all;
use nicos_core::capabilities::{Fixable, MaxAge, Moveable, Readable};
use nicos_core::error::{NicosError, NicosResult};
use nicos_core::error_recovery::RetryPolicy;
use nicos_core::status::DeviceStatus;
use nicos_core::value::Value;
use nicos_devices::{LockedDevice, MultiSwitcher, ReadonlySwitcher, Switcher, VirtualMotor};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A created device, with the capabilities it offers.
#[derive(Clone)]
pub struct DeviceEntry {
    kind: &'static str,
    readable: Arc<dyn Readable>,
    moveable: Option<Arc<dyn Moveable>>,
    fixable: Option<Arc<dyn Fixable>>,
}

impl DeviceEntry {
    fn readonly<T: Readable + 'static>(kind: &'static str, dev: Arc<T>) -> Self {
        Self {
            kind,
            readable: dev,
            moveable: None,
            fixable: None,
        }
    }

    fn new_moveable<T: Moveable + 'static>(kind: &'static str, dev: Arc<T>) -> Self {
        Self {
            kind,
            readable: dev.clone(),
            moveable: Some(dev),
            fixable: None,
        }
    }

    fn new_fixable<T: Moveable + Fixable + 'static>(kind: &'static str, dev: Arc<T>) -> Self {
        Self {
            fixable: Some(dev.clone()),
            ..Self::new_moveable(kind, dev)
        }
    }

    pub fn name(&self) -> &str {
        self.readable.name()
    }

    /// Setup type of the device, e.g. `"switcher"`.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn readable(&self) -> &Arc<dyn Readable> {
        &self.readable
    }

    pub fn moveable(&self) -> Option<&Arc<dyn Moveable>> {
        self.moveable.as_ref()
    }

    pub fn fixable(&self) -> Option<&Arc<dyn Fixable>> {
        self.fixable.as_ref()
    }

    pub fn is_moveable(&self) -> bool {
        self.moveable.is_some()
    }
}

/// All devices of one setup, by name.
pub struct Registry {
    order: Vec<String>,
    devices: HashMap<String, DeviceEntry>,
}

impl Registry {
    /// Create every device of `setup` and attach them to each other.
    pub fn from_setup(setup: &Setup) -> NicosResult<Self> {
        let known: HashSet<&str> = setup.devices.iter().map(DeviceConfig::name).collect();
        for cfg in &setup.devices {
            if let Some(missing) = cfg.attachments().into_iter().find(|a| !known.contains(a)) {
                return Err(NicosError::configuration(
                    cfg.name(),
                    format!("attached device '{}' is not defined in the setup", missing),
                ));
            }
        }

        let policy = RetryPolicy::from(&setup.retry);
        let mut devices: HashMap<String, DeviceEntry> = HashMap::new();
        let mut pending: Vec<&DeviceConfig> = setup.devices.iter().collect();
        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::new();
            for cfg in pending {
                if cfg.attachments().iter().all(|a| devices.contains_key(*a)) {
                    let entry = create(cfg, &devices, &policy)?;
                    tracing::debug!(device = cfg.name(), kind = cfg.kind(), "device created");
                    devices.insert(cfg.name().to_string(), entry);
                } else {
                    waiting.push(cfg);
                }
            }
            if waiting.len() == before {
                let names: Vec<&str> = waiting.iter().map(|cfg| cfg.name()).collect();
                return Err(NicosError::configuration(
                    names.first().copied().unwrap_or_default(),
                    format!("cyclic attachments between {}", names.join(", ")),
                ));
            }
            pending = waiting;
        }

        tracing::info!("created {} devices", devices.len());
        Ok(Self {
            order: setup
                .devices
                .iter()
                .map(|cfg| cfg.name().to_string())
                .collect(),
            devices,
        })
    }

    /// Device names in setup order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, name: &str) -> NicosResult<&DeviceEntry> {
        self.devices
            .get(name)
            .ok_or_else(|| NicosError::configuration(name, "no such device in the setup"))
    }

    pub fn moveable(&self, name: &str) -> NicosResult<Arc<dyn Moveable>> {
        self.get(name)?
            .moveable()
            .cloned()
            .ok_or_else(|| NicosError::configuration(name, "device cannot be moved"))
    }

    /// Read every device concurrently, in setup order.
    pub async fn read_all(&self, maxage: MaxAge) -> Vec<(String, NicosResult<Value>)> {
        let reads = self.names().map(|name| async move {
            let result = match self.get(name) {
                Ok(entry) => entry.readable().read(maxage).await,
                Err(err) => Err(err),
            };
            (name.to_string(), result)
        });
        join_all(reads).await
    }

    /// Status of every device concurrently, in setup order.
    pub async fn status_all(&self, maxage: MaxAge) -> Vec<(String, NicosResult<DeviceStatus>)> {
        let polls = self.names().map(|name| async move {
            let result = match self.get(name) {
                Ok(entry) => entry.readable().status(maxage).await,
                Err(err) => Err(err),
            };
            (name.to_string(), result)
        });
        join_all(polls).await
    }

    /// Stop every moveable device, reporting the first failure.
    pub async fn stop_all(&self) -> NicosResult<()> {
        let stops = self
            .names()
            .filter_map(|name| self.devices.get(name)?.moveable().cloned())
            .map(|dev| async move { dev.stop().await });
        join_all(stops).await.into_iter().collect()
    }
}

fn attached_readable(
    devices: &HashMap<String, DeviceEntry>,
    owner: &str,
    name: &str,
) -> NicosResult<Arc<dyn Readable>> {
    devices
        .get(name)
        .map(|entry| entry.readable().clone())
        .ok_or_else(|| NicosError::configuration(owner, format!("'{}' is not created yet", name)))
}

fn attached_moveable(
    devices: &HashMap<String, DeviceEntry>,
    owner: &str,
    name: &str,
) -> NicosResult<Arc<dyn Moveable>> {
    devices
        .get(name)
        .and_then(|entry| entry.moveable().cloned())
        .ok_or_else(|| {
            NicosError::configuration(owner, format!("attached device '{}' is not moveable", name))
        })
}

fn attached_fixable(
    devices: &HashMap<String, DeviceEntry>,
    owner: &str,
    name: &str,
) -> NicosResult<Arc<dyn Fixable>> {
    devices
        .get(name)
        .and_then(|entry| entry.fixable().cloned())
        .ok_or_else(|| {
            NicosError::configuration(owner, format!("attached device '{}' cannot be fixed", name))
        })
}

fn create(
    cfg: &DeviceConfig,
    devices: &HashMap<String, DeviceEntry>,
    default_policy: &RetryPolicy,
) -> NicosResult<DeviceEntry> {
    let kind = cfg.kind();
    match cfg {
        DeviceConfig::VirtualMotor {
            name,
            position,
            speed,
            precision,
            limits,
            user_limits,
            offset,
            timeout,
            reference_position,
            unit,
            errors,
        } => {
            let mut builder = VirtualMotor::builder(name.as_str())
                .position(*position)
                .speed(*speed)
                .precision(*precision)
                .limits(limits.0, limits.1)
                .offset(*offset)
                .timeout(*timeout)
                .reference_position(*reference_position)
                .unit(unit.as_str())
                .error_config(errors.clone().into());
            if let Some((min, max)) = user_limits {
                builder = builder.user_limits(*min, *max);
            }
            Ok(DeviceEntry::new_fixable(kind, Arc::new(builder.build()?)))
        }
        DeviceConfig::Switcher {
            name,
            moveable,
            positions,
            precision,
            fallback,
            blocking,
            relax_mapping,
        } => {
            let mut builder = Switcher::builder(name.as_str(), attached_moveable(devices, name, moveable)?)
                .blocking(*blocking)
                .relax_mapping(*relax_mapping);
            for pos in positions {
                builder = builder.position(pos.name.as_str(), pos.value.clone());
            }
            if let Some(precision) = precision {
                builder = builder.precision(*precision);
            }
            if let Some(fallback) = fallback {
                builder = builder.fallback(fallback.as_str());
            }
            Ok(DeviceEntry::new_moveable(kind, Arc::new(builder.build()?)))
        }
        DeviceConfig::ReadonlySwitcher {
            name,
            readable,
            positions,
            precision,
            fallback,
        } => {
            let switcher = ReadonlySwitcher::new(
                name.as_str(),
                attached_readable(devices, name, readable)?,
                positions
                    .iter()
                    .map(|pos| (pos.name.clone(), pos.value.clone()))
                    .collect(),
                *precision,
                fallback.clone(),
            )?;
            Ok(DeviceEntry::readonly(kind, Arc::new(switcher)))
        }
        DeviceConfig::MultiSwitcher {
            name,
            moveables,
            readables,
            positions,
            precision,
            fallback,
            blocking,
        } => {
            let mut builder = MultiSwitcher::builder(name.as_str())
                .precision(precision.clone())
                .blocking(*blocking);
            for dev in moveables {
                builder = builder.moveable(attached_moveable(devices, name, dev)?);
            }
            for dev in readables {
                builder = builder.readable(attached_readable(devices, name, dev)?);
            }
            for pos in positions {
                builder = builder.position(pos.name.as_str(), pos.values.clone());
            }
            if let Some(fallback) = fallback {
                builder = builder.fallback(fallback.as_str());
            }
            Ok(DeviceEntry::new_moveable(kind, Arc::new(builder.build()?)))
        }
        DeviceConfig::Locked {
            name,
            device,
            lock,
            unlock_value,
            lock_value,
            keep_fixed,
            retry,
        } => {
            let policy = retry
                .as_ref()
                .map(RetryPolicy::from)
                .unwrap_or_else(|| default_policy.clone());
            let mut builder = LockedDevice::builder(
                name.as_str(),
                attached_moveable(devices, name, device)?,
                attached_moveable(devices, name, lock)?,
                unlock_value.clone(),
            )
            .policy(policy);
            if let Some(value) = lock_value {
                builder = builder.lock_value(value.clone());
            }
            if *keep_fixed {
                builder = builder.keep_fixed(attached_fixable(devices, name, lock)?);
            }
            Ok(DeviceEntry::new_moveable(kind, Arc::new(builder.build()?)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nicos_core::status::StatusCode;
    use tracing_test::traced_test;

    fn registry(text: &str) -> NicosResult<Registry> {
        Registry::from_setup(&Setup::from_toml(text).unwrap())
    }

    #[tokio::test]
    async fn test_resolves_in_any_order() {
        let reg = registry(
            r#"
[[devices]]
type = "locked"
name = "lt"
device = "tbl"
lock = "brake"
unlock_value = "off"
lock_value = "on"

[[devices]]
type = "switcher"
name = "brake"
moveable = "brake_m"
positions = [{ name = "on", value = 1.0 }, { name = "off", value = 0.0 }]

[[devices]]
type = "virtual_motor"
name = "brake_m"
position = 1.0
limits = [0, 1]

[[devices]]
type = "virtual_motor"
name = "tbl"
limits = [-10, 10]
"#,
        )
        .unwrap();

        assert_eq!(reg.len(), 4);
        assert_eq!(
            reg.names().collect::<Vec<_>>(),
            vec!["lt", "brake", "brake_m", "tbl"]
        );
        assert_eq!(reg.get("lt").unwrap().kind(), "locked");
        assert!(reg.get("tbl").unwrap().fixable().is_some());

        let lt = reg.moveable("lt").unwrap();
        lt.maw(Value::Float(4.0)).await.unwrap();
        assert_eq!(lt.read(None).await.unwrap(), Value::Float(4.0));
        let brake = reg.get("brake").unwrap().readable().clone();
        assert_eq!(brake.read(None).await.unwrap(), Value::from("on"));
    }

    #[test]
    fn test_unknown_attachment() {
        let err = registry(
            r#"
[[devices]]
type = "switcher"
name = "sw"
moveable = "ghost"
positions = [{ name = "a", value = 1 }]
"#,
        )
        .err()
        .unwrap();
        assert!(matches!(err, NicosError::Configuration { .. }));
        assert_eq!(err.device(), "sw");
        assert!(err.message().contains("ghost"));
    }

    #[test]
    fn test_cycle_detected() {
        let err = registry(
            r#"
[[devices]]
type = "switcher"
name = "a"
moveable = "b"
positions = [{ name = "x", value = 1 }]

[[devices]]
type = "switcher"
name = "b"
moveable = "a"
positions = [{ name = "x", value = 1 }]
"#,
        )
        .err()
        .unwrap();
        assert!(matches!(err, NicosError::Configuration { .. }));
        assert!(err.message().contains("cyclic"));
    }

    #[test]
    fn test_readonly_device_cannot_be_moved() {
        let reg = registry(
            r#"
[[devices]]
type = "virtual_motor"
name = "m"
limits = [0, 10]

[[devices]]
type = "readonly_switcher"
name = "ro"
readable = "m"
positions = [{ name = "home", value = 0.0 }]

[[devices]]
type = "switcher"
name = "sw"
moveable = "ro"
positions = [{ name = "x", value = "home" }]
"#,
        );
        let err = reg.err().unwrap();
        assert_eq!(err.device(), "sw");
        assert!(err.message().contains("not moveable"));
    }

    #[test]
    fn test_keep_fixed_needs_fixable_lock() {
        let err = registry(
            r#"
[[devices]]
type = "virtual_motor"
name = "m"
limits = [0, 10]

[[devices]]
type = "virtual_motor"
name = "k"
limits = [0, 1]

[[devices]]
type = "switcher"
name = "ks"
moveable = "k"
positions = [{ name = "on", value = 1.0 }, { name = "off", value = 0.0 }]

[[devices]]
type = "locked"
name = "l"
device = "m"
lock = "ks"
unlock_value = "off"
keep_fixed = true
"#,
        )
        .err()
        .unwrap();
        assert_eq!(err.device(), "l");
        assert!(err.message().contains("cannot be fixed"));
    }

    #[tokio::test]
    async fn test_read_and_status_all() {
        let reg = registry(
            r#"
[[devices]]
type = "virtual_motor"
name = "m1"
position = 2.0
limits = [0, 10]

[[devices]]
type = "multi_switcher"
name = "pair"
moveables = ["m1", "m2"]
positions = [{ name = "home", values = [2.0, 3.0] }]
precision = [0.01]

[[devices]]
type = "virtual_motor"
name = "m2"
position = 3.0
limits = [0, 10]
"#,
        )
        .unwrap();

        let reads = reg.read_all(None).await;
        assert_eq!(reads.len(), 3);
        assert_eq!(reads[1].0, "pair");
        assert_eq!(reads[1].1.as_ref().unwrap(), &Value::from("home"));

        let statuses = reg.status_all(None).await;
        assert!(statuses
            .iter()
            .all(|(_, st)| st.as_ref().unwrap().code == StatusCode::Ok));
        reg.stop_all().await.unwrap();
    }

    #[test]
    #[traced_test]
    fn test_creation_logged() {
        registry(
            r#"
[[devices]]
type = "readonly_switcher"
name = "ro"
readable = "m"
positions = [{ name = "home", value = 0.0 }]

[[devices]]
type = "virtual_motor"
name = "m"
limits = [0, 10]
"#,
        )
        .unwrap();
        assert!(logs_contain("created 2 devices"));
    }

    #[test]
    fn test_missing_device() {
        let reg = registry("").unwrap();
        assert!(reg.is_empty());
        assert!(matches!(
            reg.get("nope"),
            Err(NicosError::Configuration { .. })
        ));
    }
}
