//! Named positions on top of several devices moved together.

use crate::mapping::{mapped_status, PositionEntry, PositionTable, Precision};
use crate::switcher::position_name;
use async_trait::async_trait;
use futures::future::join_all;
use nicos_core::capabilities::{Allowed, MaxAge, Moveable, Readable};
use nicos_core::error::{NicosError, NicosResult};
use nicos_core::status::{combine_named, wait_for_status, DeviceStatus, StatusCode};
use nicos_core::timing::POLL_INTERVAL;
use nicos_core::value::Value;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;

/// Generalization of [`crate::switcher::Switcher`] over N moveables.
///
/// Each table entry holds one value per moveable, followed by one value per
/// read-back-only device. A position matches only if every device is inside
/// its tolerance window at the same time.
///
/// # Example
///
/// ```rust,ignore
/// let changer = MultiSwitcher::builder("changer")
///     .moveable(lift.clone())
///     .moveable(arm.clone())
///     .position("up", vec![14.55.into(), 8.15.into()])
///     .position("down", vec![51.39.into(), 3.14.into()])
///     .precision(vec![0.05])
///     .build()?;
///
/// changer.start(Value::from("up")).await?;
/// ```
pub struct MultiSwitcher {
    name: String,
    moveables: Vec<Arc<dyn Moveable>>,
    readables: Vec<Arc<dyn Readable>>,
    table: RwLock<PositionTable>,
    precision: Precision,
    fallback: Option<String>,
    blocking: bool,
    target: Mutex<Option<String>>,
}

impl MultiSwitcher {
    pub fn builder(name: impl Into<String>) -> MultiSwitcherBuilder {
        MultiSwitcherBuilder::new(name)
    }

    pub fn device_count(&self) -> usize {
        self.moveables.len() + self.readables.len()
    }

    pub fn positions(&self) -> PositionTable {
        self.table.read().clone()
    }

    fn device_names(&self) -> Vec<String> {
        self.moveables
            .iter()
            .map(|d| d.name().to_string())
            .chain(self.readables.iter().map(|d| d.name().to_string()))
            .collect()
    }

    async fn read_raw(&self, maxage: MaxAge) -> NicosResult<Vec<Value>> {
        let moveables = join_all(self.moveables.iter().map(|d| d.read(maxage)));
        let readables = join_all(self.readables.iter().map(|d| d.read(maxage)));
        let (m, r) = futures::join!(moveables, readables);
        m.into_iter().chain(r).collect()
    }

    async fn raw_status(&self, maxage: MaxAge) -> NicosResult<DeviceStatus> {
        let moveables = join_all(self.moveables.iter().map(|d| d.status(maxage)));
        let readables = join_all(self.readables.iter().map(|d| d.status(maxage)));
        let (m, r) = futures::join!(moveables, readables);
        let statuses = m.into_iter().chain(r).collect::<NicosResult<Vec<_>>>()?;
        Ok(combine_named(self.device_names().into_iter().zip(statuses)))
    }

    fn match_raw(&self, raw: &[Value]) -> Option<String> {
        self.table
            .read()
            .find_match(raw, &self.precision)
            .map(str::to_string)
    }

    fn lookup(&self, name: &str) -> NicosResult<Vec<Value>> {
        let table = self.table.read();
        table.get(name).map(<[Value]>::to_vec).ok_or_else(|| {
            NicosError::invalid_value(
                &self.name,
                format!(
                    "'{}' is not a valid position, choose one of {}",
                    name,
                    table.describe_names()
                ),
            )
        })
    }

    async fn is_idle_at(&self, name: &str) -> bool {
        let fresh = Some(Duration::ZERO);
        match self.raw_status(fresh).await {
            Ok(st) if st.code == StatusCode::Ok => {}
            _ => return false,
        }
        match self.read_raw(fresh).await {
            Ok(raw) => self.match_raw(&raw).as_deref() == Some(name),
            Err(_) => false,
        }
    }

    /// Replace the position table. Refused while any device is busy.
    pub async fn set_positions(&self, table: PositionTable) -> NicosResult<()> {
        if table.arity() != self.device_count() {
            return Err(NicosError::configuration(
                &self.name,
                format!(
                    "position entries need {} values, got {}",
                    self.device_count(),
                    table.arity()
                ),
            ));
        }
        if self.raw_status(Some(Duration::ZERO)).await?.code == StatusCode::Busy {
            return Err(NicosError::moving(
                &self.name,
                "cannot change positions while moving",
            ));
        }
        *self.table.write() = table;
        tracing::info!(device = %self.name, "position table replaced");
        Ok(())
    }
}

#[async_trait]
impl Readable for MultiSwitcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, maxage: MaxAge) -> NicosResult<Value> {
        let raw = self.read_raw(maxage).await?;
        if let Some(name) = self.match_raw(&raw) {
            return Ok(Value::Str(name));
        }
        if let Some(fallback) = &self.fallback {
            return Ok(Value::Str(fallback.clone()));
        }
        Err(NicosError::position(
            &self.name,
            format!(
                "unknown position of {}: {}",
                self.device_names().join(", "),
                Value::Tuple(raw)
            ),
        ))
    }

    async fn status(&self, maxage: MaxAge) -> NicosResult<DeviceStatus> {
        let move_status = self.raw_status(maxage).await?;
        if move_status.code != StatusCode::Ok {
            return Ok(move_status);
        }
        let raw = self.read_raw(maxage).await?;
        Ok(mapped_status(
            self.match_raw(&raw).is_some(),
            self.target.lock().is_some(),
            self.fallback.is_some(),
            &self.device_names().join(", "),
        ))
    }

    async fn reset(&self) -> NicosResult<DeviceStatus> {
        for dev in &self.moveables {
            dev.reset().await?;
        }
        for dev in &self.readables {
            dev.reset().await?;
        }
        self.status(Some(Duration::ZERO)).await
    }
}

#[async_trait]
impl Moveable for MultiSwitcher {
    async fn start(&self, target: Value) -> NicosResult<()> {
        let name = position_name(&self.name, &target)?;
        let values = self.lookup(name)?;
        // only the moveables are checked and moved, they come first in the entry
        for (dev, value) in self.moveables.iter().zip(&values) {
            if let Allowed::No(reason) = dev.is_allowed(value).await {
                return Err(NicosError::limit(
                    &self.name,
                    format!("{} not allowed for {}: {}", value, dev.name(), reason),
                ));
            }
        }
        *self.target.lock() = Some(name.to_string());
        if self.is_idle_at(name).await {
            tracing::debug!(device = %self.name, "already at '{}'", name);
            return Ok(());
        }
        for (dev, value) in self.moveables.iter().zip(values) {
            tracing::debug!(device = %self.name, "moving {} to {}", dev.name(), value);
            dev.start(value).await?;
        }
        if self.blocking {
            for dev in &self.moveables {
                tracing::debug!(device = %self.name, "waiting for {}", dev.name());
                dev.wait().await?;
            }
            for dev in &self.readables {
                wait_for_status(dev.as_ref(), POLL_INTERVAL).await?;
            }
        }
        Ok(())
    }

    async fn stop(&self) -> NicosResult<()> {
        let results = join_all(self.moveables.iter().map(|d| d.stop())).await;
        results.into_iter().collect()
    }

    async fn is_allowed(&self, target: &Value) -> Allowed {
        let values = match position_name(&self.name, target).and_then(|n| self.lookup(n)) {
            Ok(values) => values,
            Err(err) => return Allowed::No(err.message().to_string()),
        };
        for (dev, value) in self.moveables.iter().zip(&values) {
            if let Allowed::No(reason) = dev.is_allowed(value).await {
                return Allowed::No(format!("{}: {}", dev.name(), reason));
            }
        }
        Allowed::Yes
    }

    fn target(&self) -> Option<Value> {
        self.target.lock().clone().map(Value::Str)
    }
}

/// Builder for [`MultiSwitcher`].
pub struct MultiSwitcherBuilder {
    name: String,
    moveables: Vec<Arc<dyn Moveable>>,
    readables: Vec<Arc<dyn Readable>>,
    positions: Vec<PositionEntry>,
    precision: Vec<f64>,
    fallback: Option<String>,
    blocking: bool,
}

impl MultiSwitcherBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            moveables: Vec::new(),
            readables: Vec::new(),
            positions: Vec::new(),
            precision: Vec::new(),
            fallback: None,
            blocking: true,
        }
    }

    pub fn moveable(mut self, dev: Arc<dyn Moveable>) -> Self {
        self.moveables.push(dev);
        self
    }

    /// Add a device that takes part in matching but is never moved.
    pub fn readable(mut self, dev: Arc<dyn Readable>) -> Self {
        self.readables.push(dev);
        self
    }

    /// Add a position with one value per moveable, then per readable.
    pub fn position(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.positions.push(PositionEntry {
            name: name.into(),
            values,
        });
        self
    }

    /// Tolerances: empty for exact matching, one for all devices, or one
    /// per device.
    pub fn precision(mut self, precision: Vec<f64>) -> Self {
        self.precision = precision;
        self
    }

    pub fn fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn build(self) -> NicosResult<MultiSwitcher> {
        if self.moveables.is_empty() {
            return Err(NicosError::configuration(
                &self.name,
                "at least one moveable is required",
            ));
        }
        let devices = self.moveables.len() + self.readables.len();
        let table = PositionTable::new(&self.name, self.positions, devices)?;
        let precision = Precision::from_list(&self.name, self.precision, devices)?;
        precision.validate(&self.name, devices)?;
        Ok(MultiSwitcher {
            name: self.name,
            moveables: self.moveables,
            readables: self.readables,
            table: RwLock::new(table),
            precision,
            fallback: self.fallback,
            blocking: self.blocking,
            target: Mutex::new(None),
        })
    }
}
