//! Named positions on top of one continuous device.
//!
//! A [`Switcher`] lets an operator write `move(changer, 'up')` instead of
//! `move(changer_axis, 14.55)` while keeping the axis itself available for
//! debugging. [`ReadonlySwitcher`] does the same for a device that can only
//! be read.

use crate::mapping::{mapped_status, PositionTable, Precision};
use async_trait::async_trait;
use nicos_core::capabilities::{Allowed, MaxAge, Moveable, Readable};
use nicos_core::error::{NicosError, NicosResult};
use nicos_core::status::{DeviceStatus, StatusCode};
use nicos_core::value::Value;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;

/// Extract the position name from a target value.
pub(crate) fn position_name<'a>(device: &str, target: &'a Value) -> NicosResult<&'a str> {
    target.as_str().ok_or_else(|| {
        NicosError::invalid_value(device, format!("{} is not a position name", target))
    })
}

/// Maps named positions onto raw values of one moveable.
pub struct Switcher {
    name: String,
    moveable: Arc<dyn Moveable>,
    table: RwLock<PositionTable>,
    precision: Option<f64>,
    fallback: Option<String>,
    blocking: bool,
    relax_mapping: bool,
    target: Mutex<Option<String>>,
}

impl Switcher {
    pub fn builder(name: impl Into<String>, moveable: Arc<dyn Moveable>) -> SwitcherBuilder {
        SwitcherBuilder::new(name, moveable)
    }

    pub fn moveable(&self) -> &Arc<dyn Moveable> {
        &self.moveable
    }

    pub fn positions(&self) -> PositionTable {
        self.table.read().clone()
    }

    pub fn fallback(&self) -> Option<&str> {
        self.fallback.as_deref()
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    fn precision_spec(&self) -> Precision {
        match self.precision {
            Some(p) if p > 0.0 => Precision::Uniform(p),
            _ => Precision::Exact,
        }
    }

    fn lookup(&self, name: &str) -> NicosResult<Value> {
        let table = self.table.read();
        table
            .get(name)
            .and_then(|values| values.first().cloned())
            .ok_or_else(|| {
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

    fn match_raw(&self, raw: &Value) -> Option<String> {
        self.table
            .read()
            .find_match(std::slice::from_ref(raw), &self.precision_spec())
            .map(str::to_string)
    }

    /// Map a raw readback: table match, else fallback, else the raw value
    /// with `relax_mapping`, else a position error.
    fn map_read_value(&self, raw: Value) -> NicosResult<Value> {
        if let Some(name) = self.match_raw(&raw) {
            return Ok(Value::Str(name));
        }
        if let Some(fallback) = &self.fallback {
            return Ok(Value::Str(fallback.clone()));
        }
        if self.relax_mapping {
            return Ok(raw);
        }
        Err(NicosError::position(
            &self.name,
            format!("unknown position of {}: {}", self.moveable.name(), raw),
        ))
    }

    /// Whether the underlying device is idle and already at position `name`.
    async fn is_idle_at(&self, name: &str) -> bool {
        let fresh = Some(Duration::ZERO);
        match self.moveable.status(fresh).await {
            Ok(st) if st.code == StatusCode::Ok => {}
            _ => return false,
        }
        match self.moveable.read(fresh).await {
            Ok(raw) => self.match_raw(&raw).as_deref() == Some(name),
            Err(_) => false,
        }
    }

    /// Replace the position table. Refused while the underlying device moves.
    pub async fn set_positions(&self, table: PositionTable) -> NicosResult<()> {
        if table.arity() != 1 {
            return Err(NicosError::configuration(
                &self.name,
                "a switcher table needs exactly one value per position",
            ));
        }
        let st = self.moveable.status(Some(Duration::ZERO)).await?;
        if st.code == StatusCode::Busy {
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
impl Readable for Switcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, maxage: MaxAge) -> NicosResult<Value> {
        let raw = self.moveable.read(maxage).await?;
        self.map_read_value(raw)
    }

    async fn status(&self, maxage: MaxAge) -> NicosResult<DeviceStatus> {
        let move_status = self.moveable.status(maxage).await?;
        if move_status.code != StatusCode::Ok {
            return Ok(move_status);
        }
        let raw = self.moveable.read(maxage).await?;
        let matched = self.match_raw(&raw).is_some();
        Ok(mapped_status(
            matched,
            self.target.lock().is_some(),
            self.fallback.is_some(),
            self.moveable.name(),
        ))
    }

    /// Tolerance used to match readbacks against the table.
    fn precision(&self) -> Option<f64> {
        self.precision.filter(|p| *p > 0.0)
    }

    async fn reset(&self) -> NicosResult<DeviceStatus> {
        self.moveable.reset().await?;
        self.status(Some(Duration::ZERO)).await
    }
}

#[async_trait]
impl Moveable for Switcher {
    async fn start(&self, target: Value) -> NicosResult<()> {
        let name = position_name(&self.name, &target)?;
        let raw = self.lookup(name)?;
        if let Allowed::No(reason) = self.moveable.is_allowed(&raw).await {
            return Err(NicosError::limit(
                &self.name,
                format!("{} not allowed for {}: {}", raw, self.moveable.name(), reason),
            ));
        }
        *self.target.lock() = Some(name.to_string());
        if self.is_idle_at(name).await {
            tracing::debug!(device = %self.name, "already at '{}'", name);
            return Ok(());
        }
        tracing::debug!(device = %self.name, "moving {} to {}", self.moveable.name(), raw);
        self.moveable.start(raw).await?;
        if self.blocking {
            self.moveable.wait().await?;
        }
        Ok(())
    }

    async fn stop(&self) -> NicosResult<()> {
        self.moveable.stop().await
    }

    async fn is_allowed(&self, target: &Value) -> Allowed {
        let name = match position_name(&self.name, target) {
            Ok(name) => name,
            Err(err) => return Allowed::No(err.message().to_string()),
        };
        match self.lookup(name) {
            Ok(raw) => self.moveable.is_allowed(&raw).await,
            Err(err) => Allowed::No(err.message().to_string()),
        }
    }

    fn target(&self) -> Option<Value> {
        self.target.lock().clone().map(Value::Str)
    }
}

/// Builder for [`Switcher`].
pub struct SwitcherBuilder {
    name: String,
    moveable: Arc<dyn Moveable>,
    positions: Vec<(String, Value)>,
    precision: Option<f64>,
    fallback: Option<String>,
    blocking: bool,
    relax_mapping: bool,
}

impl SwitcherBuilder {
    pub fn new(name: impl Into<String>, moveable: Arc<dyn Moveable>) -> Self {
        Self {
            name: name.into(),
            moveable,
            positions: Vec::new(),
            precision: None,
            fallback: None,
            blocking: true,
            relax_mapping: false,
        }
    }

    /// Add a position; table order is the matching order.
    pub fn position(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.positions.push((name.into(), value.into()));
        self
    }

    pub fn precision(mut self, precision: f64) -> Self {
        self.precision = Some(precision);
        self
    }

    pub fn fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    /// Wait for the underlying device inside `start` (default: true).
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Report the raw value instead of failing when nothing matches.
    pub fn relax_mapping(mut self, relax: bool) -> Self {
        self.relax_mapping = relax;
        self
    }

    pub fn build(self) -> NicosResult<Switcher> {
        let table = PositionTable::single(&self.name, self.positions)?;
        if matches!(self.precision, Some(p) if p < 0.0 || p.is_nan()) {
            return Err(NicosError::configuration(
                &self.name,
                "precision must not be negative",
            ));
        }
        Ok(Switcher {
            name: self.name,
            moveable: self.moveable,
            table: RwLock::new(table),
            precision: self.precision,
            fallback: self.fallback,
            blocking: self.blocking,
            relax_mapping: self.relax_mapping,
            target: Mutex::new(None),
        })
    }
}

/// Read-only variant of [`Switcher`].
pub struct ReadonlySwitcher {
    name: String,
    readable: Arc<dyn Readable>,
    table: PositionTable,
    precision: Precision,
    fallback: Option<String>,
}

impl ReadonlySwitcher {
    pub fn new(
        name: impl Into<String>,
        readable: Arc<dyn Readable>,
        positions: Vec<(String, Value)>,
        precision: Option<f64>,
        fallback: Option<String>,
    ) -> NicosResult<Self> {
        let name = name.into();
        let table = PositionTable::single(&name, positions)?;
        let precision = match precision {
            Some(p) if p > 0.0 => Precision::Uniform(p),
            _ => Precision::Exact,
        };
        Ok(Self {
            name,
            readable,
            table,
            precision,
            fallback,
        })
    }

    fn match_raw(&self, raw: &Value) -> Option<&str> {
        self.table
            .find_match(std::slice::from_ref(raw), &self.precision)
    }
}

#[async_trait]
impl Readable for ReadonlySwitcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, maxage: MaxAge) -> NicosResult<Value> {
        let raw = self.readable.read(maxage).await?;
        if let Some(name) = self.match_raw(&raw) {
            return Ok(Value::from(name));
        }
        match &self.fallback {
            Some(fallback) => Ok(Value::Str(fallback.clone())),
            None => Err(NicosError::position(
                &self.name,
                format!("unknown position of {}", self.readable.name()),
            )),
        }
    }

    async fn status(&self, maxage: MaxAge) -> NicosResult<DeviceStatus> {
        let st = self.readable.status(maxage).await?;
        if st.code != StatusCode::Ok {
            return Ok(st);
        }
        let raw = self.readable.read(maxage).await?;
        if self.match_raw(&raw).is_some() {
            Ok(DeviceStatus::ok(""))
        } else {
            Ok(DeviceStatus::not_reached(format!(
                "unconfigured position of {} or still moving",
                self.readable.name()
            )))
        }
    }

    fn precision(&self) -> Option<f64> {
        match self.precision {
            Precision::Uniform(p) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_motor::VirtualMotor;

    fn motor(position: f64) -> Arc<VirtualMotor> {
        Arc::new(
            VirtualMotor::builder("axis")
                .position(position)
                .limits(-10.0, 10.0)
                .build()
                .unwrap(),
        )
    }

    fn switcher(axis: Arc<VirtualMotor>) -> Switcher {
        Switcher::builder("sw", axis)
            .position("left", 1.0)
            .position("right", 3.0)
            .precision(0.05)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_read_within_precision() {
        let axis = motor(1.01);
        let sw = switcher(axis.clone());
        assert_eq!(sw.read(None).await.unwrap(), Value::from("left"));

        axis.maw(Value::Float(1.2)).await.unwrap();
        let err = sw.read(None).await.unwrap_err();
        assert!(matches!(err, NicosError::Position { .. }));
    }

    #[tokio::test]
    async fn test_start_moves_underlying() {
        let axis = motor(0.0);
        let sw = switcher(axis.clone());
        sw.start(Value::from("right")).await.unwrap();
        assert_eq!(axis.read(None).await.unwrap(), Value::Float(3.0));
        assert_eq!(sw.read(None).await.unwrap(), Value::from("right"));
        assert_eq!(sw.target(), Some(Value::from("right")));
        assert!(sw.status(None).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_name_is_invalid_value() {
        let axis = motor(0.0);
        let sw = switcher(axis.clone());
        let err = sw.start(Value::from("middle")).await.unwrap_err();
        assert!(matches!(err, NicosError::InvalidValue { .. }));
        assert!(matches!(
            sw.start(Value::Float(3.0)).await,
            Err(NicosError::InvalidValue { .. })
        ));
        assert_eq!(axis.start_count(), 0);
    }

    #[tokio::test]
    async fn test_limit_error_before_write() {
        let axis = motor(0.0);
        let sw = Switcher::builder("sw", axis.clone())
            .position("in", 0.0)
            .position("far", 50.0)
            .build()
            .unwrap();
        let err = sw.start(Value::from("far")).await.unwrap_err();
        assert!(matches!(err, NicosError::Limit { .. }));
        assert_eq!(axis.start_count(), 0);
        assert!(!sw.is_allowed(&Value::from("far")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_start_when_already_there_is_noop() {
        let axis = motor(1.0);
        let sw = switcher(axis.clone());
        sw.start(Value::from("left")).await.unwrap();
        assert_eq!(axis.start_count(), 0);
    }

    #[tokio::test]
    async fn test_status_not_reached_after_mismatch() {
        let axis = motor(0.0);
        let sw = switcher(axis.clone());
        sw.start(Value::from("left")).await.unwrap();

        axis.maw(Value::Float(1.2)).await.unwrap();
        let st = sw.status(None).await.unwrap();
        assert_eq!(st.code, StatusCode::NotReached);
    }

    #[tokio::test]
    async fn test_fallback() {
        let axis = motor(7.0);
        let sw = Switcher::builder("sw", axis.clone())
            .position("left", 1.0)
            .fallback("unknown")
            .build()
            .unwrap();
        assert_eq!(sw.read(None).await.unwrap(), Value::from("unknown"));
        assert_eq!(sw.status(None).await.unwrap().code, StatusCode::Unknown);
    }

    #[tokio::test]
    async fn test_relax_mapping_returns_raw() {
        let axis = motor(7.0);
        let sw = Switcher::builder("sw", axis.clone())
            .position("left", 1.0)
            .relax_mapping(true)
            .build()
            .unwrap();
        assert_eq!(sw.read(None).await.unwrap(), Value::Float(7.0));
    }

    #[tokio::test]
    async fn test_busy_underlying_propagates() {
        let axis = Arc::new(VirtualMotor::builder("axis").speed(10.0).build().unwrap());
        let sw = Switcher::builder("sw", axis.clone())
            .position("a", 0.0)
            .position("b", 5.0)
            .blocking(false)
            .build()
            .unwrap();
        sw.start(Value::from("b")).await.unwrap();
        assert!(sw.status(None).await.unwrap().is_busy());

        let err = sw
            .set_positions(PositionTable::single("sw", [("c", Value::Float(1.0))]).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, NicosError::Move { .. }));
        sw.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_readonly_switcher() {
        let axis = motor(3.0);
        let rs = ReadonlySwitcher::new(
            "rs",
            axis.clone(),
            vec![("open".into(), Value::Float(3.0))],
            Some(0.1),
            None,
        )
        .unwrap();
        assert_eq!(rs.read(None).await.unwrap(), Value::from("open"));
        assert!(rs.status(None).await.unwrap().is_ok());

        axis.maw(Value::Float(5.0)).await.unwrap();
        assert!(rs.read(None).await.is_err());
        assert_eq!(rs.status(None).await.unwrap().code, StatusCode::NotReached);
    }

    #[tokio::test]
    async fn test_precision_is_exposed() {
        let sw = switcher(motor(1.0));
        assert_eq!(Readable::precision(&sw), Some(0.05));

        let exact = Switcher::builder("exact", motor(1.0))
            .position("left", 1.0)
            .build()
            .unwrap();
        assert_eq!(Readable::precision(&exact), None);

        let rs = ReadonlySwitcher::new(
            "rs",
            motor(3.0),
            vec![("open".into(), Value::Float(3.0))],
            Some(0.1),
            None,
        )
        .unwrap();
        assert_eq!(Readable::precision(&rs), Some(0.1));
    }
}
