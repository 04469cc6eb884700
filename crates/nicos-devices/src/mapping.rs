//! Position tables and tolerance matching.
//!
//! A [`PositionTable`] maps logical position names onto one raw value per
//! underlying device. Matching a set of readbacks against the table scans the
//! entries in declaration order and returns the first entry for which every
//! device is inside its tolerance window. Overlapping windows are resolved by
//! that order, never by smallest residual.

use nicos_core::error::{NicosError, NicosResult};
use nicos_core::status::DeviceStatus;
use nicos_core::value::Value;

/// One named logical position.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionEntry {
    pub name: String,
    /// One raw value per underlying device.
    pub values: Vec<Value>,
}

/// Ordered, validated mapping of names to raw values.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionTable {
    entries: Vec<PositionEntry>,
    arity: usize,
}

impl PositionTable {
    /// Build a table for `arity` underlying devices.
    ///
    /// # Errors
    ///
    /// Configuration error if the table is empty, a name occurs twice, or an
    /// entry does not have exactly `arity` values.
    pub fn new(device: &str, entries: Vec<PositionEntry>, arity: usize) -> NicosResult<Self> {
        if arity == 0 {
            return Err(NicosError::configuration(
                device,
                "at least one underlying device is required",
            ));
        }
        if entries.is_empty() {
            return Err(NicosError::configuration(device, "position table is empty"));
        }
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.name == entry.name) {
                return Err(NicosError::configuration(
                    device,
                    format!("position '{}' defined twice", entry.name),
                ));
            }
            if entry.values.len() != arity {
                return Err(NicosError::configuration(
                    device,
                    format!(
                        "position '{}' has {} values, but {} devices are attached",
                        entry.name,
                        entry.values.len(),
                        arity
                    ),
                ));
            }
        }
        Ok(Self { entries, arity })
    }

    /// Build a single-axis table from `(name, value)` pairs.
    pub fn single<I, S>(device: &str, entries: I) -> NicosResult<Self>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let entries = entries
            .into_iter()
            .map(|(name, value)| PositionEntry {
                name: name.into(),
                values: vec![value],
            })
            .collect();
        Self::new(device, entries, 1)
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PositionEntry] {
        &self.entries
    }

    /// Raw values for `name`; lookup is by exact name.
    pub fn get(&self, name: &str) -> Option<&[Value]> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.values.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// First entry, in declaration order, that all `readings` match.
    ///
    /// A partial match (some devices inside their window, others not) is no
    /// match at all.
    pub fn find_match(&self, readings: &[Value], precision: &Precision) -> Option<&str> {
        if readings.len() != self.arity {
            return None;
        }
        self.entries
            .iter()
            .find(|entry| {
                entry
                    .values
                    .iter()
                    .zip(readings)
                    .enumerate()
                    .all(|(i, (expected, actual))| actual.matches(expected, precision.for_device(i)))
            })
            .map(|entry| entry.name.as_str())
    }

    pub(crate) fn describe_names(&self) -> String {
        self.names()
            .map(|n| format!("'{}'", n))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Tolerance used when matching readbacks against the table.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Precision {
    /// Exact equality.
    #[default]
    Exact,
    /// Same tolerance for every device.
    Uniform(f64),
    /// One tolerance per device.
    PerDevice(Vec<f64>),
}

impl Precision {
    /// Interpret a configured precision list for `devices` devices.
    ///
    /// An empty list means exact matching, a single element applies to all
    /// devices, otherwise the list length must equal the device count.
    pub fn from_list(device: &str, list: Vec<f64>, devices: usize) -> NicosResult<Self> {
        if list.iter().any(|p| *p < 0.0 || p.is_nan()) {
            return Err(NicosError::configuration(
                device,
                "precision values must not be negative",
            ));
        }
        match list.len() {
            0 => Ok(Precision::Exact),
            1 => Ok(Precision::Uniform(list[0])),
            n if n == devices => Ok(Precision::PerDevice(list)),
            n => Err(NicosError::configuration(
                device,
                format!(
                    "the precision list must contain one or {} elements, got {}",
                    devices, n
                ),
            )),
        }
    }

    /// Tolerance for device `index`; `None` means exact matching.
    pub fn for_device(&self, index: usize) -> Option<f64> {
        let p = match self {
            Precision::Exact => return None,
            Precision::Uniform(p) => *p,
            Precision::PerDevice(list) => *list.get(index)?,
        };
        (p > 0.0).then_some(p)
    }

    /// Check the precision against the number of attached devices.
    pub fn validate(&self, device: &str, devices: usize) -> NicosResult<()> {
        match self {
            Precision::PerDevice(list) if list.len() != devices => Err(
                NicosError::configuration(
                    device,
                    format!(
                        "the precision list must contain one or {} elements, got {}",
                        devices,
                        list.len()
                    ),
                ),
            ),
            _ => Ok(()),
        }
    }
}

/// Status of an idle mapper, derived from whether the readback matched.
///
/// A mismatch after a completed move is a status condition, not an error:
/// `NotReached` while a target is set, `Unknown` if only the fallback name
/// can be reported, `NotReached` otherwise.
pub(crate) fn mapped_status(
    matched: bool,
    has_target: bool,
    has_fallback: bool,
    underlying: &str,
) -> DeviceStatus {
    if matched {
        DeviceStatus::ok("")
    } else if has_target || !has_fallback {
        DeviceStatus::not_reached(format!(
            "unconfigured position of {} or still moving",
            underlying
        ))
    } else {
        DeviceStatus::unknown(format!(
            "unconfigured position of {}, using fallback",
            underlying
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nicos_core::status::StatusCode;

    fn table() -> PositionTable {
        PositionTable::single("sw", [("left", Value::Float(1.0)), ("right", Value::Float(3.0))])
            .unwrap()
    }

    #[test]
    fn test_match_within_tolerance() {
        let t = table();
        let prec = Precision::Uniform(0.05);
        assert_eq!(t.find_match(&[Value::Float(1.01)], &prec), Some("left"));
        assert_eq!(t.find_match(&[Value::Float(2.99)], &prec), Some("right"));
        assert_eq!(t.find_match(&[Value::Float(1.2)], &prec), None);
    }

    #[test]
    fn test_zero_precision_is_exact() {
        let t = table();
        assert_eq!(t.find_match(&[Value::Float(1.0)], &Precision::Uniform(0.0)), Some("left"));
        assert_eq!(t.find_match(&[Value::Float(1.001)], &Precision::Exact), None);
    }

    #[test]
    fn test_first_entry_wins_on_overlap() {
        let t = PositionTable::single(
            "sw",
            [
                ("wide", Value::Float(0.0)),
                ("narrow", Value::Float(0.5)),
            ],
        )
        .unwrap();
        // 0.5 lies within both windows, declaration order decides
        assert_eq!(t.find_match(&[Value::Float(0.5)], &Precision::Uniform(1.0)), Some("wide"));
    }

    #[test]
    fn test_partial_match_is_no_match() {
        let t = PositionTable::new(
            "ms",
            vec![
                PositionEntry {
                    name: "a".into(),
                    values: vec![Value::Float(1.0), Value::Float(2.0)],
                },
                PositionEntry {
                    name: "b".into(),
                    values: vec![Value::Float(1.0), Value::Float(5.0)],
                },
            ],
            2,
        )
        .unwrap();
        let prec = Precision::PerDevice(vec![0.1, 0.1]);
        assert_eq!(t.find_match(&[Value::Float(1.0), Value::Float(2.0)], &prec), Some("a"));
        assert_eq!(t.find_match(&[Value::Float(1.0), Value::Float(3.0)], &prec), None);
    }

    #[test]
    fn test_invalid_tables() {
        let dup = vec![
            PositionEntry {
                name: "a".into(),
                values: vec![Value::Float(1.0)],
            },
            PositionEntry {
                name: "a".into(),
                values: vec![Value::Float(2.0)],
            },
        ];
        assert!(matches!(
            PositionTable::new("sw", dup, 1),
            Err(NicosError::Configuration { .. })
        ));
        let arity = vec![PositionEntry {
            name: "a".into(),
            values: vec![Value::Float(1.0)],
        }];
        assert!(PositionTable::new("ms", arity, 2).is_err());
        assert!(PositionTable::new("sw", Vec::new(), 1).is_err());
    }

    #[test]
    fn test_precision_list() {
        assert_eq!(Precision::from_list("m", vec![], 3).unwrap(), Precision::Exact);
        assert_eq!(
            Precision::from_list("m", vec![0.1], 3).unwrap(),
            Precision::Uniform(0.1)
        );
        assert!(Precision::from_list("m", vec![0.1, 0.2], 3).is_err());
        let p = Precision::from_list("m", vec![0.1, 0.0, 0.3], 3).unwrap();
        assert_eq!(p.for_device(0), Some(0.1));
        assert_eq!(p.for_device(1), None);
    }

    #[test]
    fn test_mapped_status() {
        assert!(mapped_status(true, true, false, "m").is_ok());
        assert_eq!(mapped_status(false, true, true, "m").code, StatusCode::NotReached);
        assert_eq!(mapped_status(false, false, true, "m").code, StatusCode::Unknown);
        assert_eq!(mapped_status(false, false, false, "m").code, StatusCode::NotReached);
    }
}
