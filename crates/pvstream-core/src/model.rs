//! PV data model types.
//!
//! These types represent the values flowing through the subsystem:
//! - `PvUpdate` - one produced value for a named variable, as delivered live
//! - `Sample` - the numeric `(timestamp, value)` pair kept in history
//! - `Severity` - the alarm/quality indicator attached to every update

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Alarm/quality indicator accompanying a value. `0` means normal.
pub type Severity = i32;

/// Severity of a value with no alarm condition.
pub const SEVERITY_NORMAL: Severity = 0;

/// A single produced value for one variable.
///
/// The value is kept as JSON so that non-numeric payloads (strings, arrays)
/// can still be delivered live even though they never enter history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvUpdate {
    /// Variable name (e.g. "SIM:TEMP:1").
    pub name: String,

    /// The value as produced by the source.
    pub value: Value,

    /// Epoch seconds.
    pub timestamp: f64,

    /// Alarm severity.
    pub severity: Severity,
}

impl PvUpdate {
    /// Create an update with normal severity stamped with the current time.
    pub fn now(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            timestamp: now_epoch(),
            severity: SEVERITY_NORMAL,
        }
    }

    /// Create an update with an explicit timestamp and severity.
    pub fn new(
        name: impl Into<String>,
        value: impl Into<Value>,
        timestamp: f64,
        severity: Severity,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            timestamp,
            severity,
        }
    }

    /// The value coerced to a number, if it has a numeric reading.
    pub fn numeric(&self) -> Option<f64> {
        coerce_numeric(&self.value)
    }
}

/// One point of a variable's history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Epoch seconds.
    #[serde(rename = "t")]
    pub timestamp: f64,

    /// Numeric value.
    #[serde(rename = "v")]
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: f64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Current wall-clock time as epoch seconds with microsecond resolution.
pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Coerce a JSON value to a number.
///
/// Numbers pass through, booleans map to 0/1 and strings are parsed.
/// Everything else (null, arrays, objects, unparsable strings) has no numeric
/// reading and yields `None`.
pub fn coerce_numeric(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}
