//! Protocol message types.
//!
//! - Client → Server: `subscribe`, `unsubscribe`, `put`
//! - Server → Client: `pv_update`
//! - History API: `HistoryQuery` in, `HistoryResponse` out
//!
//! # Example
//! ```json
//! {"type": "subscribe", "pvs": ["SIM:TEMP:1", "SIM:MTR:1:RBV"]}
//! {"type": "pv_update", "pv": "SIM:TEMP:1", "value": 25.3, "timestamp": 1700000000.123, "severity": 0}
//! ```

use pvstream_core::{PvUpdate, Sample, Severity};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// History window used when the request gives none, in seconds.
pub const DEFAULT_HISTORY_WINDOW: f64 = 3600.0;

/// Point budget used when the request gives none.
pub const DEFAULT_MAX_POINTS: usize = 1_000;

/// Upper bound on the point budget of one history query.
pub const MAX_POINTS_LIMIT: usize = 10_000;

// ============================================================================
// Stream messages
// ============================================================================

/// Messages that can be received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving updates for the listed variables.
    Subscribe {
        #[serde(default)]
        pvs: Vec<String>,
    },

    /// Stop receiving updates for the listed variables.
    Unsubscribe {
        #[serde(default)]
        pvs: Vec<String>,
    },

    /// Write a value to a variable.
    Put(PutRequest),
}

/// Write request. Both fields are optional on the wire; a request without a
/// variable name or with a `null` value is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutRequest {
    #[serde(default)]
    pub pv: Option<String>,

    #[serde(default)]
    pub value: Value,
}

impl PutRequest {
    /// The variable and value to write, if the request is complete.
    pub fn target(&self) -> Option<(&str, &Value)> {
        match (&self.pv, &self.value) {
            (Some(pv), value) if !value.is_null() => Some((pv.as_str(), value)),
            _ => None,
        }
    }
}

/// Messages that can be sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// One new value for a subscribed variable.
    PvUpdate(PvUpdateMessage),
}

/// Body of a `pv_update` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvUpdateMessage {
    pub pv: String,
    pub value: Value,
    /// Epoch seconds rounded to milliseconds.
    pub timestamp: f64,
    pub severity: Severity,
}

impl From<&PvUpdate> for PvUpdateMessage {
    fn from(update: &PvUpdate) -> Self {
        Self {
            pv: update.name.clone(),
            value: update.value.clone(),
            timestamp: round_millis(update.timestamp),
            severity: update.severity,
        }
    }
}

/// Round epoch seconds to three decimals.
pub fn round_millis(timestamp: f64) -> f64 {
    (timestamp * 1000.0).round() / 1000.0
}

// ============================================================================
// History query
// ============================================================================

/// Query parameters of a history request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub window: Option<f64>,

    #[serde(default)]
    pub max_points: Option<i64>,
}

impl HistoryQuery {
    /// Window in seconds, at least 1.
    pub fn window(&self) -> f64 {
        self.window.unwrap_or(DEFAULT_HISTORY_WINDOW).max(1.0)
    }

    /// Point budget, clamped to `[1, MAX_POINTS_LIMIT]`.
    pub fn max_points(&self) -> usize {
        self.max_points
            .unwrap_or(DEFAULT_MAX_POINTS as i64)
            .clamp(1, MAX_POINTS_LIMIT as i64) as usize
    }
}

/// History response, samples in ascending time order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub pv: String,
    pub window: f64,
    pub max_points: usize,
    pub data: Vec<Sample>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_deserialization() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","pvs":["SIM:TEMP:1","SIM:FLOW:1"]}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                pvs: vec!["SIM:TEMP:1".to_string(), "SIM:FLOW:1".to_string()]
            }
        );
    }

    #[test]
    fn test_subscribe_without_pvs() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"unsubscribe"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unsubscribe { pvs: vec![] });
    }

    #[test]
    fn test_put_deserialization() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"put","pv":"SIM:MTR:1:VAL","value":75.5}"#).unwrap();
        match msg {
            ClientMessage::Put(req) => {
                assert_eq!(req.target(), Some(("SIM:MTR:1:VAL", &json!(75.5))));
            }
            _ => panic!("Expected Put message"),
        }
    }

    #[test]
    fn test_incomplete_put_has_no_target() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"put","value":1}"#).unwrap();
        let ClientMessage::Put(req) = msg else {
            panic!("Expected Put message");
        };
        assert!(req.target().is_none());

        let req = PutRequest {
            pv: Some("X".to_string()),
            value: Value::Null,
        };
        assert!(req.target().is_none());
    }

    #[test]
    fn test_pv_update_serialization() {
        let update = PvUpdate::new("SIM:TEMP:1", 25.3, 1_700_000_000.123_456, 0);
        let msg = ServerMessage::PvUpdate(PvUpdateMessage::from(&update));
        let value: Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "pv_update");
        assert_eq!(value["pv"], "SIM:TEMP:1");
        assert_eq!(value["value"], 25.3);
        assert_eq!(value["timestamp"], 1_700_000_000.123);
        assert_eq!(value["severity"], 0);
    }

    #[test]
    fn test_history_query_clamping() {
        let q = HistoryQuery::default();
        assert_eq!(q.window(), 3600.0);
        assert_eq!(q.max_points(), 1000);

        let q = HistoryQuery {
            window: Some(0.2),
            max_points: Some(0),
        };
        assert_eq!(q.window(), 1.0);
        assert_eq!(q.max_points(), 1);

        let q = HistoryQuery {
            window: Some(60.0),
            max_points: Some(50_000),
        };
        assert_eq!(q.window(), 60.0);
        assert_eq!(q.max_points(), 10_000);
    }

    #[test]
    fn test_history_response_serialization() {
        let resp = HistoryResponse {
            pv: "X".to_string(),
            window: 10.0,
            max_points: 1000,
            data: vec![Sample::new(0.0, 10.0), Sample::new(1.0, 20.0)],
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            value,
            json!({
                "pv": "X",
                "window": 10.0,
                "max_points": 1000,
                "data": [{"t": 0.0, "v": 10.0}, {"t": 1.0, "v": 20.0}]
            })
        );
    }
}
