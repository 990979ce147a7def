//! Error taxonomy shared by sources, the dispatcher and the fan-out layer.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while producing, writing or delivering PV values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PvError {
    /// The variable has never been produced by the active source.
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    /// The source or device refused the write.
    #[error("Write to {name} rejected: {reason}")]
    WriteRejected { name: String, reason: String },

    /// The device did not acknowledge the write in time.
    #[error("Write to {name} timed out after {timeout:?}")]
    WriteTimeout { name: String, timeout: Duration },

    /// A subscriber's delivery handler failed.
    #[error("Callback for {name} failed: {reason}")]
    CallbackFailure { name: String, reason: String },

    /// The live protocol context could not be initialized.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),
}

impl PvError {
    pub fn rejected(name: impl Into<String>, reason: impl Into<String>) -> Self {
        PvError::WriteRejected {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// True when the write was refused outright, as opposed to timing out.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            PvError::UnknownVariable(_) | PvError::WriteRejected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PvError::rejected("SIM:VALVE:1", "not a number");
        assert_eq!(err.to_string(), "Write to SIM:VALVE:1 rejected: not a number");
        assert!(err.is_rejection());

        let err = PvError::WriteTimeout {
            name: "X".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("timed out"));
        assert!(!err.is_rejection());
    }
}
