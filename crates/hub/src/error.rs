//! Crate-wide error type classified by behavior.
//!
//! Every fault funnels into one of five classes that determine how the
//! scheduler reacts: transient faults are retried on the next tick,
//! persistent faults mark the entity FAULTED, configuration faults reject
//! the mutating operation, safety refusals are logged and skipped, and
//! fatal faults abort the runtime.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Recoverable I/O fault (bus busy, checksum mismatch, data-ready
    /// timeout). Retried at the entity's next scheduled tick.
    #[error("transient i/o: {0}")]
    Transient(String),

    /// The device or line is gone (missing 1-Wire slave, unclaimable pin).
    /// The owning entity transitions to FAULTED until its config changes.
    #[error("device unavailable: {0}")]
    Persistent(String),

    /// Invalid configuration. The create/update operation is rejected;
    /// existing state is untouched.
    #[error("invalid configuration for '{field}': {reason}")]
    Config { field: String, reason: String },

    /// An output interlock refused the operation. The caller continues.
    #[error("safety interlock: {0}")]
    Safety(String),

    /// Unrecoverable (storage corruption, panic-off failure). The runtime
    /// shuts down and exits non-zero.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn persistent(msg: impl Into<String>) -> Self {
        Self::Persistent(msg.into())
    }

    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn safety(msg: impl Into<String>) -> Self {
        Self::Safety(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Database faults surface as fatal by default: the persistence layer is
/// load-bearing and a corrupted store must stop the runtime (§ shutdown
/// policy). Callers that can tolerate a failed write downgrade explicitly.
impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::Fatal(format!("storage: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Config {
            field: "config".into(),
            reason: e.to_string(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let e = Error::transient("dout timeout");
        assert!(e.is_transient());
        assert!(!e.is_fatal());
    }

    #[test]
    fn fatal_classification() {
        let e = Error::fatal("db corrupted");
        assert!(e.is_fatal());
        assert!(!e.is_transient());
    }

    #[test]
    fn config_error_names_field() {
        let e = Error::config("dose_pump_pin_up", "pin 99 not in declared pool");
        assert_eq!(
            e.to_string(),
            "invalid configuration for 'dose_pump_pin_up': pin 99 not in declared pool"
        );
    }

    #[test]
    fn json_error_maps_to_config() {
        let bad: std::result::Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let e: Error = bad.unwrap_err().into();
        assert!(matches!(e, Error::Config { .. }));
    }
}
