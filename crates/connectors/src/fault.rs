use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Duplicate-key violation (`0x80040237`).
pub const ERROR_DUPLICATE_KEY: i32 = 0x8004_0237_u32 as i32;
/// Generic SQL wrapper (`0x80044150`); the interesting part is the
/// sub-message number buried in the text.
pub const ERROR_SQL_WRAPPER: i32 = 0x8004_4150_u32 as i32;

/// Privilege-level authorization failures. Retrying cannot help.
pub const AUTH_PRIVILEGE_CODES: [i32; 3] = [-2147180286, -2147204720, -2147180285];

/// Service-protection (throttle) codes: request count, execution time and
/// concurrency limits respectively.
pub const SERVICE_PROTECTION_CODES: [i32; 3] = [-2147015902, -2147015903, -2147015898];

/// Detail-map key carrying the server-suggested retry delay.
pub const RETRY_AFTER_KEY: &str = "Retry-After";
/// Detail-map key carrying per-record failure rows on elastic entities.
pub const BULK_API_ERROR_DETAILS_KEY: &str = "Plugin.BulkApiErrorDetails";

/// Used when a throttle fault arrives without a usable retry delay.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// One per-record failure row inside an elastic-entity batch fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkApiErrorDetail {
    pub request_index: usize,
    pub id: Option<Uuid>,
    pub status_code: i32,
}

/// A value inside a fault's polymorphic detail map. `Retry-After` has been
/// observed as an interval, integer seconds and floating seconds, so all
/// three are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FaultDetailValue {
    Interval(Duration),
    Seconds(i64),
    SecondsF(f64),
    Text(String),
    ErrorDetails(Vec<BulkApiErrorDetail>),
}

impl FaultDetailValue {
    pub fn to_duration(&self) -> Option<Duration> {
        match self {
            FaultDetailValue::Interval(d) => Some(*d),
            FaultDetailValue::Seconds(s) if *s >= 0 => Some(Duration::from_secs(*s as u64)),
            FaultDetailValue::SecondsF(s) if *s >= 0.0 => Some(Duration::from_secs_f64(*s)),
            FaultDetailValue::Text(t) => t.parse::<u64>().ok().map(Duration::from_secs),
            _ => None,
        }
    }
}

/// A server-side organization fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceFault {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub details: HashMap<String, FaultDetailValue>,
}

impl ServiceFault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: FaultDetailValue) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.details.get(RETRY_AFTER_KEY).and_then(|v| v.to_duration())
    }

    /// Per-record failure rows, present only on elastic-entity faults.
    pub fn bulk_api_error_details(&self) -> Option<&[BulkApiErrorDetail]> {
        match self.details.get(BULK_API_ERROR_DETAILS_KEY) {
            Some(FaultDetailValue::ErrorDetails(rows)) => Some(rows),
            _ => None,
        }
    }

    pub fn is_duplicate_key(&self) -> bool {
        self.code == ERROR_DUPLICATE_KEY
            || self.message.to_ascii_lowercase().contains("duplicate key")
    }
}

impl fmt::Display for ServiceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fault {:#010x}: {}", self.code as u32, self.message)
    }
}

impl std::error::Error for ServiceFault {}

/// Everything a `ServiceClient::execute` call can fail with.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Fault(#[from] ServiceFault),

    #[error("transport failure on '{connection}': {message}")]
    Transport { connection: String, message: String },

    #[error("access token rejected on '{connection}': {message}")]
    AuthExpired { connection: String, message: String },

    #[error("request cancelled")]
    Cancelled,
}

/// The retry taxonomy of the engine. Every failed server call is classified
/// into exactly one kind, and the bulk executor's retry loop dispatches on
/// the kind alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Throttle,
    AuthToken,
    AuthPrivilege,
    Connection,
    BulkInfrastructure,
    Deadlock,
    DuplicateKey,
    Cancelled,
    Other,
}

impl FailureKind {
    pub fn classify(err: &ClientError) -> FailureKind {
        match err {
            ClientError::Fault(fault) => Self::classify_fault(fault),
            ClientError::Transport { .. } => FailureKind::Connection,
            ClientError::AuthExpired { .. } => FailureKind::AuthToken,
            ClientError::Cancelled => FailureKind::Cancelled,
        }
    }

    pub fn classify_fault(fault: &ServiceFault) -> FailureKind {
        if SERVICE_PROTECTION_CODES.contains(&fault.code) {
            return FailureKind::Throttle;
        }
        if AUTH_PRIVILEGE_CODES.contains(&fault.code) {
            return FailureKind::AuthPrivilege;
        }
        if fault.is_duplicate_key() {
            return FailureKind::DuplicateKey;
        }
        if fault.code == ERROR_SQL_WRAPPER {
            if fault.message.contains("1205") {
                return FailureKind::Deadlock;
            }
            if ["3732", "2766", "2812"]
                .iter()
                .any(|sub| fault.message.contains(sub))
            {
                return FailureKind::BulkInfrastructure;
            }
        }
        FailureKind::Other
    }
}

/// Whole-batch fault text that means the entity type does not accept the
/// multi-record request variants at all.
pub fn is_bulk_unsupported_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("is not enabled on the entity")
        || lowered.contains("does not support entities of type")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_accepts_all_payload_shapes() {
        let interval = ServiceFault::new(SERVICE_PROTECTION_CODES[0], "throttled").with_detail(
            RETRY_AFTER_KEY,
            FaultDetailValue::Interval(Duration::from_secs(7)),
        );
        assert_eq!(interval.retry_after(), Some(Duration::from_secs(7)));

        let seconds = ServiceFault::new(SERVICE_PROTECTION_CODES[1], "throttled")
            .with_detail(RETRY_AFTER_KEY, FaultDetailValue::Seconds(12));
        assert_eq!(seconds.retry_after(), Some(Duration::from_secs(12)));

        let fractional = ServiceFault::new(SERVICE_PROTECTION_CODES[2], "throttled")
            .with_detail(RETRY_AFTER_KEY, FaultDetailValue::SecondsF(1.5));
        assert_eq!(fractional.retry_after(), Some(Duration::from_secs_f64(1.5)));

        let absent = ServiceFault::new(SERVICE_PROTECTION_CODES[0], "throttled");
        assert_eq!(absent.retry_after(), None);
    }

    #[test]
    fn classification_covers_the_error_table() {
        let throttle = ServiceFault::new(-2147015902, "Number of requests exceeded the limit");
        assert_eq!(
            FailureKind::classify_fault(&throttle),
            FailureKind::Throttle
        );

        for code in AUTH_PRIVILEGE_CODES {
            let fault = ServiceFault::new(code, "principal lacks prvCreateAccount");
            assert_eq!(
                FailureKind::classify_fault(&fault),
                FailureKind::AuthPrivilege
            );
        }

        let deadlock = ServiceFault::new(
            ERROR_SQL_WRAPPER,
            "SQL Error 1205: transaction was chosen as deadlock victim",
        );
        assert_eq!(FailureKind::classify_fault(&deadlock), FailureKind::Deadlock);

        let tvp = ServiceFault::new(ERROR_SQL_WRAPPER, "error 2812: could not find stored procedure");
        assert_eq!(
            FailureKind::classify_fault(&tvp),
            FailureKind::BulkInfrastructure
        );

        let duplicate = ServiceFault::new(ERROR_DUPLICATE_KEY, "Cannot insert duplicate key");
        assert_eq!(
            FailureKind::classify_fault(&duplicate),
            FailureKind::DuplicateKey
        );

        let other = ServiceFault::new(-1, "something else entirely");
        assert_eq!(FailureKind::classify_fault(&other), FailureKind::Other);
    }

    #[test]
    fn duplicate_key_also_matches_on_message() {
        let fault = ServiceFault::new(-1, "Violation: Duplicate Key was ignored");
        assert!(fault.is_duplicate_key());
    }

    #[test]
    fn bulk_unsupported_message_detection() {
        assert!(is_bulk_unsupported_message(
            "CreateMultiple is not enabled on the entity team"
        ));
        assert!(is_bulk_unsupported_message(
            "The operation does not support entities of type annotation"
        ));
        assert!(!is_bulk_unsupported_message("generic failure"));
    }
}
