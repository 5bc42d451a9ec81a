use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric error codes following the SLUICE-XXXX format.
///
/// ## Code Ranges
/// - **1000-1999**: Connector / downstream source errors
/// - **2000-2999**: Request lifecycle errors
/// - **3000-3999**: Configuration errors
/// - **4000-4999**: Scheduling and transaction errors
/// - **5000-5999**: Internal/System errors
///
/// Codes are stable across versions (semver contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[non_exhaustive]
pub enum ErrorCode {
    // === Connector Errors (1000-1999) ===
    /// SLUICE-1001: Connector not registered
    SourceNotFound = 1001,
    /// SLUICE-1002: Downstream execute/more failed
    SourceExecutionFailed = 1002,
    /// SLUICE-1003: Value could not be converted to the column type
    ConversionFailed = 1003,
    /// SLUICE-1004: Large object could not be read or stored
    LobUnavailable = 1004,

    // === Request Errors (2000-2999) ===
    /// SLUICE-2001: Request cancelled
    QueryCancelled = 2001,
    /// SLUICE-2002: Request already closed
    RequestClosed = 2002,
    /// SLUICE-2003: No live request with this id
    RequestNotFound = 2003,
    /// SLUICE-2004: A result delivery is already pending
    DeliveryPending = 2004,
    /// SLUICE-2005: Requested row window is invalid
    InvalidWindow = 2005,
    /// SLUICE-2006: LOB stream already has a chunk request outstanding
    LobStreamBusy = 2006,
    /// SLUICE-2007: LOB reference does not name a delivered LOB value
    LobNotFound = 2007,
    /// SLUICE-2008: Plan compilation failed
    PlanCompilation = 2008,
    /// SLUICE-2009: Request id already in use
    DuplicateRequest = 2009,

    // === Configuration Errors (3000-3999) ===
    /// SLUICE-3001: Invalid configuration value
    InvalidConfig = 3001,
    /// SLUICE-3002: Missing required field in config
    MissingRequiredField = 3002,

    // === Scheduling / Transaction Errors (4000-4999) ===
    /// SLUICE-4001: Work submission rejected
    SubmissionRejected = 4001,
    /// SLUICE-4002: Scheduler is shutting down
    SchedulerShutdown = 4002,
    /// SLUICE-4003: Transaction operation failed
    TransactionFailed = 4003,

    // === Internal Errors (5000-5999) ===
    /// SLUICE-5001: Work item panicked
    InternalPanic = 5001,
    /// SLUICE-5002: Serialization/deserialization failed
    SerializationFailed = 5002,
    /// SLUICE-5003: Cache side store failure
    CacheStoreFailed = 5003,
    /// SLUICE-5004: Internal invariant violated
    InvariantViolation = 5004,

    /// SLUICE-9999: Unknown/unclassified error
    Unknown = 9999,
}

impl ErrorCode {
    /// Get the numeric code value
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the formatted code string (e.g., "SLUICE-2002")
    pub fn as_str(&self) -> String {
        format!("SLUICE-{:04}", self.as_u16())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self.as_u16() {
            1000..=1999 => ErrorCategory::Connector,
            2000..=2999 => ErrorCategory::Request,
            3000..=3999 => ErrorCategory::Config,
            4000..=4999 => ErrorCategory::Scheduling,
            _ => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let num: u16 = s
            .strip_prefix("SLUICE-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| "Invalid format".to_string())?;
        Self::try_from(num).map_err(|_| "Unknown code".to_string())
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(n: u16) -> std::result::Result<Self, Self::Error> {
        match n {
            1001 => Ok(Self::SourceNotFound),
            1002 => Ok(Self::SourceExecutionFailed),
            1003 => Ok(Self::ConversionFailed),
            1004 => Ok(Self::LobUnavailable),
            2001 => Ok(Self::QueryCancelled),
            2002 => Ok(Self::RequestClosed),
            2003 => Ok(Self::RequestNotFound),
            2004 => Ok(Self::DeliveryPending),
            2005 => Ok(Self::InvalidWindow),
            2006 => Ok(Self::LobStreamBusy),
            2007 => Ok(Self::LobNotFound),
            2008 => Ok(Self::PlanCompilation),
            2009 => Ok(Self::DuplicateRequest),
            3001 => Ok(Self::InvalidConfig),
            3002 => Ok(Self::MissingRequiredField),
            4001 => Ok(Self::SubmissionRejected),
            4002 => Ok(Self::SchedulerShutdown),
            4003 => Ok(Self::TransactionFailed),
            5001 => Ok(Self::InternalPanic),
            5002 => Ok(Self::SerializationFailed),
            5003 => Ok(Self::CacheStoreFailed),
            5004 => Ok(Self::InvariantViolation),
            9999 => Ok(Self::Unknown),
            _ => Err(format!("Unknown error code: {}", n)),
        }
    }
}

/// High-level error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCategory {
    Connector,
    Request,
    Config,
    Scheduling,
    Internal,
}
