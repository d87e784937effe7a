//! Error types for the object gateway
//!
//! Errors form a closed set. Every variant is classified into a
//! [`Severity`] which decides how it is logged, and whether the caller sees
//! the S3 error code directly or an opaque `InternalError` with an error id.

use std::fmt;

use rand::Rng;
use thiserror::Error;
use tracing::{error, warn};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Severity
// =============================================================================

/// How an error is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Connection, metadata, signature or crypto failures.
    Fatal,
    /// Non-fatal internal failures.
    General,
    /// Expected conditions worth a log line.
    Warn,
    /// Client-visible API error, returned as-is.
    Api,
}

// =============================================================================
// API Error Codes
// =============================================================================

/// S3 API error codes returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorCode {
    AccessDenied,
    BadDigest,
    EntityTooLarge,
    EntityTooSmall,
    IncompleteBody,
    InternalError,
    InvalidArgument,
    InvalidBucketName,
    InvalidObjectState,
    InvalidPart,
    InvalidRange,
    InvalidStorageClass,
    MalformedXml,
    NoSuchBucket,
    NoSuchKey,
    NoSuchLifecycleConfiguration,
    NoSuchUpload,
    NoSuchVersion,
    NotImplemented,
    ObjectNotAppendable,
    PositionNotEqualToLength,
    PreconditionFailed,
    RestoreAlreadyInProgress,
    ServiceUnavailable,

    // Lifecycle configuration
    InvalidLcRulesNumbers,
    InvalidLcRuleId,
    InvalidLcRuleStatus,
    LcMissingAction,
    InvalidLcUsingDateAndDays,
    InvalidLcDays,
    InvalidLcDate,
    LcDateNotMidnight,
    InvalidLcFilter,
    DuplicateLcTagKey,
    LcTagsNotAllowed,
    LcMissingNoncurrentDays,
    LcMissingStorageClass,
    LcMissingDaysAfterInitiation,
}

impl ApiErrorCode {
    /// The code string placed in the `<Code>` element of the error body.
    pub fn code(&self) -> &'static str {
        use ApiErrorCode::*;
        match self {
            AccessDenied => "AccessDenied",
            BadDigest => "BadDigest",
            EntityTooLarge => "EntityTooLarge",
            EntityTooSmall => "EntityTooSmall",
            IncompleteBody => "IncompleteBody",
            InternalError => "InternalError",
            InvalidArgument => "InvalidArgument",
            InvalidBucketName => "InvalidBucketName",
            InvalidObjectState => "InvalidObjectState",
            InvalidPart => "InvalidPart",
            InvalidRange => "InvalidRange",
            InvalidStorageClass => "InvalidStorageClass",
            MalformedXml => "MalformedXML",
            NoSuchBucket => "NoSuchBucket",
            NoSuchKey => "NoSuchKey",
            NoSuchLifecycleConfiguration => "NoSuchLifecycleConfiguration",
            NoSuchUpload => "NoSuchUpload",
            NoSuchVersion => "NoSuchVersion",
            NotImplemented => "NotImplemented",
            ObjectNotAppendable => "ObjectNotAppendable",
            PositionNotEqualToLength => "PositionNotEqualToLength",
            PreconditionFailed => "PreconditionFailed",
            RestoreAlreadyInProgress => "RestoreAlreadyInProgress",
            ServiceUnavailable => "ServiceUnavailable",
            InvalidLcRulesNumbers
            | InvalidLcRuleId
            | InvalidLcRuleStatus
            | InvalidLcUsingDateAndDays
            | InvalidLcDays
            | InvalidLcDate
            | LcDateNotMidnight
            | InvalidLcFilter
            | DuplicateLcTagKey
            | LcTagsNotAllowed
            | LcMissingNoncurrentDays
            | LcMissingStorageClass
            | LcMissingDaysAfterInitiation => "InvalidArgument",
            LcMissingAction => "MalformedXML",
        }
    }

    /// Human readable description for the `<Message>` element.
    pub fn description(&self) -> &'static str {
        use ApiErrorCode::*;
        match self {
            AccessDenied => "Access Denied.",
            BadDigest => "The Content-MD5 you specified did not match what we received.",
            EntityTooLarge => "Your proposed upload exceeds the maximum allowed object size.",
            EntityTooSmall => "Your proposed upload is smaller than the minimum allowed object size.",
            IncompleteBody => "You did not provide the number of bytes specified by the Content-Length HTTP header.",
            InternalError => "We encountered an internal error, please try again.",
            InvalidArgument => "Invalid Argument.",
            InvalidBucketName => "The specified bucket is not valid.",
            InvalidObjectState => "The operation is not valid for the current state of the object.",
            InvalidPart => "One or more of the specified parts could not be found.",
            InvalidRange => "The requested range is not satisfiable.",
            InvalidStorageClass => "The storage class you specified is not valid.",
            MalformedXml => "The XML you provided was not well-formed or did not validate against our published schema.",
            NoSuchBucket => "The specified bucket does not exist.",
            NoSuchKey => "The specified key does not exist.",
            NoSuchLifecycleConfiguration => "The lifecycle configuration does not exist.",
            NoSuchUpload => "The specified multipart upload does not exist.",
            NoSuchVersion => "The specified version does not exist.",
            NotImplemented => "A header you provided implies functionality that is not implemented.",
            ObjectNotAppendable => "The object is not appendable.",
            PositionNotEqualToLength => "The append position does not match the object length.",
            PreconditionFailed => "At least one of the preconditions you specified did not hold.",
            RestoreAlreadyInProgress => "Object restore is already in progress.",
            ServiceUnavailable => "Please reduce your request rate.",
            InvalidLcRulesNumbers => "The number of lifecycle rules must be between 1 and 100.",
            InvalidLcRuleId => "The rule ID must be at most 255 characters.",
            InvalidLcRuleStatus => "The rule status must be Enabled or Disabled.",
            LcMissingAction => "A lifecycle rule must specify at least one action.",
            InvalidLcUsingDateAndDays => "Exactly one of Date or Days must be specified.",
            InvalidLcDays => "Days must be a positive integer.",
            InvalidLcDate => "Date must be in ISO 8601 format.",
            LcDateNotMidnight => "Date must be at midnight.",
            InvalidLcFilter => "Filter must specify exactly one of Prefix, Tag or And.",
            DuplicateLcTagKey => "Duplicate tag keys in lifecycle filter.",
            LcTagsNotAllowed => "Tag based filters cannot be used with ExpiredObjectDeleteMarker or AbortIncompleteMultipartUpload.",
            LcMissingNoncurrentDays => "NoncurrentDays is required.",
            LcMissingStorageClass => "StorageClass is required for transitions.",
            LcMissingDaysAfterInitiation => "DaysAfterInitiation is required.",
        }
    }

    /// HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        use ApiErrorCode::*;
        match self {
            AccessDenied => 403,
            NoSuchBucket | NoSuchKey | NoSuchLifecycleConfiguration | NoSuchUpload
            | NoSuchVersion => 404,
            RestoreAlreadyInProgress | ObjectNotAppendable | PositionNotEqualToLength => 409,
            PreconditionFailed => 412,
            InvalidRange => 416,
            InternalError => 500,
            NotImplemented => 501,
            ServiceUnavailable => 503,
            InvalidObjectState => 403,
            _ => 400,
        }
    }
}

impl fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.description())
    }
}

// =============================================================================
// Error
// =============================================================================

/// Errors that can occur in the object gateway
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Fatal
    // =========================================================================
    /// Backend cluster connection or I/O failure
    #[error("Backend cluster {cluster} failed: {reason}")]
    Backend { cluster: String, reason: String },

    /// Metadata store failure
    #[error("Metadata store error: {0}")]
    Metadata(String),

    /// Record encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// Encryption or decryption failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Lock service unreachable
    #[error("Lock service unavailable: {0}")]
    LockService(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // General
    // =========================================================================
    /// Timed out waiting for an operation
    #[error("Timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    /// Outbound HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    /// Circuit breaker rejected the call
    #[error("Circuit is broken for {url}")]
    CircuitBroken { url: String },

    /// Half-open probe budget exhausted
    #[error("Circuit for {url} exceeded max retry while half-open")]
    CircuitRetryExceeded { url: String },

    /// Message bus publish failed
    #[error("Message bus error: {0}")]
    Bus(String),

    /// Operation cancelled by shutdown or the caller
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // Warn
    // =========================================================================
    /// Lock is held by someone else
    #[error("Lock not obtained: {key}")]
    LockNotObtained { key: String },

    /// Backend object missing
    #[error("Backend object not found: {0}")]
    ObjectNotFound(String),

    // =========================================================================
    // API
    // =========================================================================
    /// Error surfaced to clients unchanged
    #[error("{0}")]
    Api(ApiErrorCode),
}

impl From<ApiErrorCode> for Error {
    fn from(code: ApiErrorCode) -> Self {
        Error::Api(code)
    }
}

impl Error {
    /// Classify this error.
    pub fn severity(&self) -> Severity {
        match self {
            Error::Backend { .. }
            | Error::Metadata(_)
            | Error::Codec(_)
            | Error::Crypto(_)
            | Error::LockService(_)
            | Error::Io(_)
            | Error::Config(_)
            | Error::DurationParse(_)
            | Error::Internal(_) => Severity::Fatal,
            Error::Timeout { .. }
            | Error::Http(_)
            | Error::CircuitBroken { .. }
            | Error::CircuitRetryExceeded { .. }
            | Error::Bus(_)
            | Error::Cancelled(_) => Severity::General,
            Error::LockNotObtained { .. } | Error::ObjectNotFound(_) => Severity::Warn,
            Error::Api(_) => Severity::Api,
        }
    }

    /// The API code this error maps to, if it is a client-visible error.
    pub fn api_code(&self) -> Option<ApiErrorCode> {
        match self {
            Error::Api(code) => Some(*code),
            _ => None,
        }
    }

    /// Whether this error is the given API code.
    pub fn is_api(&self, code: ApiErrorCode) -> bool {
        self.api_code() == Some(code)
    }

    /// Log this error once at its severity level and build the response.
    ///
    /// Non-API errors collapse to `InternalError` and carry a fresh error id
    /// which is logged alongside the full error.
    pub fn report(&self) -> ErrorReport {
        match self.severity() {
            Severity::Api => {
                let code = self.api_code().unwrap_or(ApiErrorCode::InternalError);
                warn!("API error: {}", code.code());
                ErrorReport {
                    error_id: None,
                    code,
                }
            }
            severity => {
                let error_id = new_error_id();
                match severity {
                    Severity::Fatal => error!(error_id = %error_id, "Fatal error: {}", self),
                    Severity::General => error!(error_id = %error_id, "Error: {}", self),
                    _ => warn!(error_id = %error_id, "Warning: {}", self),
                }
                ErrorReport {
                    error_id: Some(error_id),
                    code: ApiErrorCode::InternalError,
                }
            }
        }
    }
}

// =============================================================================
// Error Report
// =============================================================================

/// What a caller sees for a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Opaque id correlating the response with the logged error.
    pub error_id: Option<String>,
    /// Code returned to the client.
    pub code: ApiErrorCode,
}

impl ErrorReport {
    /// HTTP status for the response.
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

const ERROR_ID_LEN: usize = 16;
const ERROR_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generate a short random error id.
pub fn new_error_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ERROR_ID_LEN)
        .map(|_| ERROR_ID_ALPHABET[rng.gen_range(0..ERROR_ID_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        assert_eq!(
            Error::Metadata("down".into()).severity(),
            Severity::Fatal
        );
        assert_eq!(
            Error::Bus("queue full".into()).severity(),
            Severity::General
        );
        assert_eq!(
            Error::LockNotObtained { key: "k".into() }.severity(),
            Severity::Warn
        );
        assert_eq!(Error::Api(ApiErrorCode::NoSuchKey).severity(), Severity::Api);
    }

    #[test]
    fn test_api_error_passes_through() {
        let report = Error::Api(ApiErrorCode::NoSuchBucket).report();
        assert_eq!(report.code, ApiErrorCode::NoSuchBucket);
        assert!(report.error_id.is_none());
        assert_eq!(report.http_status(), 404);
    }

    #[test]
    fn test_internal_error_is_opaque() {
        let report = Error::Backend {
            cluster: "c1".into(),
            reason: "connection reset".into(),
        }
        .report();
        assert_eq!(report.code, ApiErrorCode::InternalError);
        assert_eq!(report.http_status(), 500);
        let id = report.error_id.unwrap();
        assert_eq!(id.len(), ERROR_ID_LEN);
    }

    #[test]
    fn test_error_ids_are_unique() {
        let a = new_error_id();
        let b = new_error_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_lifecycle_codes_are_client_errors() {
        assert_eq!(ApiErrorCode::InvalidLcDays.http_status(), 400);
        assert_eq!(ApiErrorCode::InvalidLcDays.code(), "InvalidArgument");
        assert_eq!(ApiErrorCode::MalformedXml.code(), "MalformedXML");
    }
}
