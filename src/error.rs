//! Error types for change capture
//!
//! Every fallible operation in the crate returns [`CaptureError`]. The variants
//! follow the lifecycle of a capture run: configuration, connection setup,
//! replication setup, decoding, snapshotting and acknowledgement.

use thiserror::Error;

/// Error taxonomy for a capture run
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Invalid or missing configuration. No connection is attempted.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection errors that can be retried (transient)
    #[error("Transient connection error: {0}")]
    TransientConnection(String),

    /// Connection errors that should not be retried (permanent)
    #[error("Permanent connection error: {0}")]
    PermanentConnection(String),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The server rejected slot, publication or replication start
    #[error("Replication setup error: {0}")]
    ProtocolSetup(String),

    /// Malformed replication protocol framing
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Malformed change payload; position tracking cannot continue past it
    #[error("Decode error: {0}")]
    Decode(String),

    /// Query or scan failure while bulk loading
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// A wire value could not be converted to the requested type
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// A standby status update could not be delivered
    #[error("Acknowledge error: {0}")]
    Acknowledge(String),

    /// Operation cancelled errors
    #[error("Operation was cancelled: {0}")]
    Cancelled(String),

    /// A worker channel closed before the run finished
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// String conversion errors (from CString operations)
    #[error("String conversion error: {0}")]
    StringConversion(#[from] std::ffi::NulError),

    /// JSON payload errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file parse errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CaptureError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        CaptureError::Config(msg.into())
    }

    /// Create a new transient connection error (can be retried)
    pub fn transient_connection<S: Into<String>>(msg: S) -> Self {
        CaptureError::TransientConnection(msg.into())
    }

    /// Create a new permanent connection error (should not be retried)
    pub fn permanent_connection<S: Into<String>>(msg: S) -> Self {
        CaptureError::PermanentConnection(msg.into())
    }

    /// Create a new authentication error
    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        CaptureError::Authentication(msg.into())
    }

    /// Create a new replication setup error
    pub fn protocol_setup<S: Into<String>>(msg: S) -> Self {
        CaptureError::ProtocolSetup(msg.into())
    }

    /// Create a new protocol framing error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        CaptureError::Protocol(msg.into())
    }

    /// Create a new decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        CaptureError::Decode(msg.into())
    }

    /// Create a new snapshot error
    pub fn snapshot<S: Into<String>>(msg: S) -> Self {
        CaptureError::Snapshot(msg.into())
    }

    /// Create a new conversion error
    pub fn conversion<S: Into<String>>(msg: S) -> Self {
        CaptureError::Conversion(msg.into())
    }

    /// Create a new acknowledge error
    pub fn acknowledge<S: Into<String>>(msg: S) -> Self {
        CaptureError::Acknowledge(msg.into())
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        CaptureError::Cancelled(msg.into())
    }

    /// Create a new channel closed error
    pub fn channel_closed<S: Into<String>>(msg: S) -> Self {
        CaptureError::ChannelClosed(msg.into())
    }

    /// Check if the error is transient (can be retried)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CaptureError::TransientConnection(_) | CaptureError::Io(_)
        )
    }

    /// Check if the error is permanent (should not be retried)
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CaptureError::PermanentConnection(_)
                | CaptureError::Authentication(_)
                | CaptureError::ProtocolSetup(_)
                | CaptureError::Config(_)
        )
    }

    /// Check if the error happened while establishing a connection
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            CaptureError::TransientConnection(_)
                | CaptureError::PermanentConnection(_)
                | CaptureError::Authentication(_)
        )
    }

    /// Check if the error is due to cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CaptureError::Cancelled(_))
    }
}

/// Result type for capture operations
pub type Result<T> = std::result::Result<T, CaptureError>;
