//! Error types for the LVM Backup Operator

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Status code reported to callers of the volume service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    NotFound,
    InvalidArgument,
    ResourceExhausted,
    OutOfRange,
    DeadlineExceeded,
    Unavailable,
    Internal,
}

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Device class not configured on this node
    #[error("device class not found: {0}")]
    DeviceClassNotFound(String),

    /// Volume group not present on this node
    #[error("volume group not found: {0}")]
    VolumeGroupNotFound(String),

    /// Logical volume not present in its volume group
    #[error("logical volume {0} is not found")]
    VolumeNotFound(String),

    /// Admission rejected for lack of space
    #[error("no enough space left on VG: free={free}, requested={requested}")]
    CapacityExhausted { free: u64, requested: u64 },

    /// Admission rejected because the volume would shrink
    #[error("shrinking volume size is not allowed: current={current}, requested={requested}")]
    ShrinkNotAllowed { current: u64, requested: u64 },

    /// LVM command failure
    #[error("LVM command failed: {0}")]
    Lvm(String),

    /// Script could not be launched
    #[error("failed to launch script: {0}")]
    ScriptLaunch(String),

    /// Progress store could not be read or written
    #[error("progress store error: {0}")]
    ProgressStore(String),

    /// Restore script failed while seeding a volume
    #[error("restore failed: {0}")]
    Restore(String),

    /// PVC not found
    #[error("PVC not found: {0}")]
    PvcNotFound(String),

    /// PV not found
    #[error("PV not found: {0}")]
    PvNotFound(String),

    /// Secret not found
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    /// Remote call exceeded its deadline
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create an LVM command error
    pub fn lvm(msg: impl Into<String>) -> Self {
        Error::Lvm(msg.into())
    }

    /// Create a progress store error
    pub fn store(msg: impl Into<String>) -> Self {
        Error::ProgressStore(msg.into())
    }

    /// Status code for the volume service boundary
    pub fn code(&self) -> Code {
        match self {
            Error::DeviceClassNotFound(_)
            | Error::VolumeGroupNotFound(_)
            | Error::VolumeNotFound(_)
            | Error::PvcNotFound(_)
            | Error::PvNotFound(_)
            | Error::SecretNotFound(_) => Code::NotFound,
            Error::CapacityExhausted { .. } => Code::ResourceExhausted,
            Error::ShrinkNotAllowed { .. } => Code::OutOfRange,
            Error::Validation(_) | Error::Config(_) => Code::InvalidArgument,
            Error::Timeout { .. } => Code::DeadlineExceeded,
            Error::Kube(_) => Code::Unavailable,
            _ => Code::Internal,
        }
    }

    /// Whether the failure may clear up on its own and should be retried
    /// instead of being written as a terminal status.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code != 404,
            Error::Kube(_) => true,
            _ => false,
        }
    }
}

/// Map a 404 from the API server onto a domain not-found error, leaving
/// every other failure as a (transient) Kubernetes error.
pub(crate) fn not_found_as(err: kube::Error, not_found: impl FnOnce() -> Error) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => not_found(),
        other => Error::Kube(other),
    }
}
