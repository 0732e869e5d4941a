//! Error types for the block array driver
//!
//! Every failure the driver can produce is a variant of [`Error`]. Each variant
//! maps to exactly one protocol status kind ([`RpcCode`]) so the transport
//! adapter never needs to inspect messages or raw array codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request Validation
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("'{key}' is missing from configuration")]
    MissingParameter { key: String },

    #[error("Unsupported access mode: {mode}; only single-node read/write is supported")]
    UnsupportedAccessMode { mode: String },

    #[error("Missing API credentials")]
    MissingCredentials,

    // =========================================================================
    // Array Session
    // =========================================================================
    #[error("Array login failed for {username}@{address}: {reason}")]
    Unauthenticated {
        address: String,
        username: String,
        reason: String,
    },

    #[error("Array unreachable: {0}")]
    ArrayTransport(#[from] reqwest::Error),

    #[error("Array response could not be decoded: {0}")]
    ArrayProtocol(String),

    #[error("Array operation {operation} failed with code {code}: {message}")]
    Array {
        operation: String,
        code: i64,
        message: String,
    },

    // =========================================================================
    // Volume & Snapshot Lifecycle
    // =========================================================================
    #[error("Volume {volume_id} not found")]
    VolumeNotFound { volume_id: String },

    #[error("Volume {volume_id} already exists with {existing_bytes} bytes, {requested_bytes} requested")]
    VolumeConflict {
        volume_id: String,
        existing_bytes: u64,
        requested_bytes: u64,
    },

    #[error("Volume {volume_id} cannot be deleted since it has snapshots")]
    VolumeHasSnapshots { volume_id: String },

    #[error("Volume {volume_id} is already attached to another node")]
    VolumeAttachedElsewhere { volume_id: String },

    #[error("Volume {volume_id} cannot shrink from {current_bytes} to {requested_bytes} bytes")]
    VolumeShrink {
        volume_id: String,
        current_bytes: u64,
        requested_bytes: u64,
    },

    #[error("No more available LUNs")]
    LunExhausted,

    #[error("Snapshot {snapshot_id} not found")]
    SnapshotNotFound { snapshot_id: String },

    #[error("Snapshot {snapshot_id} already exists for source volume {existing_source}")]
    SnapshotConflict {
        snapshot_id: String,
        existing_source: String,
    },

    // =========================================================================
    // Node Attachment
    // =========================================================================
    #[error("Node busy: another publish operation is in progress")]
    NodeBusy,

    #[error("Initiator name unavailable from {path}: {reason}")]
    InitiatorName { path: String, reason: String },

    #[error("Device {device} holds a {existing} filesystem, {requested} requested")]
    FilesystemMismatch {
        device: String,
        existing: String,
        requested: String,
    },

    #[error("Filesystem check failed on {device}: {reason}")]
    FilesystemCorrupted { device: String, reason: String },

    #[error("Device {device} is already mounted at {mount_point}")]
    MountedElsewhere { device: String, mount_point: String },

    #[error("Device {device} is mounted at several locations: {mount_points:?}")]
    AmbiguousMounts {
        device: String,
        mount_points: Vec<String>,
    },

    #[error("Connector state for volume {volume_id} not found")]
    ConnectorStateMissing { volume_id: String },

    #[error("Command {command} failed: {output}")]
    Command { command: String, output: String },

    #[error("iSCSI error: {0}")]
    Iscsi(String),

    #[error("Node not ready: {0}")]
    NodeNotReady(String),

    // =========================================================================
    // Internal
    // =========================================================================
    #[error("Operation not implemented: {0}")]
    Unimplemented(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol-level status kinds returned to the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    ResourceExhausted,
    OutOfRange,
    Unauthenticated,
    Unavailable,
    Internal,
    DataLoss,
    Aborted,
    Unimplemented,
}

impl std::fmt::Display for RpcCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RpcCode::InvalidArgument => "InvalidArgument",
            RpcCode::NotFound => "NotFound",
            RpcCode::AlreadyExists => "AlreadyExists",
            RpcCode::FailedPrecondition => "FailedPrecondition",
            RpcCode::ResourceExhausted => "ResourceExhausted",
            RpcCode::OutOfRange => "OutOfRange",
            RpcCode::Unauthenticated => "Unauthenticated",
            RpcCode::Unavailable => "Unavailable",
            RpcCode::Internal => "Internal",
            RpcCode::DataLoss => "DataLoss",
            RpcCode::Aborted => "Aborted",
            RpcCode::Unimplemented => "Unimplemented",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Protocol status kind for this error
    pub fn code(&self) -> RpcCode {
        match self {
            Error::InvalidArgument(_)
            | Error::MissingParameter { .. }
            | Error::MissingCredentials => RpcCode::InvalidArgument,

            Error::UnsupportedAccessMode { .. }
            | Error::VolumeHasSnapshots { .. }
            | Error::VolumeAttachedElsewhere { .. }
            | Error::FilesystemMismatch { .. }
            | Error::MountedElsewhere { .. }
            | Error::AmbiguousMounts { .. }
            | Error::InitiatorName { .. }
            | Error::NodeNotReady(_) => RpcCode::FailedPrecondition,

            Error::VolumeNotFound { .. }
            | Error::SnapshotNotFound { .. }
            | Error::ConnectorStateMissing { .. } => RpcCode::NotFound,

            Error::VolumeConflict { .. } | Error::SnapshotConflict { .. } => {
                RpcCode::AlreadyExists
            }

            Error::VolumeShrink { .. } => RpcCode::OutOfRange,
            Error::LunExhausted => RpcCode::ResourceExhausted,
            Error::Unauthenticated { .. } => RpcCode::Unauthenticated,
            Error::ArrayTransport(_) => RpcCode::Unavailable,
            Error::FilesystemCorrupted { .. } => RpcCode::DataLoss,
            Error::NodeBusy => RpcCode::Aborted,
            Error::Unimplemented(_) => RpcCode::Unimplemented,

            Error::ArrayProtocol(_)
            | Error::Array { .. }
            | Error::Command { .. }
            | Error::Iscsi(_)
            | Error::Internal(_)
            | Error::Configuration(_)
            | Error::JsonParse(_)
            | Error::Io(_) => RpcCode::Internal,
        }
    }

    /// Check if the caller may retry this error as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self.code(), RpcCode::Aborted | RpcCode::Unavailable)
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::VolumeHasSnapshots {
            volume_id: "vol1".into(),
        };
        assert_eq!(err.code(), RpcCode::FailedPrecondition);

        let err = Error::VolumeConflict {
            volume_id: "vol1".into(),
            existing_bytes: 1024,
            requested_bytes: 2048,
        };
        assert_eq!(err.code(), RpcCode::AlreadyExists);

        assert_eq!(Error::LunExhausted.code(), RpcCode::ResourceExhausted);
        assert_eq!(Error::NodeBusy.code(), RpcCode::Aborted);

        let err = Error::FilesystemCorrupted {
            device: "/dev/sdb".into(),
            reason: "bad superblock".into(),
        };
        assert_eq!(err.code(), RpcCode::DataLoss);
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::NodeBusy.is_retryable());
        assert!(!Error::LunExhausted.is_retryable());

        let err = Error::Array {
            operation: "map volume".into(),
            code: -10999,
            message: "unexpected".into(),
        };
        assert_eq!(err.code(), RpcCode::Internal);
        assert!(!err.is_retryable());
    }
}
