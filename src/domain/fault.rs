//! Array fault decoding
//!
//! The array answers every call with a numeric return code and a status
//! message, even on success. Codes are decoded once, at the client boundary,
//! into an [`ArrayOutcome`] so orchestration logic only ever branches on named
//! faults.

use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Return code the array uses for success
pub const SUCCESS_CODE: i64 = 0;

/// Named array faults the orchestrators react to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultCode {
    /// Initiator is not registered as a host on the array
    HostDoesNotExist,
    /// No host mapping exists for the initiator yet
    HostMapDoesNotExist,
    /// Unmap had nothing to remove
    UnmapFailed,
    /// Volume is not known to the array
    VolumeNotFound,
    /// Volume still has dependent snapshots
    VolumeHasSnapshots,
    /// Snapshot is not known to the array
    SnapshotNotFound,
    /// Snapshot with that name already exists
    SnapshotAlreadyExists,
    /// A `show` query matched no object
    ObjectNotFound,
}

impl FaultCode {
    /// All known faults
    pub const ALL: [FaultCode; 8] = [
        FaultCode::HostDoesNotExist,
        FaultCode::HostMapDoesNotExist,
        FaultCode::UnmapFailed,
        FaultCode::VolumeNotFound,
        FaultCode::VolumeHasSnapshots,
        FaultCode::SnapshotNotFound,
        FaultCode::SnapshotAlreadyExists,
        FaultCode::ObjectNotFound,
    ];

    /// Numeric code reported by the array
    pub fn code(self) -> i64 {
        match self {
            FaultCode::HostDoesNotExist => -10386,
            FaultCode::HostMapDoesNotExist => -10074,
            FaultCode::UnmapFailed => -10509,
            FaultCode::VolumeNotFound => -10075,
            FaultCode::VolumeHasSnapshots => -10183,
            FaultCode::SnapshotNotFound => -10050,
            FaultCode::SnapshotAlreadyExists => -10186,
            FaultCode::ObjectNotFound => -10058,
        }
    }

    /// Decode a numeric code into a known fault
    pub fn from_code(code: i64) -> Option<FaultCode> {
        Self::ALL.into_iter().find(|fault| fault.code() == code)
    }
}

impl std::fmt::Display for FaultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Decoded result of a single array call
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayOutcome<T> {
    /// The call succeeded
    Ok(T),
    /// The array reported a fault we know how to handle
    KnownFault(FaultCode),
    /// The array reported a code we do not recognise
    Unknown { code: i64, message: String },
}

impl<T> ArrayOutcome<T> {
    /// Decode a `(return code, message)` pair, building the payload lazily on
    /// success
    pub fn decode(code: i64, message: impl Into<String>, payload: impl FnOnce() -> T) -> Self {
        if code == SUCCESS_CODE {
            return ArrayOutcome::Ok(payload());
        }
        match FaultCode::from_code(code) {
            Some(fault) => ArrayOutcome::KnownFault(fault),
            None => ArrayOutcome::Unknown {
                code,
                message: message.into(),
            },
        }
    }

    /// Whether the array reported `fault`
    pub fn is_fault(&self, fault: FaultCode) -> bool {
        matches!(self, ArrayOutcome::KnownFault(f) if *f == fault)
    }

    /// Turn any non-success outcome into an error; `operation` names the call
    /// for the message
    pub fn into_result(self, operation: &str) -> crate::error::Result<T> {
        match self {
            ArrayOutcome::Ok(value) => Ok(value),
            ArrayOutcome::KnownFault(fault) => Err(Error::Array {
                operation: operation.to_string(),
                code: fault.code(),
                message: format!("{:?}", fault),
            }),
            ArrayOutcome::Unknown { code, message } => Err(Error::Array {
                operation: operation.to_string(),
                code,
                message,
            }),
        }
    }
}
