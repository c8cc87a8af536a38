use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::trial::Condition;

/// Every failure an acquisition run can surface to the operator.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("no acquisition device available; pair a device first")]
    NoDeviceFound,
    #[error("could not connect to device '{device}': {reason}")]
    ConnectionError { device: String, reason: String },
    #[error("device read failed: {0}")]
    DeviceReadError(String),
    #[error("failed to write trial record {}: {source}", path.display())]
    FileWriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("an acquisition session is already running")]
    ConcurrentStartRejected,
    #[error("no trial record found for participant '{participant}', condition {condition}")]
    TrialNotFound {
        participant: String,
        condition: Condition,
    },
    #[error("trial records cannot be deleted while a session is active")]
    DeletionBlocked,
    #[error("trial store error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("frame {got} arrived out of order (expected {expected})")]
    OutOfOrderFrame { expected: u64, got: u64 },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("session worker failed: {0}")]
    Worker(String),
}

impl AcquisitionError {
    /// Errors that originate from the acquisition hardware.
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            AcquisitionError::NoDeviceFound
                | AcquisitionError::ConnectionError { .. }
                | AcquisitionError::DeviceReadError(_)
        )
    }
}
