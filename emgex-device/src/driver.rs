//! Capability contract of a vendor acquisition SDK.
//!
//! Implementations wrap the raw binding and report failures as [`DriverError`];
//! translation into the acquisition error taxonomy happens in
//! [`crate::gateway`] only.

use thiserror::Error;

/// Error reported by the SDK, carrying its native status code.
#[derive(Debug, Clone, Error)]
#[error("driver error {code}: {message}")]
pub struct DriverError {
    pub code: i32,
    pub message: String,
}

impl DriverError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Entry point of an SDK: enumerates and opens devices.
pub trait DeviceDriver: Send + 'static {
    type Device: DriverDevice;

    /// Serials of reachable devices. `only_paired` restricts the search to
    /// devices already paired with this host.
    fn available_devices(&self, only_paired: bool) -> Result<Vec<String>, DriverError>;

    fn open(&self, serial: &str) -> Result<Self::Device, DriverError>;
}

/// An opened device. All calls block the calling thread.
pub trait DriverDevice: Send + 'static {
    fn acquired_channels(&self) -> Result<usize, DriverError>;

    fn start_acquisition(&mut self, test_signal: bool) -> Result<(), DriverError>;

    fn stop_acquisition(&mut self) -> Result<(), DriverError>;

    /// Fills `buffer` with `frames` interleaved sample sets
    /// (`frames * acquired_channels` values), blocking until they are
    /// available.
    fn get_data(&mut self, frames: usize, buffer: &mut [f32]) -> Result<(), DriverError>;
}
