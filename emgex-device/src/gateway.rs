use emgex_core::AcquisitionError;
use tracing::{debug, info, warn};

use crate::driver::{DeviceDriver, DriverDevice, DriverError};

/// A device reported by discovery, not yet opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub serial: String,
}

/// Boundary between the SDK and the acquisition pipeline. Every
/// [`DriverError`] is translated into an [`AcquisitionError`] here.
pub struct DeviceGateway<D: DeviceDriver> {
    driver: D,
    only_paired: bool,
}

impl<D: DeviceDriver> DeviceGateway<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            only_paired: true,
        }
    }

    /// Also report devices that are in range but not yet paired.
    pub fn include_unpaired(mut self) -> Self {
        self.only_paired = false;
        self
    }

    pub fn discover(&self) -> Result<Vec<DeviceHandle>, AcquisitionError> {
        let serials = self
            .driver
            .available_devices(self.only_paired)
            .map_err(|e| {
                warn!(code = e.code, error = %e.message, "device discovery failed");
                AcquisitionError::NoDeviceFound
            })?;
        if serials.is_empty() {
            return Err(AcquisitionError::NoDeviceFound);
        }
        debug!(count = serials.len(), "devices discovered");
        Ok(serials
            .into_iter()
            .map(|serial| DeviceHandle { serial })
            .collect())
    }

    pub fn connect(
        &self,
        handle: &DeviceHandle,
    ) -> Result<ConnectedDevice<D::Device>, AcquisitionError> {
        let connection_error = |e: DriverError| AcquisitionError::ConnectionError {
            device: handle.serial.clone(),
            reason: e.to_string(),
        };
        let device = self.driver.open(&handle.serial).map_err(connection_error)?;
        let channels = device.acquired_channels().map_err(connection_error)?;
        if channels == 0 {
            return Err(AcquisitionError::ConnectionError {
                device: handle.serial.clone(),
                reason: "device reports no acquired channels".into(),
            });
        }
        info!(serial = %handle.serial, channels, "device connected");
        Ok(ConnectedDevice {
            serial: handle.serial.clone(),
            device,
            channels,
            acquiring: false,
            buffer: Vec::new(),
        })
    }

    /// Connects to the first discovered device.
    pub fn connect_first(&self) -> Result<ConnectedDevice<D::Device>, AcquisitionError> {
        let handles = self.discover()?;
        self.connect(&handles[0])
    }
}

/// An opened device. Stops a running acquisition when dropped.
pub struct ConnectedDevice<Dev: DriverDevice> {
    serial: String,
    device: Dev,
    channels: usize,
    acquiring: bool,
    buffer: Vec<f32>,
}

impl<Dev: DriverDevice> ConnectedDevice<Dev> {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    pub fn start(&mut self) -> Result<(), AcquisitionError> {
        if self.acquiring {
            return Ok(());
        }
        self.device
            .start_acquisition(false)
            .map_err(|e| read_error("start acquisition", e))?;
        self.acquiring = true;
        debug!(serial = %self.serial, "acquisition started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), AcquisitionError> {
        if !self.acquiring {
            return Ok(());
        }
        self.acquiring = false;
        self.device
            .stop_acquisition()
            .map_err(|e| read_error("stop acquisition", e))?;
        debug!(serial = %self.serial, "acquisition stopped");
        Ok(())
    }

    /// Blocks until `count` frames are available and returns them in capture
    /// order, one `Vec` of channel samples per frame.
    pub fn read_frames(&mut self, count: usize) -> Result<Vec<Vec<f32>>, AcquisitionError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if !self.acquiring {
            return Err(AcquisitionError::DeviceReadError(
                "acquisition has not been started".into(),
            ));
        }
        self.buffer.resize(count * self.channels, 0.0);
        self.device
            .get_data(count, &mut self.buffer)
            .map_err(|e| read_error("get data", e))?;
        Ok(self
            .buffer
            .chunks_exact(self.channels)
            .map(<[f32]>::to_vec)
            .collect())
    }
}

impl<Dev: DriverDevice> Drop for ConnectedDevice<Dev> {
    fn drop(&mut self) {
        if self.acquiring {
            if let Err(e) = self.device.stop_acquisition() {
                warn!(serial = %self.serial, error = %e, "failed to stop acquisition on release");
            }
        }
    }
}

fn read_error(operation: &str, e: DriverError) -> AcquisitionError {
    AcquisitionError::DeviceReadError(format!("{operation}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubDriver {
        serials: Vec<String>,
        refuse_open: bool,
        stops: Arc<AtomicUsize>,
    }

    struct StubDevice {
        stops: Arc<AtomicUsize>,
        next: f32,
    }

    impl DeviceDriver for StubDriver {
        type Device = StubDevice;

        fn available_devices(&self, _only_paired: bool) -> Result<Vec<String>, DriverError> {
            Ok(self.serials.clone())
        }

        fn open(&self, serial: &str) -> Result<StubDevice, DriverError> {
            if self.refuse_open {
                return Err(DriverError::new(-3, format!("{serial} is busy")));
            }
            Ok(StubDevice {
                stops: Arc::clone(&self.stops),
                next: 0.0,
            })
        }
    }

    impl DriverDevice for StubDevice {
        fn acquired_channels(&self) -> Result<usize, DriverError> {
            Ok(2)
        }

        fn start_acquisition(&mut self, _test_signal: bool) -> Result<(), DriverError> {
            Ok(())
        }

        fn stop_acquisition(&mut self) -> Result<(), DriverError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn get_data(&mut self, _frames: usize, buffer: &mut [f32]) -> Result<(), DriverError> {
            for sample in buffer.iter_mut() {
                *sample = self.next;
                self.next += 1.0;
            }
            Ok(())
        }
    }

    fn gateway(serials: &[&str]) -> DeviceGateway<StubDriver> {
        DeviceGateway::new(StubDriver {
            serials: serials.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn empty_discovery_is_no_device_found() {
        assert!(matches!(
            gateway(&[]).discover(),
            Err(AcquisitionError::NoDeviceFound)
        ));
    }

    #[test]
    fn open_failure_becomes_connection_error() {
        let gateway = DeviceGateway::new(StubDriver {
            serials: vec!["UN-1".into()],
            refuse_open: true,
            ..Default::default()
        });
        match gateway.connect_first() {
            Err(AcquisitionError::ConnectionError { device, reason }) => {
                assert_eq!(device, "UN-1");
                assert!(reason.contains("busy"));
            }
            other => panic!("unexpected: {:?}", other.map(|d| d.channel_count())),
        }
    }

    #[test]
    fn read_splits_interleaved_buffer_into_frames() {
        let mut device = gateway(&["UN-1"]).connect_first().unwrap();
        device.start().unwrap();
        let frames = device.read_frames(3).unwrap();
        assert_eq!(frames, vec![vec![0.0, 1.0], vec![2.0, 3.0], vec![4.0, 5.0]]);
    }

    #[test]
    fn read_before_start_is_rejected() {
        let mut device = gateway(&["UN-1"]).connect_first().unwrap();
        assert!(matches!(
            device.read_frames(1),
            Err(AcquisitionError::DeviceReadError(_))
        ));
    }

    #[test]
    fn drop_stops_running_acquisition() {
        let gateway = gateway(&["UN-1"]);
        let stops = Arc::clone(&gateway.driver.stops);
        let mut device = gateway.connect_first().unwrap();
        device.start().unwrap();
        drop(device);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_stop_is_not_repeated_on_drop() {
        let gateway = gateway(&["UN-1"]);
        let stops = Arc::clone(&gateway.driver.stops);
        let mut device = gateway.connect_first().unwrap();
        device.start().unwrap();
        device.stop().unwrap();
        device.stop().unwrap();
        drop(device);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
