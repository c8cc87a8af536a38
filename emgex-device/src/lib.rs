pub mod driver;
pub mod gateway;
pub mod simulated;

pub use driver::{DeviceDriver, DriverDevice, DriverError};
pub use gateway::{ConnectedDevice, DeviceGateway, DeviceHandle};
pub use simulated::{SimulatedDevice, SimulatedDriver};
