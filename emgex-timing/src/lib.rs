pub mod timer;

pub use timer::{HighPrecisionTimer, ReadStats, Timer, VirtualTimer};
