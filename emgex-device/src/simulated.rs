use std::f32::consts::TAU;
use std::time::Duration;

use emgex_timing::Timer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::driver::{DeviceDriver, DriverDevice, DriverError};

const DEFAULT_SERIAL: &str = "UN-SIM-0001";
const UNPAIRED_SERIAL: &str = "UN-SIM-0002";
const MAINS_HZ: f32 = 50.0;

/// Software stand-in for an sEMG amplifier. Reads are paced by the injected
/// clock at the nominal sampling rate, so a [`emgex_timing::VirtualTimer`]
/// makes runs instant and deterministic.
#[derive(Debug, Clone)]
pub struct SimulatedDriver<T> {
    serials: Vec<String>,
    /// In range but not paired; only reported when unpaired devices are asked for.
    unpaired: Vec<String>,
    channels: usize,
    sample_rate_hz: u32,
    seed: u64,
    timer: T,
}

impl<T> SimulatedDriver<T>
where
    T: Timer<Timestamp = u64>,
{
    pub fn new(timer: T) -> Self {
        Self {
            serials: vec![DEFAULT_SERIAL.to_string()],
            unpaired: vec![UNPAIRED_SERIAL.to_string()],
            channels: 8,
            sample_rate_hz: 250,
            seed: 0x5eed,
            timer,
        }
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate_hz: u32) -> Self {
        self.sample_rate_hz = sample_rate_hz.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Simulates an SDK that finds nothing to pair with.
    pub fn without_devices(mut self) -> Self {
        self.serials.clear();
        self.unpaired.clear();
        self
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.sample_rate_hz))
    }
}

impl<T> DeviceDriver for SimulatedDriver<T>
where
    T: Timer<Timestamp = u64>,
{
    type Device = SimulatedDevice<T>;

    fn available_devices(&self, only_paired: bool) -> Result<Vec<String>, DriverError> {
        let mut serials = self.serials.clone();
        if !only_paired {
            serials.extend(self.unpaired.iter().cloned());
        }
        Ok(serials)
    }

    fn open(&self, serial: &str) -> Result<Self::Device, DriverError> {
        if !self.serials.iter().chain(&self.unpaired).any(|s| s == serial) {
            return Err(DriverError::new(-2, format!("unknown serial '{serial}'")));
        }
        debug!(
            serial,
            channels = self.channels,
            rate = self.sample_rate_hz,
            "opening simulated device"
        );
        Ok(SimulatedDevice {
            channels: self.channels,
            sample_rate_hz: self.sample_rate_hz,
            period_ns: self.frame_period().as_nanos() as u64,
            timer: self.timer.clone(),
            rng: StdRng::seed_from_u64(self.seed),
            started_at: None,
            delivered: 0,
            test_signal: false,
        })
    }
}

pub struct SimulatedDevice<T> {
    channels: usize,
    sample_rate_hz: u32,
    period_ns: u64,
    timer: T,
    rng: StdRng,
    started_at: Option<u64>,
    delivered: u64,
    test_signal: bool,
}

impl<T> SimulatedDevice<T>
where
    T: Timer<Timestamp = u64>,
{
    fn sample(&mut self, frame: u64, channel: usize) -> f32 {
        let t = frame as f32 / self.sample_rate_hz as f32;
        if self.test_signal {
            // 1 Hz square wave, identical on every channel.
            return if (t.fract()) < 0.5 { 50.0 } else { -50.0 };
        }
        let hum = 4.0 * (TAU * MAINS_HZ * t + channel as f32).sin();
        let noise: f32 = self.rng.random_range(-12.0..12.0);
        hum + noise
    }
}

impl<T> DriverDevice for SimulatedDevice<T>
where
    T: Timer<Timestamp = u64>,
{
    fn acquired_channels(&self) -> Result<usize, DriverError> {
        Ok(self.channels)
    }

    fn start_acquisition(&mut self, test_signal: bool) -> Result<(), DriverError> {
        if self.started_at.is_some() {
            return Err(DriverError::new(-4, "acquisition already running"));
        }
        self.started_at = Some(self.timer.now());
        self.delivered = 0;
        self.test_signal = test_signal;
        Ok(())
    }

    fn stop_acquisition(&mut self) -> Result<(), DriverError> {
        self.started_at = None;
        Ok(())
    }

    fn get_data(&mut self, frames: usize, buffer: &mut [f32]) -> Result<(), DriverError> {
        let Some(started_at) = self.started_at else {
            return Err(DriverError::new(-5, "acquisition not running"));
        };
        let needed = frames * self.channels;
        if buffer.len() < needed {
            return Err(DriverError::new(
                -6,
                format!("buffer holds {} samples, {needed} required", buffer.len()),
            ));
        }

        // Block until the last requested frame would have been sampled.
        let due = started_at + (self.delivered + frames as u64) * self.period_ns;
        let now = self.timer.now();
        if due > now {
            self.timer.sleep(Duration::from_nanos(due - now));
        }

        for f in 0..frames {
            let frame = self.delivered + f as u64;
            for ch in 0..self.channels {
                buffer[f * self.channels + ch] = self.sample(frame, ch);
            }
        }
        self.delivered += frames as u64;
        Ok(())
    }
}
