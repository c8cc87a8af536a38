#![allow(dead_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;
use emgex_core::{AcquisitionError, Condition, Intensity, TrialIdentity};
use emgex_device::{DeviceDriver, DriverDevice, DriverError, SimulatedDevice, SimulatedDriver};
use emgex_experiment::{
    ExperimentConfig, OpenedRecord, Protocol, ProtocolStep, RecordStore, StopSignal, StreamBus,
    TrialStore,
};
use emgex_timing::VirtualTimer;

/// Rest then strong expression, five seconds each, no countdown.
pub fn two_phase_config(data_dir: &Path) -> ExperimentConfig {
    ExperimentConfig {
        data_dir: data_dir.to_path_buf(),
        lead_in_secs: 0,
        protocol: Protocol {
            name: "two-phase".into(),
            steps: vec![
                ProtocolStep::rest(5),
                ProtocolStep::expression(Intensity::Strong, 5),
            ],
        },
        ..ExperimentConfig::default()
    }
}

/// Simulated amplifier at 10 Hz with four channels.
pub fn ten_hz(timer: &VirtualTimer) -> SimulatedDriver<VirtualTimer> {
    SimulatedDriver::new(timer.clone())
        .with_sample_rate(10)
        .with_channels(4)
}

/// Event codes of every row, taken from the last column.
pub fn event_codes(path: &Path) -> Vec<i32> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| line.rsplit(',').next().unwrap().parse().unwrap())
        .collect()
}

pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

/// What a [`ScriptedDriver`] does to its devices.
#[derive(Default)]
pub struct Script {
    /// Reads that succeed before the device reports a fault.
    pub fail_after: Option<usize>,
    /// Requests a stop once this many reads were served.
    pub stop_after: Option<(usize, StopSignal)>,
    /// Every read waits for a permit; a dropped sender releases all reads.
    pub hold: Option<Receiver<()>>,
}

/// Wraps the simulator with scripted faults, stops and pauses.
#[derive(Clone)]
pub struct ScriptedDriver {
    inner: SimulatedDriver<VirtualTimer>,
    script: Arc<Mutex<Script>>,
}

impl ScriptedDriver {
    pub fn new(inner: SimulatedDriver<VirtualTimer>) -> (Self, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script::default()));
        (
            Self {
                inner,
                script: Arc::clone(&script),
            },
            script,
        )
    }
}

pub struct ScriptedDevice {
    inner: SimulatedDevice<VirtualTimer>,
    script: Arc<Mutex<Script>>,
    reads: usize,
}

impl DeviceDriver for ScriptedDriver {
    type Device = ScriptedDevice;

    fn available_devices(&self, only_paired: bool) -> Result<Vec<String>, DriverError> {
        self.inner.available_devices(only_paired)
    }

    fn open(&self, serial: &str) -> Result<ScriptedDevice, DriverError> {
        Ok(ScriptedDevice {
            inner: self.inner.open(serial)?,
            script: Arc::clone(&self.script),
            reads: 0,
        })
    }
}

impl DriverDevice for ScriptedDevice {
    fn acquired_channels(&self) -> Result<usize, DriverError> {
        self.inner.acquired_channels()
    }

    fn start_acquisition(&mut self, test_signal: bool) -> Result<(), DriverError> {
        self.inner.start_acquisition(test_signal)
    }

    fn stop_acquisition(&mut self) -> Result<(), DriverError> {
        self.inner.stop_acquisition()
    }

    fn get_data(&mut self, frames: usize, buffer: &mut [f32]) -> Result<(), DriverError> {
        let hold = self.script.lock().unwrap().hold.clone();
        if let Some(hold) = hold {
            let _ = hold.recv();
        }
        let script = self.script.lock().unwrap();
        if script.fail_after.is_some_and(|n| self.reads >= n) {
            return Err(DriverError::new(-7, "amplifier disconnected"));
        }
        if let Some((n, stop)) = &script.stop_after {
            if self.reads + 1 >= *n {
                stop.request();
            }
        }
        drop(script);
        self.inner.get_data(frames, buffer)?;
        self.reads += 1;
        Ok(())
    }
}

/// File writer that refuses every row after the first `limit`.
pub struct FailAfterRows {
    file: File,
    rows: usize,
    limit: usize,
}

impl Write for FailAfterRows {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.rows >= self.limit {
            return Err(io::Error::other("no space left on device"));
        }
        self.file.write_all(buf)?;
        self.rows += buf.iter().filter(|b| **b == b'\n').count();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Filesystem store whose records break after `limit` rows.
pub struct FailingStore {
    pub inner: TrialStore,
    pub limit: usize,
}

impl RecordStore for FailingStore {
    type Writer = FailAfterRows;

    fn next_sequence_number(
        &self,
        participant: &str,
        condition: Condition,
    ) -> Result<u32, AcquisitionError> {
        self.inner.next_sequence_number(participant, condition)
    }

    fn path_for(&self, identity: &TrialIdentity) -> PathBuf {
        self.inner.path_for(identity)
    }

    fn create(
        &self,
        participant: &str,
        condition: Condition,
    ) -> Result<OpenedRecord<FailAfterRows>, AcquisitionError> {
        let opened = self.inner.create(participant, condition)?;
        Ok(OpenedRecord {
            identity: opened.identity,
            path: opened.path,
            writer: FailAfterRows {
                file: opened.writer,
                rows: 0,
                limit: self.limit,
            },
        })
    }

    fn delete_latest(
        &self,
        participant: &str,
        condition: Condition,
    ) -> Result<TrialIdentity, AcquisitionError> {
        self.inner.delete_latest(participant, condition)
    }
}

/// Filesystem store whose records are written to `/dev/full`. The record file
/// is still created, so only the writes fail.
pub struct FullDiskStore {
    pub inner: TrialStore,
}

impl RecordStore for FullDiskStore {
    type Writer = <TrialStore as RecordStore>::Writer;

    fn next_sequence_number(
        &self,
        participant: &str,
        condition: Condition,
    ) -> Result<u32, AcquisitionError> {
        self.inner.next_sequence_number(participant, condition)
    }

    fn path_for(&self, identity: &TrialIdentity) -> PathBuf {
        self.inner.path_for(identity)
    }

    fn create(
        &self,
        participant: &str,
        condition: Condition,
    ) -> Result<OpenedRecord<Self::Writer>, AcquisitionError> {
        let opened = self.inner.create(participant, condition)?;
        let full = OpenOptions::new()
            .write(true)
            .open("/dev/full")
            .map_err(|source| AcquisitionError::Storage {
                path: PathBuf::from("/dev/full"),
                source,
            })?;
        Ok(OpenedRecord {
            writer: full,
            ..opened
        })
    }

    fn delete_latest(
        &self,
        participant: &str,
        condition: Condition,
    ) -> Result<TrialIdentity, AcquisitionError> {
        self.inner.delete_latest(participant, condition)
    }
}

/// Bus that, on every publication, counts the rows already in the record
/// file and remembers each count that trails the frames published so far.
pub struct DiskCheckingBus {
    pub record: PathBuf,
    pub published: usize,
    pub behind: Arc<Mutex<Vec<(usize, usize)>>>,
}

impl StreamBus for DiskCheckingBus {
    fn publish_samples(&mut self, _samples: &[f32]) {
        self.published += 1;
        let on_disk = fs::read_to_string(&self.record)
            .map(|rows| rows.lines().count())
            .unwrap_or(0);
        if on_disk < self.published {
            self.behind.lock().unwrap().push((self.published, on_disk));
        }
    }

    fn publish_marker(&mut self, _event_code: i32) {}
}
