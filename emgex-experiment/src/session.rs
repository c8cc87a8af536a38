use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use emgex_core::{
    AcquisitionError, AtomicSessionState, Frame, PhaseSpec, SessionState, TrialIdentity,
};
use emgex_device::{ConnectedDevice, DriverDevice};
use emgex_timing::{ReadStats, Timer};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::bus::StreamBus;
use crate::config::{ExperimentConfig, MarkerMode, RecordLayout};
use crate::console::{ConsoleEvent, ConsoleSender};
use crate::sink::FrameSink;
use crate::store::OpenedRecord;
use crate::timeline::PhaseTimeline;

pub const WORKER_NAME: &str = "emgex-session";

/// Join handle of a session worker. `None` only if the worker never got its
/// session.
pub type SessionWorker<Dev, B> = JoinHandle<Option<SessionOutcome<Dev, B>>>;

/// The worker thread could not be started. The session comes back unrun so
/// its device and bus are not lost.
pub struct SpawnError<S> {
    pub error: io::Error,
    pub session: Option<S>,
}

/// Cooperative cancellation flag shared between the operator and the worker.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-session knobs taken from [`ExperimentConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub lead_in: u32,
    pub frames_per_read: usize,
    pub layout: RecordLayout,
    pub marker_mode: MarkerMode,
}

impl From<&ExperimentConfig> for SessionSettings {
    fn from(config: &ExperimentConfig) -> Self {
        Self {
            lead_in: config.lead_in_secs,
            frames_per_read: config.frames_per_read.max(1),
            layout: config.record.clone(),
            marker_mode: config.marker_mode,
        }
    }
}

/// What happened to one trial.
#[derive(Debug, Clone, Serialize)]
pub struct TrialSummary {
    pub identity: TrialIdentity,
    pub path: PathBuf,
    pub state: SessionState,
    /// Ended early on an operator stop.
    pub cancelled: bool,
    pub frames_written: u64,
    pub phases_completed: usize,
    pub phases_total: usize,
    pub running_elapsed_ms: u64,
    pub read_stats: ReadStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything the worker hands back when it is done. The device is `None`
/// after a device fault so the operator has to reconnect.
pub struct SessionOutcome<Dev: DriverDevice, B> {
    pub summary: TrialSummary,
    pub failure: Option<AcquisitionError>,
    pub device: Option<ConnectedDevice<Dev>>,
    pub bus: B,
}

enum Ending {
    Exhausted,
    Cancelled,
}

#[derive(Default)]
struct Progress {
    phases_completed: usize,
}

/// One trial from first phase to closed record. Owns the device, the open
/// record and the bus for its whole lifetime; run it exactly once.
pub struct AcquisitionSession<Dev, W, B, T>
where
    Dev: DriverDevice,
    W: Write + Send + 'static,
    B: StreamBus,
    T: Timer<Timestamp = u64>,
{
    timeline: PhaseTimeline,
    device: ConnectedDevice<Dev>,
    record: OpenedRecord<W>,
    bus: B,
    timer: T,
    settings: SessionSettings,
    state: Arc<AtomicSessionState>,
    stop: StopSignal,
    console: ConsoleSender,
}

impl<Dev, W, B, T> AcquisitionSession<Dev, W, B, T>
where
    Dev: DriverDevice,
    W: Write + Send + 'static,
    B: StreamBus,
    T: Timer<Timestamp = u64>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timeline: PhaseTimeline,
        device: ConnectedDevice<Dev>,
        record: OpenedRecord<W>,
        bus: B,
        timer: T,
        settings: SessionSettings,
        state: Arc<AtomicSessionState>,
        stop: StopSignal,
        console: ConsoleSender,
    ) -> Self {
        Self {
            timeline,
            device,
            record,
            bus,
            timer,
            settings,
            state,
            stop,
            console,
        }
    }

    /// Runs the session on a dedicated worker thread.
    pub fn spawn(self) -> Result<SessionWorker<Dev, B>, SpawnError<Self>> {
        self.spawn_with(thread::Builder::new().name(WORKER_NAME.into()))
    }

    pub(crate) fn spawn_with(
        self,
        builder: thread::Builder,
    ) -> Result<SessionWorker<Dev, B>, SpawnError<Self>> {
        // The worker takes the session out of the slot; a refused spawn leaves it there.
        let slot = Arc::new(Mutex::new(Some(self)));
        let handoff = Arc::clone(&slot);
        let spawned = builder.spawn(move || {
            let session = handoff.lock().ok()?.take()?;
            Some(session.run())
        });
        match spawned {
            Ok(handle) => Ok(handle),
            Err(error) => {
                let session = slot.lock().ok().and_then(|mut session| session.take());
                Err(SpawnError { error, session })
            }
        }
    }

    /// Gives back what the session owns without running it.
    pub fn into_parts(self) -> (ConnectedDevice<Dev>, OpenedRecord<W>, B) {
        (self.device, self.record, self.bus)
    }

    /// Runs the whole trial on the calling thread.
    pub fn run(self) -> SessionOutcome<Dev, B> {
        let Self {
            timeline,
            mut device,
            record,
            mut bus,
            mut timer,
            settings,
            state,
            stop,
            console,
        } = self;

        let identity = record.identity.clone();
        let path = record.path.clone();
        let phases_total = timeline.len();
        let span = info_span!("session", trial = %identity);
        let _guard = span.enter();

        state.store(SessionState::Running);
        console.status(
            SessionState::Running,
            Some(format!("Recording to {}", path.display())),
        );
        info!(path = %path.display(), phases = phases_total, "session running");

        let running_since = timer.now();
        let mut progress = Progress::default();
        let mut sink = FrameSink::open(
            record,
            settings.layout.clone(),
            settings.marker_mode,
            &mut bus,
        );

        let mut capture = Capture {
            device: &mut device,
            sink: &mut sink,
            timer: &mut timer,
            settings: &settings,
            stop: &stop,
            console: &console,
        };
        let captured = capture.phases(timeline, &mut progress);

        if let Err(e) = device.stop() {
            warn!(error = %e, "failed to stop acquisition at end of session");
        }
        let running_elapsed = timer.elapsed(running_since);
        let frames_written = sink.frames_accepted();

        let result = match captured {
            Ok(ending) => {
                state.store(SessionState::Stopping);
                console.status(SessionState::Stopping, None);
                sink.close().map(|_| ending)
            }
            Err(e) => {
                drop(sink);
                Err(e)
            }
        };

        let (final_state, cancelled, failure) = match result {
            Ok(ending) => {
                let cancelled = matches!(ending, Ending::Cancelled);
                info!(
                    frames = frames_written,
                    phases = progress.phases_completed,
                    cancelled,
                    "session completed"
                );
                (SessionState::Completed, cancelled, None)
            }
            Err(e) => {
                error!(error = %e, frames = frames_written, "session failed, partial record kept");
                (SessionState::Failed, false, Some(e))
            }
        };

        let message = match (&failure, cancelled) {
            (Some(e), _) => format!("{e}"),
            (None, true) => format!(
                "Stopped after {} of {} phases",
                progress.phases_completed, phases_total
            ),
            (None, false) => "Data collection completed".to_string(),
        };
        let summary = TrialSummary {
            identity,
            path,
            state: final_state,
            cancelled,
            frames_written,
            phases_completed: progress.phases_completed,
            phases_total,
            running_elapsed_ms: running_elapsed.as_millis() as u64,
            read_stats: timer.read_stats(),
            error: failure.as_ref().map(ToString::to_string),
        };

        state.store(final_state);
        console.status(final_state, Some(message));

        let device = match &failure {
            Some(e) if e.is_device_fault() => {
                debug!("releasing device after fault");
                None
            }
            _ => Some(device),
        };
        SessionOutcome {
            summary,
            failure,
            device,
            bus,
        }
    }
}

/// Borrowed view the phase loop works on.
struct Capture<'s, 'b, Dev, W, B, T>
where
    Dev: DriverDevice,
    W: Write,
    B: StreamBus,
    T: Timer<Timestamp = u64>,
{
    device: &'s mut ConnectedDevice<Dev>,
    sink: &'s mut FrameSink<'b, W, B>,
    timer: &'s mut T,
    settings: &'s SessionSettings,
    stop: &'s StopSignal,
    console: &'s ConsoleSender,
}

impl<Dev, W, B, T> Capture<'_, '_, Dev, W, B, T>
where
    Dev: DriverDevice,
    W: Write,
    B: StreamBus,
    T: Timer<Timestamp = u64>,
{
    fn phases(
        &mut self,
        timeline: PhaseTimeline,
        progress: &mut Progress,
    ) -> Result<Ending, AcquisitionError> {
        for (index, (phase, phases_left)) in timeline.into_iter().enumerate() {
            if self.stop.is_requested() || !self.lead_in(&phase) {
                info!(phase = index, "stop requested, skipping remaining phases");
                return Ok(Ending::Cancelled);
            }
            let cancelled = self.phase(&phase, index, phases_left)?;
            if cancelled {
                return Ok(Ending::Cancelled);
            }
            progress.phases_completed += 1;
        }
        Ok(Ending::Exhausted)
    }

    /// Counts down before a phase. Returns false when stopped meanwhile.
    fn lead_in(&mut self, phase: &PhaseSpec) -> bool {
        for seconds in (1..=self.settings.lead_in).rev() {
            if self.stop.is_requested() {
                return false;
            }
            self.console.send(ConsoleEvent::Countdown {
                prompt: phase.prompt(),
                seconds,
            });
            self.timer.sleep(Duration::from_secs(1));
        }
        !self.stop.is_requested()
    }

    /// Captures one phase. Acquisition runs only inside the phase window so
    /// no lead-in samples reach the record. Returns true when stopped early.
    fn phase(
        &mut self,
        phase: &PhaseSpec,
        index: usize,
        phases_left: usize,
    ) -> Result<bool, AcquisitionError> {
        debug!(phase = index, label = %phase.label, code = phase.event_code, "phase started");
        self.announce(phase, index, phases_left, phase.duration_secs);
        self.sink.mark_phase(phase.event_code);
        self.device.start()?;

        let polled = self.poll(phase, index, phases_left);
        let stopped = self.device.stop();
        let cancelled = polled?;
        stopped?;
        Ok(cancelled)
    }

    fn poll(
        &mut self,
        phase: &PhaseSpec,
        index: usize,
        phases_left: usize,
    ) -> Result<bool, AcquisitionError> {
        let duration = phase.duration();
        let phase_start = self.timer.now();
        let mut announced = phase.duration_secs;

        loop {
            let elapsed = self.timer.elapsed(phase_start);
            if elapsed >= duration {
                return Ok(false);
            }
            let left = duration - elapsed;
            let seconds_left = (left.as_secs() + u64::from(left.subsec_nanos() > 0)) as u32;
            if seconds_left < announced {
                announced = seconds_left;
                self.announce(phase, index, phases_left, seconds_left);
            }
            if self.stop.is_requested() {
                return Ok(true);
            }

            let read_start = self.timer.now();
            let frames = self.device.read_frames(self.settings.frames_per_read)?;
            let read_time = self.timer.elapsed(read_start);
            self.timer.record_read(read_time);

            for channels in frames {
                let frame = Frame::new(channels, phase.event_code, self.sink.next_index());
                self.sink.accept(&frame)?;
            }
        }
    }

    fn announce(&self, phase: &PhaseSpec, index: usize, phases_left: usize, seconds: u32) {
        self.console.send(ConsoleEvent::PhaseChanged {
            label: phase.label.clone(),
            prompt: phase.prompt(),
            seconds_remaining: seconds,
            index,
            phases_left,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::NullBus;
    use crate::config::{Protocol, ProtocolStep};
    use emgex_core::{Condition, Intensity};
    use emgex_device::{DeviceGateway, SimulatedDevice, SimulatedDriver};
    use emgex_timing::VirtualTimer;

    type TestSession =
        AcquisitionSession<SimulatedDevice<VirtualTimer>, Vec<u8>, NullBus, VirtualTimer>;

    fn session(
        protocol: &Protocol,
        lead_in: u32,
        timer: &VirtualTimer,
        stop: StopSignal,
    ) -> (TestSession, crossbeam_channel::Receiver<ConsoleEvent>) {
        let driver = SimulatedDriver::new(timer.clone())
            .with_sample_rate(10)
            .with_channels(2);
        let gateway = DeviceGateway::new(driver);
        let device = gateway.connect_first().unwrap();
        let timeline = PhaseTimeline::new(protocol, Condition::A, ["Smile", "Frown"]).unwrap();
        let record = OpenedRecord {
            identity: TrialIdentity::new("P1", Condition::A, 1),
            path: PathBuf::from("P1_A_1.csv"),
            writer: Vec::new(),
        };
        let (tx, rx) = crossbeam_channel::unbounded();
        let settings = SessionSettings {
            lead_in,
            frames_per_read: 1,
            layout: RecordLayout::default(),
            marker_mode: MarkerMode::PerFrame,
        };
        let session = AcquisitionSession::new(
            timeline,
            device,
            record,
            NullBus,
            timer.clone(),
            settings,
            Arc::new(AtomicSessionState::default()),
            stop,
            ConsoleSender::new(tx),
        );
        (session, rx)
    }

    fn two_phases() -> Protocol {
        Protocol {
            name: "two".into(),
            steps: vec![
                ProtocolStep::rest(2),
                ProtocolStep::expression(Intensity::Weak, 1),
            ],
        }
    }

    #[test]
    fn full_run_counts_frames_and_phases() {
        let timer = VirtualTimer::new();
        let (session, _rx) = session(&two_phases(), 0, &timer, StopSignal::new());
        let outcome = session.run();
        assert_eq!(outcome.summary.state, SessionState::Completed);
        assert_eq!(outcome.summary.frames_written, 30);
        assert_eq!(outcome.summary.phases_completed, 2);
        assert_eq!(outcome.summary.running_elapsed_ms, 3000);
        assert_eq!(outcome.summary.read_stats.reads, 30);
        assert!(!outcome.summary.cancelled);
        assert!(outcome.device.is_some_and(|d| !d.is_acquiring()));
    }

    #[test]
    fn lead_in_counts_down_then_announces_each_second() {
        let timer = VirtualTimer::new();
        let (session, rx) = session(&two_phases(), 2, &timer, StopSignal::new());
        session.run();
        let events: Vec<ConsoleEvent> = rx.try_iter().collect();

        let countdown: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                ConsoleEvent::Countdown { seconds, .. } => Some(*seconds),
                _ => None,
            })
            .collect();
        assert_eq!(countdown, vec![2, 1, 2, 1]);

        let first_phase: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                ConsoleEvent::PhaseChanged {
                    index: 0,
                    seconds_remaining,
                    ..
                } => Some(*seconds_remaining),
                _ => None,
            })
            .collect();
        assert_eq!(first_phase, vec![2, 1]);
        assert_eq!(
            events.last(),
            Some(&ConsoleEvent::StatusChanged {
                state: SessionState::Completed,
                message: Some("Data collection completed".into()),
            })
        );
    }

    #[test]
    fn stop_before_start_records_nothing() {
        let timer = VirtualTimer::new();
        let stop = StopSignal::new();
        stop.request();
        let (session, _rx) = session(&two_phases(), 3, &timer, stop);
        let outcome = session.run();
        assert_eq!(outcome.summary.state, SessionState::Completed);
        assert!(outcome.summary.cancelled);
        assert_eq!(outcome.summary.frames_written, 0);
        assert_eq!(outcome.summary.phases_completed, 0);
    }

    #[test]
    fn spawned_worker_returns_the_outcome() {
        let timer = VirtualTimer::new();
        let (session, _rx) = session(&two_phases(), 0, &timer, StopSignal::new());
        let handle = session.spawn().ok().unwrap();
        assert_eq!(handle.thread().name(), Some(WORKER_NAME));
        let outcome = handle.join().unwrap().unwrap();
        assert_eq!(outcome.summary.frames_written, 30);
    }

    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    #[test]
    fn refused_spawn_hands_the_session_back() {
        let timer = VirtualTimer::new();
        let (session, _rx) = session(&two_phases(), 0, &timer, StopSignal::new());
        let impossible_stack = thread::Builder::new().stack_size(1 << 62);
        let Err(refused) = session.spawn_with(impossible_stack) else {
            panic!("a 4 EiB stack cannot be mapped");
        };
        let (device, record, _bus) = refused.session.unwrap().into_parts();
        assert_eq!(device.serial(), "UN-SIM-0001");
        assert!(!device.is_acquiring());
        assert_eq!(record.identity.sequence, 1);
        assert!(record.writer.is_empty());
    }
}
