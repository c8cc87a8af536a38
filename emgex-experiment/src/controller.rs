use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use emgex_core::{AcquisitionError, AtomicSessionState, Condition, SessionState, TrialIdentity};
use emgex_device::{ConnectedDevice, DeviceDriver, DeviceGateway};
use emgex_timing::Timer;
use tracing::{error, info, warn};

use crate::bus::StreamBus;
use crate::config::ExperimentConfig;
use crate::console::{ConsoleEvent, ConsoleSender};
use crate::session::{
    AcquisitionSession, SessionSettings, SessionWorker, SpawnError, StopSignal, TrialSummary,
};
use crate::store::{RecordStore, validate_participant};
use crate::timeline::PhaseTimeline;

type Worker<D, B> = SessionWorker<<D as DeviceDriver>::Device, B>;
type Session<S, D, B, T> =
    AcquisitionSession<<D as DeviceDriver>::Device, <S as RecordStore>::Writer, B, T>;

/// Operator-facing entry point. Starts at most one session at a time, keeps
/// the connected device and the bus between sessions, and guards record
/// deletion while a session is active.
///
/// Every accepted [`start`](Self::start) builds a fresh
/// [`AcquisitionSession`] on its own worker thread; nothing of a previous
/// session is reused except the device connection.
pub struct SessionController<S, D, B, T>
where
    S: RecordStore,
    D: DeviceDriver,
    B: StreamBus,
    T: Timer<Timestamp = u64>,
{
    config: ExperimentConfig,
    store: S,
    gateway: DeviceGateway<D>,
    timer: T,
    device: Option<ConnectedDevice<D::Device>>,
    bus: Option<B>,
    state: Arc<AtomicSessionState>,
    stop: StopSignal,
    events_tx: Sender<ConsoleEvent>,
    events_rx: Receiver<ConsoleEvent>,
    worker: Option<Worker<D, B>>,
    last_summary: Option<TrialSummary>,
}

impl<S, D, B, T> SessionController<S, D, B, T>
where
    S: RecordStore,
    D: DeviceDriver,
    B: StreamBus,
    T: Timer<Timestamp = u64>,
{
    pub fn new(
        config: ExperimentConfig,
        store: S,
        gateway: DeviceGateway<D>,
        bus: B,
        timer: T,
    ) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            store,
            gateway,
            timer,
            device: None,
            bus: Some(bus),
            state: Arc::new(AtomicSessionState::default()),
            stop: StopSignal::new(),
            events_tx,
            events_rx,
            worker: None,
            last_summary: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    /// Console events of every session run by this controller.
    pub fn events(&self) -> Receiver<ConsoleEvent> {
        self.events_rx.clone()
    }

    /// Handle that stops the running session from any thread.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn last_summary(&self) -> Option<&TrialSummary> {
        self.last_summary.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    pub fn timeline_for(&self, condition: Condition) -> Result<PhaseTimeline, AcquisitionError> {
        PhaseTimeline::new(&self.config.protocol, condition, self.config.condition_names())
    }

    /// Connects to the first available device unless one is already held.
    /// Returns the serial of the connected device.
    pub fn connect(&mut self) -> Result<&str, AcquisitionError> {
        self.reap()?;
        if self.worker.is_some() {
            return Err(AcquisitionError::ConcurrentStartRejected);
        }
        let device = match self.device.take() {
            Some(device) => device,
            None => self.gateway.connect_first()?,
        };
        Ok(self.device.insert(device).serial())
    }

    /// Releases the held device. Not possible while a session owns it.
    pub fn disconnect(&mut self) -> Result<(), AcquisitionError> {
        self.reap()?;
        if self.worker.is_some() {
            return Err(AcquisitionError::ConcurrentStartRejected);
        }
        if let Some(device) = self.device.take() {
            info!(serial = device.serial(), "device released");
        }
        Ok(())
    }

    /// Starts a trial for the participant and condition.
    ///
    /// The device is connected first, then the record is created, so a
    /// missing device never leaves an empty record behind. Input errors are
    /// reported without touching the session state.
    pub fn start(
        &mut self,
        participant: &str,
        condition: Condition,
    ) -> Result<TrialIdentity, AcquisitionError> {
        self.reap()?;
        if self.worker.is_some() || self.state().is_active() {
            warn!("start rejected, a session is already active");
            return Err(AcquisitionError::ConcurrentStartRejected);
        }
        let participant = validate_participant(participant)?;
        let timeline = self.timeline_for(condition)?;
        if self.bus.is_none() {
            return Err(self.fail(AcquisitionError::Worker(
                "stream bus was lost with a crashed session".into(),
            )));
        }

        if self.device.is_none() {
            self.set_state(SessionState::AwaitingDevice, Some("Connecting to device".into()));
            match self.gateway.connect_first() {
                Ok(device) => self.device = Some(device),
                Err(e) => return Err(self.fail(e)),
            }
        }

        let record = match self.store.create(participant, condition) {
            Ok(record) => record,
            Err(e) => return Err(self.fail(e)),
        };
        let identity = record.identity.clone();

        let (Some(device), Some(bus)) = (self.device.take(), self.bus.take()) else {
            return Err(self.fail(AcquisitionError::Worker("device or bus unavailable".into())));
        };
        self.stop.clear();
        self.state.store(SessionState::Running);
        let session = AcquisitionSession::new(
            timeline,
            device,
            record,
            bus,
            self.timer.clone(),
            SessionSettings::from(&self.config),
            Arc::clone(&self.state),
            self.stop.clone(),
            ConsoleSender::new(self.events_tx.clone()),
        );
        match session.spawn() {
            Ok(handle) => {
                info!(trial = %identity, "session started");
                self.worker = Some(handle);
                Ok(identity)
            }
            Err(refused) => Err(self.recover(refused)),
        }
    }

    /// Takes back the device and bus of a session whose worker never started.
    fn recover(&mut self, refused: SpawnError<Session<S, D, B, T>>) -> AcquisitionError {
        let SpawnError { error, session } = refused;
        if let Some(session) = session {
            let (device, record, bus) = session.into_parts();
            warn!(path = %record.path.display(), "session never ran, record left empty");
            self.device = Some(device);
            self.bus = Some(bus);
        }
        self.fail(AcquisitionError::Worker(format!(
            "cannot spawn session worker: {error}"
        )))
    }

    /// Asks the running session to stop. Returns false when none is running.
    pub fn stop(&self) -> bool {
        if self.worker.is_none() {
            return false;
        }
        info!("stop requested");
        self.stop.request();
        true
    }

    /// Blocks until the current session ends and returns its summary, or
    /// `None` when no session was started since the last wait.
    pub fn wait(&mut self) -> Result<Option<TrialSummary>, AcquisitionError> {
        let Some(handle) = self.worker.take() else {
            return Ok(None);
        };
        self.join(handle).map(Some)
    }

    /// Deletes the newest record of the pair. Refused while a session runs.
    pub fn delete_latest(
        &mut self,
        participant: &str,
        condition: Condition,
    ) -> Result<TrialIdentity, AcquisitionError> {
        self.reap()?;
        if self.worker.is_some() || self.state().is_active() {
            return Err(AcquisitionError::DeletionBlocked);
        }
        self.store.delete_latest(participant, condition)
    }

    /// Collects a worker that already finished.
    fn reap(&mut self) -> Result<(), AcquisitionError> {
        match self.worker.take() {
            Some(handle) if handle.is_finished() => self.join(handle).map(drop),
            other => {
                self.worker = other;
                Ok(())
            }
        }
    }

    fn join(&mut self, handle: Worker<D, B>) -> Result<TrialSummary, AcquisitionError> {
        match handle.join() {
            Ok(Some(outcome)) => {
                self.device = outcome.device;
                self.bus = Some(outcome.bus);
                self.last_summary = Some(outcome.summary.clone());
                Ok(outcome.summary)
            }
            Ok(None) => Err(self.fail(AcquisitionError::Worker(
                "session worker started without its session".into(),
            ))),
            Err(_) => {
                error!("session worker panicked");
                Err(self.fail(AcquisitionError::Worker("session worker panicked".into())))
            }
        }
    }

    fn set_state(&self, state: SessionState, message: Option<String>) {
        self.state.store(state);
        ConsoleSender::new(self.events_tx.clone()).status(state, message);
    }

    fn fail(&self, e: AcquisitionError) -> AcquisitionError {
        warn!(error = %e, "session could not run");
        self.set_state(SessionState::Failed, Some(e.to_string()));
        e
    }
}

impl<S, D, B, T> Drop for SessionController<S, D, B, T>
where
    S: RecordStore,
    D: DeviceDriver,
    B: StreamBus,
    T: Timer<Timestamp = u64>,
{
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.stop.request();
            let _ = handle.join();
        }
    }
}
