pub mod bus;
pub mod config;
pub mod console;
pub mod controller;
pub mod session;
pub mod sink;
pub mod store;
pub mod timeline;

pub use bus::{BusMessage, ChannelBus, NullBus, StreamBus};
pub use config::{ExperimentConfig, MarkerMode, Protocol, ProtocolStep, RecordLayout};
pub use console::{ConsoleEvent, ConsoleSender};
pub use controller::SessionController;
pub use session::{
    AcquisitionSession, SessionOutcome, SessionSettings, SessionWorker, SpawnError, StopSignal,
    TrialSummary, WORKER_NAME,
};
pub use sink::{FrameSink, TrialRecord, format_row};
pub use store::{OpenedRecord, ParticipantLock, RecordStore, TrialStore, validate_participant};
pub use timeline::{PhaseTimeline, Phases};
