use crossbeam_channel::Sender;
use emgex_core::SessionState;

/// Notifications for the operator console, emitted by the session worker and
/// the controller. The console renders them; it never drives timing.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleEvent {
    StatusChanged {
        state: SessionState,
        message: Option<String>,
    },
    /// Lead-in tick before a phase starts.
    Countdown {
        prompt: String,
        seconds: u32,
    },
    /// A phase started, or its whole seconds remaining went down.
    PhaseChanged {
        label: String,
        prompt: String,
        seconds_remaining: u32,
        index: usize,
        phases_left: usize,
    },
}

/// Sending half handed to whoever produces console events. A console that
/// went away does not affect acquisition.
#[derive(Debug, Clone)]
pub struct ConsoleSender(Sender<ConsoleEvent>);

impl ConsoleSender {
    pub fn new(tx: Sender<ConsoleEvent>) -> Self {
        Self(tx)
    }

    pub fn send(&self, event: ConsoleEvent) {
        let _ = self.0.send(event);
    }

    pub fn status(&self, state: SessionState, message: Option<String>) {
        self.send(ConsoleEvent::StatusChanged { state, message });
    }
}
