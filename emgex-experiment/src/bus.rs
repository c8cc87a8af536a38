use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::trace;

/// Real-time outlet for external consumers: a high-rate sample channel and a
/// low-rate integer marker channel. Publishing never blocks acquisition.
pub trait StreamBus: Send + 'static {
    fn publish_samples(&mut self, samples: &[f32]);
    fn publish_marker(&mut self, event_code: i32);
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Samples(Vec<f32>),
    Marker(i32),
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBus;

impl StreamBus for NullBus {
    fn publish_samples(&mut self, _samples: &[f32]) {}
    fn publish_marker(&mut self, _event_code: i32) {}
}

/// In-process bus backed by a crossbeam channel. When a bounded channel is
/// full the message is dropped from the bus instead of stalling acquisition.
#[derive(Debug, Clone)]
pub struct ChannelBus {
    tx: Sender<BusMessage>,
    dropped: u64,
}

impl ChannelBus {
    pub fn bounded(capacity: usize) -> (Self, Receiver<BusMessage>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx, dropped: 0 }, rx)
    }

    pub fn unbounded() -> (Self, Receiver<BusMessage>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx, dropped: 0 }, rx)
    }

    /// Messages discarded because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl StreamBus for ChannelBus {
    fn publish_samples(&mut self, samples: &[f32]) {
        self.offer(BusMessage::Samples(samples.to_vec()));
    }

    fn publish_marker(&mut self, event_code: i32) {
        self.offer(BusMessage::Marker(event_code));
    }
}

impl ChannelBus {
    fn offer(&mut self, message: BusMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                trace!(dropped = self.dropped, "bus full, message dropped");
            }
            // A departed subscriber is not an acquisition failure.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
