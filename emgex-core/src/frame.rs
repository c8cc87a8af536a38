/// One multichannel sample set captured by a single device read.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channels: Vec<f32>,
    /// Marker of the phase during which the frame was captured.
    pub event_code: i32,
    /// Position within the trial, gapless from 0.
    pub sequence_index: u64,
}

impl Frame {
    pub fn new(channels: Vec<f32>, event_code: i32, sequence_index: u64) -> Self {
        Self {
            channels,
            event_code,
            sequence_index,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
