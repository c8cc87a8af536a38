use std::fmt::Write as _;
use std::io::Write;
use std::path::PathBuf;

use emgex_core::{AcquisitionError, Frame};
use tracing::{debug, warn};

use crate::bus::StreamBus;
use crate::config::{MarkerMode, RecordLayout};
use crate::store::OpenedRecord;

/// Append-only delimited text record of one trial.
///
/// Each row is formatted completely before it is handed to the writer in a
/// single `write_all`, so a failing writer never receives half a row from us.
/// A row counts once the writer took it; pair it with an unbuffered writer
/// when counted rows must be on disk. The writer is flushed on
/// [`TrialRecord::close`] and, best effort, on drop.
pub struct TrialRecord<W: Write> {
    path: PathBuf,
    writer: W,
    layout: RecordLayout,
    row: String,
    rows: u64,
    closed: bool,
}

impl<W: Write> TrialRecord<W> {
    pub fn new(path: impl Into<PathBuf>, writer: W, layout: RecordLayout) -> Self {
        Self {
            path: path.into(),
            writer,
            layout,
            row: String::with_capacity(128),
            rows: 0,
            closed: false,
        }
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn append(&mut self, frame: &Frame) -> Result<(), AcquisitionError> {
        self.row.clear();
        format_row(&mut self.row, frame, &self.layout);
        self.writer
            .write_all(self.row.as_bytes())
            .map_err(|source| AcquisitionError::FileWriteError {
                path: self.path.clone(),
                source,
            })?;
        self.rows += 1;
        Ok(())
    }

    /// Flushes buffered rows and returns how many were written.
    pub fn close(mut self) -> Result<u64, AcquisitionError> {
        self.closed = true;
        self.writer
            .flush()
            .map_err(|source| AcquisitionError::FileWriteError {
                path: self.path.clone(),
                source,
            })?;
        debug!(path = %self.path.display(), rows = self.rows, "trial record closed");
        Ok(self.rows)
    }
}

impl<W: Write> Drop for TrialRecord<W> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.writer.flush() {
            warn!(
                path = %self.path.display(),
                error = %e,
                "failed to flush trial record on release"
            );
        }
    }
}

/// `[index,]ch0,...,chN[,event_code]\n`
pub fn format_row(row: &mut String, frame: &Frame, layout: &RecordLayout) {
    let start = row.len();
    let separate = |row: &mut String| {
        if row.len() > start {
            row.push(',');
        }
    };
    if layout.index_column {
        let _ = write!(row, "{}", frame.sequence_index);
    }
    for value in &frame.channels {
        separate(&mut *row);
        let _ = write!(row, "{:.*}", layout.decimal_places, value);
    }
    if layout.event_column {
        separate(&mut *row);
        let _ = write!(row, "{}", frame.event_code);
    }
    row.push('\n');
}

/// Persists accepted frames to the trial record and forwards them to the bus.
///
/// Frames must arrive with gapless, increasing `sequence_index` starting at 0.
/// A frame is published only after it has been written.
pub struct FrameSink<'a, W: Write, B: StreamBus> {
    record: TrialRecord<W>,
    bus: &'a mut B,
    marker_mode: MarkerMode,
    next_index: u64,
}

impl<'a, W: Write, B: StreamBus> FrameSink<'a, W, B> {
    pub fn open(
        opened: OpenedRecord<W>,
        layout: RecordLayout,
        marker_mode: MarkerMode,
        bus: &'a mut B,
    ) -> Self {
        Self {
            record: TrialRecord::new(opened.path, opened.writer, layout),
            bus,
            marker_mode,
            next_index: 0,
        }
    }

    pub fn frames_accepted(&self) -> u64 {
        self.next_index
    }

    /// Index the next frame must carry.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn accept(&mut self, frame: &Frame) -> Result<(), AcquisitionError> {
        if frame.sequence_index != self.next_index {
            return Err(AcquisitionError::OutOfOrderFrame {
                expected: self.next_index,
                got: frame.sequence_index,
            });
        }
        self.record.append(frame)?;
        self.bus.publish_samples(&frame.channels);
        if self.marker_mode == MarkerMode::PerFrame {
            self.bus.publish_marker(frame.event_code);
        }
        self.next_index += 1;
        Ok(())
    }

    /// Announces a phase start on the marker channel when markers are per phase.
    pub fn mark_phase(&mut self, event_code: i32) {
        if self.marker_mode == MarkerMode::PerPhase {
            self.bus.publish_marker(event_code);
        }
    }

    pub fn close(self) -> Result<u64, AcquisitionError> {
        self.record.close()
    }
}
