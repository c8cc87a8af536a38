use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use emgex_core::{AcquisitionError, Condition, TrialIdentity};
use tracing::{debug, info, warn};

/// Attempts made to claim a fresh sequence number when another writer races us.
const CREATE_ATTEMPTS: u32 = 64;

/// Marks a participant directory as being recorded into.
const LOCK_FILE: &str = ".recording.lock";

/// A freshly created, exclusively owned trial record.
pub struct OpenedRecord<W> {
    pub identity: TrialIdentity,
    pub path: PathBuf,
    pub writer: W,
}

/// Persistence of trial records keyed by participant and condition.
pub trait RecordStore {
    type Writer: Write + Send + 'static;

    /// One past the highest sequence number on disk, or 1 when there is none.
    fn next_sequence_number(
        &self,
        participant: &str,
        condition: Condition,
    ) -> Result<u32, AcquisitionError>;

    fn path_for(&self, identity: &TrialIdentity) -> PathBuf;

    /// Creates the next record. The returned path did not exist before.
    fn create(
        &self,
        participant: &str,
        condition: Condition,
    ) -> Result<OpenedRecord<Self::Writer>, AcquisitionError>;

    /// Removes the highest-numbered record of the pair and returns its identity.
    fn delete_latest(
        &self,
        participant: &str,
        condition: Condition,
    ) -> Result<TrialIdentity, AcquisitionError>;
}

/// Filesystem store: `<root>/<participant>/<participant>_<condition>_<n>.csv`.
#[derive(Debug, Clone)]
pub struct TrialStore {
    root: PathBuf,
    extension: String,
}

impl TrialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: "csv".into(),
        }
    }

    pub fn participant_dir(&self, participant: &str) -> PathBuf {
        self.root.join(participant)
    }

    /// Existing records of the pair, ordered by sequence number. Files that do
    /// not follow the naming scheme are ignored.
    pub fn records(
        &self,
        participant: &str,
        condition: Condition,
    ) -> Result<Vec<(TrialIdentity, PathBuf)>, AcquisitionError> {
        let participant = validate_participant(participant)?;
        let dir = self.participant_dir(participant);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(AcquisitionError::Storage { path: dir, source }),
        };

        let prefix = TrialIdentity::prefix(participant, condition);
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| AcquisitionError::Storage {
                path: dir.clone(),
                source,
            })?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match parse_sequence(name, &prefix, &self.extension) {
                Some(sequence) => records.push((
                    TrialIdentity::new(participant, condition, sequence),
                    entry.path(),
                )),
                None if name.starts_with(&prefix) => {
                    debug!(file = name, "ignoring record with malformed sequence number")
                }
                None => {}
            }
        }
        records.sort_by_key(|(identity, _)| identity.sequence);
        Ok(records)
    }

    /// Claims the participant directory for one recording.
    ///
    /// Other processes sharing the data directory see the lock: a second
    /// claim is rejected and [`RecordStore::delete_latest`] is blocked until
    /// the returned guard is dropped.
    pub fn lock_participant(
        &self,
        participant: &str,
    ) -> Result<ParticipantLock, AcquisitionError> {
        let participant = validate_participant(participant)?;
        let dir = self.participant_dir(participant);
        fs::create_dir_all(&dir).map_err(|source| AcquisitionError::Storage {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!(path = %path.display(), "participant is already being recorded");
                return Err(AcquisitionError::ConcurrentStartRejected);
            }
            Err(source) => return Err(AcquisitionError::Storage { path, source }),
        };
        if let Err(source) = writeln!(file, "{}", std::process::id()) {
            let _ = fs::remove_file(&path);
            return Err(AcquisitionError::Storage { path, source });
        }
        debug!(path = %path.display(), "participant locked");
        Ok(ParticipantLock { path })
    }

    fn is_locked(&self, participant: &str) -> bool {
        self.participant_dir(participant).join(LOCK_FILE).exists()
    }
}

/// Held while a participant is recorded. Removes the lock file on drop.
#[derive(Debug)]
pub struct ParticipantLock {
    path: PathBuf,
}

impl ParticipantLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ParticipantLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "participant unlocked"),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to remove participant lock")
            }
        }
    }
}

impl RecordStore for TrialStore {
    /// Unbuffered: a row is on disk, or has failed, before the sink counts it.
    type Writer = File;

    fn next_sequence_number(
        &self,
        participant: &str,
        condition: Condition,
    ) -> Result<u32, AcquisitionError> {
        Ok(self
            .records(participant, condition)?
            .last()
            .map_or(1, |(identity, _)| identity.sequence.saturating_add(1)))
    }

    fn path_for(&self, identity: &TrialIdentity) -> PathBuf {
        self.participant_dir(&identity.participant)
            .join(format!("{}.{}", identity.file_stem(), self.extension))
    }

    fn create(
        &self,
        participant: &str,
        condition: Condition,
    ) -> Result<OpenedRecord<Self::Writer>, AcquisitionError> {
        let participant = validate_participant(participant)?;
        let dir = self.participant_dir(participant);
        fs::create_dir_all(&dir).map_err(|source| AcquisitionError::Storage {
            path: dir.clone(),
            source,
        })?;

        let mut sequence = self.next_sequence_number(participant, condition)?;
        for _ in 0..CREATE_ATTEMPTS {
            let identity = TrialIdentity::new(participant, condition, sequence);
            let path = self.path_for(&identity);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    info!(trial = %identity, path = %path.display(), "trial record created");
                    return Ok(OpenedRecord {
                        identity,
                        path,
                        writer: file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    warn!(trial = %identity, "record appeared concurrently, trying next number");
                    sequence += 1;
                }
                Err(source) => return Err(AcquisitionError::FileWriteError { path, source }),
            }
        }
        Err(AcquisitionError::Storage {
            path: dir,
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                "could not claim a free trial number",
            ),
        })
    }

    fn delete_latest(
        &self,
        participant: &str,
        condition: Condition,
    ) -> Result<TrialIdentity, AcquisitionError> {
        let label = validate_participant(participant)?;
        if self.is_locked(label) {
            warn!(participant = label, "deletion refused, participant is being recorded");
            return Err(AcquisitionError::DeletionBlocked);
        }
        let Some((identity, path)) = self.records(label, condition)?.pop() else {
            return Err(AcquisitionError::TrialNotFound {
                participant: label.to_string(),
                condition,
            });
        };
        fs::remove_file(&path).map_err(|source| AcquisitionError::Storage {
            path: path.clone(),
            source,
        })?;
        info!(trial = %identity, path = %path.display(), "trial record deleted");
        Ok(identity)
    }
}

/// Trims the label and rejects values that are empty or would escape the
/// data directory.
pub fn validate_participant(label: &str) -> Result<&str, AcquisitionError> {
    let label = label.trim();
    if label.is_empty() {
        return Err(AcquisitionError::InvalidInput(
            "participant label is required".into(),
        ));
    }
    if label == "."
        || label == ".."
        || label.contains(['/', '\\'])
        || label.contains(char::is_control)
    {
        return Err(AcquisitionError::InvalidInput(format!(
            "participant label '{label}' is not a valid directory name"
        )));
    }
    Ok(label)
}

fn parse_sequence(file_name: &str, prefix: &str, extension: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(extension)?.strip_suffix('.')?;
    let digits = stem.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|n| *n > 0)
}
