pub mod error;
pub mod frame;
pub mod phase;
pub mod trial;

pub use error::AcquisitionError;
pub use frame::Frame;
pub use phase::{Intensity, PhaseKind, PhaseSpec};
pub use trial::{AtomicSessionState, Condition, SessionState, TrialIdentity};
