//! Capture records and the sources that produce them. The replayer only depends on the
//! `CaptureSource` trait; the JSON-lines reader is the format the command line consumes.
pub mod observation;
pub mod progress;
pub mod source;

pub use observation::{CaptureObservation, CaptureRecord, ChunkPosition, ObservationKind, RecordKey};
pub use progress::ProgressAnnotatingSource;
pub use source::{CaptureError, CaptureSource, JsonLinesCaptureSource, VecCaptureSource};
