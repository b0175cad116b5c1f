mod kv;
pub use kv::KeyValue;

mod unit_env;
pub use unit_env::UnitEnv;

mod job_status;
pub use job_status::JobStatus;

mod batch_phase;
pub use batch_phase::{BatchPhase, PhaseError};

mod prediction;
pub use prediction::{Prediction, PredictionError};

/// Position of an item inside the batch it was submitted with.
///
/// Stable for the lifetime of a batch; used to correlate completions and failures with the
/// item that produced them.
pub type JobIndex = usize;
