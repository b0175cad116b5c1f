use forge_core::UnitError;
use thiserror::Error;

pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("missing program")]
    MissingProgram,
    #[error("empty shell script")]
    EmptyScript,
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("cannot encode item: {0}")]
    Encode(String),
    #[error("cannot decode output: {0}")]
    Decode(String),
    #[error("output exceeds {limit} bytes")]
    OutputTooLarge { limit: usize },
    #[error("non-zero exit code: {code}")]
    NonZeroExit { code: i32, stderr: String },
    #[error("killed by signal {signal}")]
    KilledBySignal { signal: String },
    #[error("io error: {0}")]
    Io(String),
    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        ExecError::Io(e.to_string())
    }
}

impl From<ExecError> for UnitError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Cancelled => UnitError::Cancelled,
            ExecError::KilledBySignal { .. } => UnitError::worker_lost(e.to_string()),
            ExecError::NonZeroExit { code, stderr } if !stderr.is_empty() => {
                let reason = format!("non-zero exit code: {code}; stderr: {stderr}");
                UnitError::Fail {
                    reason,
                    source: Some(Box::new(ExecError::NonZeroExit { code, stderr })),
                }
            }
            other => UnitError::from_error(other),
        }
    }
}
