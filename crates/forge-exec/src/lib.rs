//! Unit implementations for `forge-core` batches.
//!
//! - [`FnUnit`]: a plain Rust function, run on its own OS thread.
//! - [`ProcUnit`]: one subprocess per item, fed the item as JSON on stdin.
mod error;
pub use error::{ExecError, ExecResult};

mod util;

pub mod r#fn;
pub use r#fn::FnUnit;

#[cfg(feature = "proc")]
pub mod proc;
#[cfg(feature = "proc")]
pub use proc::{ENV_JOB_INDEX, OutputMode, ProcConfig, ProcUnit};

pub mod prelude {
    pub use crate::FnUnit;
    pub use crate::error::{ExecError, ExecResult};
    #[cfg(feature = "proc")]
    pub use crate::proc::{OutputMode, ProcConfig, ProcUnit};
}
