use super::{ProcConfig, ProcUnit};
use crate::error::{ExecError, ExecResult};

impl ProcConfig {
    /// Run `script` through the platform shell (`sh -c` / `cmd /C`).
    pub fn shell(script: impl Into<String>) -> Self {
        let script = script.into();
        cfg_if::cfg_if! {
            if #[cfg(target_family = "windows")] {
                ProcConfig::new("cmd").with_args(["/C".to_string(), script])
            } else {
                ProcConfig::new("sh").with_args(["-c".to_string(), script])
            }
        }
    }
}

impl ProcUnit {
    /// [`ProcUnit`] for a shell script, named `shell`.
    pub fn shell(script: impl Into<String>) -> ExecResult<Self> {
        let script = script.into();
        if script.trim().is_empty() {
            return Err(ExecError::EmptyScript);
        }
        Ok(ProcUnit::new(ProcConfig::shell(script))?.with_name("shell"))
    }
}
