use std::{path::PathBuf, process::ExitStatus, process::Stdio, time::Duration};

use async_trait::async_trait;
use forge_core::{JobCtx, Unit, UnitError};
use forge_model::UnitEnv;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::{
    error::{ExecError, ExecResult},
    util::{Capture, Captured, Keep, cmd_program, kill_graceful},
};

/// Index of the job inside its batch, exported to every subprocess.
pub const ENV_JOB_INDEX: &str = "FORGE_JOB_INDEX";

const DEFAULT_TERM_GRACE: Duration = Duration::from_secs(1);
/// How long pipes are drained after the process exited.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const STDERR_TAIL: usize = 2048;
const DEFAULT_MAX_OUTPUT: usize = 16 * 1024 * 1024;

/// How the subprocess stdout becomes the unit output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Stdout is one JSON document.
    #[default]
    Json,
    /// Stdout is returned as a JSON string, without the trailing newline.
    Text,
}

/// Process configuration shared by every item of a batch.
#[derive(Clone, Debug)]
pub struct ProcConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: UnitEnv,
    pub cwd: Option<PathBuf>,
    /// Time the process group gets between SIGTERM and SIGKILL when the batch cancels.
    pub term_grace: Duration,
    pub output: OutputMode,
    /// Largest stdout accepted as a result; anything longer fails the item.
    pub max_output: usize,
}

impl Default for ProcConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            env: UnitEnv::new(),
            cwd: None,
            term_grace: DEFAULT_TERM_GRACE,
            output: OutputMode::default(),
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }
}

impl ProcConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(key, value);
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_term_grace(mut self, grace: Duration) -> Self {
        self.term_grace = grace;
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output = bytes;
        self
    }
}

/// Unit running one subprocess per item.
///
/// The item is written to stdin as JSON and stdin is closed. The process leads its own
/// process group, which is registered with the batch so that anything it leaves behind is
/// reaped even after it exits.
///
/// - exit 0: stdout decoded per [`OutputMode`];
/// - non-zero exit: [`UnitError::Fail`] with the stderr tail;
/// - death by a signal: [`UnitError::WorkerLost`];
/// - batch cancellation: SIGTERM to the group, SIGKILL after `term_grace`.
pub struct ProcUnit {
    name: &'static str,
    cfg: ProcConfig,
}

impl ProcUnit {
    pub fn new(cfg: ProcConfig) -> ExecResult<Self> {
        if cfg.program.trim().is_empty() {
            return Err(ExecError::MissingProgram);
        }
        Ok(Self { name: "proc", cfg })
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn config(&self) -> &ProcConfig {
        &self.cfg
    }

    async fn exec(&self, input: Vec<u8>, ctx: &JobCtx) -> ExecResult<Value> {
        let cfg = &self.cfg;
        let index = ctx.index();

        let mut cmd = cmd_program(&cfg.program, &cfg.args);
        if let Some(cwd) = &cfg.cwd {
            cmd.current_dir(cwd);
        }
        for kv in cfg.env.iter() {
            cmd.env(kv.key(), kv.value());
        }
        cmd.env(ENV_JOB_INDEX, index.to_string());
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        trace!(
            target: "forge.exec.proc",
            index,
            program = %cfg.program,
            args = ?cfg.args,
            env = cfg.env.len(),
            "spawn"
        );
        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("{}: {e}", cfg.program)))?;
        if let Some(pid) = child.id() {
            ctx.register_group(pid);
        }

        let stdin = child.stdin.take();
        let feeder = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                // A process that never reads its stdin is not an error.
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            }
        });
        let stdout = Capture::spawn(child.stdout.take(), Keep::Head(cfg.max_output));
        let stderr = Capture::spawn(child.stderr.take(), Keep::Tail(STDERR_TAIL));

        tokio::select! {
            status = child.wait() => {
                feeder.abort();
                let status = status?;
                let stdout = stdout.finish(DRAIN_GRACE).await;
                let stderr = stderr.finish(DRAIN_GRACE).await;
                debug!(target: "forge.exec.proc", index, %status, "exited");
                self.outcome(status, stdout, stderr)
            }
            _ = ctx.cancelled() => {
                debug!(target: "forge.exec.proc", index, "cancelled; terminating process group");
                kill_graceful(&mut child, cfg.term_grace).await;
                feeder.abort();
                stdout.abort();
                stderr.abort();
                Err(ExecError::Cancelled)
            }
        }
    }

    fn outcome(&self, status: ExitStatus, stdout: Captured, stderr: Captured) -> ExecResult<Value> {
        if status.success() {
            if stdout.truncated {
                return Err(ExecError::OutputTooLarge {
                    limit: self.cfg.max_output,
                });
            }
            return decode(self.cfg.output, &stdout.bytes);
        }
        if let Some(code) = status.code() {
            return Err(ExecError::NonZeroExit {
                code,
                stderr: stderr.text(),
            });
        }
        Err(ExecError::KilledBySignal {
            signal: signal_name(status),
        })
    }
}

fn decode(mode: OutputMode, stdout: &[u8]) -> ExecResult<Value> {
    match mode {
        OutputMode::Json => {
            serde_json::from_slice(stdout).map_err(|e| ExecError::Decode(e.to_string()))
        }
        OutputMode::Text => {
            let text = String::from_utf8_lossy(stdout);
            Ok(Value::String(text.trim_end_matches(['\r', '\n']).to_string()))
        }
    }
}

#[cfg(unix)]
fn signal_name(status: ExitStatus) -> String {
    use nix::sys::signal::Signal;
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(raw) => Signal::try_from(raw)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| format!("#{raw}")),
        None => "unknown".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_name(_status: ExitStatus) -> String {
    "unknown".to_string()
}

#[async_trait]
impl<I> Unit<I> for ProcUnit
where
    I: Serialize + Send + 'static,
{
    type Output = Value;

    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, item: I, ctx: JobCtx) -> Result<Value, UnitError> {
        let input = serde_json::to_vec(&item).map_err(|e| ExecError::Encode(e.to_string()))?;
        self.exec(input, &ctx).await.map_err(UnitError::from)
    }
}

#[cfg(feature = "shell")]
pub mod shell;
