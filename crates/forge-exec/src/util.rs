use std::{
    mem,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::debug;

pub fn cmd_program(program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args.iter().map(|s| s.as_str()));
    cmd
}

/// SIGTERM the child's process group, wait up to `grace`, then SIGKILL the group.
///
/// The child must have been spawned as the leader of its own process group.
#[cfg(unix)]
pub async fn kill_graceful(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(id) = child.id() else {
        return;
    };
    let pgid = Pid::from_raw(id as i32);

    let _ = killpg(pgid, Signal::SIGTERM);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        debug!(target: "forge.exec.proc", pid = id, "grace elapsed; killing process group");
        let _ = killpg(pgid, Signal::SIGKILL);
        let _ = child.wait().await;
    }
}

#[cfg(not(unix))]
pub async fn kill_graceful(child: &mut Child, _grace: Duration) {
    let _ = child.kill().await;
}

/// Which part of a pipe's output a [`Capture`] keeps once it exceeds its limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Keep {
    /// The first `n` bytes.
    Head(usize),
    /// The last `n` bytes.
    Tail(usize),
}

/// Bytes read from a pipe.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// More was written than [`Keep`] allowed.
    pub truncated: bool,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], keep: Keep) {
        match keep {
            Keep::Head(max) => {
                let room = max.saturating_sub(self.bytes.len());
                let take = room.min(chunk.len());
                self.bytes.extend_from_slice(&chunk[..take]);
                self.truncated |= take < chunk.len();
            }
            Keep::Tail(max) => {
                self.bytes.extend_from_slice(chunk);
                if self.bytes.len() > max {
                    let excess = self.bytes.len() - max;
                    self.bytes.drain(..excess);
                    self.truncated = true;
                }
            }
        }
    }

    /// Captured bytes as trimmed text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).trim().to_string()
    }
}

/// Background reader collecting one pipe of a child.
///
/// The pipe is always read to the end so the child never blocks on a full pipe, but only
/// what [`Keep`] allows is held in memory. A descendant that inherited the pipe can keep it
/// open after the child exits, so [`Capture::finish`] stops waiting after a bounded time and
/// returns what was read so far.
pub struct Capture {
    buf: Arc<Mutex<Captured>>,
    task: JoinHandle<()>,
}

impl Capture {
    pub fn spawn<R>(src: Option<R>, keep: Keep) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Captured::default()));
        let sink = Arc::clone(&buf);
        let task = tokio::spawn(async move {
            let Some(mut src) = src else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match src.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(&chunk[..n], keep),
                }
            }
        });
        Self { buf, task }
    }

    pub async fn finish(mut self, wait: Duration) -> Captured {
        if tokio::time::timeout(wait, &mut self.task).await.is_err() {
            debug!(target: "forge.exec.proc", "pipe still open after exit; truncating capture");
            self.task.abort();
        }
        mem::take(&mut *self.buf.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}
