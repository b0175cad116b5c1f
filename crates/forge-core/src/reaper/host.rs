use super::{ProcEntry, ProcessTable, ReapError};

/// The process table of the machine we run on.
///
/// Linux reads `/proc/<pid>/stat`; other Unix systems ask `ps`. Signals and waits go
/// through `nix`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProcessTable;

impl HostProcessTable {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl ProcessTable for HostProcessTable {
    fn self_pid(&self) -> u32 {
        std::process::id()
    }

    fn snapshot(&self) -> Result<Vec<ProcEntry>, ReapError> {
        imp::snapshot()
    }

    fn terminate(&self, pid: u32) -> Result<(), ReapError> {
        signal(pid, nix::sys::signal::Signal::SIGTERM)
    }

    fn kill(&self, pid: u32) -> Result<(), ReapError> {
        signal(pid, nix::sys::signal::Signal::SIGKILL)
    }

    fn reap(&self, pid: u32) {
        use nix::sys::wait::{WaitPidFlag, waitpid};
        use nix::unistd::Pid;

        let _ = waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG));
    }

    #[cfg(target_os = "linux")]
    fn thread_children(&self) -> Option<Vec<u32>> {
        imp::thread_children()
    }
}

#[cfg(unix)]
fn signal(pid: u32, sig: nix::sys::signal::Signal) -> Result<(), ReapError> {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    match nix::sys::signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(ReapError::Gone(pid)),
        Err(e) => Err(ReapError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
impl ProcessTable for HostProcessTable {
    fn self_pid(&self) -> u32 {
        std::process::id()
    }

    fn snapshot(&self) -> Result<Vec<ProcEntry>, ReapError> {
        tracing::warn!(
            target: "forge.core.reaper",
            "process table is not available on this OS; descendants will not be reaped"
        );
        Ok(Vec::new())
    }

    fn terminate(&self, pid: u32) -> Result<(), ReapError> {
        Err(ReapError::Gone(pid))
    }

    fn kill(&self, pid: u32) -> Result<(), ReapError> {
        Err(ReapError::Gone(pid))
    }

    fn reap(&self, _pid: u32) {}
}

#[cfg(target_os = "linux")]
mod imp {
    use std::fs;

    use super::{ProcEntry, ReapError};

    pub fn snapshot() -> Result<Vec<ProcEntry>, ReapError> {
        let mut out = Vec::new();
        for entry in fs::read_dir("/proc")?.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Processes may exit between readdir and read.
            let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
                continue;
            };
            if let Some(e) = parse_stat(&stat) {
                out.push(e);
            }
        }
        Ok(out)
    }

    /// Needs a kernel built with `CONFIG_PROC_CHILDREN`; `None` without it.
    pub fn thread_children() -> Option<Vec<u32>> {
        let list = fs::read_to_string("/proc/thread-self/children").ok()?;
        Some(parse_children(&list))
    }

    pub fn parse_children(list: &str) -> Vec<u32> {
        list.split_whitespace().filter_map(|pid| pid.parse().ok()).collect()
    }

    /// `pid (comm) state ppid pgrp ...`; `comm` may itself contain spaces and parentheses.
    pub fn parse_stat(line: &str) -> Option<ProcEntry> {
        let open = line.find('(')?;
        let close = line.rfind(')')?;
        let pid = line[..open].trim().parse().ok()?;
        let mut rest = line.get(close + 1..)?.split_whitespace();
        let state = rest.next()?;
        let ppid = rest.next()?.parse().ok()?;
        let pgid = rest.next()?.parse().ok()?;
        Some(ProcEntry {
            pid,
            ppid,
            pgid,
            zombie: matches!(state, "Z" | "X" | "x"),
        })
    }

}

#[cfg(all(unix, not(target_os = "linux")))]
mod imp {
    use std::process::Command;

    use super::{ProcEntry, ReapError};

    pub fn snapshot() -> Result<Vec<ProcEntry>, ReapError> {
        let out = Command::new("ps")
            .args(["-A", "-o", "pid=,ppid=,pgid=,stat="])
            .output()?;
        if !out.status.success() {
            return Err(ReapError::Table(std::io::Error::other(format!(
                "ps exited with {}",
                out.status
            ))));
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(parse_ps_line)
            .collect())
    }

    /// `pid ppid pgid stat`
    pub fn parse_ps_line(line: &str) -> Option<ProcEntry> {
        let mut fields = line.split_whitespace();
        let pid = fields.next()?.parse().ok()?;
        let ppid = fields.next()?.parse().ok()?;
        let pgid = fields.next()?.parse().ok()?;
        let stat = fields.next().unwrap_or("");
        Some(ProcEntry {
            pid,
            ppid,
            pgid,
            zombie: stat.starts_with('Z'),
        })
    }

}
