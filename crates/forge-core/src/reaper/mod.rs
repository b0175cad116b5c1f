//! Batch process reaper.
//!
//! Stopping the pool only reaches the processes the units own directly. Anything those
//! processes spawned in turn is found here by walking the process table, asked to exit with
//! SIGTERM, given a bounded grace period and then killed.
//!
//! The walk works on a [`ProcessTable`] snapshot so the algorithm is independent of how a
//! given OS exposes its process table. By default only what a batch claimed (see
//! [`ProcessClaims`]) and the descendants of that are touched, so batches sharing a process
//! leave each other alone.
mod claims;
pub use claims::{Claims, ProcessClaims};

mod host;
pub use host::HostProcessTable;

mod watch;
pub use watch::SpawnWatch;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Which processes the reaper sweeps after a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReapScope {
    /// Processes the batch claimed, plus their descendants.
    #[default]
    Owned,
    /// Every descendant of the current process plus the batch's claims. Only safe when no
    /// other batch or subprocess user shares the process.
    Descendants,
    /// Leave the process table alone.
    Disabled,
}

/// One row of a process table snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: u32,
    pub ppid: u32,
    pub pgid: u32,
    /// Exited but not yet waited for. Counts as gone.
    pub zombie: bool,
}

#[derive(Debug, Error)]
pub enum ReapError {
    #[error("process {0} is already gone")]
    Gone(u32),
    #[error("signal to process {pid} failed: {reason}")]
    Signal { pid: u32, reason: String },
    #[error("process table unavailable: {0}")]
    Table(#[from] std::io::Error),
}

/// OS capabilities the reaper needs.
pub trait ProcessTable: Send + Sync {
    fn self_pid(&self) -> u32;
    fn snapshot(&self) -> Result<Vec<ProcEntry>, ReapError>;
    /// Ask `pid` to exit (SIGTERM).
    fn terminate(&self, pid: u32) -> Result<(), ReapError>;
    /// Force `pid` to exit (SIGKILL).
    fn kill(&self, pid: u32) -> Result<(), ReapError>;
    /// Collect the exit status of `pid` if it is an exited child of ours. Never blocks.
    fn reap(&self, pid: u32);

    /// Children forked by the calling thread, when the OS tracks that per thread.
    fn thread_children(&self) -> Option<Vec<u32>> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Processes selected for termination.
    pub found: usize,
    /// SIGTERM delivered.
    pub terminated: usize,
    /// Still alive after the grace period; SIGKILL delivered.
    pub killed: usize,
}

/// Every process the batch is responsible for under `scope`, zombies included.
fn owned(entries: &[ProcEntry], root: u32, claims: &Claims, scope: ReapScope) -> HashSet<u32> {
    let mut found: HashSet<u32> = HashSet::new();
    let mut stack = match scope {
        ReapScope::Disabled => return found,
        ReapScope::Descendants => vec![root],
        ReapScope::Owned => Vec::new(),
    };
    for e in entries {
        if (claims.groups.contains(&e.pgid) || claims.pids.contains(&e.pid)) && found.insert(e.pid) {
            stack.push(e.pid);
        }
    }

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for e in entries {
        children.entry(e.ppid).or_default().push(e.pid);
    }
    while let Some(pid) = stack.pop() {
        for &child in children.get(&pid).map(Vec::as_slice).unwrap_or_default() {
            if found.insert(child) {
                stack.push(child);
            }
        }
    }
    found.retain(|pid| *pid != root && *pid > 1);
    found
}

/// Live processes to sweep under `scope`.
///
/// `root` itself, init and zombies are never selected. The result is sorted.
pub fn sweep_targets(entries: &[ProcEntry], root: u32, claims: &Claims, scope: ReapScope) -> Vec<u32> {
    let owned = owned(entries, root, claims, scope);
    let mut targets: Vec<u32> = entries
        .iter()
        .filter(|e| !e.zombie && owned.contains(&e.pid))
        .map(|e| e.pid)
        .collect();
    targets.sort_unstable();
    targets.dedup();
    targets
}

/// Graceful-then-forced termination of everything a batch left behind.
#[derive(Clone)]
pub struct Reaper {
    table: Arc<dyn ProcessTable>,
    grace: Duration,
    poll: Duration,
    scope: ReapScope,
}

impl Reaper {
    pub fn new(table: Arc<dyn ProcessTable>, grace: Duration, poll: Duration) -> Self {
        Self {
            table,
            grace,
            poll,
            scope: ReapScope::default(),
        }
    }

    pub fn with_scope(mut self, scope: ReapScope) -> Self {
        self.scope = scope;
        self
    }

    /// SIGTERM every target, wait up to the grace period, SIGKILL the survivors.
    pub async fn sweep(&self, claims: &Claims) -> ReapReport {
        let targets = self.targets(claims);
        let mut report = ReapReport {
            found: targets.len(),
            ..ReapReport::default()
        };
        if targets.is_empty() {
            self.reap_zombies(claims);
            return report;
        }

        debug!(target: "forge.core.reaper", count = targets.len(), "terminating batch processes");
        for &pid in &targets {
            match self.table.terminate(pid) {
                Ok(()) => report.terminated += 1,
                Err(ReapError::Gone(_)) => {}
                Err(e) => warn!(target: "forge.core.reaper", pid, error = %e, "terminate failed"),
            }
        }

        let deadline = Instant::now() + self.grace;
        let mut alive = self.alive(&targets);
        while !alive.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll.min(deadline - now)).await;
            alive = self.alive(&alive);
        }

        if !alive.is_empty() {
            report.killed = self.kill_all(&alive);
            tokio::time::sleep(self.poll).await;
        }
        self.reap_zombies(claims);

        debug!(
            target: "forge.core.reaper",
            found = report.found,
            killed = report.killed,
            "batch processes reaped"
        );
        report
    }

    /// SIGKILL every target immediately. Used where waiting is impossible.
    pub fn kill_now(&self, claims: &Claims) -> ReapReport {
        let targets = self.targets(claims);
        let killed = self.kill_all(&targets);
        self.reap_zombies(claims);
        ReapReport {
            found: targets.len(),
            terminated: 0,
            killed,
        }
    }

    fn kill_all(&self, pids: &[u32]) -> usize {
        let mut killed = 0;
        for &pid in pids {
            info!(target: "forge.core.reaper", pid, "forcefully killing child process");
            match self.table.kill(pid) {
                Ok(()) => killed += 1,
                Err(ReapError::Gone(_)) => {}
                Err(e) => warn!(target: "forge.core.reaper", pid, error = %e, "kill failed"),
            }
        }
        killed
    }

    fn targets(&self, claims: &Claims) -> Vec<u32> {
        match self.table.snapshot() {
            Ok(entries) => sweep_targets(&entries, self.table.self_pid(), claims, self.scope),
            Err(e) => {
                warn!(target: "forge.core.reaper", error = %e, "cannot list batch processes");
                Vec::new()
            }
        }
    }

    /// Subset of `pids` still running. An unreadable table counts everything as alive.
    fn alive(&self, pids: &[u32]) -> Vec<u32> {
        let entries = match self.table.snapshot() {
            Ok(entries) => entries,
            Err(_) => return pids.to_vec(),
        };
        let live: HashSet<u32> = entries
            .iter()
            .filter(|e| !e.zombie)
            .map(|e| e.pid)
            .collect();
        pids.iter().copied().filter(|pid| live.contains(pid)).collect()
    }

    /// Wait for exited children of ours that belong to the batch. Children owned by anyone
    /// else, such as a concurrent batch still awaiting its own subprocess, are left alone.
    fn reap_zombies(&self, claims: &Claims) {
        let me = self.table.self_pid();
        if let Ok(entries) = self.table.snapshot() {
            let owned = owned(&entries, me, claims, self.scope);
            for e in entries.iter().filter(|e| e.zombie && e.ppid == me && owned.contains(&e.pid)) {
                self.table.reap(e.pid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const ME: u32 = 100;

    fn entry(pid: u32, ppid: u32, pgid: u32) -> ProcEntry {
        ProcEntry {
            pid,
            ppid,
            pgid,
            zombie: false,
        }
    }

    fn claims(groups: &[u32], pids: &[u32]) -> Claims {
        Claims {
            groups: groups.iter().copied().collect(),
            pids: pids.iter().copied().collect(),
        }
    }

    #[test]
    fn descendants_scope_walks_everything_below_root() {
        let entries = vec![
            entry(1, 0, 1),
            entry(ME, 1, ME),
            entry(101, ME, ME),
            entry(102, 101, ME),
            entry(103, 102, ME),
            entry(200, 1, 200),
        ];
        let targets = sweep_targets(&entries, ME, &Claims::default(), ReapScope::Descendants);
        assert_eq!(targets, vec![101, 102, 103]);
    }

    #[test]
    fn owned_scope_ignores_unclaimed_children() {
        // 101 and 201 belong to two batches running side by side; only 101's group is ours.
        let entries = vec![
            entry(ME, 1, ME),
            entry(101, ME, 101),
            entry(102, 101, 101),
            entry(201, ME, 201),
            entry(202, 201, 201),
            entry(300, ME, ME),
        ];
        let targets = sweep_targets(&entries, ME, &claims(&[101], &[]), ReapScope::Owned);
        assert_eq!(targets, vec![101, 102]);
    }

    #[test]
    fn owned_scope_follows_claimed_pids_down() {
        // 300 was started by a function unit in our own group; 301 is its child in a new group.
        let entries = vec![
            entry(ME, 1, ME),
            entry(300, ME, ME),
            entry(301, 300, 301),
            entry(302, 301, 301),
            entry(400, ME, ME),
        ];
        let targets = sweep_targets(&entries, ME, &claims(&[], &[300]), ReapScope::Owned);
        assert_eq!(targets, vec![300, 301, 302]);
    }

    #[test]
    fn includes_orphaned_group_members() {
        // 301 was started by a unit whose leader 300 already exited.
        let entries = vec![entry(ME, 1, ME), entry(301, 1, 300), entry(400, 1, 400)];
        let targets = sweep_targets(&entries, ME, &claims(&[300], &[]), ReapScope::Owned);
        assert_eq!(targets, vec![301]);
    }

    #[test]
    fn skips_zombies_root_and_init() {
        let mut zombie = entry(101, ME, ME);
        zombie.zombie = true;
        let entries = vec![entry(1, 0, 1), entry(ME, 1, 1), zombie, entry(102, ME, ME)];
        // Group 1 would otherwise select init and ourselves.
        for scope in [ReapScope::Owned, ReapScope::Descendants] {
            assert_eq!(sweep_targets(&entries, ME, &claims(&[1], &[]), scope), vec![102]);
        }
    }

    #[test]
    fn disabled_scope_selects_nothing() {
        let entries = vec![entry(ME, 1, ME), entry(101, ME, 101)];
        let targets = sweep_targets(&entries, ME, &claims(&[101], &[101]), ReapScope::Disabled);
        assert!(targets.is_empty());
    }

    /// In-memory table: `stubborn` processes ignore SIGTERM.
    #[derive(Default)]
    struct FakeTable {
        procs: Mutex<Vec<ProcEntry>>,
        stubborn: HashSet<u32>,
        signals: Mutex<Vec<(u32, &'static str)>>,
        reaped: Mutex<Vec<u32>>,
    }

    impl FakeTable {
        fn with(procs: Vec<ProcEntry>, stubborn: &[u32]) -> Self {
            Self {
                procs: Mutex::new(procs),
                stubborn: stubborn.iter().copied().collect(),
                ..Self::default()
            }
        }

        fn exit(&self, pid: u32) {
            let mut procs = self.procs.lock().unwrap();
            for e in procs.iter_mut().filter(|e| e.pid == pid) {
                e.zombie = true;
            }
        }

        fn signals(&self) -> Vec<(u32, &'static str)> {
            self.signals.lock().unwrap().clone()
        }
    }

    impl ProcessTable for FakeTable {
        fn self_pid(&self) -> u32 {
            ME
        }

        fn snapshot(&self) -> Result<Vec<ProcEntry>, ReapError> {
            Ok(self.procs.lock().unwrap().clone())
        }

        fn terminate(&self, pid: u32) -> Result<(), ReapError> {
            self.signals.lock().unwrap().push((pid, "TERM"));
            if !self.stubborn.contains(&pid) {
                self.exit(pid);
            }
            Ok(())
        }

        fn kill(&self, pid: u32) -> Result<(), ReapError> {
            self.signals.lock().unwrap().push((pid, "KILL"));
            self.exit(pid);
            Ok(())
        }

        fn reap(&self, pid: u32) {
            self.reaped.lock().unwrap().push(pid);
            self.procs.lock().unwrap().retain(|e| e.pid != pid);
        }
    }

    fn reaper(table: &Arc<FakeTable>) -> Reaper {
        let table: Arc<dyn ProcessTable> = table.clone();
        Reaper::new(table, Duration::from_millis(200), Duration::from_millis(10))
            .with_scope(ReapScope::Descendants)
    }

    #[tokio::test]
    async fn cooperative_processes_only_get_sigterm() {
        let table = Arc::new(FakeTable::with(
            vec![entry(ME, 1, ME), entry(101, ME, ME), entry(102, 101, ME)],
            &[],
        ));

        let report = reaper(&table).sweep(&Claims::default()).await;

        assert_eq!(report, ReapReport { found: 2, terminated: 2, killed: 0 });
        assert_eq!(table.signals(), vec![(101, "TERM"), (102, "TERM")]);
        // 101 is our child and gets waited for; 102 belongs to 101.
        assert_eq!(*table.reaped.lock().unwrap(), vec![101]);
    }

    #[tokio::test]
    async fn stubborn_processes_are_killed_after_grace() {
        let table = Arc::new(FakeTable::with(
            vec![entry(ME, 1, ME), entry(101, ME, ME), entry(102, ME, ME)],
            &[102],
        ));

        let started = Instant::now();
        let report = reaper(&table).sweep(&Claims::default()).await;

        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(report.killed, 1);
        assert_eq!(
            table.signals(),
            vec![(101, "TERM"), (102, "TERM"), (102, "KILL")]
        );
    }

    #[tokio::test]
    async fn nothing_to_do_returns_immediately() {
        let table = Arc::new(FakeTable::with(vec![entry(ME, 1, ME)], &[]));
        let report = reaper(&table).sweep(&Claims::default()).await;
        assert_eq!(report, ReapReport::default());
        assert!(table.signals().is_empty());
    }

    #[tokio::test]
    async fn owned_sweep_leaves_foreign_children_and_zombies_alone() {
        let mut foreign_zombie = entry(201, ME, 201);
        foreign_zombie.zombie = true;
        let table = Arc::new(FakeTable::with(
            vec![entry(ME, 1, ME), entry(101, ME, 101), entry(202, ME, 202), foreign_zombie],
            &[],
        ));
        let owned = Reaper::new(
            table.clone() as Arc<dyn ProcessTable>,
            Duration::from_millis(200),
            Duration::from_millis(10),
        );

        let report = owned.sweep(&claims(&[101], &[])).await;

        assert_eq!(report.found, 1);
        assert_eq!(table.signals(), vec![(101, "TERM")]);
        // 201 is someone else's exit status to collect.
        assert_eq!(*table.reaped.lock().unwrap(), vec![101]);
    }

    #[test]
    fn kill_now_skips_grace() {
        let table = Arc::new(FakeTable::with(
            vec![entry(ME, 1, ME), entry(101, ME, ME), entry(301, 1, 300)],
            &[101],
        ));

        let report = reaper(&table).kill_now(&claims(&[300], &[]));

        assert_eq!(report.killed, 2);
        assert_eq!(table.signals(), vec![(101, "KILL"), (301, "KILL")]);
    }
}
