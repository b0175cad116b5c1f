use std::{collections::HashSet, sync::Arc};

use tracing::{debug, warn};

use super::{ProcessClaims, ProcessTable};

/// Attributes processes started on the calling thread to a batch.
///
/// Open it on the thread that is about to run foreign code, then [`claim`](Self::claim) on
/// the same thread once that code returns. Kernels that list children per thread give an
/// exact answer. Elsewhere the watch falls back to the direct children of this process that
/// share its process group and appeared in between; another batch's thread forking in the
/// same window cannot be told apart from ours.
pub struct SpawnWatch {
    table: Arc<dyn ProcessTable>,
    claims: ProcessClaims,
    per_thread: bool,
    before: HashSet<u32>,
}

impl SpawnWatch {
    pub fn start(table: Arc<dyn ProcessTable>, claims: ProcessClaims) -> Self {
        let (per_thread, before) = match table.thread_children() {
            Some(pids) => (true, pids),
            None => (false, group_children(table.as_ref())),
        };
        Self {
            table,
            claims,
            per_thread,
            before: before.into_iter().collect(),
        }
    }

    /// Register every child started since [`SpawnWatch::start`]. Returns how many.
    pub fn claim(self) -> usize {
        let now = if self.per_thread {
            self.table.thread_children().unwrap_or_default()
        } else {
            group_children(self.table.as_ref())
        };

        let mut claimed = 0;
        for pid in now.into_iter().filter(|pid| !self.before.contains(pid)) {
            self.claims.register_pid(pid);
            claimed += 1;
        }
        if claimed > 0 {
            debug!(
                target: "forge.core.reaper",
                claimed,
                per_thread = self.per_thread,
                "unit processes attributed to batch"
            );
        }
        claimed
    }
}

/// Children of this process still in its own process group. Subprocess units lead groups
/// of their own and never show up here.
fn group_children(table: &dyn ProcessTable) -> Vec<u32> {
    let me = table.self_pid();
    let entries = match table.snapshot() {
        Ok(entries) => entries,
        Err(e) => {
            warn!(target: "forge.core.reaper", error = %e, "cannot list children");
            return Vec::new();
        }
    };
    let Some(own_group) = entries.iter().find(|e| e.pid == me).map(|e| e.pgid) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter(|e| e.ppid == me && e.pgid == own_group)
        .map(|e| e.pid)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaper::{ProcEntry, ReapError};
    use std::sync::Mutex;

    const ME: u32 = 100;

    /// Table whose rows and per-thread list can be swapped between calls.
    struct Staged {
        rows: Mutex<Vec<ProcEntry>>,
        thread: Mutex<Option<Vec<u32>>>,
    }

    impl Staged {
        fn new(rows: Vec<ProcEntry>, thread: Option<Vec<u32>>) -> Arc<Self> {
            Arc::new(Self {
                rows: Mutex::new(rows),
                thread: Mutex::new(thread),
            })
        }
    }

    impl ProcessTable for Staged {
        fn self_pid(&self) -> u32 {
            ME
        }
        fn snapshot(&self) -> Result<Vec<ProcEntry>, ReapError> {
            Ok(self.rows.lock().unwrap().clone())
        }
        fn terminate(&self, pid: u32) -> Result<(), ReapError> {
            Err(ReapError::Gone(pid))
        }
        fn kill(&self, pid: u32) -> Result<(), ReapError> {
            Err(ReapError::Gone(pid))
        }
        fn reap(&self, _pid: u32) {}
        fn thread_children(&self) -> Option<Vec<u32>> {
            self.thread.lock().unwrap().clone()
        }
    }

    fn row(pid: u32, ppid: u32, pgid: u32) -> ProcEntry {
        ProcEntry {
            pid,
            ppid,
            pgid,
            zombie: false,
        }
    }

    #[test]
    fn per_thread_list_is_preferred() {
        let table = Staged::new(vec![row(ME, 1, ME)], Some(vec![7]));
        let claims = ProcessClaims::default();
        let watch = SpawnWatch::start(table.clone(), claims.clone());

        *table.thread.lock().unwrap() = Some(vec![7, 8]);
        // A sibling thread's child shows up in the process table but not in our list.
        table.rows.lock().unwrap().push(row(9, ME, ME));

        assert_eq!(watch.claim(), 1);
        assert_eq!(claims.snapshot().pids.into_iter().collect::<Vec<_>>(), vec![8]);
    }

    #[test]
    fn fallback_skips_foreign_groups_and_old_children() {
        let table = Staged::new(vec![row(ME, 1, ME), row(5, ME, ME)], None);
        let claims = ProcessClaims::default();
        let watch = SpawnWatch::start(table.clone(), claims.clone());

        table
            .rows
            .lock()
            .unwrap()
            .extend([row(6, ME, ME), row(7, ME, 7), row(8, 6, ME)]);

        assert_eq!(watch.claim(), 1);
        assert_eq!(claims.snapshot().pids.into_iter().collect::<Vec<_>>(), vec![6]);
    }
}
