use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, PoisonError},
};

/// Processes one batch has claimed as its own.
///
/// The reaper treats these, and everything descending from them, as the batch's to clean up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claims {
    /// Process groups led by a unit's subprocess. A group outlives its leader, so members
    /// re-parented away from us stay reachable through it.
    pub groups: BTreeSet<u32>,
    /// Individual processes started by units outside any claimed group.
    pub pids: BTreeSet<u32>,
}

impl Claims {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.pids.is_empty()
    }
}

/// Shared registry of [`Claims`], appended to by every job of a batch.
#[derive(Debug, Clone, Default)]
pub struct ProcessClaims(Arc<Mutex<Claims>>);

impl ProcessClaims {
    pub fn register_group(&self, pgid: u32) {
        self.lock().groups.insert(pgid);
    }

    pub fn register_pid(&self, pid: u32) {
        self.lock().pids.insert(pid);
    }

    pub fn snapshot(&self) -> Claims {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Claims> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
