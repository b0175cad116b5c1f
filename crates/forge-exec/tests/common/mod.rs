#![allow(dead_code)]

use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use forge_core::{Batch, BatchConfig, HostProcessTable, ProcessTable};

pub fn batch(workers: usize) -> Batch {
    batch_with_grace(workers, Duration::from_millis(500))
}

pub fn batch_with_grace(workers: usize, cancel_grace: Duration) -> Batch {
    let cfg = BatchConfig::default()
        .with_reap_grace(Duration::from_millis(500))
        .with_cancel_grace(cancel_grace)
        .with_poll_interval(Duration::from_millis(20));
    Batch::new(cfg).with_max_workers(NonZeroUsize::new(workers).unwrap())
}

/// Live (non-zombie) process with this pid exists.
pub fn alive(pid: u32) -> bool {
    HostProcessTable::new()
        .snapshot()
        .unwrap()
        .iter()
        .any(|e| e.pid == pid && !e.zombie)
}

/// Fresh scratch directory for pid files.
pub fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("forge-exec-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn read_pids(dir: &Path) -> Vec<u32> {
    let mut pids: Vec<u32> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| std::fs::read_to_string(e.unwrap().path()).ok())
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids
}
