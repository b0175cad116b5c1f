#![cfg(unix)]

mod common;

use std::{
    collections::HashSet,
    process::Command,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use forge_core::run_batch;
use forge_exec::{FnUnit, ProcConfig, ProcUnit};
use forge_model::{JobStatus, Prediction};
use serde_json::json;

use common::{alive, batch, batch_with_grace, read_pids, scratch};

fn predictions(pks: &[&str]) -> Vec<Prediction> {
    pks.iter().map(|pk| Prediction::new(*pk)).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_prediction_gets_a_result() {
    let unit = FnUnit::new(|p: Prediction| Ok::<_, std::io::Error>(format!("{} result", p.pk)));

    let out = run_batch(unit, predictions(&["p1", "p2"]), None).await.unwrap();

    let got: HashSet<String> = out.into_iter().collect();
    let want: HashSet<String> = ["p1 result".to_string(), "p2 result".to_string()].into();
    assert_eq!(got, want);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_raising_unit_names_its_item() {
    let unit = FnUnit::new(|_: Prediction| -> anyhow::Result<()> { anyhow::bail!("boom") });

    let err = run_batch(unit, predictions(&["p1"]), None).await.unwrap_err();

    assert_eq!(err.item.pk, "p1");
    assert_eq!(err.index, 0);
    assert_eq!(err.cause.to_string(), "unit failed: boom");
    assert!(err.to_string().starts_with("error for item #0 (Prediction {"), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_failure_stops_the_batch() {
    let dir = scratch("failfast");
    let cfg = ProcConfig::new("sh")
        .with_args([
            "-c",
            r#"echo $$ > "$PID_DIR/$FORGE_JOB_INDEX"
               if [ "$FORGE_JOB_INDEX" = 1 ]; then echo 'cannot score' >&2; exit 1; fi
               sleep 60; echo null"#,
        ])
        .with_env("PID_DIR", dir.display().to_string());
    let unit = ProcUnit::new(cfg).unwrap();

    let started = Instant::now();
    let report = batch(2)
        .run_report(unit, predictions(&["p1", "p2", "p3", "p4"]))
        .await;

    assert!(started.elapsed() < Duration::from_secs(10), "took {:?}", started.elapsed());
    assert_eq!(report.count(JobStatus::Failed), 1);
    assert_eq!(report.count(JobStatus::Succeeded), 0);
    assert_eq!(report.statuses[2], JobStatus::Cancelled);
    assert_eq!(report.statuses[3], JobStatus::Cancelled);

    // p3 and p4 were never started.
    assert!(!dir.join("2").exists());
    assert!(!dir.join("3").exists());
    for pid in read_pids(&dir) {
        assert!(!alive(pid), "process {pid} survived the batch");
    }

    let err = report.into_result().unwrap_err();
    assert_eq!(err.item.pk, "p2");
    assert!(err.cause.to_string().contains("cannot score"), "{err}");
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_the_cap() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let unit = {
        let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
        FnUnit::new(move |p: Prediction| {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(p.pk)
        })
    };

    let pks = ["a", "b", "c", "d", "e", "f", "g"];
    let out = batch(2).run(unit, predictions(&pks)).await.unwrap();

    assert_eq!(out.len(), pks.len());
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawned_children_do_not_outlive_the_batch() {
    let spawned = Arc::new(Mutex::new(Vec::new()));

    let unit = {
        let spawned = Arc::clone(&spawned);
        FnUnit::new(move |_: Prediction| -> std::io::Result<()> {
            // Deliberately never waited for.
            let child = Command::new("sleep").arg("300").spawn()?;
            spawned.lock().unwrap().push(child.id());
            Ok(())
        })
    };

    batch(2).run(unit, predictions(&["p1", "p2"])).await.unwrap();

    let spawned = spawned.lock().unwrap().clone();
    assert_eq!(spawned.len(), 2);
    for pid in spawned {
        assert!(!alive(pid), "child {pid} survived the batch");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn orphaned_grandchildren_are_reaped() {
    let dir = scratch("orphans");
    // The shell exits at once; its background sleep is re-parented away from us.
    let cfg = ProcConfig::new("sh")
        .with_args([
            "-c",
            r#"sleep 300 >/dev/null 2>&1 &
               echo $! > "$PID_DIR/$FORGE_JOB_INDEX"
               echo '{"score": 1}'"#,
        ])
        .with_env("PID_DIR", dir.display().to_string());
    let unit = ProcUnit::new(cfg).unwrap();

    let report = batch(1).run_report(unit, predictions(&["p1"])).await;
    assert!(report.reaped.found >= 1);

    let out = report.into_result().unwrap();
    assert_eq!(out, vec![json!({"score": 1})]);

    for pid in read_pids(&dir) {
        assert!(!alive(pid), "grandchild {pid} survived the batch");
    }
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn killed_worker_is_reported_as_lost() {
    let cfg = ProcConfig::new("sh").with_args(["-c", "sleep 0.1; kill -KILL $$"]);
    let unit = ProcUnit::new(cfg).unwrap();

    let err = batch(1)
        .run(unit, predictions(&["p1"]))
        .await
        .unwrap_err();

    assert!(err.cause.is_worker_lost(), "{err}");
    assert_eq!(err.item.pk, "p1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_function_is_reported_as_lost() {
    let unit = FnUnit::new(|p: Prediction| -> std::io::Result<()> {
        panic!("cannot load ground truth for {}", p.pk)
    });

    let err = batch(1).run(unit, predictions(&["p1"])).await.unwrap_err();

    assert!(err.cause.is_worker_lost());
    assert!(err.cause.to_string().contains("cannot load ground truth for p1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_spawn_after_a_failure_is_still_reaped() {
    let spawned = Arc::new(Mutex::new(None));

    let unit = {
        let spawned = Arc::clone(&spawned);
        FnUnit::new(move |p: Prediction| -> std::io::Result<()> {
            if p.pk == "bad" {
                return Err(std::io::Error::other("cannot score"));
            }
            // Still busy when the batch cancels; spawns only afterwards.
            std::thread::sleep(Duration::from_millis(800));
            let child = Command::new("sleep").arg("300").spawn()?;
            *spawned.lock().unwrap() = Some(child.id());
            Ok(())
        })
    };

    let err = batch_with_grace(2, Duration::from_secs(5))
        .run(unit, predictions(&["slow", "bad"]))
        .await
        .unwrap_err();
    assert_eq!(err.item.pk, "bad");

    let pid = spawned.lock().unwrap().expect("slow item spawned its child before teardown");
    assert!(!alive(pid), "child {pid} started after cancellation survived the batch");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_leave_each_other_alone() {
    let slow = ProcUnit::new(ProcConfig::new("sh").with_args(["-c", "sleep 1; echo 1"])).unwrap();
    let quick = ProcUnit::new(ProcConfig::new("sh").with_args(["-c", "echo 2"])).unwrap();
    let local = FnUnit::new(|p: Prediction| Ok::<_, std::io::Error>(json!(p.pk)));

    let later = |ms| tokio::time::sleep(Duration::from_millis(ms));
    let slow_batch = batch(1);
    let (a, b, c) = tokio::join!(
        slow_batch.run(slow, predictions(&["p1"])),
        async {
            later(100).await;
            batch(1).run(quick, predictions(&["p2"])).await
        },
        async {
            later(200).await;
            batch(1).run(local, predictions(&["p3"])).await
        },
    );

    assert_eq!(a.unwrap(), vec![json!(1)]);
    assert_eq!(b.unwrap(), vec![json!(2)]);
    assert_eq!(c.unwrap(), vec![json!("p3")]);
}
