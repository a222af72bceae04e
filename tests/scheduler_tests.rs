use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use runbox::config::Config;
use runbox::error::SubmitError;
use runbox::governor::Breach;
use runbox::workspace::{WorkspaceManager, workspace_name};
use runbox::{Outcome, Scheduler, Submission};

// Helper function to build a config whose languages only need a POSIX shell
fn create_test_config(root: &Path, workers: usize, depth: usize, wall_ms: u64) -> Config {
    serde_json::from_value(json!({
        "limits": {
            "max_wall_time_ms": wall_ms,
            "max_memory_bytes": 256 * 1024 * 1024,
            "max_output_bytes": 64 * 1024
        },
        "scheduler": {
            "max_concurrent_jobs": workers,
            "max_queue_depth": depth
        },
        "workspace": {
            "root": root,
            "orphan_staleness_threshold_ms": 60_000
        },
        "governor": { "memory_poll_interval_ms": 5 },
        "languages": [
            {
                "name": "sh",
                "extension": "sh",
                "run": ["sh", "%INPUT%"]
            },
            {
                "name": "checked-sh",
                "extension": "sh",
                "compile": ["sh", "-n", "%INPUT%"],
                "run": ["sh", "%INPUT%"]
            },
            {
                "name": "vanishing-sh",
                "extension": "sh",
                "compile": ["sh", "-c", "rm -rf \"$HOME\""],
                "run": ["sh", "%INPUT%"]
            }
        ]
    }))
    .expect("Test config should deserialize")
}

fn start(root: &TempDir, workers: usize, depth: usize, wall_ms: u64) -> Scheduler {
    let config = create_test_config(root.path(), workers, depth, wall_ms);
    Scheduler::start(&config).expect("Scheduler should start")
}

fn workspace_entries(root: &Path) -> Vec<String> {
    fs::read_dir(root)
        .expect("Workspace root should exist")
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

async fn wait_until_dequeued(scheduler: &Scheduler) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduler.queued() > 0 {
        assert!(Instant::now() < deadline, "Queue never drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // give the worker a moment to move past the pop
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_hello_world_success() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 2, 8, 5000);

    let result = scheduler
        .run(Submission::new(1, "echo 'Hello World!'", "sh"))
        .await
        .unwrap();

    assert_eq!(result.submission_id, 1);
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.stdout_str(), "Hello World!\n");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.breach, None);
    assert!(!result.stdout_truncated);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_language_lookup_is_case_insensitive() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 1, 8, 5000);

    let result = scheduler
        .run(Submission::new(1, "echo ok", "SH"))
        .await
        .unwrap();
    assert_eq!(result.outcome, Outcome::Success);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_unsupported_language_rejected() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 1, 8, 5000);

    let err = scheduler
        .submit(Submission::new(1, "DISPLAY 'HI'.", "cobol"))
        .unwrap_err();
    assert_eq!(err, SubmitError::UnsupportedLanguage("cobol".to_string()));
    assert!(workspace_entries(root.path()).is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_stdin_is_fed_to_program() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 1, 8, 5000);

    let submission = Submission::new(1, "read -r word\necho \"got $word\"", "sh").with_stdin("hello\n");
    let result = scheduler.run(submission).await.unwrap();
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.stdout_str(), "got hello\n");

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_nonzero_exit_is_runtime_error() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 1, 8, 5000);

    let result = scheduler
        .run(Submission::new(1, "echo oops >&2\nexit 3", "sh"))
        .await
        .unwrap();
    assert_eq!(result.outcome, Outcome::RuntimeError);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stderr_str(), "oops\n");

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_fatal_signal_is_runtime_error() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 1, 8, 5000);

    let result = scheduler
        .run(Submission::new(1, "kill -SEGV $$", "sh"))
        .await
        .unwrap();
    assert_eq!(result.outcome, Outcome::RuntimeError);
    assert_eq!(result.exit_code, None);
    assert_eq!(result.signal, Some(libc::SIGSEGV));
    assert_eq!(result.breach, None);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_failed_build_is_compile_error() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 1, 8, 5000);

    let result = scheduler
        .run(Submission::new(1, "if then fi (", "checked-sh"))
        .await
        .unwrap();
    assert_eq!(result.outcome, Outcome::CompileError);
    assert!(!result.stderr.is_empty(), "Diagnostics should be reported");
    assert!(workspace_entries(root.path()).is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_vanished_workspace_is_internal_error() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 1, 8, 5000);

    let result = scheduler
        .run(Submission::new(1, "echo unreachable", "vanishing-sh"))
        .await
        .unwrap();
    assert_eq!(result.outcome, Outcome::InternalError);
    assert!(!result.outcome.is_program_caused());

    // the caller only sees a summary with a reference, never host paths
    let summary = result.stderr_str();
    assert!(summary.contains("ref test_"), "{summary}");
    assert!(!summary.contains(&*root.path().to_string_lossy()), "{summary}");
    assert!(workspace_entries(root.path()).is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_wall_time_bound() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 1, 8, 300);

    let started = Instant::now();
    let result = scheduler
        .run(Submission::new(1, "sleep 30", "sh"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Timeout);
    assert_eq!(result.breach, Some(Breach::WallTime));
    assert!(result.duration_ms >= 300);
    assert!(started.elapsed() < Duration::from_secs(5));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_timeout_kills_whole_process_tree() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 1, 8, 300);

    let started = Instant::now();
    let result = scheduler
        .run(Submission::new(1, "(sleep 2; echo late) &\nsleep 30", "sh"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Timeout);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!result.stdout_str().contains("late"));
    assert!(workspace_entries(root.path()).is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_background_child_does_not_outlive_job() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 1, 8, 10_000);

    // the background sleep still holds stdout open after the shell exits
    let started = Instant::now();
    let result = scheduler
        .run(Submission::new(1, "sleep 30 &\necho started", "sh"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.stdout_str(), "started\n");
    assert!(started.elapsed() < Duration::from_secs(5));

    scheduler.shutdown().await;
}

fn live_processes_matching(needle: &str) -> Vec<String> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| fs::read(entry.ok()?.path().join("cmdline")).ok())
        .map(|raw| String::from_utf8_lossy(&raw).replace('\0', " "))
        .filter(|cmdline| cmdline.contains(needle))
        .collect()
}

#[tokio::test]
async fn test_new_session_child_does_not_outlive_job() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 1, 8, 10_000);

    let result = scheduler
        .run(Submission::new(
            1,
            "setsid sleep 7.4321 </dev/null >/dev/null 2>&1 &\necho started",
            "sh",
        ))
        .await
        .unwrap();
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.stdout_str(), "started\n");

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let survivors = live_processes_matching("sleep 7.4321");
        if survivors.is_empty() {
            break;
        }
        assert!(Instant::now() < deadline, "Escaped processes: {survivors:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_output_ceiling() {
    let root = tempfile::tempdir().unwrap();
    let mut config = create_test_config(root.path(), 1, 8, 10_000);
    config.limits.max_output_bytes = runbox::config::ByteSize(1024);
    let scheduler = Scheduler::start(&config).unwrap();

    let started = Instant::now();
    let result = scheduler
        .run(Submission::new(1, "while :; do echo y; done", "sh"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::ResourceExceeded);
    assert_eq!(result.breach, Some(Breach::Output));
    assert!(result.stdout_truncated);
    assert!(result.stdout.len() + result.stderr.len() <= 1024);
    assert!(started.elapsed() < Duration::from_secs(5));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_output_burst_then_exit_is_resource_exceeded() {
    let root = tempfile::tempdir().unwrap();
    let mut config = create_test_config(root.path(), 2, 8, 5000);
    config.limits.max_output_bytes = runbox::config::ByteSize(64);
    let scheduler = Scheduler::start(&config).unwrap();

    for id in 0..20 {
        let result = scheduler
            .run(Submission::new(id, "head -c 5000 /dev/zero", "sh"))
            .await
            .unwrap();

        assert_eq!(result.outcome, Outcome::ResourceExceeded, "run {id}");
        assert_eq!(result.breach, Some(Breach::Output));
        assert!(result.stdout_truncated);
        assert_eq!(result.stdout.len(), 64);
    }

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_output_exactly_at_ceiling_is_kept() {
    let root = tempfile::tempdir().unwrap();
    let mut config = create_test_config(root.path(), 1, 8, 5000);
    config.limits.max_output_bytes = runbox::config::ByteSize(16);
    let scheduler = Scheduler::start(&config).unwrap();

    let result = scheduler
        .run(Submission::new(1, "printf '0123456789abcdef'", "sh"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.stdout_str(), "0123456789abcdef");
    assert!(!result.stdout_truncated);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_memory_ceiling() {
    let root = tempfile::tempdir().unwrap();
    let mut config = create_test_config(root.path(), 1, 8, 20_000);
    config.limits.max_memory_bytes = runbox::config::ByteSize(32 * 1024 * 1024);
    let scheduler = Scheduler::start(&config).unwrap();

    let result = scheduler
        .run(Submission::new(1, "s=x\nwhile :; do s=\"$s$s\"; done", "sh"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::ResourceExceeded);
    assert_eq!(result.breach, Some(Breach::Memory));
    assert!(result.peak_memory_bytes > 32 * 1024 * 1024);
    assert!(workspace_entries(root.path()).is_empty());

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_jobs_are_isolated() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 4, 16, 10_000);

    let program = |tag: &str| format!("echo {tag} > marker\nsleep 0.3\nls\ncat marker\n");
    let first = scheduler.submit(Submission::new(1, program("first"), "sh")).unwrap();
    let second = scheduler.submit(Submission::new(2, program("second"), "sh")).unwrap();

    let (first, second) = tokio::join!(first.wait(), second.wait());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.outcome, Outcome::Success);
    assert_eq!(second.outcome, Outcome::Success);
    assert_eq!(first.stdout_str(), "main.sh\nmarker\nfirst\n");
    assert_eq!(second.stdout_str(), "main.sh\nmarker\nsecond\n");
    assert!(workspace_entries(root.path()).is_empty());

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_job_reclaims_its_workspace() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 4, 64, 300);

    let programs = [
        ("echo fine", "sh"),
        ("exit 1", "sh"),
        ("sleep 30", "sh"),
        ("if then fi (", "checked-sh"),
        ("echo gone", "vanishing-sh"),
    ];
    let mut handles = Vec::new();
    for (idx, (source, language)) in programs.iter().cycle().take(20).enumerate() {
        handles.push(scheduler.submit(Submission::new(idx as u64, *source, *language)).unwrap());
    }

    let mut ids = HashSet::new();
    for handle in handles {
        let result = handle.wait().await.unwrap();
        assert!(ids.insert(result.submission_id));
    }
    assert_eq!(ids.len(), 20);
    assert!(workspace_entries(root.path()).is_empty());

    scheduler.shutdown().await;
}

#[test]
fn test_concurrent_allocation_is_unique() {
    let root = tempfile::tempdir().unwrap();
    let manager = WorkspaceManager::new(root.path()).unwrap();

    let workspaces: Vec<_> = std::thread::scope(|s| {
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let manager = &manager;
                s.spawn(move || {
                    (0..25)
                        .map(|i| manager.allocate(t * 100 + i).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        threads.into_iter().flat_map(|t| t.join().unwrap()).collect()
    });

    let ids: HashSet<_> = workspaces.iter().map(|w| w.id().to_string()).collect();
    let roots: HashSet<_> = workspaces.iter().map(|w| w.root().to_path_buf()).collect();
    assert_eq!(ids.len(), 200);
    assert_eq!(roots.len(), 200);
    assert_eq!(workspace_entries(root.path()).len(), 200);

    drop(workspaces);
    assert!(workspace_entries(root.path()).is_empty());
}

#[tokio::test]
async fn test_overload_rejects_past_queue_depth() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 1, 1, 10_000);

    let running = scheduler
        .submit(Submission::new(1, "sleep 1\necho one", "sh"))
        .unwrap();
    wait_until_dequeued(&scheduler).await;

    let waiting = scheduler
        .submit(Submission::new(2, "echo two", "sh"))
        .unwrap();
    let rejected = scheduler.submit(Submission::new(3, "echo three", "sh"));
    assert_eq!(rejected.unwrap_err(), SubmitError::Overloaded { depth: 1 });

    let running = running.wait().await.unwrap();
    let waiting = waiting.wait().await.unwrap();
    assert_eq!(running.stdout_str(), "one\n");
    assert_eq!(waiting.stdout_str(), "two\n");

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_idle_pool_accepts_a_full_burst() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 4, 1, 10_000);

    // nothing yields between submits, so no worker has dequeued yet
    let handles: Vec<_> = (1..=5)
        .map(|id| scheduler.submit(Submission::new(id, "echo hi", "sh")).unwrap())
        .collect();
    let rejected = scheduler.submit(Submission::new(6, "echo hi", "sh"));
    assert!(matches!(rejected, Err(SubmitError::Overloaded { .. })));

    for handle in handles {
        let result = handle.wait().await.unwrap();
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.stdout_str(), "hi\n");
    }

    let after = scheduler
        .run(Submission::new(7, "echo again", "sh"))
        .await
        .unwrap();
    assert_eq!(after.stdout_str(), "again\n");

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_finishes_running_and_drops_waiting() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = start(&root, 1, 4, 10_000);

    let running = scheduler
        .submit(Submission::new(1, "sleep 0.5\necho done", "sh"))
        .unwrap();
    wait_until_dequeued(&scheduler).await;
    let waiting = scheduler
        .submit(Submission::new(2, "echo never", "sh"))
        .unwrap();

    scheduler.shutdown().await;

    let running = running.wait().await.unwrap();
    assert_eq!(running.outcome, Outcome::Success);
    assert_eq!(running.stdout_str(), "done\n");
    assert_eq!(waiting.wait().await.unwrap_err(), SubmitError::ShuttingDown);
    assert!(workspace_entries(root.path()).is_empty());
}

#[tokio::test]
async fn test_startup_sweeps_stale_workspaces() {
    let root = tempfile::tempdir().unwrap();

    let stale = root.path().join(workspace_name(1_000, "0123456789ab"));
    fs::create_dir(&stale).unwrap();
    fs::write(stale.join("main.sh"), "echo left behind").unwrap();
    let unrelated = root.path().join("keep-me");
    fs::create_dir(&unrelated).unwrap();

    let scheduler = start(&root, 1, 8, 5000);
    let report = scheduler.startup_sweep();

    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.failed, 0);
    assert!(!stale.exists());
    assert!(unrelated.exists());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_refuses_to_start() {
    let root = tempfile::tempdir().unwrap();
    let mut config = create_test_config(root.path(), 1, 8, 5000);
    config.scheduler.max_concurrent_jobs = 0;

    assert!(Scheduler::start(&config).is_err());
}
