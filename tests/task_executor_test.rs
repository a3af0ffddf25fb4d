//! Task executor against real processes.
#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus_ensemble::core::{ResourcePool, TaskError, TaskExecutor, TaskSpec, TaskState};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

const POLL: Duration = Duration::from_millis(20);

fn executor(units: u32) -> TaskExecutor {
    TaskExecutor::new(Arc::new(ResourcePool::new(units))).with_kill_grace(Duration::from_millis(500))
}

fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("ensemble-{name}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

// ============================================================================
// TESTS
// ============================================================================

#[test]
fn test_finished_task_releases_units() {
    let exec = executor(4);
    let handle = exec.submit(TaskSpec::new("true").units(3)).unwrap();
    assert_eq!(exec.resources().free_units(), 1);

    let state = exec.wait(handle, POLL, Some(Duration::from_secs(10))).unwrap();
    assert_eq!(state, TaskState::Finished(0));
    assert_eq!(exec.resources().free_units(), 4);
    assert_eq!(exec.running_count(), 0);

    // Terminal state is sticky and units are not released twice.
    assert_eq!(exec.poll(handle).unwrap(), TaskState::Finished(0));
    assert_eq!(exec.resources().free_units(), 4);
}

#[test]
fn test_nonzero_exit_code_reported() {
    let exec = executor(1);
    let handle = exec.submit(TaskSpec::new("sh").args(["-c", "exit 3"])).unwrap();
    assert_eq!(exec.wait(handle, POLL, None).unwrap(), TaskState::Finished(3));
}

#[test]
fn test_task_timeout_kills_and_releases() {
    let exec = executor(2);
    let handle = exec
        .submit(TaskSpec::new("sleep").arg("5").units(2).timeout(Duration::from_millis(100)))
        .unwrap();
    assert_eq!(exec.resources().free_units(), 0);

    let started = Instant::now();
    let state = exec.wait(handle, POLL, None).unwrap();
    assert_eq!(state, TaskState::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(exec.resources().free_units(), 2);
    assert_eq!(exec.info(handle).unwrap().state, TaskState::TimedOut);
}

#[test]
fn test_timed_out_units_free_after_one_poll() {
    let exec = executor(3);
    let handle = exec
        .submit(TaskSpec::new("sleep").arg("5").units(3).timeout(Duration::from_millis(50)))
        .unwrap();
    std::thread::sleep(Duration::from_millis(150));

    assert_eq!(exec.poll(handle).unwrap(), TaskState::TimedOut);
    assert_eq!(exec.resources().free_units(), 3);
}

#[test]
fn test_wait_deadline_times_out_task() {
    let exec = executor(1);
    let handle = exec.submit(TaskSpec::new("sleep").arg("5").units(1)).unwrap();
    let state = exec.wait(handle, POLL, Some(Duration::from_millis(100))).unwrap();
    assert_eq!(state, TaskState::TimedOut);
    assert_eq!(exec.resources().free_units(), 1);
}

#[test]
fn test_kill_running_task() {
    let exec = executor(2);
    let handle = exec.submit(TaskSpec::new("sleep").arg("5").units(1)).unwrap();
    assert_eq!(exec.poll(handle).unwrap(), TaskState::Running);
    assert_eq!(exec.running_count(), 1);

    assert_eq!(exec.kill(handle).unwrap(), TaskState::Killed);
    assert_eq!(exec.resources().free_units(), 2);
    // Killing again reports the existing terminal state.
    assert_eq!(exec.kill(handle).unwrap(), TaskState::Killed);
    assert_eq!(exec.resources().free_units(), 2);
}

#[test]
fn test_insufficient_resources_rejected() {
    let exec = executor(2);
    let first = exec.submit(TaskSpec::new("sleep").arg("5").units(2)).unwrap();

    let err = exec.submit(TaskSpec::new("true").units(1)).unwrap_err();
    assert!(matches!(
        err,
        TaskError::InsufficientResources {
            requested: 1,
            free: 0
        }
    ));

    exec.kill(first).unwrap();
    assert!(exec.submit(TaskSpec::new("true").units(1)).is_ok());
}

#[test]
fn test_spawn_failure_releases_reservation() {
    let exec = executor(3);
    let err = exec
        .submit(TaskSpec::new("/nonexistent/ensemble-task").units(3))
        .unwrap_err();
    assert!(matches!(err, TaskError::Spawn { .. }));
    assert_eq!(exec.resources().free_units(), 3);
}

#[test]
fn test_shutdown_kills_outstanding_tasks() {
    let exec = executor(4);
    let a = exec.submit(TaskSpec::new("sleep").arg("5").units(2)).unwrap();
    let b = exec.submit(TaskSpec::new("sleep").arg("5").units(2)).unwrap();
    assert_eq!(exec.running_count(), 2);

    exec.shutdown().unwrap();
    assert_eq!(exec.running_count(), 0);
    assert_eq!(exec.resources().free_units(), 4);
    assert_eq!(exec.info(a).unwrap().state, TaskState::Killed);
    assert_eq!(exec.info(b).unwrap().state, TaskState::Killed);
}

#[test]
fn test_drop_releases_units() {
    let pool = Arc::new(ResourcePool::new(2));
    {
        let exec = TaskExecutor::new(Arc::clone(&pool)).with_kill_grace(Duration::from_millis(200));
        exec.submit(TaskSpec::new("sleep").arg("5").units(2)).unwrap();
        assert_eq!(pool.free_units(), 0);
    }
    assert_eq!(pool.free_units(), 2);
}

#[test]
fn test_stdout_redirected_to_workdir() {
    let dir = scratch_dir("stdout");
    let exec = executor(1);
    let handle = exec
        .submit(
            TaskSpec::new("sh")
                .args(["-c", "echo $ENSEMBLE_GREETING"])
                .env("ENSEMBLE_GREETING", "hello")
                .workdir(&dir)
                .stdout("out.txt"),
        )
        .unwrap();
    assert_eq!(exec.wait(handle, POLL, None).unwrap(), TaskState::Finished(0));

    let out = std::fs::read_to_string(dir.join("out.txt")).unwrap();
    assert_eq!(out.trim(), "hello");
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn test_unknown_handle_rejected() {
    let a = executor(1);
    let b = executor(1);
    let handle = a.submit(TaskSpec::new("true")).unwrap();
    a.wait(handle, POLL, None).unwrap();
    assert!(b.info(handle).is_none());
    assert!(matches!(b.poll(handle), Err(TaskError::UnknownTask(1))));
}

#[test]
fn test_kill_escalation_does_not_block_other_callers() {
    let exec = Arc::new(
        TaskExecutor::new(Arc::new(ResourcePool::new(2))).with_kill_grace(Duration::from_secs(1)),
    );
    let stubborn = exec
        .submit(TaskSpec::new("sh").args(["-c", "trap '' TERM; sleep 5"]).units(1))
        .unwrap();
    let other = exec.submit(TaskSpec::new("sleep").arg("5").units(1)).unwrap();
    // Let the shell install its trap before the kill starts.
    std::thread::sleep(Duration::from_millis(200));

    let killer = {
        let exec = Arc::clone(&exec);
        std::thread::spawn(move || exec.kill(stubborn).unwrap())
    };
    std::thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    assert_eq!(exec.poll(other).unwrap(), TaskState::Running);
    assert_eq!(exec.info(other).unwrap().state, TaskState::Running);
    assert_eq!(exec.running_count(), 2);
    assert!(started.elapsed() < Duration::from_millis(500));

    assert_eq!(killer.join().unwrap(), TaskState::Killed);
    assert_eq!(exec.resources().free_units(), 1);
    assert_eq!(exec.kill(other).unwrap(), TaskState::Killed);
    assert_eq!(exec.resources().free_units(), 2);
}

#[test]
fn test_prune_drops_only_terminal_tasks() {
    let exec = executor(2);
    let done = exec.submit(TaskSpec::new("true")).unwrap();
    let running = exec.submit(TaskSpec::new("sleep").arg("5").units(1)).unwrap();
    assert_eq!(exec.wait(done, POLL, None).unwrap(), TaskState::Finished(0));

    let pruned = exec.prune();
    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].state, TaskState::Finished(0));
    assert!(exec.info(done).is_none());
    assert!(matches!(exec.poll(done), Err(TaskError::UnknownTask(_))));
    assert_eq!(exec.poll(running).unwrap(), TaskState::Running);

    exec.kill(running).unwrap();
    assert_eq!(exec.prune().len(), 1);
    assert!(exec.prune().is_empty());
    assert_eq!(exec.resources().free_units(), 2);
}

#[tokio::test]
async fn test_wait_async_finishes() {
    let exec = executor(1);
    let handle = exec
        .submit(TaskSpec::new("sh").args(["-c", "sleep 0.1"]).units(1))
        .unwrap();
    let state = exec.wait_async(handle, POLL, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(state, TaskState::Finished(0));
    assert_eq!(exec.resources().free_units(), 1);
    assert!(exec.info(handle).unwrap().runtime >= Duration::from_millis(50));
}
