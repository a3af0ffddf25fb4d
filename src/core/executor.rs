//! Task executor: launches and supervises external processes on behalf of a
//! simulator.
//!
//! Each task reserves its resource units from the executor's pool (usually
//! the worker's scoped pool) before the process is spawned. Every terminal
//! transition (`Finished`, `Killed`, `TimedOut`) releases those units exactly
//! once, whether it is observed by [`TaskExecutor::poll`], by a wait, by an
//! explicit kill, or by [`TaskExecutor::shutdown`] / drop.
//!
//! ```rust,ignore
//! let pool = ctx.resources().unwrap_or_else(|| Arc::new(ResourcePool::new(0)));
//! let executor = TaskExecutor::new(pool);
//! let handle = executor.submit(
//!     TaskSpec::new("./forces.x").arg("input.txt").units(2).timeout(Duration::from_secs(60)),
//! )?;
//! match executor.wait(handle, Duration::from_millis(100), None)? {
//!     TaskState::Finished(0) => { /* read outputs */ }
//!     other => { /* failed, killed or timed out */ }
//! }
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::core::error::TaskError;
use crate::core::resource_pool::{Holder, ReservationHandle, ReserveOutcome, ResourcePool, TaskId};

/// Default time a task gets to exit after SIGTERM before it is SIGKILLed.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Description of an external job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Program to run.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory; the current one when unset.
    pub workdir: Option<PathBuf>,
    /// Resource units held while the task runs.
    pub units: u32,
    /// Kill the task when it runs longer than this.
    pub timeout: Option<Duration>,
    /// File (relative to `workdir`) receiving stdout; discarded when unset.
    pub stdout: Option<String>,
    /// File (relative to `workdir`) receiving stderr; discarded when unset.
    pub stderr: Option<String>,
}

impl TaskSpec {
    /// Task running `program` with no arguments and no units.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run inside `dir`.
    #[must_use]
    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Hold `units` resource units.
    #[must_use]
    pub const fn units(mut self, units: u32) -> Self {
        self.units = units;
        self
    }

    /// Kill after `timeout`.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Redirect stdout to `file` inside the workdir.
    #[must_use]
    pub fn stdout(mut self, file: impl Into<String>) -> Self {
        self.stdout = Some(file.into());
        self
    }

    /// Redirect stderr to `file` inside the workdir.
    #[must_use]
    pub fn stderr(mut self, file: impl Into<String>) -> Self {
        self.stderr = Some(file.into());
        self
    }

    fn output_path(&self, file: &str) -> PathBuf {
        self.workdir
            .as_ref()
            .map_or_else(|| PathBuf::from(file), |dir| dir.join(file))
    }
}

/// Handle returned by [`TaskExecutor::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    id: TaskId,
}

impl TaskHandle {
    /// Task id, unique per executor.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }
}

/// Lifecycle of a task. The last three states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted, process not started yet.
    Submitted,
    /// Process running.
    Running,
    /// Process exited on its own with this code.
    Finished(i32),
    /// Process was killed by [`TaskExecutor::kill`], shutdown, or a signal.
    Killed,
    /// Process exceeded its timeout and was killed.
    TimedOut,
}

impl TaskState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished(_) | Self::Killed | Self::TimedOut)
    }
}

/// Accounting for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task id.
    pub id: TaskId,
    /// Program that was launched.
    pub program: String,
    /// Current state.
    pub state: TaskState,
    /// Units held (or held until termination).
    pub units: u32,
    /// Time from launch to termination, or to now while running.
    pub runtime: Duration,
}

struct Task {
    program: String,
    units: u32,
    /// Taken out while a caller escalates a kill without holding the lock.
    child: Option<Child>,
    state: TaskState,
    reservation: Option<ReservationHandle>,
    started: Instant,
    ended: Option<Instant>,
    timeout: Option<Duration>,
}

impl Task {
    fn runtime(&self) -> Duration {
        self.ended.unwrap_or_else(Instant::now) - self.started
    }

    fn info(&self, id: TaskId) -> TaskInfo {
        TaskInfo {
            id,
            program: self.program.clone(),
            state: self.state,
            units: self.units,
            runtime: self.runtime(),
        }
    }

    /// Exit state if the process has ended on its own.
    fn exited(&mut self) -> std::io::Result<Option<TaskState>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        Ok(child
            .try_wait()?
            .map(|status| status.code().map_or(TaskState::Killed, TaskState::Finished)))
    }
}

/// Launches and supervises external processes.
pub struct TaskExecutor {
    resources: Arc<ResourcePool>,
    tasks: Mutex<HashMap<TaskId, Task>>,
    next_id: AtomicU64,
    kill_grace: Duration,
}

impl TaskExecutor {
    /// Executor drawing units from `resources`.
    #[must_use]
    pub fn new(resources: Arc<ResourcePool>) -> Self {
        Self {
            resources,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Change the SIGTERM → SIGKILL grace period.
    #[must_use]
    pub const fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Pool the executor reserves from.
    #[must_use]
    pub fn resources(&self) -> &ResourcePool {
        &self.resources
    }

    /// Reserve units and launch the process. Returns without waiting.
    ///
    /// # Errors
    ///
    /// - [`TaskError::InsufficientResources`] when the pool cannot cover
    ///   `spec.units` right now; nothing is launched.
    /// - [`TaskError::Spawn`] / [`TaskError::Io`] when the process or its
    ///   output files cannot be created; the reservation is released.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskHandle, TaskError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reservation = if spec.units == 0 {
            None
        } else {
            match self.resources.reserve(spec.units, Holder::Task(id)) {
                ReserveOutcome::Reserved(handle) => Some(handle),
                ReserveOutcome::Insufficient { requested, free } => {
                    return Err(TaskError::InsufficientResources { requested, free });
                }
            }
        };

        let child = match spawn(&spec) {
            Ok(child) => child,
            Err(err) => {
                if let Some(handle) = reservation {
                    self.resources.release(handle)?;
                }
                return Err(err);
            }
        };

        info!(task_id = id, program = %spec.program, pid = child.id(), units = spec.units, "task launched");
        self.tasks.lock().insert(
            id,
            Task {
                program: spec.program,
                units: spec.units,
                child: Some(child),
                state: TaskState::Running,
                reservation,
                started: Instant::now(),
                ended: None,
                timeout: spec.timeout,
            },
        );
        Ok(TaskHandle { id })
    }

    /// Non-blocking status check. Enforces the task's timeout.
    ///
    /// # Errors
    ///
    /// [`TaskError::UnknownTask`] for a handle from another executor, or I/O
    /// errors from inspecting or killing the process.
    pub fn poll(&self, handle: TaskHandle) -> Result<TaskState, TaskError> {
        let child = {
            let mut tasks = self.tasks.lock();
            let task = tasks.get_mut(&handle.id).ok_or(TaskError::UnknownTask(handle.id))?;
            if task.state.is_terminal() {
                return Ok(task.state);
            }
            if let Some(state) = task.exited()? {
                debug!(task_id = handle.id, ?state, "task exited");
                self.settle(handle.id, task, state)?;
                return Ok(state);
            }
            if !task.timeout.is_some_and(|limit| task.started.elapsed() >= limit) {
                return Ok(task.state);
            }
            let Some(child) = task.child.take() else {
                return Ok(task.state);
            };
            warn!(task_id = handle.id, program = %task.program, "task timed out, killing");
            child
        };
        self.escalate(handle.id, child, TaskState::TimedOut)
    }

    /// Poll every `poll_interval` until the task reaches a terminal state.
    /// If `timeout` elapses first, the task is killed and reported
    /// [`TaskState::TimedOut`].
    ///
    /// # Errors
    ///
    /// As for [`TaskExecutor::poll`].
    pub fn wait(
        &self,
        handle: TaskHandle,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<TaskState, TaskError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let state = self.poll(handle)?;
            if state.is_terminal() {
                return Ok(state);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let state = self.stop(handle, TaskState::TimedOut)?;
                if state.is_terminal() {
                    return Ok(state);
                }
            }
            std::thread::sleep(poll_interval);
        }
    }

    /// Async variant of [`TaskExecutor::wait`] for async simulators.
    ///
    /// # Errors
    ///
    /// As for [`TaskExecutor::poll`].
    pub async fn wait_async(
        &self,
        handle: TaskHandle,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<TaskState, TaskError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let state = self.poll(handle)?;
            if state.is_terminal() {
                return Ok(state);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let state = self.stop(handle, TaskState::TimedOut)?;
                if state.is_terminal() {
                    return Ok(state);
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Terminate the task: SIGTERM, then SIGKILL after the grace period.
    /// Returns the terminal state, which is the earlier one if the task had
    /// already ended. While another caller is still escalating the same task
    /// the current (running) state is returned.
    ///
    /// The escalation runs without holding the executor's lock, so other
    /// tasks can be polled meanwhile.
    ///
    /// # Errors
    ///
    /// As for [`TaskExecutor::poll`].
    pub fn kill(&self, handle: TaskHandle) -> Result<TaskState, TaskError> {
        self.stop(handle, TaskState::Killed)
    }

    /// Accounting for one task.
    #[must_use]
    pub fn info(&self, handle: TaskHandle) -> Option<TaskInfo> {
        self.tasks.lock().get(&handle.id).map(|task| task.info(handle.id))
    }

    /// Drop the records of terminal tasks and return their final accounting.
    /// Handles of pruned tasks become unknown.
    pub fn prune(&self) -> Vec<TaskInfo> {
        let mut tasks = self.tasks.lock();
        let done: Vec<TaskId> = tasks
            .iter()
            .filter(|(_, t)| t.state.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        let mut pruned: Vec<TaskInfo> = done
            .into_iter()
            .filter_map(|id| tasks.remove(&id).map(|t| t.info(id)))
            .collect();
        pruned.sort_by_key(|info| info.id);
        pruned
    }

    /// Tasks not yet in a terminal state.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|t| !t.state.is_terminal())
            .count()
    }

    /// Kill every outstanding task and release its units.
    ///
    /// # Errors
    ///
    /// Returns the first error met; remaining tasks are still processed.
    pub fn shutdown(&self) -> Result<(), TaskError> {
        let ids: Vec<TaskId> = {
            let tasks = self.tasks.lock();
            tasks
                .iter()
                .filter(|(_, t)| !t.state.is_terminal())
                .map(|(id, _)| *id)
                .collect()
        };
        if !ids.is_empty() {
            info!(outstanding = ids.len(), "killing outstanding tasks");
        }
        let mut first_err = None;
        for id in ids {
            if let Err(err) = self.stop(TaskHandle { id }, TaskState::Killed) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn stop(&self, handle: TaskHandle, state: TaskState) -> Result<TaskState, TaskError> {
        let child = {
            let mut tasks = self.tasks.lock();
            let task = tasks.get_mut(&handle.id).ok_or(TaskError::UnknownTask(handle.id))?;
            if task.state.is_terminal() {
                return Ok(task.state);
            }
            // The process may have exited since the last poll.
            if let Some(exited) = task.exited()? {
                self.settle(handle.id, task, exited)?;
                return Ok(exited);
            }
            let Some(child) = task.child.take() else {
                return Ok(task.state);
            };
            info!(task_id = handle.id, program = %task.program, ?state, "stopping task");
            child
        };
        self.escalate(handle.id, child, state)
    }

    /// Terminate `child` with the lock released, then record `state`. On a
    /// failed kill the child goes back so a later call can retry.
    fn escalate(&self, id: TaskId, mut child: Child, state: TaskState) -> Result<TaskState, TaskError> {
        let outcome = terminate(&mut child, self.kill_grace);
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&id).ok_or(TaskError::UnknownTask(id))?;
        if let Err(err) = outcome {
            task.child = Some(child);
            return Err(err.into());
        }
        self.settle(id, task, state)?;
        Ok(state)
    }

    fn settle(&self, id: TaskId, task: &mut Task, state: TaskState) -> Result<(), TaskError> {
        task.state = state;
        task.ended = Some(Instant::now());
        if let Some(handle) = task.reservation.take() {
            self.resources.release(handle)?;
            debug!(task_id = id, units = task.units, "task units released");
        }
        Ok(())
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "failed to clean up tasks on drop");
        }
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("resources", &self.resources)
            .field("running", &self.running_count())
            .field("kill_grace", &self.kill_grace)
            .finish()
    }
}

fn spawn(spec: &TaskSpec) -> Result<Child, TaskError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null());
    if let Some(dir) = &spec.workdir {
        command.current_dir(dir);
    }
    command.stdout(match &spec.stdout {
        Some(file) => Stdio::from(File::create(spec.output_path(file))?),
        None => Stdio::null(),
    });
    command.stderr(match &spec.stderr {
        Some(file) => Stdio::from(File::create(spec.output_path(file))?),
        None => Stdio::null(),
    });
    command.spawn().map_err(|source| TaskError::Spawn {
        program: spec.program.clone(),
        source,
    })
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps the child.
fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(child.id()) {
            if kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok() && child.wait_timeout(grace)?.is_some() {
                return Ok(());
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    match child.kill() {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => {}
        Err(err) => return Err(err),
    }
    child.wait().map(|_| ())
}
