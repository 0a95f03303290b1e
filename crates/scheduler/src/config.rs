//! Pool configuration.

use crate::worker::WORKER_FLAG;
use std::ffi::OsString;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Overrides the number of worker processes.
pub const PROCESSES_ENV: &str = "LEAFPRESS_PROCESSES";
/// Path to a dedicated worker executable, e.g. `leafpress-worker`.
pub const WORKER_BIN_ENV: &str = "LEAFPRESS_WORKER_BIN";

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    /// Run `program` with no extra arguments; it must serve the worker
    /// protocol on stdin/stdout.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Re-run the current executable in worker mode. The executable must
    /// call [`crate::run_if_requested`] at the top of `main`.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg(WORKER_FLAG))
    }

    /// `LEAFPRESS_WORKER_BIN` if set, otherwise [`WorkerCommand::current_exe`].
    pub fn from_env() -> std::io::Result<Self> {
        match std::env::var_os(WORKER_BIN_ENV) {
            Some(program) if !program.is_empty() => Ok(Self::new(program)),
            _ => Self::current_exe(),
        }
    }
}

/// Configuration for a render pool.
///
/// # Example
///
/// ```
/// use leafpress_scheduler::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::new(4).with_task_timeout(Some(Duration::from_secs(5)));
/// assert_eq!(config.processes, 4);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on worker processes. Never more are spawned than there
    /// are tasks.
    pub processes: usize,

    /// Deadline for a single page. `None` waits forever.
    /// Default: 60 seconds.
    pub task_timeout: Option<Duration>,

    /// Worker executable; `None` resolves [`WorkerCommand::from_env`] when
    /// the pool starts.
    pub worker: Option<WorkerCommand>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            processes: default_processes(),
            task_timeout: Some(DEFAULT_TASK_TIMEOUT),
            worker: None,
        }
    }
}

impl PoolConfig {
    pub fn new(processes: usize) -> Self {
        Self { processes: processes.max(1), ..Self::default() }
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = Some(worker);
        self
    }
}

/// `LEAFPRESS_PROCESSES`, or the host's available parallelism.
fn default_processes() -> usize {
    if let Ok(value) = std::env::var(PROCESSES_ENV) {
        match value.trim().parse::<usize>() {
            Ok(n) if n > 0 => return n,
            _ => log::warn!("ignoring invalid {PROCESSES_ENV}={value:?}"),
        }
    }
    thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}
