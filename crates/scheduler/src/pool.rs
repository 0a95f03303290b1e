//! Multi-process render pool.
//!
//! Every task is rendered by a separate worker process that reopens the
//! document from a shared snapshot, so no engine handle ever crosses a
//! process boundary. One supervisor thread per worker process pulls tasks
//! from a shared queue, pipes them to its child and forwards the reply.
//! [`RenderStream`] puts the replies back into request order.

use crate::cancel::CancellationToken;
use crate::config::{PoolConfig, WorkerCommand};
use crate::error::PoolError;
use crate::protocol::{self, ProtocolError, RenderResult, RenderTask, RendererKind, Reply};
use flume::{Receiver, RecvTimeoutError, Sender};
use leafpress_core::{Document, RenderOptions};
use std::collections::BTreeMap;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Outcome = Result<RenderResult, PoolError>;

/// The running child of one supervisor, shared so teardown can kill it.
type ChildSlot = Arc<Mutex<Option<Child>>>;

fn lock(slot: &ChildSlot) -> MutexGuard<'_, Option<Child>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Renders pages of a document in worker processes.
///
/// # Example
///
/// ```no_run
/// use leafpress_core::{Document, RenderOptions};
/// use leafpress_scheduler::{PoolConfig, RenderPool, RendererKind};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let doc = Document::open("report.pdf")?;
/// let pool = RenderPool::new(PoolConfig::new(4));
///
/// for result in pool.render(&doc, None, &RenderOptions::default(), RendererKind::Png)? {
///     let result = result?;
///     println!("page {} rendered", result.page_index);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct RenderPool {
    config: PoolConfig,
}

impl RenderPool {
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Render `pages` of `doc` (all pages for `None` or an empty slice).
    ///
    /// Every index is checked against the page count before any process is
    /// started.
    pub fn render(
        &self,
        doc: &Document,
        pages: Option<&[u32]>,
        options: &RenderOptions,
        renderer: RendererKind,
    ) -> Result<RenderStream, PoolError> {
        options.validate()?;
        let page_count = doc.page_count()?;
        let indices: Vec<u32> = match pages {
            None | Some([]) => (0..page_count).collect(),
            Some(pages) => {
                if let Some(&index) = pages.iter().find(|&&index| index >= page_count) {
                    return Err(PoolError::OutOfBounds { index, page_count });
                }
                pages.to_vec()
            }
        };
        if indices.is_empty() {
            return Ok(RenderStream::empty());
        }

        let source = doc.prepare_rendering_input()?;
        let tasks = indices
            .into_iter()
            .map(|page_index| RenderTask {
                page_index,
                renderer,
                source: source.clone(),
                password: doc.password().map(str::to_owned),
                file_access: doc.file_access(),
                options: *options,
                backend: doc.backend(),
            })
            .collect();
        self.run(tasks)
    }

    /// Dispatch prepared tasks. Results come back in the order of `tasks`.
    pub fn run(&self, tasks: Vec<RenderTask>) -> Result<RenderStream, PoolError> {
        if tasks.is_empty() {
            return Ok(RenderStream::empty());
        }
        let command = match &self.config.worker {
            Some(command) => command.clone(),
            None => WorkerCommand::from_env().map_err(|source| PoolError::Spawn {
                program: PathBuf::from("<current executable>"),
                source,
            })?,
        };
        let processes = self.config.processes.clamp(1, tasks.len());

        let (task_tx, task_rx) = flume::unbounded();
        let expected: Vec<u32> = tasks.iter().map(|task| task.page_index).collect();
        for queued in tasks.into_iter().enumerate() {
            task_tx.send(queued).map_err(|_| PoolError::Disconnected)?;
        }
        // Supervisors see a disconnected queue once it is drained.
        drop(task_tx);

        let (result_tx, result_rx) = flume::unbounded();
        let mut stream = RenderStream {
            results: Some(result_rx),
            expected,
            next: 0,
            pending: BTreeMap::new(),
            cancel: CancellationToken::new(),
            halt: CancellationToken::new(),
            children: Vec::with_capacity(processes),
            supervisors: Vec::with_capacity(processes),
            fused: false,
        };

        log::debug!(
            "rendering {} pages with {processes} worker processes ({})",
            stream.expected.len(),
            command.program.display()
        );
        for id in 0..processes {
            let child: ChildSlot = Arc::new(Mutex::new(None));
            let supervisor = Supervisor {
                id,
                command: command.clone(),
                timeout: self.config.task_timeout,
                tasks: task_rx.clone(),
                results: result_tx.clone(),
                cancel: stream.cancel.clone(),
                halt: stream.halt.clone(),
                child: Arc::clone(&child),
                process: None,
            };
            let handle = thread::Builder::new()
                .name(format!("leafpress-supervisor-{id}"))
                .spawn(move || supervisor.run())
                .map_err(|source| PoolError::Spawn { program: command.program.clone(), source })?;
            stream.children.push(child);
            stream.supervisors.push(handle);
        }

        Ok(stream)
    }
}

/// Results of one render call, in request order.
///
/// The stream is lazy and one-shot. After an error it yields nothing more;
/// tasks that were not dispatched yet are cancelled. Dropping the stream
/// early kills and reaps every worker process.
pub struct RenderStream {
    results: Option<Receiver<(usize, Outcome)>>,
    expected: Vec<u32>,
    next: usize,
    /// Replies that arrived ahead of their turn.
    pending: BTreeMap<usize, Outcome>,
    /// Set once a failure is seen: no further tasks are dispatched.
    cancel: CancellationToken,
    /// Set on teardown: workers are killed.
    halt: CancellationToken,
    children: Vec<ChildSlot>,
    supervisors: Vec<JoinHandle<()>>,
    fused: bool,
}

impl RenderStream {
    fn empty() -> Self {
        Self {
            results: None,
            expected: Vec::new(),
            next: 0,
            pending: BTreeMap::new(),
            cancel: CancellationToken::new(),
            halt: CancellationToken::new(),
            children: Vec::new(),
            supervisors: Vec::new(),
            fused: false,
        }
    }

    /// Page indices in the order results are yielded.
    pub fn page_indices(&self) -> &[u32] {
        &self.expected
    }

    /// Number of worker processes serving this stream.
    pub fn processes(&self) -> usize {
        self.children.len()
    }

    fn next_outcome(&mut self) -> Outcome {
        loop {
            if let Some(outcome) = self.pending.remove(&self.next) {
                return outcome;
            }
            let Some(results) = &self.results else {
                return Err(PoolError::Disconnected);
            };
            match results.recv() {
                Ok((position, outcome)) => {
                    if let Err(err) = &outcome {
                        log::debug!("task {position} failed: {err}");
                        self.cancel.cancel();
                    }
                    self.pending.insert(position, outcome);
                }
                Err(_) => return Err(PoolError::Disconnected),
            }
        }
    }

    /// Stop every supervisor. With `kill`, running workers are killed
    /// instead of being allowed to drain. Idempotent.
    fn shutdown(&mut self, kill: bool) {
        if self.supervisors.is_empty() {
            return;
        }
        if kill {
            self.cancel.cancel();
            self.halt.cancel();
            for slot in &self.children {
                if let Some(child) = lock(slot).as_mut() {
                    if let Err(err) = child.kill() {
                        log::debug!("worker {} already gone: {err}", child.id());
                    }
                }
            }
        }
        for handle in self.supervisors.drain(..) {
            if handle.join().is_err() {
                log::error!("render supervisor thread panicked");
            }
        }
        self.results = None;
        self.pending.clear();
    }
}

impl Iterator for RenderStream {
    type Item = Outcome;

    fn next(&mut self) -> Option<Outcome> {
        if self.fused || self.next >= self.expected.len() {
            self.shutdown(false);
            return None;
        }

        let outcome = self.next_outcome();
        let expected = self.expected[self.next];
        self.next += 1;

        match outcome {
            Ok(result) => {
                assert_eq!(
                    result.page_index, expected,
                    "worker result out of order at position {}",
                    self.next - 1
                );
                if self.next == self.expected.len() {
                    self.shutdown(false);
                }
                Some(Ok(result))
            }
            Err(err) => {
                self.fused = true;
                self.shutdown(true);
                Some(Err(err))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.fused {
            return (0, Some(0));
        }
        (0, Some(self.expected.len() - self.next))
    }
}

impl Drop for RenderStream {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

/// A live worker process as seen by its supervisor.
struct WorkerProcess {
    stdin: BufWriter<ChildStdin>,
    replies: Receiver<Result<Reply, ProtocolError>>,
    reader: JoinHandle<()>,
}

struct Supervisor {
    id: usize,
    command: WorkerCommand,
    timeout: Option<Duration>,
    tasks: Receiver<(usize, RenderTask)>,
    results: Sender<(usize, Outcome)>,
    cancel: CancellationToken,
    halt: CancellationToken,
    child: ChildSlot,
    process: Option<WorkerProcess>,
}

impl Supervisor {
    fn run(mut self) {
        while !self.cancel.is_cancelled() {
            let Ok((position, task)) = self.tasks.recv() else {
                break;
            };
            let outcome = self.dispatch(&task);
            if self.results.send((position, outcome)).is_err() {
                break;
            }
        }
        self.stop();
    }

    fn dispatch(&mut self, task: &RenderTask) -> Outcome {
        let index = task.page_index;
        if self.process.is_none() {
            let process = self.spawn()?;
            self.process = Some(process);
        }
        if self.halt.is_cancelled() {
            // Teardown may have missed a child spawned just now.
            self.discard();
            return Err(PoolError::WorkerExited { index });
        }
        let Some(process) = self.process.as_mut() else {
            return Err(PoolError::WorkerExited { index });
        };

        if let Err(err) = protocol::write_task(&mut process.stdin, task) {
            self.discard();
            return Err(match err {
                ProtocolError::Io(_) => PoolError::WorkerExited { index },
                other => other.into(),
            });
        }

        let reply = match self.timeout {
            Some(timeout) => match process.replies.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "page {index} did not render within {timeout:?}; killing its worker"
                    );
                    self.discard();
                    return Err(PoolError::Timeout { index, timeout });
                }
                other => other.ok(),
            },
            None => process.replies.recv().ok(),
        };

        match reply {
            Some(Ok(Ok(result))) => Ok(result),
            Some(Ok(Err((index, message)))) => Err(PoolError::Worker { index, message }),
            Some(Err(err)) => {
                self.discard();
                Err(err.into())
            }
            None => {
                self.discard();
                Err(PoolError::WorkerExited { index })
            }
        }
    }

    fn spawn(&self) -> Result<WorkerProcess, PoolError> {
        let spawn_error = |source: io::Error| PoolError::Spawn {
            program: self.command.program.clone(),
            source,
        };
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_error)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            reap(child, true);
            return Err(spawn_error(io::Error::other("worker stdio was not captured")));
        };

        let (reply_tx, reply_rx) = flume::unbounded();
        let reader = match thread::Builder::new()
            .name(format!("leafpress-worker-reader-{}", self.id))
            .spawn(move || read_replies(stdout, reply_tx))
        {
            Ok(reader) => reader,
            Err(err) => {
                reap(child, true);
                return Err(spawn_error(err));
            }
        };

        log::debug!("supervisor {} started worker process {}", self.id, child.id());
        *lock(&self.child) = Some(child);
        Ok(WorkerProcess { stdin: BufWriter::new(stdin), replies: reply_rx, reader })
    }

    /// Kill the current worker; the next task starts a fresh one.
    fn discard(&mut self) {
        self.release(true);
    }

    /// Close the worker's input and wait for it to exit.
    fn stop(&mut self) {
        let kill = self.halt.is_cancelled();
        self.release(kill);
    }

    fn release(&mut self, kill: bool) {
        let Some(process) = self.process.take() else {
            return;
        };
        drop(process.stdin);
        if let Some(child) = lock(&self.child).take() {
            reap(child, kill);
        }
        if process.reader.join().is_err() {
            log::error!("reply reader of supervisor {} panicked", self.id);
        }
    }
}

fn reap(mut child: Child, kill: bool) {
    let pid = child.id();
    if kill {
        if let Err(err) = child.kill() {
            log::debug!("worker {pid} already exited: {err}");
        }
    }
    match child.wait() {
        Ok(status) => log::debug!("worker {pid} exited with {status}"),
        Err(err) => log::warn!("failed to reap worker {pid}: {err}"),
    }
}

fn read_replies(stdout: ChildStdout, replies: Sender<Result<Reply, ProtocolError>>) {
    let mut reader = BufReader::new(stdout);
    loop {
        match protocol::read_reply(&mut reader) {
            Ok(Some(reply)) => {
                if replies.send(Ok(reply)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = replies.send(Err(err));
                break;
            }
        }
    }
}
