//! Worker-process side of the pool.
//!
//! A worker reads task frames from stdin until EOF and answers each with
//! exactly one result frame on stdout. Logging goes to stderr so it never
//! mixes with the protocol stream.

use crate::invoker::process_page;
use crate::protocol::{self, ProtocolError, Reply};
use pdf_engine::{Backend, Library};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::process::ExitCode;
use std::sync::Arc;

/// First argument that switches an executable into worker mode.
pub const WORKER_FLAG: &str = "--leafpress-worker";

/// Serve tasks from `input` until it is closed.
///
/// Rendering failures are reported back per task; only a broken pipe or a
/// malformed frame ends the loop with an error.
pub fn serve<R: Read, W: Write>(input: R, output: W) -> Result<(), ProtocolError> {
    let mut input = BufReader::new(input);
    let mut output = BufWriter::new(output);
    let mut library: Option<Arc<Library>> = None;
    let mut served = 0usize;

    while let Some(task) = protocol::read_task(&mut input)? {
        let reply: Reply = match library_for(&mut library, task.backend) {
            Ok(library) => process_page(&library, &task)
                .map_err(|err| (task.page_index, err.to_string())),
            Err(err) => Err((task.page_index, err.to_string())),
        };
        if let Err((index, message)) = &reply {
            log::debug!("page {index} failed: {message}");
        }
        protocol::write_reply(&mut output, &reply)?;
        served += 1;
    }

    log::debug!("input closed after {served} tasks");
    if let Some(library) = library {
        library.shutdown();
    }
    Ok(())
}

/// The engine is created on the first task and kept for the next ones.
fn library_for(
    slot: &mut Option<Arc<Library>>,
    backend: Backend,
) -> Result<Arc<Library>, pdf_engine::EngineError> {
    if let Some(library) = slot.as_ref().filter(|library| library.backend() == backend) {
        return Ok(Arc::clone(library));
    }
    if let Some(previous) = slot.take() {
        previous.shutdown();
    }
    let library = Arc::new(Library::new(backend)?);
    *slot = Some(Arc::clone(&library));
    Ok(library)
}

/// Entry point of a worker executable: log to stderr and serve stdio.
pub fn main() -> ExitCode {
    if serve_stdio() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Turn the current process into a worker if it was started with
/// [`WORKER_FLAG`]. Call first thing in `main`; returns normally otherwise.
pub fn run_if_requested() {
    if std::env::args_os().nth(1).is_some_and(|arg| arg == WORKER_FLAG) {
        std::process::exit(if serve_stdio() { 0 } else { 1 });
    }
}

fn serve_stdio() -> bool {
    init_logging();
    log::debug!("worker {} started", std::process::id());
    match serve(io::stdin().lock(), io::stdout().lock()) {
        Ok(()) => true,
        Err(err) => {
            log::error!("worker {} stopped: {err}", std::process::id());
            false
        }
    }
}

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .try_init();
}
