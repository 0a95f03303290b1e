//! Leafpress Scheduler Library
//!
//! Renders PDF pages concurrently in worker processes.
//!
//! Engine handles cannot be shared between processes, so each worker
//! reopens the document from a process-transferable snapshot (a path or
//! the saved bytes), renders the one page it was given and closes
//! everything again. Results come back in request order.
//!
//! Any executable can act as the worker: call [`run_if_requested`] at the
//! top of `main`, or point `LEAFPRESS_WORKER_BIN` at the bundled
//! `leafpress-worker` binary.
//!
//! # Example
//!
//! ```no_run
//! use leafpress_core::{Document, RenderOptions};
//! use leafpress_scheduler::{ConcurrentRender, PoolConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! leafpress_scheduler::run_if_requested();
//!
//! let doc = Document::open("slides.pdf")?;
//! let options = RenderOptions::default();
//! let pages = doc.render_to_images(Some(&[0, 2]), &options, &PoolConfig::default())?;
//! for page in pages {
//!     let (index, image) = page?;
//!     image.save(format!("slide-{index}.png"))?;
//! }
//! # Ok(())
//! # }
//! ```

mod cancel;
mod concurrent;
mod config;
mod error;
mod invoker;
mod pool;
pub mod protocol;
pub mod worker;

pub use cancel::CancellationToken;
pub use concurrent::{ConcurrentRender, ImageStream};
pub use config::{PoolConfig, WorkerCommand, DEFAULT_TASK_TIMEOUT, PROCESSES_ENV, WORKER_BIN_ENV};
pub use error::PoolError;
pub use invoker::process_page;
pub use pool::{RenderPool, RenderStream};
pub use protocol::{RenderPayload, RenderResult, RenderTask, RendererKind};
pub use worker::{run_if_requested, WORKER_FLAG};
