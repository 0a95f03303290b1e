use crate::protocol::ProtocolError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("page index {index} is out of range for a document with {page_count} pages")]
    OutOfBounds { index: u32, page_count: u32 },

    #[error(transparent)]
    Document(#[from] leafpress_core::Error),

    #[error("worker failed to render page {index}: {message}")]
    Worker { index: u32, message: String },

    #[error("rendering page {index} exceeded the {timeout:?} deadline")]
    Timeout { index: u32, timeout: Duration },

    #[error("worker process exited while rendering page {index}")]
    WorkerExited { index: u32 },

    #[error("failed to spawn worker process '{}': {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("all worker processes stopped before every page was rendered")]
    Disconnected,
}

impl PoolError {
    /// Page index the failure belongs to, when there is one.
    pub fn page_index(&self) -> Option<u32> {
        match self {
            Self::OutOfBounds { index, .. }
            | Self::Worker { index, .. }
            | Self::Timeout { index, .. }
            | Self::WorkerExited { index } => Some(*index),
            _ => None,
        }
    }
}
