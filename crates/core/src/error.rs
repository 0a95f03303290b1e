use pdf_engine::{EngineError, LoadFailure};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("file does not exist: '{}'", .0.display())]
    NotFound(PathBuf),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// The engine refused the document; `reason` is what it reported.
    #[error("failed to load document (engine: {reason})")]
    Decode { reason: LoadFailure, detail: String },

    #[error("page index {index} out of bounds (page_count={page_count})")]
    OutOfBounds { index: u32, page_count: u32 },

    #[error("failed to save document: {0}")]
    Save(String),

    #[error("document is closed")]
    DocumentClosed,

    #[error("page is closed")]
    PageClosed,

    #[error("invalid render options: {0}")]
    InvalidRenderOptions(String),

    #[error("engine error: {0}")]
    Engine(EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Load { reason, detail } => Self::Decode { reason, detail },
            EngineError::PageOutOfRange { page, page_count } => {
                Self::OutOfBounds { index: page, page_count }
            }
            EngineError::Save(message) => Self::Save(message),
            other => Self::Engine(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
