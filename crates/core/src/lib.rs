//! Document and page layer over the PDF engine.
//!
//! Input normalization, the document/page lifecycle with cascading close,
//! outline and metadata readers, and page rendering options.

pub mod document;
pub mod error;
pub mod input;
pub mod outline;
pub mod page;
pub mod render;

pub use document::{Document, Metadata, OpenOptions, RenderSource, METADATA_KEYS};
pub use error::{Error, Result};
pub use input::{resolve_path, FileAccess, InputBuffer, NativeDocument, PdfInput, SharedBuffer};
pub use outline::{OutlineItem, Toc, DEFAULT_MAX_DEPTH};
pub use page::Page;
pub use pdf_engine::{Backend, LoadFailure, PageSize, ViewMode};
pub use render::{Crop, PixelFormat, RenderOptions, RenderedPage};
