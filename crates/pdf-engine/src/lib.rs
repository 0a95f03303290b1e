//! PDF engine boundary.
//!
//! Everything that touches engine-managed memory goes through [`PdfEngine`].
//! Documents, pages and bookmarks are referred to by opaque handles; an
//! engine rejects unknown or closed handles with [`EngineError::InvalidHandle`]
//! instead of touching freed memory.
//!
//! Engines are not shareable across threads without external locking, so a
//! process reaches its engine through a [`Library`], which serializes access
//! and owns the process-wide init/teardown lifecycle.

use image::{ImageBuffer, Rgba};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Seek};
use std::path::Path;

mod library;
mod lopdf_backend;

#[cfg(feature = "pdfium")]
pub mod pdfium_backend;

#[cfg(any(test, feature = "test-utils"))]
pub mod fixtures;

pub use library::{global, initialize, shutdown, Backend, Library, LibraryGuard, BACKEND_ENV};
pub use lopdf_backend::LopdfEngine;

pub type RgbaImage = ImageBuffer<Rgba<u8>, Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentHandle(u64);

impl DocumentHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle(u64);

impl PageHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Identity of an outline node.
///
/// Two handles compare equal exactly when they refer to the same node in the
/// engine, which is what cycle detection over malformed outlines relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BookmarkHandle(u64);

impl BookmarkHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width_pt: f32,
    pub height_pt: f32,
}

impl PageSize {
    pub fn new(width_pt: f32, height_pt: f32) -> Self {
        Self { width_pt, height_pt }
    }
}

/// Parameters the engine needs to rasterize a page.
///
/// Cropping, rotation and pixel format conversion happen on the host side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderRequest {
    pub scale: f32,
    pub fill_color: [u8; 4],
    pub grayscale: bool,
    pub draw_annotations: bool,
    pub draw_forms: bool,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            scale: 1.0,
            fill_color: [255, 255, 255, 255],
            grayscale: false,
            draw_annotations: true,
            draw_forms: true,
        }
    }
}

/// Something the engine can pull document bytes from.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

pub enum OpenSource<'a> {
    Path(&'a Path),
    Bytes(&'a [u8]),
    Reader(&'a mut dyn ReadSeek),
}

impl fmt::Debug for OpenSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Reader(_) => f.write_str("Reader"),
        }
    }
}

/// Reason an engine gave for refusing to load a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadFailure {
    Unknown,
    File,
    Format,
    Password,
    Security,
    Page,
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "Unknown error",
            Self::File => "File access error",
            Self::Format => "Data format error",
            Self::Password => "Incorrect password error",
            Self::Security => "Unsupported security scheme error",
            Self::Page => "Page not found or content error",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid handle {0}")]
    InvalidHandle(u64),
    #[error("page {page} out of range (page_count={page_count})")]
    PageOutOfRange { page: u32, page_count: u32 },
    #[error("{reason}: {detail}")]
    Load { reason: LoadFailure, detail: String },
    #[error("save failed: {0}")]
    Save(String),
    #[error("the engine library has been shut down")]
    LibraryShutDown,
    #[error("backend error: {0}")]
    Backend(String),
}

/// Outline destination view modes, as named in the PDF reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewMode {
    Unknown,
    Xyz,
    Fit,
    FitH,
    FitV,
    FitR,
    FitB,
    FitBH,
    FitBV,
}

impl ViewMode {
    pub fn from_name(name: &[u8]) -> Self {
        match name {
            b"XYZ" => Self::Xyz,
            b"Fit" => Self::Fit,
            b"FitH" => Self::FitH,
            b"FitV" => Self::FitV,
            b"FitR" => Self::FitR,
            b"FitB" => Self::FitB,
            b"FitBH" => Self::FitBH,
            b"FitBV" => Self::FitBV,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "?",
            Self::Xyz => "XYZ",
            Self::Fit => "Fit",
            Self::FitH => "FitH",
            Self::FitV => "FitV",
            Self::FitR => "FitR",
            Self::FitB => "FitB",
            Self::FitBH => "FitBH",
            Self::FitBV => "FitBV",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub page_index: Option<u32>,
    pub view_mode: ViewMode,
    pub view_pos: Vec<f32>,
}

/// Write callback used by [`PdfEngine::save`].
///
/// Receives one block at a time and returns `false` to abort the save.
pub type WriteBlock<'a> = dyn FnMut(&[u8]) -> bool + 'a;

/// The narrow interface to a native PDF engine.
///
/// Handles stay valid until closed; closing a document also releases every
/// page handle still open on it.
pub trait PdfEngine: Send {
    fn name(&self) -> &'static str;

    fn open(
        &mut self,
        source: OpenSource<'_>,
        password: Option<&str>,
    ) -> Result<DocumentHandle, EngineError>;
    fn create(&mut self) -> Result<DocumentHandle, EngineError>;
    fn close(&mut self, doc: DocumentHandle) -> Result<(), EngineError>;

    fn page_count(&self, doc: DocumentHandle) -> Result<u32, EngineError>;
    /// PDF version as an integer (`15` for 1.5), `None` when the document has none yet.
    fn file_version(&self, doc: DocumentHandle) -> Result<Option<u32>, EngineError>;

    fn load_page(&mut self, doc: DocumentHandle, index: u32) -> Result<PageHandle, EngineError>;
    fn close_page(&mut self, page: PageHandle) -> Result<(), EngineError>;
    fn page_size(&self, page: PageHandle) -> Result<PageSize, EngineError>;
    /// Insert an empty page. `index` is already clamped to `0..=page_count`.
    fn new_page(
        &mut self,
        doc: DocumentHandle,
        index: u32,
        size: PageSize,
    ) -> Result<PageHandle, EngineError>;
    fn delete_page(&mut self, doc: DocumentHandle, index: u32) -> Result<(), EngineError>;

    fn save(
        &mut self,
        doc: DocumentHandle,
        version: Option<u32>,
        sink: &mut WriteBlock<'_>,
    ) -> Result<(), EngineError>;

    /// First child of `parent`, or the first top-level item when `parent` is `None`.
    fn first_bookmark(
        &self,
        doc: DocumentHandle,
        parent: Option<BookmarkHandle>,
    ) -> Result<Option<BookmarkHandle>, EngineError>;
    fn next_bookmark(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<Option<BookmarkHandle>, EngineError>;
    fn bookmark_title(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<String, EngineError>;
    /// Signed child count; negative means the item is closed.
    fn bookmark_count(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<i32, EngineError>;
    fn bookmark_destination(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<Option<Destination>, EngineError>;

    fn metadata_value(&self, doc: DocumentHandle, key: &str)
        -> Result<Option<String>, EngineError>;

    fn render_page(
        &self,
        page: PageHandle,
        request: &RenderRequest,
    ) -> Result<RgbaImage, EngineError>;
}

/// Parse `"1.7"` into `17`.
pub fn parse_version(version: &str) -> Option<u32> {
    let (major, minor) = version.trim().split_once('.')?;
    let major: u32 = major.parse().ok()?;
    let minor: u32 = minor.chars().next()?.to_digit(10)?;
    Some(major * 10 + minor)
}

/// Format `17` as `"1.7"`.
pub fn format_version(version: u32) -> String {
    format!("{}.{}", version / 10, version % 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_round_trips_through_text_form() {
        assert_eq!(parse_version("1.5"), Some(15));
        assert_eq!(parse_version("2.0"), Some(20));
        assert_eq!(format_version(17), "1.7");
        assert_eq!(parse_version("garbage"), None);
    }

    #[test]
    fn load_failure_messages_match_engine_wording() {
        assert_eq!(LoadFailure::Password.to_string(), "Incorrect password error");
        assert_eq!(LoadFailure::Format.to_string(), "Data format error");
    }

    #[test]
    fn view_mode_names() {
        assert_eq!(ViewMode::from_name(b"FitBH"), ViewMode::FitBH);
        assert_eq!(ViewMode::from_name(b"Bogus").as_str(), "?");
    }
}
