//! Document handle and lifecycle.
//!
//! A [`Document`] owns exactly one engine document handle. Pages created from
//! it hold only a weak back-reference and are tracked in a registry of live
//! page handles, which [`Document::close`] walks so that closing the document
//! invalidates every page still around.

use crate::input::{normalize, Actual, FileAccess, Normalized, Origin, PdfInput};
use crate::outline::{Toc, DEFAULT_MAX_DEPTH};
use crate::page::Page;
use crate::{Error, Result};
use pdf_engine::{
    Backend, DocumentHandle, EngineError, Library, OpenSource, PageHandle, PageSize, PdfEngine,
};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Standard `/Info` keys read by [`Document::metadata`].
pub const METADATA_KEYS: [&str; 8] =
    ["Title", "Author", "Subject", "Keywords", "Creator", "Producer", "CreationDate", "ModDate"];

/// Options for [`Document::open_with`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub password: Option<String>,
    pub file_access: FileAccess,
    /// Close a caller-provided buffer when the document closes.
    pub autoclose: bool,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_file_access(mut self, file_access: FileAccess) -> Self {
        self.file_access = file_access;
        self
    }

    pub fn with_autoclose(mut self, autoclose: bool) -> Self {
        self.autoclose = autoclose;
        self
    }
}

/// Process-transferable form of a document, used to reopen it elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderSource {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

/// Document information dictionary entries; missing keys are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metadata {
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Author")]
    pub author: String,
    #[serde(rename = "Subject")]
    pub subject: String,
    #[serde(rename = "Keywords")]
    pub keywords: String,
    #[serde(rename = "Creator")]
    pub creator: String,
    #[serde(rename = "Producer")]
    pub producer: String,
    #[serde(rename = "CreationDate")]
    pub creation_date: String,
    #[serde(rename = "ModDate")]
    pub mod_date: String,
}

pub(crate) struct DocumentState {
    pub(crate) handle: Option<DocumentHandle>,
    origin: Origin,
    actual: Option<Actual>,
    autoclose: bool,
    rendering_input: Option<RenderSource>,
    pub(crate) live_pages: HashMap<u64, PageHandle>,
    next_page_id: u64,
}

impl DocumentState {
    pub(crate) fn register_page(&mut self, handle: PageHandle) -> u64 {
        let id = self.next_page_id;
        self.next_page_id += 1;
        self.live_pages.insert(id, handle);
        id
    }
}

pub(crate) struct DocumentInner {
    pub(crate) library: Arc<Library>,
    pub(crate) state: Mutex<DocumentState>,
    password: Option<String>,
    file_access: FileAccess,
}

impl DocumentInner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, DocumentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Document {
    inner: Arc<DocumentInner>,
}

impl Document {
    /// Open `input` with default options through the process-wide library.
    pub fn open(input: impl Into<PdfInput>) -> Result<Self> {
        Self::open_with(input, &OpenOptions::default())
    }

    pub fn open_with(input: impl Into<PdfInput>, options: &OpenOptions) -> Result<Self> {
        Self::open_in(pdf_engine::global()?, input, options)
    }

    pub fn open_in(
        library: Arc<Library>,
        input: impl Into<PdfInput>,
        options: &OpenOptions,
    ) -> Result<Self> {
        let Normalized { origin, actual, autoclose } =
            normalize(input.into(), options.file_access, options.autoclose, &library)?;
        let password = options.password.as_deref();

        let handle = library.with(|engine| match &actual {
            Actual::Path(path) => engine.open(OpenSource::Path(path), password),
            Actual::Bytes(bytes) => engine.open(OpenSource::Bytes(bytes), password),
            Actual::Mmap(map) => engine.open(OpenSource::Bytes(&map[..]), password),
            Actual::Buffer(buffer) => {
                let mut reader = buffer.lock();
                engine.open(OpenSource::Reader(&mut *reader), password)
            }
            Actual::Native(handle) => Ok(*handle),
        })?;

        let actual = match actual {
            Actual::Native(_) => None,
            other => Some(other),
        };
        log::debug!("opened document {}", handle.raw());

        Ok(Self::from_parts(library, handle, origin, actual, autoclose, options))
    }

    /// A new document with no pages, created through the process-wide library.
    pub fn new_empty() -> Result<Self> {
        Self::new_empty_in(pdf_engine::global()?)
    }

    pub fn new_empty_in(library: Arc<Library>) -> Result<Self> {
        let handle = library.with(|engine| engine.create())?;
        Ok(Self::from_parts(library, handle, Origin::Native, None, false, &OpenOptions::default()))
    }

    fn from_parts(
        library: Arc<Library>,
        handle: DocumentHandle,
        origin: Origin,
        actual: Option<Actual>,
        autoclose: bool,
        options: &OpenOptions,
    ) -> Self {
        let state = DocumentState {
            handle: Some(handle),
            origin,
            actual,
            autoclose,
            rendering_input: None,
            live_pages: HashMap::new(),
            next_page_id: 0,
        };
        Self {
            inner: Arc::new(DocumentInner {
                library,
                state: Mutex::new(state),
                password: options.password.clone(),
                file_access: options.file_access,
            }),
        }
    }

    /// Run `f` against the engine with this document's handle.
    pub(crate) fn with_handle<T>(
        &self,
        f: impl FnOnce(&mut dyn PdfEngine, DocumentHandle) -> std::result::Result<T, EngineError>,
    ) -> Result<T> {
        let state = self.inner.lock();
        let handle = state.handle.ok_or(Error::DocumentClosed)?;
        Ok(self.inner.library.with(|engine| f(engine, handle))?)
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.inner.library
    }

    pub fn backend(&self) -> Backend {
        self.inner.library.backend()
    }

    pub fn password(&self) -> Option<&str> {
        self.inner.password.as_deref()
    }

    pub fn file_access(&self) -> FileAccess {
        self.inner.file_access
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().handle.is_none()
    }

    pub fn page_count(&self) -> Result<u32> {
        self.with_handle(|engine, doc| engine.page_count(doc))
    }

    /// PDF version as an integer (`17` for 1.7); `None` for documents created in memory.
    pub fn version(&self) -> Result<Option<u32>> {
        self.with_handle(|engine, doc| engine.file_version(doc))
    }

    pub fn get_page(&self, index: u32) -> Result<Page> {
        let mut state = self.inner.lock();
        let doc = state.handle.ok_or(Error::DocumentClosed)?;
        let handle = self.inner.library.with(|engine| {
            let page_count = engine.page_count(doc)?;
            if index >= page_count {
                return Err(EngineError::PageOutOfRange { page: index, page_count });
            }
            engine.load_page(doc, index)
        })?;
        let id = state.register_page(handle);
        Ok(Page::new(&self.inner, id, index))
    }

    /// Insert a blank page. `None` or an index past the end appends.
    pub fn new_page(&self, width_pt: f32, height_pt: f32, index: Option<u32>) -> Result<Page> {
        let mut state = self.inner.lock();
        let doc = state.handle.ok_or(Error::DocumentClosed)?;
        let (handle, index) = self.inner.library.with(|engine| {
            let page_count = engine.page_count(doc)?;
            let index = index.map_or(page_count, |index| index.min(page_count));
            let handle = engine.new_page(doc, index, PageSize::new(width_pt, height_pt))?;
            Ok((handle, index))
        })?;
        let id = state.register_page(handle);
        Ok(Page::new(&self.inner, id, index))
    }

    pub fn del_page(&self, index: u32) -> Result<()> {
        self.with_handle(|engine, doc| {
            let page_count = engine.page_count(doc)?;
            if index >= page_count {
                return Err(EngineError::PageOutOfRange { page: index, page_count });
            }
            engine.delete_page(doc, index)
        })
    }

    /// Iterate over all pages, loading each one on demand.
    pub fn pages(&self) -> Result<impl Iterator<Item = Result<Page>> + '_> {
        let count = self.page_count()?;
        Ok((0..count).map(move |index| self.get_page(index)))
    }

    /// Size of page `index` in points, without keeping a page wrapper around.
    pub fn page_size(&self, index: u32) -> Result<PageSize> {
        self.with_handle(|engine, doc| {
            let page = engine.load_page(doc, index)?;
            let size = engine.page_size(page);
            engine.close_page(page)?;
            size
        })
    }

    pub fn metadata_value(&self, key: &str) -> Result<String> {
        Ok(self.with_handle(|engine, doc| engine.metadata_value(doc, key))?.unwrap_or_default())
    }

    pub fn metadata(&self) -> Result<Metadata> {
        let values: HashMap<&str, String> = self.with_handle(|engine, doc| {
            let mut values = HashMap::new();
            for key in METADATA_KEYS {
                if let Some(value) = engine.metadata_value(doc, key)? {
                    values.insert(key, value);
                }
            }
            Ok(values)
        })?;
        let take = |key: &str| values.get(key).cloned().unwrap_or_default();

        Ok(Metadata {
            title: take("Title"),
            author: take("Author"),
            subject: take("Subject"),
            keywords: take("Keywords"),
            creator: take("Creator"),
            producer: take("Producer"),
            creation_date: take("CreationDate"),
            mod_date: take("ModDate"),
        })
    }

    /// Lazily walk the outline, at most `max_depth` levels deep.
    pub fn get_toc(&self, max_depth: usize) -> Toc<'_> {
        Toc::new(self, max_depth)
    }

    /// [`Document::get_toc`] with the default depth limit.
    pub fn toc(&self) -> Toc<'_> {
        self.get_toc(DEFAULT_MAX_DEPTH)
    }

    /// Write the current document state to `sink`.
    ///
    /// `version` is the target PDF version as an integer (`17` for 1.7);
    /// `None` leaves the choice to the engine.
    pub fn save<W: Write>(&self, sink: &mut W, version: Option<u32>) -> Result<()> {
        let state = self.inner.lock();
        let handle = state.handle.ok_or(Error::DocumentClosed)?;
        save_locked(&self.inner.library, handle, sink, version)
    }

    pub fn save_to_vec(&self, version: Option<u32>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.save(&mut out, version)?;
        Ok(out)
    }

    /// Serialize the current state and use it as the snapshot workers open.
    ///
    /// Call after mutating a document that will be rendered concurrently.
    pub fn update_rendering_input(&self) -> Result<()> {
        let mut state = self.inner.lock();
        let handle = state.handle.ok_or(Error::DocumentClosed)?;
        let mut bytes = Vec::new();
        save_locked(&self.inner.library, handle, &mut bytes, None)?;
        state.rendering_input = Some(RenderSource::Bytes(bytes.into()));
        Ok(())
    }

    /// The snapshot workers should reopen, materializing it on first use.
    pub fn prepare_rendering_input(&self) -> Result<RenderSource> {
        let mut state = self.inner.lock();
        let handle = state.handle.ok_or(Error::DocumentClosed)?;
        if let Some(source) = &state.rendering_input {
            return Ok(source.clone());
        }

        let source = match &state.origin {
            Origin::Path(path) => RenderSource::Path(path.clone()),
            Origin::Bytes(bytes) => RenderSource::Bytes(Arc::clone(bytes)),
            Origin::Mmap => match &state.actual {
                Some(Actual::Mmap(map)) => RenderSource::Bytes(Arc::from(&map[..])),
                _ => return Err(Error::DocumentClosed),
            },
            Origin::Buffer(buffer) => {
                log::warn!(
                    "reading the whole input buffer into memory so worker processes can open it"
                );
                let mut reader = buffer.lock();
                let cursor = reader.stream_position()?;
                reader.seek(SeekFrom::Start(0))?;
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes)?;
                reader.seek(SeekFrom::Start(cursor))?;
                RenderSource::Bytes(bytes.into())
            }
            Origin::Native => {
                log::warn!(
                    "document has no process-transferable input; saving it to bytes for rendering"
                );
                let mut bytes = Vec::new();
                save_locked(&self.inner.library, handle, &mut bytes, None)?;
                RenderSource::Bytes(bytes.into())
            }
        };

        state.rendering_input = Some(source.clone());
        Ok(source)
    }

    /// Close the document and every page still open on it.
    ///
    /// Closing twice is a no-op; other calls on a closed document fail with
    /// [`Error::DocumentClosed`].
    pub fn close(&self) -> Result<()> {
        match self.close_inner()? {
            true => Ok(()),
            false => {
                log::debug!("document already closed");
                Ok(())
            }
        }
    }

    fn close_inner(&self) -> Result<bool> {
        let mut state = self.inner.lock();
        let Some(handle) = state.handle.take() else {
            return Ok(false);
        };

        let pages: Vec<PageHandle> = state.live_pages.drain().map(|(_, page)| page).collect();
        let closed = self.inner.library.with(|engine| {
            for page in pages {
                if let Err(err) = engine.close_page(page) {
                    log::debug!("page {} was already released: {err}", page.raw());
                }
            }
            engine.close(handle)
        });

        state.rendering_input = None;
        if let Some(Actual::Buffer(buffer)) = state.actual.take() {
            if state.autoclose {
                buffer.lock().close()?;
            }
        }

        match closed {
            Ok(()) => Ok(true),
            // Everything was released when the library went down.
            Err(EngineError::LibraryShutDown) => Ok(true),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        if let Err(err) = self.close_inner() {
            log::warn!("failed to close document on drop: {err}");
        }
    }
}

fn save_locked<W: Write>(
    library: &Library,
    handle: DocumentHandle,
    sink: &mut W,
    version: Option<u32>,
) -> Result<()> {
    let mut write_error = None;
    let saved = library.with(|engine| {
        engine.save(handle, version, &mut |block: &[u8]| match sink.write_all(block) {
            Ok(()) => true,
            Err(err) => {
                write_error = Some(err);
                false
            }
        })
    });

    match (saved, write_error) {
        (Ok(()), _) => Ok(()),
        (Err(_), Some(err)) => Err(Error::Save(err.to_string())),
        (Err(err), None) => Err(err.into()),
    }
}
