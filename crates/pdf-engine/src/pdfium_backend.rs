//! PDFium-backed engine, available with the `pdfium` feature.

use crate::{
    BookmarkHandle, Destination, DocumentHandle, EngineError, LoadFailure, OpenSource, PageHandle,
    PageSize, PdfEngine, RenderRequest, RgbaImage, ViewMode, WriteBlock,
};
use pdfium_render::bindgen::{FPDF_BOOKMARK, FPDF_DOCUMENT};
use pdfium_render::prelude::*;
use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;

const MAX_BOOKMARKS: usize = 1 << 16;
const MAX_BOOKMARK_DEPTH: usize = 64;

struct BookmarkNode {
    title: String,
    destination_page: Option<u32>,
    first_child: Option<usize>,
    next_sibling: Option<usize>,
    child_count: i32,
}

struct DocumentRecord {
    document: PdfDocument<'static>,
    created: bool,
    bookmarks: Vec<BookmarkNode>,
    first_bookmark: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct PageRecord {
    doc: DocumentHandle,
    index: u32,
}

pub struct PdfiumEngine {
    pdfium: &'static Pdfium,
    next_handle: u64,
    docs: HashMap<DocumentHandle, DocumentRecord>,
    pages: HashMap<PageHandle, PageRecord>,
}

// SAFETY: every call reaches the engine through `Library`, which holds it
// behind a mutex, so PDFium is never entered from two threads at once.
unsafe impl Send for PdfiumEngine {}

impl PdfiumEngine {
    /// Bind PDFium from the executable's directory, the working directory,
    /// or the system library path, in that order.
    pub fn bind() -> Result<Self, EngineError> {
        let exe_dir =
            std::env::current_exe().ok().and_then(|p| p.parent().map(|p| p.to_path_buf()));

        let bindings = exe_dir
            .and_then(|dir| {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&dir)).ok()
            })
            .map(Ok)
            .unwrap_or_else(|| {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                    .or_else(|_| Pdfium::bind_to_system_library())
            })
            .map_err(|err| EngineError::Backend(format!("failed to bind pdfium: {err}")))?;

        Ok(Self {
            pdfium: Box::leak(Box::new(Pdfium::new(bindings))),
            next_handle: 0,
            docs: HashMap::new(),
            pages: HashMap::new(),
        })
    }

    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn record(&self, handle: DocumentHandle) -> Result<&DocumentRecord, EngineError> {
        self.docs.get(&handle).ok_or(EngineError::InvalidHandle(handle.raw()))
    }

    fn record_mut(&mut self, handle: DocumentHandle) -> Result<&mut DocumentRecord, EngineError> {
        self.docs.get_mut(&handle).ok_or(EngineError::InvalidHandle(handle.raw()))
    }

    fn page_record(&self, handle: PageHandle) -> Result<PageRecord, EngineError> {
        self.pages.get(&handle).copied().ok_or(EngineError::InvalidHandle(handle.raw()))
    }

    fn page(&self, handle: PageHandle) -> Result<PdfPage<'static>, EngineError> {
        let record = self.page_record(handle)?;
        let document = &self.record(record.doc)?.document;
        document.pages().get(record.index as PdfPageIndex).map_err(backend_error)
    }

    fn insert(&mut self, document: PdfDocument<'static>, created: bool) -> DocumentHandle {
        let bindings = self.pdfium.bindings();
        let mut collector = BookmarkCollector {
            bindings,
            document: bindings.get_handle_from_document(&document),
            arena: Vec::new(),
            seen: HashSet::new(),
        };
        let first_bookmark = document.bookmarks().root().and_then(|root| {
            let root_raw =
                bindings.FPDFBookmark_GetFirstChild(collector.document, std::ptr::null_mut());
            collector.collect(root, root_raw, 0)
        });
        let bookmarks = collector.arena;

        let handle = DocumentHandle(self.next_handle());
        self.docs.insert(handle, DocumentRecord { document, created, bookmarks, first_bookmark });
        handle
    }

    fn bookmark<'a>(
        &'a self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<&'a BookmarkNode, EngineError> {
        self.record(doc)?
            .bookmarks
            .get(bookmark.raw() as usize)
            .ok_or(EngineError::InvalidHandle(bookmark.raw()))
    }
}

/// Flattens the outline into an arena.
///
/// Nodes are identified by their `FPDF_BOOKMARK` pointer, walked in step with
/// the safe bookmark API, so a node reached twice ends the chain it was
/// reached from instead of being copied again.
struct BookmarkCollector<'a> {
    bindings: &'a dyn PdfiumLibraryBindings,
    document: FPDF_DOCUMENT,
    arena: Vec<BookmarkNode>,
    seen: HashSet<usize>,
}

impl BookmarkCollector<'_> {
    /// Collect a sibling chain and its descendants, returning the index of
    /// the first node.
    fn collect(
        &mut self,
        first: PdfBookmark<'_>,
        first_raw: FPDF_BOOKMARK,
        depth: usize,
    ) -> Option<usize> {
        if depth > MAX_BOOKMARK_DEPTH {
            return None;
        }

        let mut head = None;
        let mut previous: Option<usize> = None;
        let mut current = Some((first, first_raw));

        while let Some((bookmark, raw)) = current {
            if raw.is_null() {
                break;
            }
            if !self.seen.insert(raw as usize) {
                log::warn!("circular bookmark reference detected while reading the outline");
                break;
            }
            if self.arena.len() >= MAX_BOOKMARKS {
                log::warn!("outline exceeds {MAX_BOOKMARKS} items, truncating");
                break;
            }

            let index = self.arena.len();
            self.arena.push(BookmarkNode {
                title: bookmark.title().unwrap_or_default(),
                destination_page: bookmark
                    .destination()
                    .and_then(|dest| dest.page_index().ok())
                    .map(|page| page as u32),
                first_child: None,
                next_sibling: None,
                child_count: 0,
            });

            if let Some(previous) = previous {
                self.arena[previous].next_sibling = Some(index);
            }
            head.get_or_insert(index);

            if let Some(child) = bookmark.first_child() {
                let child_raw = self.bindings.FPDFBookmark_GetFirstChild(self.document, raw);
                let first_child = self.collect(child, child_raw, depth + 1);
                let mut count = 0;
                let mut cursor = first_child;
                while let Some(node) = cursor {
                    count += 1;
                    cursor = self.arena[node].next_sibling;
                }
                self.arena[index].first_child = first_child;
                self.arena[index].child_count = count;
            }

            previous = Some(index);
            current = bookmark.next_sibling().map(|next| {
                (next, self.bindings.FPDFBookmark_GetNextSibling(self.document, raw))
            });
        }

        head
    }
}

fn backend_error(err: PdfiumError) -> EngineError {
    EngineError::Backend(err.to_string())
}

fn load_error(err: PdfiumError) -> EngineError {
    let reason = match &err {
        PdfiumError::PdfiumLibraryInternalError(internal) => match internal {
            PdfiumInternalError::FileError => LoadFailure::File,
            PdfiumInternalError::FormatError => LoadFailure::Format,
            PdfiumInternalError::PasswordError => LoadFailure::Password,
            PdfiumInternalError::SecurityError => LoadFailure::Security,
            PdfiumInternalError::PageError => LoadFailure::Page,
            _ => LoadFailure::Unknown,
        },
        _ => LoadFailure::Unknown,
    };
    EngineError::Load { reason, detail: err.to_string() }
}

fn version_number(version: PdfDocumentVersion) -> Option<u32> {
    match version {
        PdfDocumentVersion::Unset => None,
        PdfDocumentVersion::Pdf1_0 => Some(10),
        PdfDocumentVersion::Pdf1_1 => Some(11),
        PdfDocumentVersion::Pdf1_2 => Some(12),
        PdfDocumentVersion::Pdf1_3 => Some(13),
        PdfDocumentVersion::Pdf1_4 => Some(14),
        PdfDocumentVersion::Pdf1_5 => Some(15),
        PdfDocumentVersion::Pdf1_6 => Some(16),
        PdfDocumentVersion::Pdf1_7 => Some(17),
        PdfDocumentVersion::Pdf2_0 => Some(20),
        PdfDocumentVersion::Other(value) => u32::try_from(value).ok(),
    }
}

fn document_version(number: u32) -> PdfDocumentVersion {
    match number {
        10 => PdfDocumentVersion::Pdf1_0,
        11 => PdfDocumentVersion::Pdf1_1,
        12 => PdfDocumentVersion::Pdf1_2,
        13 => PdfDocumentVersion::Pdf1_3,
        14 => PdfDocumentVersion::Pdf1_4,
        15 => PdfDocumentVersion::Pdf1_5,
        16 => PdfDocumentVersion::Pdf1_6,
        17 => PdfDocumentVersion::Pdf1_7,
        20 => PdfDocumentVersion::Pdf2_0,
        other => PdfDocumentVersion::Other(other as i32),
    }
}

fn metadata_tag(key: &str) -> Option<PdfDocumentMetadataTagType> {
    Some(match key {
        "Title" => PdfDocumentMetadataTagType::Title,
        "Author" => PdfDocumentMetadataTagType::Author,
        "Subject" => PdfDocumentMetadataTagType::Subject,
        "Keywords" => PdfDocumentMetadataTagType::Keywords,
        "Creator" => PdfDocumentMetadataTagType::Creator,
        "Producer" => PdfDocumentMetadataTagType::Producer,
        "CreationDate" => PdfDocumentMetadataTagType::CreationDate,
        "ModDate" => PdfDocumentMetadataTagType::ModificationDate,
        _ => return None,
    })
}

impl PdfEngine for PdfiumEngine {
    fn name(&self) -> &'static str {
        "pdfium"
    }

    fn open(
        &mut self,
        source: OpenSource<'_>,
        password: Option<&str>,
    ) -> Result<DocumentHandle, EngineError> {
        let document = match source {
            OpenSource::Path(path) => self.pdfium.load_pdf_from_file(path, password),
            OpenSource::Bytes(bytes) => {
                self.pdfium.load_pdf_from_byte_vec(bytes.to_vec(), password)
            }
            OpenSource::Reader(reader) => {
                let mut bytes = Vec::new();
                reader
                    .seek(SeekFrom::Start(0))
                    .and_then(|_| reader.read_to_end(&mut bytes))
                    .map_err(|err| EngineError::Load {
                        reason: LoadFailure::File,
                        detail: err.to_string(),
                    })?;
                self.pdfium.load_pdf_from_byte_vec(bytes, password)
            }
        }
        .map_err(load_error)?;

        Ok(self.insert(document, false))
    }

    fn create(&mut self) -> Result<DocumentHandle, EngineError> {
        let document = self.pdfium.create_new_pdf().map_err(backend_error)?;
        Ok(self.insert(document, true))
    }

    fn close(&mut self, doc: DocumentHandle) -> Result<(), EngineError> {
        self.docs.remove(&doc).ok_or(EngineError::InvalidHandle(doc.raw()))?;
        self.pages.retain(|_, page| page.doc != doc);
        Ok(())
    }

    fn page_count(&self, doc: DocumentHandle) -> Result<u32, EngineError> {
        Ok(self.record(doc)?.document.pages().len() as u32)
    }

    fn file_version(&self, doc: DocumentHandle) -> Result<Option<u32>, EngineError> {
        let record = self.record(doc)?;
        if record.created {
            return Ok(None);
        }
        Ok(version_number(record.document.version()))
    }

    fn load_page(&mut self, doc: DocumentHandle, index: u32) -> Result<PageHandle, EngineError> {
        let page_count = self.page_count(doc)?;
        if index >= page_count {
            return Err(EngineError::PageOutOfRange { page: index, page_count });
        }
        let handle = PageHandle(self.next_handle());
        self.pages.insert(handle, PageRecord { doc, index });
        Ok(handle)
    }

    fn close_page(&mut self, page: PageHandle) -> Result<(), EngineError> {
        self.pages.remove(&page).map(|_| ()).ok_or(EngineError::InvalidHandle(page.raw()))
    }

    fn page_size(&self, page: PageHandle) -> Result<PageSize, EngineError> {
        let page = self.page(page)?;
        Ok(PageSize { width_pt: page.width().value, height_pt: page.height().value })
    }

    fn new_page(
        &mut self,
        doc: DocumentHandle,
        index: u32,
        size: PageSize,
    ) -> Result<PageHandle, EngineError> {
        let record = self.record_mut(doc)?;
        record
            .document
            .pages_mut()
            .create_page_at_index(
                PdfPagePaperSize::Custom(
                    PdfPoints::new(size.width_pt),
                    PdfPoints::new(size.height_pt),
                ),
                index as PdfPageIndex,
            )
            .map_err(backend_error)?;

        for page in self.pages.values_mut().filter(|page| page.doc == doc && page.index >= index) {
            page.index += 1;
        }
        let handle = PageHandle(self.next_handle());
        self.pages.insert(handle, PageRecord { doc, index });
        Ok(handle)
    }

    fn delete_page(&mut self, doc: DocumentHandle, index: u32) -> Result<(), EngineError> {
        let record = self.record(doc)?;
        let page = record.document.pages().get(index as PdfPageIndex).map_err(backend_error)?;
        page.delete().map_err(backend_error)?;

        self.pages.retain(|_, page| !(page.doc == doc && page.index == index));
        for page in self.pages.values_mut().filter(|page| page.doc == doc && page.index > index) {
            page.index -= 1;
        }
        Ok(())
    }

    fn save(
        &mut self,
        doc: DocumentHandle,
        version: Option<u32>,
        sink: &mut WriteBlock<'_>,
    ) -> Result<(), EngineError> {
        let record = self.record_mut(doc)?;
        if let Some(version) = version {
            record.document.set_version(document_version(version));
        }
        let bytes =
            record.document.save_to_bytes().map_err(|err| EngineError::Save(err.to_string()))?;
        if sink(&bytes) {
            Ok(())
        } else {
            Err(EngineError::Save("write callback rejected block".to_owned()))
        }
    }

    fn first_bookmark(
        &self,
        doc: DocumentHandle,
        parent: Option<BookmarkHandle>,
    ) -> Result<Option<BookmarkHandle>, EngineError> {
        let first = match parent {
            Some(parent) => self.bookmark(doc, parent)?.first_child,
            None => self.record(doc)?.first_bookmark,
        };
        Ok(first.map(|index| BookmarkHandle(index as u64)))
    }

    fn next_bookmark(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<Option<BookmarkHandle>, EngineError> {
        Ok(self.bookmark(doc, bookmark)?.next_sibling.map(|index| BookmarkHandle(index as u64)))
    }

    fn bookmark_title(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<String, EngineError> {
        Ok(self.bookmark(doc, bookmark)?.title.clone())
    }

    fn bookmark_count(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<i32, EngineError> {
        Ok(self.bookmark(doc, bookmark)?.child_count)
    }

    fn bookmark_destination(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<Option<Destination>, EngineError> {
        Ok(self.bookmark(doc, bookmark)?.destination_page.map(|page_index| Destination {
            page_index: Some(page_index),
            view_mode: ViewMode::Unknown,
            view_pos: Vec::new(),
        }))
    }

    fn metadata_value(
        &self,
        doc: DocumentHandle,
        key: &str,
    ) -> Result<Option<String>, EngineError> {
        let Some(tag) = metadata_tag(key) else {
            return Ok(None);
        };
        Ok(self.record(doc)?.document.metadata().get(tag).map(|value| value.value().to_string()))
    }

    fn render_page(
        &self,
        page: PageHandle,
        request: &RenderRequest,
    ) -> Result<RgbaImage, EngineError> {
        let page = self.page(page)?;
        let [r, g, b, a] = request.fill_color;

        let config = PdfRenderConfig::new()
            .scale_page_by_factor(request.scale)
            .set_clear_color(PdfColor::new(r, g, b, a))
            .render_annotations(request.draw_annotations)
            .render_form_data(request.draw_forms)
            .use_grayscale_rendering(request.grayscale);

        let bitmap = page.render_with_config(&config).map_err(backend_error)?;
        let width = bitmap.width() as u32;
        let height = bitmap.height() as u32;

        RgbaImage::from_raw(width, height, bitmap.as_rgba_bytes()).ok_or_else(|| {
            EngineError::Backend(format!("bitmap of {width}x{height} has the wrong length"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{OutlineNode, PdfFixture};

    /// PDFium is a system library; tests are skipped when it cannot be bound.
    fn engine() -> Option<PdfiumEngine> {
        match PdfiumEngine::bind() {
            Ok(engine) => Some(engine),
            Err(err) => {
                eprintln!("skipping: {err}");
                None
            }
        }
    }

    #[test]
    fn sibling_cycle_is_flattened_once() {
        let Some(mut engine) = engine() else {
            return;
        };
        let bytes = PdfFixture::new()
            .pages(2)
            .outline(OutlineNode::new("A").page(0))
            .outline(OutlineNode::new("B").page(1))
            .cyclic_outline()
            .build();
        let doc = engine.open(OpenSource::Bytes(&bytes), None).expect("open");

        let mut titles = Vec::new();
        let mut cursor = engine.first_bookmark(doc, None).expect("walk");
        while let Some(bookmark) = cursor {
            titles.push(engine.bookmark_title(doc, bookmark).expect("title"));
            assert!(titles.len() <= 2, "outline walk did not stop: {titles:?}");
            cursor = engine.next_bookmark(doc, bookmark).expect("walk");
        }
        assert_eq!(titles, vec!["A", "B"]);
    }
}
