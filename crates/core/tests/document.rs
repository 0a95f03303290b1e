use leafpress_core::{
    Crop, Document, Error, FileAccess, InputBuffer, LoadFailure, NativeDocument, OpenOptions,
    PdfInput, RenderOptions, RenderSource, SharedBuffer,
};
use pdf_engine::fixtures::PdfFixture;
use pdf_engine::{
    Backend, BookmarkHandle, Destination, DocumentHandle, EngineError, Library, LopdfEngine,
    OpenSource, PageHandle, PageSize, PdfEngine, RenderRequest, RgbaImage, WriteBlock,
};
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn library() -> Arc<Library> {
    Arc::new(Library::new(Backend::Lopdf).expect("lopdf engine"))
}

fn open_bytes(library: &Arc<Library>, bytes: Vec<u8>) -> Document {
    Document::open_in(Arc::clone(library), bytes, &OpenOptions::default()).expect("open")
}

#[test]
fn save_and_reopen_preserves_page_count_and_geometry() {
    let library = library();
    let doc = open_bytes(
        &library,
        PdfFixture::new().page(100.0, 200.0).page(300.0, 400.0).page(500.0, 600.0).build(),
    );

    let saved = doc.save_to_vec(None).expect("save");
    let reopened = open_bytes(&library, saved);

    assert_eq!(reopened.page_count().expect("count"), doc.page_count().expect("count"));
    for index in 0..3 {
        assert_eq!(
            reopened.page_size(index).expect("size"),
            doc.page_size(index).expect("size")
        );
    }
}

#[test]
fn deleting_a_page_and_saving_with_version() {
    let library = library();
    let doc = open_bytes(&library, PdfFixture::new().pages(3).build());

    doc.del_page(1).expect("delete");
    let saved = doc.save_to_vec(Some(17)).expect("save");

    assert!(saved.starts_with(b"%PDF-1.7"));
    let reopened = open_bytes(&library, saved);
    assert_eq!(reopened.page_count().expect("count"), 2);
    assert_eq!(reopened.version().expect("version"), Some(17));
}

#[test]
fn page_index_bounds() {
    let library = library();
    let doc = open_bytes(&library, PdfFixture::new().pages(3).build());

    assert!(matches!(doc.get_page(3), Err(Error::OutOfBounds { index: 3, page_count: 3 })));
    assert!(matches!(doc.del_page(7), Err(Error::OutOfBounds { index: 7, page_count: 3 })));
    assert_eq!(doc.page_count().expect("count"), 3);
}

#[test]
fn new_page_clamps_index() {
    let doc = Document::new_empty_in(library()).expect("new document");
    assert_eq!(doc.version().expect("version"), None);

    let first = doc.new_page(100.0, 100.0, Some(99)).expect("append to empty");
    assert_eq!(first.index(), 0);
    let appended = doc.new_page(200.0, 200.0, None).expect("append");
    assert_eq!(appended.index(), 1);
    let prepended = doc.new_page(300.0, 300.0, Some(0)).expect("prepend");
    assert_eq!(prepended.index(), 0);

    assert_eq!(doc.page_count().expect("count"), 3);
    assert_eq!(doc.page_size(0).expect("size"), PageSize::new(300.0, 300.0));
    assert_eq!(doc.page_size(2).expect("size"), PageSize::new(200.0, 200.0));
}

#[test]
fn close_is_idempotent_and_blocks_further_use() {
    let library = library();
    let doc = open_bytes(&library, PdfFixture::new().pages(1).build());

    doc.close().expect("first close");
    doc.close().expect("second close is a no-op");

    assert!(doc.is_closed());
    assert!(matches!(doc.page_count(), Err(Error::DocumentClosed)));
    assert!(matches!(doc.get_page(0), Err(Error::DocumentClosed)));
    assert!(matches!(doc.save_to_vec(None), Err(Error::DocumentClosed)));
}

#[test]
fn closing_document_invalidates_pages() {
    let library = library();
    let doc = open_bytes(&library, PdfFixture::new().pages(2).build());
    let first = doc.get_page(0).expect("page 0");
    let second = doc.get_page(1).expect("page 1");
    assert!(first.size().is_ok());

    doc.close().expect("close");

    assert!(first.is_closed());
    assert!(matches!(first.size(), Err(Error::PageClosed)));
    assert!(matches!(second.render(&RenderOptions::default()), Err(Error::PageClosed)));
    first.close().expect("closing a cascaded page is a no-op");
}

#[test]
fn dropping_document_invalidates_pages() {
    let library = library();
    let page = {
        let doc = open_bytes(&library, PdfFixture::new().pages(1).build());
        doc.get_page(0).expect("page")
    };

    assert!(matches!(page.size(), Err(Error::PageClosed)));
}

#[test]
fn pages_iterator_loads_each_page() {
    let library = library();
    let doc = open_bytes(&library, PdfFixture::new().pages(4).build());

    let indices: Vec<u32> =
        doc.pages().expect("pages").map(|page| page.expect("page").index()).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
}

#[test]
fn file_access_strategies_open_the_same_document() {
    let library = library();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("four.pdf");
    PdfFixture::new().pages(4).write_to(&path).expect("write fixture");

    for access in [FileAccess::Native, FileAccess::Buffer, FileAccess::Bytes] {
        let options = OpenOptions::new().with_file_access(access);
        let doc = Document::open_in(Arc::clone(&library), path.as_path(), &options)
            .unwrap_or_else(|err| panic!("{access} open failed: {err}"));

        assert_eq!(doc.page_count().expect("count"), 4, "{access}");
        assert_eq!(doc.file_access(), access);
        assert_eq!(doc.prepare_rendering_input().expect("input"), RenderSource::Path(path.clone()));
    }
}

#[test]
fn missing_file_is_not_found() {
    let result = Document::open_in(library(), "/no/such/leafpress.pdf", &OpenOptions::default());
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[test]
fn garbage_bytes_fail_to_decode() {
    let result = Document::open_in(library(), b"%PDF-nonsense".to_vec(), &OpenOptions::default());
    match result {
        Err(Error::Decode { reason, .. }) => assert_eq!(reason, LoadFailure::Format),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("garbage must not open"),
    }
}

#[test]
fn memory_mapped_input() {
    let library = library();
    let file = tempfile::NamedTempFile::new().expect("temp file");
    PdfFixture::new().pages(2).write_to(file.path()).expect("write fixture");
    let handle = std::fs::File::open(file.path()).expect("reopen");
    // SAFETY: the temp file is not modified while mapped.
    let map = unsafe { memmap2::Mmap::map(&handle) }.expect("map");

    let doc = Document::open_in(library, PdfInput::Mmap(map), &OpenOptions::default())
        .expect("open mapping");

    assert_eq!(doc.page_count().expect("count"), 2);
    assert!(matches!(doc.prepare_rendering_input().expect("input"), RenderSource::Bytes(_)));
}

#[test]
fn native_handle_input_takes_ownership() {
    let library = library();
    let bytes = PdfFixture::new().pages(2).build();
    let handle = library
        .with(|engine| engine.open(OpenSource::Bytes(&bytes), None))
        .expect("raw open");

    let doc = Document::open_in(
        Arc::clone(&library),
        NativeDocument::new(&library, handle),
        &OpenOptions::default(),
    )
    .expect("wrap handle");
    assert_eq!(doc.page_count().expect("count"), 2);

    // Native documents cannot be reopened elsewhere, so rendering input is saved bytes.
    match doc.prepare_rendering_input().expect("input") {
        RenderSource::Bytes(bytes) => assert!(bytes.starts_with(b"%PDF-")),
        other => panic!("expected bytes, got {other:?}"),
    }

    doc.close().expect("close");
    assert!(library.with(|engine| engine.page_count(handle)).is_err());
}

struct TrackedBuffer {
    inner: Cursor<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl Read for TrackedBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for TrackedBuffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl InputBuffer for TrackedBuffer {
    fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn tracked_buffer() -> (SharedBuffer, Arc<AtomicBool>) {
    let closed = Arc::new(AtomicBool::new(false));
    let buffer = TrackedBuffer {
        inner: Cursor::new(PdfFixture::new().pages(2).build()),
        closed: Arc::clone(&closed),
    };
    (SharedBuffer::new(buffer), closed)
}

#[test]
fn buffer_is_closed_only_with_autoclose() {
    let library = library();

    for autoclose in [false, true] {
        let (buffer, closed) = tracked_buffer();
        let options = OpenOptions::new().with_autoclose(autoclose);
        let doc = Document::open_in(Arc::clone(&library), buffer, &options).expect("open");

        assert_eq!(doc.page_count().expect("count"), 2);
        assert!(!closed.load(Ordering::SeqCst));

        doc.close().expect("close");
        assert_eq!(closed.load(Ordering::SeqCst), autoclose);
    }
}

#[test]
fn buffer_rendering_input_restores_cursor() {
    let library = library();
    let (buffer, _closed) = tracked_buffer();
    let doc = Document::open_in(library, buffer.clone(), &OpenOptions::default()).expect("open");

    buffer.lock().seek(SeekFrom::Start(5)).expect("seek");
    let source = doc.prepare_rendering_input().expect("input");

    assert!(matches!(source, RenderSource::Bytes(ref bytes) if bytes.starts_with(b"%PDF-1.5")));
    assert_eq!(buffer.lock().stream_position().expect("position"), 5);
}

#[test]
fn update_rendering_input_captures_mutations() {
    let library = library();
    let doc = open_bytes(&library, PdfFixture::new().pages(3).build());
    let before = doc.prepare_rendering_input().expect("input");

    doc.del_page(0).expect("delete");
    assert_eq!(doc.prepare_rendering_input().expect("cached input"), before);

    doc.update_rendering_input().expect("update");
    let RenderSource::Bytes(bytes) = doc.prepare_rendering_input().expect("input") else {
        panic!("snapshot should be bytes");
    };
    let reopened = open_bytes(&library, bytes.to_vec());
    assert_eq!(reopened.page_count().expect("count"), 2);
}

#[test]
fn metadata_fills_missing_keys_with_empty_strings() {
    let library = library();
    let doc = open_bytes(
        &library,
        PdfFixture::new().pages(1).info("Title", "Field Notes").info("Author", "R. Birch").build(),
    );

    let metadata = doc.metadata().expect("metadata");
    assert_eq!(metadata.title, "Field Notes");
    assert_eq!(metadata.author, "R. Birch");
    assert_eq!(metadata.keywords, "");
    assert_eq!(doc.metadata_value("Producer").expect("value"), "");
}

#[test]
fn render_page_at_scale() {
    let library = library();
    let doc = open_bytes(&library, PdfFixture::new().page(100.0, 50.0).build());
    let page = doc.get_page(0).expect("page");

    let rendered = page.render(&RenderOptions::default().with_scale(2.0)).expect("render");
    assert_eq!((rendered.width, rendered.height), (200, 100));
    assert_eq!(rendered.pixels.len(), 200 * 100 * 3);

    let err = page.render(&RenderOptions::default().with_rotation(33)).expect_err("bad rotation");
    assert!(matches!(err, Error::InvalidRenderOptions(_)));

    let huge = RenderOptions::default().with_crop(Crop::new(1e12, 0.0, 1e12, 0.0));
    let err = page.render(&huge).expect_err("crop larger than the page");
    assert!(matches!(err, Error::InvalidRenderOptions(_)));
}

/// Wraps the lopdf engine and insists on one password.
struct PasswordGate {
    inner: LopdfEngine,
    password: &'static str,
}

impl PdfEngine for PasswordGate {
    fn name(&self) -> &'static str {
        "password-gate"
    }

    fn open(
        &mut self,
        source: OpenSource<'_>,
        password: Option<&str>,
    ) -> Result<DocumentHandle, EngineError> {
        if password != Some(self.password) {
            return Err(EngineError::Load {
                reason: LoadFailure::Password,
                detail: "password rejected".to_owned(),
            });
        }
        self.inner.open(source, password)
    }

    fn create(&mut self) -> Result<DocumentHandle, EngineError> {
        self.inner.create()
    }

    fn close(&mut self, doc: DocumentHandle) -> Result<(), EngineError> {
        self.inner.close(doc)
    }

    fn page_count(&self, doc: DocumentHandle) -> Result<u32, EngineError> {
        self.inner.page_count(doc)
    }

    fn file_version(&self, doc: DocumentHandle) -> Result<Option<u32>, EngineError> {
        self.inner.file_version(doc)
    }

    fn load_page(&mut self, doc: DocumentHandle, index: u32) -> Result<PageHandle, EngineError> {
        self.inner.load_page(doc, index)
    }

    fn close_page(&mut self, page: PageHandle) -> Result<(), EngineError> {
        self.inner.close_page(page)
    }

    fn page_size(&self, page: PageHandle) -> Result<PageSize, EngineError> {
        self.inner.page_size(page)
    }

    fn new_page(
        &mut self,
        doc: DocumentHandle,
        index: u32,
        size: PageSize,
    ) -> Result<PageHandle, EngineError> {
        self.inner.new_page(doc, index, size)
    }

    fn delete_page(&mut self, doc: DocumentHandle, index: u32) -> Result<(), EngineError> {
        self.inner.delete_page(doc, index)
    }

    fn save(
        &mut self,
        doc: DocumentHandle,
        version: Option<u32>,
        sink: &mut WriteBlock<'_>,
    ) -> Result<(), EngineError> {
        self.inner.save(doc, version, sink)
    }

    fn first_bookmark(
        &self,
        doc: DocumentHandle,
        parent: Option<BookmarkHandle>,
    ) -> Result<Option<BookmarkHandle>, EngineError> {
        self.inner.first_bookmark(doc, parent)
    }

    fn next_bookmark(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<Option<BookmarkHandle>, EngineError> {
        self.inner.next_bookmark(doc, bookmark)
    }

    fn bookmark_title(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<String, EngineError> {
        self.inner.bookmark_title(doc, bookmark)
    }

    fn bookmark_count(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<i32, EngineError> {
        self.inner.bookmark_count(doc, bookmark)
    }

    fn bookmark_destination(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<Option<Destination>, EngineError> {
        self.inner.bookmark_destination(doc, bookmark)
    }

    fn metadata_value(
        &self,
        doc: DocumentHandle,
        key: &str,
    ) -> Result<Option<String>, EngineError> {
        self.inner.metadata_value(doc, key)
    }

    fn render_page(
        &self,
        page: PageHandle,
        request: &RenderRequest,
    ) -> Result<RgbaImage, EngineError> {
        self.inner.render_page(page, request)
    }
}

#[test]
fn wrong_password_reports_incorrect_password() {
    let library = Arc::new(Library::with_engine(
        Backend::Lopdf,
        Box::new(PasswordGate { inner: LopdfEngine::new(), password: "secret" }),
    ));
    let bytes = PdfFixture::new().pages(1).build();

    let err = Document::open_in(
        Arc::clone(&library),
        bytes.clone(),
        &OpenOptions::new().with_password("wrong_password"),
    )
    .err()
    .expect("wrong password must fail");

    assert!(matches!(err, Error::Decode { reason: LoadFailure::Password, .. }));
    assert!(err.to_string().to_lowercase().contains("incorrect password"));

    let doc = Document::open_in(library, bytes, &OpenOptions::new().with_password("secret"))
        .expect("right password opens");
    assert_eq!(doc.password(), Some("secret"));
}

fn encrypted_report(user_password: &str) -> Vec<u8> {
    PdfFixture::new().pages(3).info("Title", "Leaves").encrypted(user_password).build()
}

#[test]
fn encrypted_file_opens_with_user_password() {
    let library = library();
    let bytes = encrypted_report("secret");

    for password in [None, Some("wrong_password")] {
        let mut options = OpenOptions::new();
        if let Some(password) = password {
            options = options.with_password(password);
        }
        let err = Document::open_in(Arc::clone(&library), bytes.clone(), &options)
            .err()
            .expect("missing or wrong password must fail");
        assert!(matches!(err, Error::Decode { reason: LoadFailure::Password, .. }), "{err}");
    }

    let options = OpenOptions::new().with_password("secret");
    let doc = Document::open_in(library, bytes, &options).expect("open");
    assert_eq!(doc.page_count().expect("count"), 3);
    assert_eq!(doc.metadata_value("Title").expect("title"), "Leaves");
}

#[test]
fn empty_user_password_is_decrypted_once() {
    let library = library();
    let doc = open_bytes(&library, encrypted_report(""));

    assert_eq!(doc.page_count().expect("count"), 3);
    assert_eq!(doc.metadata_value("Title").expect("title"), "Leaves");

    // Saved copies are plain PDFs.
    let reopened = open_bytes(&library, doc.save_to_vec(None).expect("save"));
    assert_eq!(reopened.page_count().expect("count"), 3);
    assert_eq!(reopened.metadata_value("Title").expect("title"), "Leaves");
}

#[test]
fn documents_fail_cleanly_after_library_shutdown() {
    let library = library();
    let doc = open_bytes(&library, PdfFixture::new().pages(1).build());

    library.shutdown();

    assert!(matches!(doc.page_count(), Err(Error::Engine(EngineError::LibraryShutDown))));
    doc.close().expect("close after shutdown still succeeds");
}
