use crate::{
    format_version, parse_version, BookmarkHandle, Destination, DocumentHandle, EngineError,
    LoadFailure, OpenSource, PageHandle, PageSize, PdfEngine, RenderRequest, RgbaImage, ViewMode,
    WriteBlock,
};
use image::Rgba;
use lopdf::encryption::DecryptionError;
use lopdf::xref::XrefEntry;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Reader};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{self, SeekFrom, Write};

const DEFAULT_PAGE_SIZE: PageSize = PageSize { width_pt: 612.0, height_pt: 792.0 };
const MAX_TREE_DEPTH: usize = 64;

struct DocumentRecord {
    doc: Document,
    created: bool,
}

#[derive(Debug, Clone, Copy)]
struct PageRecord {
    doc: DocumentHandle,
    id: ObjectId,
}

/// Pure-Rust engine built on `lopdf`.
///
/// Structure, outlines, metadata and saving are real; rasterization produces
/// a page-sized canvas in the requested fill color, which is enough for the
/// pipeline but carries no page content.
#[derive(Default)]
pub struct LopdfEngine {
    next_handle: u64,
    docs: HashMap<DocumentHandle, DocumentRecord>,
    pages: HashMap<PageHandle, PageRecord>,
}

impl LopdfEngine {
    pub fn new() -> Self {
        Self::default()
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

    fn page_id(doc: &Document, index: u32) -> Result<ObjectId, EngineError> {
        let pages = doc.get_pages();
        pages.get(&(index + 1)).copied().ok_or(EngineError::PageOutOfRange {
            page: index,
            page_count: pages.len() as u32,
        })
    }

    fn load(bytes: &[u8], password: Option<&str>) -> Result<Document, EngineError> {
        let mut doc = Document::load_mem(bytes).map_err(|err| EngineError::Load {
            reason: LoadFailure::Format,
            detail: err.to_string(),
        })?;
        if !doc.is_encrypted() {
            return Ok(doc);
        }

        // lopdf decrypts on load when the user password is empty.
        if doc.encryption_state.is_some() {
            drop_encrypt_entry(&mut doc);
            return Ok(doc);
        }

        let password = password.unwrap_or("");
        doc.authenticate_password(password).map_err(|err| EngineError::Load {
            reason: decrypt_failure(&err),
            detail: err.to_string(),
        })?;
        let mut doc = parse_encrypted_objects(bytes, doc)?;
        doc.decrypt(password).map_err(|err| EngineError::Load {
            reason: decrypt_failure(&err),
            detail: err.to_string(),
        })?;
        if doc.get_pages().is_empty() {
            return Err(EngineError::Load {
                reason: LoadFailure::Page,
                detail: "decrypted document has no pages".to_owned(),
            });
        }
        Ok(doc)
    }
}

/// Remove the `/Encrypt` reference from a document whose objects are
/// already plaintext, so it saves unencrypted.
fn drop_encrypt_entry(doc: &mut Document) {
    if let Some(Object::Reference(id)) = doc.trailer.remove(b"Encrypt") {
        doc.objects.remove(&id);
    }
}

/// Parse every object of an encrypted file without decrypting it. lopdf only
/// keeps the encryption dictionary when the empty password is rejected.
fn parse_encrypted_objects(bytes: &[u8], doc: Document) -> Result<Document, EngineError> {
    let ids: Vec<ObjectId> = doc
        .reference_table
        .entries
        .iter()
        .filter_map(|(&number, entry)| match entry {
            XrefEntry::Normal { generation, .. } => Some((number, *generation)),
            _ => None,
        })
        .collect();

    let reader = Reader {
        buffer: bytes,
        document: doc,
        encryption_state: None,
        raw_objects: BTreeMap::new(),
    };
    let mut objects = BTreeMap::new();
    for id in ids {
        match reader.get_object(id, &mut HashSet::new()) {
            Ok(object) => {
                objects.insert(id, object);
            }
            Err(err) => log::debug!("skipping object {} {}: {err}", id.0, id.1),
        }
    }

    let mut doc = reader.document;
    doc.objects.extend(objects);
    Ok(doc)
}

fn decrypt_failure(err: &lopdf::Error) -> LoadFailure {
    match err {
        lopdf::Error::UnsupportedSecurityHandler(_)
        | lopdf::Error::Decryption(
            DecryptionError::UnsupportedEncryption | DecryptionError::UnsupportedVersion,
        ) => LoadFailure::Security,
        _ => LoadFailure::Password,
    }
}

impl PdfEngine for LopdfEngine {
    fn name(&self) -> &'static str {
        "lopdf"
    }

    fn open(
        &mut self,
        source: OpenSource<'_>,
        password: Option<&str>,
    ) -> Result<DocumentHandle, EngineError> {
        let doc = match source {
            OpenSource::Path(path) => {
                let bytes = fs::read(path).map_err(|err| EngineError::Load {
                    reason: LoadFailure::File,
                    detail: format!("{}: {err}", path.display()),
                })?;
                Self::load(&bytes, password)?
            }
            OpenSource::Bytes(bytes) => Self::load(bytes, password)?,
            OpenSource::Reader(reader) => {
                let mut bytes = Vec::new();
                reader
                    .seek(SeekFrom::Start(0))
                    .and_then(|_| reader.read_to_end(&mut bytes))
                    .map_err(|err| EngineError::Load {
                        reason: LoadFailure::File,
                        detail: err.to_string(),
                    })?;
                Self::load(&bytes, password)?
            }
        };

        let handle = DocumentHandle(self.next_handle());
        self.docs.insert(handle, DocumentRecord { doc, created: false });
        Ok(handle)
    }

    fn create(&mut self) -> Result<DocumentHandle, EngineError> {
        let mut doc = Document::with_version("1.7");
        let pages_id = doc.add_object(dictionary! {
            "Type" => "Pages",
            "Kids" => Vec::<Object>::new(),
            "Count" => 0,
        });
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);

        let handle = DocumentHandle(self.next_handle());
        self.docs.insert(handle, DocumentRecord { doc, created: true });
        Ok(handle)
    }

    fn close(&mut self, doc: DocumentHandle) -> Result<(), EngineError> {
        self.docs.remove(&doc).ok_or(EngineError::InvalidHandle(doc.raw()))?;
        self.pages.retain(|_, page| page.doc != doc);
        Ok(())
    }

    fn page_count(&self, doc: DocumentHandle) -> Result<u32, EngineError> {
        Ok(self.record(doc)?.doc.get_pages().len() as u32)
    }

    fn file_version(&self, doc: DocumentHandle) -> Result<Option<u32>, EngineError> {
        let record = self.record(doc)?;
        if record.created {
            return Ok(None);
        }
        Ok(parse_version(&record.doc.version))
    }

    fn load_page(&mut self, doc: DocumentHandle, index: u32) -> Result<PageHandle, EngineError> {
        let id = Self::page_id(&self.record(doc)?.doc, index)?;
        let handle = PageHandle(self.next_handle());
        self.pages.insert(handle, PageRecord { doc, id });
        Ok(handle)
    }

    fn close_page(&mut self, page: PageHandle) -> Result<(), EngineError> {
        self.pages.remove(&page).map(|_| ()).ok_or(EngineError::InvalidHandle(page.raw()))
    }

    fn page_size(&self, page: PageHandle) -> Result<PageSize, EngineError> {
        let record = self.page_record(page)?;
        let doc = &self.record(record.doc)?.doc;
        effective_page_size(doc, record.id)
    }

    fn new_page(
        &mut self,
        doc: DocumentHandle,
        index: u32,
        size: PageSize,
    ) -> Result<PageHandle, EngineError> {
        let record = self.record_mut(doc)?;
        let page_id = insert_page(&mut record.doc, index, size)?;
        let handle = PageHandle(self.next_handle());
        self.pages.insert(handle, PageRecord { doc, id: page_id });
        Ok(handle)
    }

    fn delete_page(&mut self, doc: DocumentHandle, index: u32) -> Result<(), EngineError> {
        let record = self.record_mut(doc)?;
        let page_id = Self::page_id(&record.doc, index)?;
        remove_page(&mut record.doc, page_id)?;
        self.pages.retain(|_, page| !(page.doc == doc && page.id == page_id));
        Ok(())
    }

    fn save(
        &mut self,
        doc: DocumentHandle,
        version: Option<u32>,
        sink: &mut WriteBlock<'_>,
    ) -> Result<(), EngineError> {
        let record = self.record_mut(doc)?;
        let previous =
            version.map(|v| std::mem::replace(&mut record.doc.version, format_version(v)));

        let mut writer = CallbackWriter { sink };
        let result = record.doc.save_to(&mut writer);

        if let Some(previous) = previous {
            record.doc.version = previous;
        }

        result.map_err(|err| EngineError::Save(err.to_string()))
    }

    fn first_bookmark(
        &self,
        doc: DocumentHandle,
        parent: Option<BookmarkHandle>,
    ) -> Result<Option<BookmarkHandle>, EngineError> {
        let doc = &self.record(doc)?.doc;
        let dict = match parent {
            Some(parent) => bookmark_dict(doc, parent)?,
            None => match outline_root(doc) {
                Some(root) => root,
                None => return Ok(None),
            },
        };
        Ok(linked_bookmark(dict, b"First"))
    }

    fn next_bookmark(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<Option<BookmarkHandle>, EngineError> {
        let doc = &self.record(doc)?.doc;
        Ok(linked_bookmark(bookmark_dict(doc, bookmark)?, b"Next"))
    }

    fn bookmark_title(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<String, EngineError> {
        let doc = &self.record(doc)?.doc;
        let dict = bookmark_dict(doc, bookmark)?;
        Ok(dict
            .get(b"Title")
            .ok()
            .map(|obj| resolve(doc, obj))
            .and_then(|obj| match obj {
                Object::String(bytes, _) => Some(decode_text_string(bytes)),
                _ => None,
            })
            .unwrap_or_default())
    }

    fn bookmark_count(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<i32, EngineError> {
        let doc = &self.record(doc)?.doc;
        let dict = bookmark_dict(doc, bookmark)?;
        Ok(dict.get(b"Count").ok().and_then(|obj| resolve(doc, obj).as_i64().ok()).unwrap_or(0)
            as i32)
    }

    fn bookmark_destination(
        &self,
        doc: DocumentHandle,
        bookmark: BookmarkHandle,
    ) -> Result<Option<Destination>, EngineError> {
        let doc = &self.record(doc)?.doc;
        let dict = bookmark_dict(doc, bookmark)?;
        let pages = doc.get_pages();

        if let Ok(dest) = dict.get(b"Dest") {
            if let Some(dest) = resolve_destination(doc, dest, &pages) {
                return Ok(Some(dest));
            }
        }

        let action = match dict.get(b"A").ok().map(|obj| resolve(doc, obj)) {
            Some(Object::Dictionary(action)) => action,
            _ => return Ok(None),
        };
        match action.get(b"S").and_then(Object::as_name) {
            Ok(b"GoTo") => {}
            _ => return Ok(None),
        }
        Ok(action.get(b"D").ok().and_then(|dest| resolve_destination(doc, dest, &pages)))
    }

    fn metadata_value(
        &self,
        doc: DocumentHandle,
        key: &str,
    ) -> Result<Option<String>, EngineError> {
        let doc = &self.record(doc)?.doc;
        let info = match doc.trailer.get(b"Info").ok().map(|obj| resolve(doc, obj)) {
            Some(Object::Dictionary(info)) => info,
            _ => return Ok(None),
        };
        Ok(info.get(key.as_bytes()).ok().map(|obj| resolve(doc, obj)).and_then(|obj| match obj {
            Object::String(bytes, _) => Some(decode_text_string(bytes)),
            Object::Name(name) => Some(String::from_utf8_lossy(name).into_owned()),
            _ => None,
        }))
    }

    fn render_page(
        &self,
        page: PageHandle,
        request: &RenderRequest,
    ) -> Result<RgbaImage, EngineError> {
        let size = self.page_size(page)?;
        let scale = if request.scale <= 0.0 { 1.0 } else { request.scale };

        let width = (size.width_pt * scale).round().max(1.0) as u32;
        let height = (size.height_pt * scale).round().max(1.0) as u32;

        let [r, g, b, a] = request.fill_color;
        let fill = if request.grayscale {
            let luma = (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8;
            Rgba([luma, luma, luma, a])
        } else {
            Rgba([r, g, b, a])
        };

        Ok(RgbaImage::from_pixel(width, height, fill))
    }
}

struct CallbackWriter<'a, 'b> {
    sink: &'a mut WriteBlock<'b>,
}

impl Write for CallbackWriter<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if (self.sink)(buf) {
            Ok(buf.len())
        } else {
            Err(io::Error::other("write callback rejected block"))
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        other => other,
    }
}

fn bookmark_handle(id: ObjectId) -> BookmarkHandle {
    BookmarkHandle(((id.0 as u64) << 16) | id.1 as u64)
}

fn bookmark_id(handle: BookmarkHandle) -> ObjectId {
    ((handle.raw() >> 16) as u32, (handle.raw() & 0xffff) as u16)
}

fn bookmark_dict(doc: &Document, handle: BookmarkHandle) -> Result<&Dictionary, EngineError> {
    doc.get_dictionary(bookmark_id(handle)).map_err(|_| EngineError::InvalidHandle(handle.raw()))
}

fn linked_bookmark(dict: &Dictionary, key: &[u8]) -> Option<BookmarkHandle> {
    match dict.get(key) {
        Ok(Object::Reference(id)) => Some(bookmark_handle(*id)),
        _ => None,
    }
}

fn outline_root(doc: &Document) -> Option<&Dictionary> {
    let catalog = doc.catalog().ok()?;
    match resolve(doc, catalog.get(b"Outlines").ok()?) {
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn resolve_destination(
    doc: &Document,
    dest: &Object,
    pages: &BTreeMap<u32, ObjectId>,
) -> Option<Destination> {
    match resolve(doc, dest) {
        Object::Array(items) => explicit_destination(doc, items, pages),
        Object::String(bytes, _) => named_destination(doc, bytes, pages),
        Object::Name(name) => named_destination(doc, name, pages),
        Object::Dictionary(dict) => resolve_destination(doc, dict.get(b"D").ok()?, pages),
        _ => None,
    }
}

fn explicit_destination(
    doc: &Document,
    items: &[Object],
    pages: &BTreeMap<u32, ObjectId>,
) -> Option<Destination> {
    let page_index = match items.first()? {
        Object::Reference(id) => {
            pages.iter().find(|(_, page_id)| *page_id == id).map(|(number, _)| number - 1)
        }
        // Remote destinations carry a plain page number.
        Object::Integer(number) => u32::try_from(*number).ok(),
        _ => None,
    };

    let view_mode = items
        .get(1)
        .and_then(|obj| resolve(doc, obj).as_name().ok())
        .map(ViewMode::from_name)
        .unwrap_or(ViewMode::Unknown);

    let view_pos = items
        .iter()
        .skip(2)
        .map(|obj| match resolve(doc, obj) {
            Object::Integer(value) => *value as f32,
            Object::Real(value) => *value,
            _ => 0.0,
        })
        .collect();

    Some(Destination { page_index, view_mode, view_pos })
}

fn named_destination(
    doc: &Document,
    name: &[u8],
    pages: &BTreeMap<u32, ObjectId>,
) -> Option<Destination> {
    let catalog = doc.catalog().ok()?;

    if let Some(Object::Dictionary(names)) = catalog.get(b"Names").ok().map(|obj| resolve(doc, obj))
    {
        if let Some(Object::Dictionary(tree)) =
            names.get(b"Dests").ok().map(|obj| resolve(doc, obj))
        {
            if let Some(dest) = lookup_name_tree(doc, tree, name, 0) {
                return resolve_destination(doc, dest, pages);
            }
        }
    }

    if let Some(Object::Dictionary(dests)) = catalog.get(b"Dests").ok().map(|obj| resolve(doc, obj))
    {
        if let Ok(dest) = dests.get(name) {
            return resolve_destination(doc, dest, pages);
        }
    }

    None
}

fn lookup_name_tree<'a>(
    doc: &'a Document,
    node: &'a Dictionary,
    name: &[u8],
    depth: usize,
) -> Option<&'a Object> {
    if depth > MAX_TREE_DEPTH {
        return None;
    }

    if let Some(Object::Array(entries)) = node.get(b"Names").ok().map(|obj| resolve(doc, obj)) {
        for pair in entries.chunks(2) {
            if let [Object::String(key, _), value] = pair {
                if key.as_slice() == name {
                    return Some(value);
                }
            }
        }
    }

    if let Some(Object::Array(kids)) = node.get(b"Kids").ok().map(|obj| resolve(doc, obj)) {
        for kid in kids {
            if let Object::Dictionary(kid) = resolve(doc, kid) {
                if let Some(found) = lookup_name_tree(doc, kid, name, depth + 1) {
                    return Some(found);
                }
            }
        }
    }

    None
}

/// Decode a PDF text string: UTF-16BE or UTF-8 with BOM, else PDFDocEncoding
/// approximated as Latin-1.
pub(crate) fn decode_text_string(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> =
            rest.chunks_exact(2).map(|pair| u16::from_be_bytes([pair[0], pair[1]])).collect();
        return String::from_utf16_lossy(&units);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    bytes.iter().map(|&b| b as char).collect()
}

fn inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut current = doc.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(value) = current.get(key) {
            return Some(resolve(doc, value));
        }
        let parent = current.get(b"Parent").and_then(Object::as_reference).ok()?;
        current = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn rect_size(obj: &Object) -> Option<PageSize> {
    let array = obj.as_array().ok()?;
    if array.len() != 4 {
        return None;
    }
    let x0 = array[0].as_float().ok()?;
    let y0 = array[1].as_float().ok()?;
    let x1 = array[2].as_float().ok()?;
    let y1 = array[3].as_float().ok()?;
    Some(PageSize { width_pt: (x1 - x0).abs(), height_pt: (y1 - y0).abs() })
}

fn effective_page_size(doc: &Document, page_id: ObjectId) -> Result<PageSize, EngineError> {
    doc.get_dictionary(page_id).map_err(|err| EngineError::Backend(err.to_string()))?;

    let size = inherited(doc, page_id, b"CropBox")
        .and_then(rect_size)
        .or_else(|| inherited(doc, page_id, b"MediaBox").and_then(rect_size))
        .unwrap_or(DEFAULT_PAGE_SIZE);

    let rotate = inherited(doc, page_id, b"Rotate").and_then(|obj| obj.as_i64().ok()).unwrap_or(0);
    if rotate.rem_euclid(180) == 90 {
        Ok(PageSize { width_pt: size.height_pt, height_pt: size.width_pt })
    } else {
        Ok(size)
    }
}

fn pages_root(doc: &Document) -> Result<ObjectId, EngineError> {
    doc.catalog()
        .and_then(|catalog| catalog.get(b"Pages"))
        .and_then(Object::as_reference)
        .map_err(|err| EngineError::Backend(format!("missing page tree: {err}")))
}

fn kids_mut(doc: &mut Document, node: ObjectId) -> Result<&mut Vec<Object>, EngineError> {
    doc.get_object_mut(node)
        .and_then(Object::as_dict_mut)
        .and_then(|dict| dict.get_mut(b"Kids"))
        .and_then(Object::as_array_mut)
        .map_err(|err| EngineError::Backend(format!("malformed page tree node: {err}")))
}

/// Walk from `node` to the root adding `delta` to every `/Count`.
fn adjust_counts(doc: &mut Document, mut node: ObjectId, delta: i64) -> Result<(), EngineError> {
    for _ in 0..MAX_TREE_DEPTH {
        let dict = doc
            .get_object_mut(node)
            .and_then(Object::as_dict_mut)
            .map_err(|err| EngineError::Backend(err.to_string()))?;
        let count = dict.get(b"Count").and_then(Object::as_i64).unwrap_or(0);
        dict.set("Count", count + delta);
        match dict.get(b"Parent").and_then(Object::as_reference) {
            Ok(parent) => node = parent,
            Err(_) => return Ok(()),
        }
    }
    Err(EngineError::Backend("page tree is too deep".to_owned()))
}

fn parent_of(doc: &Document, page_id: ObjectId) -> Result<ObjectId, EngineError> {
    doc.get_dictionary(page_id)
        .and_then(|dict| dict.get(b"Parent"))
        .and_then(Object::as_reference)
        .map_err(|err| EngineError::Backend(format!("page has no parent: {err}")))
}

fn insert_page(doc: &mut Document, index: u32, size: PageSize) -> Result<ObjectId, EngineError> {
    let pages = doc.get_pages();
    let count = pages.len() as u32;

    // Insert before the page currently at `index`, or after the last page.
    let (parent, position) = if index < count {
        let anchor = pages[&(index + 1)];
        let parent = parent_of(doc, anchor)?;
        let kids = kids_mut(doc, parent)?;
        let position = kids
            .iter()
            .position(|kid| matches!(kid, Object::Reference(id) if *id == anchor))
            .unwrap_or(kids.len());
        (parent, position)
    } else if let Some(last) = pages.values().next_back().copied() {
        let parent = parent_of(doc, last)?;
        let kids = kids_mut(doc, parent)?;
        let position = kids
            .iter()
            .position(|kid| matches!(kid, Object::Reference(id) if *id == last))
            .map(|p| p + 1)
            .unwrap_or(kids.len());
        (parent, position)
    } else {
        let root = pages_root(doc)?;
        (root, kids_mut(doc, root)?.len())
    };

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => parent,
        "MediaBox" => vec![0.into(), 0.into(), size.width_pt.into(), size.height_pt.into()],
        "Resources" => Dictionary::new(),
    });
    kids_mut(doc, parent)?.insert(position, Object::Reference(page_id));
    adjust_counts(doc, parent, 1)?;

    Ok(page_id)
}

fn remove_page(doc: &mut Document, page_id: ObjectId) -> Result<(), EngineError> {
    let parent = parent_of(doc, page_id)?;
    kids_mut(doc, parent)?.retain(|kid| !matches!(kid, Object::Reference(id) if *id == page_id));
    adjust_counts(doc, parent, -1)?;
    doc.objects.remove(&page_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{OutlineNode, PdfFixture};

    fn open_fixture(engine: &mut LopdfEngine, fixture: PdfFixture) -> DocumentHandle {
        let bytes = fixture.build();
        engine.open(OpenSource::Bytes(&bytes), None).expect("open should succeed")
    }

    fn save_bytes(engine: &mut LopdfEngine, doc: DocumentHandle, version: Option<u32>) -> Vec<u8> {
        let mut out = Vec::new();
        engine
            .save(doc, version, &mut |block: &[u8]| {
                out.extend_from_slice(block);
                true
            })
            .expect("save should succeed");
        out
    }

    #[test]
    fn opens_pdf_and_reads_page_count_and_version() {
        let mut engine = LopdfEngine::new();
        let doc = open_fixture(&mut engine, PdfFixture::new().pages(3));

        assert_eq!(engine.page_count(doc).expect("count"), 3);
        assert_eq!(engine.file_version(doc).expect("version"), Some(15));
    }

    #[test]
    fn garbage_input_is_a_format_error() {
        let mut engine = LopdfEngine::new();
        let err = engine
            .open(OpenSource::Bytes(b"definitely not a pdf"), None)
            .expect_err("garbage must not load");

        assert!(matches!(err, EngineError::Load { reason: LoadFailure::Format, .. }));
    }

    #[test]
    fn missing_path_is_a_file_error() {
        let mut engine = LopdfEngine::new();
        let err = engine
            .open(OpenSource::Path(std::path::Path::new("/nonexistent/leafpress.pdf")), None)
            .expect_err("missing file must not load");

        assert!(matches!(err, EngineError::Load { reason: LoadFailure::File, .. }));
    }

    #[test]
    fn reader_source_is_read_from_the_start() {
        let mut engine = LopdfEngine::new();
        let mut cursor = std::io::Cursor::new(PdfFixture::new().pages(2).build());
        cursor.set_position(10);

        let doc = engine.open(OpenSource::Reader(&mut cursor), None).expect("open");
        assert_eq!(engine.page_count(doc).expect("count"), 2);
    }

    #[test]
    fn page_size_honours_rotation() {
        let mut engine = LopdfEngine::new();
        let doc = open_fixture(
            &mut engine,
            PdfFixture::new().page(200.0, 100.0).rotated_page(200.0, 100.0, 90),
        );

        let first = engine.load_page(doc, 0).expect("page 0");
        let second = engine.load_page(doc, 1).expect("page 1");

        assert_eq!(engine.page_size(first).expect("size"), PageSize::new(200.0, 100.0));
        assert_eq!(engine.page_size(second).expect("size"), PageSize::new(100.0, 200.0));
    }

    #[test]
    fn closing_a_document_invalidates_its_pages() {
        let mut engine = LopdfEngine::new();
        let doc = open_fixture(&mut engine, PdfFixture::new().pages(1));
        let page = engine.load_page(doc, 0).expect("page");

        engine.close(doc).expect("close");

        assert!(matches!(engine.page_size(page), Err(EngineError::InvalidHandle(_))));
        assert!(matches!(engine.page_count(doc), Err(EngineError::InvalidHandle(_))));
    }

    #[test]
    fn load_page_out_of_range() {
        let mut engine = LopdfEngine::new();
        let doc = open_fixture(&mut engine, PdfFixture::new().pages(2));

        let err = engine.load_page(doc, 2).expect_err("index 2 is past the end");
        assert!(matches!(err, EngineError::PageOutOfRange { page: 2, page_count: 2 }));
    }

    #[test]
    fn new_and_deleted_pages_survive_a_save() {
        let mut engine = LopdfEngine::new();
        let doc = engine.create().expect("create");
        assert_eq!(engine.file_version(doc).expect("version"), None);

        engine.new_page(doc, 0, PageSize::new(100.0, 100.0)).expect("first");
        engine.new_page(doc, 0, PageSize::new(300.0, 300.0)).expect("prepend");
        engine.new_page(doc, 2, PageSize::new(500.0, 500.0)).expect("append");
        engine.delete_page(doc, 1).expect("delete middle");

        let bytes = save_bytes(&mut engine, doc, Some(17));
        let reopened = engine.open(OpenSource::Bytes(&bytes), None).expect("reopen");

        assert_eq!(engine.page_count(reopened).expect("count"), 2);
        assert_eq!(engine.file_version(reopened).expect("version"), Some(17));
        let first = engine.load_page(reopened, 0).expect("page");
        assert_eq!(engine.page_size(first).expect("size"), PageSize::new(300.0, 300.0));
        let second = engine.load_page(reopened, 1).expect("page");
        assert_eq!(engine.page_size(second).expect("size"), PageSize::new(500.0, 500.0));
    }

    #[test]
    fn save_aborts_when_sink_refuses() {
        let mut engine = LopdfEngine::new();
        let doc = open_fixture(&mut engine, PdfFixture::new().pages(1));

        let err = engine.save(doc, None, &mut |_: &[u8]| false).expect_err("sink refused");
        assert!(matches!(err, EngineError::Save(_)));
    }

    #[test]
    fn walks_outline_with_destinations() {
        let mut engine = LopdfEngine::new();
        let doc = open_fixture(
            &mut engine,
            PdfFixture::new()
                .pages(3)
                .outline(OutlineNode::new("One").page(0).child(OutlineNode::new("One.A").page(1)))
                .outline(OutlineNode::new("Two").page(2).closed().child(OutlineNode::new("Two.A"))),
        );

        let one = engine.first_bookmark(doc, None).expect("walk").expect("first item");
        assert_eq!(engine.bookmark_title(doc, one).expect("title"), "One");
        assert_eq!(engine.bookmark_count(doc, one).expect("count"), 1);
        let dest = engine.bookmark_destination(doc, one).expect("dest").expect("has dest");
        assert_eq!(dest.page_index, Some(0));
        assert_eq!(dest.view_mode, ViewMode::Xyz);

        let child = engine.first_bookmark(doc, Some(one)).expect("walk").expect("child");
        assert_eq!(engine.bookmark_title(doc, child).expect("title"), "One.A");

        let two = engine.next_bookmark(doc, one).expect("walk").expect("second item");
        assert_eq!(engine.bookmark_count(doc, two).expect("count"), -1);
        assert!(engine.next_bookmark(doc, two).expect("walk").is_none());
    }

    #[test]
    fn metadata_reads_info_dictionary() {
        let mut engine = LopdfEngine::new();
        let doc = open_fixture(&mut engine, PdfFixture::new().pages(1).info("Title", "Leaves"));

        assert_eq!(engine.metadata_value(doc, "Title").expect("meta").as_deref(), Some("Leaves"));
        assert_eq!(engine.metadata_value(doc, "Author").expect("meta"), None);
    }

    #[test]
    fn render_fills_canvas_at_scale() {
        let mut engine = LopdfEngine::new();
        let doc = open_fixture(&mut engine, PdfFixture::new().page(100.0, 50.0));
        let page = engine.load_page(doc, 0).expect("page");

        let request =
            RenderRequest { scale: 2.0, fill_color: [10, 20, 30, 255], ..Default::default() };
        let image = engine.render_page(page, &request).expect("render");

        assert_eq!(image.dimensions(), (200, 100));
        assert_eq!(image.get_pixel(0, 0), &Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn decodes_utf16_titles() {
        assert_eq!(decode_text_string(&[0xFE, 0xFF, 0x00, 0x41, 0x00, 0xE9]), "Aé");
        assert_eq!(decode_text_string(b"plain"), "plain");
    }
}
