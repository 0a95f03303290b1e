//! Small, deterministic PDFs for tests.

use lopdf::{
    dictionary, Dictionary, Document, EncryptionState, EncryptionVersion, Object, ObjectId,
    Permissions, StringFormat,
};
use std::io;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct OutlineNode {
    title: String,
    page: Option<u32>,
    closed: bool,
    children: Vec<OutlineNode>,
}

impl OutlineNode {
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into(), page: None, closed: false, children: Vec::new() }
    }

    /// Target page, as a zero-based index.
    pub fn page(mut self, index: u32) -> Self {
        self.page = Some(index);
        self
    }

    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }

    pub fn child(mut self, node: OutlineNode) -> Self {
        self.children.push(node);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct FixturePage {
    width: f32,
    height: f32,
    rotate: i64,
}

/// Builder for a PDF with plain pages, an optional outline and `/Info` entries.
#[derive(Debug, Clone)]
pub struct PdfFixture {
    version: String,
    pages: Vec<FixturePage>,
    info: Vec<(String, String)>,
    outline: Vec<OutlineNode>,
    cyclic_outline: bool,
    user_password: Option<String>,
}

impl Default for PdfFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl PdfFixture {
    pub fn new() -> Self {
        Self {
            version: "1.5".to_owned(),
            pages: Vec::new(),
            info: Vec::new(),
            outline: Vec::new(),
            cyclic_outline: false,
            user_password: None,
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_owned();
        self
    }

    pub fn page(mut self, width: f32, height: f32) -> Self {
        self.pages.push(FixturePage { width, height, rotate: 0 });
        self
    }

    pub fn rotated_page(mut self, width: f32, height: f32, rotate: i64) -> Self {
        self.pages.push(FixturePage { width, height, rotate });
        self
    }

    /// Append `count` A4 pages.
    pub fn pages(mut self, count: u32) -> Self {
        for _ in 0..count {
            self = self.page(595.0, 842.0);
        }
        self
    }

    pub fn info(mut self, key: &str, value: &str) -> Self {
        self.info.push((key.to_owned(), value.to_owned()));
        self
    }

    pub fn outline(mut self, node: OutlineNode) -> Self {
        self.outline.push(node);
        self
    }

    /// Encrypt the file (RC4, 128-bit) with the given user password, which
    /// may be empty.
    pub fn encrypted(mut self, user_password: &str) -> Self {
        self.user_password = Some(user_password.to_owned());
        self
    }

    /// Link the last top-level outline item back to the first one.
    pub fn cyclic_outline(mut self) -> Self {
        self.cyclic_outline = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut doc = Document::with_version(self.version.as_str());
        let pages_id = doc.new_object_id();

        let page_ids: Vec<ObjectId> = self
            .pages
            .iter()
            .map(|page| {
                let mut dict = dictionary! {
                    "Type" => "Page",
                    "Parent" => pages_id,
                    "MediaBox" => vec![0.into(), 0.into(), page.width.into(), page.height.into()],
                    "Resources" => Dictionary::new(),
                };
                if page.rotate != 0 {
                    dict.set("Rotate", page.rotate);
                }
                doc.add_object(dict)
            })
            .collect();

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => page_ids.iter().map(|id| Object::Reference(*id)).collect::<Vec<_>>(),
                "Count" => page_ids.len() as i64,
            }),
        );

        let mut catalog = dictionary! { "Type" => "Catalog", "Pages" => pages_id };
        if !self.outline.is_empty() {
            let outlines_id = doc.new_object_id();
            let (first, last, count) =
                add_outline_level(&mut doc, &self.outline, outlines_id, &page_ids);
            if self.cyclic_outline {
                if let Ok(Object::Dictionary(last_dict)) = doc.get_object_mut(last) {
                    last_dict.set("Next", first);
                }
            }
            doc.objects.insert(
                outlines_id,
                Object::Dictionary(dictionary! {
                    "Type" => "Outlines",
                    "First" => first,
                    "Last" => last,
                    "Count" => count,
                }),
            );
            catalog.set("Outlines", outlines_id);
        }
        let catalog_id = doc.add_object(catalog);
        doc.trailer.set("Root", catalog_id);

        if !self.info.is_empty() {
            let mut info = Dictionary::new();
            for (key, value) in &self.info {
                info.set(key.as_bytes().to_vec(), Object::string_literal(value.as_str()));
            }
            let info_id = doc.add_object(info);
            doc.trailer.set("Info", info_id);
        }

        if let Some(user_password) = &self.user_password {
            if let Err(err) = encrypt(&mut doc, user_password) {
                log::warn!("fixture left unencrypted: {err}");
            }
        }

        let mut out = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = doc.save_to(&mut out);
        out
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        std::fs::write(path, self.build())
    }
}

/// Add one sibling chain under `parent`; returns (first, last, visible count).
fn encrypt(doc: &mut Document, user_password: &str) -> lopdf::Result<()> {
    let id = Object::String(b"leafpress-fixture".to_vec(), StringFormat::Hexadecimal);
    doc.trailer.set("ID", vec![id.clone(), id]);
    let state = EncryptionState::try_from(EncryptionVersion::V2 {
        document: &*doc,
        owner_password: "owner",
        user_password,
        key_length: 128,
        permissions: Permissions::default(),
    })?;
    doc.encrypt(&state)
}

fn add_outline_level(
    doc: &mut Document,
    nodes: &[OutlineNode],
    parent: ObjectId,
    page_ids: &[ObjectId],
) -> (ObjectId, ObjectId, i64) {
    let ids: Vec<ObjectId> = nodes.iter().map(|_| doc.new_object_id()).collect();
    let mut visible = 0;

    for (position, (node, id)) in nodes.iter().zip(&ids).enumerate() {
        let mut dict = dictionary! {
            "Title" => Object::string_literal(node.title.as_str()),
            "Parent" => parent,
        };
        if position > 0 {
            dict.set("Prev", ids[position - 1]);
        }
        if let Some(next) = ids.get(position + 1) {
            dict.set("Next", *next);
        }
        if let Some(page_id) = node.page.and_then(|index| page_ids.get(index as usize)) {
            dict.set(
                "Dest",
                vec![
                    Object::Reference(*page_id),
                    Object::Name(b"XYZ".to_vec()),
                    Object::Integer(0),
                    Object::Real(842.0),
                    Object::Null,
                ],
            );
        }

        visible += 1;
        if !node.children.is_empty() {
            let (first, last, count) = add_outline_level(doc, &node.children, *id, page_ids);
            dict.set("First", first);
            dict.set("Last", last);
            dict.set("Count", if node.closed { -count } else { count });
            if !node.closed {
                visible += count;
            }
        }

        doc.objects.insert(*id, Object::Dictionary(dict));
    }

    (ids[0], ids[ids.len() - 1], visible)
}
