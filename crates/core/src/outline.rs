use crate::document::Document;
use crate::Result;
use pdf_engine::{BookmarkHandle, ViewMode};
use std::collections::HashSet;

pub const DEFAULT_MAX_DEPTH: usize = 15;

#[derive(Debug, Clone, PartialEq)]
pub struct OutlineItem {
    /// Nesting level, 0 for top-level items.
    pub level: usize,
    pub title: String,
    /// Number of direct children.
    pub n_kids: u32,
    /// `None` when the item has no children.
    pub is_closed: Option<bool>,
    pub page_index: Option<u32>,
    pub view_mode: ViewMode,
    pub view_pos: Vec<f32>,
}

/// Depth-first outline walk, one engine call at a time.
///
/// Every bookmark is remembered by identity; meeting one again ends the
/// sibling chain it was found in, which keeps circular outlines finite.
pub struct Toc<'a> {
    doc: &'a Document,
    max_depth: usize,
    /// Next unvisited sibling per open level; `None` once a level is exhausted.
    stack: Vec<Option<BookmarkHandle>>,
    seen: HashSet<BookmarkHandle>,
    started: bool,
    failed: bool,
}

impl<'a> Toc<'a> {
    pub(crate) fn new(doc: &'a Document, max_depth: usize) -> Self {
        Self {
            doc,
            max_depth,
            stack: Vec::new(),
            seen: HashSet::new(),
            started: false,
            failed: false,
        }
    }

    fn advance(&mut self) -> Result<Option<OutlineItem>> {
        if !self.started {
            self.started = true;
            if self.max_depth == 0 {
                return Ok(None);
            }
            let first = self.doc.with_handle(|engine, doc| engine.first_bookmark(doc, None))?;
            self.stack.push(first);
        }

        loop {
            let level = match self.stack.len() {
                0 => return Ok(None),
                len => len - 1,
            };
            let Some(bookmark) = self.stack[level] else {
                self.stack.pop();
                continue;
            };

            if !self.seen.insert(bookmark) {
                log::warn!(
                    "circular bookmark reference detected while reading the table of contents"
                );
                self.stack.pop();
                continue;
            }

            let descend = level + 1 < self.max_depth;
            let (item, next, child) = self.doc.with_handle(|engine, doc| {
                let title = engine.bookmark_title(doc, bookmark)?;
                let count = engine.bookmark_count(doc, bookmark)?;
                let dest = engine.bookmark_destination(doc, bookmark)?;
                let next = engine.next_bookmark(doc, bookmark)?;
                let child =
                    if descend { engine.first_bookmark(doc, Some(bookmark))? } else { None };

                let is_closed = match count {
                    0 => None,
                    c => Some(c < 0),
                };
                let (page_index, view_mode, view_pos) = match dest {
                    Some(dest) => (dest.page_index, dest.view_mode, dest.view_pos),
                    None => (None, ViewMode::Unknown, Vec::new()),
                };
                let item = OutlineItem {
                    level,
                    title,
                    n_kids: count.unsigned_abs(),
                    is_closed,
                    page_index,
                    view_mode,
                    view_pos,
                };
                Ok((item, next, child))
            })?;

            self.stack[level] = next;
            if descend {
                self.stack.push(child);
            }
            return Ok(Some(item));
        }
    }
}

impl Iterator for Toc<'_> {
    type Item = Result<OutlineItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(item) => item.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
