use crate::document::DocumentInner;
use crate::render::{self, RenderOptions, RenderedPage};
use crate::{Error, Result};
use image::RgbaImage;
use pdf_engine::{EngineError, PageHandle, PageSize, PdfEngine};
use std::sync::{Arc, Weak};

/// One loaded page.
///
/// Holds a weak reference to its document; once the document closes (or is
/// dropped) every operation fails with [`Error::PageClosed`].
pub struct Page {
    doc: Weak<DocumentInner>,
    id: u64,
    index: u32,
}

impl Page {
    pub(crate) fn new(doc: &Arc<DocumentInner>, id: u64, index: u32) -> Self {
        Self { doc: Arc::downgrade(doc), id, index }
    }

    /// Zero-based index this page had when it was loaded.
    pub fn index(&self) -> u32 {
        self.index
    }

    fn with_handle<T>(
        &self,
        f: impl FnOnce(&mut dyn PdfEngine, PageHandle) -> std::result::Result<T, EngineError>,
    ) -> Result<T> {
        let doc = self.doc.upgrade().ok_or(Error::PageClosed)?;
        let state = doc.lock();
        let handle = *state.live_pages.get(&self.id).ok_or(Error::PageClosed)?;
        Ok(doc.library.with(|engine| f(engine, handle))?)
    }

    pub fn size(&self) -> Result<PageSize> {
        self.with_handle(|engine, page| engine.page_size(page))
    }

    pub fn width(&self) -> Result<f32> {
        Ok(self.size()?.width_pt)
    }

    pub fn height(&self) -> Result<f32> {
        Ok(self.size()?.height_pt)
    }

    pub fn render(&self, options: &RenderOptions) -> Result<RenderedPage> {
        options.validate()?;
        let request = options.request();
        let raster = self.with_handle(|engine, page| engine.render_page(page, &request))?;
        render::finish(raster, options)
    }

    pub fn render_image(&self, options: &RenderOptions) -> Result<RgbaImage> {
        Ok(self.render(options)?.into_image())
    }

    pub fn is_closed(&self) -> bool {
        match self.doc.upgrade() {
            Some(doc) => !doc.lock().live_pages.contains_key(&self.id),
            None => true,
        }
    }

    /// Release the page handle. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(doc) = self.doc.upgrade() else {
            return Ok(());
        };
        let mut state = doc.lock();
        let Some(handle) = state.live_pages.remove(&self.id) else {
            return Ok(());
        };
        match doc.library.with(|engine| engine.close_page(handle)) {
            Ok(()) | Err(EngineError::LibraryShutDown) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::debug!("failed to close page {}: {err}", self.index);
        }
    }
}
