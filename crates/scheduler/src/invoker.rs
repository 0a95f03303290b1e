//! Renders a single task inside a worker process.

use crate::protocol::{RenderPayload, RenderResult, RenderTask, RendererKind};
use leafpress_core::{Document, OpenOptions, PdfInput, RenderSource, Result};
use pdf_engine::Library;
use std::sync::Arc;

/// Open a fresh document from the task source, render its one page and
/// release both again.
///
/// Page and document are closed in that order on success; on any failure
/// their `Drop` impls do the same.
pub fn process_page(library: &Arc<Library>, task: &RenderTask) -> Result<RenderResult> {
    let input = match &task.source {
        RenderSource::Path(path) => PdfInput::Path(path.clone()),
        RenderSource::Bytes(bytes) => PdfInput::Bytes(Arc::clone(bytes)),
    };
    let mut options = OpenOptions::new().with_file_access(task.file_access);
    options.password = task.password.clone();

    let doc = Document::open_in(Arc::clone(library), input, &options)?;
    let page = doc.get_page(task.page_index)?;
    let rendered = page.render(&task.options)?;
    page.close()?;
    doc.close()?;

    let payload = match task.renderer {
        RendererKind::Bytes => RenderPayload::Pixels(rendered),
        RendererKind::Png => {
            let (width, height) = (rendered.width, rendered.height);
            RenderPayload::Png { width, height, data: rendered.encode_png()? }
        }
    };
    log::debug!("rendered page {} as {:?}", task.page_index, task.renderer);

    Ok(RenderResult { page_index: task.page_index, payload })
}
