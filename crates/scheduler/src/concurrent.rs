//! Concurrent rendering entry points on [`Document`].

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::pool::{RenderPool, RenderStream};
use crate::protocol::{RenderPayload, RenderResult, RendererKind};
use image::RgbaImage;
use leafpress_core::{Document, RenderOptions};

pub trait ConcurrentRender {
    /// Raw pixel buffers, one per page, in request order.
    fn render_to_bytes(
        &self,
        pages: Option<&[u32]>,
        options: &RenderOptions,
        config: &PoolConfig,
    ) -> Result<RenderStream, PoolError>;

    /// Pages as RGBA images, in request order.
    fn render_to_images(
        &self,
        pages: Option<&[u32]>,
        options: &RenderOptions,
        config: &PoolConfig,
    ) -> Result<ImageStream, PoolError>;

    /// PNG-encoded pages, in request order.
    fn render_to_png(
        &self,
        pages: Option<&[u32]>,
        options: &RenderOptions,
        config: &PoolConfig,
    ) -> Result<RenderStream, PoolError>;
}

impl ConcurrentRender for Document {
    fn render_to_bytes(
        &self,
        pages: Option<&[u32]>,
        options: &RenderOptions,
        config: &PoolConfig,
    ) -> Result<RenderStream, PoolError> {
        RenderPool::new(config.clone()).render(self, pages, options, RendererKind::Bytes)
    }

    fn render_to_images(
        &self,
        pages: Option<&[u32]>,
        options: &RenderOptions,
        config: &PoolConfig,
    ) -> Result<ImageStream, PoolError> {
        Ok(ImageStream { inner: self.render_to_bytes(pages, options, config)? })
    }

    fn render_to_png(
        &self,
        pages: Option<&[u32]>,
        options: &RenderOptions,
        config: &PoolConfig,
    ) -> Result<RenderStream, PoolError> {
        RenderPool::new(config.clone()).render(self, pages, options, RendererKind::Png)
    }
}

/// [`RenderStream`] adapter yielding `(page_index, image)` pairs.
pub struct ImageStream {
    inner: RenderStream,
}

impl Iterator for ImageStream {
    type Item = Result<(u32, RgbaImage), PoolError>;

    fn next(&mut self) -> Option<Self::Item> {
        let RenderResult { page_index, payload } = match self.inner.next()? {
            Ok(result) => result,
            Err(err) => return Some(Err(err)),
        };
        let image = match payload {
            RenderPayload::Pixels(page) => Ok(page.into_image()),
            RenderPayload::Png { data, .. } => image::load_from_memory(&data)
                .map(|decoded| decoded.to_rgba8())
                .map_err(|err| PoolError::Document(err.into())),
        };
        Some(image.map(|image| (page_index, image)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
