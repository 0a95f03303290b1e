//! Wire format between the pool and its worker processes.
//!
//! Every message is one frame:
//!
//! ```text
//! u32 BE header length | JSON header | u64 BE payload length | payload
//! ```
//!
//! A task frame carries the document bytes as payload (empty for path
//! sources); a result frame carries the pixel buffer or PNG data.

use leafpress_core::{FileAccess, PixelFormat, RenderOptions, RenderSource, RenderedPage};
use pdf_engine::Backend;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Headers are small JSON objects; anything larger is a corrupt stream.
const MAX_HEADER_LEN: u32 = 1 << 20;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("pipe I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame header: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame header of {0} bytes exceeds the limit")]
    HeaderTooLarge(u32),

    #[error("stream ended in the middle of a frame")]
    Truncated,

    #[error("unexpected payload: {0}")]
    Payload(String),
}

/// What a worker sends back for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendererKind {
    /// Raw pixel buffer in the requested pixel format.
    #[default]
    Bytes,
    /// PNG-encoded image.
    Png,
}

/// One page to render, consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTask {
    pub page_index: u32,
    pub renderer: RendererKind,
    pub source: RenderSource,
    pub password: Option<String>,
    pub file_access: FileAccess,
    pub options: RenderOptions,
    pub backend: Backend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderPayload {
    Pixels(RenderedPage),
    Png { width: u32, height: u32, data: Vec<u8> },
}

impl RenderPayload {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Pixels(page) => (page.width, page.height),
            Self::Png { width, height, .. } => (*width, *height),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResult {
    pub page_index: u32,
    pub payload: RenderPayload,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum SourceHeader {
    Path { path: PathBuf },
    /// The document is the frame payload.
    Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskHeader {
    page_index: u32,
    renderer: RendererKind,
    source: SourceHeader,
    password: Option<String>,
    file_access: FileAccess,
    options: RenderOptions,
    backend: Backend,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum ResultHeader {
    Pixels { page_index: u32, width: u32, height: u32, stride: usize, format: PixelFormat },
    Png { page_index: u32, width: u32, height: u32 },
    Failed { page_index: u32, message: String },
}

/// A worker's answer to one task.
pub type Reply = Result<RenderResult, (u32, String)>;

/// Write one frame and flush it.
pub fn write_frame<W: Write, H: Serialize>(
    writer: &mut W,
    header: &H,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let header = serde_json::to_vec(header)?;
    let header_len = u32::try_from(header.len()).unwrap_or(u32::MAX);
    if header_len > MAX_HEADER_LEN {
        return Err(ProtocolError::HeaderTooLarge(header_len));
    }

    writer.write_all(&header_len.to_be_bytes())?;
    writer.write_all(&header)?;
    writer.write_all(&(payload.len() as u64).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. `None` when the stream ends cleanly between frames.
pub fn read_frame<R: Read, H: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<(H, Vec<u8>)>, ProtocolError> {
    let mut len = [0u8; 4];
    match read_exact_or_eof(reader, &mut len)? {
        0 => return Ok(None),
        4 => {}
        _ => return Err(ProtocolError::Truncated),
    }

    let header_len = u32::from_be_bytes(len);
    if header_len > MAX_HEADER_LEN {
        return Err(ProtocolError::HeaderTooLarge(header_len));
    }
    let mut header = vec![0u8; header_len as usize];
    read_body(reader, &mut header)?;
    let header = serde_json::from_slice(&header)?;

    let mut len = [0u8; 8];
    read_body(reader, &mut len)?;
    let payload_len = usize::try_from(u64::from_be_bytes(len))
        .map_err(|_| ProtocolError::Payload("payload length overflows usize".to_owned()))?;
    let mut payload = Vec::new();
    reader.take(payload_len as u64).read_to_end(&mut payload)?;
    if payload.len() != payload_len {
        return Err(ProtocolError::Truncated);
    }

    Ok(Some((header, payload)))
}

/// Like `read_exact`, but reports how much was read instead of failing at EOF.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn read_body<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => ProtocolError::Truncated,
        _ => ProtocolError::Io(err),
    })
}

pub fn write_task<W: Write>(writer: &mut W, task: &RenderTask) -> Result<(), ProtocolError> {
    let (source, payload): (SourceHeader, &[u8]) = match &task.source {
        RenderSource::Path(path) => (SourceHeader::Path { path: path.clone() }, &[][..]),
        RenderSource::Bytes(bytes) => (SourceHeader::Bytes, &bytes[..]),
    };
    let header = TaskHeader {
        page_index: task.page_index,
        renderer: task.renderer,
        source,
        password: task.password.clone(),
        file_access: task.file_access,
        options: task.options,
        backend: task.backend,
    };
    write_frame(writer, &header, payload)
}

pub fn read_task<R: Read>(reader: &mut R) -> Result<Option<RenderTask>, ProtocolError> {
    let Some((header, payload)) = read_frame::<_, TaskHeader>(reader)? else {
        return Ok(None);
    };
    let source = match header.source {
        SourceHeader::Path { path } => RenderSource::Path(path),
        SourceHeader::Bytes => RenderSource::Bytes(Arc::from(payload)),
    };
    Ok(Some(RenderTask {
        page_index: header.page_index,
        renderer: header.renderer,
        source,
        password: header.password,
        file_access: header.file_access,
        options: header.options,
        backend: header.backend,
    }))
}

pub fn write_reply<W: Write>(writer: &mut W, reply: &Reply) -> Result<(), ProtocolError> {
    match reply {
        Ok(RenderResult { page_index, payload: RenderPayload::Pixels(page) }) => {
            let header = ResultHeader::Pixels {
                page_index: *page_index,
                width: page.width,
                height: page.height,
                stride: page.stride,
                format: page.format,
            };
            write_frame(writer, &header, &page.pixels)
        }
        Ok(RenderResult { page_index, payload: RenderPayload::Png { width, height, data } }) => {
            let header =
                ResultHeader::Png { page_index: *page_index, width: *width, height: *height };
            write_frame(writer, &header, data)
        }
        Err((page_index, message)) => {
            let header = ResultHeader::Failed { page_index: *page_index, message: message.clone() };
            write_frame(writer, &header, &[])
        }
    }
}

pub fn read_reply<R: Read>(reader: &mut R) -> Result<Option<Reply>, ProtocolError> {
    let Some((header, payload)) = read_frame::<_, ResultHeader>(reader)? else {
        return Ok(None);
    };
    let reply = match header {
        ResultHeader::Pixels { page_index, width, height, stride, format } => {
            if stride.checked_mul(height as usize) != Some(payload.len()) {
                return Err(ProtocolError::Payload(format!(
                    "{} pixel bytes for {width}x{height} {format} with stride {stride}",
                    payload.len()
                )));
            }
            let page = RenderedPage { width, height, stride, format, pixels: payload };
            Ok(RenderResult { page_index, payload: RenderPayload::Pixels(page) })
        }
        ResultHeader::Png { page_index, width, height } => Ok(RenderResult {
            page_index,
            payload: RenderPayload::Png { width, height, data: payload },
        }),
        ResultHeader::Failed { page_index, message } => Err((page_index, message)),
    };
    Ok(Some(reply))
}
