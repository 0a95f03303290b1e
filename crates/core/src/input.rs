//! Input normalization.
//!
//! Callers hand a [`PdfInput`] to [`crate::Document::open`]; normalization
//! turns it into something the engine can open and records which resources
//! the document has to release again on close.

use crate::{Error, Result};
use memmap2::Mmap;
use pdf_engine::{DocumentHandle, Library};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A seekable byte source that may need an explicit close.
pub trait InputBuffer: Read + Seek + Send {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl InputBuffer for File {}

impl<T: AsRef<[u8]> + Send> InputBuffer for Cursor<T> {}

/// A buffer shared between the caller and a document.
///
/// The document reads through it lazily; with `autoclose` it calls
/// [`InputBuffer::close`] when the document closes.
#[derive(Clone)]
pub struct SharedBuffer(Arc<Mutex<Box<dyn InputBuffer>>>);

impl SharedBuffer {
    pub fn new(buffer: impl InputBuffer + 'static) -> Self {
        Self(Arc::new(Mutex::new(Box::new(buffer))))
    }

    pub fn lock(&self) -> MutexGuard<'_, Box<dyn InputBuffer>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedBuffer")
    }
}

/// A document already opened directly through a [`Library`].
///
/// Opening a [`crate::Document`] from it transfers ownership of the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeDocument {
    library_id: u64,
    handle: DocumentHandle,
}

impl NativeDocument {
    pub fn new(library: &Library, handle: DocumentHandle) -> Self {
        Self { library_id: library.id(), handle }
    }

    pub fn handle(&self) -> DocumentHandle {
        self.handle
    }
}

pub enum PdfInput {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
    Buffer(SharedBuffer),
    Mmap(Mmap),
    Native(NativeDocument),
}

impl fmt::Debug for PdfInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Buffer(_) => f.write_str("Buffer"),
            Self::Mmap(map) => write!(f, "Mmap({} bytes)", map.len()),
            Self::Native(native) => f.debug_tuple("Native").field(native).finish(),
        }
    }
}

impl From<PathBuf> for PdfInput {
    fn from(value: PathBuf) -> Self {
        Self::Path(value)
    }
}

impl From<&Path> for PdfInput {
    fn from(value: &Path) -> Self {
        Self::Path(value.to_path_buf())
    }
}

impl From<&str> for PdfInput {
    fn from(value: &str) -> Self {
        Self::Path(PathBuf::from(value))
    }
}

impl From<Vec<u8>> for PdfInput {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value.into())
    }
}

impl From<Arc<[u8]>> for PdfInput {
    fn from(value: Arc<[u8]>) -> Self {
        Self::Bytes(value)
    }
}

impl From<SharedBuffer> for PdfInput {
    fn from(value: SharedBuffer) -> Self {
        Self::Buffer(value)
    }
}

impl From<Mmap> for PdfInput {
    fn from(value: Mmap) -> Self {
        Self::Mmap(value)
    }
}

impl From<NativeDocument> for PdfInput {
    fn from(value: NativeDocument) -> Self {
        Self::Native(value)
    }
}

/// How a path input reaches the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAccess {
    /// The engine opens the path itself.
    #[default]
    Native,
    /// Open a file handle and let the engine read through it.
    Buffer,
    /// Read the whole file into memory first.
    Bytes,
}

impl FileAccess {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Buffer => "buffer",
            Self::Bytes => "bytes",
        }
    }
}

impl fmt::Display for FileAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileAccess {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "buffer" => Ok(Self::Buffer),
            "bytes" => Ok(Self::Bytes),
            other => Err(Error::TypeMismatch(format!(
                "invalid file access strategy '{other}' (expected native, buffer or bytes)"
            ))),
        }
    }
}

/// The kind of input a document was opened from, kept for rendering-input
/// preparation.
#[derive(Debug, Clone)]
pub(crate) enum Origin {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
    Mmap,
    Buffer(SharedBuffer),
    Native,
}

/// What the engine actually opens. Held by the document until close.
pub(crate) enum Actual {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
    Mmap(Mmap),
    Buffer(SharedBuffer),
    Native(DocumentHandle),
}

pub(crate) struct Normalized {
    pub origin: Origin,
    pub actual: Actual,
    pub autoclose: bool,
}

/// Expand `~` and make `path` absolute without touching the file system.
pub fn resolve_path(path: &Path) -> Result<PathBuf> {
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    };

    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}

pub(crate) fn normalize(
    input: PdfInput,
    file_access: FileAccess,
    autoclose: bool,
    library: &Library,
) -> Result<Normalized> {
    match input {
        PdfInput::Path(path) => {
            let path = resolve_path(&path)?;
            if !path.is_file() {
                return Err(Error::NotFound(path));
            }

            let actual = match file_access {
                FileAccess::Native => Actual::Path(path.clone()),
                FileAccess::Buffer => {
                    // The document opened this handle, so it always closes it.
                    let buffer = SharedBuffer::new(File::open(&path)?);
                    return Ok(Normalized {
                        origin: Origin::Path(path),
                        actual: Actual::Buffer(buffer),
                        autoclose: true,
                    });
                }
                FileAccess::Bytes => Actual::Bytes(std::fs::read(&path)?.into()),
            };
            Ok(Normalized { origin: Origin::Path(path), actual, autoclose })
        }
        PdfInput::Bytes(bytes) => Ok(Normalized {
            origin: Origin::Bytes(Arc::clone(&bytes)),
            actual: Actual::Bytes(bytes),
            autoclose,
        }),
        PdfInput::Buffer(buffer) => Ok(Normalized {
            origin: Origin::Buffer(buffer.clone()),
            actual: Actual::Buffer(buffer),
            autoclose,
        }),
        PdfInput::Mmap(map) => {
            Ok(Normalized { origin: Origin::Mmap, actual: Actual::Mmap(map), autoclose })
        }
        PdfInput::Native(native) => {
            if native.library_id != library.id() {
                return Err(Error::TypeMismatch(
                    "native document belongs to a different library instance".to_owned(),
                ));
            }
            Ok(Normalized {
                origin: Origin::Native,
                actual: Actual::Native(native.handle),
                autoclose,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdf_engine::Backend;

    #[test]
    fn file_access_parses_known_names() {
        assert_eq!("native".parse::<FileAccess>().expect("parse"), FileAccess::Native);
        assert_eq!("BYTES".parse::<FileAccess>().expect("parse"), FileAccess::Bytes);

        let err = "mmap".parse::<FileAccess>().expect_err("unknown strategy");
        assert!(matches!(err, Error::TypeMismatch(_)));
    }

    #[test]
    fn relative_paths_become_absolute() {
        let resolved = resolve_path(Path::new("some/file.pdf")).expect("resolve");
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("some/file.pdf"));
    }

    #[test]
    fn missing_path_is_not_found() {
        let library = Library::new(Backend::Lopdf).expect("library");
        let result = normalize(
            PdfInput::from("/definitely/not/here.pdf"),
            FileAccess::Native,
            false,
            &library,
        );

        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn directory_is_not_a_regular_file() {
        let library = Library::new(Backend::Lopdf).expect("library");
        let dir = tempfile::tempdir().expect("tempdir");
        let result = normalize(PdfInput::from(dir.path()), FileAccess::Native, false, &library);

        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn native_handle_from_another_library_is_rejected() {
        let owner = Library::new(Backend::Lopdf).expect("library");
        let other = Library::new(Backend::Lopdf).expect("library");
        let handle = owner.with(|engine| engine.create()).expect("create");

        let result = normalize(
            PdfInput::from(NativeDocument::new(&owner, handle)),
            FileAccess::Native,
            false,
            &other,
        );

        assert!(matches!(result, Err(Error::TypeMismatch(_))));
    }

    #[test]
    fn buffer_access_forces_autoclose() {
        let library = Library::new(Backend::Lopdf).expect("library");
        let file = tempfile::NamedTempFile::new().expect("temp file");

        let normalized =
            normalize(PdfInput::from(file.path()), FileAccess::Buffer, false, &library)
                .expect("normalize");

        assert!(normalized.autoclose);
        assert!(matches!(normalized.actual, Actual::Buffer(_)));
        assert!(matches!(normalized.origin, Origin::Path(_)));
    }
}
