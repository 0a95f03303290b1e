use crate::{EngineError, LopdfEngine, PdfEngine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

pub const BACKEND_ENV: &str = "LEAFPRESS_BACKEND";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Lopdf,
    Pdfium,
}

impl Backend {
    /// Backend named by `LEAFPRESS_BACKEND`, falling back to the default.
    pub fn from_env() -> Self {
        match std::env::var(BACKEND_ENV) {
            Ok(value) => value.parse().unwrap_or_else(|err| {
                log::warn!("ignoring {BACKEND_ENV}: {err}");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lopdf => "lopdf",
            Self::Pdfium => "pdfium",
        }
    }

    fn instantiate(self) -> Result<Box<dyn PdfEngine>, EngineError> {
        match self {
            Self::Lopdf => Ok(Box::new(LopdfEngine::new())),
            #[cfg(feature = "pdfium")]
            Self::Pdfium => Ok(Box::new(crate::pdfium_backend::PdfiumEngine::bind()?)),
            #[cfg(not(feature = "pdfium"))]
            Self::Pdfium => {
                Err(EngineError::Backend("built without the `pdfium` feature".to_owned()))
            }
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lopdf" => Ok(Self::Lopdf),
            "pdfium" => Ok(Self::Pdfium),
            other => Err(format!("unknown engine backend '{other}'")),
        }
    }
}

static NEXT_LIBRARY_ID: AtomicU64 = AtomicU64::new(1);

/// Serialized access to one engine instance.
///
/// After [`Library::shutdown`] every call fails with
/// [`EngineError::LibraryShutDown`]; the engine itself is dropped exactly once.
pub struct Library {
    id: u64,
    backend: Backend,
    engine: Mutex<Option<Box<dyn PdfEngine>>>,
}

impl Library {
    pub fn new(backend: Backend) -> Result<Self, EngineError> {
        let engine = backend.instantiate()?;
        log::debug!("initialized {} engine", engine.name());
        Ok(Self::with_engine(backend, engine))
    }

    pub fn with_engine(backend: Backend, engine: Box<dyn PdfEngine>) -> Self {
        Self {
            id: NEXT_LIBRARY_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            engine: Mutex::new(Some(engine)),
        }
    }

    /// Distinguishes library instances so handles from one are never sent to another.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn with<T>(
        &self,
        f: impl FnOnce(&mut dyn PdfEngine) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut guard = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(engine) => f(engine.as_mut()),
            None => Err(EngineError::LibraryShutDown),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// Release the engine. Returns `false` when it was already released.
    pub fn shutdown(&self) -> bool {
        let engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner).take();
        match engine {
            Some(engine) => {
                log::debug!("shutting down {} engine", engine.name());
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

static GLOBAL: OnceLock<Arc<Library>> = OnceLock::new();
static GLOBAL_SHUT_DOWN: AtomicBool = AtomicBool::new(false);

/// Initialize the process-wide library. Later calls return the existing
/// instance regardless of `backend`.
pub fn initialize(backend: Backend) -> Result<Arc<Library>, EngineError> {
    if let Some(library) = GLOBAL.get() {
        return Ok(Arc::clone(library));
    }
    let library = Arc::new(Library::new(backend)?);
    Ok(Arc::clone(GLOBAL.get_or_init(|| library)))
}

/// The process-wide library, initialized from the environment on first use.
pub fn global() -> Result<Arc<Library>, EngineError> {
    initialize(Backend::from_env())
}

/// Tear down the process-wide library. Only the first call has any effect.
pub fn shutdown() {
    if GLOBAL_SHUT_DOWN.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Some(library) = GLOBAL.get() {
        library.shutdown();
    }
}

/// Calls [`shutdown`] when dropped, typically held by `main`.
#[derive(Debug, Default)]
pub struct LibraryGuard {
    _private: (),
}

impl LibraryGuard {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Drop for LibraryGuard {
    fn drop(&mut self) {
        shutdown();
    }
}
