use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

mod config;
mod controller;
mod error;
mod navigation;
mod renderer;

pub use config::ReaderConfig;
pub use controller::{
    Command, ControllerState, PaginationController, ReaderEvent, RenderOutcome, RenderStatus,
};
pub use error::{ReaderError, Result};
pub use navigation::{build_markers, current_marker, reflect_in_control, ChapterControl};
pub use renderer::{LoadedDocument, RendererAdapter};

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0c9a5e-6b1d-5e47-9c2a-8d4b1e7f0a63").expect("valid namespace UUID")
});

/// Storage key prefix for persisted reading progress.
pub const PROGRESS_KEY_PREFIX: &str = "reader-progress-";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives a stable identifier from where the document is read from.
    pub fn for_source(source: &DocumentSource) -> Self {
        let rendered = match source {
            DocumentSource::Path(path) => resolve_path(path).to_string_lossy().into_owned(),
            DocumentSource::Url(url) => url.clone(),
        };
        Self(Uuid::new_v5(&*DOCUMENT_NAMESPACE, rendered.as_bytes()).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn resolve_path(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    Path(PathBuf),
    Url(String),
}

impl DocumentSource {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Self::Url(trimmed.to_owned())
        } else {
            Self::Path(PathBuf::from(trimmed))
        }
    }
}

impl fmt::Display for DocumentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Url(url) => f.write_str(url),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkerId(pub usize);

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chapter start resolved from the document outline. `start_page` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterMarker {
    pub id: MarkerId,
    pub start_page: usize,
    pub label: String,
}

/// Engine-defined handle for an outline target. Only the backend that produced
/// it knows how to turn it into a page index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineEntry {
    pub title: Option<String>,
    pub destination: Option<Destination>,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    pub page_index: usize,
    pub scale: f32,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            page_index: 0,
            scale: config::DEFAULT_RENDER_SCALE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// A document opened by the rendering engine. Page indices are 0-based here.
#[async_trait::async_trait]
pub trait DocumentBackend: Send + Sync {
    fn page_count(&self) -> usize;
    async fn outline(&self) -> anyhow::Result<Vec<OutlineEntry>>;
    async fn page_index(&self, destination: &Destination) -> anyhow::Result<usize>;
    async fn render_page(&self, request: RenderRequest) -> anyhow::Result<RenderImage>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, source: &DocumentSource) -> anyhow::Result<Arc<dyn DocumentBackend>>;
}

/// Where rendered pages end up.
pub trait Surface: Send {
    fn draw_page(&mut self, image: &RenderImage) -> anyhow::Result<()>;
    fn show_page_indicator(&mut self, page: usize, total: usize) -> anyhow::Result<()>;
}

pub fn page_indicator(page: usize, total: usize) -> String {
    format!("Page {} / {}", page, total)
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

pub struct MemoryKeyValueStore {
    inner: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.inner.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.inner.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Keeps every key in one JSON object on disk, replaced atomically on write.
pub struct FileKeyValueStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileKeyValueStore {
    const FILE_NAME: &'static str = "progress.json";

    pub fn new(root: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self {
            path: root.join(Self::FILE_NAME),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> anyhow::Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let mut file = File::open(&self.path)
            .with_context(|| format!("failed to open state file {:?}", self.path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        if buf.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let entries = serde_json::from_str(&buf)
            .with_context(|| format!("failed to decode state file {:?}", self.path))?;
        Ok(entries)
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock();
        let mut entries = match self.read_all() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(?err, path = ?self.path, "discarding unreadable state file");
                BTreeMap::new()
            }
        };
        entries.insert(key.to_owned(), value.to_owned());

        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(&entries)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp state file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace state file {:?}", self.path))?;
        Ok(())
    }
}

/// Last-read page per document, on top of a key-value backend.
#[derive(Clone)]
pub struct PositionStore {
    backend: Arc<dyn KeyValueStore>,
}

impl PositionStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn key_for(id: &DocumentId) -> String {
        format!("{}{}", PROGRESS_KEY_PREFIX, id)
    }

    /// Returns the stored page, or 1 when nothing usable is stored.
    pub fn load(&self, id: &DocumentId) -> usize {
        let key = Self::key_for(id);
        match self.backend.get(&key) {
            Ok(Some(raw)) => match raw.trim().parse::<usize>() {
                Ok(page) if page >= 1 => page,
                _ => {
                    warn!(%id, value = %raw, "ignoring corrupt reading progress");
                    1
                }
            },
            Ok(None) => 1,
            Err(err) => {
                warn!(?err, %id, "failed to read reading progress");
                1
            }
        }
    }

    pub fn save(&self, id: &DocumentId, page: usize) -> Result<()> {
        let key = Self::key_for(id);
        let value = page.to_string();
        if let Ok(Some(existing)) = self.backend.get(&key) {
            if existing == value {
                return Ok(());
            }
        }
        self.backend
            .set(&key, &value)
            .map_err(ReaderError::Storage)?;
        debug!(%id, page, "reading progress saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::tempdir;

    struct CountingStore {
        inner: MemoryKeyValueStore,
        writes: AtomicUsize,
    }

    impl KeyValueStore for CountingStore {
        fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value)
        }
    }

    #[test]
    fn position_store_defaults_to_first_page() {
        let store = PositionStore::new(Arc::new(MemoryKeyValueStore::new()));
        assert_eq!(store.load(&DocumentId::new("unknown")), 1);
    }

    #[test]
    fn position_store_uses_prefixed_keys() {
        let backend = Arc::new(MemoryKeyValueStore::new());
        let store = PositionStore::new(backend.clone());
        let id = DocumentId::new("42");

        store.save(&id, 7).unwrap();

        assert_eq!(
            backend.get("reader-progress-42").unwrap().as_deref(),
            Some("7")
        );
        assert_eq!(store.load(&id), 7);
    }

    #[test]
    fn position_store_falls_back_on_corrupt_values() {
        let backend = Arc::new(MemoryKeyValueStore::new());
        let store = PositionStore::new(backend.clone());
        let id = DocumentId::new("book");

        for raw in ["", "abc", "0", "-3", "2.5", "NaN"] {
            backend.set(&PositionStore::key_for(&id), raw).unwrap();
            assert_eq!(store.load(&id), 1, "value {:?}", raw);
        }

        backend.set(&PositionStore::key_for(&id), " 12 ").unwrap();
        assert_eq!(store.load(&id), 12);
    }

    #[test]
    fn position_store_skips_redundant_writes() {
        let backend = Arc::new(CountingStore {
            inner: MemoryKeyValueStore::new(),
            writes: AtomicUsize::new(0),
        });
        let store = PositionStore::new(backend.clone());
        let id = DocumentId::new("book");

        store.save(&id, 3).unwrap();
        store.save(&id, 3).unwrap();
        assert_eq!(backend.writes.load(Ordering::SeqCst), 1);

        store.save(&id, 4).unwrap();
        assert_eq!(backend.writes.load(Ordering::SeqCst), 2);
        assert_eq!(store.load(&id), 4);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("state");

        {
            let store = FileKeyValueStore::new(root.clone()).unwrap();
            store.set("reader-progress-a", "5").unwrap();
            store.set("reader-progress-b", "9").unwrap();
            store.set("reader-progress-a", "6").unwrap();
        }

        let reopened = FileKeyValueStore::new(root).unwrap();
        assert_eq!(
            reopened.get("reader-progress-a").unwrap().as_deref(),
            Some("6")
        );
        assert_eq!(
            reopened.get("reader-progress-b").unwrap().as_deref(),
            Some("9")
        );
        assert!(reopened.get("reader-progress-c").unwrap().is_none());
    }

    #[test]
    fn file_store_recovers_from_garbage_file() {
        let dir = tempdir().unwrap();
        let store = FileKeyValueStore::new(dir.path().to_path_buf()).unwrap();
        std::fs::write(store.path(), b"{not json").unwrap();

        assert!(store.get("reader-progress-a").is_err());
        let positions = PositionStore::new(Arc::new(store));
        let id = DocumentId::new("a");
        assert_eq!(positions.load(&id), 1);

        positions.save(&id, 2).unwrap();
        assert_eq!(positions.load(&id), 2);
    }

    #[test]
    fn document_id_is_stable_for_same_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("sample.pdf");
        std::fs::write(&file_path, b"dummy").unwrap();

        let source = DocumentSource::Path(file_path.clone());
        let first = DocumentId::for_source(&source);
        let second = DocumentId::for_source(&DocumentSource::Path(file_path));

        assert_eq!(first, second);
        assert_ne!(
            first,
            DocumentId::for_source(&DocumentSource::Url("https://example.com/a.pdf".into()))
        );
    }

    #[test]
    fn document_source_detects_urls() {
        assert_eq!(
            DocumentSource::parse(" https://example.com/book.pdf "),
            DocumentSource::Url("https://example.com/book.pdf".into())
        );
        assert_eq!(
            DocumentSource::parse("books/local.pdf"),
            DocumentSource::Path(PathBuf::from("books/local.pdf"))
        );
    }

    #[test]
    fn page_indicator_matches_reader_format() {
        assert_eq!(page_indicator(3, 120), "Page 3 / 120");
    }
}
