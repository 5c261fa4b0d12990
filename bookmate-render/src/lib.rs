use std::convert::TryFrom;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bookmate_core::{
    Destination, DocumentBackend, DocumentProvider, DocumentSource, OutlineEntry, RenderImage,
    RenderRequest,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{debug, instrument, warn};

mod source;

pub use source::{HttpSourceResolver, DEFAULT_HTTP_TIMEOUT};

pub struct PdfiumRenderFactory {
    pdfium: Arc<Pdfium>,
    http: ureq::Agent,
}

impl PdfiumRenderFactory {
    /// Binds to pdfium at `library_path`, falling back to the working
    /// directory and then the system library.
    pub fn new(library_path: Option<&Path>) -> Result<Self> {
        let pdfium = match library_path.and_then(bind_pdfium_at) {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
            http: source::http_agent(DEFAULT_HTTP_TIMEOUT),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumRenderFactory {
    #[instrument(skip(self))]
    async fn open(&self, source: &DocumentSource) -> Result<Arc<dyn DocumentBackend>> {
        let origin = match source {
            DocumentSource::Path(path) => {
                let absolute = path
                    .canonicalize()
                    .with_context(|| format!("failed to resolve path for {:?}", path))?;
                Origin::File(absolute)
            }
            DocumentSource::Url(url) => {
                let bytes = source::download(self.http.clone(), url.clone()).await?;
                Origin::Bytes(bytes)
            }
        };

        let pdfium = Arc::clone(&self.pdfium);
        let document = tokio::task::spawn_blocking(move || PdfiumDocument::open(pdfium, origin))
            .await
            .context("pdfium worker panicked")??;
        Ok(Arc::new(SharedDocument(Arc::new(document))))
    }
}

enum Origin {
    File(PathBuf),
    Bytes(Vec<u8>),
}

struct OutlineTable {
    entries: Vec<OutlineEntry>,
    targets: Vec<usize>,
}

struct PdfiumDocument {
    // Declared before `pdfium` so it is dropped first.
    document: Mutex<PdfDocument<'static>>,
    outline: Mutex<Option<Arc<OutlineTable>>>,
    page_count: usize,
    pdfium: Arc<Pdfium>,
}

impl PdfiumDocument {
    fn open(pdfium: Arc<Pdfium>, origin: Origin) -> Result<Self> {
        let document = match origin {
            Origin::File(path) => pdfium
                .load_pdf_from_file(&path, None)
                .with_context(|| format!("failed to open {:?}", path))?,
            Origin::Bytes(bytes) => pdfium
                .load_pdf_from_byte_vec(bytes, None)
                .context("failed to parse downloaded document")?,
        };
        // SAFETY: the document borrows the bindings owned by `pdfium`. Both live in
        // this struct and `document` is dropped first, so the borrow never dangles.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
        debug!(page_count, "pdfium document opened");
        Ok(Self {
            document: Mutex::new(document),
            outline: Mutex::new(None),
            page_count,
            pdfium,
        })
    }

    fn outline_table(&self) -> Arc<OutlineTable> {
        let mut cache = self.outline.lock();
        if let Some(table) = cache.as_ref() {
            return Arc::clone(table);
        }

        let mut table = OutlineTable {
            entries: Vec::new(),
            targets: Vec::new(),
        };
        {
            let document = self.document.lock();
            if let Some(root) = document.bookmarks().root() {
                collect_chapters(root, &mut table);
            }
        }
        let table = Arc::new(table);
        *cache = Some(Arc::clone(&table));
        table
    }

    fn render(&self, request: &RenderRequest) -> Result<RenderImage> {
        let document = self.document.lock();
        let page_index: PdfPageIndex = request
            .page_index
            .try_into()
            .map_err(|_| anyhow!("page {} is out of supported range", request.page_index))?;
        let page = document
            .pages()
            .get(page_index)
            .with_context(|| format!("page {} out of range", request.page_index))?;

        let config = PdfRenderConfig::new().scale_page_by_factor(request.scale.max(0.1));
        let bitmap = page
            .render_with_config(&config)
            .with_context(|| format!("failed to render page {}", request.page_index))?;
        let image = bitmap.as_image().to_rgba8();

        Ok(RenderImage {
            width: u32::try_from(bitmap.width()).unwrap_or_default(),
            height: u32::try_from(bitmap.height()).unwrap_or_default(),
            pixels: image.into_raw(),
        })
    }
}

/// Top-level bookmarks only; nested entries are sections, not chapters.
fn collect_chapters(mut bookmark: PdfBookmark<'_>, table: &mut OutlineTable) {
    loop {
        let destination = bookmark
            .destination()
            .and_then(|destination| destination.page_index().ok())
            .map(|page_index| {
                table.targets.push(page_index as usize);
                Destination((table.targets.len() - 1) as u64)
            });
        table.entries.push(OutlineEntry {
            title: bookmark.title(),
            destination,
        });

        match bookmark.next_sibling() {
            Some(next) => bookmark = next,
            None => break,
        }
    }
}

struct SharedDocument(Arc<PdfiumDocument>);

#[async_trait]
impl DocumentBackend for SharedDocument {
    fn page_count(&self) -> usize {
        self.0.page_count
    }

    async fn outline(&self) -> Result<Vec<OutlineEntry>> {
        let document = Arc::clone(&self.0);
        let table = tokio::task::spawn_blocking(move || document.outline_table())
            .await
            .context("pdfium worker panicked")?;
        Ok(table.entries.clone())
    }

    async fn page_index(&self, destination: &Destination) -> Result<usize> {
        let document = Arc::clone(&self.0);
        let table = tokio::task::spawn_blocking(move || document.outline_table())
            .await
            .context("pdfium worker panicked")?;
        usize::try_from(destination.0)
            .ok()
            .and_then(|idx| table.targets.get(idx).copied())
            .ok_or_else(|| anyhow!("unknown outline destination {}", destination.0))
    }

    #[instrument(skip(self))]
    async fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        let document = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || document.render(&request))
            .await
            .context("pdfium worker panicked")?
    }
}

fn bind_pdfium_at(path: &Path) -> Option<Pdfium> {
    match Pdfium::bind_to_library(path) {
        Ok(bindings) => Some(Pdfium::new(bindings)),
        Err(err) => {
            warn!(
                "failed to load Pdfium from configured path {}: {}",
                path.display(),
                err
            );
            None
        }
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");

    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; ensure it is installed ({})",
                errors.join(", ")
            ))
        }
    }
}
