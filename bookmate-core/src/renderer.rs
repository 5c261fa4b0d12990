use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tracing::{debug, info, instrument, warn};

use crate::config::DEFAULT_RENDER_SCALE;
use crate::error::{ReaderError, Result};
use crate::navigation::build_markers;
use crate::{
    ChapterMarker, DocumentBackend, DocumentId, DocumentProvider, DocumentSource, ReaderConfig,
    RenderImage, RenderRequest, Surface,
};

/// A document opened for reading, with its outline resolved into markers.
pub struct LoadedDocument {
    pub id: DocumentId,
    pub source: DocumentSource,
    pub page_count: usize,
    pub markers: Vec<ChapterMarker>,
    backend: Arc<dyn DocumentBackend>,
}

impl LoadedDocument {
    pub fn contains(&self, page: usize) -> bool {
        (1..=self.page_count).contains(&page)
    }
}

impl std::fmt::Debug for LoadedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedDocument")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("page_count", &self.page_count)
            .field("markers", &self.markers.len())
            .finish()
    }
}

/// Puts the rendering engine and the display surface behind one interface.
pub struct RendererAdapter {
    provider: Arc<dyn DocumentProvider>,
    surface: Box<dyn Surface>,
    scale: f32,
    timeout: Option<Duration>,
}

impl RendererAdapter {
    pub fn new(provider: Arc<dyn DocumentProvider>, surface: Box<dyn Surface>) -> Self {
        Self {
            provider,
            surface,
            scale: DEFAULT_RENDER_SCALE,
            timeout: None,
        }
    }

    pub fn with_config(mut self, config: &ReaderConfig) -> Self {
        self.scale = config.render_scale;
        self.timeout = config.render_timeout;
        self
    }

    #[instrument(skip(self, source), fields(source = %source))]
    pub async fn load(&self, id: DocumentId, source: DocumentSource) -> Result<LoadedDocument> {
        let load_error = |cause: anyhow::Error| ReaderError::Load {
            target: source.to_string(),
            cause,
        };

        let backend = self.provider.open(&source).await.map_err(load_error)?;
        let page_count = backend.page_count();
        if page_count == 0 {
            return Err(load_error(anyhow!("document has no pages")));
        }

        let outline = match backend.outline().await {
            Ok(outline) => outline,
            Err(err) => {
                warn!(?err, "failed to read document outline");
                Vec::new()
            }
        };

        let mut resolved = Vec::with_capacity(outline.len());
        for (idx, entry) in outline.into_iter().enumerate() {
            let Some(destination) = entry.destination else {
                continue;
            };
            let label = entry
                .title
                .map(|title| title.trim().to_owned())
                .filter(|title| !title.is_empty())
                .unwrap_or_else(|| format!("Chapter {}", idx + 1));
            match backend.page_index(&destination).await {
                Ok(page_index) if page_index < page_count => {
                    resolved.push((page_index + 1, label));
                }
                Ok(page_index) => {
                    warn!(page_index, %label, "outline entry points past the last page");
                }
                Err(err) => {
                    warn!(?err, %label, "failed to resolve outline destination");
                }
            }
        }
        let markers = build_markers(resolved);

        info!(%id, page_count, chapters = markers.len(), "document loaded");
        Ok(LoadedDocument {
            id,
            source,
            page_count,
            markers,
            backend,
        })
    }

    /// Renders `page` (1-based) and updates the page indicator.
    pub async fn render_page(&mut self, document: &LoadedDocument, page: usize) -> Result<()> {
        let image = self.rasterize(document, page).await?;
        self.present(document, page, &image)
    }

    /// Produces the pixels for `page` (1-based) without touching the surface.
    #[instrument(skip(self, document), fields(id = %document.id))]
    pub async fn rasterize(
        &mut self,
        document: &LoadedDocument,
        page: usize,
    ) -> Result<RenderImage> {
        if !document.contains(page) {
            return Err(ReaderError::Render {
                page,
                cause: anyhow!("page {} out of range 1..={}", page, document.page_count),
            });
        }

        let request = RenderRequest {
            page_index: page - 1,
            scale: self.scale,
        };
        let render = document.backend.render_page(request);
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, render).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("render timed out after {:?}", limit)),
            },
            None => render.await,
        }
        .map_err(|cause| ReaderError::Render { page, cause })
    }

    /// Draws a rasterized page and updates the page indicator.
    pub fn present(
        &mut self,
        document: &LoadedDocument,
        page: usize,
        image: &RenderImage,
    ) -> Result<()> {
        self.surface
            .draw_page(image)
            .and_then(|_| self.surface.show_page_indicator(page, document.page_count))
            .map_err(|cause| ReaderError::Render { page, cause })?;
        debug!(page, width = image.width, height = image.height, "page drawn");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Destination, OutlineEntry};

    use parking_lot::Mutex;

    struct OutlinedBackend {
        pages: usize,
        outline: Vec<OutlineEntry>,
        targets: Vec<anyhow::Result<usize>>,
        delay: Option<Duration>,
    }

    #[async_trait::async_trait]
    impl DocumentBackend for OutlinedBackend {
        fn page_count(&self) -> usize {
            self.pages
        }

        async fn outline(&self) -> anyhow::Result<Vec<OutlineEntry>> {
            Ok(self.outline.clone())
        }

        async fn page_index(&self, destination: &Destination) -> anyhow::Result<usize> {
            match &self.targets[destination.0 as usize] {
                Ok(index) => Ok(*index),
                Err(err) => Err(anyhow!("{err}")),
            }
        }

        async fn render_page(&self, request: RenderRequest) -> anyhow::Result<RenderImage> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(RenderImage {
                width: 2,
                height: 3,
                pixels: vec![request.page_index as u8; 24],
            })
        }
    }

    struct StaticProvider(Arc<OutlinedBackend>);

    #[async_trait::async_trait]
    impl DocumentProvider for StaticProvider {
        async fn open(&self, _source: &DocumentSource) -> anyhow::Result<Arc<dyn DocumentBackend>> {
            Ok(self.0.clone())
        }
    }

    struct FailingProvider;

    #[async_trait::async_trait]
    impl DocumentProvider for FailingProvider {
        async fn open(&self, _source: &DocumentSource) -> anyhow::Result<Arc<dyn DocumentBackend>> {
            Err(anyhow!("connection refused"))
        }
    }

    #[derive(Clone, Default)]
    struct LogSurface(Arc<Mutex<Vec<String>>>);

    impl Surface for LogSurface {
        fn draw_page(&mut self, image: &RenderImage) -> anyhow::Result<()> {
            self.0.lock().push(format!("draw {}", image.pixels[0]));
            Ok(())
        }

        fn show_page_indicator(&mut self, page: usize, total: usize) -> anyhow::Result<()> {
            self.0.lock().push(crate::page_indicator(page, total));
            Ok(())
        }
    }

    fn entry(title: Option<&str>, destination: Option<u64>) -> OutlineEntry {
        OutlineEntry {
            title: title.map(str::to_owned),
            destination: destination.map(Destination),
        }
    }

    fn backend(delay: Option<Duration>) -> Arc<OutlinedBackend> {
        Arc::new(OutlinedBackend {
            pages: 30,
            outline: vec![
                entry(Some("Epilogue"), Some(0)),
                entry(None, Some(1)),
                entry(Some("Dedication"), None),
                entry(Some("Appendix"), Some(2)),
                entry(Some("  "), Some(3)),
                entry(Some("Ghost"), Some(4)),
            ],
            targets: vec![
                Ok(27),
                Ok(0),
                Ok(99),
                Ok(11),
                Err(anyhow!("dangling reference")),
            ],
            delay,
        })
    }

    fn source() -> DocumentSource {
        DocumentSource::Url("https://bookmate.example/book.pdf".into())
    }

    #[tokio::test]
    async fn load_resolves_outline_before_exposing_markers() {
        let adapter = RendererAdapter::new(
            Arc::new(StaticProvider(backend(None))),
            Box::new(LogSurface::default()),
        );
        let doc = adapter.load(DocumentId::new("b"), source()).await.unwrap();

        assert_eq!(doc.page_count, 30);
        let summary: Vec<_> = doc
            .markers
            .iter()
            .map(|m| (m.start_page, m.label.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![(1, "Chapter 2"), (12, "Chapter 5"), (28, "Epilogue")]
        );
    }

    #[tokio::test]
    async fn load_failure_is_reported_as_load_error() {
        let adapter = RendererAdapter::new(Arc::new(FailingProvider), Box::new(LogSurface::default()));
        let err = adapter
            .load(DocumentId::new("b"), source())
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Load { .. }));
    }

    #[tokio::test]
    async fn render_page_draws_and_updates_indicator() {
        let surface = LogSurface::default();
        let mut adapter = RendererAdapter::new(
            Arc::new(StaticProvider(backend(None))),
            Box::new(surface.clone()),
        );
        let doc = adapter.load(DocumentId::new("b"), source()).await.unwrap();

        adapter.render_page(&doc, 4).await.unwrap();
        assert_eq!(*surface.0.lock(), vec!["draw 3", "Page 4 / 30"]);

        let err = adapter.render_page(&doc, 31).await.unwrap_err();
        assert!(matches!(err, ReaderError::Render { page: 31, .. }));
        assert_eq!(surface.0.lock().len(), 2);
    }

    #[tokio::test]
    async fn render_page_honors_timeout() {
        let config = ReaderConfig {
            render_timeout: Some(Duration::from_millis(50)),
            ..ReaderConfig::default()
        };
        let mut adapter = RendererAdapter::new(
            Arc::new(StaticProvider(backend(Some(Duration::from_secs(5))))),
            Box::new(LogSurface::default()),
        )
        .with_config(&config);
        let doc = adapter.load(DocumentId::new("b"), source()).await.unwrap();

        let err = adapter.render_page(&doc, 1).await.unwrap_err();
        assert!(matches!(err, ReaderError::Render { page: 1, .. }));
    }

    #[tokio::test]
    async fn rasterize_leaves_surface_untouched() {
        let surface = LogSurface::default();
        let mut adapter = RendererAdapter::new(
            Arc::new(StaticProvider(backend(None))),
            Box::new(surface.clone()),
        );
        let doc = adapter.load(DocumentId::new("b"), source()).await.unwrap();

        let image = adapter.rasterize(&doc, 7).await.unwrap();
        assert_eq!(image.pixels[0], 6);
        assert!(surface.0.lock().is_empty());

        adapter.present(&doc, 7, &image).unwrap();
        assert_eq!(*surface.0.lock(), vec!["draw 6", "Page 7 / 30"]);
    }
}
