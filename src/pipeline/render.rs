//! PDF rendering: the rendering-service seam, its PDFium implementation, and
//! the lazily-initialised library handles shared by every rasterisation.
//!
//! ## Why a trait?
//!
//! The rasteriser only needs "open from bytes", "page count" and "render
//! page N at scale S". Keeping that behind [`RenderService`] lets tests drive
//! the whole pipeline with an in-memory fake, and keeps PDFium's binding
//! and lifetime rules out of the coordinator.
//!
//! ## Why spawn_blocking?
//!
//! PDFium is a C++ library doing CPU-heavy work. Binding it and rendering
//! pages happen on the blocking pool so Tokio worker threads never stall.

use crate::error::SanitizeError;
use crate::pipeline::assemble::{LopdfAuthor, PdfAuthor};
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Opens documents from raw bytes.
pub trait RenderService: Send + Sync {
    fn open<'a>(&'a self, bytes: &'a [u8]) -> Result<Box<dyn RenderedDocument + 'a>, SanitizeError>;
}

/// An opened document.
pub trait RenderedDocument {
    fn page_count(&self) -> usize;

    /// Render 1-indexed `page` at `scale` × its size in points.
    fn render_page(&self, page: usize, scale: f32) -> Result<DynamicImage, SanitizeError>;
}

// ── PDFium implementation ────────────────────────────────────────────────

/// Rendering service backed by a bound PDFium library.
pub struct PdfiumRenderService {
    pdfium: Pdfium,
}

impl PdfiumRenderService {
    /// Locate PDFium (worker path first) and bind to it. Blocking.
    pub fn bind(worker_path: &str) -> Result<Self, SanitizeError> {
        let load_err = |detail: String| SanitizeError::LibraryLoad {
            service: "rendering".into(),
            detail,
        };

        let found = pdfium_locator::locate(Some(Path::new(worker_path)), None)
            .map_err(|e| load_err(e.to_string()))?;
        info!(
            path = %found.path.display(),
            source = ?found.source,
            "Binding PDFium"
        );
        let pdfium = pdfium_locator::bind_from_path(&found.path).map_err(|e| load_err(e.to_string()))?;
        Ok(Self { pdfium })
    }

    pub fn from_pdfium(pdfium: Pdfium) -> Self {
        Self { pdfium }
    }
}

impl RenderService for PdfiumRenderService {
    fn open<'a>(&'a self, bytes: &'a [u8]) -> Result<Box<dyn RenderedDocument + 'a>, SanitizeError> {
        let document = self
            .pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| SanitizeError::CorruptPdf {
                name: String::new(),
                detail: format!("{:?}", e),
            })?;
        Ok(Box::new(PdfiumDocument { document }))
    }
}

struct PdfiumDocument<'a> {
    document: PdfDocument<'a>,
}

impl RenderedDocument for PdfiumDocument<'_> {
    fn page_count(&self) -> usize {
        self.document.pages().len() as usize
    }

    fn render_page(&self, page_num: usize, scale: f32) -> Result<DynamicImage, SanitizeError> {
        let fail = |detail: String| SanitizeError::RasterisationFailed {
            page: page_num,
            detail,
        };

        let pages = self.document.pages();
        let page = pages
            .get((page_num - 1) as u16)
            .map_err(|e| fail(format!("{:?}", e)))?;

        // Viewport: page size in points × scale, in whole pixels.
        let width = (page.width().value * scale).round().max(1.0) as i32;
        let height = (page.height().value * scale).round().max(1.0) as i32;

        let render_config = PdfRenderConfig::new()
            .set_target_width(width)
            .set_maximum_height(height);

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| fail(format!("{:?}", e)))?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            page_num,
            image.width(),
            image.height()
        );
        Ok(image)
    }
}

// ── Lazy library handles ─────────────────────────────────────────────────

/// A service created at most once and then shared.
///
/// Initialisation runs under the slot's lock, so concurrent first callers
/// wait for one load instead of starting several. A failed load leaves the
/// slot empty and the next caller retries.
pub struct LazyService<T: ?Sized> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized> Default for LazyService<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T: ?Sized> LazyService<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A slot that starts out filled.
    pub fn ready(service: Arc<T>) -> Self {
        Self {
            slot: Mutex::new(Some(service)),
        }
    }

    pub async fn get_or_init<F, Fut>(&self, init: F) -> Result<Arc<T>, SanitizeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<T>, SanitizeError>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(service) = slot.as_ref() {
            return Ok(Arc::clone(service));
        }
        let service = init().await?;
        *slot = Some(Arc::clone(&service));
        Ok(service)
    }

    pub async fn is_loaded(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Drop the memoised service so the next call loads it again.
    pub async fn invalidate(&self) {
        self.slot.lock().await.take();
    }
}

/// Creates the rendering service for a worker path. Blocking.
pub type RenderLoader =
    Arc<dyn Fn(&str) -> Result<Arc<dyn RenderService>, SanitizeError> + Send + Sync>;

/// Creates the authoring service. Blocking.
pub type AuthorLoader = Arc<dyn Fn() -> Result<Arc<dyn PdfAuthor>, SanitizeError> + Send + Sync>;

/// The two library singletons a rasteriser needs.
pub struct LibraryHandles {
    render_loader: RenderLoader,
    author_loader: AuthorLoader,
    renderer: LazyService<dyn RenderService>,
    author: LazyService<dyn PdfAuthor>,
}

impl Default for LibraryHandles {
    fn default() -> Self {
        Self::new()
    }
}

impl LibraryHandles {
    /// PDFium for rendering, lopdf for authoring.
    pub fn new() -> Self {
        Self::with_loaders(
            Arc::new(|worker_path: &str| -> Result<Arc<dyn RenderService>, SanitizeError> {
                let service = PdfiumRenderService::bind(worker_path)?;
                Ok(Arc::new(service) as Arc<dyn RenderService>)
            }),
            Arc::new(|| Ok::<_, SanitizeError>(Arc::new(LopdfAuthor) as Arc<dyn PdfAuthor>)),
        )
    }

    pub fn with_loaders(render_loader: RenderLoader, author_loader: AuthorLoader) -> Self {
        Self {
            render_loader,
            author_loader,
            renderer: LazyService::new(),
            author: LazyService::new(),
        }
    }

    /// Handles pre-filled with ready services.
    pub fn with_services(renderer: Arc<dyn RenderService>, author: Arc<dyn PdfAuthor>) -> Self {
        let r = Arc::clone(&renderer);
        let a = Arc::clone(&author);
        Self {
            render_loader: Arc::new(move |_: &str| Ok::<_, SanitizeError>(Arc::clone(&r))),
            author_loader: Arc::new(move || Ok::<_, SanitizeError>(Arc::clone(&a))),
            renderer: LazyService::ready(renderer),
            author: LazyService::ready(author),
        }
    }

    pub async fn renderer(&self, worker_path: &str) -> Result<Arc<dyn RenderService>, SanitizeError> {
        self.renderer
            .get_or_init(|| {
                let loader = Arc::clone(&self.render_loader);
                let path = worker_path.to_string();
                async move {
                    match tokio::task::spawn_blocking(move || loader(&path)).await {
                        Ok(loaded) => loaded,
                        Err(e) => Err(SanitizeError::Internal(format!("Library load task panicked: {}", e))),
                    }
                }
            })
            .await
    }

    pub async fn author(&self) -> Result<Arc<dyn PdfAuthor>, SanitizeError> {
        self.author
            .get_or_init(|| {
                let loader = Arc::clone(&self.author_loader);
                async move {
                    match tokio::task::spawn_blocking(move || loader()).await {
                        Ok(loaded) => loaded,
                        Err(e) => Err(SanitizeError::Internal(format!("Library load task panicked: {}", e))),
                    }
                }
            })
            .await
    }

    /// Forget both services; the next call reloads them.
    pub async fn invalidate(&self) {
        self.renderer.invalidate().await;
        self.author.invalidate().await;
    }

    pub async fn is_loaded(&self) -> bool {
        self.renderer.is_loaded().await && self.author.is_loaded().await
    }
}
