//! The rasterisation entry sequence: guards, library handles, page loop.
//!
//! [`Rasterizer::rasterize`] is fail-open: whatever goes wrong, the caller
//! gets a file back, either the rebuilt one or the original untouched.
//! [`Rasterizer::try_rasterize`] is the same sequence with the outcome
//! spelled out, for callers (and tests) that care why.

use crate::config::SanitizerConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{GuardRejection, SanitizeError};
use crate::file::{CandidateFile, PDF_MEDIA_TYPE};
use crate::guard;
use crate::pipeline::assemble::PdfAuthor;
use crate::pipeline::encode::encode_jpeg;
use crate::pipeline::render::{LibraryHandles, RenderService};
use crate::progress::{PageProgress, PageProgressFn};
use std::sync::Arc;
use tracing::{debug, info};

/// What a rasterisation attempt produced.
#[derive(Debug)]
pub enum RasterOutcome {
    /// A freshly authored document.
    Sanitized(CandidateFile),
    /// A guard declined; the original should be used.
    Skipped(GuardRejection),
}

/// Drives rendering, encoding and authoring for one file at a time.
pub struct Rasterizer {
    handles: Arc<LibraryHandles>,
}

impl Default for Rasterizer {
    fn default() -> Self {
        Self::new(Arc::new(LibraryHandles::new()))
    }
}

impl Rasterizer {
    pub fn new(handles: Arc<LibraryHandles>) -> Self {
        Self { handles }
    }

    pub fn handles(&self) -> &Arc<LibraryHandles> {
        &self.handles
    }

    /// Rasterise `file`, returning the original on any skip or failure.
    pub async fn rasterize(
        &self,
        file: &CandidateFile,
        config: &SanitizerConfig,
        on_progress: Option<PageProgressFn>,
    ) -> CandidateFile {
        let diag = Diagnostics::for_config(config);
        match self.try_rasterize(file, config, on_progress).await {
            Ok(RasterOutcome::Sanitized(out)) => out,
            Ok(RasterOutcome::Skipped(reason)) => {
                diag.warn(file.name(), &reason.to_string());
                file.clone()
            }
            Err(e) => {
                diag.error(file.name(), "PDF sanitization failed; using original file", &e);
                if implicates_library(&e) {
                    debug!(error = %e, "Dropping library handles; next file reloads them");
                    self.handles.invalidate().await;
                }
                file.clone()
            }
        }
    }

    /// Rasterise `file`, reporting skips and failures.
    pub async fn try_rasterize(
        &self,
        file: &CandidateFile,
        config: &SanitizerConfig,
        on_progress: Option<PageProgressFn>,
    ) -> Result<RasterOutcome, SanitizeError> {
        // ── Step 1: cheap guards, before any library is touched ──────────
        if !guard::is_pdf(file) {
            return Ok(RasterOutcome::Skipped(GuardRejection::NotPdf));
        }
        if let Err(reason) = guard::check_size(file, config) {
            return Ok(RasterOutcome::Skipped(reason));
        }

        // ── Step 2: library handles ──────────────────────────────────────
        let renderer = self.handles.renderer(&config.worker_path).await?;
        let author = self.handles.author().await?;

        // ── Step 3: open, page guard, page loop, save ────────────────────
        let source = file.clone();
        let cfg = config.clone();
        tokio::task::spawn_blocking(move || {
            rasterize_blocking(renderer.as_ref(), author.as_ref(), &source, &cfg, on_progress.as_ref())
        })
        .await
        .map_err(|e| SanitizeError::Internal(format!("Rasterisation task panicked: {}", e)))?
    }

    /// Load both library handles ahead of the first real file.
    pub async fn preload(&self, config: &SanitizerConfig) -> Result<(), SanitizeError> {
        self.handles.renderer(&config.worker_path).await?;
        self.handles.author().await?;
        Ok(())
    }
}

/// Failures that may have left the libraries unusable. A corrupt input or
/// an encoder error says nothing about the loaded services.
fn implicates_library(e: &SanitizeError) -> bool {
    matches!(
        e,
        SanitizeError::LibraryLoad { .. }
            | SanitizeError::RasterisationFailed { .. }
            | SanitizeError::AuthoringFailed(_)
            | SanitizeError::Internal(_)
    )
}

/// Blocking body of the page loop.
fn rasterize_blocking(
    renderer: &dyn RenderService,
    author: &dyn PdfAuthor,
    file: &CandidateFile,
    config: &SanitizerConfig,
    on_progress: Option<&PageProgressFn>,
) -> Result<RasterOutcome, SanitizeError> {
    let document = renderer.open(file.bytes()).map_err(|e| match e {
        SanitizeError::CorruptPdf { detail, .. } => SanitizeError::CorruptPdf {
            name: file.name().to_string(),
            detail,
        },
        other => other,
    })?;

    let total = document.page_count();
    if total == 0 {
        return Err(SanitizeError::CorruptPdf {
            name: file.name().to_string(),
            detail: "document has no pages".into(),
        });
    }
    if let Err(reason) = guard::check_pages(total, config) {
        return Ok(RasterOutcome::Skipped(reason));
    }
    info!(file = file.name(), pages = total, "PDF loaded");

    let mut output = author.create();
    for page in 1..=total {
        let image = document.render_page(page, config.scale)?;

        if let Some(cb) = on_progress {
            cb(&PageProgress::new(page, total));
        }

        let encoded = encode_jpeg(&image, config.quality).map_err(|e| SanitizeError::EncodeFailed {
            page,
            detail: e.to_string(),
        })?;
        output.add_page(&encoded)?;
    }

    let bytes = output.save()?;
    debug!(
        file = file.name(),
        before = file.size(),
        after = bytes.len(),
        "Authored sanitised PDF"
    );
    Ok(RasterOutcome::Sanitized(CandidateFile::new(
        file.name(),
        PDF_MEDIA_TYPE,
        bytes,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::assemble::LopdfAuthor;
    use crate::pipeline::render::RenderedDocument;
    use image::{DynamicImage, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Pages are read from the byte length: one page per byte after `%PDF`.
    struct BytePages;

    struct BytePagesDoc(usize);

    impl RenderService for BytePages {
        fn open<'a>(&'a self, bytes: &'a [u8]) -> Result<Box<dyn RenderedDocument + 'a>, SanitizeError> {
            if !bytes.starts_with(b"%PDF") {
                return Err(SanitizeError::CorruptPdf {
                    name: String::new(),
                    detail: "missing header".into(),
                });
            }
            Ok(Box::new(BytePagesDoc(bytes.len() - 4)))
        }
    }

    impl RenderedDocument for BytePagesDoc {
        fn page_count(&self) -> usize {
            self.0
        }

        fn render_page(&self, _page: usize, scale: f32) -> Result<DynamicImage, SanitizeError> {
            let side = (10.0 * scale) as u32;
            Ok(DynamicImage::ImageRgb8(RgbImage::new(side, side)))
        }
    }

    fn counting_handles(loads: Arc<AtomicUsize>) -> Arc<LibraryHandles> {
        Arc::new(LibraryHandles::with_loaders(
            Arc::new(move |_: &str| -> Result<Arc<dyn RenderService>, SanitizeError> {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(BytePages))
            }),
            Arc::new(|| -> Result<Arc<dyn PdfAuthor>, SanitizeError> { Ok(Arc::new(LopdfAuthor)) }),
        ))
    }

    #[tokio::test]
    async fn test_guards_run_before_libraries_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let r = Rasterizer::new(counting_handles(Arc::clone(&loads)));
        let cfg = SanitizerConfig::builder().max_file_size_bytes(5).build().unwrap();

        let txt = CandidateFile::new("a.txt", "text/plain", b"hello".to_vec());
        assert!(matches!(
            r.try_rasterize(&txt, &cfg, None).await,
            Ok(RasterOutcome::Skipped(GuardRejection::NotPdf))
        ));

        let big = CandidateFile::new("big.pdf", PDF_MEDIA_TYPE, b"%PDF-xx".to_vec());
        assert!(matches!(
            r.try_rasterize(&big, &cfg, None).await,
            Ok(RasterOutcome::Skipped(GuardRejection::FileTooLarge { .. }))
        ));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_pages_is_corrupt_and_fails_open() {
        let r = Rasterizer::new(counting_handles(Arc::new(AtomicUsize::new(0))));
        let empty = CandidateFile::new("empty.pdf", PDF_MEDIA_TYPE, b"%PDF".to_vec());
        let cfg = SanitizerConfig::default();

        assert!(matches!(
            r.try_rasterize(&empty, &cfg, None).await,
            Err(SanitizeError::CorruptPdf { .. })
        ));
        assert!(r.rasterize(&empty, &cfg, None).await.same_blob(&empty));
    }

    #[tokio::test]
    async fn test_output_keeps_name_and_forces_pdf_type() {
        let r = Rasterizer::new(counting_handles(Arc::new(AtomicUsize::new(0))));
        let src = CandidateFile::new("Scan.PDF", "", b"%PDF12".to_vec());
        let out = r.rasterize(&src, &SanitizerConfig::default(), None).await;

        assert!(!out.same_blob(&src));
        assert_eq!(out.name(), "Scan.PDF");
        assert_eq!(out.media_type(), PDF_MEDIA_TYPE);
        assert!(out.last_modified() >= src.last_modified());
        let doc = lopdf::Document::load_mem(out.bytes()).unwrap();
        assert_eq!(doc.get_pages().len(), 2);
    }

    /// Opens fine, fails on every page.
    struct BrokenPages;

    struct BrokenPagesDoc;

    impl RenderService for BrokenPages {
        fn open<'a>(&'a self, _bytes: &'a [u8]) -> Result<Box<dyn RenderedDocument + 'a>, SanitizeError> {
            Ok(Box::new(BrokenPagesDoc))
        }
    }

    impl RenderedDocument for BrokenPagesDoc {
        fn page_count(&self) -> usize {
            1
        }

        fn render_page(&self, page: usize, _scale: f32) -> Result<DynamicImage, SanitizeError> {
            Err(SanitizeError::RasterisationFailed {
                page,
                detail: "device lost".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_render_failure_reloads_libraries_next_time() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&loads);
        let r = Rasterizer::new(Arc::new(LibraryHandles::with_loaders(
            Arc::new(move |_: &str| -> Result<Arc<dyn RenderService>, SanitizeError> {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(BrokenPages))
            }),
            Arc::new(|| -> Result<Arc<dyn PdfAuthor>, SanitizeError> { Ok(Arc::new(LopdfAuthor)) }),
        )));
        let cfg = SanitizerConfig::builder().log_errors(false).build().unwrap();
        let src = CandidateFile::new("a.pdf", PDF_MEDIA_TYPE, b"%PDF1".to_vec());

        assert!(r.rasterize(&src, &cfg, None).await.same_blob(&src));
        assert!(!r.handles().is_loaded().await);
        r.rasterize(&src, &cfg, None).await;
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_corrupt_input_keeps_libraries_loaded() {
        let loads = Arc::new(AtomicUsize::new(0));
        let r = Rasterizer::new(counting_handles(Arc::clone(&loads)));
        let cfg = SanitizerConfig::builder().log_errors(false).build().unwrap();
        let bad = CandidateFile::new("bad.pdf", PDF_MEDIA_TYPE, b"garbage".to_vec());

        r.rasterize(&bad, &cfg, None).await;
        r.rasterize(&bad, &cfg, None).await;
        assert!(r.handles().is_loaded().await);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_preload_warms_both_handles() {
        let loads = Arc::new(AtomicUsize::new(0));
        let r = Rasterizer::new(counting_handles(Arc::clone(&loads)));
        r.preload(&SanitizerConfig::default()).await.unwrap();
        assert!(r.handles().is_loaded().await);
        r.preload(&SanitizerConfig::default()).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
