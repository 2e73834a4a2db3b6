//! The sanitisation coordinator.
//!
//! One [`Sanitizer`] is built at start-up and shared as `Arc<Sanitizer>` by
//! the observation layer, the upload interceptor and the CLI. It owns every
//! piece of cross-call state:
//!
//! * the **cache** of results, keyed by blob identity and dropped once the
//!   original blob is gone;
//! * the **in-flight set**, so two callers holding the same blob never start
//!   two rasterisations. Late callers poll every 100 ms until the result is
//!   cached. The pass runs as its own task and holds the claim until it
//!   ends, even when the caller that started it stops waiting;
//! * the set of blobs this coordinator **produced**, so a rebuilt file handed
//!   back in is passed through instead of being rasterised again.
//!
//! ```text
//!   Unseen ──(first caller)──▶ In-flight ──(result stored)──▶ Cached
//!                                  ▲
//!              (concurrent caller) └── polls until Cached
//! ```
//!
//! Every path returns a file. Failures are absorbed by the rasteriser and
//! logged; the caller just gets the original back.

use crate::config::{SanitizerConfig, SettingsSource, MARKER_ATTRIBUTE};
use crate::diagnostics::Diagnostics;
use crate::dom::{Dom, ElementId};
use crate::file::{CandidateFile, FileId, WeakFile};
use crate::guard;
use crate::overlay::OverlayPresenter;
use crate::pipeline::rasterize::Rasterizer;
use crate::pipeline::render::LibraryHandles;
use crate::progress::{PageProgress, PageProgressFn, ProgressHandle, ProgressPresenter};
use futures::future::join_all;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::debug;

/// How often a concurrent caller re-checks the cache.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Message shown when the overlay first appears.
pub const INITIAL_MESSAGE: &str = "Sanitizing PDF...";

enum Stored {
    Rebuilt(CandidateFile),
    /// Guard skip or failure; the original is the answer.
    Unchanged,
}

struct CacheEntry {
    original: WeakFile,
    result: Stored,
}

#[derive(Default)]
struct State {
    cache: HashMap<FileId, CacheEntry>,
    produced: HashMap<FileId, WeakFile>,
    in_flight: HashSet<FileId>,
}

impl State {
    fn prune(&mut self) {
        self.cache.retain(|_, e| e.original.is_alive());
        self.produced.retain(|_, w| w.is_alive());
    }

    fn lookup(&self, file: &CandidateFile) -> Option<CandidateFile> {
        let entry = self.cache.get(&file.id())?;
        // The weak handle pins the allocation, so a live entry is this blob.
        match &entry.result {
            Stored::Rebuilt(out) => Some(out.clone()),
            Stored::Unchanged => Some(file.clone()),
        }
    }
}

enum Claim {
    Cached(CandidateFile),
    Owner,
    Wait,
}

/// Shared sanitisation coordinator.
pub struct Sanitizer {
    dom: Dom,
    settings: SettingsSource,
    rasterizer: Rasterizer,
    presenter: Arc<dyn ProgressPresenter>,
    state: Mutex<State>,
    this: Weak<Sanitizer>,
}

impl std::fmt::Debug for Sanitizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Sanitizer")
            .field("cached", &state.cache.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

impl Sanitizer {
    pub fn builder() -> SanitizerBuilder {
        SanitizerBuilder::default()
    }

    pub fn dom(&self) -> &Dom {
        &self.dom
    }

    pub fn settings(&self) -> &SettingsSource {
        &self.settings
    }

    pub fn rasterizer(&self) -> &Rasterizer {
        &self.rasterizer
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` when `input` carries `data-pdf-sanitize="true"`.
    pub fn is_marked(&self, input: ElementId) -> bool {
        self.dom.attribute(input, MARKER_ATTRIBUTE).as_deref() == Some("true")
    }

    /// Cached result for `file`, if one exists.
    pub fn cached(&self, file: &CandidateFile) -> Option<CandidateFile> {
        let mut state = self.lock();
        state.prune();
        state.lookup(file)
    }

    /// Number of live cache entries.
    pub fn cache_len(&self) -> usize {
        let mut state = self.lock();
        state.prune();
        state.cache.len()
    }

    fn is_produced(&self, file: &CandidateFile) -> bool {
        self.lock().produced.contains_key(&file.id())
    }

    fn claim(&self, file: &CandidateFile) -> Claim {
        let mut state = self.lock();
        state.prune();
        if let Some(hit) = state.lookup(file) {
            return Claim::Cached(hit);
        }
        if state.in_flight.contains(&file.id()) {
            return Claim::Wait;
        }
        state.in_flight.insert(file.id());
        Claim::Owner
    }

    fn store(&self, original: &CandidateFile, result: &CandidateFile) {
        let mut state = self.lock();
        let stored = if result.same_blob(original) {
            Stored::Unchanged
        } else {
            state.produced.insert(result.id(), result.downgrade());
            Stored::Rebuilt(result.clone())
        };
        state.cache.insert(
            original.id(),
            CacheEntry {
                original: original.downgrade(),
                result: stored,
            },
        );
    }

    /// Sanitise one file, at most once per blob.
    ///
    /// Non-PDFs (and everything, when disabled) come back as the same blob
    /// without suspending. `input` is where progress is drawn, if enabled.
    pub async fn sanitize_one(&self, file: &CandidateFile, input: Option<ElementId>) -> CandidateFile {
        let config = self.settings.resolve();
        if !config.enabled || !guard::is_pdf(file) {
            return file.clone();
        }
        if self.is_produced(file) {
            debug!(file = file.name(), "Already a sanitised output; passing through");
            return file.clone();
        }

        loop {
            match self.claim(file) {
                Claim::Cached(hit) => return hit,
                Claim::Owner => break,
                Claim::Wait => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }

        let Some(this) = self.this.upgrade() else {
            self.lock().in_flight.remove(&file.id());
            return file.clone();
        };
        // Dropping this future detaches the pass; it still finishes and
        // stores its result before releasing the claim.
        let pass = tokio::spawn(this.run_pass(file.clone(), input, config));
        match pass.await {
            Ok(out) => out,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => file.clone(),
        }
    }

    /// The owner's pass. Holds the in-flight claim until it returns.
    async fn run_pass(
        self: Arc<Self>,
        file: CandidateFile,
        input: Option<ElementId>,
        config: SanitizerConfig,
    ) -> CandidateFile {
        let mut cleanup = InFlight {
            sanitizer: Arc::clone(&self),
            id: file.id(),
            progress: None,
        };
        debug!(file = file.name(), config = %config.to_log_line(), "Sanitisation pass started");

        let diag = Diagnostics::for_config(&config);
        diag.info(
            file.name(),
            &format!(
                "Starting sanitization ({:.2} MB)",
                file.size() as f64 / crate::config::BYTES_PER_MB as f64
            ),
        );

        if let Some(input) = input.filter(|_| config.show_progress) {
            cleanup.progress = self.presenter.show(input, INITIAL_MESSAGE);
            if cleanup.progress.is_none() {
                diag.warn(file.name(), "Progress indicator could not be created");
            }
        }

        let on_progress = cleanup.progress.clone().map(|handle| {
            let presenter = Arc::clone(&self.presenter);
            Arc::new(move |p: &PageProgress| presenter.update(&handle, &p.message, Some(p.percent())))
                as PageProgressFn
        });

        let result = self.rasterizer.rasterize(&file, &config, on_progress).await;
        self.store(&file, &result);
        if !result.same_blob(&file) {
            diag.info(file.name(), "Sanitization completed");
        }
        result
    }

    /// Sanitise every PDF in `input`'s file list and swap the list in place.
    ///
    /// Returns `false` without touching the input when it has no files, is
    /// not marked, holds no PDFs, or something panicked along the way.
    pub async fn sanitize_input_files(&self, input: ElementId) -> bool {
        let files = self.dom.files(input);
        if files.is_empty() || !self.is_marked(input) || !files.iter().any(guard::is_pdf) {
            return false;
        }
        let config = self.settings.resolve();
        if !config.enabled {
            return false;
        }

        let work = join_all(files.iter().map(|file| async move {
            if guard::is_pdf(file) {
                self.sanitize_one(file, Some(input)).await
            } else {
                file.clone()
            }
        }));

        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(sanitized) => {
                self.dom.clear_files(input);
                self.dom.set_files(input, sanitized);
                true
            }
            Err(_) => {
                Diagnostics::for_config(&config).error(
                    "",
                    "Failed to sanitize input files",
                    &"sanitization task panicked",
                );
                false
            }
        }
    }

    /// Warm the library handles with the current settings.
    pub async fn preload(&self) -> Result<(), crate::error::SanitizeError> {
        self.rasterizer.preload(&self.settings.resolve()).await
    }
}

/// Releases the in-flight claim and hides progress, however the pass ends.
struct InFlight {
    sanitizer: Arc<Sanitizer>,
    id: FileId,
    progress: Option<ProgressHandle>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.sanitizer.lock().in_flight.remove(&self.id);
        if let Some(handle) = &self.progress {
            self.sanitizer.presenter.hide(handle);
        }
    }
}

/// Builder for [`Sanitizer`].
#[derive(Default)]
pub struct SanitizerBuilder {
    dom: Option<Dom>,
    settings: Option<SettingsSource>,
    handles: Option<Arc<LibraryHandles>>,
    presenter: Option<Arc<dyn ProgressPresenter>>,
}

impl SanitizerBuilder {
    /// Document the coordinator works on. Default: a fresh empty one.
    pub fn dom(mut self, dom: Dom) -> Self {
        self.dom = Some(dom);
        self
    }

    /// Default: [`SettingsSource::from_env`].
    pub fn settings(mut self, settings: SettingsSource) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Default: PDFium + lopdf.
    pub fn handles(mut self, handles: Arc<LibraryHandles>) -> Self {
        self.handles = Some(handles);
        self
    }

    /// Default: [`OverlayPresenter`] over the document.
    pub fn presenter(mut self, presenter: Arc<dyn ProgressPresenter>) -> Self {
        self.presenter = Some(presenter);
        self
    }

    pub fn build(self) -> Arc<Sanitizer> {
        let dom = self.dom.unwrap_or_default();
        let presenter = self
            .presenter
            .unwrap_or_else(|| Arc::new(OverlayPresenter::new(dom.clone())));
        Arc::new_cyclic(|this| Sanitizer {
            settings: self.settings.unwrap_or_else(SettingsSource::from_env),
            rasterizer: Rasterizer::new(self.handles.unwrap_or_default()),
            presenter,
            dom,
            state: Mutex::new(State::default()),
            this: this.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SanitizerConfig;
    use crate::file::PDF_MEDIA_TYPE;

    fn unusable_handles() -> Arc<LibraryHandles> {
        Arc::new(LibraryHandles::with_loaders(
            Arc::new(|_: &str| -> Result<Arc<dyn crate::pipeline::render::RenderService>, _> {
                Err(crate::error::SanitizeError::LibraryLoad {
                    service: "rendering".into(),
                    detail: "not available in unit tests".into(),
                })
            }),
            Arc::new(|| -> Result<Arc<dyn crate::pipeline::assemble::PdfAuthor>, _> {
                Ok(Arc::new(crate::pipeline::assemble::LopdfAuthor))
            }),
        ))
    }

    fn sanitizer(config: SanitizerConfig) -> Arc<Sanitizer> {
        Sanitizer::builder()
            .settings(SettingsSource::from_config(config))
            .handles(unusable_handles())
            .build()
    }

    // Both return before any await point, so no runtime is needed.
    #[test]
    fn test_non_pdf_is_identity() {
        let s = sanitizer(SanitizerConfig::default());
        let txt = CandidateFile::new("notes.txt", "text/plain", b"hi".to_vec());
        assert!(tokio_test::block_on(s.sanitize_one(&txt, None)).same_blob(&txt));
        assert_eq!(s.cache_len(), 0);
    }

    #[test]
    fn test_disabled_passes_pdfs_through() {
        let s = sanitizer(SanitizerConfig::builder().enabled(false).build().unwrap());
        let pdf = CandidateFile::new("a.pdf", PDF_MEDIA_TYPE, b"%PDF".to_vec());
        assert!(tokio_test::block_on(s.sanitize_one(&pdf, None)).same_blob(&pdf));
    }

    #[tokio::test]
    async fn test_failure_is_cached_as_unchanged() {
        let s = sanitizer(SanitizerConfig::builder().log_errors(false).build().unwrap());
        let pdf = CandidateFile::new("a.pdf", PDF_MEDIA_TYPE, b"%PDF".to_vec());
        assert!(s.sanitize_one(&pdf, None).await.same_blob(&pdf));
        assert!(s.cached(&pdf).is_some_and(|c| c.same_blob(&pdf)));
        assert_eq!(s.cache_len(), 1);

        drop(pdf);
        assert_eq!(s.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_unmarked_input_is_left_alone() {
        let s = sanitizer(SanitizerConfig::default());
        let input = s.dom().create_file_input("doc", false);
        let pdf = CandidateFile::new("a.pdf", PDF_MEDIA_TYPE, b"%PDF".to_vec());
        s.dom().set_files(input, vec![pdf.clone()]);

        assert!(!s.sanitize_input_files(input).await);
        assert!(s.dom().files(input)[0].same_blob(&pdf));
        assert_eq!(s.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_empty_or_pdf_free_inputs_return_false() {
        let s = sanitizer(SanitizerConfig::default());
        let input = s.dom().create_file_input("doc", true);
        assert!(!s.sanitize_input_files(input).await);

        s.dom()
            .set_files(input, vec![CandidateFile::new("a.png", "image/png", vec![0])]);
        assert!(!s.sanitize_input_files(input).await);
    }
}
