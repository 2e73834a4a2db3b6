//! Progress reporting while a document is rasterised.
//!
//! Two layers:
//!
//! * [`PageProgressFn`]: the per-page callback the rasteriser invokes after
//!   each page is rendered (before it is encoded).
//! * [`ProgressPresenter`]: the UI side the coordinator drives: `show` once,
//!   `update` per page, `hide` exactly once in cleanup. The DOM overlay in
//!   [`crate::overlay`] and the CLI's terminal bar both implement it.
//!
//! # Example
//!
//! ```rust
//! use pdf_sanitizer::dom::ElementId;
//! use pdf_sanitizer::progress::{ProgressHandle, ProgressPresenter};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct CountingPresenter {
//!     updates: AtomicUsize,
//! }
//!
//! impl ProgressPresenter for CountingPresenter {
//!     fn show(&self, input: ElementId, _message: &str) -> Option<ProgressHandle> {
//!         Some(ProgressHandle::detached(input))
//!     }
//!
//!     fn update(&self, _handle: &ProgressHandle, _message: &str, _percent: Option<u8>) {
//!         self.updates.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//! ```

use crate::dom::ElementId;
use std::sync::Arc;

/// Opaque token returned by [`ProgressPresenter::show`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressHandle {
    /// The input the progress is reported for.
    pub input: ElementId,
    /// The positioning container the overlay lives in, if any.
    pub container: Option<ElementId>,
    /// The overlay element, if any.
    pub overlay: Option<ElementId>,
}

impl ProgressHandle {
    /// A handle not tied to any DOM elements (terminal presenters, tests).
    pub fn detached(input: ElementId) -> Self {
        Self {
            input,
            container: None,
            overlay: None,
        }
    }
}

/// Something that can display sanitisation progress for an input.
///
/// Implementations must be `Send + Sync`: the coordinator can run several
/// files concurrently. `update` and `hide` default to no-ops.
pub trait ProgressPresenter: Send + Sync {
    /// Start displaying progress. `None` means nothing is shown and no
    /// further calls will be made for this run.
    fn show(&self, input: ElementId, message: &str) -> Option<ProgressHandle>;

    /// Replace the message, optionally with a percent-complete figure.
    fn update(&self, handle: &ProgressHandle, message: &str, percent: Option<u8>) {
        let _ = (handle, message, percent);
    }

    /// Stop displaying progress. Called exactly once per successful `show`.
    fn hide(&self, handle: &ProgressHandle) {
        let _ = handle;
    }
}

/// A presenter that never shows anything.
pub struct NoopPresenter;

impl ProgressPresenter for NoopPresenter {
    fn show(&self, _input: ElementId, _message: &str) -> Option<ProgressHandle> {
        None
    }
}

/// One per-page event from the rasteriser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageProgress {
    /// 1-indexed page that just finished rendering.
    pub page: usize,
    pub total: usize,
    pub message: String,
}

impl PageProgress {
    pub fn new(page: usize, total: usize) -> Self {
        Self {
            page,
            total,
            message: format_progress_message(page, total),
        }
    }

    /// `round(page / total * 100)`.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.page as f64 / self.total as f64) * 100.0)
            .round()
            .clamp(0.0, 100.0) as u8
    }
}

/// Callback invoked by the rasteriser once per rendered page.
pub type PageProgressFn = Arc<dyn Fn(&PageProgress) + Send + Sync>;

pub fn format_progress_message(page: usize, total: usize) -> String {
    format!("Processing page {page} of {total}...")
}
