//! # pdf-sanitizer
//!
//! Neutralise uploaded PDFs by rasterising every page and rebuilding a brand
//! new document from the images.
//!
//! ## Why rasterise?
//!
//! A PDF can carry JavaScript, forms, annotations, launch actions and
//! embedded files. Rather than trying to find and strip each of those, this
//! crate renders every page to pixels and authors a fresh PDF holding only
//! JPEGs. Nothing from the source survives except what it looked like.
//!
//! ## Pipeline Overview
//!
//! ```text
//! file input (marked)      upload request
//!        │                       │
//!        ├─ observe              ├─ intercept
//!        └──────────┬────────────┘
//!                   ▼
//!            coordinator   dedup by blob identity, cache, progress
//!                   │
//!                   ├─ 1. Guard      PDF? size ceiling?
//!                   ├─ 2. Render     PDFium, page by page (spawn_blocking)
//!                   ├─ 3. Encode     JPEG at the configured quality
//!                   └─ 4. Assemble   new document via lopdf
//! ```
//!
//! Every failure is fail-open: the caller gets the original file back and
//! the upload goes ahead.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf_sanitizer::{CandidateFile, Sanitizer, SanitizerConfig, SettingsSource};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SanitizerConfig::builder().scale(2.0).max_pages(100).build().unwrap();
//!     let sanitizer = Sanitizer::builder()
//!         .settings(SettingsSource::from_config(config))
//!         .build();
//!
//!     let bytes = std::fs::read("upload.pdf").unwrap();
//!     let original = CandidateFile::new("upload.pdf", "application/pdf", bytes);
//!     let result = sanitizer.sanitize_one(&original, None).await;
//!     if result.same_blob(&original) {
//!         eprintln!("passed through unchanged");
//!     }
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf-sanitize` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! pdf-sanitizer = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod dom;
pub mod error;
pub mod file;
pub mod guard;
pub mod intercept;
pub mod observe;
pub mod overlay;
pub mod pipeline;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{DiscoveryMode, SanitizerConfig, SanitizerConfigBuilder, SettingsSource};
pub use coordinator::{Sanitizer, SanitizerBuilder};
pub use dom::{Dom, ElementId};
pub use error::{GuardRejection, SanitizeError};
pub use file::{CandidateFile, PDF_MEDIA_TYPE};
pub use intercept::{
    FormValue, HostTransport, HttpTransport, MultipartForm, RequestBody, Transport, UploadInterceptor,
    UploadRequest,
};
pub use observe::DomObserver;
pub use overlay::OverlayPresenter;
pub use pipeline::rasterize::{RasterOutcome, Rasterizer};
pub use pipeline::render::LibraryHandles;
pub use progress::{PageProgress, ProgressHandle, ProgressPresenter};
