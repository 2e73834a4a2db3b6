//! Error types for the pdf-sanitizer library.
//!
//! Two distinct types reflect two distinct outcomes:
//!
//! * [`SanitizeError`]: **Failure**: something broke (the rendering library
//!   would not load, the document is malformed, a page failed to render, the
//!   rebuilt document could not be serialised). Returned as `Err(..)` from the
//!   fallible internals. The fail-open boundaries
//!   ([`crate::pipeline::rasterize::Rasterizer::rasterize`],
//!   [`crate::coordinator::Sanitizer::sanitize_one`] and
//!   [`crate::intercept::UploadInterceptor::substitute`]) absorb it and hand
//!   back the original file.
//!
//! * [`GuardRejection`]: **Skip**: the file is fine but a guard said no
//!   (not a PDF, over the size ceiling, too many pages). Not an error; the
//!   original file is returned and a warning is logged.

use std::path::PathBuf;
use thiserror::Error;

/// All failures raised by the pdf-sanitizer library.
#[derive(Debug, Error)]
pub enum SanitizeError {
    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Library errors ────────────────────────────────────────────────────
    /// The rendering or authoring service could not be initialised.
    #[error(
        "Failed to load {service} library: {detail}\n\n\
PDFium is located via the configured worker path, then PDFIUM_LIB_PATH,\n\
then the local cache. If none is present it is downloaded on first use.\n"
    )]
    LibraryLoad { service: String, detail: String },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// The document could not be opened or has no pages.
    #[error("PDF '{name}' is corrupt: {detail}")]
    CorruptPdf { name: String, detail: String },

    /// The rendering service failed on a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// JPEG encoding of a rendered page failed.
    #[error("Encoding failed for page {page}: {detail}")]
    EncodeFailed { page: usize, detail: String },

    /// The rebuilt document could not be assembled or serialised.
    #[error("Failed to author sanitised PDF: {0}")]
    AuthoringFailed(String),

    // ── Transport errors ──────────────────────────────────────────────────
    /// The underlying upload transport failed.
    #[error("Upload transport error: {0}")]
    Transport(String),

    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (a blocking task panicked, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a file was passed through without being rasterised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardRejection {
    /// Neither the media type nor the file name says PDF.
    #[error("File is not a PDF")]
    NotPdf,

    /// The file is larger than the configured ceiling.
    #[error("PDF file exceeds maximum size of {limit_mb}MB", limit_mb = format_mb(.limit_bytes))]
    FileTooLarge { size: u64, limit_bytes: u64 },

    /// The opened document has more pages than allowed.
    #[error("PDF has {pages} pages, exceeds maximum of {limit}")]
    TooManyPages { pages: usize, limit: usize },
}

fn format_mb(bytes: &u64) -> String {
    let mb = *bytes as f64 / crate::config::BYTES_PER_MB as f64;
    if mb.fract() == 0.0 {
        format!("{}", mb as u64)
    } else {
        format!("{mb:.2}")
    }
}
