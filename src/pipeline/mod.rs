//! Pipeline stages for rebuilding a PDF from page rasters.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets us
//! swap implementations (e.g. a different rendering backend) without
//! touching other stages.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ assemble
//! (URL/path) (pdfium)   (JPEG)     (lopdf)
//!    └────────── driven by rasterize ──────────┘
//! ```
//!
//! 1. [`input`]: load a user-supplied path or URL into a blob (CLI only)
//! 2. [`render`]: open the source and rasterise pages; PDFium runs in
//!    `spawn_blocking` and is bound once per handle set
//! 3. [`encode`]: JPEG-encode each page at the configured quality
//! 4. [`assemble`]: author a fresh document, one image per page
//! 5. [`rasterize`]: guards, page loop, progress and the fail-open boundary

pub mod assemble;
pub mod encode;
pub mod input;
pub mod rasterize;
pub mod render;
