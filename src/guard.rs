//! Cheap predicates run before (and just after opening) a document.

use crate::config::SanitizerConfig;
use crate::error::GuardRejection;
use crate::file::{CandidateFile, PDF_MEDIA_TYPE};

/// `true` when the declared media type is PDF or the name ends in `.pdf`.
pub fn is_pdf(file: &CandidateFile) -> bool {
    is_pdf_parts(file.media_type(), file.name())
}

pub fn is_pdf_parts(media_type: &str, name: &str) -> bool {
    media_type.eq_ignore_ascii_case(PDF_MEDIA_TYPE) || name.to_ascii_lowercase().ends_with(".pdf")
}

/// Reject files larger than the configured ceiling.
pub fn check_size(file: &CandidateFile, config: &SanitizerConfig) -> Result<(), GuardRejection> {
    match config.max_file_size_bytes {
        Some(limit) if file.size() > limit => Err(GuardRejection::FileTooLarge {
            size: file.size(),
            limit_bytes: limit,
        }),
        _ => Ok(()),
    }
}

/// Reject documents with more pages than allowed. Needs an opened document.
pub fn check_pages(pages: usize, config: &SanitizerConfig) -> Result<(), GuardRejection> {
    match config.max_pages {
        Some(limit) if pages > limit => Err(GuardRejection::TooManyPages { pages, limit }),
        _ => Ok(()),
    }
}
