//! Input resolution: turn a user-supplied path or URL into a [`CandidateFile`].
//!
//! Used by the CLI. Both paths check the `%PDF` magic before returning, so a
//! wrong file fails here with a readable error instead of later as a
//! "corrupt PDF" pass-through.

use crate::error::SanitizeError;
use crate::file::{CandidateFile, PDF_MEDIA_TYPE};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Load `input` from disk, or download it when it is a URL.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<CandidateFile, SanitizeError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(Path::new(input)).await
    }
}

/// Read a local PDF, keeping its modification time.
pub async fn read_local(path: &Path) -> Result<CandidateFile, SanitizeError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => SanitizeError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => SanitizeError::FileNotFound {
            path: path.to_path_buf(),
        },
    })?;
    check_magic(&bytes, path)?;

    let modified = tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .unwrap_or_else(|_| std::time::SystemTime::now());
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string());

    debug!("Read local PDF: {} ({} bytes)", path.display(), bytes.len());
    Ok(CandidateFile::with_last_modified(name, PDF_MEDIA_TYPE, bytes, modified))
}

/// Download a URL into memory.
async fn download_url(url: &str, timeout_secs: u64) -> Result<CandidateFile, SanitizeError> {
    info!("Downloading PDF from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| SanitizeError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let to_error = |e: reqwest::Error| {
        if e.is_timeout() {
            SanitizeError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            SanitizeError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    let response = client.get(url).send().await.map_err(to_error)?;
    if !response.status().is_success() {
        return Err(SanitizeError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response.bytes().await.map_err(to_error)?.to_vec();
    let name = filename_from_url(url);
    check_magic(&bytes, Path::new(&name))?;

    info!("Downloaded {} ({} bytes)", name, bytes.len());
    Ok(CandidateFile::new(name, PDF_MEDIA_TYPE, bytes))
}

fn check_magic(bytes: &[u8], path: &Path) -> Result<(), SanitizeError> {
    if bytes.len() >= 4 && &bytes[..4] != PDF_MAGIC {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        return Err(SanitizeError::NotAPdf {
            path: PathBuf::from(path),
            magic,
        });
    }
    Ok(())
}

/// Last URL path segment when it looks like a file name.
pub fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "downloaded.pdf".to_string()
}
