//! # pdfium-locator
//!
//! Finds a usable [PDFium](https://pdfium.googlesource.com/pdfium/) shared
//! library for the sanitiser's rendering service and binds `pdfium-render`
//! to it.
//!
//! ## Resolution order
//!
//! [`locate`] tries, first match wins:
//!
//! 1. The *worker path* configured by the host. It may name the library file
//!    itself or the directory that contains it.
//! 2. `PDFIUM_LIB_PATH`: an explicit library path from the environment.
//! 3. The per-version cache directory (`~/.cache/pdf-sanitizer/pdfium-{VERSION}/`).
//! 4. A one-time download of the platform archive from
//!    [bblanchon/pdfium-binaries](https://github.com/bblanchon/pdfium-binaries),
//!    extracted into the cache directory.
//!
//! The outcome reports which step succeeded so callers can log it.
//!
//! ```rust,no_run
//! use pdfium_locator::{bind, locate};
//! use std::path::Path;
//!
//! let found = locate(Some(Path::new("/vendor/pdf-sanitizer/pdfium")), None)
//!     .expect("no pdfium available");
//! println!("using {} ({:?})", found.path.display(), found.source);
//!
//! let pdfium = bind(None, None).expect("bind failed");
//! # drop(pdfium);
//! ```
//!
//! ## Environment variable overrides
//!
//! - `PDFIUM_LIB_PATH`: path to an existing pdfium library; skips download.
//! - `PDFIUM_LOCATOR_CACHE_DIR`: override the default cache directory.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use pdfium_render::prelude::Pdfium;
use thiserror::Error;

// ── Public constants ─────────────────────────────────────────────────────────

/// The pdfium-binaries release tag used for downloads.
pub const PDFIUM_VERSION: &str = "7690";

/// GitHub release base URL.
const BASE_URL: &str = "https://github.com/bblanchon/pdfium-binaries/releases/download";

/// Environment variable naming an explicit library path.
pub const LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "PDFIUM_LOCATOR_CACHE_DIR";

// ── Error type ───────────────────────────────────────────────────────────────

/// Errors returned while locating or binding PDFium.
#[derive(Error, Debug)]
pub enum LocateError {
    /// The current OS/architecture combination has no published binary.
    #[error("Unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    /// Could not create the local cache directory.
    #[error("Cache directory error: {0}")]
    CacheDir(#[source] std::io::Error),

    /// Network download failed.
    #[error("Download failed: {0}")]
    Download(String),

    /// gzip/tar extraction failed.
    #[error("Archive extraction failed: {0}")]
    Extract(String),

    /// `pdfium-render` could not load the library.
    #[error("Failed to bind PDFium from '{path}': {reason}")]
    Bind { path: PathBuf, reason: String },
}

// ── Resolution outcome ───────────────────────────────────────────────────────

/// Which resolution step produced the library path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibrarySource {
    /// The caller-supplied worker path.
    Configured,
    /// `PDFIUM_LIB_PATH`.
    Environment,
    /// Already present in the cache directory.
    Cached,
    /// Freshly downloaded into the cache directory.
    Downloaded,
}

/// A resolved library location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedLibrary {
    pub path: PathBuf,
    pub source: LibrarySource,
}

// ── Platform metadata ────────────────────────────────────────────────────────

struct Platform {
    /// Asset filename in the GitHub release, e.g. `pdfium-linux-x64.tgz`.
    archive: &'static str,
    /// Path of the library inside the archive.
    member: &'static str,
    /// Library filename on disk.
    lib_name: &'static str,
}

const DYLIB: (&str, &str) = ("lib/libpdfium.dylib", "libpdfium.dylib");
const SO: (&str, &str) = ("lib/libpdfium.so", "libpdfium.so");
const DLL: (&str, &str) = ("bin/pdfium.dll", "pdfium.dll");

fn platform() -> Result<Platform, LocateError> {
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;

    let (archive, (member, lib_name)) = match (os, arch) {
        ("macos", "aarch64") => ("pdfium-mac-arm64.tgz", DYLIB),
        ("macos", "x86_64") => ("pdfium-mac-x64.tgz", DYLIB),
        ("linux", "x86_64") => ("pdfium-linux-x64.tgz", SO),
        ("linux", "aarch64") => ("pdfium-linux-arm64.tgz", SO),
        ("windows", "x86_64") => ("pdfium-win-x64.tgz", DLL),
        ("windows", "aarch64") => ("pdfium-win-arm64.tgz", DLL),
        ("windows", "x86") => ("pdfium-win-x86.tgz", DLL),
        (os, arch) => {
            return Err(LocateError::UnsupportedPlatform {
                os: os.to_string(),
                arch: arch.to_string(),
            })
        }
    };

    Ok(Platform {
        archive,
        member,
        lib_name,
    })
}

/// Platform file name of the PDFium library (`libpdfium.so`, `pdfium.dll`, …).
pub fn platform_library_name() -> Result<&'static str, LocateError> {
    platform().map(|p| p.lib_name)
}

/// Interpret `candidate` as either the library file or its directory.
///
/// Returns the library path when it exists on disk.
pub fn library_at(candidate: &Path) -> Option<PathBuf> {
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }
    if candidate.is_dir() {
        let lib = candidate.join(platform_library_name().ok()?);
        if lib.is_file() {
            return Some(lib);
        }
    }
    None
}

// ── Cache directory ──────────────────────────────────────────────────────────

/// Per-version cache directory for the downloaded library.
///
/// - **macOS**: `~/Library/Caches/pdf-sanitizer/pdfium-{VERSION}/`
/// - **Linux**: `~/.cache/pdf-sanitizer/pdfium-{VERSION}/`
/// - **Windows**: `%LOCALAPPDATA%\pdf-sanitizer\pdfium-{VERSION}\`
pub fn cache_dir() -> PathBuf {
    if let Ok(root) = std::env::var(CACHE_DIR_ENV) {
        return PathBuf::from(root).join(format!("pdfium-{PDFIUM_VERSION}"));
    }

    dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
        .unwrap_or_else(std::env::temp_dir)
        .join("pdf-sanitizer")
        .join(format!("pdfium-{PDFIUM_VERSION}"))
}

// Download result shared by every caller in this process.
static DOWNLOADED: OnceLock<PathBuf> = OnceLock::new();

// ── Public API ───────────────────────────────────────────────────────────────

/// Resolve a PDFium library without binding it.
///
/// `on_progress` receives `(bytes_downloaded, total_bytes)` only when the
/// download step is reached.
pub fn locate(
    preferred: Option<&Path>,
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<LocatedLibrary, LocateError> {
    if let Some(path) = preferred.and_then(library_at) {
        return Ok(LocatedLibrary {
            path,
            source: LibrarySource::Configured,
        });
    }

    if let Ok(env_path) = std::env::var(LIB_PATH_ENV) {
        if let Some(path) = library_at(Path::new(&env_path)) {
            return Ok(LocatedLibrary {
                path,
                source: LibrarySource::Environment,
            });
        }
    }

    if let Some(path) = DOWNLOADED.get() {
        return Ok(LocatedLibrary {
            path: path.clone(),
            source: LibrarySource::Cached,
        });
    }

    let info = platform()?;
    let dir = cache_dir();
    let lib_path = dir.join(info.lib_name);
    if lib_path.is_file() {
        return Ok(LocatedLibrary {
            path: lib_path,
            source: LibrarySource::Cached,
        });
    }

    let url = format!("{BASE_URL}/chromium%2F{PDFIUM_VERSION}/{}", info.archive);
    std::fs::create_dir_all(&dir).map_err(LocateError::CacheDir)?;
    let archive = fetch(&url, on_progress)?;
    unpack_member(&archive, info.member, &lib_path)?;
    let _ = DOWNLOADED.set(lib_path.clone());

    Ok(LocatedLibrary {
        path: lib_path,
        source: LibrarySource::Downloaded,
    })
}

/// Locate and bind PDFium in one step.
pub fn bind(
    preferred: Option<&Path>,
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<Pdfium, LocateError> {
    let found = locate(preferred, on_progress)?;
    bind_from_path(&found.path)
}

/// Bind to the PDFium library at exactly `path`.
pub fn bind_from_path(path: &Path) -> Result<Pdfium, LocateError> {
    Pdfium::bind_to_library(path)
        .map(Pdfium::new)
        .map_err(|e| LocateError::Bind {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

// ── Internal helpers ─────────────────────────────────────────────────────────

/// Read a URL fully into memory, reporting progress every 64 KiB.
fn fetch(url: &str, on_progress: Option<&dyn Fn(u64, Option<u64>)>) -> Result<Vec<u8>, LocateError> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("pdfium-locator/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| LocateError::Download(e.to_string()))?;

    let mut response = client
        .get(url)
        .send()
        .map_err(|e| LocateError::Download(format!("GET {url}: {e}")))?;

    if !response.status().is_success() {
        return Err(LocateError::Download(format!(
            "HTTP {} for {url}",
            response.status()
        )));
    }

    let total = response.content_length();
    let mut buf = Vec::with_capacity(total.unwrap_or(32 * 1024 * 1024) as usize);
    let mut chunk = vec![0u8; 64 * 1024];
    let mut received: u64 = 0;

    loop {
        match response.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                received += n as u64;
                if let Some(cb) = on_progress {
                    cb(received, total);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(LocateError::Download(format!("Read error: {e}"))),
        }
    }

    Ok(buf)
}

/// Extract the single archive member `member` from a `.tgz` into `dest`.
fn unpack_member(archive: &[u8], member: &str, dest: &Path) -> Result<(), LocateError> {
    use flate2::read::GzDecoder;
    use tar::Archive;

    let mut tarball = Archive::new(GzDecoder::new(archive));
    let entries = tarball
        .entries()
        .map_err(|e| LocateError::Extract(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| LocateError::Extract(e.to_string()))?;
        let matches = entry
            .path()
            .map_err(|e| LocateError::Extract(e.to_string()))?
            .to_string_lossy()
            == member;
        if matches {
            entry
                .unpack(dest)
                .map_err(|e| LocateError::Extract(format!("Unpack failed: {e}")))?;
            return Ok(());
        }
    }

    Err(LocateError::Extract(format!(
        "Library '{member}' not found in archive"
    )))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_platform_is_supported() {
        let p = platform().expect("current platform should be supported");
        assert!(!p.archive.is_empty());
        assert!(p.member.ends_with(p.lib_name));
    }

    #[test]
    fn test_cache_dir_is_versioned() {
        let d = cache_dir();
        assert_eq!(d, cache_dir());
        assert!(d.to_string_lossy().contains(PDFIUM_VERSION));
    }

    #[test]
    fn test_configured_file_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("custom-pdfium.bin");
        std::fs::write(&lib, b"not really a library").unwrap();

        let found = locate(Some(&lib), None).unwrap();
        assert_eq!(found.source, LibrarySource::Configured);
        assert_eq!(found.path, lib);
    }

    #[test]
    fn test_configured_directory_resolves_platform_name() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join(platform_library_name().unwrap());
        std::fs::write(&lib, b"stub").unwrap();

        assert_eq!(library_at(dir.path()), Some(lib));
    }

    #[test]
    fn test_missing_candidate_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(library_at(&dir.path().join("nope")), None);
        // Directory without the library inside.
        assert_eq!(library_at(dir.path()), None);
    }

    #[test]
    fn test_unpack_reports_missing_member() {
        use flate2::{write::GzEncoder, Compression};

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        let data = b"hello";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, "lib/other.so", &data[..])
            .unwrap();
        let archive = builder.into_inner().unwrap().finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let err = unpack_member(&archive, "lib/libpdfium.so", &dir.path().join("x")).unwrap_err();
        assert!(matches!(err, LocateError::Extract(_)));

        unpack_member(&archive, "lib/other.so", &dir.path().join("x")).unwrap();
        assert_eq!(std::fs::read(dir.path().join("x")).unwrap(), b"hello");
    }
}
