//! CLI binary for pdf-sanitizer.
//!
//! A thin shim over the library crate: maps flags to `SanitizerConfig`,
//! runs one file through the same coordinator the upload hooks use, and
//! either writes the rebuilt PDF or posts it through the intercepted
//! transport.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use pdf_sanitizer::config::resolve;
use pdf_sanitizer::pipeline::input::{is_url, resolve_input};
use pdf_sanitizer::progress::NoopPresenter;
use pdf_sanitizer::{
    CandidateFile, Dom, ElementId, HostTransport, HttpTransport, MultipartForm, ProgressHandle,
    ProgressPresenter, Sanitizer, SanitizerConfig, SettingsSource, Transport, UploadRequest,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Terminal progress presenter using indicatif ─────────────────────────────

/// Draws sanitisation progress as a terminal bar instead of a page overlay.
struct BarPresenter {
    bar: ProgressBar,
}

impl BarPresenter {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::with_draw_target(Some(100), ProgressDrawTarget::hidden());
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}%  {msg}  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix("Sanitizing");
        Arc::new(Self { bar })
    }
}

impl ProgressPresenter for BarPresenter {
    fn show(&self, input: ElementId, message: &str) -> Option<ProgressHandle> {
        self.bar.set_draw_target(ProgressDrawTarget::stderr());
        self.bar.set_position(0);
        self.bar.set_message(message.to_string());
        self.bar.enable_steady_tick(Duration::from_millis(80));
        Some(ProgressHandle::detached(input))
    }

    fn update(&self, _handle: &ProgressHandle, message: &str, percent: Option<u8>) {
        if let Some(p) = percent {
            self.bar.set_position(p as u64);
        }
        self.bar.set_message(message.to_string());
    }

    fn hide(&self, _handle: &ProgressHandle) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Sanitise next to the input (writes report.sanitized.pdf)
  pdf-sanitize report.pdf

  # Choose the output path, render sharper, compress harder
  pdf-sanitize report.pdf -o clean.pdf --scale 2.5 --quality 0.7

  # Refuse to write anything when the file could not be rebuilt
  pdf-sanitize --strict --max-pages 50 scan.pdf

  # Download, sanitise and post as a multipart upload
  pdf-sanitize https://example.com/form.pdf \
      --upload https://app.example.com/livewire/upload-file --field files

  # Host settings object (same keys the embedding page uses)
  pdf-sanitize --settings sanitizer.json report.pdf

SETTINGS FILE KEYS:
  enabled, workerPath, scale, quality, maxFileSizeMb, maxPages,
  showProgress, logErrors, uploadEndpoints, discovery
  Command-line flags override values from the file.

ENVIRONMENT VARIABLES:
  PDF_SANITIZER_CONFIG       Settings object as JSON (when --settings is absent)
  PDFIUM_LIB_PATH            Path to an existing libpdfium; skips auto-download
  PDFIUM_LOCATOR_CACHE_DIR   Override the default pdfium cache directory

SETUP:
  PDFium (~30 MB) is downloaded automatically on first run and cached in
  ~/.cache/pdf-sanitizer/pdfium-7690/. No manual library setup is required.
"#;

/// Rebuild PDFs from page images so no active content survives.
#[derive(Parser, Debug)]
#[command(
    name = "pdf-sanitize",
    version,
    about = "Rebuild a PDF from page images so no active content survives",
    long_about = "Render every page of a PDF (local file or URL) to an image and author a \
brand-new PDF from those images. Scripts, forms, annotations and embedded files are \
dropped by construction. On any failure the original file is passed through unchanged \
unless --strict is given.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write the sanitised PDF here. Default: <input>.sanitized.pdf.
    #[arg(short, long, env = "PDF_SANITIZE_OUTPUT")]
    output: Option<PathBuf>,

    /// Render scale relative to the page size in points (0.5–5.0).
    #[arg(long, env = "PDF_SANITIZE_SCALE")]
    scale: Option<f32>,

    /// JPEG quality in (0, 1].
    #[arg(long, env = "PDF_SANITIZE_QUALITY")]
    quality: Option<f32>,

    /// Pass files larger than this through untouched.
    #[arg(long, env = "PDF_SANITIZE_MAX_FILE_SIZE_MB")]
    max_file_size_mb: Option<f64>,

    /// Pass documents with more pages than this through untouched.
    #[arg(long, env = "PDF_SANITIZE_MAX_PAGES")]
    max_pages: Option<usize>,

    /// PDFium library file or directory.
    #[arg(long, env = "PDF_SANITIZE_WORKER_PATH")]
    worker_path: Option<String>,

    /// JSON settings object (camelCase keys).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Disable the progress bar.
    #[arg(long, env = "PDF_SANITIZE_NO_PROGRESS")]
    no_progress: bool,

    /// Fail instead of passing the original through.
    #[arg(long, env = "PDF_SANITIZE_STRICT")]
    strict: bool,

    /// Post the file as a multipart upload to this URL instead of writing it.
    #[arg(long)]
    upload: Option<String>,

    /// Form field name used with --upload.
    #[arg(long, default_value = "file")]
    field: String,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF_SANITIZE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF_SANITIZE_QUIET")]
    quiet: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDF_SANITIZE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar covers the happy path; keep library INFO lines out
    // of its way unless asked for.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli).await?;
    tracing::debug!(config = %config.to_log_line(), "Configuration resolved");

    // ── Ensure PDFium engine is available ───────────────────────────────────
    // First run downloads the library; later runs resolve it from the cache.
    ensure_pdfium(&config.worker_path, cli.quiet)?;

    // ── Load input ───────────────────────────────────────────────────────
    let original = resolve_input(&cli.input, cli.download_timeout)
        .await
        .context("Failed to load input")?;
    if !cli.quiet {
        eprintln!(
            "{} {}  {}",
            cyan("◆"),
            bold(original.name()),
            dim(&format!("{:.2} MB", original.size() as f64 / 1_048_576.0)),
        );
    }

    // ── Wire the coordinator to a one-input document ─────────────────────
    let dom = Dom::new();
    let input = dom.create_file_input(&cli.field, true);
    dom.append_child(dom.body(), input);
    dom.set_files(input, vec![original.clone()]);

    let presenter: Arc<dyn ProgressPresenter> = if show_progress {
        BarPresenter::new()
    } else {
        Arc::new(NoopPresenter)
    };
    let sanitizer = Sanitizer::builder()
        .dom(dom)
        .settings(SettingsSource::from_config(config))
        .presenter(presenter)
        .build();

    let started = Instant::now();
    match cli.upload.as_deref() {
        Some(url) => upload(&cli, &sanitizer, &original, url).await?,
        None => {
            let result = sanitizer.sanitize_one(&original, Some(input)).await;
            let passed_through = result.same_blob(&original);
            if passed_through && cli.strict {
                bail!(
                    "{} could not be sanitised; nothing written (--strict)",
                    original.name()
                );
            }

            let out_path = cli
                .output
                .clone()
                .unwrap_or_else(|| default_output_path(&cli.input, original.name()));
            write_atomic(&out_path, result.bytes())?;

            if !cli.quiet {
                eprintln!(
                    "{}  {}  {}  →  {}",
                    if passed_through { cyan("⚠") } else { green("✔") },
                    if passed_through {
                        red("original passed through")
                    } else {
                        "sanitised".to_string()
                    },
                    dim(&format!("{}ms", started.elapsed().as_millis())),
                    bold(&out_path.display().to_string()),
                );
            }
        }
    }

    Ok(())
}

/// Settings file (or `PDF_SANITIZER_CONFIG`) first, then CLI flags on top.
async fn build_config(cli: &Cli) -> Result<SanitizerConfig> {
    let base = match cli.settings {
        Some(ref path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read settings from {:?}", path))?;
            let host: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("Settings file {:?} is not valid JSON", path))?;
            resolve(Some(&host))
        }
        None => SettingsSource::from_env().resolve(),
    };

    let mut builder = base.to_builder();
    if let Some(scale) = cli.scale {
        builder = builder.scale(scale);
    }
    if let Some(quality) = cli.quality {
        builder = builder.quality(quality);
    }
    if let Some(mb) = cli.max_file_size_mb {
        builder = builder.max_file_size_mb(mb);
    }
    if let Some(pages) = cli.max_pages {
        builder = builder.max_pages(pages);
    }
    if let Some(ref path) = cli.worker_path {
        builder = builder.worker_path(path.clone());
    }
    if cli.no_progress {
        builder = builder.show_progress(false);
    }
    // The CLI always reports failures; --quiet only hides the chatter.
    builder = builder.log_errors(true).enabled(true);

    builder.build().context("Invalid configuration")
}

/// Resolve PDFium, showing a download bar when it has to be fetched.
fn ensure_pdfium(worker_path: &str, quiet: bool) -> Result<()> {
    let dl_bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden());
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    dl_bar.set_prefix("PDF engine");

    let bar = dl_bar.clone();
    let on_progress = move |downloaded: u64, total: Option<u64>| {
        if quiet {
            return;
        }
        if bar.is_hidden() {
            bar.set_draw_target(ProgressDrawTarget::stderr());
            bar.enable_steady_tick(Duration::from_millis(80));
        }
        if let Some(t) = total {
            if bar.length() != Some(t) {
                bar.set_length(t);
            }
        }
        bar.set_position(downloaded);
    };

    // block_in_place keeps the borrowed callback valid while the blocking
    // download runs off the async hot path.
    let located = tokio::task::block_in_place(|| {
        pdfium_locator::locate(Some(Path::new(worker_path)), Some(&on_progress))
    })
    .context("Failed to locate PDFium engine")?;

    if !dl_bar.is_hidden() {
        dl_bar.finish_with_message("ready ✓");
    }
    tracing::debug!(path = %located.path.display(), source = ?located.source, "PDFium located");
    Ok(())
}

/// Send the file through an intercepted transport, as a host page would.
async fn upload(cli: &Cli, sanitizer: &Arc<Sanitizer>, original: &CandidateFile, url: &str) -> Result<()> {
    let transport = HostTransport::new(HttpTransport::new());
    transport.register_interceptor(Arc::clone(sanitizer));

    let request = UploadRequest::new("POST", url)
        .multipart(MultipartForm::new().file(cli.field.clone(), original.clone()));
    let response = transport.send(request).await.context("Upload failed")?;

    let passed_through = sanitizer
        .cached(original)
        .is_none_or(|c| c.same_blob(original));
    if passed_through && cli.strict {
        bail!(
            "{} was uploaded unsanitised (--strict); server replied {}",
            original.name(),
            response.status
        );
    }

    if !response.is_success() {
        bail!(
            "Server rejected upload: HTTP {} {}",
            response.status,
            String::from_utf8_lossy(&response.body)
        );
    }
    if !cli.quiet {
        eprintln!(
            "{}  uploaded {} to {}  {}",
            if passed_through { cyan("⚠") } else { green("✔") },
            if passed_through {
                red("original")
            } else {
                "sanitised copy".to_string()
            },
            bold(url),
            dim(&format!("HTTP {}", response.status)),
        );
    }
    Ok(())
}

/// `<stem>.sanitized.pdf` next to a local input, or in the working
/// directory for a URL.
fn default_output_path(input: &str, name: &str) -> PathBuf {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let file_name = format!("{stem}.sanitized.pdf");
    if is_url(input) {
        PathBuf::from(file_name)
    } else {
        Path::new(input).with_file_name(file_name)
    }
}

/// Write through a temp file in the target directory, then rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("Failed to create a temp file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move output into place at {}", path.display()))?;
    Ok(())
}
