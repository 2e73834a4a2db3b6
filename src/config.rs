//! Sanitiser configuration: validated builder, loose host resolution, and the
//! process-wide settings source.
//!
//! Two ways in:
//!
//! * [`SanitizerConfig::builder()`] for callers holding real Rust values.
//!   `build()` rejects out-of-range values eagerly so nothing invalid ever
//!   reaches the pipeline.
//! * [`resolve`] for host-supplied settings that crossed a template boundary
//!   and arrive as loosely typed JSON (`"true"`, `"1"`, `"2.0"`). Resolution
//!   never fails; malformed fields fall back to defaults.
//!
//! [`SettingsSource`] is the injection point the coordinator reads from at
//! the start of every sanitisation call.

use crate::error::SanitizeError;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::warn;

// ── Defaults ─────────────────────────────────────────────────────────────

/// Where the rendering library is looked for first.
pub const DEFAULT_WORKER_PATH: &str = "/vendor/pdf-sanitizer/pdfium";
pub const DEFAULT_SCALE: f32 = 1.5;
pub const DEFAULT_QUALITY: f32 = 0.85;
pub const MIN_SCALE: f32 = 0.5;
pub const MAX_SCALE: f32 = 5.0;
pub const BYTES_PER_MB: u64 = 1_048_576;

/// URL fragments that identify an upload request.
pub const DEFAULT_UPLOAD_ENDPOINTS: [&str; 2] = ["/livewire/upload-file", "/livewire/"];

/// Opt-in attribute an input must carry (with value `"true"`).
pub const MARKER_ATTRIBUTE: &str = "data-pdf-sanitize";

/// Environment variable holding a JSON settings object.
pub const SETTINGS_ENV: &str = "PDF_SANITIZER_CONFIG";

/// Immutable snapshot of every sanitiser setting.
///
/// # Example
/// ```rust
/// use pdf_sanitizer::SanitizerConfig;
///
/// let config = SanitizerConfig::builder()
///     .scale(2.0)
///     .quality(0.7)
///     .max_pages(50)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_pages, Some(50));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SanitizerConfig {
    /// Global switch. When false every file passes through untouched.
    pub enabled: bool,

    /// PDFium library file or directory handed to the locator.
    pub worker_path: String,

    /// Render scale applied to the page size in points. Range: 0.5–5.0. Default: 1.5.
    pub scale: f32,

    /// JPEG quality in (0, 1]. Default: 0.85.
    pub quality: f32,

    /// Size ceiling in bytes. `None` means unlimited.
    pub max_file_size_bytes: Option<u64>,

    /// Page ceiling. `None` means unlimited.
    pub max_pages: Option<usize>,

    /// Show the progress overlay while rasterising. Default: true.
    pub show_progress: bool,

    /// Emit warnings and errors for skipped or failed files. Default: true.
    pub log_errors: bool,

    /// URL substrings that mark a request as an upload.
    pub upload_endpoints: Vec<String>,

    /// Which element-discovery strategy the observation layer runs.
    pub discovery: DiscoveryMode,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_path: DEFAULT_WORKER_PATH.to_string(),
            scale: DEFAULT_SCALE,
            quality: DEFAULT_QUALITY,
            max_file_size_bytes: None,
            max_pages: None,
            show_progress: true,
            log_errors: true,
            upload_endpoints: DEFAULT_UPLOAD_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            discovery: DiscoveryMode::default(),
        }
    }
}

impl SanitizerConfig {
    /// Create a new builder seeded with defaults.
    pub fn builder() -> SanitizerConfigBuilder {
        SanitizerConfigBuilder {
            config: Self::default(),
        }
    }

    /// The configuration as one JSON line, for logs.
    pub fn to_log_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("<unserialisable: {e}>"))
    }

    /// A builder seeded with this configuration, for layering overrides.
    pub fn to_builder(&self) -> SanitizerConfigBuilder {
        SanitizerConfigBuilder {
            config: self.clone(),
        }
    }
}

/// Builder for [`SanitizerConfig`].
#[derive(Debug)]
pub struct SanitizerConfigBuilder {
    config: SanitizerConfig,
}

impl SanitizerConfigBuilder {
    pub fn enabled(mut self, v: bool) -> Self {
        self.config.enabled = v;
        self
    }

    pub fn worker_path(mut self, path: impl Into<String>) -> Self {
        self.config.worker_path = path.into();
        self
    }

    pub fn scale(mut self, scale: f32) -> Self {
        self.config.scale = scale;
        self
    }

    pub fn quality(mut self, quality: f32) -> Self {
        self.config.quality = quality;
        self
    }

    /// Size ceiling in megabytes (1 MB = 1 048 576 bytes).
    pub fn max_file_size_mb(mut self, mb: f64) -> Self {
        self.config.max_file_size_bytes = Some(mb_to_bytes(mb));
        self
    }

    pub fn max_file_size_bytes(mut self, bytes: u64) -> Self {
        self.config.max_file_size_bytes = Some(bytes);
        self
    }

    pub fn max_pages(mut self, pages: usize) -> Self {
        self.config.max_pages = Some(pages);
        self
    }

    pub fn show_progress(mut self, v: bool) -> Self {
        self.config.show_progress = v;
        self
    }

    pub fn log_errors(mut self, v: bool) -> Self {
        self.config.log_errors = v;
        self
    }

    pub fn upload_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.upload_endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn discovery(mut self, mode: DiscoveryMode) -> Self {
        self.config.discovery = mode;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<SanitizerConfig, SanitizeError> {
        let c = &self.config;
        if !(MIN_SCALE..=MAX_SCALE).contains(&c.scale) {
            return Err(SanitizeError::InvalidConfig(format!(
                "Scale must be {MIN_SCALE}–{MAX_SCALE}, got {}",
                c.scale
            )));
        }
        if !(c.quality > 0.0 && c.quality <= 1.0) {
            return Err(SanitizeError::InvalidConfig(format!(
                "Quality must be in (0, 1], got {}",
                c.quality
            )));
        }
        if c.max_file_size_bytes == Some(0) {
            return Err(SanitizeError::InvalidConfig(
                "Maximum file size must be > 0".into(),
            ));
        }
        if c.max_pages == Some(0) {
            return Err(SanitizeError::InvalidConfig(
                "Maximum pages must be ≥ 1".into(),
            ));
        }
        if c.worker_path.trim().is_empty() {
            return Err(SanitizeError::InvalidConfig(
                "Worker path must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How the observation layer learns about new file inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Watch document mutation records (any host). (default)
    #[default]
    Observer,
    /// Subscribe to the host framework's patch-completion events.
    Lifecycle,
}

impl DiscoveryMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "observer" | "mutation" => Some(Self::Observer),
            "lifecycle" | "hook" => Some(Self::Lifecycle),
            _ => None,
        }
    }
}

// ── Loose host resolution ────────────────────────────────────────────────

/// Whole-byte ceiling for a megabyte limit.
///
/// Sizes are whole bytes, so `size > floor(mb * 1 MiB)` rejects exactly the
/// files with `size > mb * 1 MiB`. Rounding up would admit one byte too many.
fn mb_to_bytes(mb: f64) -> u64 {
    (mb * BYTES_PER_MB as f64).floor() as u64
}

/// Coerce a boolean-ish JSON value. `None` means "not a recognisable flag".
pub fn coerce_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_f64() {
            Some(x) if x == 1.0 => Some(true),
            Some(x) if x == 0.0 => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Coerce a number or numeric string.
pub fn coerce_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|x| x.is_finite())
}

fn field<'a>(host: &'a Value, key: &str) -> Option<&'a Value> {
    host.get(key).filter(|v| !v.is_null())
}

fn bool_field(host: &Value, key: &str, default: bool) -> bool {
    match field(host, key) {
        None => default,
        Some(v) => coerce_bool(v).unwrap_or_else(|| {
            warn!(key, value = %v, "Ignoring unrecognised boolean setting");
            default
        }),
    }
}

/// Numeric field accepted only when `valid` holds; otherwise `None`.
fn number_field(host: &Value, key: &str, valid: impl Fn(f64) -> bool) -> Option<f64> {
    let v = field(host, key)?;
    match coerce_f64(v) {
        Some(x) if valid(x) => Some(x),
        _ => {
            warn!(key, value = %v, "Ignoring out-of-range or malformed setting");
            None
        }
    }
}

/// Merge a loosely typed host settings object with the defaults.
///
/// Keys are camelCase: `enabled, workerPath, scale, quality, maxFileSizeMb,
/// maxPages, showProgress, logErrors, uploadEndpoints, discovery`.
/// Absent, null or malformed fields keep their default. Never fails.
pub fn resolve(host: Option<&Value>) -> SanitizerConfig {
    let mut cfg = SanitizerConfig::default();
    let Some(host) = host.filter(|h| h.is_object()) else {
        return cfg;
    };

    cfg.enabled = bool_field(host, "enabled", cfg.enabled);
    cfg.show_progress = bool_field(host, "showProgress", cfg.show_progress);
    cfg.log_errors = bool_field(host, "logErrors", cfg.log_errors);

    if let Some(path) = field(host, "workerPath").and_then(Value::as_str) {
        if !path.trim().is_empty() {
            cfg.worker_path = path.to_string();
        }
    }

    if let Some(scale) = number_field(host, "scale", |x| {
        (MIN_SCALE as f64..=MAX_SCALE as f64).contains(&x)
    }) {
        cfg.scale = scale as f32;
    }
    if let Some(q) = number_field(host, "quality", |x| x > 0.0 && x <= 1.0) {
        cfg.quality = q as f32;
    }

    // A zero or negative ceiling reads as "no ceiling" on the host side.
    cfg.max_file_size_bytes = number_field(host, "maxFileSizeMb", |x| x >= 0.0)
        .filter(|mb| *mb > 0.0)
        .map(mb_to_bytes);
    cfg.max_pages = number_field(host, "maxPages", |x| x >= 0.0 && x.fract() == 0.0)
        .filter(|p| *p >= 1.0)
        .map(|p| p as usize);

    if let Some(list) = field(host, "uploadEndpoints").and_then(Value::as_array) {
        cfg.upload_endpoints = list
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }

    if let Some(v) = field(host, "discovery") {
        match v.as_str().and_then(DiscoveryMode::parse) {
            Some(mode) => cfg.discovery = mode,
            None => warn!(value = %v, "Unknown discovery mode; using observer"),
        }
    }

    cfg
}

// ── Settings source ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Settings {
    Empty,
    Host(Value),
    Fixed(SanitizerConfig),
}

/// Process-wide settings injection point.
///
/// Cheap to clone; all clones see the same settings. The coordinator calls
/// [`SettingsSource::resolve`] at the start of each sanitisation, so a host
/// that installs new settings affects the next call, not one in progress.
#[derive(Debug, Clone)]
pub struct SettingsSource(Arc<RwLock<Settings>>);

impl Default for SettingsSource {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(Settings::Empty)))
    }
}

impl SettingsSource {
    /// A source resolving to the defaults until something is installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// A source fixed to an already-validated configuration.
    pub fn from_config(config: SanitizerConfig) -> Self {
        Self(Arc::new(RwLock::new(Settings::Fixed(config))))
    }

    /// A source seeded with a loose host settings object.
    pub fn from_host(host: Value) -> Self {
        Self(Arc::new(RwLock::new(Settings::Host(host))))
    }

    /// Read a JSON object from `PDF_SANITIZER_CONFIG`.
    ///
    /// Unset or unparseable values yield a default source.
    pub fn from_env() -> Self {
        match std::env::var(SETTINGS_ENV) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(host) => Self::from_host(host),
                Err(e) => {
                    warn!(error = %e, "{SETTINGS_ENV} is not valid JSON; using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Replace the host settings object.
    pub fn install(&self, host: Value) {
        *self.write() = Settings::Host(host);
    }

    /// Replace the settings with a validated configuration.
    pub fn install_config(&self, config: SanitizerConfig) {
        *self.write() = Settings::Fixed(config);
    }

    /// Snapshot the current configuration.
    pub fn resolve(&self) -> SanitizerConfig {
        let guard = self.0.read().unwrap_or_else(|p| p.into_inner());
        match &*guard {
            Settings::Empty => SanitizerConfig::default(),
            Settings::Host(host) => resolve(Some(host)),
            Settings::Fixed(cfg) => cfg.clone(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Settings> {
        self.0.write().unwrap_or_else(|p| p.into_inner())
    }
}
