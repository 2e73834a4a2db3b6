//! User-facing diagnostic lines, gated by the `log_errors` setting.
//!
//! Internal `debug!` traces are left to the subscriber's filter; only the
//! lines a host operator would act on (skips, failures) go through here.

use crate::config::SanitizerConfig;
use tracing::{error, info, warn};

/// Logging gate for one sanitisation call.
#[derive(Debug, Clone, Copy)]
pub struct Diagnostics {
    enabled: bool,
}

impl Diagnostics {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn for_config(config: &SanitizerConfig) -> Self {
        Self::new(config.log_errors)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn info(&self, file: &str, message: &str) {
        if self.enabled {
            info!(file, "{message}");
        }
    }

    pub fn warn(&self, file: &str, message: &str) {
        if self.enabled {
            warn!(file, "{message}");
        }
    }

    pub fn error(&self, file: &str, message: &str, detail: &dyn std::fmt::Display) {
        if self.enabled {
            error!(file, error = %detail, "{message}");
        }
    }
}
