//! Logging setup.
//!
//! A [`LoggingContext`] is built by the binary and initialised once. Library
//! code only emits `tracing` events and never configures subscribers.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::error::{ExplorerError, Result};

/// File name of the run log inside a results directory.
pub const RUN_LOG_FILE: &str = "exploration_run.log";

/// Console verbosity plus an optional plain-text log file.
#[derive(Debug, Clone, Default)]
pub struct LoggingContext {
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

impl LoggingContext {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            log_file: None,
        }
    }

    /// Also log at DEBUG to `<dir>/exploration_run.log`.
    pub fn with_results_dir(mut self, dir: &Path) -> Self {
        self.log_file = Some(dir.join(RUN_LOG_FILE));
        self
    }

    /// Console directive used when `RUST_LOG` is unset.
    pub fn console_directive(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Install the global subscriber. Fails if one is already installed.
    pub fn init(&self) -> Result<()> {
        let console_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.console_directive()));
        let console = fmt::layer().with_target(false).with_filter(console_filter);

        let file_layer = match &self.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let file = File::create(path)?;
                Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(Arc::new(file))
                        .with_filter(LevelFilter::DEBUG),
                )
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(console)
            .with(file_layer)
            .try_init()
            .map_err(|e| ExplorerError::config(format!("cannot install logger: {e}")))?;

        if let Some(path) = &self.log_file {
            tracing::debug!(log_file = %path.display(), "file logging enabled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_selects_directive() {
        assert_eq!(LoggingContext::new(false).console_directive(), "info");
        assert_eq!(LoggingContext::new(true).console_directive(), "debug");
    }

    #[test]
    fn results_dir_sets_log_file() {
        let ctx = LoggingContext::new(false).with_results_dir(Path::new("out"));
        assert_eq!(ctx.log_file, Some(PathBuf::from("out").join(RUN_LOG_FILE)));
    }
}
