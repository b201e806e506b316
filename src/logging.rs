//! Logging setup.
//!
//! Logs go to a daily rotated file so that command output on stdout stays
//! clean. `--verbose` mirrors them to stderr.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogConfig;

/// Environment variable that overrides the configured filter.
pub const LOG_ENV: &str = "TIERCACHE_LOG";

const LOG_FILE_PREFIX: &str = "tiercache.log";

/// Initialize the global subscriber. Keep the returned guard alive for the
/// lifetime of the program or buffered lines are lost.
pub fn init(config: &LogConfig, verbose: bool) -> Result<WorkerGuard> {
  let directory = log_directory(config)?;
  std::fs::create_dir_all(&directory)?;

  let appender = tracing_appender::rolling::daily(&directory, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let file_layer = fmt::layer()
    .with_writer(writer)
    .with_ansi(false)
    .with_target(true)
    .with_filter(filter(&config.level));

  let stderr_layer = verbose.then(|| {
    fmt::layer()
      .compact()
      .with_writer(std::io::stderr)
      .with_filter(filter(&config.level))
  });

  tracing_subscriber::registry()
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

/// `TIERCACHE_LOG` wins over the configured level; an unparsable directive
/// falls back to `info`.
fn filter(level: &str) -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV)
    .or_else(|_| EnvFilter::try_new(level))
    .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Configured directory, else `$XDG_DATA_HOME/tiercache/logs`.
pub fn log_directory(config: &LogConfig) -> Result<PathBuf> {
  if let Some(dir) = &config.directory {
    return Ok(dir.clone());
  }
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .map(|p| p.join("tiercache").join("logs"))
    .ok_or_else(|| eyre!("Could not determine data directory"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_configured_directory_wins() {
    let config = LogConfig {
      directory: Some(PathBuf::from("/tmp/tiercache-logs")),
      ..LogConfig::default()
    };
    assert_eq!(
      log_directory(&config).unwrap(),
      PathBuf::from("/tmp/tiercache-logs")
    );
  }

  #[test]
  fn test_bad_directive_falls_back() {
    // Must not panic on garbage
    let _ = filter("tiercache=[[[");
    let _ = filter("tiercache=debug,reqwest=warn");
  }
}
