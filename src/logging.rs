//! Tracing setup for applications embedding the cache.
//!
//! The library itself only emits `tracing` events; nothing is printed until
//! a subscriber is installed, either by the host application or by [`init`].

use color_eyre::eyre::{eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Install a global subscriber.
///
/// `RUST_LOG` overrides `config.filter`. With a log directory configured,
/// events go to a daily-rolling `gqlstore.log` through a non-blocking
/// writer; keep the returned guard alive or buffered lines are lost.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.filter))
    .map_err(|e| eyre!("Invalid log filter {:?}: {}", config.filter, e))?;

  let registry = tracing_subscriber::registry().with(filter);

  match &config.directory {
    Some(directory) => {
      std::fs::create_dir_all(directory)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;
      let appender = tracing_appender::rolling::daily(directory, "gqlstore.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      registry
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      registry
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
      Ok(None)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rejects_bad_filter() {
    if std::env::var_os("RUST_LOG").is_some() {
      return;
    }
    let config = LogConfig {
      filter: "gqlstore=loudest".to_string(),
      directory: None,
    };
    assert!(init(&config).is_err());
  }
}
