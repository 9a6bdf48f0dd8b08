//! Tracing setup for the gateway daemon.
//!
//! One call at startup wires the global subscriber from [`LoggingConfig`]:
//! the filter comes from `RUST_LOG` when set, otherwise from the configured
//! level, and the output format is `pretty`, `compact`, or `json`. A file
//! sink applies to the JSON format only; everything else writes to stderr.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::Result;

/// Install the global tracing subscriber. Call once, before the first
/// tracing event; failing to open the configured log file is an error.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = match std::env::var("RUST_LOG") {
        Ok(spec) => EnvFilter::new(spec),
        Err(_) => EnvFilter::new(&cfg.level),
    };
    let base = tracing_subscriber::fmt().with_env_filter(filter);

    match (cfg.format, cfg.file.as_deref()) {
        (LogFormat::Json, Some(path)) => {
            let sink = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            base.json().with_writer(std::sync::Mutex::new(sink)).init();
        }
        (LogFormat::Json, None) => base.json().init(),
        (LogFormat::Compact, _) => base.compact().with_target(true).init(),
        (LogFormat::Pretty, _) => base.init(),
    }
    Ok(())
}
