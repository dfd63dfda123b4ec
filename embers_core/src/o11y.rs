//! Process-wide tracing setup.
//!
//! JSON lines on stderr by default, filtered by `RUST_LOG` (default `info`).
//! `EMBERS_LOG_FORMAT=pretty` switches to human-readable output.

use crate::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }

    pub fn from_env() -> Result<Self> {
        match std::env::var("EMBERS_LOG_FORMAT") {
            Err(_) => Ok(Self::default()),
            Ok(v) if v.trim().is_empty() => Ok(Self::default()),
            Ok(v) => Self::parse_str(&v).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "EMBERS_LOG_FORMAT must be 'json' or 'pretty', got {v:?}"
                ))
            }),
        }
    }
}

pub fn init_tracing_from_env() -> Result<()> {
    init_tracing(LogFormat::from_env()?)
}

pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init()
        .map_err(|e| Error::Conflict(format!("tracing already initialized: {e}")))?;
    Ok(())
}
