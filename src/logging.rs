//! Diagnostic logging
//!
//! A `tracing` registry with an `EnvFilter` (`RUST_LOG`, default `info`) and a
//! `fmt` layer. The filter sits behind a reload layer so diagnostics can be
//! switched off and back on at runtime through [`LoggingHandle`].

use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

const DEFAULT_DIRECTIVE: &str = "info";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Logging is already initialized")]
    AlreadyInitialized,

    #[error("Failed to update log filter: {0}")]
    Reload(String),
}

/// Controls the installed subscriber's filter.
#[derive(Clone)]
pub struct LoggingHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    directive: String,
}

impl LoggingHandle {
    /// Restore the filter chosen at init time.
    pub fn enable(&self) -> Result<(), LoggingError> {
        self.set_directive(&self.directive)
    }

    /// Drop every event.
    pub fn disable(&self) -> Result<(), LoggingError> {
        self.set_directive("off")
    }

    fn set_directive(&self, directive: &str) -> Result<(), LoggingError> {
        self.filter
            .reload(EnvFilter::new(directive))
            .map_err(|e| LoggingError::Reload(e.to_string()))
    }
}

/// Install the global subscriber.
pub fn init_logging() -> Result<LoggingHandle, LoggingError> {
    let directive = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_DIRECTIVE.to_string());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    tracing::debug!("Logging initialized with filter {:?}", directive);

    Ok(LoggingHandle {
        filter: handle,
        directive,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let first = init_logging();
        assert!(matches!(init_logging(), Err(LoggingError::AlreadyInitialized)));

        if let Ok(handle) = first {
            handle.disable().unwrap();
            handle.enable().unwrap();
        }
    }
}
