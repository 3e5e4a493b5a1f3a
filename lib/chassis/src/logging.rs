//! Logging glue. Components receive a `Logger` from their parent and derive
//! child loggers with additional context; components constructed without a
//! parent fall back to `discard()`.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

#[derive(Debug)]
pub enum LoggingError {
    Parse(serdeconv::Error),
    Build(sloggers::Error),
}

impl From<serdeconv::Error> for LoggingError {
    fn from(err: serdeconv::Error) -> Self {
        LoggingError::Parse(err)
    }
}

impl From<sloggers::Error> for LoggingError {
    fn from(err: sloggers::Error) -> Self {
        LoggingError::Build(err)
    }
}

/// Builds a root logger from a sloggers TOML configuration snippet.
pub fn from_toml(config: &str) -> Result<Logger, LoggingError> {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(config)?;
    Ok(config.build_logger()?)
}

/// Terminal logger with the default configuration.
pub fn term() -> Logger {
    from_toml(DEFAULT_CONFIG).expect("Default logging config must build")
}

/// Logger that swallows all records.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds() {
        let log = term();
        debug!(log, "logger constructed"; "context" => "test");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = from_toml("type = \"no-such-sink\"");
        assert!(result.is_err());
    }
}
