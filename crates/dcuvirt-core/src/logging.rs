//! Logging and tracing initialization

use crate::config::LoggingConfig;
use crate::Result;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this twice
/// returns an error instead of panicking.
pub fn init_logging(logging_config: &LoggingConfig) -> Result<()> {
    logging_config.validate()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging_config.show_target)
        .with_thread_ids(logging_config.show_thread_ids)
        .with_line_number(logging_config.show_line_numbers);

    let installed = match logging_config.format.to_lowercase().as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };

    installed.map_err(|e| crate::Error::config(format!("Failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        let config = LoggingConfig::default();
        let first = init_logging(&config);
        let second = init_logging(&config);

        // Another test may have installed a subscriber first
        assert!(first.is_ok() || second.is_err());
        assert!(matches!(second, Err(crate::Error::InvalidConfiguration(_))));
    }

    #[test]
    fn test_init_logging_rejects_bad_format() {
        let config = LoggingConfig {
            format: "xml".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
