//! Process-wide logging subscriber. Every component logs through the single
//! subscriber installed here, at startup, once. The log target is always the
//! error stream — stdout stays reserved for JSON-RPC tool-call traffic.

use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected 'text' or 'json')")),
        }
    }
}

/// Install the global subscriber. `level` follows `tracing`'s `EnvFilter` syntax
/// (`debug`, `info`, `warn`, `error`, or a per-module directive string).
pub fn init(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    if result.is_err() {
        // A subscriber is already installed (e.g. a repeated call in tests) —
        // not an error worth surfacing to the caller.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("text").unwrap(), LogFormat::Text);
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(LogFormat::from_str("xml").is_err());
    }

    #[test]
    fn default_format_is_text() {
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }
}
