// Environment detection and tracing subscriber setup.

use std::sync::OnceLock;

/// Cached environment mode.
static ENV_MODE: OnceLock<EnvMode> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvMode {
    Production,
    Development,
    Test,
}

impl EnvMode {
    /// Parse a mode string. Anything unrecognized is development.
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "production" | "prod" => EnvMode::Production,
            "test" | "testing" => EnvMode::Test,
            _ => EnvMode::Development,
        }
    }
}

/// Detect the current environment mode.
/// Checks `MILO_ENV`, then `RUST_ENV`.
pub fn detect_env_mode() -> EnvMode {
    *ENV_MODE.get_or_init(|| {
        let env_val = std::env::var("MILO_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        EnvMode::parse(&env_val)
    })
}

pub fn is_production() -> bool {
    detect_env_mode() == EnvMode::Production
}

pub fn is_test() -> bool {
    detect_env_mode() == EnvMode::Test
}

/// Default filter directive for the given mode.
pub fn default_filter(mode: EnvMode) -> &'static str {
    match mode {
        EnvMode::Production => "milo=info",
        EnvMode::Development | EnvMode::Test => "milo=debug",
    }
}

/// Initialize the `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise the filter follows the detected mode.
/// Calling this twice is harmless: the second install attempt is ignored.
pub fn init_logger() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(detect_env_mode())));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modes() {
        assert_eq!(EnvMode::parse("PRODUCTION"), EnvMode::Production);
        assert_eq!(EnvMode::parse("prod"), EnvMode::Production);
        assert_eq!(EnvMode::parse("test"), EnvMode::Test);
        assert_eq!(EnvMode::parse(""), EnvMode::Development);
    }

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter(EnvMode::Production), "milo=info");
        assert_eq!(default_filter(EnvMode::Development), "milo=debug");
    }
}
