//! Shared configuration helpers
//!
//! Environment detection, typed env-var loading for [`FromEnv`] configs, and
//! tracing/color-eyre setup in [`tracing`].

pub mod tracing;

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Application environment, selected by `APP_ENV`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    /// JSON logs, quieter default filter
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Helper to load and parse environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to parse an environment variable, falling back to `default` when unset
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Helper to parse an optional environment variable; unset or empty yields `None`
pub fn env_parse_optional<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::ParseError {
                key: key.to_string(),
                details: e.to_string(),
            }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production() {
        temp_env::with_var("APP_ENV", Some("production"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Production);
            assert!(env.is_production());
            assert!(!env.is_development());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Production);
        });

        temp_env::with_var("APP_ENV", Some("Production"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Production);
        });
    }

    #[test]
    fn test_environment_unknown_defaults_to_development() {
        temp_env::with_var("APP_ENV", Some("staging"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
        });
    }

    #[test]
    fn test_env_or_default_with_value() {
        temp_env::with_var("TEST_VAR", Some("test_value"), || {
            let result = env_or_default("TEST_VAR", "default");
            assert_eq!(result, "test_value");
        });
    }

    #[test]
    fn test_env_or_default_without_value() {
        temp_env::with_var_unset("MISSING_VAR", || {
            let result = env_or_default("MISSING_VAR", "default_value");
            assert_eq!(result, "default_value");
        });
    }

    #[test]
    fn test_env_parse_default_when_unset() {
        temp_env::with_var_unset("FETCH_BATCH_TEST", || {
            let result: usize = env_parse("FETCH_BATCH_TEST", 10).unwrap();
            assert_eq!(result, 10);
        });
    }

    #[test]
    fn test_env_parse_value() {
        temp_env::with_var("FETCH_BATCH_TEST", Some(" 25 "), || {
            let result: usize = env_parse("FETCH_BATCH_TEST", 10).unwrap();
            assert_eq!(result, 25);
        });
    }

    #[test]
    fn test_env_parse_invalid() {
        temp_env::with_var("FETCH_BATCH_TEST", Some("lots"), || {
            let err = env_parse::<usize>("FETCH_BATCH_TEST", 10).unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "FETCH_BATCH_TEST"));
        });
    }

    #[test]
    fn test_env_parse_optional() {
        temp_env::with_var_unset("METRICS_PORT_TEST", || {
            assert_eq!(env_parse_optional::<u16>("METRICS_PORT_TEST").unwrap(), None);
        });
        temp_env::with_var("METRICS_PORT_TEST", Some(""), || {
            assert_eq!(env_parse_optional::<u16>("METRICS_PORT_TEST").unwrap(), None);
        });
        temp_env::with_var("METRICS_PORT_TEST", Some("9090"), || {
            assert_eq!(env_parse_optional::<u16>("METRICS_PORT_TEST").unwrap(), Some(9090));
        });
        temp_env::with_var("METRICS_PORT_TEST", Some("port"), || {
            assert!(env_parse_optional::<u16>("METRICS_PORT_TEST").is_err());
        });
    }
}
