//! Provider configuration.
//!
//! The host passes provider configuration as JSON. `api_base` and `api_key`
//! may be omitted there and supplied through `LITELLM_API_BASE` and
//! `LITELLM_API_KEY` instead.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::ProviderError;
use crate::types::deserialize_non_empty;

/// Environment variable consulted when `api_base` is not configured.
pub const API_BASE_ENV: &str = "LITELLM_API_BASE";

/// Environment variable consulted when `api_key` is not configured.
pub const API_KEY_ENV: &str = "LITELLM_API_KEY";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Settings needed to talk to a LiteLLM proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Base URL of the LiteLLM proxy, without a trailing slash.
    pub api_base: String,
    /// Master or admin key sent as `x-api-key`.
    pub api_key: String,
    /// Accept invalid TLS certificates.
    pub insecure_skip_verify: bool,
    /// Per-request timeout.
    pub timeout: Duration,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    api_base: Option<String>,
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    api_key: Option<String>,
    #[serde(default)]
    insecure_skip_verify: Option<bool>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

impl ProviderConfig {
    /// Create a config with default timeout and TLS verification on.
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: normalize_base(api_base.into()),
            api_key: api_key.into(),
            insecure_skip_verify: false,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Disable TLS certificate verification.
    pub fn with_insecure_skip_verify(mut self, insecure: bool) -> Self {
        self.insecure_skip_verify = insecure;
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parse provider configuration JSON, falling back to the process environment.
    pub fn from_value(value: &Value) -> Result<Self, ProviderError> {
        Self::from_value_with_env(value, |name| std::env::var(name).ok())
    }

    /// Parse provider configuration JSON with a custom environment lookup.
    pub fn from_value_with_env<F>(value: &Value, env: F) -> Result<Self, ProviderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig = match value {
            Value::Null => RawConfig::default(),
            other => serde_json::from_value(other.clone())
                .map_err(|e| ProviderError::Configuration(e.to_string()))?,
        };

        let lookup = |name: &str| env(name).filter(|s| !s.is_empty());

        let api_base = raw.api_base.or_else(|| lookup(API_BASE_ENV)).ok_or_else(|| {
            ProviderError::Configuration(format!(
                "api_base must be configured or {} set",
                API_BASE_ENV
            ))
        })?;
        let api_key = raw.api_key.or_else(|| lookup(API_KEY_ENV)).ok_or_else(|| {
            ProviderError::Configuration(format!(
                "api_key must be configured or {} set",
                API_KEY_ENV
            ))
        })?;

        if !api_base.starts_with("http://") && !api_base.starts_with("https://") {
            return Err(ProviderError::Configuration(format!(
                "api_base must be an http(s) URL, got '{}'",
                api_base
            )));
        }

        let config = Self::new(api_base, api_key)
            .with_insecure_skip_verify(raw.insecure_skip_verify.unwrap_or(false))
            .with_timeout(Duration::from_secs(
                raw.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ));
        Ok(config)
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &"<redacted>")
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn normalize_base(base: String) -> String {
    base.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_from_value() {
        let config = ProviderConfig::from_value_with_env(
            &json!({
                "api_base": "https://litellm.example.com/",
                "api_key": "sk-1234",
                "insecure_skip_verify": true,
                "timeout_secs": 5
            }),
            no_env,
        )
        .unwrap();

        assert_eq!(config.api_base, "https://litellm.example.com");
        assert_eq!(config.api_key, "sk-1234");
        assert!(config.insecure_skip_verify);
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_env_fallback() {
        let env = |name: &str| match name {
            API_BASE_ENV => Some("http://localhost:4000".to_string()),
            API_KEY_ENV => Some("sk-env".to_string()),
            _ => None,
        };

        let config = ProviderConfig::from_value_with_env(&json!({"api_key": ""}), env).unwrap();
        assert_eq!(config.api_base, "http://localhost:4000");
        assert_eq!(config.api_key, "sk-env");
        assert!(!config.insecure_skip_verify);

        let config = ProviderConfig::from_value_with_env(&Value::Null, env).unwrap();
        assert_eq!(config.api_key, "sk-env");
    }

    #[test]
    fn test_missing_values() {
        let err =
            ProviderConfig::from_value_with_env(&json!({"api_key": "sk"}), no_env).unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
        assert!(err.message().contains("api_base"));

        let err = ProviderConfig::from_value_with_env(
            &json!({"api_base": "http://localhost:4000"}),
            no_env,
        )
        .unwrap_err();
        assert!(err.message().contains(API_KEY_ENV));
    }

    #[test]
    fn test_rejects_bad_input() {
        let err = ProviderConfig::from_value_with_env(
            &json!({"api_base": "localhost:4000", "api_key": "sk"}),
            no_env,
        )
        .unwrap_err();
        assert!(err.message().contains("http(s)"));

        let err = ProviderConfig::from_value_with_env(
            &json!({"api_base": "http://x", "api_key": "sk", "api_secret": "?"}),
            no_env,
        )
        .unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = ProviderConfig::new("http://localhost:4000", "sk-secret");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
