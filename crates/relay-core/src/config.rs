//! Process configuration read from `RELAY_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::retrieval::{DEFAULT_MAX_RESULTS, DEFAULT_MIN_SCORE};
use crate::wire::ErrorFrameStyle;

pub const ENV_API_ENDPOINT: &str = "RELAY_API_ENDPOINT";
pub const ENV_REGION: &str = "RELAY_REGION";

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MODEL_URL: &str = "https://api.anthropic.com/v1/messages";
pub const DEFAULT_MODEL: &str = "claude-3-haiku-20240307";
pub const DEFAULT_MAX_TOKENS: u32 = 512;
pub const DEFAULT_TEMPERATURE: f32 = 0.5;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Settings for the streaming model backend.
#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub connect_timeout: Duration,
    /// Longest silence tolerated between streamed chunks.
    pub read_timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_MODEL_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Settings for the optional document lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalConfig {
    pub url: String,
    pub min_score: f64,
    pub max_results: usize,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Base URL of the push-to-connection management API.
    pub api_endpoint: String,
    /// Region of the managed backend.
    pub region: String,
    pub port: u16,
    pub model: ModelConfig,
    pub retrieval: Option<RetrievalConfig>,
    pub error_frames: ErrorFrameStyle,
    pub log_json: bool,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Required keys must be present and non-empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_endpoint = get(ENV_API_ENDPOINT).ok_or(ConfigError::Missing(ENV_API_ENDPOINT))?;
        if !(api_endpoint.starts_with("http://") || api_endpoint.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                name: ENV_API_ENDPOINT,
                reason: format!("expected an http(s) URL, got `{api_endpoint}`"),
            });
        }
        let region = get(ENV_REGION).ok_or(ConfigError::Missing(ENV_REGION))?;

        let model = ModelConfig {
            url: get("RELAY_MODEL_URL").unwrap_or_else(|| DEFAULT_MODEL_URL.to_string()),
            api_key: get("ANTHROPIC_API_KEY").map(SecretString::from),
            model: get("RELAY_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: parse_or("RELAY_MAX_TOKENS", get("RELAY_MAX_TOKENS"), DEFAULT_MAX_TOKENS)?,
            temperature: parse_or(
                "RELAY_TEMPERATURE",
                get("RELAY_TEMPERATURE"),
                DEFAULT_TEMPERATURE,
            )?,
            connect_timeout: Duration::from_secs(parse_or(
                "RELAY_CONNECT_TIMEOUT_SECS",
                get("RELAY_CONNECT_TIMEOUT_SECS"),
                DEFAULT_CONNECT_TIMEOUT.as_secs(),
            )?),
            read_timeout: Duration::from_secs(parse_or(
                "RELAY_READ_TIMEOUT_SECS",
                get("RELAY_READ_TIMEOUT_SECS"),
                DEFAULT_READ_TIMEOUT.as_secs(),
            )?),
        };

        let retrieval = match get("RELAY_RETRIEVAL_URL") {
            Some(url) => Some(RetrievalConfig {
                url,
                min_score: parse_or(
                    "RELAY_RETRIEVAL_MIN_SCORE",
                    get("RELAY_RETRIEVAL_MIN_SCORE"),
                    DEFAULT_MIN_SCORE,
                )?,
                max_results: parse_or(
                    "RELAY_RETRIEVAL_RESULTS",
                    get("RELAY_RETRIEVAL_RESULTS"),
                    DEFAULT_MAX_RESULTS,
                )?,
            }),
            None => None,
        };

        let error_frames = match get("RELAY_ERROR_FRAMES") {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                name: "RELAY_ERROR_FRAMES",
                reason,
            })?,
            None => ErrorFrameStyle::default(),
        };

        Ok(Self {
            api_endpoint: api_endpoint.trim_end_matches('/').to_string(),
            region,
            port: parse_or("RELAY_PORT", get("RELAY_PORT"), DEFAULT_PORT)?,
            model,
            retrieval,
            error_frames,
            log_json: parse_bool("RELAY_LOG_JSON", get("RELAY_LOG_JSON"))?,
        })
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: format!("`{raw}`: {e}"),
        }),
        None => Ok(default),
    }
}

fn parse_bool(name: &'static str, raw: Option<String>) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            name,
            reason: format!("`{other}` is not a boolean"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("RELAY_API_ENDPOINT", "https://gw.example.com/prod/"),
        ("RELAY_REGION", "us-east-1"),
    ];

    #[test]
    fn defaults_with_required_only() {
        let config = RelayConfig::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.api_endpoint, "https://gw.example.com/prod");
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.model.model, DEFAULT_MODEL);
        assert_eq!(config.model.max_tokens, 512);
        assert_eq!(config.model.connect_timeout, Duration::from_secs(120));
        assert!(config.model.api_key.is_none());
        assert!(config.retrieval.is_none());
        assert_eq!(config.error_frames, ErrorFrameStyle::Typed);
        assert!(!config.log_json);
    }

    #[test]
    fn missing_endpoint_is_fatal() {
        let err = RelayConfig::from_lookup(lookup(&[("RELAY_REGION", "us-east-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(ENV_API_ENDPOINT)));
    }

    #[test]
    fn blank_region_is_missing() {
        let err = RelayConfig::from_lookup(lookup(&[
            ("RELAY_API_ENDPOINT", "https://gw.example.com"),
            ("RELAY_REGION", "   "),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing(ENV_REGION)));
    }

    #[test]
    fn endpoint_must_be_http() {
        let err = RelayConfig::from_lookup(lookup(&[
            ("RELAY_API_ENDPOINT", "gw.example.com"),
            ("RELAY_REGION", "us-east-1"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: ENV_API_ENDPOINT, .. }));
    }

    #[test]
    fn overrides_are_applied() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("RELAY_PORT", "9000"),
            ("ANTHROPIC_API_KEY", "sk-test"),
            ("RELAY_READ_TIMEOUT_SECS", "30"),
            ("RELAY_RETRIEVAL_URL", "http://kb.local/retrieve"),
            ("RELAY_RETRIEVAL_RESULTS", "3"),
            ("RELAY_ERROR_FRAMES", "legacy"),
            ("RELAY_LOG_JSON", "true"),
        ]);
        let config = RelayConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(
            config.model.api_key.as_ref().map(|k| k.expose_secret().to_string()),
            Some("sk-test".to_string())
        );
        assert_eq!(config.model.read_timeout, Duration::from_secs(30));
        assert_eq!(
            config.retrieval,
            Some(RetrievalConfig {
                url: "http://kb.local/retrieve".into(),
                min_score: 0.5,
                max_results: 3,
            })
        );
        assert_eq!(config.error_frames, ErrorFrameStyle::Legacy);
        assert!(config.log_json);
    }

    #[test]
    fn unparseable_optional_value_is_an_error() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RELAY_PORT", "eighty"));
        let err = RelayConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "RELAY_PORT", .. }));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RELAY_LOG_JSON", "maybe"));
        assert!(RelayConfig::from_lookup(lookup(&pairs)).is_err());
    }
}
