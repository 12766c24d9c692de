// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::decoder::Codec;
use crate::errors::{BackoffPolicy, ConfigError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

pub const DEFAULT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_RESPONSE_OBJECT_NAME: &str = "http_response";
pub const DEFAULT_NO_MESSAGES_RESPONSE_CODE: u16 = 204;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

const ENV_PREFIX: &str = "HTTP_POLLER_";

/// Configuration for a single polled endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Target endpoint, may embed query parameters
    pub url: String,
    /// Base pacing between requests absent a "more events" hint
    #[serde(with = "secs")]
    pub interval: Duration,
    /// Top-level record key under which response metadata is attached
    pub response_object_name: String,
    pub include_response_headers: bool,
    pub include_response_code: bool,
    pub include_http_request_time: bool,
    /// Status code meaning "no content, do not parse body"
    pub no_messages_response_code: u16,
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Static headers sent with every poll
    pub headers: BTreeMap<String, String>,
    /// HTTPS proxy URL
    pub proxy: Option<String>,
    pub codec: Codec,
    pub tags: Vec<String>,
    pub add_field: BTreeMap<String, String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    /// Capacity of the bounded downstream queue
    pub queue_capacity: usize,
    #[serde(with = "secs")]
    pub reconnect_backoff: Duration,
    #[serde(with = "secs")]
    pub error_backoff: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            url: String::new(),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            response_object_name: DEFAULT_RESPONSE_OBJECT_NAME.to_string(),
            include_response_headers: false,
            include_response_code: true,
            include_http_request_time: true,
            no_messages_response_code: DEFAULT_NO_MESSAGES_RESPONSE_CODE,
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            user: None,
            password: None,
            headers: BTreeMap::new(),
            proxy: None,
            codec: Codec::default(),
            tags: Vec::new(),
            add_field: BTreeMap::new(),
            event_type: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            reconnect_backoff: backoff.reconnect,
            error_backoff: backoff.error,
        }
    }
}

impl PollerConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Builds configurations from `HTTP_POLLER_*` environment variables.
    ///
    /// `HTTP_POLLER_URL` may hold several comma-separated URLs; one configuration is
    /// returned per URL, all sharing the remaining options.
    pub fn from_env() -> Result<Vec<Self>, ConfigError> {
        Self::from_env_iter(env::vars())
    }

    pub fn from_env_iter<I, K, V>(vars: I) -> Result<Vec<Self>, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .filter_map(|(k, v)| {
                k.as_ref()
                    .strip_prefix(ENV_PREFIX)
                    .map(|key| (key.to_ascii_lowercase(), v.as_ref().to_string()))
            })
            .collect();

        let urls: Vec<String> = vars
            .get("url")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if urls.is_empty() {
            return Err(ConfigError::Missing("url"));
        }

        let mut template = Self::default();
        if let Some(val) = vars.get("interval") {
            template.interval = parse_secs("interval", val)?;
        }
        if let Some(val) = vars.get("response_object_name") {
            template.response_object_name = val.trim().to_string();
        }
        if let Some(val) = vars.get("include_response_headers") {
            template.include_response_headers = parse_bool(val);
        }
        if let Some(val) = vars.get("include_response_code") {
            template.include_response_code = parse_bool(val);
        }
        if let Some(val) = vars.get("include_http_request_time") {
            template.include_http_request_time = parse_bool(val);
        }
        if let Some(val) = vars.get("no_messages_response_code") {
            template.no_messages_response_code =
                val.trim().parse().map_err(|_| ConfigError::Invalid {
                    option: "no_messages_response_code",
                    reason: format!("'{val}' is not a status code"),
                })?;
        }
        if let Some(val) = vars.get("request_timeout") {
            template.request_timeout = parse_secs("request_timeout", val)?;
        }
        if let Some(val) = vars.get("connect_timeout") {
            template.connect_timeout = parse_secs("connect_timeout", val)?;
        }
        template.user = vars.get("user").cloned();
        template.password = vars.get("password").cloned();
        if let Some(val) = vars.get("headers") {
            template.headers = parse_pairs(val);
        }
        template.proxy = vars
            .get("proxy")
            .cloned()
            .or_else(|| env::var("HTTPS_PROXY").ok());
        if let Some(val) = vars.get("codec") {
            template.codec = val.parse()?;
        }
        if let Some(val) = vars.get("tags") {
            template.tags = val
                .split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(val) = vars.get("add_field") {
            template.add_field = parse_pairs(val);
        }
        template.event_type = vars.get("type").cloned();
        if let Some(val) = vars.get("queue_capacity") {
            template.queue_capacity = val.trim().parse().map_err(|_| ConfigError::Invalid {
                option: "queue_capacity",
                reason: format!("'{val}' is not a positive integer"),
            })?;
        }
        if let Some(val) = vars.get("reconnect_backoff") {
            template.reconnect_backoff = parse_secs("reconnect_backoff", val)?;
        }
        if let Some(val) = vars.get("error_backoff") {
            template.error_backoff = parse_secs("error_backoff", val)?;
        }

        urls.into_iter()
            .map(|url| {
                let config = Self {
                    url,
                    ..template.clone()
                };
                config.validate()?;
                Ok(config)
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Missing("url"));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                option: "url",
                reason: format!("'{}' must use the http or https scheme", self.url),
            });
        }
        if self.response_object_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                option: "response_object_name",
                reason: "cannot be empty".to_string(),
            });
        }
        if !(100..=599).contains(&self.no_messages_response_code) {
            return Err(ConfigError::Invalid {
                option: "no_messages_response_code",
                reason: format!("{} is not an HTTP status code", self.no_messages_response_code),
            });
        }
        if self.no_messages_response_code == 200 {
            return Err(ConfigError::Invalid {
                option: "no_messages_response_code",
                reason: "200 is reserved for responses carrying records".to_string(),
            });
        }
        if self.user.is_some() != self.password.is_some() {
            return Err(ConfigError::Invalid {
                option: "user",
                reason: "user and password must be set together".to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                option: "queue_capacity",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            reconnect: self.reconnect_backoff,
            error: self.error_backoff,
        }
    }
}

fn parse_bool(val: &str) -> bool {
    matches!(
        val.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn parse_secs(option: &'static str, val: &str) -> Result<Duration, ConfigError> {
    val.trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| ConfigError::Invalid {
            option,
            reason: format!("'{val}' is not a non-negative number of seconds"),
        })
}

/// Parses `key:value` pairs separated by commas, the same way `DD_TAGS` is read.
fn parse_pairs(val: &str) -> BTreeMap<String, String> {
    val.split(',')
        .filter_map(|kv| {
            let (k, v) = kv.split_once(':')?;
            let k = k.trim();
            (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
        })
        .collect()
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = PollerConfig::new("http://localhost:8080/events");
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.response_object_name, "http_response");
        assert!(!config.include_response_headers);
        assert!(config.include_response_code);
        assert!(config.include_http_request_time);
        assert_eq!(config.no_messages_response_code, 204);
        assert_eq!(config.codec, Codec::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_url() {
        let err = PollerConfig::from_env_iter(vars(&[("HTTP_POLLER_INTERVAL", "5")]))
            .expect_err("url is required");
        assert!(matches!(err, ConfigError::Missing("url")));
    }

    #[test]
    fn test_from_env_overrides() {
        let configs = PollerConfig::from_env_iter(vars(&[
            ("HTTP_POLLER_URL", "http://a:1/x?y=1, https://b/z"),
            ("HTTP_POLLER_INTERVAL", "2.5"),
            ("HTTP_POLLER_INCLUDE_RESPONSE_HEADERS", "true"),
            ("HTTP_POLLER_INCLUDE_HTTP_REQUEST_TIME", "false"),
            ("HTTP_POLLER_NO_MESSAGES_RESPONSE_CODE", "404"),
            ("HTTP_POLLER_CODEC", "json_lines"),
            ("HTTP_POLLER_TAGS", "a, b,,"),
            ("HTTP_POLLER_ADD_FIELD", "env:prod,team: core"),
            ("HTTP_POLLER_HEADERS", "Accept:application/json"),
            ("UNRELATED", "ignored"),
        ]))
        .expect("valid config");

        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].url, "http://a:1/x?y=1");
        assert_eq!(configs[1].url, "https://b/z");
        for config in &configs {
            assert_eq!(config.interval, Duration::from_millis(2500));
            assert!(config.include_response_headers);
            assert!(!config.include_http_request_time);
            assert_eq!(config.no_messages_response_code, 404);
            assert_eq!(config.codec, Codec::JsonLines);
            assert_eq!(config.tags, vec!["a".to_string(), "b".to_string()]);
            assert_eq!(config.add_field.get("team").map(String::as_str), Some("core"));
            assert_eq!(
                config.headers.get("Accept").map(String::as_str),
                Some("application/json")
            );
        }
    }

    #[test]
    fn test_invalid_interval() {
        let err = PollerConfig::from_env_iter(vars(&[
            ("HTTP_POLLER_URL", "http://localhost"),
            ("HTTP_POLLER_INTERVAL", "-1"),
        ]))
        .expect_err("negative interval");
        assert!(matches!(err, ConfigError::Invalid { option: "interval", .. }));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_scheme = PollerConfig::new("ftp://localhost/file");
        assert!(bad_scheme.validate().is_err());

        let user_only = PollerConfig {
            user: Some("me".to_string()),
            ..PollerConfig::new("http://localhost")
        };
        assert!(user_only.validate().is_err());

        let reserved_code = PollerConfig {
            no_messages_response_code: 200,
            ..PollerConfig::new("http://localhost")
        };
        assert!(reserved_code.validate().is_err());

        let empty_name = PollerConfig {
            response_object_name: " ".to_string(),
            ..PollerConfig::new("http://localhost")
        };
        assert!(empty_name.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: PollerConfig = serde_json::from_value(serde_json::json!({
            "url": "http://localhost:9000/poll",
            "interval": 0.5,
            "type": "poll",
            "codec": "plain"
        }))
        .expect("deserializes");
        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.event_type.as_deref(), Some("poll"));
        assert_eq!(config.codec, Codec::Plain);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_proxy_falls_back_to_https_proxy() {
        env::set_var("HTTPS_PROXY", "http://proxy.internal:3128");
        let configs = PollerConfig::from_env_iter(vars(&[("HTTP_POLLER_URL", "http://localhost")]));
        let explicit = PollerConfig::from_env_iter(vars(&[
            ("HTTP_POLLER_URL", "http://localhost"),
            ("HTTP_POLLER_PROXY", "http://other:8080"),
        ]));
        env::remove_var("HTTPS_PROXY");

        assert_eq!(
            configs.expect("valid config")[0].proxy.as_deref(),
            Some("http://proxy.internal:3128")
        );
        assert_eq!(
            explicit.expect("valid config")[0].proxy.as_deref(),
            Some("http://other:8080")
        );
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        env::set_var("HTTP_POLLER_URL", "http://localhost:9000/poll");
        env::set_var("HTTP_POLLER_QUEUE_CAPACITY", "5");
        let configs = PollerConfig::from_env();
        env::remove_var("HTTP_POLLER_URL");
        env::remove_var("HTTP_POLLER_QUEUE_CAPACITY");

        let configs = configs.expect("valid config");
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].queue_capacity, 5);
    }
}
