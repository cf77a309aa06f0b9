//! Process settings read from environment variables.
//!
//! | variable                  | default                          |
//! |---------------------------|----------------------------------|
//! | `DATABASE_URL`            | unset: in-memory ledger          |
//! | `REDIS_URL`               | unset: in-memory broker          |
//! | `HAP_STREAM_PREFIX`       | `hap:`                           |
//! | `HAP_TOPICS`              | the seven lifecycle topics       |
//! | `HAP_CONSUMER_GROUP`      | `hap-consumer-group`             |
//! | `HAP_CONSUMER_NAME`       | `hap-<uuid>`                     |
//! | `HAP_PUBLISH_TIMEOUT_MS`  | `2000`                           |
//! | `HAP_CONSUMER_BACKOFF_MS` | `500`                            |

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use hap_events::{TopicError, TopicSet};

use crate::messaging::ConsumerConfig;
use crate::messaging::consumer::{DEFAULT_BACKOFF, DEFAULT_CONSUMER_GROUP};
use crate::messaging::publisher::DEFAULT_PUBLISH_TIMEOUT;

pub const DEFAULT_STREAM_PREFIX: &str = "hap:";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a whole number of milliseconds, got {value:?}")]
    InvalidDuration { var: &'static str, value: String },

    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },

    #[error("HAP_TOPICS is invalid: {0}")]
    Topics(#[from] TopicError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub stream_prefix: String,
    pub topics: TopicSet,
    pub consumer_group: String,
    pub consumer_name: String,
    pub publish_timeout: Duration,
    pub consumer_backoff: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build settings from an arbitrary variable source. Blank values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let topics = match get("HAP_TOPICS") {
            Some(raw) => TopicSet::parse_list(&raw)?,
            None => TopicSet::defaults(),
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            stream_prefix: get("HAP_STREAM_PREFIX").unwrap_or_else(|| DEFAULT_STREAM_PREFIX.to_string()),
            topics,
            consumer_group: get("HAP_CONSUMER_GROUP").unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            consumer_name: get("HAP_CONSUMER_NAME").unwrap_or_else(|| format!("hap-{}", Uuid::now_v7())),
            publish_timeout: millis("HAP_PUBLISH_TIMEOUT_MS", get("HAP_PUBLISH_TIMEOUT_MS"), DEFAULT_PUBLISH_TIMEOUT)?,
            consumer_backoff: millis("HAP_CONSUMER_BACKOFF_MS", get("HAP_CONSUMER_BACKOFF_MS"), DEFAULT_BACKOFF)?,
        })
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            group_id: self.consumer_group.clone(),
            consumer_name: self.consumer_name.clone(),
            backoff: self.consumer_backoff,
        }
    }
}

fn millis(var: &'static str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.parse::<u64>() {
        Ok(0) => Err(ConfigError::Zero { var }),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(_) => Err(ConfigError::InvalidDuration { var, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_use_in_memory_backends() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.database_url, None);
        assert_eq!(s.redis_url, None);
        assert_eq!(s.stream_prefix, "hap:");
        assert_eq!(s.topics, TopicSet::defaults());
        assert_eq!(s.consumer_group, "hap-consumer-group");
        assert!(s.consumer_name.starts_with("hap-"));
        assert_eq!(s.publish_timeout, Duration::from_secs(2));
        assert_eq!(s.consumer_backoff, Duration::from_millis(500));
    }

    #[test]
    fn reads_overrides() {
        let s = settings(&[
            ("DATABASE_URL", "postgres://localhost/hap"),
            ("REDIS_URL", " redis://localhost:6379 "),
            ("HAP_TOPICS", "payments.recorded, appointments.created"),
            ("HAP_CONSUMER_NAME", "worker-1"),
            ("HAP_PUBLISH_TIMEOUT_MS", "250"),
        ])
        .unwrap();

        assert_eq!(s.database_url.as_deref(), Some("postgres://localhost/hap"));
        assert_eq!(s.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(s.topics.len(), 2);
        assert!(s.topics.contains("appointments.created"));
        assert_eq!(s.consumer_config().consumer_name, "worker-1");
        assert_eq!(s.publish_timeout, Duration::from_millis(250));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let s = settings(&[("DATABASE_URL", "  "), ("HAP_CONSUMER_GROUP", "")]).unwrap();
        assert_eq!(s.database_url, None);
        assert_eq!(s.consumer_group, "hap-consumer-group");
    }

    #[test]
    fn rejects_bad_durations() {
        assert_eq!(
            settings(&[("HAP_CONSUMER_BACKOFF_MS", "soon")]).unwrap_err(),
            ConfigError::InvalidDuration {
                var: "HAP_CONSUMER_BACKOFF_MS",
                value: "soon".into()
            }
        );
        assert_eq!(
            settings(&[("HAP_PUBLISH_TIMEOUT_MS", "0")]).unwrap_err(),
            ConfigError::Zero {
                var: "HAP_PUBLISH_TIMEOUT_MS"
            }
        );
    }

    #[test]
    fn rejects_bad_topic_names() {
        assert!(matches!(
            settings(&[("HAP_TOPICS", "payments recorded")]),
            Err(ConfigError::Topics(_))
        ));
    }
}
