use core_config::{env_or_default, env_parse, env_required, ConfigError, FromEnv};

/// Redis queue layout and connection settings
///
/// Keys for queue `emails` with prefix `queues`:
///
/// | Key                     | Type       | Contents                       |
/// |-------------------------|------------|--------------------------------|
/// | `queues:emails`         | stream     | ready jobs, priority 0         |
/// | `queues:emails:p{n}`    | stream     | ready jobs, priority `n`       |
/// | `queues:emails:delayed` | sorted set | released/delayed jobs by due ms|
/// | `queues:emails:dlq`     | stream     | deleted jobs                   |
/// | `queues:restart`        | string     | last restart broadcast         |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub url: String,
    pub consumer_group: String,
    pub key_prefix: String,
    /// Keep deleted jobs in a dead-letter stream
    pub dead_letter: bool,
    /// Approximate cap on the dead-letter stream (MAXLEN ~)
    pub dead_letter_max_length: i64,
    /// Highest priority producers route to (0 = single stream)
    pub max_priority: u8,
}

impl RedisSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            consumer_group: "queue_workers".to_string(),
            key_prefix: "queues".to_string(),
            dead_letter: true,
            dead_letter_max_length: 10_000,
            max_priority: 0,
        }
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter = enabled;
        self
    }

    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = max_priority;
        self
    }

    /// Stream holding ready jobs of `priority` on `queue`
    pub fn stream_key(&self, queue: &str, priority: u8) -> String {
        match priority {
            0 => format!("{}:{}", self.key_prefix, queue),
            n => format!("{}:{}:p{}", self.key_prefix, queue, n),
        }
    }

    pub fn delayed_key(&self, queue: &str) -> String {
        format!("{}:{}:delayed", self.key_prefix, queue)
    }

    pub fn dead_letter_key(&self, queue: &str) -> String {
        format!("{}:{}:dlq", self.key_prefix, queue)
    }

    pub fn restart_key(&self) -> String {
        format!("{}:restart", self.key_prefix)
    }
}

impl FromEnv for RedisSettings {
    /// Requires REDIS_URL; queue layout variables fall back to defaults
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_required("REDIS_URL")?,
            consumer_group: env_or_default("QUEUE_CONSUMER_GROUP", "queue_workers"),
            key_prefix: env_or_default("QUEUE_KEY_PREFIX", "queues"),
            dead_letter: env_parse("QUEUE_DEAD_LETTER", true)?,
            dead_letter_max_length: env_parse("QUEUE_DEAD_LETTER_MAX_LENGTH", 10_000)?,
            max_priority: env_parse("QUEUE_MAX_PRIORITY", 0)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let settings = RedisSettings::new("redis://localhost:6379").with_key_prefix("jobs");
        assert_eq!(settings.stream_key("emails", 0), "jobs:emails");
        assert_eq!(settings.stream_key("emails", 3), "jobs:emails:p3");
        assert_eq!(settings.delayed_key("emails"), "jobs:emails:delayed");
        assert_eq!(settings.dead_letter_key("emails"), "jobs:emails:dlq");
        assert_eq!(settings.restart_key(), "jobs:restart");
    }

    #[test]
    fn test_from_env_defaults() {
        temp_env::with_vars(
            [
                ("REDIS_URL", Some("redis://cache:6379")),
                ("QUEUE_CONSUMER_GROUP", None),
                ("QUEUE_KEY_PREFIX", None),
                ("QUEUE_DEAD_LETTER", None),
                ("QUEUE_DEAD_LETTER_MAX_LENGTH", None),
                ("QUEUE_MAX_PRIORITY", None),
            ],
            || {
                let settings = RedisSettings::from_env().unwrap();
                assert_eq!(settings, RedisSettings::new("redis://cache:6379"));
            },
        );
    }

    #[test]
    fn test_from_env_overrides() {
        temp_env::with_vars(
            [
                ("REDIS_URL", Some("redis://cache:6379")),
                ("QUEUE_CONSUMER_GROUP", Some("billing")),
                ("QUEUE_DEAD_LETTER", Some("false")),
                ("QUEUE_MAX_PRIORITY", Some("5")),
            ],
            || {
                let settings = RedisSettings::from_env().unwrap();
                assert_eq!(settings.consumer_group, "billing");
                assert!(!settings.dead_letter);
                assert_eq!(settings.max_priority, 5);
            },
        );
    }

    #[test]
    fn test_from_env_missing_url() {
        temp_env::with_var_unset("REDIS_URL", || {
            let err = RedisSettings::from_env().unwrap_err();
            assert!(err.to_string().contains("REDIS_URL"));
        });
    }

    #[test]
    fn test_from_env_invalid_priority() {
        temp_env::with_vars(
            [
                ("REDIS_URL", Some("redis://cache:6379")),
                ("QUEUE_MAX_PRIORITY", Some("high")),
            ],
            || {
                let err = RedisSettings::from_env().unwrap_err();
                assert!(err.to_string().contains("QUEUE_MAX_PRIORITY"));
            },
        );
    }
}
