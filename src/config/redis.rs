//! Redis settings for the stream-log adapter

use serde::Deserialize;
use std::time::Duration;

use super::error::ValidationError;

/// Where the stream-log adapter keeps its streams.
///
/// All streams share one multiplexed connection, so there is nothing to
/// size beyond the connect timeout.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// `redis://`, `rediss://` or `redis+unix://` URL
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl RedisConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Only called when the stream-log adapter is selected.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.url.is_empty() {
            return Err(ValidationError::MissingRequired("EVENTLINE__REDIS__URL"));
        }
        if redis::parse_redis_url(&self.url).is_none() {
            return Err(ValidationError::InvalidRedisUrl);
        }
        if self.connect_timeout_secs == 0 {
            return Err(ValidationError::MustBePositive("redis.connect_timeout_secs"));
        }
        Ok(())
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    5
}
