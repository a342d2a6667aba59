use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::{backoff::Backoff, error::Error, topic};

const ENV_PREFIX: &str = "COURIER_";

/// Storage configuration for a [`crate::service::Service`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// SQLite database file. When absent the service runs on a private
    /// in-memory database.
    pub db_path: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        Ok(envy::prefixed(ENV_PREFIX).from_env::<Self>()?)
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref()
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Everything a consumer needs to run. There are no defaults: every field
/// has to be given explicitly, either through the builder or through
/// `COURIER_*` environment variables (durations in milliseconds).
#[derive(Clone, Debug, Deserialize, bon::Builder)]
pub struct ConsumerConfig {
    /// Topic whose messages this consumer handles
    #[builder(into)]
    pub topic: String,
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Deliveries before a message is dead-lettered
    pub max_attempts: u32,
    #[serde(rename = "backoff_base_ms", deserialize_with = "millis")]
    pub backoff_base: Duration,
    #[serde(rename = "backoff_cap_ms", deserialize_with = "millis")]
    pub backoff_cap: Duration,
    /// Share of each retry delay that may be randomly removed, `0.0..=1.0`
    pub backoff_jitter: f64,
    /// Delay between polls that found nothing to claim
    #[serde(rename = "poll_interval_ms", deserialize_with = "millis")]
    pub poll_interval: Duration,
    /// Upper bound on messages claimed per poll
    pub batch_size: u32,
    /// How long a claim may stay in flight before it is considered abandoned
    #[serde(rename = "lease_timeout_ms", deserialize_with = "millis")]
    pub lease_timeout: Duration,
    #[serde(rename = "sweep_interval_ms", deserialize_with = "millis")]
    pub sweep_interval: Duration,
}

impl ConsumerConfig {
    pub fn load() -> Result<Self, Error> {
        Ok(envy::prefixed(ENV_PREFIX).from_env::<Self>()?)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_cap).with_jitter(self.backoff_jitter)
    }

    pub fn validate(&self) -> Result<(), Error> {
        topic::validate_topic(&self.topic)?;

        if self.concurrency == 0 {
            return Err(Error::invalid_config("concurrency must be at least 1"));
        }

        if self.max_attempts == 0 {
            return Err(Error::invalid_config("max_attempts must be at least 1"));
        }

        if self.batch_size == 0 {
            return Err(Error::invalid_config("batch_size must be at least 1"));
        }

        for (name, value) in [
            ("backoff_base", self.backoff_base),
            ("poll_interval", self.poll_interval),
            ("lease_timeout", self.lease_timeout),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(Error::invalid_config(format!("{name} must be non-zero")));
            }
        }

        if self.backoff_cap < self.backoff_base {
            return Err(Error::invalid_config(
                "backoff_cap must not be smaller than backoff_base",
            ));
        }

        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(Error::invalid_config("backoff_jitter must be within 0.0..=1.0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConsumerConfig {
        ConsumerConfig::builder()
            .topic("user_actions")
            .concurrency(5)
            .max_attempts(5)
            .backoff_base(Duration::from_secs(1))
            .backoff_cap(Duration::from_secs(30))
            .backoff_jitter(0.1)
            .poll_interval(Duration::from_millis(100))
            .batch_size(16)
            .lease_timeout(Duration::from_secs(60))
            .sweep_interval(Duration::from_secs(10))
            .build()
    }

    #[test]
    fn test_valid_config() {
        let config = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.backoff().delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_rejects_zero_values() {
        let mut c = config();
        c.concurrency = 0;
        assert!(matches!(c.validate(), Err(Error::InvalidConfig { .. })));

        let mut c = config();
        c.max_attempts = 0;
        assert!(matches!(c.validate(), Err(Error::InvalidConfig { .. })));

        let mut c = config();
        c.batch_size = 0;
        assert!(matches!(c.validate(), Err(Error::InvalidConfig { .. })));

        let mut c = config();
        c.lease_timeout = Duration::ZERO;
        assert!(matches!(c.validate(), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut c = config();
        c.backoff_cap = Duration::from_millis(500);
        assert!(matches!(c.validate(), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_rejects_bad_jitter() {
        let mut c = config();
        c.backoff_jitter = 1.5;
        assert!(matches!(c.validate(), Err(Error::InvalidConfig { .. })));

        c.backoff_jitter = f64::NAN;
        assert!(matches!(c.validate(), Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_rejects_bad_topic() {
        let mut c = config();
        c.topic = "user actions".to_owned();
        assert!(matches!(c.validate(), Err(Error::Validation { .. })));
    }

    #[test]
    fn test_load_from_env() {
        let vars = [
            ("COURIER_TOPIC", "user_actions"),
            ("COURIER_CONCURRENCY", "5"),
            ("COURIER_MAX_ATTEMPTS", "5"),
            ("COURIER_BACKOFF_BASE_MS", "1000"),
            ("COURIER_BACKOFF_CAP_MS", "30000"),
            ("COURIER_BACKOFF_JITTER", "0.1"),
            ("COURIER_POLL_INTERVAL_MS", "100"),
            ("COURIER_BATCH_SIZE", "16"),
            ("COURIER_LEASE_TIMEOUT_MS", "60000"),
            ("COURIER_SWEEP_INTERVAL_MS", "10000"),
        ]
        .map(|(k, v)| (k.to_owned(), v.to_owned()));

        let config: ConsumerConfig = envy::prefixed(ENV_PREFIX).from_iter(vars).unwrap();

        assert_eq!(config.topic, "user_actions");
        assert_eq!(config.backoff_cap, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_env_is_an_error() {
        let vars = [("COURIER_TOPIC".to_owned(), "user_actions".to_owned())];
        assert!(envy::prefixed(ENV_PREFIX)
            .from_iter::<_, ConsumerConfig>(vars)
            .is_err());
    }
}
