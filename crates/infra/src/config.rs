//! Runtime configuration.
//!
//! Every setting has a default; environment variables (`BIDBUS_*`) override
//! them. Durations are given in milliseconds.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use bidbus_core::ConsumerId;
use bidbus_observability::LogFormat;

use crate::backoff::Backoff;
use crate::fault_handler::{FAULT_CONSUMER, FAULT_QUEUE};
use crate::search::{SEARCH_CONSUMER, SEARCH_QUEUE};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Outbox relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Name written into `claimed_by`; also the thread name.
    pub relay_id: String,
    /// Sleep between passes that found less than a full batch.
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// How long a claim is exclusive.
    pub lease: Duration,
    pub publish_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_id: format!("relay-{}", std::process::id()),
            poll_interval: Duration::from_secs(10),
            batch_size: 100,
            lease: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(5),
            backoff: Backoff::default(),
        }
    }
}

impl RelayConfig {
    pub fn with_relay_id(mut self, relay_id: impl Into<String>) -> Self {
        self.relay_id = relay_id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Consumer pool settings for one queue.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub consumer_id: ConsumerId,
    pub queue: String,
    /// Partition workers; one aggregate always maps to the same worker.
    pub workers: usize,
    /// How long the intake thread blocks on the transport per poll.
    pub receive_timeout: Duration,
    /// In-place retries of a transiently failing message before it is nacked.
    pub retry_limit: u32,
    pub retry_interval: Duration,
    /// Deadline for publishing fault messages.
    pub publish_timeout: Duration,
}

impl ConsumerConfig {
    pub fn new(consumer_id: ConsumerId, queue: impl Into<String>) -> Self {
        Self {
            consumer_id,
            queue: queue.into(),
            workers: 4,
            receive_timeout: Duration::from_millis(250),
            retry_limit: 5,
            retry_interval: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_retry(mut self, limit: u32, interval: Duration) -> Self {
        self.retry_limit = limit;
        self.retry_interval = interval;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Unacknowledged deliveries are redelivered after this long.
    pub visibility_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything a single-process node needs.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub relay: RelayConfig,
    pub search: ConsumerConfig,
    pub faults: ConsumerConfig,
    pub transport: TransportConfig,
    pub log_format: LogFormat,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RelayConfig::default();
        let relay = RelayConfig {
            relay_id: lookup("BIDBUS_RELAY_ID").unwrap_or(defaults.relay_id),
            poll_interval: millis(&lookup, "BIDBUS_RELAY_POLL_INTERVAL_MS", defaults.poll_interval)?,
            batch_size: positive(&lookup, "BIDBUS_RELAY_BATCH_SIZE", defaults.batch_size)?,
            lease: millis(&lookup, "BIDBUS_RELAY_LEASE_MS", defaults.lease)?,
            publish_timeout: millis(&lookup, "BIDBUS_PUBLISH_TIMEOUT_MS", defaults.publish_timeout)?,
            backoff: Backoff::exponential(
                millis(&lookup, "BIDBUS_BACKOFF_BASE_MS", defaults.backoff.base_delay)?,
                millis(&lookup, "BIDBUS_BACKOFF_MAX_MS", defaults.backoff.max_delay)?,
            ),
        };
        if relay.backoff.base_delay > relay.backoff.max_delay {
            return Err(ConfigError::invalid(
                "BIDBUS_BACKOFF_BASE_MS",
                relay.backoff.base_delay.as_millis().to_string(),
                "must not exceed BIDBUS_BACKOFF_MAX_MS",
            ));
        }

        let consumer = |id: &str, queue: &str| -> Result<ConsumerConfig, ConfigError> {
            let consumer_id =
                ConsumerId::new(id).map_err(|e| ConfigError::invalid("consumer id", id, e.to_string()))?;
            let base = ConsumerConfig::new(consumer_id, queue);
            Ok(ConsumerConfig {
                workers: positive(&lookup, "BIDBUS_CONSUMER_WORKERS", base.workers)?,
                retry_limit: parse(&lookup, "BIDBUS_CONSUMER_RETRY_LIMIT", base.retry_limit)?,
                retry_interval: millis(&lookup, "BIDBUS_CONSUMER_RETRY_INTERVAL_MS", base.retry_interval)?,
                publish_timeout: relay.publish_timeout,
                ..base
            })
        };
        let search = consumer(SEARCH_CONSUMER, SEARCH_QUEUE)?;
        let faults = consumer(FAULT_CONSUMER, FAULT_QUEUE)?;

        let transport = TransportConfig {
            visibility_timeout: millis(
                &lookup,
                "BIDBUS_VISIBILITY_TIMEOUT_MS",
                TransportConfig::default().visibility_timeout,
            )?,
        };

        Ok(Self {
            relay,
            search,
            faults,
            transport,
            log_format: parse(&lookup, "BIDBUS_LOG_FORMAT", LogFormat::default())?,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, raw.clone(), e.to_string())),
    }
}

fn positive<F>(lookup: &F, key: &str, default: usize) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse(lookup, key, default)?;
    if value == 0 {
        return Err(ConfigError::invalid(key, "0", "must be positive"));
    }
    Ok(value)
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Ok(Duration::from_millis(parse(lookup, key, default_ms)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = NodeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.relay.poll_interval, Duration::from_secs(10));
        assert_eq!(config.relay.backoff.base_delay, Duration::from_secs(5));
        assert_eq!(config.search.queue, SEARCH_QUEUE);
        assert_eq!(config.faults.consumer_id.as_str(), FAULT_CONSUMER);
        assert_eq!(config.transport.visibility_timeout, Duration::from_secs(30));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn log_format_is_read_with_the_rest() {
        let config = NodeConfig::from_lookup(lookup(&[("BIDBUS_LOG_FORMAT", "pretty")])).unwrap();
        assert_eq!(config.log_format, LogFormat::Pretty);

        let err = NodeConfig::from_lookup(lookup(&[("BIDBUS_LOG_FORMAT", "xml")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "BIDBUS_LOG_FORMAT"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("BIDBUS_RELAY_ID", "relay-a"),
            ("BIDBUS_RELAY_POLL_INTERVAL_MS", "250"),
            ("BIDBUS_CONSUMER_WORKERS", "2"),
            ("BIDBUS_BACKOFF_MAX_MS", "60000"),
        ]))
        .unwrap();
        assert_eq!(config.relay.relay_id, "relay-a");
        assert_eq!(config.relay.poll_interval, Duration::from_millis(250));
        assert_eq!(config.search.workers, 2);
        assert_eq!(config.faults.workers, 2);
        assert_eq!(config.relay.backoff.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn malformed_number_is_rejected_with_key() {
        let err = NodeConfig::from_lookup(lookup(&[("BIDBUS_RELAY_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "BIDBUS_RELAY_BATCH_SIZE"));
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(NodeConfig::from_lookup(lookup(&[("BIDBUS_CONSUMER_WORKERS", "0")])).is_err());
    }

    #[test]
    fn base_above_cap_is_rejected() {
        let err = NodeConfig::from_lookup(lookup(&[
            ("BIDBUS_BACKOFF_BASE_MS", "10000"),
            ("BIDBUS_BACKOFF_MAX_MS", "1000"),
        ]));
        assert!(err.is_err());
    }
}
