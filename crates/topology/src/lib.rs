//! Cluster-topology cache and change notifier.
//!
//! A process keeps one [`cache::TopologyCache`] per cluster it talks to,
//! acquired through a refcounted [`cache::CacheRegistry`]. The cache holds
//! lock-free-read snapshots of cluster membership, node services, the bucket
//! catalog, and per-bucket collection manifests, kept fresh by the streaming
//! [`notifier::Notifier`] and by coalesced on-demand refresh.

pub mod cache;
pub mod events;
pub mod fetch;
pub mod model;
pub mod notifier;
pub mod nodes;
pub mod retry;
pub mod stream;

mod buckets;
pub use buckets::{BucketInfo, CollectionInfo};
pub use cache::{CacheHandle, CacheRegistry, TopologyCache};
pub use nodes::NodesInfo;
pub use notifier::{Notification, Notifier};

use std::time::Duration;

/// Supplies basic credentials for management-plane requests. Implementations
/// may rotate credentials; each observer restart re-reads them.
pub trait CredentialsProvider: Send + Sync + 'static {
    fn credentials(&self) -> (String, String);
}

/// A fixed username/password pair.
pub struct StaticCredentials(pub String, pub String);

impl CredentialsProvider for StaticCredentials {
    fn credentials(&self) -> (String, String) {
        (self.0.clone(), self.1.clone())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Attempts per management fetch before surfacing the error.
    pub fetch_retries: u32,
    /// Initial backoff between fetch attempts.
    pub fetch_backoff: Duration,
    /// Backoff multiplier between fetch attempts.
    pub fetch_backoff_factor: u32,
    /// Sleep between observer restarts after a stream drop.
    pub observer_restart: Duration,
    /// Stream restarts attempted per outer observer retry.
    pub observer_restart_attempts: u32,
    /// Budget for delivering one notification to one consumer.
    pub notify_timeout: Duration,
    /// Period of the staleness ticker.
    pub tick_interval: Duration,
    /// Holder age beyond which the ticker forces a refresh.
    pub stale_threshold: Duration,
    /// Registered force-fetch waiters, process-wide.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fetch_retries: 5,
            fetch_backoff: Duration::from_millis(500),
            fetch_backoff_factor: 2,
            observer_restart: Duration::from_millis(2),
            observer_restart_attempts: 300,
            notify_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(300),
            event_capacity: 1024,
        }
    }
}

impl Config {
    /// Bound on a force-fetch waiter: the full fetch retry budget.
    pub fn event_wait_timeout(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut step = self.fetch_backoff;
        for _ in 0..self.fetch_retries {
            total += step;
            step *= self.fetch_backoff_factor;
        }
        // Floor for configurations with near-zero backoff.
        total.max(Duration::from_secs(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid cluster URL '{0}'")]
    InvalidUrl(String),
    #[error("management request failed")]
    Http(#[from] reqwest::Error),
    #[error("management endpoint {endpoint} returned {status}")]
    HttpStatus {
        endpoint: String,
        status: reqwest::StatusCode,
    },
    #[error("failed to decode management JSON")]
    Json(#[from] serde_json::Error),
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },
    #[error("topology validation failed: {0}")]
    Validation(String),
    #[error("invalid version string '{0}'")]
    InvalidVersion(String),
    #[error("timed out waiting for a topology event")]
    EventWaitTimeout,
    #[error("event registry is at capacity")]
    EventCapacity,
    #[error("cache is shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }
}
