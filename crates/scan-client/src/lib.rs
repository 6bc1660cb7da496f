//! Scan client for the secondary-index service: per-endpoint connection
//! pools speaking the framed scan protocol, a scatter-gather request broker
//! with replica retry, the metadata bridge that plans replica placement, and
//! the top-level client facade.

pub mod bridge;
pub mod broker;
pub mod client;
pub mod conn;
pub mod facade;
pub mod pool;

pub use bridge::{HttpBridge, IndexState, MetadataBridge};
pub use broker::RequestBroker;
pub use client::ScanClient;
pub use facade::{ClientRegistry, IndexClient};

use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("request deadline elapsed")]
    Timeout,
    #[error("scan was cancelled")]
    Cancelled,
    #[error("connection pool for {0} is closed")]
    PoolClosed(String),
    #[error("no connection available for {0} within the wait budget")]
    PoolExhausted(String),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error(transparent)]
    Frame(#[from] scan_proto::Error),
    #[error("indexer error: {0}")]
    Server(String),
    #[error("admin request failed")]
    Http(#[from] reqwest::Error),
    #[error("admin endpoint {endpoint} returned {status}")]
    HttpStatus {
        endpoint: String,
        status: reqwest::StatusCode,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Topology(#[from] topology::Error),
    #[error("index definition {0} not found")]
    IndexNotFound(u64),
    #[error("no scan plan covers index definition {0}")]
    NoPlan(u64),
    #[error("invalid consistency: {0}")]
    InvalidConsistency(&'static str),
    #[error("{0}")]
    Scatter(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error marks its endpoint as gone: the broker excludes the
    /// node and retries against another replica, and the pool discards the
    /// connection.
    pub fn is_gone(&self) -> bool {
        match self {
            Error::Io(err) | Error::Frame(scan_proto::Error::Io(err)) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            Error::Timeout | Error::Cancelled => true,
            Error::PoolExhausted(_) => false,
            _ => false,
        }
    }
}

/// Combine per-endpoint failures into one error, preserving the union of
/// distinct error strings and the endpoints that produced each.
pub(crate) fn combine_errors(failures: Vec<(String, Error)>) -> Error {
    let mut by_message: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (endpoint, err) in failures {
        by_message.entry(err.to_string()).or_default().push(endpoint);
    }
    let combined = by_message
        .into_iter()
        .map(|(message, mut endpoints)| {
            endpoints.sort();
            endpoints.dedup();
            format!("{message} from {}", endpoints.join(", "))
        })
        .collect::<Vec<_>>()
        .join("; ");
    Error::Scatter(combined)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Idle connections kept per endpoint.
    pub pool_size: usize,
    /// Connections allowed beyond the pool, closed rather than returned.
    pub pool_overflow: usize,
    /// Wait for a pooled connection before failing.
    pub avail_wait: Duration,
    pub connect_timeout: Duration,
    /// Deadline for writing one request frame.
    pub write_deadline: Duration,
    /// Deadline for reading each response frame.
    pub read_deadline: Duration,
    /// Maximum framed payload size.
    pub max_payload: usize,
    /// Replan-and-retry budget when an endpoint is gone.
    pub retry_scan_port: u32,
    /// Fixed wait between replan attempts.
    pub retry_wait: Duration,
    /// How long a cached session-consistency vector may be reused.
    pub vector_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: 8,
            pool_overflow: 8,
            avail_wait: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            write_deadline: Duration::from_secs(10),
            read_deadline: Duration::from_secs(120),
            max_payload: scan_proto::codec::DEFAULT_MAX_PAYLOAD,
            retry_scan_port: 2,
            retry_wait: Duration::from_millis(100),
            vector_window: Duration::from_millis(1250),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn gone_classification_covers_transport_failures() {
        use std::io::ErrorKind;

        for kind in [
            ErrorKind::TimedOut,
            ErrorKind::UnexpectedEof,
            ErrorKind::ConnectionReset,
            ErrorKind::BrokenPipe,
        ] {
            assert!(Error::Io(kind.into()).is_gone(), "{kind:?}");
        }
        assert!(Error::Timeout.is_gone());
        assert!(Error::Cancelled.is_gone());

        assert!(!Error::Server("bad scan".into()).is_gone());
        assert!(!Error::Protocol("unexpected frame").is_gone());
        assert!(!Error::PoolExhausted("e".into()).is_gone());
    }

    #[test]
    fn combined_errors_union_distinct_messages() {
        let err = combine_errors(vec![
            ("n1:9101".into(), Error::Server("stale timestamp".into())),
            ("n2:9101".into(), Error::Server("stale timestamp".into())),
            ("n3:9101".into(), Error::Protocol("unexpected frame")),
        ]);
        assert_eq!(
            err.to_string(),
            "indexer error: stale timestamp from n1:9101, n2:9101; \
             protocol violation: unexpected frame from n3:9101"
        );
    }
}
