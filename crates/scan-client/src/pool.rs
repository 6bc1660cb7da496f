//! Bounded per-endpoint pool of framed connections.
//!
//! `poolSize` idle connections may be parked; a further `poolOverflow`
//! connections may exist in flight but are closed on return instead of
//! parked. When every slot is in use, acquisition waits up to the
//! availability budget and then fails.

use crate::conn::Conn;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: String,
    size: usize,
    overflow: usize,
    avail_wait: Duration,
    connect_timeout: Duration,
    max_payload: usize,
    state: Mutex<State>,
    available: Notify,
}

#[derive(Default)]
struct State {
    idle: Vec<Conn>,
    /// Connections alive: idle plus checked out.
    live: usize,
    closed: bool,
}

impl Pool {
    pub fn new(endpoint: String, config: &crate::Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                size: config.pool_size,
                overflow: config.pool_overflow,
                avail_wait: config.avail_wait,
                connect_timeout: config.connect_timeout,
                max_payload: config.max_payload,
                state: Mutex::new(State::default()),
                available: Notify::new(),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Acquire a connection: an idle one immediately, a new one while under
    /// `size + overflow`, else wait for a return up to the availability
    /// budget.
    pub async fn get(&self) -> crate::Result<Conn> {
        let deadline = tokio::time::Instant::now() + self.inner.avail_wait;

        loop {
            let dial = {
                let mut state = self.inner.state.lock().unwrap();
                if state.closed {
                    return Err(crate::Error::PoolClosed(self.inner.endpoint.clone()));
                }
                if let Some(conn) = state.idle.pop() {
                    return Ok(conn);
                }
                if state.live < self.inner.size + self.inner.overflow {
                    state.live += 1;
                    true
                } else {
                    false
                }
            };

            if dial {
                match Conn::connect(
                    &self.inner.endpoint,
                    self.inner.max_payload,
                    self.inner.connect_timeout,
                )
                .await
                {
                    Ok(conn) => return Ok(conn),
                    Err(err) => {
                        self.release_slot();
                        return Err(err);
                    }
                }
            }

            let notified = self.inner.available.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(crate::Error::PoolExhausted(self.inner.endpoint.clone()));
            }
        }
    }

    /// Return a connection. Healthy connections are parked while the pool
    /// has room; overflow or unhealthy connections are closed.
    pub fn put(&self, conn: Conn, healthy: bool) {
        let mut state = self.inner.state.lock().unwrap();
        if healthy && !state.closed && state.idle.len() < self.inner.size {
            state.idle.push(conn);
        } else {
            state.live -= 1;
        }
        drop(state);
        self.inner.available.notify_one();
    }

    /// Close the pool: parked connections drop, acquisitions fail.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        let parked = state.idle.len();
        state.live -= parked;
        state.idle.clear();
        drop(state);
        self.inner.available.notify_waiters();
    }

    fn release_slot(&self) {
        self.inner.state.lock().unwrap().live -= 1;
        self.inner.available.notify_one();
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        self.inner.state.lock().unwrap().live
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Accept connections and hold them open so pooled conns stay healthy.
    async fn server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                held.push(tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    while matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {}
                }));
            }
        });
        (endpoint, handle)
    }

    fn config(size: usize, overflow: usize, avail_wait: Duration) -> crate::Config {
        crate::Config {
            pool_size: size,
            pool_overflow: overflow,
            avail_wait,
            ..crate::Config::default()
        }
    }

    #[tokio::test]
    async fn healthy_returns_are_reused() {
        let (endpoint, server) = server().await;
        let pool = Pool::new(endpoint, &config(2, 0, Duration::from_millis(100)));

        let conn = pool.get().await.unwrap();
        pool.put(conn, true);
        assert_eq!(pool.live(), 1);

        // The parked connection is handed back out, not a new dial.
        let _conn = pool.get().await.unwrap();
        assert_eq!(pool.live(), 1);
        server.abort();
    }

    #[tokio::test]
    async fn unhealthy_returns_are_discarded() {
        let (endpoint, server) = server().await;
        let pool = Pool::new(endpoint, &config(2, 0, Duration::from_millis(100)));

        let conn = pool.get().await.unwrap();
        pool.put(conn, false);
        assert_eq!(pool.live(), 0);
        server.abort();
    }

    #[tokio::test]
    async fn exhausted_pool_waits_then_fails() {
        let (endpoint, server) = server().await;
        let pool = Pool::new(endpoint, &config(1, 0, Duration::from_millis(50)));

        let held = pool.get().await.unwrap();
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, crate::Error::PoolExhausted(_)));

        // A return wakes a waiter within its budget.
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.put(held, true);
        waiter.await.unwrap().unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn overflow_connections_are_closed_on_return() {
        let (endpoint, server) = server().await;
        let pool = Pool::new(endpoint, &config(1, 1, Duration::from_millis(100)));

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        assert_eq!(pool.live(), 2);

        // First return parks; second return exceeds the pool and closes.
        pool.put(a, true);
        pool.put(b, true);
        assert_eq!(pool.live(), 1);
        server.abort();
    }

    #[tokio::test]
    async fn closed_pools_refuse_acquisition() {
        let (endpoint, server) = server().await;
        let pool = Pool::new(endpoint, &config(1, 0, Duration::from_millis(50)));
        pool.close();
        assert!(matches!(
            pool.get().await,
            Err(crate::Error::PoolClosed(_))
        ));
        server.abort();
    }
}
