//! Services change notifier: one singleton per `(cluster URL, pool)`,
//! streaming the pool, node-services, and per-bucket endpoints and fanning
//! typed notifications out to consumers.

use crate::fetch::Fetcher;
use crate::model::{Pool, PoolServices, TerseBucket};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of one consumer's delivery channel.
const CONSUMER_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub enum Notification {
    /// The pool document changed: membership, bucket names.
    PoolChange(Arc<Pool>),
    /// The extended-services snapshot changed.
    ServiceChange(Arc<PoolServices>),
    /// A bucket's terse info changed (vbucket map, nodesExt, manifest UID).
    TerseBucketChange(Arc<TerseBucket>),
    /// A bucket's collection manifest advanced to `manifest_uid`.
    CollectionManifestChange { bucket: String, manifest_uid: u64 },
}

/// A subscription to the notifier. Dropping it cancels the subscription.
pub struct Consumer {
    pub rx: mpsc::Receiver<Notification>,
    id: u64,
    notifier: Weak<Inner>,
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(inner) = self.notifier.upgrade() {
            inner.remove_consumer(self.id);
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    inner: Arc<Inner>,
}

struct Inner {
    fetcher: Fetcher,
    config: crate::Config,
    http: reqwest::Client,
    consumers: Mutex<Vec<(u64, mpsc::Sender<Notification>)>>,
    next_consumer: AtomicU64,
    /// Buckets with a running observer task.
    buckets: Mutex<HashSet<String>>,
    cancel: CancellationToken,
    registry: Mutex<Option<(Weak<RegistryInner>, RegistryKey)>>,
}

impl Notifier {
    pub fn new(http: reqwest::Client, fetcher: Fetcher, config: crate::Config) -> Self {
        let inner = Arc::new(Inner {
            fetcher,
            config,
            http,
            consumers: Mutex::new(Vec::new()),
            next_consumer: AtomicU64::new(0),
            buckets: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
            registry: Mutex::new(None),
        });

        tokio::spawn(observe_pool(inner.clone()));
        tokio::spawn(observe_services(inner.clone()));

        Self { inner }
    }

    /// Subscribe to notifications. Delivery to this consumer is bounded by
    /// the notify timeout; a consumer that stays full past it is closed and
    /// removed without affecting others.
    pub fn new_consumer(&self) -> Consumer {
        let id = self.inner.next_consumer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        self.inner.consumers.lock().unwrap().push((id, tx));
        Consumer {
            rx,
            id,
            notifier: Arc::downgrade(&self.inner),
        }
    }

    /// Stop all observers, close every consumer channel, and deregister.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.consumers.lock().unwrap().clear();

        if let Some((registry, key)) = self.inner.registry.lock().unwrap().take() {
            if let Some(registry) = registry.upgrade() {
                registry.entries.lock().unwrap().remove(&key);
            }
        }
    }
}

impl Inner {
    fn remove_consumer(&self, id: u64) {
        self.consumers.lock().unwrap().retain(|(cid, _)| *cid != id);
    }

    /// Deliver to every consumer registered at this moment. Slow consumers
    /// are removed; their channel closes when the sender drops.
    async fn broadcast(&self, notification: Notification) {
        let consumers: Vec<_> = self.consumers.lock().unwrap().clone();

        let sends = consumers.iter().map(|(id, tx)| {
            let notification = notification.clone();
            async move {
                match tx
                    .send_timeout(notification, self.config.notify_timeout)
                    .await
                {
                    Ok(()) => None,
                    Err(_) => Some(*id),
                }
            }
        });

        for slow in futures::future::join_all(sends).await.into_iter().flatten() {
            tracing::warn!(consumer = slow, "dropping slow or closed notifier consumer");
            self.remove_consumer(slow);
        }
    }

    /// Start a bucket observer unless one is already running.
    fn ensure_bucket_observer(self: &Arc<Self>, bucket: &str) {
        let mut buckets = self.buckets.lock().unwrap();
        if buckets.insert(bucket.to_string()) {
            tracing::info!(bucket, "starting bucket observer");
            tokio::spawn(observe_bucket(self.clone(), bucket.to_string()));
        }
    }
}

/// Drive one streaming observer forever, restarting on stream drop with the
/// configured backoff. Each restart re-reads credentials. `run_once` returns
/// `Ok(true)` to keep observing, `Ok(false)` to end the observer.
async fn observe_loop<F, Fut>(inner: Arc<Inner>, what: &'static str, mut run_once: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<bool>>,
{
    let mut attempts = 0u32;

    loop {
        let outcome = tokio::select! {
            () = inner.cancel.cancelled() => return,
            outcome = run_once() => outcome,
        };

        match outcome {
            Ok(false) => return,
            Ok(true) => attempts = 0,
            Err(crate::Error::NotFound { .. }) => {
                // The endpoint is gone for good (e.g. a dropped bucket).
                tracing::info!(what, "streaming endpoint is gone, ending observer");
                return;
            }
            Err(err) => {
                attempts += 1;
                if attempts >= inner.config.observer_restart_attempts {
                    tracing::error!(what, %err, attempts, "observer keeps failing, backing off");
                    attempts = 0;
                }
                tracing::debug!(what, %err, "restarting streaming observer");
            }
        }
        tokio::time::sleep(inner.config.observer_restart).await;
    }
}

async fn observe_pool(inner: Arc<Inner>) {
    let endpoint = inner.fetcher.pool_streaming_endpoint();

    observe_loop(inner.clone(), "pool", || {
        let inner = inner.clone();
        let endpoint = endpoint.clone();
        async move {
            let (tx, mut rx) = mpsc::unbounded_channel::<Pool>();

            let stream = crate::stream::stream_endpoint(
                &inner.http,
                &endpoint,
                inner.fetcher.credentials(),
                move |pool: Pool| {
                    tx.send(pool).map_err(|_| crate::Error::Closed)?;
                    Ok(())
                },
            );
            tokio::pin!(stream);

            loop {
                tokio::select! {
                    result = &mut stream => {
                        result?;
                        // Deliver anything decoded after the last poll of rx.
                        while let Ok(pool) = rx.try_recv() {
                            for name in &pool.bucket_names {
                                inner.ensure_bucket_observer(&name.bucket_name);
                            }
                            inner.broadcast(Notification::PoolChange(Arc::new(pool))).await;
                        }
                        return Ok(true);
                    }
                    Some(pool) = rx.recv() => {
                        for name in &pool.bucket_names {
                            inner.ensure_bucket_observer(&name.bucket_name);
                        }
                        inner.broadcast(Notification::PoolChange(Arc::new(pool))).await;
                    }
                }
            }
        }
    })
    .await;
}

async fn observe_services(inner: Arc<Inner>) {
    let endpoint = inner.fetcher.services_streaming_endpoint();

    observe_loop(inner.clone(), "nodeServices", || {
        let inner = inner.clone();
        let endpoint = endpoint.clone();
        async move {
            let (tx, mut rx) = mpsc::unbounded_channel::<PoolServices>();

            let stream = crate::stream::stream_endpoint(
                &inner.http,
                &endpoint,
                inner.fetcher.credentials(),
                move |services: PoolServices| {
                    tx.send(services).map_err(|_| crate::Error::Closed)?;
                    Ok(())
                },
            );
            tokio::pin!(stream);

            loop {
                tokio::select! {
                    result = &mut stream => {
                        result?;
                        while let Ok(services) = rx.try_recv() {
                            inner.broadcast(Notification::ServiceChange(Arc::new(services))).await;
                        }
                        return Ok(true);
                    }
                    Some(services) = rx.recv() => {
                        inner.broadcast(Notification::ServiceChange(Arc::new(services))).await;
                    }
                }
            }
        }
    })
    .await;
}

async fn observe_bucket(inner: Arc<Inner>, bucket: String) {
    let endpoint = inner.fetcher.bucket_streaming_endpoint(&bucket);

    observe_loop(inner.clone(), "bucket", || {
        let inner = inner.clone();
        let endpoint = endpoint.clone();
        let bucket = bucket.clone();
        async move {
            let (tx, mut rx) = mpsc::unbounded_channel::<TerseBucket>();

            let stream = crate::stream::stream_endpoint(
                &inner.http,
                &endpoint,
                inner.fetcher.credentials(),
                move |terse: TerseBucket| {
                    tx.send(terse).map_err(|_| crate::Error::Closed)?;
                    Ok(())
                },
            );
            tokio::pin!(stream);

            let deliver = |terse: TerseBucket, inner: &Arc<Inner>, bucket: &str| {
                let inner = inner.clone();
                let bucket = bucket.to_string();
                async move {
                    if let Ok(manifest_uid) = terse.manifest_uid() {
                        inner
                            .broadcast(Notification::CollectionManifestChange {
                                bucket,
                                manifest_uid,
                            })
                            .await;
                    }
                    inner
                        .broadcast(Notification::TerseBucketChange(Arc::new(terse)))
                        .await;
                }
            };

            loop {
                tokio::select! {
                    result = &mut stream => {
                        result?;
                        while let Ok(terse) = rx.try_recv() {
                            deliver(terse, &inner, &bucket).await;
                        }
                        return Ok(true);
                    }
                    Some(terse) = rx.recv() => {
                        deliver(terse, &inner, &bucket).await;
                    }
                }
            }
        }
    })
    .await;

    inner.buckets.lock().unwrap().remove(&bucket);
}

type RegistryKey = (String, String);

/// Registry of notifier singletons, keyed `(cluster URL, pool name)`. The
/// registry holds weak references: a notifier lives as long as someone holds
/// it, and a later fetch re-spawns a dead entry.
#[derive(Clone, Default)]
pub struct NotifierRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    entries: Mutex<HashMap<RegistryKey, Weak<Inner>>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the notifier for `(cluster_url, pool_name)`, spawning its
    /// observers if absent or previously shut down.
    pub fn fetch_or_spawn(
        &self,
        http: reqwest::Client,
        cluster_url: &str,
        pool_name: &str,
        auth: Arc<dyn crate::CredentialsProvider>,
        config: &crate::Config,
    ) -> crate::Result<Notifier> {
        let key = (cluster_url.to_string(), pool_name.to_string());
        let mut entries = self.inner.entries.lock().unwrap();

        if let Some(inner) = entries.get(&key).and_then(Weak::upgrade) {
            return Ok(Notifier { inner });
        }

        let fetcher = Fetcher::new(http.clone(), cluster_url, pool_name, auth, config)?;
        let notifier = Notifier::new(http, fetcher, config.clone());
        *notifier.inner.registry.lock().unwrap() =
            Some((Arc::downgrade(&self.inner), key.clone()));
        entries.insert(key, Arc::downgrade(&notifier.inner));

        Ok(notifier)
    }
}
