//! The topology cache: atomic holders for the nodes snapshot and per-bucket
//! bucket/collection snapshots, written only by owning manager tasks and read
//! without blocking.

use crate::buckets::{BucketInfo, CollectionInfo};
use crate::events::EventManager;
use crate::fetch::Fetcher;
use crate::model::{Pool, PoolServices, TerseBucket};
use crate::nodes::NodesInfo;
use crate::notifier::{Notification, Notifier, NotifierRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Lifecycle of one holder. `Deleted` is terminal, for a removed bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderState {
    Empty,
    Valid,
    Invalid,
    Deleted,
}

/// One atomically-swapped cache slot. Readers load it once and derive every
/// answer from that snapshot; an invalid holder keeps its previous contents
/// but returns no data.
#[derive(Debug, Clone)]
pub struct Holder<T> {
    pub state: HolderState,
    pub snapshot: Option<Arc<T>>,
    pub last_updated: Instant,
}

impl<T> Default for Holder<T> {
    fn default() -> Self {
        Self {
            state: HolderState::Empty,
            snapshot: None,
            last_updated: Instant::now(),
        }
    }
}

impl<T> Holder<T> {
    fn read(&self, kind: &'static str, name: &str) -> crate::Result<Arc<T>> {
        match self.state {
            HolderState::Valid => Ok(self
                .snapshot
                .clone()
                .expect("valid holders carry a snapshot")),
            HolderState::Deleted => Err(crate::Error::not_found(kind, name)),
            HolderState::Empty | HolderState::Invalid => Err(crate::Error::Validation(format!(
                "{kind} '{name}' holder is {:?}",
                self.state
            ))),
        }
    }
}

/// Event key identifying one holder, for force-fetch coalescing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum HolderKey {
    Nodes,
    Bucket(String),
    Collections(String),
}

/// Commands consumed by the per-bucket manager task.
enum BucketCommand {
    Terse(Arc<TerseBucket>),
    Manifest(u64),
    ForceBucket,
    ForceCollections,
}

struct BucketEntry {
    bucket_tx: Arc<watch::Sender<Holder<BucketInfo>>>,
    collections_tx: Arc<watch::Sender<Holder<CollectionInfo>>>,
    queue: mpsc::Sender<BucketCommand>,
}

/// Process-wide cache of one cluster's topology.
#[derive(Clone)]
pub struct TopologyCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    config: crate::Config,
    fetcher: Fetcher,
    notifier: Notifier,
    nodes_tx: Arc<watch::Sender<Holder<NodesInfo>>>,
    buckets: Mutex<HashMap<String, BucketEntry>>,
    events: EventManager<HolderKey, HolderState>,
    /// Force-nodes requests routed to the nodes manager task.
    nodes_queue: mpsc::Sender<()>,
    cancel: CancellationToken,
}

impl TopologyCache {
    pub fn new(
        http: reqwest::Client,
        cluster_url: &str,
        pool_name: &str,
        auth: Arc<dyn crate::CredentialsProvider>,
        notifiers: &NotifierRegistry,
        config: crate::Config,
    ) -> crate::Result<Self> {
        let fetcher = Fetcher::new(http.clone(), cluster_url, pool_name, auth.clone(), &config)?;
        let notifier = notifiers.fetch_or_spawn(http, cluster_url, pool_name, auth, &config)?;

        let (nodes_queue, nodes_rx) = mpsc::channel(8);
        let events = EventManager::new(config.event_capacity);
        let inner = Arc::new(CacheInner {
            config,
            fetcher,
            notifier: notifier.clone(),
            nodes_tx: Arc::new(watch::Sender::new(Holder::default())),
            buckets: Mutex::new(HashMap::new()),
            events,
            nodes_queue,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_manager(inner.clone(), nodes_rx));
        tokio::spawn(run_ticker(inner.clone()));

        Ok(Self { inner })
    }

    /// The current nodes snapshot, without waiting. Errors if the holder is
    /// empty or invalid; call [`nodes_fresh`](Self::nodes_fresh) to force a
    /// refresh instead.
    pub fn nodes(&self) -> crate::Result<Arc<NodesInfo>> {
        self.inner.nodes_tx.borrow().read("nodes", "cluster")
    }

    /// The nodes snapshot, forcing a coalesced refresh if it is not valid.
    pub async fn nodes_fresh(&self) -> crate::Result<Arc<NodesInfo>> {
        if let Ok(snapshot) = self.nodes() {
            return Ok(snapshot);
        }
        self.await_holder(HolderKey::Nodes).await?;
        self.nodes()
    }

    pub fn bucket_info(&self, bucket: &str) -> crate::Result<Arc<BucketInfo>> {
        let buckets = self.inner.buckets.lock().unwrap();
        let entry = buckets
            .get(bucket)
            .ok_or_else(|| crate::Error::not_found("bucket", bucket))?;
        let result = entry.bucket_tx.borrow().read("bucket", bucket);
        result
    }

    pub async fn bucket_info_fresh(&self, bucket: &str) -> crate::Result<Arc<BucketInfo>> {
        if let Ok(snapshot) = self.bucket_info(bucket) {
            return Ok(snapshot);
        }
        self.inner.ensure_bucket(bucket);
        self.await_holder(HolderKey::Bucket(bucket.to_string())).await?;
        self.bucket_info(bucket)
    }

    pub fn collection_info(&self, bucket: &str) -> crate::Result<Arc<CollectionInfo>> {
        let buckets = self.inner.buckets.lock().unwrap();
        let entry = buckets
            .get(bucket)
            .ok_or_else(|| crate::Error::not_found("bucket", bucket))?;
        let result = entry.collections_tx.borrow().read("collections", bucket);
        result
    }

    pub async fn collection_info_fresh(&self, bucket: &str) -> crate::Result<Arc<CollectionInfo>> {
        if let Ok(snapshot) = self.collection_info(bucket) {
            return Ok(snapshot);
        }
        self.inner.ensure_bucket(bucket);
        self.await_holder(HolderKey::Collections(bucket.to_string()))
            .await?;
        self.collection_info(bucket)
    }

    /// Register as a waiter for the holder's next publication; the first
    /// waiter enqueues the force-fetch, later waiters coalesce onto it.
    async fn await_holder(&self, key: HolderKey) -> crate::Result<()> {
        let (id, rx, waiters) = self.inner.events.register(key.clone())?;

        if waiters == 1 {
            match &key {
                HolderKey::Nodes => {
                    let _ = self.inner.nodes_queue.try_send(());
                }
                HolderKey::Bucket(bucket) => {
                    self.inner.send_bucket(bucket, BucketCommand::ForceBucket);
                }
                HolderKey::Collections(bucket) => {
                    self.inner
                        .send_bucket(bucket, BucketCommand::ForceCollections);
                }
            }
        }

        match tokio::time::timeout(self.inner.config.event_wait_timeout(), rx).await {
            Ok(Ok(_state)) => Ok(()),
            Ok(Err(_)) => Err(crate::Error::Closed),
            Err(_) => {
                // The in-flight fetch continues; only this waiter gives up.
                self.inner.events.unregister(&key, id);
                Err(crate::Error::EventWaitTimeout)
            }
        }
    }

    /// Stop manager tasks and the change notifier.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.notifier.shutdown();
    }
}

impl CacheInner {
    /// Create the holder pair and manager task for a bucket on first sight.
    fn ensure_bucket(self: &Arc<Self>, bucket: &str) {
        let mut buckets = self.buckets.lock().unwrap();
        if buckets.contains_key(bucket) {
            return;
        }
        let (queue, rx) = mpsc::channel(16);
        let entry = BucketEntry {
            bucket_tx: Arc::new(watch::Sender::new(Holder::default())),
            collections_tx: Arc::new(watch::Sender::new(Holder::default())),
            queue,
        };
        tokio::spawn(run_bucket_manager(
            self.clone(),
            bucket.to_string(),
            entry.bucket_tx.clone(),
            entry.collections_tx.clone(),
            rx,
        ));
        buckets.insert(bucket.to_string(), entry);
    }

    fn send_bucket(self: &Arc<Self>, bucket: &str, command: BucketCommand) {
        self.ensure_bucket(bucket);
        let buckets = self.buckets.lock().unwrap();
        if let Some(entry) = buckets.get(bucket) {
            // A full queue already has pending work for this holder.
            let _ = entry.queue.try_send(command);
        }
    }

    fn publish_nodes(&self, state: HolderState, snapshot: Option<Arc<NodesInfo>>) {
        publish(&self.nodes_tx, state, snapshot);
        self.events.notify(&HolderKey::Nodes, state);
    }

    /// Drop a removed bucket: mark holders deleted and wake waiters.
    fn delete_bucket(&self, bucket: &str) {
        let entry = self.buckets.lock().unwrap().remove(bucket);
        if let Some(entry) = entry {
            publish(&entry.bucket_tx, HolderState::Deleted, None);
            publish(&entry.collections_tx, HolderState::Deleted, None);
        }
        self.events
            .notify(&HolderKey::Bucket(bucket.to_string()), HolderState::Deleted);
        self.events.notify(
            &HolderKey::Collections(bucket.to_string()),
            HolderState::Deleted,
        );
        tracing::info!(bucket, "bucket removed from topology cache");
    }
}

fn publish<T>(tx: &watch::Sender<Holder<T>>, state: HolderState, snapshot: Option<Arc<T>>) {
    tx.send_modify(|holder| {
        // An invalid update keeps the previous contents visible to debuggers
        // while returning no data to readers.
        if let Some(snapshot) = snapshot {
            holder.snapshot = Some(snapshot);
        }
        holder.state = state;
        holder.last_updated = Instant::now();
    });
}

/// Owns all writes to the nodes holder and routes bucket notifications.
async fn run_manager(inner: Arc<CacheInner>, mut force_nodes: mpsc::Receiver<()>) {
    let mut consumer = inner.notifier.new_consumer();
    let mut last_pool: Option<Arc<Pool>> = None;
    let mut last_services: Option<Arc<PoolServices>> = None;

    // Prime the nodes holder before the first notification arrives.
    refresh_nodes(&inner, &mut last_pool, &mut last_services).await;

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            Some(()) = force_nodes.recv() => {
                refresh_nodes(&inner, &mut last_pool, &mut last_services).await;
            }
            notification = consumer.rx.recv() => {
                let Some(notification) = notification else { return };
                match notification {
                    Notification::PoolChange(pool) => {
                        let removed: Vec<String> = {
                            let buckets = inner.buckets.lock().unwrap();
                            buckets
                                .keys()
                                .filter(|known| {
                                    !pool.bucket_names.iter().any(|b| &b.bucket_name == *known)
                                })
                                .cloned()
                                .collect()
                        };
                        for bucket in removed {
                            inner.delete_bucket(&bucket);
                        }

                        last_pool = Some(pool);
                        apply_nodes(&inner, &mut last_pool, &mut last_services).await;
                    }
                    Notification::ServiceChange(services) => {
                        last_services = Some(services);
                        apply_nodes(&inner, &mut last_pool, &mut last_services).await;
                    }
                    Notification::TerseBucketChange(terse) => {
                        let bucket = terse.name.clone();
                        inner.send_bucket(&bucket, BucketCommand::Terse(terse));
                    }
                    Notification::CollectionManifestChange { bucket, manifest_uid } => {
                        inner.send_bucket(&bucket, BucketCommand::Manifest(manifest_uid));
                    }
                }
            }
        }
    }
}

/// Validate and publish a nodes snapshot assembled from notification state,
/// falling back to a full fetch when the assembled snapshot does not hold up.
async fn apply_nodes(
    inner: &Arc<CacheInner>,
    last_pool: &mut Option<Arc<Pool>>,
    last_services: &mut Option<Arc<PoolServices>>,
) {
    if let (Some(pool), Some(services)) = (last_pool.as_ref(), last_services.as_ref()) {
        let candidate = NodesInfo::new(pool, services, inner.fetcher.client_host());
        match candidate.validate() {
            Ok(()) => {
                inner.publish_nodes(HolderState::Valid, Some(Arc::new(candidate)));
                return;
            }
            Err(err) => {
                tracing::warn!(%err, "assembled nodes snapshot failed validation, fetching");
            }
        }
    }
    refresh_nodes(inner, last_pool, last_services).await;
}

/// Full fetch of pool + services, validated and published. On validation
/// failure the holder keeps its previous contents and is marked invalid.
async fn refresh_nodes(
    inner: &Arc<CacheInner>,
    out_pool: &mut Option<Arc<Pool>>,
    out_services: &mut Option<Arc<PoolServices>>,
) {
    let fetched = async {
        let pool = inner.fetcher.pool().await?;
        let services = inner.fetcher.pool_services().await?;
        Ok::<_, crate::Error>((pool, services))
    }
    .await;

    match fetched {
        Ok((pool, services)) => {
            let info = NodesInfo::new(&pool, &services, inner.fetcher.client_host());
            *out_pool = Some(Arc::new(pool));
            *out_services = Some(Arc::new(services));

            match info.validate() {
                Ok(()) => inner.publish_nodes(HolderState::Valid, Some(Arc::new(info))),
                Err(err) => {
                    tracing::warn!(%err, "fetched nodes snapshot failed validation");
                    inner.publish_nodes(HolderState::Invalid, None);
                }
            }
        }
        Err(err) => {
            tracing::warn!(%err, "nodes fetch failed");
            inner.publish_nodes(HolderState::Invalid, None);
        }
    }
}

/// Owns all writes to one bucket's holders.
async fn run_bucket_manager(
    inner: Arc<CacheInner>,
    bucket: String,
    bucket_tx: Arc<watch::Sender<Holder<BucketInfo>>>,
    collections_tx: Arc<watch::Sender<Holder<CollectionInfo>>>,
    mut queue: mpsc::Receiver<BucketCommand>,
) {
    loop {
        let command = tokio::select! {
            () = inner.cancel.cancelled() => return,
            command = queue.recv() => match command {
                Some(command) => command,
                None => return,
            },
        };

        match command {
            BucketCommand::Terse(terse) => {
                publish(
                    &bucket_tx,
                    HolderState::Valid,
                    Some(Arc::new(BucketInfo::new((*terse).clone()))),
                );
                inner
                    .events
                    .notify(&HolderKey::Bucket(bucket.clone()), HolderState::Valid);
            }
            BucketCommand::ForceBucket => {
                match inner.fetcher.terse_bucket(&bucket).await {
                    Ok(terse) => {
                        publish(
                            &bucket_tx,
                            HolderState::Valid,
                            Some(Arc::new(BucketInfo::new(terse))),
                        );
                        inner
                            .events
                            .notify(&HolderKey::Bucket(bucket.clone()), HolderState::Valid);
                    }
                    Err(crate::Error::NotFound { .. }) => {
                        inner.delete_bucket(&bucket);
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(bucket, %err, "terse bucket fetch failed");
                        publish(&bucket_tx, HolderState::Invalid, None);
                        inner
                            .events
                            .notify(&HolderKey::Bucket(bucket.clone()), HolderState::Invalid);
                    }
                }
            }
            BucketCommand::Manifest(uid) => {
                // Monotone UID rule: never regress the manifest.
                let known = collections_tx
                    .borrow()
                    .snapshot
                    .as_ref()
                    .map_or(0, |c| c.manifest_uid);
                if known >= uid && collections_tx.borrow().state == HolderState::Valid {
                    continue;
                }
                fetch_collections(&inner, &bucket, &collections_tx).await;
            }
            BucketCommand::ForceCollections => {
                fetch_collections(&inner, &bucket, &collections_tx).await;
            }
        }
    }
}

async fn fetch_collections(
    inner: &Arc<CacheInner>,
    bucket: &str,
    collections_tx: &watch::Sender<Holder<CollectionInfo>>,
) {
    match inner.fetcher.collection_manifest(bucket).await {
        Ok(manifest) => match CollectionInfo::new(bucket.to_string(), &manifest) {
            Ok(info) => {
                let known = collections_tx
                    .borrow()
                    .snapshot
                    .as_ref()
                    .map_or(0, |c| c.manifest_uid);
                if info.manifest_uid >= known {
                    publish(collections_tx, HolderState::Valid, Some(Arc::new(info)));
                } else {
                    // A racing fetch already installed a newer manifest.
                    publish(collections_tx, HolderState::Valid, None);
                }
                inner.events.notify(
                    &HolderKey::Collections(bucket.to_string()),
                    HolderState::Valid,
                );
            }
            Err(err) => {
                tracing::warn!(bucket, %err, "collection manifest decode failed");
                publish(collections_tx, HolderState::Invalid, None);
                inner.events.notify(
                    &HolderKey::Collections(bucket.to_string()),
                    HolderState::Invalid,
                );
            }
        },
        Err(crate::Error::NotFound { .. }) => {
            inner.delete_bucket(bucket);
        }
        Err(err) => {
            tracing::warn!(bucket, %err, "collection manifest fetch failed");
            publish(collections_tx, HolderState::Invalid, None);
            inner.events.notify(
                &HolderKey::Collections(bucket.to_string()),
                HolderState::Invalid,
            );
        }
    }
}

/// Periodically force-refresh holders that have gone stale with no pending
/// input.
async fn run_ticker(inner: Arc<CacheInner>) {
    let mut ticker = tokio::time::interval(inner.config.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let threshold = inner.config.stale_threshold;
        if inner.nodes_tx.borrow().last_updated.elapsed() > threshold {
            let _ = inner.nodes_queue.try_send(());
        }

        let stale: Vec<(String, bool, bool)> = {
            let buckets = inner.buckets.lock().unwrap();
            buckets
                .iter()
                .map(|(name, entry)| {
                    (
                        name.clone(),
                        entry.bucket_tx.borrow().last_updated.elapsed() > threshold,
                        entry.collections_tx.borrow().last_updated.elapsed() > threshold,
                    )
                })
                .collect()
        };
        for (bucket, bucket_stale, collections_stale) in stale {
            if bucket_stale {
                inner.send_bucket(&bucket, BucketCommand::ForceBucket);
            }
            if collections_stale {
                inner.send_bucket(&bucket, BucketCommand::ForceCollections);
            }
        }
    }
}

/// Refcounted registry of topology caches, keyed by cluster URL. Acquire a
/// handle per user; the cache is torn down when the last handle drops.
#[derive(Clone, Default)]
pub struct CacheRegistry {
    entries: Arc<Mutex<HashMap<String, (usize, TopologyCache)>>>,
    notifiers: NotifierRegistry,
}

pub struct CacheHandle {
    cache: TopologyCache,
    registry: Arc<Mutex<HashMap<String, (usize, TopologyCache)>>>,
    key: String,
}

impl std::ops::Deref for CacheHandle {
    type Target = TopologyCache;
    fn deref(&self) -> &TopologyCache {
        &self.cache
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        let mut entries = self.registry.lock().unwrap();
        if let Some((refs, _)) = entries.get_mut(&self.key) {
            *refs -= 1;
            if *refs == 0 {
                let (_, cache) = entries.remove(&self.key).unwrap();
                cache.shutdown();
            }
        }
    }
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(
        &self,
        http: reqwest::Client,
        cluster_url: &str,
        pool_name: &str,
        auth: Arc<dyn crate::CredentialsProvider>,
        config: crate::Config,
    ) -> crate::Result<CacheHandle> {
        let mut entries = self.entries.lock().unwrap();

        if let Some((refs, cache)) = entries.get_mut(cluster_url) {
            *refs += 1;
            return Ok(CacheHandle {
                cache: cache.clone(),
                registry: self.entries.clone(),
                key: cluster_url.to_string(),
            });
        }

        let cache = TopologyCache::new(
            http,
            cluster_url,
            pool_name,
            auth,
            &self.notifiers,
            config,
        )?;
        entries.insert(cluster_url.to_string(), (1, cache.clone()));
        Ok(CacheHandle {
            cache,
            registry: self.entries.clone(),
            key: cluster_url.to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::StaticCredentials;

    fn cache() -> TopologyCache {
        TopologyCache::new(
            reqwest::Client::new(),
            "http://cb.local:8091",
            "default",
            Arc::new(StaticCredentials("u".into(), "p".into())),
            &NotifierRegistry::new(),
            crate::Config {
                fetch_retries: 1,
                fetch_backoff: std::time::Duration::from_millis(1),
                ..crate::Config::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn empty_holders_error_without_blocking() {
        let cache = cache();
        assert!(cache.bucket_info("none").is_err());
        assert!(cache.collection_info("none").is_err());
        cache.shutdown();
    }

    #[tokio::test]
    async fn holder_publication_wakes_registered_waiters() {
        let cache = cache();
        let inner = cache.inner.clone();

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.await_holder(HolderKey::Nodes).await })
        };
        // Give the waiter time to register, then publish.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        inner.publish_nodes(HolderState::Valid, Some(Arc::new(NodesInfo::default())));

        waiter.await.unwrap().unwrap();
        cache.shutdown();
    }

    #[tokio::test]
    async fn concurrent_force_fetches_coalesce_to_one() {
        let cache = cache();
        let inner = cache.inner.clone();

        // Register three waiters the way await_holder does.
        let mut first_flags = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (_, rx, count) = inner.events.register(HolderKey::Nodes).unwrap();
            first_flags.push(count == 1);
            receivers.push(rx);
        }
        // Only the first registration would issue the underlying fetch.
        assert_eq!(first_flags, vec![true, false, false]);

        inner.publish_nodes(HolderState::Valid, Some(Arc::new(NodesInfo::default())));
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), HolderState::Valid);
        }
        cache.shutdown();
    }

    #[tokio::test]
    async fn deleted_buckets_return_not_found() {
        let cache = cache();
        cache.inner.ensure_bucket("doomed");
        cache.inner.delete_bucket("doomed");

        assert!(matches!(
            cache.bucket_info("doomed"),
            Err(crate::Error::NotFound { .. })
        ));
        cache.shutdown();
    }

    #[tokio::test]
    async fn registry_refcounts_and_reuses_one_cache() {
        let registry = CacheRegistry::new();
        let auth: Arc<dyn crate::CredentialsProvider> =
            Arc::new(StaticCredentials("u".into(), "p".into()));

        let a = registry
            .acquire(
                reqwest::Client::new(),
                "http://cb.local:8091",
                "default",
                auth.clone(),
                crate::Config::default(),
            )
            .unwrap();
        let b = registry
            .acquire(
                reqwest::Client::new(),
                "http://cb.local:8091",
                "default",
                auth.clone(),
                crate::Config::default(),
            )
            .unwrap();
        assert!(Arc::ptr_eq(&a.cache.inner, &b.cache.inner));

        drop(a);
        assert_eq!(registry.entries.lock().unwrap().len(), 1);
        drop(b);
        assert!(registry.entries.lock().unwrap().is_empty());
    }
}
