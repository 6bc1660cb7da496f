//! Top-level index client: one per cluster, acquired through a refcounted
//! registry. Resolves query consistency into vbucket-timestamp vectors,
//! chooses the row-key encoding by cluster version, and fans scan APIs out
//! through the request broker.

use crate::bridge::{HttpBridge, IndexDefn, IndexState, MetadataBridge};
use crate::broker::{LogicalScan, RequestBroker, ScanStream};
use crate::client::PartitionStorageStats;
use async_trait::async_trait;
use scan_proto::messages::{
    DataEncoding, GroupAggr, IndexEntry, IndexProjection, Inclusion, IndexStatistics, Scan,
};
use scan_proto::{Consistency, TsVector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use topology::CredentialsProvider;

/// Minimum cluster version whose servers ship collate-encoded binary keys
/// and compute session vectors server-side.
const COLLATED_KEYS_VERSION: (u32, u32) = (6, 5);

/// Supplies per-vbucket sequence state for session-consistency vectors. The
/// KV client behind it is a collaborator, not part of this crate.
#[async_trait]
pub trait SeqnosProvider: Send + Sync + 'static {
    /// Full stats: parallel `(vbnos, seqnos, vbuuids)` vectors.
    async fn stats(&self, bucket: &str) -> crate::Result<(Vec<u16>, Vec<u64>, Vec<u64>)>;

    /// Fast path: current seqnos, with vbuuids verified against a previously
    /// observed digest instead of re-shipped.
    async fn seqnos_with_hash(&self, bucket: &str, hash64: u64) -> crate::Result<Vec<u64>>;
}

/// Per-bucket cache of the vbuuid digest backing the session fast path.
struct VectorCache {
    entries: Mutex<HashMap<String, CachedVector>>,
}

struct CachedVector {
    vbnos: Vec<u16>,
    hash64: u64,
    stamped: Instant,
}

impl VectorCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Build a session vector for `bucket`. Within the cache window only
    /// seqnos are re-fetched, verified by the stored vbuuid digest; outside
    /// it a full stats call refreshes the digest.
    async fn session_vector(
        &self,
        bucket: &str,
        provider: &dyn SeqnosProvider,
        window: std::time::Duration,
        stats: &ClientStats,
    ) -> crate::Result<TsVector> {
        let cached = {
            let entries = self.entries.lock().unwrap();
            entries.get(bucket).and_then(|c| {
                (c.stamped.elapsed() < window).then(|| (c.vbnos.clone(), c.hash64))
            })
        };

        if let Some((vbnos, hash64)) = cached {
            let seqnos = provider.seqnos_with_hash(bucket, hash64).await?;
            stats.session_fast_paths.fetch_add(1, Ordering::Relaxed);
            return Ok(TsVector::with_hash(bucket.to_string(), vbnos, seqnos, hash64));
        }

        let (vbnos, seqnos, vbuuids) = provider.stats(bucket).await?;
        let vector = TsVector::new(bucket.to_string(), vbnos, seqnos, vbuuids);
        self.entries.lock().unwrap().insert(
            bucket.to_string(),
            CachedVector {
                vbnos: vector.vbnos.clone(),
                hash64: vector.hash64,
                stamped: Instant::now(),
            },
        );
        stats.session_full_fetches.fetch_add(1, Ordering::Relaxed);
        Ok(vector)
    }
}

/// Counters surfaced by [`IndexClient::stats`].
#[derive(Default)]
pub struct ClientStats {
    pub scans: AtomicU64,
    pub scan_errors: AtomicU64,
    pub counts: AtomicU64,
    pub session_full_fetches: AtomicU64,
    pub session_fast_paths: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStatsSnapshot {
    pub scans: u64,
    pub scan_errors: u64,
    pub counts: u64,
    pub session_full_fetches: u64,
    pub session_fast_paths: u64,
}

/// Caller-tunable options shared by the scan APIs.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub distinct: bool,
    pub reverse: bool,
    /// Zero means unlimited.
    pub limit: u64,
    pub offset: u64,
    /// Merge rows across endpoints in index order.
    pub sorted: bool,
    pub projection: Option<IndexProjection>,
    pub group_aggr: Option<GroupAggr>,
    pub consistency: Consistency,
    /// Caller-supplied vector, required for query consistency.
    pub vector: Option<TsVector>,
}

pub struct IndexClient {
    inner: Arc<Inner>,
    registry: Option<(Arc<Mutex<HashMap<String, (usize, Arc<Inner>)>>>, String)>,
}

struct Inner {
    #[allow(dead_code)]
    cluster_url: String,
    /// Holding the handle keeps the cluster's topology cache alive.
    topo: topology::CacheHandle,
    bridge: Arc<dyn MetadataBridge>,
    broker: RequestBroker,
    seqnos: Arc<dyn SeqnosProvider>,
    vectors: VectorCache,
    config: crate::Config,
    stats: ClientStats,
}

impl IndexClient {
    /// Refresh the index catalog: `(indexes, admin version, cluster version)`.
    pub async fn refresh(
        &self,
    ) -> crate::Result<(Vec<Arc<crate::bridge::IndexMetadata>>, u64, (u32, u32))> {
        self.inner.bridge.refresh().await
    }

    pub fn bridge(&self) -> &Arc<dyn MetadataBridge> {
        &self.inner.bridge
    }

    pub fn stats(&self) -> ClientStatsSnapshot {
        let s = &self.inner.stats;
        ClientStatsSnapshot {
            scans: s.scans.load(Ordering::Relaxed),
            scan_errors: s.scan_errors.load(Ordering::Relaxed),
            counts: s.counts.load(Ordering::Relaxed),
            session_full_fetches: s.session_full_fetches.load(Ordering::Relaxed),
            session_fast_paths: s.session_fast_paths.load(Ordering::Relaxed),
        }
    }

    /// Equality-seek scan.
    pub async fn lookup(
        &self,
        defn_id: u64,
        equals: Vec<Vec<serde_json::Value>>,
        options: ScanOptions,
    ) -> crate::Result<ScanStream> {
        let scans = equals
            .into_iter()
            .map(|seek| Scan {
                equals: Some(seek),
                ..Scan::default()
            })
            .collect();
        self.start_scan(defn_id, scans, false, options).await
    }

    /// Single-range scan.
    pub async fn range(
        &self,
        defn_id: u64,
        low: Option<serde_json::Value>,
        high: Option<serde_json::Value>,
        inclusion: Inclusion,
        options: ScanOptions,
    ) -> crate::Result<ScanStream> {
        let scans = vec![Scan {
            filters: vec![scan_proto::messages::CompositeElementFilter {
                low,
                high,
                inclusion,
            }],
            equals: None,
        }];
        self.start_scan(defn_id, scans, false, options).await
    }

    /// Composite multi-span scan (also the entry point for scan3 semantics:
    /// set `options.projection` / `options.group_aggr`).
    pub async fn multi_scan(
        &self,
        defn_id: u64,
        scans: Vec<Scan>,
        options: ScanOptions,
    ) -> crate::Result<ScanStream> {
        self.start_scan(defn_id, scans, false, options).await
    }

    /// Full-index scan.
    pub async fn scan_all(
        &self,
        defn_id: u64,
        options: ScanOptions,
    ) -> crate::Result<ScanStream> {
        self.start_scan(defn_id, Vec::new(), true, options).await
    }

    pub async fn count_lookup(
        &self,
        defn_id: u64,
        equals: Vec<Vec<serde_json::Value>>,
        options: ScanOptions,
    ) -> crate::Result<u64> {
        let scans = equals
            .into_iter()
            .map(|seek| Scan {
                equals: Some(seek),
                ..Scan::default()
            })
            .collect();
        self.count_scan(defn_id, scans, options).await
    }

    pub async fn count_range(
        &self,
        defn_id: u64,
        low: Option<serde_json::Value>,
        high: Option<serde_json::Value>,
        inclusion: Inclusion,
        options: ScanOptions,
    ) -> crate::Result<u64> {
        let scans = vec![Scan {
            filters: vec![scan_proto::messages::CompositeElementFilter {
                low,
                high,
                inclusion,
            }],
            equals: None,
        }];
        self.count_scan(defn_id, scans, options).await
    }

    pub async fn multi_scan_count(
        &self,
        defn_id: u64,
        scans: Vec<Scan>,
        options: ScanOptions,
    ) -> crate::Result<u64> {
        self.count_scan(defn_id, scans, options).await
    }

    /// Key-distribution statistics for a span, from one covering endpoint.
    pub async fn range_statistics(
        &self,
        defn_id: u64,
        span: Scan,
    ) -> crate::Result<IndexStatistics> {
        let plan = self
            .inner
            .bridge
            .get_scanport(defn_id, &Default::default(), &Default::default())
            .ok_or(crate::Error::NoPlan(defn_id))?;
        let client = self.inner.broker.client_for(&plan.endpoints[0]).await?;
        client
            .statistics(scan_proto::messages::StatisticsRequest {
                defn_id,
                inst_id: plan.inst_ids[0],
                span,
            })
            .await
    }

    /// Per-partition storage statistics from every indexer node.
    pub async fn storage_statistics(
        &self,
    ) -> crate::Result<Vec<(String, Vec<PartitionStorageStats>)>> {
        let nodes = self.inner.bridge.nodes()?;
        let mut all = Vec::with_capacity(nodes.len());
        for node in nodes {
            let client = self.inner.broker.client_for(&node.query).await?;
            all.push((node.http.clone(), client.storage_statistics().await?));
        }
        Ok(all)
    }

    pub async fn create_index(&self, defn: IndexDefn) -> crate::Result<u64> {
        self.inner.bridge.create_index(defn).await
    }

    pub async fn build_indexes(&self, defn_ids: &[u64]) -> crate::Result<()> {
        self.inner.bridge.build_indexes(defn_ids).await
    }

    pub async fn drop_index(&self, defn_id: u64) -> crate::Result<()> {
        self.inner.bridge.drop_index(defn_id).await
    }

    pub async fn move_index(&self, defn_id: u64, destinations: Vec<String>) -> crate::Result<()> {
        self.inner.bridge.move_index(defn_id, destinations).await
    }

    pub async fn alter_replica_count(&self, defn_id: u64, count: u32) -> crate::Result<()> {
        self.inner.bridge.alter_replica_count(defn_id, count).await
    }

    pub fn index_state(&self, defn_id: u64) -> crate::Result<IndexState> {
        self.inner.bridge.index_state(defn_id)
    }

    /// Collect a whole scan into memory. Convenience for small result sets.
    pub async fn collect(mut stream: ScanStream) -> crate::Result<Vec<IndexEntry>> {
        let mut rows = Vec::new();
        while let Some(entry) = stream.next().await {
            rows.push(entry?);
        }
        Ok(rows)
    }

    async fn start_scan(
        &self,
        defn_id: u64,
        scans: Vec<Scan>,
        scan_all: bool,
        options: ScanOptions,
    ) -> crate::Result<ScanStream> {
        let defn = self.inner.bridge.index_defn(defn_id)?;
        let vector = self.resolve_vector(&defn, options.consistency, options.vector).await;
        let vector = match vector {
            Ok(vector) => vector,
            Err(err) => {
                self.inner.stats.scan_errors.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        self.inner.stats.scans.fetch_add(1, Ordering::Relaxed);

        Ok(self.inner.broker.scan(LogicalScan {
            defn_id,
            is_primary: defn.is_primary,
            scans,
            scan_all,
            distinct: options.distinct,
            reverse: options.reverse,
            limit: options.limit,
            offset: options.offset,
            sorted: options.sorted,
            projection: options.projection,
            group_aggr: options.group_aggr,
            consistency: options.consistency,
            vector,
            data_encoding: self.data_encoding(),
        }))
    }

    async fn count_scan(
        &self,
        defn_id: u64,
        scans: Vec<Scan>,
        options: ScanOptions,
    ) -> crate::Result<u64> {
        let defn = self.inner.bridge.index_defn(defn_id)?;
        let vector = self
            .resolve_vector(&defn, options.consistency, options.vector)
            .await?;
        self.inner.stats.counts.fetch_add(1, Ordering::Relaxed);

        self.inner
            .broker
            .count(&LogicalScan {
                defn_id,
                is_primary: defn.is_primary,
                scans,
                distinct: options.distinct,
                consistency: options.consistency,
                vector,
                data_encoding: self.data_encoding(),
                ..LogicalScan::default()
            })
            .await
    }

    /// Resolve the consistency mode into the vector shipped with requests.
    ///
    /// `query` requires a caller-supplied vector. `session` against a legacy
    /// cluster assembles one from the seqnos provider, using the cached
    /// vbuuid-digest fast path; modern servers compute it server-side.
    async fn resolve_vector(
        &self,
        defn: &IndexDefn,
        consistency: Consistency,
        caller_vector: Option<TsVector>,
    ) -> crate::Result<Option<TsVector>> {
        match consistency {
            Consistency::Any => Ok(None),
            Consistency::Query => caller_vector
                .map(Some)
                .ok_or(crate::Error::InvalidConsistency(
                    "query consistency requires a caller-supplied vector",
                )),
            Consistency::Session => {
                if caller_vector.is_some() {
                    return Ok(caller_vector);
                }
                if self.cluster_version() >= COLLATED_KEYS_VERSION {
                    return Ok(None);
                }
                let vector = self
                    .inner
                    .vectors
                    .session_vector(
                        &defn.bucket,
                        self.inner.seqnos.as_ref(),
                        self.inner.config.vector_window,
                        &self.inner.stats,
                    )
                    .await?;
                Ok(Some(vector))
            }
        }
    }

    fn cluster_version(&self) -> (u32, u32) {
        self.inner
            .topo
            .nodes()
            .map(|n| n.cluster_version())
            .unwrap_or_default()
    }

    /// Pre-6.5 servers ship JSON-encoded keys; later ones collate-encoded.
    fn data_encoding(&self) -> DataEncoding {
        if self.cluster_version() >= COLLATED_KEYS_VERSION {
            DataEncoding::Collated
        } else {
            DataEncoding::Json
        }
    }

    /// Close downstream pools. Observers terminate when the last client of
    /// this cluster releases the topology cache.
    pub fn close(&self) {
        self.inner.broker.close_all();
    }
}

impl Drop for IndexClient {
    fn drop(&mut self) {
        let Some((registry, key)) = self.registry.take() else {
            return;
        };
        let mut entries = registry.lock().unwrap();
        if let Some((refs, _)) = entries.get_mut(&key) {
            *refs -= 1;
            if *refs == 0 {
                let (_, inner) = entries.remove(&key).unwrap();
                inner.broker.close_all();
            }
        }
    }
}

/// Per-process registry of index clients, one shared core per cluster URL.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    entries: Arc<Mutex<HashMap<String, (usize, Arc<Inner>)>>>,
    caches: topology::CacheRegistry,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a client for `cluster_url`, registering the per-cluster core
    /// on first use. Every acquisition must be dropped (or `close`d) for the
    /// core to tear down.
    pub fn acquire(
        &self,
        http: reqwest::Client,
        cluster_url: &str,
        pool_name: &str,
        auth: Arc<dyn CredentialsProvider>,
        seqnos: Arc<dyn SeqnosProvider>,
        topology_config: topology::Config,
        config: crate::Config,
    ) -> crate::Result<IndexClient> {
        let mut entries = self.entries.lock().unwrap();

        if let Some((refs, inner)) = entries.get_mut(cluster_url) {
            *refs += 1;
            return Ok(IndexClient {
                inner: inner.clone(),
                registry: Some((self.entries.clone(), cluster_url.to_string())),
            });
        }

        let topo = self.caches.acquire(
            http.clone(),
            cluster_url,
            pool_name,
            auth.clone(),
            topology_config,
        )?;
        let bridge: Arc<dyn MetadataBridge> = Arc::new(HttpBridge::new(
            http.clone(),
            (*topo).clone(),
            auth.clone(),
        ));
        let broker = RequestBroker::new(bridge.clone(), http, auth, config.clone());

        let inner = Arc::new(Inner {
            cluster_url: cluster_url.to_string(),
            topo,
            bridge,
            broker,
            seqnos,
            vectors: VectorCache::new(),
            config,
            stats: ClientStats::default(),
        });
        entries.insert(cluster_url.to_string(), (1, inner.clone()));

        Ok(IndexClient {
            inner,
            registry: Some((self.entries.clone(), cluster_url.to_string())),
        })
    }
}
