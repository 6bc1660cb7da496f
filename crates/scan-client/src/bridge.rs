//! Metadata bridge: resolves index definitions to scan plans and drives the
//! asynchronous index-management operations against the admin HTTP surface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use topology::model::SERVICE_INDEX;
use topology::CredentialsProvider;

/// Admin service name within the cluster's extended-services table.
const SERVICE_INDEX_ADMIN: &str = "indexAdmin";

/// Lifecycle of an index (or one of its instances).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Created,
    Ready,
    Initial,
    Catchup,
    Active,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndexDefn {
    pub defn_id: u64,
    pub name: String,
    pub bucket: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub collection: String,
    pub is_primary: bool,
    /// Storage mode, e.g. "plasma" or "memory_optimized".
    #[serde(default)]
    pub using: String,
    #[serde(default)]
    pub sec_exprs: Vec<String>,
    #[serde(default)]
    pub num_replica: u32,
    /// Zero means an unpartitioned index (one logical partition).
    #[serde(default)]
    pub num_partition: u32,
}

impl IndexDefn {
    pub fn partition_count(&self) -> u32 {
        self.num_partition.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionPlacement {
    pub partition_id: u32,
    /// Index into the catalog's node table.
    pub node: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInst {
    pub inst_id: u64,
    pub replica_id: u32,
    pub state: IndexState,
    #[serde(default)]
    pub error: String,
    pub partitions: Vec<PartitionPlacement>,
    #[serde(default)]
    pub rollback_time: i64,
}

impl IndexInst {
    fn node_for(&self, partition_id: u32) -> Option<usize> {
        self.partitions
            .iter()
            .find(|p| p.partition_id == partition_id)
            .map(|p| p.node)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub defn: IndexDefn,
    pub insts: Vec<IndexInst>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerNode {
    #[serde(default)]
    pub node_uuid: String,
    /// Admin, scan, and HTTP `host:port` endpoints.
    pub admin: String,
    pub query: String,
    pub http: String,
    pub status: String,
}

impl IndexerNode {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// The full index catalog, swapped atomically on refresh.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub version: u64,
    pub cluster_version: (u32, u32),
    pub nodes: Vec<IndexerNode>,
    pub indexes: Vec<Arc<IndexMetadata>>,
}

impl Catalog {
    pub fn index(&self, defn_id: u64) -> crate::Result<&Arc<IndexMetadata>> {
        self.indexes
            .iter()
            .find(|m| m.defn.defn_id == defn_id)
            .ok_or(crate::Error::IndexNotFound(defn_id))
    }

    /// Instance-partitions of `defn_id` hosted on the node serving `endpoint`.
    pub fn instances_on_endpoint(&self, defn_id: u64, endpoint: &str) -> Vec<(u32, u64)> {
        let Some(node) = self.nodes.iter().position(|n| n.query == endpoint) else {
            return Vec::new();
        };
        let Ok(meta) = self.index(defn_id) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        for inst in &meta.insts {
            for placement in &inst.partitions {
                if placement.node == node {
                    found.push((placement.partition_id, inst.inst_id));
                }
            }
        }
        found
    }

    /// HTTP endpoint of the node serving `endpoint`, for out-of-band stats.
    pub fn http_endpoint_for(&self, endpoint: &str) -> Option<String> {
        self.nodes
            .iter()
            .find(|n| n.query == endpoint)
            .map(|n| n.http.clone())
    }
}

/// Instance-partitions already known bad: `definition → partition → instances`.
#[derive(Debug, Clone, Default)]
pub struct Excludes {
    by_defn: HashMap<u64, HashMap<u32, HashSet<u64>>>,
}

impl Excludes {
    pub fn add(&mut self, defn_id: u64, partition_id: u32, inst_id: u64) {
        self.by_defn
            .entry(defn_id)
            .or_default()
            .entry(partition_id)
            .or_default()
            .insert(inst_id);
    }

    pub fn contains(&self, defn_id: u64, partition_id: u32, inst_id: u64) -> bool {
        self.by_defn
            .get(&defn_id)
            .and_then(|parts| parts.get(&partition_id))
            .map_or(false, |insts| insts.contains(&inst_id))
    }

    pub fn is_empty(&self) -> bool {
        self.by_defn.is_empty()
    }
}

/// One scattered shard of a logical scan per entry: the union of `partitions`
/// covers every partition of the chosen replica plan exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    pub endpoints: Vec<String>,
    pub target_defn: u64,
    pub inst_ids: Vec<u64>,
    pub rollback_times: Vec<i64>,
    pub partitions: Vec<Vec<u32>>,
    pub num_partitions: u32,
}

#[async_trait]
pub trait MetadataBridge: Send + Sync + 'static {
    /// Pull the full index catalog. Returns `(indexes, admin version,
    /// cluster version)`.
    async fn refresh(&self) -> crate::Result<(Vec<Arc<IndexMetadata>>, u64, (u32, u32))>;

    /// Known indexer nodes with their admin/query/http endpoints.
    fn nodes(&self) -> crate::Result<Vec<IndexerNode>>;

    async fn create_index(&self, defn: IndexDefn) -> crate::Result<u64>;
    async fn build_indexes(&self, defn_ids: &[u64]) -> crate::Result<()>;
    async fn drop_index(&self, defn_id: u64) -> crate::Result<()>;
    async fn move_index(&self, defn_id: u64, destinations: Vec<String>) -> crate::Result<()>;
    async fn alter_replica_count(&self, defn_id: u64, count: u32) -> crate::Result<()>;

    /// Plan a scatter for `defn_id`, avoiding `excludes` and the definitions
    /// in `skips`. Returns `None` when no healthy combination covers every
    /// partition.
    fn get_scanport(
        &self,
        defn_id: u64,
        excludes: &Excludes,
        skips: &HashSet<u64>,
    ) -> Option<ScanPlan>;

    fn index_defn(&self, defn_id: u64) -> crate::Result<IndexDefn>;
    fn index_inst(&self, defn_id: u64, inst_id: u64) -> crate::Result<IndexInst>;
    fn index_replicas(&self, defn_id: u64) -> crate::Result<Vec<IndexInst>>;

    /// Folded state across the definition's instances, or the error.
    fn index_state(&self, defn_id: u64) -> crate::Result<IndexState>;

    /// Integrate a per-instance scan elapsed time into the moving average
    /// used to bias replica selection.
    fn timeit(&self, inst_id: u64, partition_id: u32, elapsed: Duration);

    /// Instance-partitions of `defn_id` hosted on the node serving the given
    /// scan endpoint, for whole-node exclusion after a gone error.
    fn instances_on_endpoint(&self, defn_id: u64, endpoint: &str) -> Vec<(u32, u64)>;

    /// HTTP endpoint of the node behind a scan endpoint, if known.
    fn http_endpoint_for(&self, endpoint: &str) -> Option<String> {
        let _ = endpoint;
        None
    }
}

/// Moving average of scan latency per `(instance, partition)`.
#[derive(Debug, Default)]
pub(crate) struct LoadStats {
    averages: HashMap<(u64, u32), f64>,
}

impl LoadStats {
    pub(crate) fn observe(&mut self, inst_id: u64, partition_id: u32, elapsed: Duration) {
        let sample = elapsed.as_secs_f64();
        let avg = self.averages.entry((inst_id, partition_id)).or_insert(sample);
        *avg = *avg * 0.8 + sample * 0.2;
    }

    fn average(&self, inst_id: u64, partition_id: u32) -> f64 {
        self.averages
            .get(&(inst_id, partition_id))
            .copied()
            .unwrap_or_default()
    }
}

/// Choose instances per partition and fold them into per-endpoint tuples.
///
/// Selection prefers, per partition: not excluded, active, on a healthy
/// node, lowest latency average, then round-robin by replica id. Partitions
/// may come from different replicas so long as each is covered exactly once.
pub(crate) fn plan_scan(
    catalog: &Catalog,
    defn_id: u64,
    excludes: &Excludes,
    skips: &HashSet<u64>,
    load: &LoadStats,
    rr: usize,
) -> Option<ScanPlan> {
    if skips.contains(&defn_id) {
        return None;
    }
    let meta = catalog.index(defn_id).ok()?;
    let num_partitions = meta.defn.partition_count();

    // inst_id → (rollback_time, endpoint, partitions)
    let mut tuples: HashMap<u64, (i64, String, Vec<u32>)> = HashMap::new();
    let mut order: Vec<u64> = Vec::new();

    for partition_id in 0..num_partitions {
        let mut candidates: Vec<&IndexInst> = meta
            .insts
            .iter()
            .filter(|inst| inst.state == IndexState::Active)
            .filter(|inst| !excludes.contains(defn_id, partition_id, inst.inst_id))
            .filter(|inst| {
                inst.node_for(partition_id)
                    .and_then(|n| catalog.nodes.get(n))
                    .map_or(false, IndexerNode::is_healthy)
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        candidates.sort_by(|a, b| {
            let load_a = load.average(a.inst_id, partition_id);
            let load_b = load.average(b.inst_id, partition_id);
            load_a
                .partial_cmp(&load_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    // Round-robin among equally-loaded replicas.
                    let spin = |inst: &IndexInst| {
                        (inst.replica_id as usize + meta.insts.len() - rr % meta.insts.len().max(1))
                            % meta.insts.len().max(1)
                    };
                    spin(a).cmp(&spin(b))
                })
        });
        let chosen = candidates[0];

        let node = chosen.node_for(partition_id).expect("filtered above");
        let endpoint = catalog.nodes[node].query.clone();
        let entry = tuples.entry(chosen.inst_id).or_insert_with(|| {
            order.push(chosen.inst_id);
            (chosen.rollback_time, endpoint, Vec::new())
        });
        entry.2.push(partition_id);
    }

    let mut plan = ScanPlan {
        endpoints: Vec::with_capacity(order.len()),
        target_defn: defn_id,
        inst_ids: Vec::with_capacity(order.len()),
        rollback_times: Vec::with_capacity(order.len()),
        partitions: Vec::with_capacity(order.len()),
        num_partitions,
    };
    for inst_id in order {
        let (rollback_time, endpoint, partitions) = tuples.remove(&inst_id).unwrap();
        plan.endpoints.push(endpoint);
        plan.inst_ids.push(inst_id);
        plan.rollback_times.push(rollback_time);
        plan.partitions.push(partitions);
    }
    Some(plan)
}

/// Wire shape of `GET /getIndexMetadata`.
#[derive(Debug, Deserialize)]
struct CatalogResponse {
    version: u64,
    nodes: Vec<IndexerNode>,
    indexes: Vec<IndexMetadata>,
}

/// Metadata bridge over the indexer admin HTTP surface, discovering admin
/// endpoints through the topology cache.
pub struct HttpBridge {
    http: reqwest::Client,
    auth: Arc<dyn CredentialsProvider>,
    topo: topology::TopologyCache,
    catalog: RwLock<Arc<Catalog>>,
    load: Mutex<LoadStats>,
    rr: AtomicUsize,
    retry: topology::retry::Retry,
}

impl HttpBridge {
    pub fn new(
        http: reqwest::Client,
        topo: topology::TopologyCache,
        auth: Arc<dyn CredentialsProvider>,
    ) -> Self {
        Self {
            http,
            auth,
            topo,
            catalog: RwLock::new(Arc::new(Catalog::default())),
            load: Mutex::new(LoadStats::default()),
            rr: AtomicUsize::new(0),
            retry: topology::retry::Retry::new(5, Duration::from_millis(100), 2),
        }
    }

    fn catalog(&self) -> Arc<Catalog> {
        self.catalog.read().unwrap().clone()
    }

    /// Admin endpoints of every index node, from the current topology.
    fn admin_endpoints(&self) -> crate::Result<Vec<String>> {
        let nodes = self.topo.nodes()?;
        let mut endpoints = Vec::new();
        for id in nodes.nodes_by_service(SERVICE_INDEX) {
            endpoints.push(nodes.service_address(id, SERVICE_INDEX_ADMIN, false)?);
        }
        if endpoints.is_empty() {
            return Err(crate::Error::Topology(topology::Error::not_found(
                "service",
                SERVICE_INDEX,
            )));
        }
        Ok(endpoints)
    }

    async fn admin_get<T: serde::de::DeserializeOwned>(&self, path: &str) -> crate::Result<T> {
        let endpoints = self.admin_endpoints()?;

        self.retry
            .run_filtered(
                |err| !matches!(err, crate::Error::Json(_)),
                |attempt, _last: Option<&crate::Error>| {
                    // Walk the admin endpoints round-robin across attempts.
                    let endpoint = endpoints[attempt as usize % endpoints.len()].clone();
                    async move {
                        let url = format!("http://{endpoint}{path}");
                        let (user, password) = self.auth.credentials();
                        let response = self
                            .http
                            .get(&url)
                            .basic_auth(user, Some(password))
                            .send()
                            .await?;
                        if !response.status().is_success() {
                            return Err(crate::Error::HttpStatus {
                                endpoint: url,
                                status: response.status(),
                            });
                        }
                        Ok(response.json().await?)
                    }
                },
            )
            .await
    }

    async fn admin_post<B: serde::Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> crate::Result<()> {
        let endpoints = self.admin_endpoints()?;

        self.retry
            .run_filtered(
                // Only transient control failures are retried.
                |err| {
                    matches!(err, crate::Error::HttpStatus { status, .. } if status.is_server_error())
                        || matches!(err, crate::Error::Http(_))
                },
                |attempt, _last: Option<&crate::Error>| {
                    let endpoint = endpoints[attempt as usize % endpoints.len()].clone();
                    async move {
                        let url = format!("http://{endpoint}{path}");
                        let (user, password) = self.auth.credentials();
                        let response = self
                            .http
                            .post(&url)
                            .basic_auth(user, Some(password))
                            .json(body)
                            .send()
                            .await?;
                        if !response.status().is_success() {
                            return Err(crate::Error::HttpStatus {
                                endpoint: url,
                                status: response.status(),
                            });
                        }
                        Ok(())
                    }
                },
            )
            .await
    }
}

#[async_trait]
impl MetadataBridge for HttpBridge {
    async fn refresh(&self) -> crate::Result<(Vec<Arc<IndexMetadata>>, u64, (u32, u32))> {
        let response: CatalogResponse = self.admin_get("/getIndexMetadata").await?;
        let cluster_version = self
            .topo
            .nodes()
            .map(|n| n.cluster_version())
            .unwrap_or_default();

        let catalog = Arc::new(Catalog {
            version: response.version,
            cluster_version,
            nodes: response.nodes,
            indexes: response.indexes.into_iter().map(Arc::new).collect(),
        });
        *self.catalog.write().unwrap() = catalog.clone();

        tracing::debug!(
            version = catalog.version,
            indexes = catalog.indexes.len(),
            "refreshed index catalog"
        );
        Ok((catalog.indexes.clone(), catalog.version, cluster_version))
    }

    fn nodes(&self) -> crate::Result<Vec<IndexerNode>> {
        Ok(self.catalog().nodes.clone())
    }

    async fn create_index(&self, defn: IndexDefn) -> crate::Result<u64> {
        #[derive(Deserialize)]
        struct Created {
            defn_id: u64,
        }
        let endpoints = self.admin_endpoints()?;
        let endpoint = endpoints[0].clone();
        let url = format!("http://{endpoint}/createIndex");
        let (user, password) = self.auth.credentials();
        let response = self
            .http
            .post(&url)
            .basic_auth(user, Some(password))
            .json(&defn)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(crate::Error::HttpStatus {
                endpoint: url,
                status: response.status(),
            });
        }
        let created: Created = response.json().await?;
        Ok(created.defn_id)
    }

    async fn build_indexes(&self, defn_ids: &[u64]) -> crate::Result<()> {
        self.admin_post("/buildIndex", &serde_json::json!({ "defn_ids": defn_ids }))
            .await
    }

    async fn drop_index(&self, defn_id: u64) -> crate::Result<()> {
        self.admin_post("/dropIndex", &serde_json::json!({ "defn_id": defn_id }))
            .await
    }

    async fn move_index(&self, defn_id: u64, destinations: Vec<String>) -> crate::Result<()> {
        self.admin_post(
            "/moveIndex",
            &serde_json::json!({ "defn_id": defn_id, "nodes": destinations }),
        )
        .await
    }

    async fn alter_replica_count(&self, defn_id: u64, count: u32) -> crate::Result<()> {
        self.admin_post(
            "/alterIndex",
            &serde_json::json!({ "defn_id": defn_id, "num_replica": count }),
        )
        .await
    }

    fn get_scanport(
        &self,
        defn_id: u64,
        excludes: &Excludes,
        skips: &HashSet<u64>,
    ) -> Option<ScanPlan> {
        let rr = self.rr.fetch_add(1, Ordering::Relaxed);
        let load = self.load.lock().unwrap();
        plan_scan(&self.catalog(), defn_id, excludes, skips, &load, rr)
    }

    fn index_defn(&self, defn_id: u64) -> crate::Result<IndexDefn> {
        Ok(self.catalog().index(defn_id)?.defn.clone())
    }

    fn index_inst(&self, defn_id: u64, inst_id: u64) -> crate::Result<IndexInst> {
        let catalog = self.catalog();
        let meta = catalog.index(defn_id)?;
        meta.insts
            .iter()
            .find(|inst| inst.inst_id == inst_id)
            .cloned()
            .ok_or(crate::Error::IndexNotFound(defn_id))
    }

    fn index_replicas(&self, defn_id: u64) -> crate::Result<Vec<IndexInst>> {
        Ok(self.catalog().index(defn_id)?.insts.clone())
    }

    fn index_state(&self, defn_id: u64) -> crate::Result<IndexState> {
        let catalog = self.catalog();
        let meta = catalog.index(defn_id)?;
        Ok(fold_index_state(&meta.insts))
    }

    fn timeit(&self, inst_id: u64, partition_id: u32, elapsed: Duration) {
        self.load
            .lock()
            .unwrap()
            .observe(inst_id, partition_id, elapsed);
    }

    fn instances_on_endpoint(&self, defn_id: u64, endpoint: &str) -> Vec<(u32, u64)> {
        self.catalog().instances_on_endpoint(defn_id, endpoint)
    }

    fn http_endpoint_for(&self, endpoint: &str) -> Option<String> {
        self.catalog().http_endpoint_for(endpoint)
    }
}

/// The most-advanced healthy state wins; `Error` dominates everything, and a
/// fully-deleted definition reports `Deleted`.
fn fold_index_state(insts: &[IndexInst]) -> IndexState {
    if insts.iter().any(|i| i.state == IndexState::Error) {
        return IndexState::Error;
    }
    if !insts.is_empty() && insts.iter().all(|i| i.state == IndexState::Deleted) {
        return IndexState::Deleted;
    }
    let rank = |state: IndexState| match state {
        IndexState::Active => 5,
        IndexState::Catchup => 4,
        IndexState::Initial => 3,
        IndexState::Ready => 2,
        IndexState::Created => 1,
        IndexState::Deleted | IndexState::Error => 0,
    };
    insts
        .iter()
        .map(|i| i.state)
        .max_by_key(|s| rank(*s))
        .unwrap_or(IndexState::Created)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// A catalog of one definition with `replicas` instances, each hosting
    /// all `partitions` on its own node.
    pub(crate) fn catalog(replicas: usize, partitions: u32) -> Catalog {
        let nodes = (0..replicas)
            .map(|i| IndexerNode {
                node_uuid: format!("uuid-{i}"),
                admin: format!("n{i}:9100"),
                query: format!("n{i}:9101"),
                http: format!("n{i}:9102"),
                status: "healthy".to_string(),
            })
            .collect();

        let insts = (0..replicas)
            .map(|i| IndexInst {
                inst_id: 11 * (i as u64 + 1),
                replica_id: i as u32,
                state: IndexState::Active,
                error: String::new(),
                partitions: (0..partitions.max(1))
                    .map(|p| PartitionPlacement {
                        partition_id: p,
                        node: i,
                    })
                    .collect(),
                rollback_time: 7_000 + i as i64,
            })
            .collect();

        Catalog {
            version: 1,
            cluster_version: (7, 6),
            nodes,
            indexes: vec![Arc::new(IndexMetadata {
                defn: IndexDefn {
                    defn_id: 1,
                    name: "idx".to_string(),
                    bucket: "travel".to_string(),
                    is_primary: false,
                    using: "plasma".to_string(),
                    num_replica: replicas as u32 - 1,
                    num_partition: partitions,
                    ..IndexDefn::default()
                },
                insts,
            })],
        }
    }

    #[test]
    fn plan_covers_every_partition_exactly_once() {
        let catalog = catalog(2, 4);
        let plan = plan_scan(
            &catalog,
            1,
            &Excludes::default(),
            &HashSet::new(),
            &LoadStats::default(),
            0,
        )
        .unwrap();

        let mut covered: Vec<u32> = plan.partitions.iter().flatten().copied().collect();
        covered.sort();
        assert_eq!(covered, vec![0, 1, 2, 3]);
        assert_eq!(plan.num_partitions, 4);
        assert_eq!(plan.endpoints.len(), plan.inst_ids.len());
        assert_eq!(plan.endpoints.len(), plan.partitions.len());
    }

    #[test]
    fn excluded_instances_are_not_chosen() {
        let catalog = catalog(2, 2);
        let mut excludes = Excludes::default();
        excludes.add(1, 0, 11);
        excludes.add(1, 1, 11);

        let plan = plan_scan(
            &catalog,
            1,
            &excludes,
            &HashSet::new(),
            &LoadStats::default(),
            0,
        )
        .unwrap();
        assert_eq!(plan.inst_ids, vec![22]);
        assert_eq!(plan.endpoints, vec!["n1:9101".to_string()]);
    }

    #[test]
    fn fully_excluded_partition_yields_no_plan() {
        let catalog = catalog(2, 1);
        let mut excludes = Excludes::default();
        excludes.add(1, 0, 11);
        excludes.add(1, 0, 22);

        assert!(plan_scan(
            &catalog,
            1,
            &excludes,
            &HashSet::new(),
            &LoadStats::default(),
            0
        )
        .is_none());
    }

    #[test]
    fn unhealthy_nodes_are_filtered_and_replicas_may_mix() {
        let mut catalog = catalog(2, 2);
        // Replica 0's node degrades; both partitions shift to replica 1.
        catalog.nodes[0].status = "unhealthy".to_string();

        let plan = plan_scan(
            &catalog,
            1,
            &Excludes::default(),
            &HashSet::new(),
            &LoadStats::default(),
            0,
        )
        .unwrap();
        assert_eq!(plan.inst_ids, vec![22]);
    }

    #[test]
    fn latency_bias_prefers_the_faster_replica() {
        let catalog = catalog(2, 1);
        let mut load = LoadStats::default();
        load.observe(11, 0, Duration::from_millis(900));
        load.observe(22, 0, Duration::from_millis(10));

        for rr in 0..4 {
            let plan = plan_scan(&catalog, 1, &Excludes::default(), &HashSet::new(), &load, rr)
                .unwrap();
            assert_eq!(plan.inst_ids, vec![22], "rr={rr}");
        }
    }

    #[test]
    fn skipped_definitions_are_refused() {
        let catalog = catalog(2, 1);
        let skips = HashSet::from([1]);
        assert!(plan_scan(
            &catalog,
            1,
            &Excludes::default(),
            &skips,
            &LoadStats::default(),
            0
        )
        .is_none());
    }

    #[test]
    fn index_state_folds_to_the_most_advanced() {
        let mut insts = catalog(3, 1).indexes[0].insts.clone();
        insts[0].state = IndexState::Initial;
        insts[1].state = IndexState::Active;
        insts[2].state = IndexState::Ready;
        assert_eq!(fold_index_state(&insts), IndexState::Active);

        insts[1].state = IndexState::Error;
        assert_eq!(fold_index_state(&insts), IndexState::Error);

        for inst in &mut insts {
            inst.state = IndexState::Deleted;
        }
        assert_eq!(fold_index_state(&insts), IndexState::Deleted);
    }
}
