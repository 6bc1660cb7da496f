//! Scatter-gather request broker.
//!
//! A logical scan is resolved by the metadata bridge into per-endpoint
//! tuples, driven concurrently through pooled scan clients, and merged back
//! into one row stream. Gone endpoints trigger a bounded replan that
//! excludes every instance hosted on the failed node; other failures surface
//! as one combined error.

use crate::bridge::{Excludes, MetadataBridge, ScanPlan};
use crate::client::ScanClient;
use scan_proto::collate;
use scan_proto::messages::{
    CountRequest, DataEncoding, GroupAggr, IndexEntry, IndexProjection, ResponseStream, Scan,
    ScanAllRequest, ScanRequest,
};
use scan_proto::{Consistency, TsVector};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use topology::CredentialsProvider;

/// Capacity of each per-tuple chunk channel.
const TUPLE_BUFFER: usize = 8;
/// Capacity of the merged row channel handed to the caller.
const ROW_BUFFER: usize = 256;

/// One logical scan against an index definition, before scattering.
#[derive(Debug, Clone, Default)]
pub struct LogicalScan {
    pub defn_id: u64,
    pub is_primary: bool,
    /// Composite spans or equality seeks; ignored when `scan_all` is set.
    pub scans: Vec<Scan>,
    pub scan_all: bool,
    pub distinct: bool,
    pub reverse: bool,
    /// Zero means unlimited.
    pub limit: u64,
    pub offset: u64,
    /// Preserve index order across endpoints with a streaming merge.
    pub sorted: bool,
    pub projection: Option<IndexProjection>,
    pub group_aggr: Option<GroupAggr>,
    pub consistency: Consistency,
    pub vector: Option<TsVector>,
    pub data_encoding: DataEncoding,
}

/// The caller-facing row stream of one scattered scan. Dropping it cancels
/// outstanding endpoint streams (which drain before pool return).
pub struct ScanStream {
    rx: mpsc::Receiver<crate::Result<IndexEntry>>,
    cancel: CancellationToken,
}

impl ScanStream {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn next(&mut self) -> Option<crate::Result<IndexEntry>> {
        self.rx.recv().await
    }
}

impl futures::Stream for ScanStream {
    type Item = crate::Result<IndexEntry>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub struct RequestBroker {
    inner: Arc<Inner>,
}

struct Inner {
    bridge: Arc<dyn MetadataBridge>,
    clients: Mutex<HashMap<String, Arc<ScanClient>>>,
    http: reqwest::Client,
    auth: Arc<dyn CredentialsProvider>,
    config: crate::Config,
}

impl RequestBroker {
    pub fn new(
        bridge: Arc<dyn MetadataBridge>,
        http: reqwest::Client,
        auth: Arc<dyn CredentialsProvider>,
        config: crate::Config,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bridge,
                clients: Mutex::new(HashMap::new()),
                http,
                auth,
                config,
            }),
        }
    }

    pub fn bridge(&self) -> &Arc<dyn MetadataBridge> {
        &self.inner.bridge
    }

    /// The cached (or freshly dialed) scan client for an endpoint.
    pub async fn client_for(&self, endpoint: &str) -> crate::Result<Arc<ScanClient>> {
        self.inner.client_for(endpoint).await
    }

    /// Close every endpoint pool and forget the clients.
    pub fn close_all(&self) {
        let clients: Vec<_> = self.inner.clients.lock().unwrap().drain().collect();
        for (_, client) in clients {
            client.close();
        }
    }

    /// Scatter `scan` and stream merged rows back. The stream yields either
    /// every matching row exactly once followed by end-of-stream, or rows
    /// followed by one error; it never silently truncates.
    pub fn scan(&self, scan: LogicalScan) -> ScanStream {
        let (tx, rx) = mpsc::channel(ROW_BUFFER);
        let cancel = CancellationToken::new();
        tokio::spawn(run_scan(self.inner.clone(), scan, tx, cancel.clone()));
        ScanStream { rx, cancel }
    }

    /// Scatter a count over the scan's spans and sum the per-tuple results.
    pub async fn count(&self, scan: &LogicalScan) -> crate::Result<u64> {
        let spans = match cure_scans(scan) {
            Cured::Empty => return Ok(0),
            Cured::Spans(spans) => spans,
        };

        let mut excludes = Excludes::default();
        let skips = HashSet::new();
        let mut attempt = 0;

        loop {
            let plan = self
                .inner
                .bridge
                .get_scanport(scan.defn_id, &excludes, &skips)
                .ok_or(crate::Error::NoPlan(scan.defn_id))?;

            let calls = (0..plan.endpoints.len()).map(|i| {
                let inner = self.inner.clone();
                let plan = plan.clone();
                let spans = spans.clone();
                let scan = scan.clone();
                async move {
                    let result = async {
                        let client = inner.client_for(&plan.endpoints[i]).await?;
                        client
                            .multi_scan_count(CountRequest {
                                defn_id: plan.target_defn,
                                inst_id: plan.inst_ids[i],
                                partition_ids: plan.partitions[i].clone(),
                                scans: spans,
                                distinct: scan.distinct,
                                consistency: scan.consistency,
                                vector: scan.vector.clone(),
                                rollback_time: plan.rollback_times[i],
                            })
                            .await
                    }
                    .await;
                    (i, result)
                }
            });

            let mut total = 0u64;
            let mut failures = Vec::new();
            for (i, result) in futures::future::join_all(calls).await {
                match result {
                    Ok(count) => total += count,
                    Err(err) => failures.push((plan.endpoints[i].clone(), err)),
                }
            }

            if failures.is_empty() {
                return Ok(total);
            }
            if failures.iter().any(|(_, err)| !err.is_gone())
                || attempt >= self.inner.config.retry_scan_port
            {
                return Err(crate::combine_errors(failures));
            }
            attempt += 1;
            self.inner.exclude_failures(scan.defn_id, &failures, &mut excludes);
            tokio::time::sleep(self.inner.config.retry_wait).await;
        }
    }
}

impl Inner {
    /// Cached scan client for an endpoint, dialing (and helo-ing) on first
    /// use. A gone endpoint's client is evicted by the retry path.
    async fn client_for(self: &Arc<Self>, endpoint: &str) -> crate::Result<Arc<ScanClient>> {
        if let Some(client) = self.clients.lock().unwrap().get(endpoint) {
            return Ok(client.clone());
        }
        let http_endpoint = self
            .bridge
            .http_endpoint_for(endpoint)
            .unwrap_or_else(|| endpoint.to_string());
        let client = ScanClient::connect(
            endpoint.to_string(),
            http_endpoint,
            self.http.clone(),
            self.auth.clone(),
            self.config.clone(),
        )
        .await?;
        self.clients
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), client.clone());
        Ok(client)
    }

    fn evict_client(&self, endpoint: &str) {
        if let Some(client) = self.clients.lock().unwrap().remove(endpoint) {
            client.close();
        }
    }

    /// Mark every instance hosted on each failed endpoint's node as excluded.
    fn exclude_failures(
        &self,
        defn_id: u64,
        failures: &[(String, crate::Error)],
        excludes: &mut Excludes,
    ) {
        for (endpoint, err) in failures {
            tracing::warn!(endpoint, %err, "endpoint gone, excluding its instances");
            for (partition_id, inst_id) in self.bridge.instances_on_endpoint(defn_id, endpoint) {
                excludes.add(defn_id, partition_id, inst_id);
            }
            self.evict_client(endpoint);
        }
    }
}

enum Cured {
    /// The cured bounds imply an empty range; no endpoint is contacted.
    Empty,
    Spans(Vec<Scan>),
}

/// Cure primary-index range bounds: a primary key is always a byte sequence,
/// so a non-string bound collapses to *before everything* or *after
/// everything* by its JSON type rank.
fn cure_scans(scan: &LogicalScan) -> Cured {
    if scan.scan_all {
        return Cured::Spans(Vec::new());
    }
    if !scan.is_primary {
        return Cured::Spans(scan.scans.clone());
    }

    let mut cured = Vec::new();
    for span in &scan.scans {
        if let Some(equals) = &span.equals {
            // An equality seek on a non-string can never match a primary key.
            if equals.iter().all(serde_json::Value::is_string) {
                cured.push(span.clone());
            }
            continue;
        }

        let mut filters = Vec::with_capacity(span.filters.len());
        let mut empty = false;
        for filter in &span.filters {
            let mut filter = filter.clone();
            match cure_bound(filter.low.as_ref(), true) {
                Cure::Keep => {}
                Cure::Unbounded => filter.low = None,
                Cure::Empty => {
                    empty = true;
                    break;
                }
            }
            match cure_bound(filter.high.as_ref(), false) {
                Cure::Keep => {}
                Cure::Unbounded => filter.high = None,
                Cure::Empty => {
                    empty = true;
                    break;
                }
            }
            filters.push(filter);
        }
        if !empty {
            cured.push(Scan {
                filters,
                equals: None,
            });
        }
    }

    if cured.is_empty() {
        Cured::Empty
    } else {
        Cured::Spans(cured)
    }
}

enum Cure {
    Keep,
    Unbounded,
    Empty,
}

fn cure_bound(bound: Option<&serde_json::Value>, is_low: bool) -> Cure {
    use serde_json::Value;
    match bound {
        None | Some(Value::String(_)) => Cure::Keep,
        Some(value) => {
            // Strings sort after null/bool/number and before array/object.
            let before_all_keys = matches!(value, Value::Null | Value::Bool(_) | Value::Number(_));
            match (before_all_keys, is_low) {
                (true, true) | (false, false) => Cure::Unbounded,
                (true, false) | (false, true) => Cure::Empty,
            }
        }
    }
}

struct ScatterOutcome {
    /// `(inst_id, partitions, elapsed)` of every cleanly-finished tuple.
    successes: Vec<(u64, Vec<u32>, Duration)>,
    failures: Vec<(String, crate::Error)>,
    /// The merger stopped early because the limit was satisfied.
    limit_reached: bool,
}

async fn run_scan(
    inner: Arc<Inner>,
    scan: LogicalScan,
    tx: mpsc::Sender<crate::Result<IndexEntry>>,
    cancel: CancellationToken,
) {
    let spans = match cure_scans(&scan) {
        Cured::Empty => return, // Closing tx ends the stream with zero rows.
        Cured::Spans(spans) => spans,
    };

    let mut excludes = Excludes::default();
    let skips = HashSet::new();
    let mut rows_forwarded = 0u64;

    for attempt in 0..=inner.config.retry_scan_port {
        let Some(plan) = inner.bridge.get_scanport(scan.defn_id, &excludes, &skips) else {
            let _ = tx.send(Err(crate::Error::NoPlan(scan.defn_id))).await;
            return;
        };

        let outcome =
            scatter_once(&inner, &scan, &spans, &plan, &tx, &cancel, &mut rows_forwarded).await;

        if outcome.failures.is_empty() || outcome.limit_reached {
            // Clean success: feed the latency observations back for replica
            // selection. A cancelled tuple never reaches here, so the timing
            // statistic is not skewed by cancellation.
            for (inst_id, partitions, elapsed) in outcome.successes {
                for partition_id in partitions {
                    inner.bridge.timeit(inst_id, partition_id, elapsed);
                }
            }
            return;
        }

        if cancel.is_cancelled() {
            let _ = tx.send(Err(crate::Error::Cancelled)).await;
            return;
        }

        let all_gone = outcome.failures.iter().all(|(_, err)| err.is_gone());
        // Rows already forwarded cannot be replayed: a retry would duplicate
        // them. Declare the partial result as an error instead.
        if !all_gone || rows_forwarded > 0 || attempt == inner.config.retry_scan_port {
            let _ = tx.send(Err(crate::combine_errors(outcome.failures))).await;
            return;
        }

        inner.exclude_failures(scan.defn_id, &outcome.failures, &mut excludes);
        tokio::time::sleep(inner.config.retry_wait).await;
    }
}

/// Drive one plan: spawn a task per tuple, merge their chunk streams into
/// `tx`, and collect per-tuple results.
async fn scatter_once(
    inner: &Arc<Inner>,
    scan: &LogicalScan,
    spans: &[Scan],
    plan: &ScanPlan,
    tx: &mpsc::Sender<crate::Result<IndexEntry>>,
    cancel: &CancellationToken,
    rows_forwarded: &mut u64,
) -> ScatterOutcome {
    let child = cancel.child_token();
    let mut receivers = Vec::with_capacity(plan.endpoints.len());
    let mut tasks = Vec::with_capacity(plan.endpoints.len());

    for i in 0..plan.endpoints.len() {
        let (chunk_tx, chunk_rx) = mpsc::channel(TUPLE_BUFFER);
        receivers.push(chunk_rx);

        let inner = inner.clone();
        let endpoint = plan.endpoints[i].clone();
        let scan = scan.clone();
        let spans = spans.to_vec();
        let plan = plan.clone();
        let child = child.clone();

        tasks.push(tokio::spawn(async move {
            let started = Instant::now();
            let result = async {
                let client = inner.client_for(&endpoint).await?;
                if scan.scan_all {
                    client
                        .scan_all(
                            ScanAllRequest {
                                defn_id: plan.target_defn,
                                inst_id: plan.inst_ids[i],
                                partition_ids: plan.partitions[i].clone(),
                                limit: push_down_limit(&scan),
                                consistency: scan.consistency,
                                vector: scan.vector.clone(),
                                rollback_time: plan.rollback_times[i],
                                data_encoding: scan.data_encoding,
                            },
                            &chunk_tx,
                            &child,
                        )
                        .await
                } else {
                    let request = ScanRequest {
                        defn_id: plan.target_defn,
                        inst_id: plan.inst_ids[i],
                        partition_ids: plan.partitions[i].clone(),
                        scans: spans,
                        distinct: scan.distinct,
                        limit: push_down_limit(&scan),
                        reverse: scan.reverse,
                        projection: scan.projection.clone(),
                        group_aggr: scan.group_aggr.clone(),
                        consistency: scan.consistency,
                        vector: scan.vector.clone(),
                        rollback_time: plan.rollback_times[i],
                        data_encoding: scan.data_encoding,
                    };
                    if scan.group_aggr.is_some() || scan.projection.is_some() {
                        client.scan3(request, &chunk_tx, &child).await
                    } else {
                        client.multi_scan(request, &chunk_tx, &child).await
                    }
                }
            }
            .await;
            (i, started.elapsed(), result)
        }));
    }

    let limit_reached = if scan.sorted {
        merge_sorted(
            scan.data_encoding,
            scan.reverse,
            receivers,
            tx,
            scan.offset,
            scan.limit,
            rows_forwarded,
            &child,
        )
        .await
    } else {
        forward_unordered(receivers, tx, scan.offset, scan.limit, rows_forwarded, &child).await
    };

    let mut outcome = ScatterOutcome {
        successes: Vec::new(),
        failures: Vec::new(),
        limit_reached,
    };
    for task in tasks {
        let Ok((i, elapsed, result)) = task.await else {
            continue;
        };
        match result {
            Ok(()) => {
                outcome
                    .successes
                    .push((plan.inst_ids[i], plan.partitions[i].clone(), elapsed));
            }
            // Early ends the merger itself requested are not failures.
            Err(crate::Error::Cancelled) if limit_reached => {}
            Err(err) => outcome.failures.push((plan.endpoints[i].clone(), err)),
        }
    }
    outcome
}

/// Per-endpoint limit: each endpoint must produce enough rows to satisfy the
/// global offset plus limit, applied after the merge.
fn push_down_limit(scan: &LogicalScan) -> u64 {
    if scan.limit == 0 {
        0
    } else {
        scan.limit + scan.offset
    }
}

/// Forward chunks in arrival order, applying offset and limit. Returns true
/// when the limit was satisfied (remaining endpoint streams are cancelled).
async fn forward_unordered(
    receivers: Vec<mpsc::Receiver<ResponseStream>>,
    tx: &mpsc::Sender<crate::Result<IndexEntry>>,
    offset: u64,
    limit: u64,
    rows_forwarded: &mut u64,
    child: &CancellationToken,
) -> bool {
    use futures::StreamExt;
    let mut streams = futures::stream::select_all(
        receivers
            .into_iter()
            .map(tokio_stream::wrappers::ReceiverStream::new),
    );

    let mut skipped = 0u64;
    while let Some(chunk) = streams.next().await {
        for entry in chunk.entries {
            if skipped < offset {
                skipped += 1;
                continue;
            }
            if limit > 0 && *rows_forwarded >= limit {
                child.cancel();
                return true;
            }
            if tx.send(Ok(entry)).await.is_err() {
                child.cancel();
                return true;
            }
            *rows_forwarded += 1;
        }
    }
    if limit > 0 && *rows_forwarded >= limit {
        child.cancel();
        return true;
    }
    false
}

/// Key wrapper ordering heap entries by index collation.
struct HeapEntry {
    entry: IndexEntry,
    source: usize,
    encoding: DataEncoding,
    reverse: bool,
}

impl HeapEntry {
    fn cmp_keys(&self, other: &Self) -> std::cmp::Ordering {
        let ord = collate::compare_keys(self.encoding, &self.entry.key, &other.entry.key);
        if self.reverse {
            ord.reverse()
        } else {
            ord
        }
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_keys(other) == std::cmp::Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; flip to pop the smallest key first.
        self.cmp_keys(other).reverse()
    }
}

struct MergeSource {
    rx: mpsc::Receiver<ResponseStream>,
    queue: VecDeque<IndexEntry>,
}

impl MergeSource {
    /// Next buffered entry, pulling chunks as needed. `None` at stream end.
    async fn next(&mut self) -> Option<IndexEntry> {
        loop {
            if let Some(entry) = self.queue.pop_front() {
                return Some(entry);
            }
            let chunk = self.rx.recv().await?;
            self.queue.extend(chunk.entries);
        }
    }
}

/// Streaming k-way merge by index collation. Each endpoint stream is already
/// ordered; the heap holds one head entry per live source.
async fn merge_sorted(
    encoding: DataEncoding,
    reverse: bool,
    receivers: Vec<mpsc::Receiver<ResponseStream>>,
    tx: &mpsc::Sender<crate::Result<IndexEntry>>,
    offset: u64,
    limit: u64,
    rows_forwarded: &mut u64,
    child: &CancellationToken,
) -> bool {
    let mut sources: Vec<MergeSource> = receivers
        .into_iter()
        .map(|rx| MergeSource {
            rx,
            queue: VecDeque::new(),
        })
        .collect();

    let mut heap = BinaryHeap::with_capacity(sources.len());
    for (i, source) in sources.iter_mut().enumerate() {
        if let Some(entry) = source.next().await {
            heap.push(HeapEntry {
                entry,
                source: i,
                encoding,
                reverse,
            });
        }
    }

    let mut skipped = 0u64;
    while let Some(head) = heap.pop() {
        let source = head.source;

        if skipped < offset {
            skipped += 1;
        } else {
            if limit > 0 && *rows_forwarded >= limit {
                child.cancel();
                return true;
            }
            if tx.send(Ok(head.entry)).await.is_err() {
                child.cancel();
                return true;
            }
            *rows_forwarded += 1;
        }

        if let Some(entry) = sources[source].next().await {
            heap.push(HeapEntry {
                entry,
                source,
                encoding,
                reverse,
            });
        }
    }
    if limit > 0 && *rows_forwarded >= limit {
        child.cancel();
        return true;
    }
    false
}
