//! Protocol driver for one indexer endpoint.
//!
//! Each call checks a connection out of the endpoint pool, writes one framed
//! request, and reads streamed response frames until the terminal stream-end
//! frame. A connection goes back to the pool as healthy only when the stream
//! end was observed; anything else discards it.

use crate::conn::Conn;
use crate::pool::Pool;
use scan_proto::messages::{
    CountRequest, HeloRequest, IndexStatistics, Inclusion, Message, ResponseStream, Scan,
    ScanAllRequest, ScanRequest, StatisticsRequest, PROTOCOL_VERSION,
};
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use topology::CredentialsProvider;

pub struct ScanClient {
    endpoint: String,
    /// The indexer's HTTP port, for out-of-band storage statistics.
    http_endpoint: String,
    pool: Pool,
    config: crate::Config,
    http: reqwest::Client,
    auth: Arc<dyn CredentialsProvider>,
    /// Learned from the helo exchange. Zero means a legacy server: session
    /// consistency then requires a caller-supplied vector.
    server_version: AtomicU32,
}

/// Per-partition storage statistics from `GET /stats/storage`.
#[derive(Debug, Clone, Deserialize)]
pub struct PartitionStorageStats {
    #[serde(rename = "partitionId")]
    pub partition_id: u32,
    pub id: u64,
    #[serde(default)]
    pub stats: StorageStats,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageStats {
    #[serde(default)]
    pub num_pages: Option<u64>,
    #[serde(default)]
    pub items_count: Option<u64>,
    #[serde(default)]
    pub resident_ratio: Option<f64>,
    #[serde(default)]
    pub inserts: Option<u64>,
    #[serde(default)]
    pub deletes: Option<u64>,
    #[serde(default)]
    pub avg_item_size: Option<u64>,
    #[serde(default)]
    pub avg_page_size: Option<u64>,
    /// Memory-optimized storage reports only items and data size.
    #[serde(default)]
    pub data_size: Option<u64>,
}

enum Next {
    Cancel,
    Msg(crate::Result<Message>),
}

impl ScanClient {
    /// Connect to a scan endpoint and perform the helo exchange.
    pub async fn connect(
        endpoint: String,
        http_endpoint: String,
        http: reqwest::Client,
        auth: Arc<dyn CredentialsProvider>,
        config: crate::Config,
    ) -> crate::Result<Arc<Self>> {
        let pool = Pool::new(endpoint.clone(), &config);
        let client = Arc::new(Self {
            endpoint,
            http_endpoint,
            pool,
            config,
            http,
            auth,
            server_version: AtomicU32::new(0),
        });
        client.helo().await?;
        Ok(client)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn server_version(&self) -> u32 {
        self.server_version.load(Ordering::Relaxed)
    }

    /// Close the endpoint pool; in-flight calls fail on their next checkout.
    pub fn close(&self) {
        self.pool.close();
    }

    async fn helo(&self) -> crate::Result<()> {
        let mut conn = self.pool.get().await?;
        let result = async {
            conn.send(
                Message::Helo(HeloRequest {
                    version: PROTOCOL_VERSION,
                }),
                self.config.write_deadline,
            )
            .await?;
            match conn.recv(self.config.read_deadline).await? {
                Message::HeloAck(ack) => {
                    self.server_version.store(ack.version, Ordering::Relaxed);
                    Ok(())
                }
                _ => Err(crate::Error::Protocol("expected a helo acknowledgement")),
            }
        }
        .await;
        self.pool.put(conn, result.is_ok());
        result
    }

    /// Equality-seek scan.
    pub async fn lookup(
        &self,
        mut req: ScanRequest,
        equals: Vec<Vec<serde_json::Value>>,
        sink: &mpsc::Sender<ResponseStream>,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        req.scans = equals
            .into_iter()
            .map(|seek| Scan {
                equals: Some(seek),
                ..Scan::default()
            })
            .collect();
        self.stream_scan(Message::Scan(req), sink, cancel).await
    }

    /// Single-range scan.
    pub async fn range(
        &self,
        mut req: ScanRequest,
        low: Option<serde_json::Value>,
        high: Option<serde_json::Value>,
        inclusion: Inclusion,
        sink: &mpsc::Sender<ResponseStream>,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        req.scans = vec![Scan {
            filters: vec![scan_proto::messages::CompositeElementFilter {
                low,
                high,
                inclusion,
            }],
            equals: None,
        }];
        self.stream_scan(Message::Scan(req), sink, cancel).await
    }

    /// Full-index scan.
    pub async fn scan_all(
        &self,
        req: ScanAllRequest,
        sink: &mpsc::Sender<ResponseStream>,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        self.stream_scan(Message::ScanAll(req), sink, cancel).await
    }

    /// Composite multi-span scan; `req.scans` is already built.
    pub async fn multi_scan(
        &self,
        req: ScanRequest,
        sink: &mpsc::Sender<ResponseStream>,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        self.stream_scan(Message::Scan(req), sink, cancel).await
    }

    /// Scan with grouping, aggregation, and projection pushed down.
    pub async fn scan3(
        &self,
        req: ScanRequest,
        sink: &mpsc::Sender<ResponseStream>,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        self.stream_scan(Message::Scan(req), sink, cancel).await
    }

    pub async fn count_lookup(
        &self,
        mut req: CountRequest,
        equals: Vec<Vec<serde_json::Value>>,
    ) -> crate::Result<u64> {
        req.scans = equals
            .into_iter()
            .map(|seek| Scan {
                equals: Some(seek),
                ..Scan::default()
            })
            .collect();
        self.count_exchange(Message::Count(req)).await
    }

    pub async fn count_range(
        &self,
        mut req: CountRequest,
        low: Option<serde_json::Value>,
        high: Option<serde_json::Value>,
        inclusion: Inclusion,
    ) -> crate::Result<u64> {
        req.scans = vec![Scan {
            filters: vec![scan_proto::messages::CompositeElementFilter {
                low,
                high,
                inclusion,
            }],
            equals: None,
        }];
        self.count_exchange(Message::Count(req)).await
    }

    /// Count over pre-built composite spans.
    pub async fn multi_scan_count(&self, req: CountRequest) -> crate::Result<u64> {
        self.count_exchange(Message::Count(req)).await
    }

    /// Key-distribution statistics for one span.
    pub async fn statistics(&self, req: StatisticsRequest) -> crate::Result<IndexStatistics> {
        let mut conn = self.pool.get().await?;
        let result = async {
            conn.send(Message::Statistics(req), self.config.write_deadline)
                .await?;
            match conn.recv(self.config.read_deadline).await? {
                Message::StatisticsResult(resp) => match resp.err {
                    Some(err) => Err(crate::Error::Server(err)),
                    None => Ok(resp.stats),
                },
                _ => Err(crate::Error::Protocol("expected a statistics response")),
            }
        }
        .await;
        let healthy = matches!(&result, Ok(_) | Err(crate::Error::Server(_)));
        self.pool.put(conn, healthy);
        result
    }

    /// Per-partition storage statistics over the indexer's HTTP port.
    pub async fn storage_statistics(&self) -> crate::Result<Vec<PartitionStorageStats>> {
        let endpoint = format!("http://{}/stats/storage", self.http_endpoint);
        let (user, password) = self.auth.credentials();
        let response = self
            .http
            .get(&endpoint)
            .basic_auth(user, Some(password))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(crate::Error::HttpStatus {
                endpoint,
                status: response.status(),
            });
        }
        Ok(response.json().await?)
    }

    async fn stream_scan(
        &self,
        req: Message,
        sink: &mpsc::Sender<ResponseStream>,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        let mut conn = self.pool.get().await?;
        let (saw_end, result) = self.drive_stream(&mut conn, req, sink, cancel).await;
        // The connection is reusable only when the stream was fully drained.
        self.pool.put(conn, saw_end);
        result
    }

    async fn drive_stream(
        &self,
        conn: &mut Conn,
        req: Message,
        sink: &mpsc::Sender<ResponseStream>,
        cancel: &CancellationToken,
    ) -> (bool, crate::Result<()>) {
        if let Err(err) = conn.send(req, self.config.write_deadline).await {
            return (false, Err(err));
        }

        let mut result: crate::Result<()> = Ok(());
        let mut draining = false;

        loop {
            let next = if draining {
                Next::Msg(conn.recv(self.config.read_deadline).await)
            } else {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Next::Cancel,
                    msg = conn.recv(self.config.read_deadline) => Next::Msg(msg),
                }
            };

            match next {
                Next::Cancel => {
                    if let Err(err) = conn.send(Message::EndStream, self.config.write_deadline).await
                    {
                        return (false, Err(err));
                    }
                    draining = true;
                    result = Err(crate::Error::Cancelled);
                }
                Next::Msg(Ok(Message::Stream(chunk))) => {
                    if draining {
                        continue;
                    }
                    if sink.send(chunk).await.is_err() {
                        // The consumer hung up (limit satisfied); end the
                        // stream early but keep draining to the end marker.
                        if let Err(err) =
                            conn.send(Message::EndStream, self.config.write_deadline).await
                        {
                            return (false, Err(err));
                        }
                        draining = true;
                    }
                }
                Next::Msg(Ok(Message::StreamEnd(end))) => {
                    if let (Ok(()), Some(err)) = (&result, end.err) {
                        result = Err(crate::Error::Server(err));
                    }
                    return (true, result);
                }
                Next::Msg(Ok(_)) => {
                    return (false, Err(crate::Error::Protocol("unexpected frame in scan stream")))
                }
                Next::Msg(Err(err)) => return (false, Err(err)),
            }
        }
    }

    async fn count_exchange(&self, req: Message) -> crate::Result<u64> {
        let mut conn = self.pool.get().await?;
        let result = async {
            conn.send(req, self.config.write_deadline).await?;
            match conn.recv(self.config.read_deadline).await? {
                Message::CountResult(resp) => match resp.err {
                    Some(err) => Err(crate::Error::Server(err)),
                    None => Ok(resp.count),
                },
                _ => Err(crate::Error::Protocol("expected a count response")),
            }
        }
        .await;
        let healthy = matches!(&result, Ok(_) | Err(crate::Error::Server(_)));
        self.pool.put(conn, healthy);
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use scan_proto::messages::{HeloResponse, IndexEntry, StreamEndResponse};
    use scan_proto::FrameCodec;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;
    use topology::StaticCredentials;

    /// A mock indexer: answers helo, and answers each scan request with
    /// `chunks` single-entry frames followed by a stream end. An incoming
    /// EndStreamRequest cuts the remaining chunks.
    async fn mock_indexer(chunks: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut framed = Framed::new(socket, FrameCodec::default());
                    while let Some(Ok(msg)) = framed.next().await {
                        match msg {
                            Message::Helo(helo) => {
                                let ack = Message::HeloAck(HeloResponse {
                                    version: helo.version,
                                });
                                if framed.send(ack).await.is_err() {
                                    return;
                                }
                            }
                            Message::Scan(_) | Message::ScanAll(_) => {
                                for i in 0..chunks {
                                    // Poll for an early end between chunks.
                                    if let Ok(Some(Ok(Message::EndStream))) =
                                        tokio::time::timeout(
                                            std::time::Duration::from_millis(5),
                                            framed.next(),
                                        )
                                        .await
                                    {
                                        break;
                                    }
                                    let chunk = Message::Stream(ResponseStream {
                                        entries: vec![IndexEntry {
                                            key: vec![i as u8],
                                            doc_id: format!("doc-{i}").into_bytes(),
                                        }],
                                    });
                                    if framed.send(chunk).await.is_err() {
                                        return;
                                    }
                                }
                                let end = Message::StreamEnd(StreamEndResponse { err: None });
                                if framed.send(end).await.is_err() {
                                    return;
                                }
                            }
                            Message::EndStream => {
                                let end = Message::StreamEnd(StreamEndResponse { err: None });
                                if framed.send(end).await.is_err() {
                                    return;
                                }
                            }
                            Message::Count(_) => {
                                let resp = Message::CountResult(
                                    scan_proto::messages::CountResponse {
                                        count: 41,
                                        err: None,
                                    },
                                );
                                if framed.send(resp).await.is_err() {
                                    return;
                                }
                            }
                            _ => return,
                        }
                    }
                });
            }
        });
        endpoint
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    async fn client(endpoint: String) -> Arc<ScanClient> {
        ScanClient::connect(
            endpoint,
            "127.0.0.1:0".to_string(),
            reqwest::Client::new(),
            Arc::new(StaticCredentials("u".into(), "p".into())),
            crate::Config::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn helo_learns_the_server_version() {
        let endpoint = mock_indexer(0).await;
        let client = client(endpoint).await;
        assert_eq!(client.server_version(), PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn scan_streams_all_chunks_then_ends() -> anyhow::Result<()> {
        init_tracing();
        let endpoint = mock_indexer(3).await;
        let client = client(endpoint).await;

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        client.multi_scan(ScanRequest::default(), &tx, &cancel).await?;
        drop(tx);

        let mut rows = 0;
        while let Some(chunk) = rx.recv().await {
            rows += chunk.entries.len();
        }
        assert_eq!(rows, 3);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_scan_drains_to_stream_end() {
        let endpoint = mock_indexer(100).await;
        let client = client(endpoint).await;

        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .multi_scan(ScanRequest::default(), &tx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Cancelled));

        // The drained connection went back healthy: the next call reuses it.
        let count = client.multi_scan_count(CountRequest::default()).await.unwrap();
        assert_eq!(count, 41);
    }

    #[tokio::test]
    async fn dropped_sink_ends_the_stream_early_without_error() {
        let endpoint = mock_indexer(50).await;
        let client = client(endpoint).await;

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let cancel = CancellationToken::new();

        client
            .multi_scan(ScanRequest::default(), &tx, &cancel)
            .await
            .unwrap();
    }
}
