//! Long-poll reader for streaming management endpoints.
//!
//! The cluster manager's streaming endpoints (`/poolsStreaming/...`,
//! `/pools/default/bs/<bucket>`, ...) hold the connection open and emit a
//! full JSON document whenever state changes, each terminated by four
//! newlines. This adapts such a response into a stream of decoded documents.

use bytes::{Buf, BytesMut};
use futures::TryStreamExt;
use serde::de::DeserializeOwned;

const CHUNK_DELIMITER: &[u8] = b"\n\n\n\n";

/// Open `endpoint` with basic credentials and stream its documents through
/// `deliver` until the connection closes or `deliver` errors.
///
/// A clean server-side close yields `Ok(())`; the caller decides whether to
/// reconnect. A 404 is surfaced as `NotFound` so per-bucket observers can end
/// when their bucket is dropped.
pub async fn stream_endpoint<T, F>(
    http: &reqwest::Client,
    endpoint: &str,
    auth: (String, String),
    mut deliver: F,
) -> crate::Result<()>
where
    T: DeserializeOwned,
    F: FnMut(T) -> crate::Result<()>,
{
    let response = http
        .get(endpoint)
        .basic_auth(auth.0, Some(auth.1))
        .send()
        .await?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(crate::Error::not_found("endpoint", endpoint.to_string()));
    }
    if !response.status().is_success() {
        return Err(crate::Error::HttpStatus {
            endpoint: endpoint.to_string(),
            status: response.status(),
        });
    }

    let mut body = response.bytes_stream();
    let mut buf = BytesMut::new();

    while let Some(chunk) = body.try_next().await? {
        buf.extend_from_slice(&chunk);

        while let Some(at) = find_delimiter(&buf) {
            let doc = buf.split_to(at);
            buf.advance(CHUNK_DELIMITER.len());
            if doc.is_empty() {
                continue;
            }
            deliver(serde_json::from_slice(&doc)?)?;
        }
    }
    Ok(())
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(CHUNK_DELIMITER.len())
        .position(|w| w == CHUNK_DELIMITER)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delimiter_search_spans_partial_reads() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"a\":1}\n\n");
        assert_eq!(find_delimiter(&buf), None);
        buf.extend_from_slice(b"\n\n{\"a\":2}");
        assert_eq!(find_delimiter(&buf), Some(7));
    }
}
