//! Query-consistency semantics and the vbucket-timestamp vector.

use serde::{Deserialize, Serialize};

/// Consistency level requested for a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// No consistency requirement: scan whatever the indexer has.
    #[default]
    Any,
    /// Scan must observe all mutations the session has produced so far.
    Session,
    /// Scan must observe a caller-supplied vbucket sequence vector.
    Query,
}

/// A vbucket-timestamp vector: per-vbucket sequence numbers and vbuuids.
///
/// `hash64` is a stable digest over `vbuuids`, cached per bucket so that
/// session-consistency fast paths can ask the server to verify vbuuids by
/// hash instead of re-shipping them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TsVector {
    pub bucket: String,
    pub vbnos: Vec<u16>,
    pub seqnos: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vbuuids: Vec<u64>,
    pub hash64: u64,
}

impl TsVector {
    /// Build a vector from full per-vbucket state, stamping `hash64`.
    pub fn new(bucket: String, vbnos: Vec<u16>, seqnos: Vec<u64>, vbuuids: Vec<u64>) -> Self {
        let hash64 = digest_vbuuids(&vbuuids);
        Self {
            bucket,
            vbnos,
            seqnos,
            vbuuids,
            hash64,
        }
    }

    /// Build a compact vector carrying only seqnos and the cached vbuuid
    /// digest, for servers which have already seen the full vbuuids.
    pub fn with_hash(bucket: String, vbnos: Vec<u16>, seqnos: Vec<u64>, hash64: u64) -> Self {
        Self {
            bucket,
            vbnos,
            seqnos,
            vbuuids: Vec::new(),
            hash64,
        }
    }
}

/// Digest of a vbuuid vector, hashed over the little-endian concatenation.
pub fn digest_vbuuids(vbuuids: &[u64]) -> u64 {
    let mut buf = Vec::with_capacity(vbuuids.len() * 8);
    for uuid in vbuuids {
        buf.extend_from_slice(&uuid.to_le_bytes());
    }
    xxhash_rust::xxh3::xxh3_64(&buf)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn digest_is_stable_and_order_sensitive() {
        let a = digest_vbuuids(&[1, 2, 3]);
        assert_eq!(a, digest_vbuuids(&[1, 2, 3]));
        assert_ne!(a, digest_vbuuids(&[3, 2, 1]));
        assert_ne!(a, digest_vbuuids(&[1, 2]));
    }

    #[test]
    fn new_stamps_the_vbuuid_digest() {
        let ts = TsVector::new("beer-sample".to_string(), vec![0, 1], vec![10, 20], vec![7, 9]);
        assert_eq!(ts.hash64, digest_vbuuids(&[7, 9]));

        let compact = TsVector::with_hash("beer-sample".to_string(), ts.vbnos.clone(), ts.seqnos.clone(), ts.hash64);
        assert!(compact.vbuuids.is_empty());
        assert_eq!(compact.hash64, ts.hash64);
    }
}
