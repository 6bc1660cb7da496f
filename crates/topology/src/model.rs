//! Management-plane JSON model, mirroring the cluster manager's wire names.

use serde::Deserialize;
use std::collections::HashMap;

/// Cluster services a node may run.
pub const SERVICE_KV: &str = "kv";
pub const SERVICE_INDEX: &str = "index";
pub const SERVICE_N1QL: &str = "n1ql";
pub const SERVICE_MGMT: &str = "mgmt";

/// `GET /pools/default` (and its streaming variant).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Pool {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(rename = "bucketNames", default)]
    pub bucket_names: Vec<BucketName>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct BucketName {
    #[serde(rename = "bucketName")]
    pub bucket_name: String,
    #[serde(default)]
    pub uuid: String,
}

/// Cluster membership of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum Membership {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "inactiveFailed")]
    InactiveFailed,
    #[serde(rename = "inactiveAdded")]
    InactiveAdded,
    #[serde(other)]
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Node {
    #[serde(default)]
    pub hostname: String,
    #[serde(rename = "nodeUUID", default)]
    pub node_uuid: String,
    #[serde(rename = "clusterMembership", default)]
    pub cluster_membership: Membership,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(rename = "serverGroup", default)]
    pub server_group: Option<String>,
    #[serde(default)]
    pub version: String,
    /// Encodes `major * 65536 + minor`.
    #[serde(rename = "clusterCompatibility", default)]
    pub cluster_compatibility: i64,
    #[serde(rename = "thisNode", default)]
    pub this_node: bool,
}

impl Node {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }

    /// Parse `major.minor` out of the build version string.
    pub fn version_tuple(&self) -> crate::Result<(u32, u32)> {
        parse_version(&self.version)
    }
}

pub fn parse_version(version: &str) -> crate::Result<(u32, u32)> {
    let mut parts = version.split(|c| c == '.' || c == '-');
    let major = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| crate::Error::InvalidVersion(version.to_string()))?;
    let minor = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| crate::Error::InvalidVersion(version.to_string()))?;
    Ok((major, minor))
}

/// `GET /pools/default/nodeServices` (and its streaming variant).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PoolServices {
    #[serde(default)]
    pub rev: i64,
    #[serde(rename = "nodesExt", default)]
    pub nodes_ext: Vec<NodeServices>,
}

/// One node's extended-services entry. An empty hostname means "the hostname
/// through which the caller reached the cluster".
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NodeServices {
    #[serde(default)]
    pub hostname: String,
    #[serde(rename = "thisNode", default)]
    pub this_node: bool,
    /// `service → port`, carrying both plaintext and TLS ports (the TLS port
    /// for service `s` is keyed `sSSL`).
    #[serde(default)]
    pub services: HashMap<String, u16>,
}

impl NodeServices {
    /// The node's hostname, substituting `fallback` when empty.
    pub fn hostname_or<'s>(&'s self, fallback: &'s str) -> &'s str {
        if self.hostname.is_empty() {
            fallback
        } else {
            &self.hostname
        }
    }

    pub fn port(&self, service: &str, tls: bool) -> Option<u16> {
        if tls {
            self.services.get(&format!("{service}SSL")).copied()
        } else {
            self.services.get(service).copied()
        }
    }
}

/// `GET /pools/default/b/<bucket>`: terse bucket info.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TerseBucket {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(rename = "bucketType", default)]
    pub bucket_type: String,
    /// Hex-encoded manifest UID.
    #[serde(rename = "collectionsManifestUid", default)]
    pub collections_manifest_uid: String,
    #[serde(rename = "vBucketServerMap", default)]
    pub vbucket_server_map: VBucketServerMap,
    #[serde(rename = "nodesExt", default)]
    pub nodes_ext: Vec<NodeServices>,
}

impl TerseBucket {
    pub fn is_ephemeral(&self) -> bool {
        self.bucket_type == "ephemeral"
    }

    pub fn manifest_uid(&self) -> crate::Result<u64> {
        parse_uid(&self.collections_manifest_uid)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct VBucketServerMap {
    #[serde(rename = "serverList", default)]
    pub server_list: Vec<String>,
    /// `vbucket → replica chain of indices into serverList` (-1 = no replica).
    #[serde(rename = "vBucketMap", default)]
    pub vbucket_map: Vec<Vec<i32>>,
}

impl VBucketServerMap {
    pub fn num_vbuckets(&self) -> usize {
        self.vbucket_map.len()
    }
}

/// `GET /pools/default/b/<bucket>/scopes`: the collection manifest.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CollectionManifest {
    /// Hex-encoded, monotonically increasing.
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub scopes: Vec<ScopeDef>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScopeDef {
    pub name: String,
    /// Hex-encoded scope id.
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub collections: Vec<CollectionDef>,
    #[serde(default)]
    pub limits: Option<ScopeLimits>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CollectionDef {
    pub name: String,
    /// Hex-encoded collection id.
    #[serde(default)]
    pub uid: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScopeLimits {
    #[serde(rename = "index", default)]
    pub index: Option<IndexScopeLimit>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IndexScopeLimit {
    #[serde(rename = "num_indexes", default)]
    pub num_indexes: u32,
}

impl CollectionManifest {
    pub fn manifest_uid(&self) -> crate::Result<u64> {
        parse_uid(&self.uid)
    }
}

/// Manifest and collection uids are hex strings on the wire.
pub fn parse_uid(uid: &str) -> crate::Result<u64> {
    u64::from_str_radix(uid.trim_start_matches("0x"), 16)
        .map_err(|_| crate::Error::InvalidVersion(uid.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pool_json_decodes_wire_names() {
        let pool: Pool = serde_json::from_value(serde_json::json!({
            "nodes": [{
                "hostname": "10.0.0.1:8091",
                "nodeUUID": "e5a1...",
                "clusterMembership": "active",
                "status": "healthy",
                "services": ["kv", "index"],
                "version": "7.6.0-1000-enterprise",
                "clusterCompatibility": 458758,
                "thisNode": true,
            }],
            "bucketNames": [{"bucketName": "travel", "uuid": "ab12"}],
        }))
        .unwrap();

        assert_eq!(pool.nodes[0].cluster_membership, Membership::Active);
        assert_eq!(pool.nodes[0].version_tuple().unwrap(), (7, 6));
        assert_eq!(pool.bucket_names[0].bucket_name, "travel");
    }

    #[test]
    fn unknown_membership_does_not_fail_decode() {
        let node: Node =
            serde_json::from_value(serde_json::json!({"clusterMembership": "recovering"})).unwrap();
        assert_eq!(node.cluster_membership, Membership::Unknown);
    }

    #[test]
    fn uids_parse_as_hex() {
        assert_eq!(parse_uid("0").unwrap(), 0);
        assert_eq!(parse_uid("ff").unwrap(), 255);
        assert_eq!(parse_uid("0x10").unwrap(), 16);
        assert!(parse_uid("zz").is_err());
    }

    #[test]
    fn tls_ports_are_keyed_by_suffix() {
        let ns: NodeServices = serde_json::from_value(serde_json::json!({
            "hostname": "",
            "services": {"mgmt": 8091, "mgmtSSL": 18091, "indexScan": 9101},
        }))
        .unwrap();
        assert_eq!(ns.port("mgmt", false), Some(8091));
        assert_eq!(ns.port("mgmt", true), Some(18091));
        assert_eq!(ns.port("indexScan", true), None);
        assert_eq!(ns.hostname_or("fallback.host"), "fallback.host");
    }
}
