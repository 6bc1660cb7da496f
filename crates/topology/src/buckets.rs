//! Per-bucket snapshots: terse bucket info and the collection manifest.

use crate::model::{CollectionManifest, NodeServices, TerseBucket};
use std::collections::HashMap;

/// Immutable snapshot of one bucket's terse info.
#[derive(Debug, Clone, Default)]
pub struct BucketInfo {
    pub bucket: TerseBucket,
}

impl BucketInfo {
    pub fn new(bucket: TerseBucket) -> Self {
        Self { bucket }
    }

    pub fn uuid(&self) -> &str {
        &self.bucket.uuid
    }

    pub fn num_vbuckets(&self) -> usize {
        self.bucket.vbucket_server_map.num_vbuckets()
    }

    /// KV server `host:port` for `vbno`'s active copy, if mapped.
    pub fn vbucket_master(&self, vbno: u16) -> Option<&str> {
        let map = &self.bucket.vbucket_server_map;
        let chain = map.vbucket_map.get(vbno as usize)?;
        let active = *chain.first()?;
        if active < 0 {
            return None;
        }
        map.server_list.get(active as usize).map(String::as_str)
    }

    pub fn nodes_ext(&self) -> &[NodeServices] {
        &self.bucket.nodes_ext
    }
}

/// Immutable snapshot of one bucket's collection manifest, with id lookups
/// pre-computed.
#[derive(Debug, Clone, Default)]
pub struct CollectionInfo {
    pub bucket: String,
    pub manifest_uid: u64,
    scopes: HashMap<String, ScopeInfo>,
}

#[derive(Debug, Clone, Default)]
struct ScopeInfo {
    scope_id: u32,
    collections: HashMap<String, u32>,
    index_scope_limit: Option<u32>,
}

impl CollectionInfo {
    pub fn new(bucket: String, manifest: &CollectionManifest) -> crate::Result<Self> {
        let manifest_uid = manifest.manifest_uid()?;
        let mut scopes = HashMap::with_capacity(manifest.scopes.len());

        for scope in &manifest.scopes {
            let mut collections = HashMap::with_capacity(scope.collections.len());
            for collection in &scope.collections {
                collections.insert(
                    collection.name.clone(),
                    crate::model::parse_uid(&collection.uid)? as u32,
                );
            }
            scopes.insert(
                scope.name.clone(),
                ScopeInfo {
                    scope_id: crate::model::parse_uid(&scope.uid)? as u32,
                    collections,
                    index_scope_limit: scope
                        .limits
                        .as_ref()
                        .and_then(|l| l.index.as_ref())
                        .map(|i| i.num_indexes),
                },
            );
        }
        Ok(Self {
            bucket,
            manifest_uid,
            scopes,
        })
    }

    pub fn scope_id(&self, scope: &str) -> crate::Result<u32> {
        self.scopes
            .get(scope)
            .map(|s| s.scope_id)
            .ok_or_else(|| crate::Error::not_found("scope", scope.to_string()))
    }

    pub fn collection_id(&self, scope: &str, collection: &str) -> crate::Result<u32> {
        let scope_info = self
            .scopes
            .get(scope)
            .ok_or_else(|| crate::Error::not_found("scope", scope.to_string()))?;
        scope_info
            .collections
            .get(collection)
            .copied()
            .ok_or_else(|| crate::Error::not_found("collection", collection.to_string()))
    }

    pub fn index_scope_limit(&self, scope: &str) -> Option<u32> {
        self.scopes.get(scope)?.index_scope_limit
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn manifest_lookups_resolve_hex_ids() {
        let manifest: CollectionManifest = serde_json::from_value(json!({
            "uid": "a",
            "scopes": [{
                "name": "inventory",
                "uid": "8",
                "collections": [
                    {"name": "hotel", "uid": "9"},
                    {"name": "airline", "uid": "c"},
                ],
                "limits": {"index": {"num_indexes": 12}},
            }],
        }))
        .unwrap();

        let info = CollectionInfo::new("travel".to_string(), &manifest).unwrap();
        assert_eq!(info.manifest_uid, 10);
        assert_eq!(info.scope_id("inventory").unwrap(), 8);
        assert_eq!(info.collection_id("inventory", "airline").unwrap(), 12);
        assert_eq!(info.index_scope_limit("inventory"), Some(12));

        assert!(matches!(
            info.collection_id("inventory", "missing"),
            Err(crate::Error::NotFound { .. })
        ));
    }

    #[test]
    fn vbucket_master_follows_the_replica_chain() {
        let bucket: TerseBucket = serde_json::from_value(json!({
            "name": "travel",
            "uuid": "ab12",
            "bucketType": "membase",
            "collectionsManifestUid": "3",
            "vBucketServerMap": {
                "serverList": ["n0:11210", "n1:11210"],
                "vBucketMap": [[0, 1], [1, 0], [-1, 0]],
            },
        }))
        .unwrap();

        let info = BucketInfo::new(bucket);
        assert_eq!(info.num_vbuckets(), 3);
        assert_eq!(info.vbucket_master(0), Some("n0:11210"));
        assert_eq!(info.vbucket_master(1), Some("n1:11210"));
        assert_eq!(info.vbucket_master(2), None);
        assert_eq!(info.bucket.manifest_uid().unwrap(), 3);
    }
}
