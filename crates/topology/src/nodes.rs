//! The nodes snapshot: membership joined with extended services, validated
//! and queried as one immutable unit.

use crate::model::{Membership, Node, NodeServices, Pool, PoolServices, SERVICE_MGMT};

/// Index of a node within a [`NodesInfo`] snapshot. Only meaningful against
/// the snapshot that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// An immutable join of `pools/default` nodes with `nodeServices` entries.
///
/// Every derived answer is computed from this one snapshot, so a reader that
/// loads the holder pointer once gets internally-consistent results.
#[derive(Debug, Clone, Default)]
pub struct NodesInfo {
    pub nodes: Vec<Node>,
    pub nodes_ext: Vec<NodeServices>,
    /// The hostname through which this process reached the cluster,
    /// substituted for empty `nodesExt` hostnames.
    pub client_host: String,
    /// `(major, minor)` minimum across active nodes; `(0, 0)` when unknown.
    cluster_version: (u32, u32),
}

impl NodesInfo {
    pub fn new(pool: &Pool, services: &PoolServices, client_host: &str) -> Self {
        let mut info = Self {
            nodes: pool.nodes.clone(),
            nodes_ext: services.nodes_ext.clone(),
            client_host: client_host.to_string(),
            cluster_version: (0, 0),
        };
        info.cluster_version = info.compute_cluster_version();
        info
    }

    /// `min over active nodes of (major, minor)`, `(0, 0)` when any active
    /// node's version is unknown.
    fn compute_cluster_version(&self) -> (u32, u32) {
        let mut min: Option<(u32, u32)> = None;
        for node in &self.nodes {
            if node.cluster_membership != Membership::Active {
                continue;
            }
            match node.version_tuple() {
                Ok(v) => min = Some(min.map_or(v, |m| m.min(v))),
                Err(_) => return (0, 0),
            }
        }
        min.unwrap_or((0, 0))
    }

    pub fn cluster_version(&self) -> (u32, u32) {
        self.cluster_version
    }

    /// Re-check the snapshot invariants. Idempotent: the verdict depends only
    /// on snapshot contents.
    pub fn validate(&self) -> crate::Result<()> {
        // A single-node cluster may briefly carry a stale nodesExt list.
        if self.nodes.len() != self.nodes_ext.len() && self.nodes.len() != 1 {
            return Err(crate::Error::Validation(format!(
                "nodes ({}) and nodesExt ({}) lengths differ",
                self.nodes.len(),
                self.nodes_ext.len()
            )));
        }

        let this_nodes = self.nodes.iter().filter(|n| n.this_node).count();
        if this_nodes != 1 {
            return Err(crate::Error::Validation(format!(
                "expected exactly one thisNode, found {this_nodes}"
            )));
        }

        // nodes and nodesExt are index-aligned; check the join per entry.
        for (i, (node, ext)) in self.nodes.iter().zip(self.nodes_ext.iter()).enumerate() {
            let Some(mgmt) = ext.port(SERVICE_MGMT, false) else {
                return Err(crate::Error::Validation(format!(
                    "nodesExt[{i}] has no mgmt port"
                )));
            };
            let expect = format!("{}:{}", ext.hostname_or(&self.client_host), mgmt);
            if node.hostname != expect {
                return Err(crate::Error::Validation(format!(
                    "nodes[{i}].hostname '{}' != nodesExt[{i}] '{expect}'",
                    node.hostname
                )));
            }
        }
        Ok(())
    }

    /// The node this process is connected through.
    pub fn current_node(&self) -> crate::Result<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.this_node)
            .map(NodeId)
            .ok_or_else(|| crate::Error::Validation("no thisNode in snapshot".to_string()))
    }

    pub fn node(&self, id: NodeId) -> crate::Result<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| crate::Error::not_found("node", format!("#{}", id.0)))
    }

    /// Nodes running `service`, active members only.
    pub fn nodes_by_service(&self, service: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                n.cluster_membership == Membership::Active
                    && n.services.iter().any(|s| s == service)
            })
            .map(|(i, _)| NodeId(i))
            .collect()
    }

    /// `host:port` for `service` on `node`, honoring empty-hostname
    /// substitution and TLS port selection.
    pub fn service_address(&self, id: NodeId, service: &str, tls: bool) -> crate::Result<String> {
        let ext = self
            .nodes_ext
            .get(id.0)
            .ok_or_else(|| crate::Error::not_found("nodesExt entry", format!("#{}", id.0)))?;
        let port = ext
            .port(service, tls)
            .ok_or_else(|| crate::Error::not_found("service", service.to_string()))?;
        Ok(format!("{}:{}", ext.hostname_or(&self.client_host), port))
    }

    pub fn server_group(&self, id: NodeId) -> Option<&str> {
        self.node(id).ok()?.server_group.as_deref()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fixture(n: usize) -> NodesInfo {
        let nodes = (0..n)
            .map(|i| {
                json!({
                    "hostname": format!("node{i}.local:8091"),
                    "clusterMembership": "active",
                    "status": "healthy",
                    "services": ["kv", "index"],
                    "version": format!("7.{}.0-500", i + 1),
                    "thisNode": i == 0,
                })
            })
            .collect::<Vec<_>>();
        let exts = (0..n)
            .map(|i| {
                json!({
                    "hostname": format!("node{i}.local"),
                    "services": {"mgmt": 8091, "indexScan": 9101},
                })
            })
            .collect::<Vec<_>>();

        let pool: Pool = serde_json::from_value(json!({ "nodes": nodes })).unwrap();
        let svs: PoolServices = serde_json::from_value(json!({ "nodesExt": exts })).unwrap();
        NodesInfo::new(&pool, &svs, "client.host")
    }

    #[test]
    fn valid_snapshot_passes_and_is_idempotent() {
        let info = fixture(3);
        info.validate().unwrap();
        info.validate().unwrap();
        assert_eq!(info.cluster_version(), (7, 1));
        assert_eq!(info.current_node().unwrap(), NodeId(0));
    }

    #[test]
    fn length_mismatch_fails_unless_single_node() {
        let mut info = fixture(3);
        info.nodes_ext.pop();
        assert!(info.validate().is_err());

        let mut single = fixture(1);
        single.nodes_ext.push(single.nodes_ext[0].clone());
        single.validate().unwrap();
    }

    #[test]
    fn hostname_join_mismatch_is_a_validation_error() {
        let mut info = fixture(2);
        info.nodes[1].hostname = "elsewhere:8091".to_string();
        let err = info.validate().unwrap_err();
        assert!(matches!(err, crate::Error::Validation(_)));
    }

    #[test]
    fn exactly_one_this_node() {
        let mut info = fixture(2);
        info.nodes[1].this_node = true;
        assert!(info.validate().is_err());
        info.nodes[0].this_node = false;
        info.nodes[1].this_node = false;
        assert!(info.validate().is_err());
    }

    #[test]
    fn empty_hostname_substitutes_the_client_host() {
        let mut info = fixture(1);
        info.nodes_ext[0].hostname = String::new();
        info.nodes[0].hostname = "client.host:8091".to_string();
        info.validate().unwrap();
        assert_eq!(
            info.service_address(NodeId(0), "indexScan", false).unwrap(),
            "client.host:9101"
        );
    }

    #[test]
    fn unknown_version_pins_cluster_version_to_zero() {
        let mut info = fixture(2);
        info.nodes[0].version = "garbage".to_string();
        info.cluster_version = info.compute_cluster_version();
        assert_eq!(info.cluster_version(), (0, 0));
    }
}
