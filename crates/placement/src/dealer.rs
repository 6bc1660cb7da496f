//! The shard dealer: assigns each index definition (and all of its replicas
//! and partitions) to one alternate-shard slot per the three-pass placement
//! algorithm, and keeps the slot→node bookkeeping the planner reads.
//!
//! The planner runs single-threaded; the dealer is a plain data structure.

use crate::category::ShardCategory;
use crate::ids::{AlternateShardId, GROUP_BACK, GROUP_MAIN};
use std::collections::{BTreeMap, BTreeSet};

/// Soft per-shard data ceiling: below it the dealer prefers stuffing more
/// partitions into an existing slot.
pub const SOFT_DATA_LIMIT: u64 = 125 << 30; // 125 GiB

#[derive(Debug, Clone)]
pub struct DealerConfig {
    /// Keep minting fresh slots until each node carries this many shards.
    pub min_shards_per_node: u32,
    /// Soft partition ceiling per mainstore below which reuse is preferred.
    pub min_partitions_per_shard: u32,
    /// Hard per-node shard budget for pass-2 growth.
    pub shard_capacity_per_node: u32,
}

impl Default for DealerConfig {
    fn default() -> Self {
        Self {
            min_shards_per_node: 6,
            min_partitions_per_shard: 16,
            shard_capacity_per_node: 36,
        }
    }
}

/// One index instance-partition as the planner sees it.
#[derive(Debug, Clone)]
pub struct IndexUsage {
    pub defn_id: u64,
    pub replica_id: u32,
    pub partition_id: u32,
    pub storage_mode: String,
    pub is_vector: bool,
    pub is_bhive: bool,
    /// Actual (or estimated) data size in bytes.
    pub data_size: u64,
    /// `[mainstore, backstore]`, stamped by placement.
    pub alternate_shard_ids: Option<[AlternateShardId; 2]>,
}

impl IndexUsage {
    pub fn category(&self) -> Option<ShardCategory> {
        ShardCategory::for_index(&self.storage_mode, self.is_vector, self.is_bhive)
    }
}

/// One replica of a definition on its target node, carrying the partitions
/// placed there.
#[derive(Debug, Clone)]
pub struct ReplicaPlacement {
    pub replica_id: u32,
    pub node: String,
    pub indexes: Vec<IndexUsage>,
}

/// Usage bookkeeping of one physical shard.
#[derive(Debug, Clone, Default)]
pub struct ShardContainer {
    /// `(definition, partition)` members.
    pub instances: BTreeSet<(u64, u32)>,
    pub partitions: u32,
    pub data_size: u64,
}

#[derive(Debug, Default)]
pub struct ShardDealer {
    config: DealerConfig,
    slots_per_category: BTreeMap<ShardCategory, BTreeSet<u64>>,
    /// `slot → replica → group → container`.
    slots_map: BTreeMap<u64, BTreeMap<u32, BTreeMap<u8, ShardContainer>>>,
    slot_category: BTreeMap<u64, ShardCategory>,
    /// Every replica and partition of a definition shares one slot.
    index_slots: BTreeMap<u64, u64>,
    node_to_slot_map: BTreeMap<String, BTreeMap<u64, u32>>,
    node_to_shard_count: BTreeMap<String, u32>,
    next_slot: u64,
}

impl ShardDealer {
    pub fn new(config: DealerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn shard_count(&self, node: &str) -> u32 {
        self.node_to_shard_count.get(node).copied().unwrap_or(0)
    }

    pub fn slot_for_defn(&self, defn_id: u64) -> Option<u64> {
        self.index_slots.get(&defn_id).copied()
    }

    pub fn category_of_slot(&self, slot: u64) -> Option<ShardCategory> {
        self.slot_category.get(&slot).copied()
    }

    pub fn container(&self, slot: u64, replica_id: u32, group_id: u8) -> Option<&ShardContainer> {
        self.slots_map.get(&slot)?.get(&replica_id)?.get(&group_id)
    }

    /// Fold an already-stamped index into the bookkeeping. Used when loading
    /// the existing cluster layout before planning. `is_initial` marks an
    /// index still being built, whose data has not materialized yet.
    pub fn record_index_usage(
        &mut self,
        index: &IndexUsage,
        node: &str,
        is_initial: bool,
    ) -> crate::Result<()> {
        let category = index.category().ok_or(crate::Error::InvalidCategory {
            defn_id: index.defn_id,
            storage_mode: index.storage_mode.clone(),
        })?;
        let Some([main, _back]) = index.alternate_shard_ids else {
            return Ok(());
        };
        let slot = main.slot_id;

        match self.slot_category.get(&slot) {
            Some(existing) if *existing != category => {
                return Err(crate::Error::CategoryMismatch {
                    defn_id: index.defn_id,
                    slot,
                });
            }
            _ => {}
        }
        self.slot_category.insert(slot, category);
        self.slots_per_category.entry(category).or_default().insert(slot);
        self.index_slots.insert(index.defn_id, slot);
        self.next_slot = self.next_slot.max(slot);

        let new_on_node = self
            .node_to_slot_map
            .entry(node.to_string())
            .or_default()
            .insert(slot, main.replica_id)
            .is_none();
        if new_on_node {
            // A slot lands on a node as a mainstore/backstore pair.
            *self.node_to_shard_count.entry(node.to_string()).or_default() += 2;
        }

        let replica = self
            .slots_map
            .entry(slot)
            .or_default()
            .entry(main.replica_id)
            .or_default();
        let mainstore = replica.entry(GROUP_MAIN).or_default();
        if mainstore.instances.insert((index.defn_id, index.partition_id)) {
            mainstore.partitions += 1;
            if !is_initial {
                mainstore.data_size += index.data_size;
            }
        }
        replica
            .entry(GROUP_BACK)
            .or_default()
            .instances
            .insert((index.defn_id, index.partition_id));
        Ok(())
    }

    /// Place `defn_id` on a slot: stamp every index in `replica_map` with its
    /// `[mainstore, backstore]` alternate shard ids and update bookkeeping.
    ///
    /// A definition that was placed before always lands back on its existing
    /// slot. Otherwise the passes run in order: cold-start mint, reuse under
    /// the soft limits, grow under capacity, reuse beyond the soft limits,
    /// and a final failsafe mint.
    pub fn get_slot(
        &mut self,
        defn_id: u64,
        replica_map: &mut [ReplicaPlacement],
    ) -> crate::Result<u64> {
        let first_index = replica_map
            .iter()
            .flat_map(|p| p.indexes.iter())
            .next()
            .ok_or(crate::Error::EmptyReplicaMap(defn_id))?;
        let category = first_index
            .category()
            .ok_or_else(|| crate::Error::InvalidCategory {
                defn_id,
                storage_mode: first_index.storage_mode.clone(),
            })?;

        // Stickiness: a placed definition never moves to another slot.
        if let Some(slot) = self.slot_for_defn(defn_id) {
            if self.category_of_slot(slot) != Some(category) {
                return Err(crate::Error::CategoryMismatch { defn_id, slot });
            }
            self.assign(slot, replica_map)?;
            return Ok(slot);
        }

        let nodes: BTreeSet<String> = replica_map.iter().map(|p| p.node.clone()).collect();

        // Pass 0, cold start: mint while the pair fits every node's
        // min-shards floor.
        if nodes
            .iter()
            .all(|n| self.shard_count(n) + 2 <= self.config.min_shards_per_node)
        {
            let slot = self.mint_slot(category);
            self.assign(slot, replica_map)?;
            return Ok(slot);
        }

        // Pass 1: reuse a slot that is under the soft limits everywhere.
        if let Some(slot) = self.common_slot(&nodes, category, true) {
            self.assign(slot, replica_map)?;
            return Ok(slot);
        }

        // Pass 2: grow while under the per-node shard capacity.
        if nodes
            .iter()
            .all(|n| self.shard_count(n) < self.config.shard_capacity_per_node)
        {
            let slot = self.mint_slot(category);
            self.assign(slot, replica_map)?;
            return Ok(slot);
        }

        // Pass 3: reuse any common slot of the category.
        if let Some(slot) = self.common_slot(&nodes, category, false) {
            self.assign(slot, replica_map)?;
            return Ok(slot);
        }

        tracing::warn!(
            defn_id,
            ?nodes,
            "no common slot for placement; minting beyond the per-node shard capacity"
        );
        let slot = self.mint_slot(category);
        self.assign(slot, replica_map)?;
        Ok(slot)
    }

    fn mint_slot(&mut self, category: ShardCategory) -> u64 {
        self.next_slot += 1;
        let slot = self.next_slot;
        self.slot_category.insert(slot, category);
        self.slots_per_category.entry(category).or_default().insert(slot);
        slot
    }

    /// The best slot of `category` present on every node, by lowest
    /// `data-per-partition + partition-count` over its mainstore containers
    /// (ties to the lower slot id). With `soft` set, slots at or beyond the
    /// soft data/partition limits on any node are filtered out.
    fn common_slot(
        &self,
        nodes: &BTreeSet<String>,
        category: ShardCategory,
        soft: bool,
    ) -> Option<u64> {
        let slots = self.slots_per_category.get(&category)?;
        let mut best: Option<(f64, u64)> = None;

        for &slot in slots {
            let on_every_node = nodes.iter().all(|n| {
                self.node_to_slot_map
                    .get(n)
                    .map_or(false, |m| m.contains_key(&slot))
            });
            if !on_every_node {
                continue;
            }

            let mut cost = 0.0;
            let mut usable = true;
            for node in nodes {
                let replica = self.node_to_slot_map[node][&slot];
                let (partitions, data_size) = self
                    .container(slot, replica, GROUP_MAIN)
                    .map_or((0, 0), |c| (c.partitions, c.data_size));

                if soft
                    && !(data_size <= SOFT_DATA_LIMIT
                        && partitions < self.config.min_partitions_per_shard)
                {
                    usable = false;
                    break;
                }
                cost += data_size as f64 / partitions.max(1) as f64 + partitions as f64;
            }
            if !usable {
                continue;
            }
            // Ascending slot order: strict less-than keeps the lower id on
            // ties.
            if best.map_or(true, |(best_cost, _)| cost < best_cost) {
                best = Some((cost, slot));
            }
        }
        best.map(|(_, slot)| slot)
    }

    /// Stamp every index with the slot's ids for its node, then fold the
    /// stamped indexes into the bookkeeping. All replicas and partitions of
    /// the definition end up on the same slot, differing only in replica id.
    fn assign(&mut self, slot: u64, replica_map: &mut [ReplicaPlacement]) -> crate::Result<()> {
        for placement in replica_map.iter_mut() {
            // Reusing a slot adopts its existing replica copy on this node;
            // a fresh slot takes the index's own replica id.
            let replica_id = self
                .node_to_slot_map
                .get(&placement.node)
                .and_then(|m| m.get(&slot))
                .copied()
                .unwrap_or(placement.replica_id);

            for index in &mut placement.indexes {
                index.alternate_shard_ids = Some([
                    AlternateShardId::mainstore(slot, replica_id),
                    AlternateShardId::backstore(slot, replica_id),
                ]);
            }
        }
        for placement in replica_map.iter() {
            for index in &placement.indexes {
                self.record_index_usage(index, &placement.node, true)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn index(defn_id: u64, replica_id: u32, partition_id: u32) -> IndexUsage {
        IndexUsage {
            defn_id,
            replica_id,
            partition_id,
            storage_mode: "plasma".to_string(),
            is_vector: false,
            is_bhive: false,
            data_size: 0,
            alternate_shard_ids: None,
        }
    }

    /// One replica per node, a single partition each.
    fn replica_map(defn_id: u64, nodes: &[&str]) -> Vec<ReplicaPlacement> {
        nodes
            .iter()
            .enumerate()
            .map(|(i, node)| ReplicaPlacement {
                replica_id: i as u32,
                node: node.to_string(),
                indexes: vec![index(defn_id, i as u32, 0)],
            })
            .collect()
    }

    fn config() -> DealerConfig {
        DealerConfig {
            min_shards_per_node: 3,
            min_partitions_per_shard: 16,
            shard_capacity_per_node: 6,
        }
    }

    #[test]
    fn cold_start_mints_one_slot_and_stamps_every_replica() {
        let mut dealer = ShardDealer::new(config());
        let mut map = replica_map(1, &["n0", "n1", "n2"]);

        let slot = dealer.get_slot(1, &mut map).unwrap();

        for (i, placement) in map.iter().enumerate() {
            let [main, back] = placement.indexes[0].alternate_shard_ids.unwrap();
            assert_eq!(main.to_string(), format!("{slot}:{i}:0"));
            assert_eq!(back.to_string(), format!("{slot}:{i}:1"));
        }
        for node in ["n0", "n1", "n2"] {
            assert_eq!(dealer.shard_count(node), 2);
        }
        assert_eq!(dealer.container(slot, 0, GROUP_MAIN).unwrap().partitions, 1);
    }

    #[test]
    fn reuse_below_soft_limits_keeps_shard_counts_flat() {
        let mut dealer = ShardDealer::new(config());

        // Each node already carries one slot of matching category with one
        // partition of 10 MiB, loaded from the existing cluster layout.
        for (i, node) in ["n0", "n1", "n2"].iter().enumerate() {
            let mut seeded = index(9, i as u32, 0);
            seeded.data_size = 10 << 20;
            seeded.alternate_shard_ids = Some([
                AlternateShardId::mainstore(7, i as u32),
                AlternateShardId::backstore(7, i as u32),
            ]);
            dealer.record_index_usage(&seeded, node, false).unwrap();
        }

        // A new definition reuses the seeded slot via pass 1.
        let mut map = replica_map(2, &["n0", "n1", "n2"]);
        let slot = dealer.get_slot(2, &mut map).unwrap();

        assert_eq!(slot, 7);
        for node in ["n0", "n1", "n2"] {
            assert_eq!(dealer.shard_count(node), 2);
        }
        let main = dealer.container(slot, 0, GROUP_MAIN).unwrap();
        assert_eq!(main.partitions, 2);
        assert_eq!(main.data_size, 10 << 20);
    }

    #[test]
    fn repeated_placement_is_sticky() {
        let mut dealer = ShardDealer::new(config());

        let mut first = replica_map(1, &["n0", "n1"]);
        let slot = dealer.get_slot(1, &mut first).unwrap();

        let mut second = replica_map(1, &["n0", "n1"]);
        assert_eq!(dealer.get_slot(1, &mut second).unwrap(), slot);
    }

    #[test]
    fn categories_never_share_slots() {
        let mut dealer = ShardDealer::new(config());

        let mut standard = replica_map(1, &["n0"]);
        let standard_slot = dealer.get_slot(1, &mut standard).unwrap();

        let mut vector = replica_map(2, &["n0"]);
        for placement in &mut vector {
            for index in &mut placement.indexes {
                index.is_vector = true;
            }
        }
        let vector_slot = dealer.get_slot(2, &mut vector).unwrap();

        assert_ne!(standard_slot, vector_slot);
        assert_eq!(dealer.category_of_slot(standard_slot), Some(ShardCategory::Standard));
        assert_eq!(dealer.category_of_slot(vector_slot), Some(ShardCategory::Vector));
    }

    #[test]
    fn non_plasma_usage_is_refused() {
        let mut dealer = ShardDealer::new(config());
        let mut moi = index(1, 0, 0);
        moi.storage_mode = "memory_optimized".to_string();
        moi.alternate_shard_ids = Some([
            AlternateShardId::mainstore(1, 0),
            AlternateShardId::backstore(1, 0),
        ]);

        assert!(matches!(
            dealer.record_index_usage(&moi, "n0", true),
            Err(crate::Error::InvalidCategory { defn_id: 1, .. })
        ));
    }

    #[test]
    fn nodes_at_the_min_shard_floor_reuse_instead_of_minting() {
        let mut dealer = ShardDealer::new(DealerConfig {
            min_shards_per_node: 2,
            ..config()
        });

        // First placement fills the floor (2 shards per node).
        let mut first = replica_map(1, &["n0", "n1"]);
        let first_slot = dealer.get_slot(1, &mut first).unwrap();
        assert_eq!(dealer.shard_count("n0"), 2);

        // The floor is reached: pass 0 must not mint again, and the common
        // slot is reused.
        let mut second = replica_map(2, &["n0", "n1"]);
        let second_slot = dealer.get_slot(2, &mut second).unwrap();
        assert_eq!(second_slot, first_slot);
        assert_eq!(dealer.shard_count("n0"), 2);
    }

    #[test]
    fn soft_limit_overflow_grows_a_new_slot_under_capacity() {
        let mut dealer = ShardDealer::new(DealerConfig {
            min_shards_per_node: 2,
            min_partitions_per_shard: 1,
            shard_capacity_per_node: 6,
        });

        let mut first = replica_map(1, &["n0"]);
        let first_slot = dealer.get_slot(1, &mut first).unwrap();

        // The slot now carries one partition, at the soft partition ceiling,
        // so pass 1 cannot reuse it; capacity allows pass-2 growth.
        let mut second = replica_map(2, &["n0"]);
        let second_slot = dealer.get_slot(2, &mut second).unwrap();
        assert_ne!(second_slot, first_slot);
        assert_eq!(dealer.shard_count("n0"), 4);
    }

    #[test]
    fn at_capacity_reuse_happens_beyond_the_soft_limits() {
        let mut dealer = ShardDealer::new(DealerConfig {
            min_shards_per_node: 2,
            min_partitions_per_shard: 1,
            shard_capacity_per_node: 2,
        });

        let mut first = replica_map(1, &["n0"]);
        let first_slot = dealer.get_slot(1, &mut first).unwrap();

        // Soft limits are exceeded and the node is at capacity: pass 3
        // reuses the existing slot anyway.
        let mut second = replica_map(2, &["n0"]);
        let second_slot = dealer.get_slot(2, &mut second).unwrap();
        assert_eq!(second_slot, first_slot);
        assert_eq!(dealer.shard_count("n0"), 2);
    }

    #[test]
    fn failsafe_mints_when_no_common_slot_exists() {
        let mut dealer = ShardDealer::new(DealerConfig {
            min_shards_per_node: 2,
            min_partitions_per_shard: 1,
            shard_capacity_per_node: 2,
        });

        // Fill each node's capacity with disjoint slots.
        let mut a = replica_map(1, &["n0"]);
        dealer.get_slot(1, &mut a).unwrap();
        let mut b = replica_map(2, &["n1"]);
        dealer.get_slot(2, &mut b).unwrap();

        // No slot spans both nodes and both are at capacity: the failsafe
        // mints anyway.
        let mut spanning = replica_map(3, &["n0", "n1"]);
        let slot = dealer.get_slot(3, &mut spanning).unwrap();
        assert_eq!(dealer.slot_for_defn(3), Some(slot));
        assert_eq!(dealer.shard_count("n0"), 4);
    }

    #[test]
    fn reused_slots_adopt_the_existing_replica_copy_per_node() {
        let mut dealer = ShardDealer::new(config());

        // Replica 0 on n0, replica 1 on n1.
        let mut first = replica_map(1, &["n0", "n1"]);
        let slot = dealer.get_slot(1, &mut first).unwrap();

        // The new definition's replicas arrive in the opposite order; the
        // stamped ids still follow the slot's replica layout per node.
        let mut second = vec![
            ReplicaPlacement {
                replica_id: 0,
                node: "n1".to_string(),
                indexes: vec![index(2, 0, 0)],
            },
            ReplicaPlacement {
                replica_id: 1,
                node: "n0".to_string(),
                indexes: vec![index(2, 1, 0)],
            },
        ];
        // The floor is filled, so pass 1 reuses the first slot.
        assert_eq!(dealer.shard_count("n0"), 2);
        let reused = dealer.get_slot(2, &mut second).unwrap();
        assert_eq!(reused, slot);

        let [main_n1, _] = second[0].indexes[0].alternate_shard_ids.unwrap();
        let [main_n0, _] = second[1].indexes[0].alternate_shard_ids.unwrap();
        assert_eq!(main_n1.replica_id, 1);
        assert_eq!(main_n0.replica_id, 0);
    }
}
