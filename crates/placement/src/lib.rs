//! Shard-placement planning: the category-aware shard dealer that assigns
//! index instances to alternate shard slots, and the transfer-token state
//! machine that rebalance movers drive.

pub mod category;
pub mod dealer;
pub mod ids;
pub mod token;

pub use category::ShardCategory;
pub use dealer::{DealerConfig, IndexUsage, ReplicaPlacement, ShardDealer};
pub use ids::AlternateShardId;
pub use token::{MoverRole, TransferToken, TransferTokenState};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("index definition {defn_id} has no valid shard category (storage mode '{storage_mode}')")]
    InvalidCategory { defn_id: u64, storage_mode: String },
    #[error("replica map for definition {0} is empty")]
    EmptyReplicaMap(u64),
    #[error("definition {defn_id} is pinned to slot {slot} of a different category")]
    CategoryMismatch { defn_id: u64, slot: u64 },
    #[error("malformed alternate shard id '{0}'")]
    MalformedShardId(String),
}

pub type Result<T> = std::result::Result<T, Error>;
