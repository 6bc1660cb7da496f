//! Shard categories. A slot is pinned to one category for its lifetime;
//! categories never share slots.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardCategory {
    /// Plain plasma-backed indexes.
    Standard,
    /// Composite vector indexes.
    Vector,
    /// Bhive vector indexes.
    Bhive,
}

impl ShardCategory {
    /// The category for an index, or `None` when the index cannot live on a
    /// shared shard at all (non-plasma storage).
    pub fn for_index(storage_mode: &str, vector: bool, bhive: bool) -> Option<Self> {
        if storage_mode != "plasma" {
            return None;
        }
        Some(if bhive {
            ShardCategory::Bhive
        } else if vector {
            ShardCategory::Vector
        } else {
            ShardCategory::Standard
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_plasma_indexes_have_a_category() {
        assert_eq!(
            ShardCategory::for_index("plasma", false, false),
            Some(ShardCategory::Standard)
        );
        assert_eq!(
            ShardCategory::for_index("plasma", true, false),
            Some(ShardCategory::Vector)
        );
        assert_eq!(
            ShardCategory::for_index("plasma", true, true),
            Some(ShardCategory::Bhive)
        );
        assert_eq!(ShardCategory::for_index("memory_optimized", false, false), None);
        assert_eq!(ShardCategory::for_index("forestdb", false, false), None);
    }
}
