//! Alternate shard ids: `(slot, replica, group)` naming one physical shard.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Group naming the mainstore of a slot/replica pair.
pub const GROUP_MAIN: u8 = 0;
/// Group naming the backstore of the same slot/replica pair.
pub const GROUP_BACK: u8 = 1;

/// One physical shard: a slot, a replica copy of that slot, and whether this
/// is its mainstore or backstore. Renders as `slot:replica:group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct AlternateShardId {
    pub slot_id: u64,
    pub replica_id: u32,
    pub group_id: u8,
}

impl AlternateShardId {
    pub fn mainstore(slot_id: u64, replica_id: u32) -> Self {
        Self {
            slot_id,
            replica_id,
            group_id: GROUP_MAIN,
        }
    }

    pub fn backstore(slot_id: u64, replica_id: u32) -> Self {
        Self {
            slot_id,
            replica_id,
            group_id: GROUP_BACK,
        }
    }

    pub fn is_mainstore(&self) -> bool {
        self.group_id == GROUP_MAIN
    }

    /// The paired store of the same slot/replica.
    pub fn sibling(&self) -> Self {
        Self {
            group_id: match self.group_id {
                GROUP_MAIN => GROUP_BACK,
                _ => GROUP_MAIN,
            },
            ..*self
        }
    }
}

impl fmt::Display for AlternateShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.slot_id, self.replica_id, self.group_id)
    }
}

impl FromStr for AlternateShardId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let malformed = || crate::Error::MalformedShardId(s.to_string());
        let mut parts = s.split(':');
        let slot_id = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        let replica_id = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        let group_id = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(Self {
            slot_id,
            replica_id,
            group_id,
        })
    }
}

impl From<AlternateShardId> for String {
    fn from(id: AlternateShardId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for AlternateShardId {
    type Error = crate::Error;

    fn try_from(s: String) -> crate::Result<Self> {
        s.parse()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn renders_and_parses_slot_replica_group() {
        let id = AlternateShardId::mainstore(57, 2);
        assert_eq!(id.to_string(), "57:2:0");
        assert_eq!("57:2:0".parse::<AlternateShardId>().unwrap(), id);

        let back = id.sibling();
        assert_eq!(back.to_string(), "57:2:1");
        assert!(!back.is_mainstore());
        assert_eq!(back.sibling(), id);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for bad in ["", "1", "1:2", "1:2:3:4", "x:2:0"] {
            assert!(bad.parse::<AlternateShardId>().is_err(), "{bad}");
        }
    }
}
