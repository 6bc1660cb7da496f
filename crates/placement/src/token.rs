//! Transfer tokens: the state machine a shard movement advances through,
//! with each transition owned by exactly one mover role.

use serde::{Deserialize, Serialize};

/// Ordered lifecycle of one transfer. `Refused` and `Error` are sinks kept
/// for wire compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferTokenState {
    Created,
    Accepted,
    Initiate,
    InProgress,
    Merge,
    Ready,
    Commit,
    Deleted,
    Refused,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoverRole {
    Master,
    Source,
    Dest,
}

impl TransferTokenState {
    /// The role that owns transitions out of this state; `None` for
    /// terminal states and sinks.
    pub fn owner(self) -> Option<MoverRole> {
        match self {
            TransferTokenState::Created => Some(MoverRole::Dest),
            TransferTokenState::Accepted => Some(MoverRole::Master),
            TransferTokenState::Initiate => Some(MoverRole::Dest),
            TransferTokenState::InProgress => Some(MoverRole::Dest),
            TransferTokenState::Merge => Some(MoverRole::Dest),
            TransferTokenState::Ready => Some(MoverRole::Source),
            TransferTokenState::Commit => Some(MoverRole::Master),
            TransferTokenState::Deleted
            | TransferTokenState::Refused
            | TransferTokenState::Error => None,
        }
    }

    /// Legal successor states.
    pub fn successors(self) -> &'static [TransferTokenState] {
        use TransferTokenState::*;
        match self {
            Created => &[Accepted, Refused],
            Accepted => &[Initiate, Error],
            Initiate => &[InProgress, Error],
            InProgress => &[Merge, Ready, Error],
            Merge => &[Ready, Error],
            Ready => &[Commit, Error],
            Commit => &[Deleted, Error],
            Deleted | Refused | Error => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferToken {
    pub token_id: String,
    pub state: TransferTokenState,
    pub master: String,
    pub source: String,
    pub dest: String,
    /// Definitions whose instances ride this transfer.
    #[serde(default)]
    pub defn_ids: Vec<u64>,
}

/// Outcome of handing an inbound token to a mover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The receiver's role does not own the token's current state, or the
    /// requested successor is not legal: the token is left untouched.
    Ignored,
}

impl TransferToken {
    pub fn new(token_id: String, master: String, source: String, dest: String) -> Self {
        Self {
            token_id,
            state: TransferTokenState::Created,
            master,
            source,
            dest,
            defn_ids: Vec::new(),
        }
    }

    /// Advance the token as `role`. A token whose current state is not owned
    /// by `role`, or whose requested successor is illegal, is a no-op.
    pub fn advance(&mut self, role: MoverRole, next: TransferTokenState) -> Transition {
        if self.state.owner() != Some(role) || !self.state.successors().contains(&next) {
            tracing::debug!(
                token = %self.token_id,
                state = ?self.state,
                ?role,
                ?next,
                "ignoring transfer-token transition"
            );
            return Transition::Ignored;
        }
        self.state = next;
        Transition::Applied
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use TransferTokenState::*;

    fn token() -> TransferToken {
        TransferToken::new(
            "tt-1".to_string(),
            "master:9100".to_string(),
            "src:9100".to_string(),
            "dst:9100".to_string(),
        )
    }

    #[test]
    fn happy_path_walks_the_full_sequence() {
        let mut tt = token();
        let steps = [
            (MoverRole::Dest, Accepted),
            (MoverRole::Master, Initiate),
            (MoverRole::Dest, InProgress),
            (MoverRole::Dest, Merge),
            (MoverRole::Dest, Ready),
            (MoverRole::Source, Commit),
            (MoverRole::Master, Deleted),
        ];
        for (role, next) in steps {
            assert_eq!(tt.advance(role, next), Transition::Applied, "{next:?}");
        }
        assert!(tt.state.is_terminal());
    }

    #[test]
    fn merge_is_optional() {
        let mut tt = token();
        tt.advance(MoverRole::Dest, Accepted);
        tt.advance(MoverRole::Master, Initiate);
        tt.advance(MoverRole::Dest, InProgress);
        assert_eq!(tt.advance(MoverRole::Dest, Ready), Transition::Applied);
    }

    #[test]
    fn wrong_role_transitions_are_no_ops() {
        let mut tt = token();
        // Created is owned by the dest; the source must not touch it.
        assert_eq!(tt.advance(MoverRole::Source, Accepted), Transition::Ignored);
        assert_eq!(tt.state, Created);

        // Skipping ahead is not legal even for the owner.
        assert_eq!(tt.advance(MoverRole::Dest, Ready), Transition::Ignored);
        assert_eq!(tt.state, Created);
    }

    #[test]
    fn refused_and_error_are_sinks() {
        let mut refused = token();
        assert_eq!(refused.advance(MoverRole::Dest, Refused), Transition::Applied);
        assert!(refused.state.is_terminal());
        assert_eq!(refused.advance(MoverRole::Dest, Accepted), Transition::Ignored);

        let mut errored = token();
        errored.advance(MoverRole::Dest, Accepted);
        assert_eq!(errored.advance(MoverRole::Master, Error), Transition::Applied);
        assert!(errored.state.is_terminal());
        for role in [MoverRole::Master, MoverRole::Source, MoverRole::Dest] {
            assert_eq!(errored.advance(role, Ready), Transition::Ignored);
        }
    }
}
