use bytes::Bytes;

/// StateMachine describes a user-defined state machine that is replicated
/// across the cluster. The replica hands it committed commands in strict
/// index order, exactly once, and asks it for its state when compacting the
/// log.
pub trait StateMachine {
    /// Apply the committed command at `index`.
    fn apply(&mut self, index: u64, command: &[u8]);

    /// Serialize the current state, i.e. the state as of the last applied
    /// index.
    fn snapshot(&self) -> Bytes;

    /// Replace the current state with one produced by `snapshot`, possibly on
    /// another replica.
    fn restore(&mut self, payload: &[u8]);
}
