//! Leader election.
//!
//! Only one replica may reconcile at a time. There is no cross-replica lock
//! yet: [`SingleWriter`] assumes this process is the only writer.

/// Reports whether this process currently holds the write lease.
pub trait LeaderElection: Send + Sync + 'static {
    fn is_leader(&self) -> bool;
}

/// Always the leader.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleWriter;

impl LeaderElection for SingleWriter {
    fn is_leader(&self) -> bool {
        true
    }
}
