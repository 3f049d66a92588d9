//! The replicated service.
//!
//! The agreement core never interprets commands. It hands each agreed
//! request to an [`Application`] in sequence-number order, and asks it for a
//! digest of its state at every checkpoint.

use bytes::Bytes;
use pbft_types::{Digest, PrincipalId};

/// A deterministic service replicated by the cluster.
///
/// Every correct replica executes the same commands in the same order, so
/// `execute` must depend only on the application state, the command, the
/// client and the primary's non-deterministic choices. Two replicas that
/// executed the same prefix must report the same `state_digest`.
pub trait Application {
    /// Executes an agreed command and returns its result.
    fn execute(&mut self, client: PrincipalId, command: &[u8], non_deterministic: &[u8]) -> Bytes;

    /// Executes a command without agreement.
    ///
    /// Returns `None` if the command cannot be answered read-only (it would
    /// modify state, or the service refuses); the replica then retries it
    /// later.
    fn execute_read_only(&self, client: PrincipalId, command: &[u8]) -> Option<Bytes>;

    /// Digest of the current state, used for checkpoints.
    fn state_digest(&self) -> Digest;
}
