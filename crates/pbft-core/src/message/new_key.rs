//! Session-key refresh bundle.

use pbft_crypto::SealedKey;
use pbft_types::{PrincipalId, ReplicaId};
use serde::{Deserialize, Serialize};

/// Fresh inbound keys from `sender`, one sealed copy per replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewKey {
    pub sender: PrincipalId,
    /// Strictly increasing per sender; receivers drop bundles that do not
    /// advance it.
    pub request_id: u64,
    /// Indexed by replica; the sender's own slot is empty.
    pub keys: Vec<Option<SealedKey>>,
}

impl NewKey {
    /// The sealed key addressed to `replica`.
    pub fn slot(&self, replica: ReplicaId) -> Option<&SealedKey> {
        self.keys.get(replica.as_index()).and_then(Option::as_ref)
    }
}

/// Associated data binding a sealed key to its bundle.
pub fn seal_context(sender: PrincipalId, recipient: ReplicaId, request_id: u64) -> Vec<u8> {
    let (class, index) = match sender {
        PrincipalId::Replica(id) => (0u8, id.as_u32()),
        PrincipalId::Client(id) => (1u8, id.as_u32()),
    };
    let mut context = Vec::with_capacity(32);
    context.extend_from_slice(b"pbft-new-key");
    context.push(class);
    context.extend_from_slice(&index.to_le_bytes());
    context.extend_from_slice(&recipient.as_u32().to_le_bytes());
    context.extend_from_slice(&request_id.to_le_bytes());
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_types::ClientId;

    #[test]
    fn context_distinguishes_every_field() {
        let base = seal_context(ReplicaId::new(1).into(), ReplicaId::new(2), 7);

        assert_ne!(base, seal_context(ClientId::new(1).into(), ReplicaId::new(2), 7));
        assert_ne!(base, seal_context(ReplicaId::new(1).into(), ReplicaId::new(3), 7));
        assert_ne!(base, seal_context(ReplicaId::new(1).into(), ReplicaId::new(2), 8));
    }

    #[test]
    fn missing_and_out_of_range_slots() {
        let bundle = NewKey {
            sender: ReplicaId::new(0).into(),
            request_id: 1,
            keys: vec![None, None],
        };
        assert!(bundle.slot(ReplicaId::new(0)).is_none());
        assert!(bundle.slot(ReplicaId::new(5)).is_none());
    }
}
