//! Session-key refresh.
//!
//! Each replica periodically picks fresh inbound MAC keys for its peers and
//! sends them in a signed NewKey, one sealed copy per recipient. Peers
//! install the key they can open as the key they MAC with toward the sender.

use crate::application::Application;
use crate::instrumentation::METRICS;
use crate::message::{MessagePayload, NewKey};
use crate::timer::{TimeoutKind, TimerCommand};

use super::{Destination, ReplicaOutput, ReplicaState};

impl<A: Application> ReplicaState<A> {
    /// Broadcasts a fresh key bundle and rearms the refresh timer.
    pub(crate) fn send_new_key(&mut self, now_millis: u64) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        match self.keys.new_key_bundle(now_millis) {
            Ok(bundle) => {
                tracing::debug!(
                    replica = %self.replica_id,
                    request = bundle.request_id,
                    "sending NewKey"
                );
                let message = self.keys.sign_message(MessagePayload::NewKey(bundle));
                output.send(Destination::AllReplicas, message);
            }
            Err(error) => {
                tracing::warn!(
                    replica = %self.replica_id,
                    %error,
                    "failed to generate session keys"
                );
            }
        }
        output.timer(TimerCommand::Restart(TimeoutKind::KeyRefresh));
        output
    }

    /// Installs the key a peer sealed for this replica.
    pub(crate) fn on_new_key(mut self, bundle: NewKey) -> (Self, ReplicaOutput) {
        match self.keys.install_new_key(&bundle) {
            Ok(()) => {
                tracing::info!(
                    replica = %self.replica_id,
                    from = %bundle.sender,
                    request = bundle.request_id,
                    "installed session key"
                );
                METRICS.increment_keys_installed();
            }
            Err(error) => {
                tracing::warn!(
                    replica = %self.replica_id,
                    from = %bundle.sender,
                    %error,
                    "rejected NewKey"
                );
                METRICS.increment_protocol_rejections();
            }
        }
        (self, ReplicaOutput::empty())
    }
}
