//! PBFT replica state machine.
//!
//! This module implements the agreement protocol as a pure, deterministic
//! state machine: `process(self, event) -> (Self, ReplicaOutput)`.
//!
//! # Architecture
//!
//! - Takes messages and timeouts as input
//! - Produces new state, outbound messages and timer commands as output
//! - No I/O and no clocks; wall-clock time arrives inside events
//!
//! The [`crate::runtime`] module drives it from a task queue.
//!
//! # Protocol Overview
//!
//! ## Normal Operation
//!
//! ```text
//! Client ──Request──► Primary
//!                       │
//!                       ├──PrePrepare──► Backups
//!                       │                  │
//!             All ◄─────┼───Prepare────────┤   (2f matching: prepared)
//!             All ◄─────┼───Commit─────────┤   (2f+1 matching: committed)
//!                       │
//! Client ◄──Reply───── All (execute in seqno order)
//! ```
//!
//! ## View Change
//!
//! ```text
//! Backup ──ViewChange(v+1)──► All (on view-change timeout)
//!           │
//!           ▼ (2f+1 at new primary)
//! New Primary ──NewView(v+1)──► All
//! ```
//!
//! # Key Types
//!
//! - [`ReplicaState`]: the state machine
//! - [`ReplicaEvent`]: what can happen to it
//! - [`ReplicaOutput`]: what it asks the runtime to do

mod checkpoint;
mod keys;
mod normal;
mod state;
mod status;
mod view_change;

pub use state::ReplicaState;
pub use view_change::{Selection, select};

use pbft_types::{ClientId, PrincipalId, ReplicaId, RequestId, SeqNo};

use crate::message::Message;
use crate::timer::{TimeoutKind, TimerCommand};

// ============================================================================
// Replica Output
// ============================================================================

/// Where an outbound message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Replica(ReplicaId),
    Client(ClientId),
    /// Every replica except the sender.
    AllReplicas,
    AllClients,
}

impl Destination {
    pub fn principal(id: PrincipalId) -> Self {
        match id {
            PrincipalId::Replica(r) => Self::Replica(r),
            PrincipalId::Client(c) => Self::Client(c),
        }
    }
}

/// An authenticated message and its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub destination: Destination,
    pub message: Message,
}

/// A request executed at `seqno`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Executed {
    pub client: PrincipalId,
    pub request_id: RequestId,
    pub seqno: SeqNo,
}

/// Output produced by the replica state machine.
///
/// The runtime is responsible for:
/// 1. Encoding and sending the outbound messages
/// 2. Applying the timer commands
#[derive(Debug, Default)]
pub struct ReplicaOutput {
    pub messages: Vec<Outbound>,
    pub timers: Vec<TimerCommand>,
    /// Requests executed while processing the event.
    pub executed: Vec<Executed>,
}

impl ReplicaOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<Outbound>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn send(&mut self, destination: Destination, message: Message) {
        self.messages.push(Outbound {
            destination,
            message,
        });
    }

    pub fn timer(&mut self, command: TimerCommand) {
        self.timers.push(command);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.timers.is_empty() && self.executed.is_empty()
    }

    /// Merges another output into this one, keeping order.
    pub fn merge(&mut self, other: ReplicaOutput) {
        self.messages.extend(other.messages);
        self.timers.extend(other.timers);
        self.executed.extend(other.executed);
    }
}

// ============================================================================
// Replica Event
// ============================================================================

/// Events that can trigger replica state transitions.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// The replica came up: arm timers and distribute session keys.
    Start {
        /// Wall-clock milliseconds, used to seed key-refresh request ids.
        now_millis: u64,
    },

    /// A decoded message arrived.
    Message {
        /// The principal bound to the datagram's source address, if known.
        /// Informational only; identity comes from the authenticator.
        source: Option<PrincipalId>,
        message: Message,
    },

    /// A timer fired.
    Timeout { kind: TimeoutKind, now_millis: u64 },
}
