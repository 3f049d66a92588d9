//! # pbft-core: Practical Byzantine Fault Tolerance agreement core
//!
//! A fixed cluster of `n = 3f + 1` replicas agrees on a total order of
//! client requests and executes them against a deterministic
//! [`Application`], tolerating up to `f` arbitrarily faulty replicas and any
//! number of faulty clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          pbft-core                            │
//! │  ┌───────────┐   ┌─────────────┐   ┌──────────────────────┐   │
//! │  │ Transport │ → │  TaskQueue  │ → │ ReplicaState::process │   │
//! │  │ (datagram)│   │  (bounded)  │   │   (pure, no I/O)      │   │
//! │  └───────────┘   └─────────────┘   └──────────────────────┘   │
//! │        ▲                                     │                │
//! │        └──────── encoded frames ◄────────────┘ timers ─► Timers│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`principal`]: identities, session keys, signatures and MAC vectors
//! - [`message`]: the closed message set and its wire frame
//! - [`log`]: the sliding window of prepare/commit certificates
//! - [`replica`]: the agreement state machine (normal case, checkpoints,
//!   view changes, status-driven retransmission)
//! - [`runtime`]: drives one replica from a task queue
//! - [`client`]: the client side of the request/reply protocol
//!
//! The core performs no I/O of its own. A transport delivers datagrams with
//! [`Runtime::deliver_datagram`] and receives outbound frames through the
//! [`Transport`] trait.

pub mod application;
pub mod client;
pub mod config;
pub mod error;
pub mod instrumentation;
pub mod log;
pub mod message;
pub mod principal;
pub mod queue;
pub mod replica;
pub mod runtime;
pub mod task;
pub mod timer;


pub use application::Application;
pub use client::Client;
pub use config::{ClusterConfig, ProtocolConfig, ReplicaConfig, TimerConfig};
pub use error::{
    ClientError, FrameError, KeyError, LogError, Rejection, Result, RuntimeError,
};
pub use instrumentation::{METRICS, Metrics, MetricsSnapshot};
pub use message::{Authenticator, Message, MessagePayload, MessageTag};
pub use principal::{Keyring, Principal, PrincipalSet};
pub use replica::{Destination, Outbound, ReplicaEvent, ReplicaOutput, ReplicaState};
pub use runtime::{Runtime, Transport};
pub use task::{Task, TaskQueue};
pub use timer::{TimeoutKind, TimerCommand, Timers};

// Re-export identifier types for convenience
pub use pbft_types::{
    ClientId, Digest, PrincipalId, ReplicaId, RequestId, SeqNo, ViewNumber,
};
