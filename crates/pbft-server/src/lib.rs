//! # pbft-server: replica daemon
//!
//! Hosts one PBFT replica on a UDP socket. The agreement logic lives in
//! `pbft-core`; this crate supplies the pieces around it:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     ReplicaNode                       │
//! │  ┌──────────────┐   ┌───────────┐   ┌──────────────┐  │
//! │  │ UdpTransport │ → │  Runtime  │ → │ Application  │  │
//! │  │  (mio poll)  │ ← │ (timers)  │   │  (KvStore)   │  │
//! │  └──────────────┘   └───────────┘   └──────────────┘  │
//! │         MetricsEndpoint (HTTP, optional)              │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Like the rest of the workspace the daemon uses `mio` directly, with no
//! async runtime.

pub mod app;
mod error;
pub mod http;
mod node;
pub mod transport;

pub use app::KvStore;
pub use error::{ServerError, ServerResult};
pub use http::MetricsEndpoint;
pub use node::{ReplicaNode, SOCKET_TOKEN, ShutdownHandle};
pub use transport::UdpTransport;
