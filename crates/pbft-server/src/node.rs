//! Replica event loop.
//!
//! One thread, one mio `Poll`. The UDP socket and the optional metrics
//! listener are registered with it; every wake-up drains the socket into
//! the runtime's task queue and then runs the runtime once, which also
//! fires any expired timers. The poll timeout never exceeds the next timer
//! deadline, so timers fire on time even when the network is quiet.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mio::{Events, Interest, Poll, Token};
use pbft_core::{Application, ReplicaState, Runtime, Task};
use tracing::{debug, info};

use crate::error::ServerResult;
use crate::http::{METRICS_TOKEN, MetricsEndpoint};
use crate::transport::UdpTransport;

/// Token for the replica's UDP socket.
pub const SOCKET_TOKEN: Token = Token(0);

/// Longest the loop sleeps, so shutdown requests are noticed.
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// A replica bound to its socket.
pub struct ReplicaNode<A: Application> {
    poll: Poll,
    runtime: Runtime<UdpTransport, A>,
    metrics: Option<MetricsEndpoint>,
    shutdown: Arc<AtomicBool>,
}

/// Asks a running [`ReplicaNode`] to stop after its current iteration.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

impl<A: Application> ReplicaNode<A> {
    /// Registers the transport (and, when `metrics_addr` is set, the HTTP
    /// metrics endpoint) with a fresh poll.
    pub fn new(
        state: ReplicaState<A>,
        mut transport: UdpTransport,
        queue_capacity: usize,
        metrics_addr: Option<SocketAddr>,
    ) -> ServerResult<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(transport.socket_mut(), SOCKET_TOKEN, Interest::READABLE)?;
        let metrics = metrics_addr
            .map(|addr| MetricsEndpoint::bind(addr, poll.registry()))
            .transpose()?;

        Ok(Self {
            poll,
            runtime: Runtime::new(state, transport, queue_capacity),
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
        }
    }

    pub fn runtime(&self) -> &Runtime<UdpTransport, A> {
        &self.runtime
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics.as_ref().and_then(|m| m.local_addr().ok())
    }

    /// Runs until shut down or until the runtime fails.
    pub fn run(&mut self) -> ServerResult<()> {
        self.runtime.start(Instant::now(), unix_millis())?;
        self.runtime.deliver(Task::ConnectionMade);
        if let Some(state) = self.runtime.state() {
            info!(replica = %state.replica_id(), "replica running");
        }

        let mut events = Events::with_capacity(128);
        while !self.shutdown.load(Ordering::SeqCst) {
            let timeout = self.poll_timeout(Instant::now());
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in &events {
                match event.token() {
                    SOCKET_TOKEN => self.drain_socket(),
                    METRICS_TOKEN => {
                        if let Some(metrics) = &self.metrics {
                            metrics.serve_pending();
                        }
                    }
                    token => debug!(?token, "event for unknown token"),
                }
            }

            self.runtime.run_once(Instant::now(), unix_millis())?;
        }

        info!("replica shut down");
        Ok(())
    }

    /// Time until the next timer deadline, capped at [`MAX_POLL_TIMEOUT`].
    fn poll_timeout(&self, now: Instant) -> Duration {
        self.runtime
            .next_deadline()
            .map_or(MAX_POLL_TIMEOUT, |deadline| {
                deadline.saturating_duration_since(now).min(MAX_POLL_TIMEOUT)
            })
    }

    /// Reads datagrams until the socket would block. mio is edge-triggered,
    /// so stopping early would strand data until the next datagram arrives.
    fn drain_socket(&mut self) {
        loop {
            match self.runtime.transport_mut().recv() {
                Ok(Some((bytes, source))) => {
                    self.runtime.deliver_datagram(bytes, source);
                }
                Ok(None) => break,
                Err(e) => {
                    self.runtime.deliver(Task::TransportError(e.to_string()));
                    break;
                }
            }
        }
    }
}

impl<A: Application> std::fmt::Debug for ReplicaNode<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaNode")
            .field("transport", self.runtime.transport())
            .field("metrics", &self.metrics_addr())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Wall-clock milliseconds, used only to stamp key bundles.
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
