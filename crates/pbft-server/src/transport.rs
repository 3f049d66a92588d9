//! UDP transport.
//!
//! One non-blocking mio `UdpSocket` per node, bound to the node's address
//! from the principal table. Outbound destinations resolve to socket
//! addresses through the same table, and inbound datagrams are tagged with
//! the principal whose address they came from. That tag is only a hint:
//! identity is always established from the authenticator.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use mio::net::UdpSocket;
use pbft_core::{Destination, PrincipalSet, Transport};
use pbft_types::PrincipalId;

use crate::error::{ServerError, ServerResult};

/// Largest datagram this transport will receive.
pub const MAX_DATAGRAM: usize = 64 * 1024;

pub struct UdpTransport {
    socket: UdpSocket,
    me: PrincipalId,
    own_address: Option<SocketAddr>,
    replicas: Vec<SocketAddr>,
    clients: Vec<SocketAddr>,
    by_address: HashMap<SocketAddr, PrincipalId>,
    recv_buffer: Vec<u8>,
}

impl UdpTransport {
    /// Binds to `me`'s address from `principals`.
    pub fn bind(me: PrincipalId, principals: &PrincipalSet) -> ServerResult<Self> {
        let addr = principals
            .get(me)
            .ok_or(ServerError::UnknownPrincipal(me))?
            .address();
        let socket =
            UdpSocket::bind(addr).map_err(|source| ServerError::BindFailed { addr, source })?;
        tracing::info!(node = %me, %addr, "UDP transport bound");
        Ok(Self::from_socket(socket, me, principals))
    }

    /// Wraps an already bound socket.
    pub fn from_socket(socket: UdpSocket, me: PrincipalId, principals: &PrincipalSet) -> Self {
        let mut replicas = Vec::new();
        let mut clients = Vec::new();
        let mut by_address = HashMap::new();
        for principal in principals.iter() {
            let addr = principal.address();
            if principal.id().is_replica() {
                replicas.push(addr);
            } else {
                clients.push(addr);
            }
            by_address.insert(addr, principal.id());
        }

        Self {
            socket,
            me,
            own_address: principals.get(me).map(pbft_core::Principal::address),
            replicas,
            clients,
            by_address,
            recv_buffer: vec![0; MAX_DATAGRAM],
        }
    }

    pub fn socket_mut(&mut self) -> &mut UdpSocket {
        &mut self.socket
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The principal bound to `addr`, if any.
    pub fn source_of(&self, addr: SocketAddr) -> Option<PrincipalId> {
        self.by_address.get(&addr).copied()
    }

    /// Socket addresses for a destination. Broadcasts skip this node.
    pub fn resolve(&self, destination: &Destination) -> Vec<SocketAddr> {
        match destination {
            Destination::Replica(id) => self.replicas.get(id.as_index()).copied().into_iter().collect(),
            Destination::Client(id) => self.clients.get(id.as_index()).copied().into_iter().collect(),
            Destination::AllReplicas => self
                .replicas
                .iter()
                .copied()
                .filter(|addr| Some(*addr) != self.own_address)
                .collect(),
            Destination::AllClients => self.clients.clone(),
        }
    }

    /// Receives one datagram. Returns `None` once the socket is drained.
    pub fn recv(&mut self) -> io::Result<Option<(Bytes, Option<PrincipalId>)>> {
        match self.socket.recv_from(&mut self.recv_buffer) {
            Ok((len, addr)) => {
                let bytes = Bytes::copy_from_slice(&self.recv_buffer[..len]);
                Ok(Some((bytes, self.source_of(addr))))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, destination: &Destination, bytes: Bytes) -> io::Result<()> {
        let mut first_error = None;
        for addr in self.resolve(destination) {
            match self.socket.send_to(&bytes, addr) {
                Ok(_) => {}
                // Datagrams are best-effort; a full socket buffer drops this one.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tracing::debug!(%addr, "socket buffer full, dropping datagram");
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "send_to failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("me", &self.me)
            .field("local_addr", &self.socket.local_addr().ok())
            .field("replicas", &self.replicas.len())
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}
