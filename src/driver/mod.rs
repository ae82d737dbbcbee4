//! Datagram drivers move raw packets. Everything above this layer (sequencing, fragmentation,
//!  handshakes) is driver independent, so a loopback queue and a UDP socket are interchangeable.
//!
//! Several drivers can be registered with a transport at the same time. They are tried in
//!  registration order for operations like connecting or listening.

pub mod address;
pub mod loopback;
pub mod udp;

#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

/// Driver specific identifier of an open socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SocketHandle(pub u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddrMatch {
    Same,
    SameHostDifferentPort,
    Different,
}

impl AddrMatch {
    pub fn is_same_host(self) -> bool {
        self != AddrMatch::Different
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    Written(usize),
    /// the packet was not sent, but the socket is fine - treated like a lost packet
    WouldBlock,
}

/// This is the capability a transport needs from a concrete datagram transport. All operations
///  are non-blocking: `read` returns `Ok(None)` if nothing is available rather than waiting.
#[cfg_attr(test, automock)]
pub trait DatagramDriver {
    fn name(&self) -> &str;

    /// Prepares the driver and returns its control socket, which is used for discovery.
    fn init(&mut self) -> anyhow::Result<SocketHandle>;

    fn shutdown(&mut self);

    /// Opens (or closes) the accept socket on the driver's well-known host port.
    fn listen(&mut self, enable: bool) -> anyhow::Result<()>;

    /// Port 0 picks an ephemeral port.
    fn open_socket(&mut self, port: u16) -> anyhow::Result<SocketHandle>;

    fn close_socket(&mut self, socket: SocketHandle);

    /// Returns the accept socket if the driver is listening and there may be a pending control
    ///  request on it.
    fn check_new_connections(&mut self) -> Option<SocketHandle>;

    fn read(&mut self, socket: SocketHandle, buf: &mut [u8]) -> anyhow::Result<Option<(usize, SocketAddr)>>;

    fn write(&mut self, socket: SocketHandle, buf: &[u8], to: SocketAddr) -> anyhow::Result<WriteOutcome>;

    /// Sends to every host on the local network, addressed to the host port.
    fn broadcast(&mut self, socket: SocketHandle, buf: &[u8]) -> anyhow::Result<WriteOutcome>;

    /// Resolves a host name or (partial) numeric address with optional `:port` suffix. The
    ///  driver's host port is used if no port is given.
    fn resolve_name(&self, name: &str) -> anyhow::Result<SocketAddr>;

    /// Best effort human readable name for an address, falling back to the numeric form.
    fn reverse_resolve(&self, addr: SocketAddr) -> String;

    /// The address peers can reach this socket on. Wildcard bind addresses are replaced by
    ///  the driver's notion of the local address.
    fn socket_addr(&self, socket: SocketHandle) -> anyhow::Result<SocketAddr>;

    fn compare_addr(&self, a: SocketAddr, b: SocketAddr) -> AddrMatch {
        compare_socket_addrs(a, b)
    }

    fn addr_to_string(&self, addr: SocketAddr) -> String {
        addr.to_string()
    }

    /// Maximum payload per packet, i.e. excluding the packet header.
    fn default_mtu(&self) -> usize;
}

/// A driver that was initialized successfully, together with its control socket. The control
///  socket is used for discovery and the other out-of-band queries.
pub struct DriverSlot {
    pub driver: Box<dyn DatagramDriver>,
    pub control_socket: SocketHandle,
}

pub fn compare_socket_addrs(a: SocketAddr, b: SocketAddr) -> AddrMatch {
    if a.ip() != b.ip() {
        AddrMatch::Different
    }
    else if a.port() != b.port() {
        AddrMatch::SameHostDifferentPort
    }
    else {
        AddrMatch::Same
    }
}
