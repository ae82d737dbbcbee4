//! In-process datagram network. Several [LoopbackDriver]s attached to one [LoopbackNetwork]
//!  behave like hosts on a shared LAN segment: each host has its own IPv4 address, sockets are
//!  bound to virtual ports, and broadcasts reach every socket bound to the network's host port.
//!
//! This is what the end-to-end tests run on, and it is useful for running a client and a
//!  server in the same process. Delivery is immediate (a write is visible to the next read),
//!  and packet loss can be injected deterministically.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use anyhow::{anyhow, bail};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::driver::address::{complete_partial_ipv4, split_host_port};
use crate::driver::{DatagramDriver, SocketHandle, WriteOutcome};

pub const DEFAULT_LOOPBACK_PORT: u16 = 26000;
pub const DEFAULT_LOOPBACK_MTU: usize = 1024;

const FIRST_EPHEMERAL_PORT: u16 = 40000;

struct Loss {
    probability: f64,
    rng: StdRng,
}

struct NetworkInner {
    host_port: u16,
    mtu: usize,
    hosts: FxHashMap<String, Ipv4Addr>,
    queues: FxHashMap<SocketAddr, VecDeque<(Bytes, SocketAddr)>>,
    next_host: u32,
    next_ephemeral_port: u16,
    drop_next: usize,
    loss: Option<Loss>,
}

impl NetworkInner {
    fn should_drop(&mut self) -> bool {
        if self.drop_next > 0 {
            self.drop_next -= 1;
            return true;
        }
        if let Some(loss) = &mut self.loss {
            return loss.rng.gen_bool(loss.probability);
        }
        false
    }

    fn deliver(&mut self, from: SocketAddr, to: SocketAddr, buf: &[u8]) {
        if self.should_drop() {
            debug!("loopback network: dropping packet {:?} -> {:?}", from, to);
            return;
        }

        match self.queues.get_mut(&to) {
            Some(queue) => {
                trace!("loopback network: {:?} -> {:?}: {:?}", from, to, buf);
                queue.push_back((Bytes::copy_from_slice(buf), from));
            }
            None => trace!("loopback network: no socket bound to {:?}, packet is lost", to),
        }
    }

    fn ephemeral_port(&mut self, ip: Ipv4Addr) -> anyhow::Result<u16> {
        for _ in 0..u16::MAX {
            let port = self.next_ephemeral_port;
            self.next_ephemeral_port = self.next_ephemeral_port.checked_add(1)
                .unwrap_or(FIRST_EPHEMERAL_PORT);
            if port != self.host_port && !self.queues.contains_key(&SocketAddr::from((ip, port))) {
                return Ok(port);
            }
        }
        bail!("no free ephemeral port on {}", ip)
    }
}

/// Shared handle to the in-memory network. Cloning it yields another handle to the same
///  network.
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        LoopbackNetwork::new(DEFAULT_LOOPBACK_PORT, DEFAULT_LOOPBACK_MTU)
    }
}

impl LoopbackNetwork {
    pub fn new(host_port: u16, mtu: usize) -> LoopbackNetwork {
        LoopbackNetwork {
            inner: Arc::new(Mutex::new(NetworkInner {
                host_port,
                mtu,
                hosts: FxHashMap::default(),
                queues: FxHashMap::default(),
                next_host: 1,
                next_ephemeral_port: FIRST_EPHEMERAL_PORT,
                drop_next: 0,
                loss: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        // a panic while holding the lock leaves queues that are still structurally valid
        self.inner.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a host with the next free address in 10.0.0.0/8, returning the driver for it.
    pub fn add_host(&self, name: &str) -> LoopbackDriver {
        let mut inner = self.lock();
        let ip = Ipv4Addr::from(u32::from(Ipv4Addr::new(10, 0, 0, 0)) + inner.next_host);
        inner.next_host += 1;
        inner.hosts.insert(name.to_ascii_lowercase(), ip);

        LoopbackDriver {
            network: self.clone(),
            host_name: name.to_string(),
            ip,
            sockets: FxHashMap::default(),
            next_handle: 0,
            control_socket: None,
            accept_socket: None,
        }
    }

    /// Silently discards the next `num_packets` packets written to the network, broadcasts
    ///  included.
    pub fn drop_next(&self, num_packets: usize) {
        self.lock().drop_next += num_packets;
    }

    /// Discards each packet with the given probability, using a seeded random generator so
    ///  that runs are reproducible. A probability of 0 switches random loss off.
    pub fn set_loss(&self, probability: f64, seed: u64) {
        let mut inner = self.lock();
        inner.loss = if probability > 0.0 {
            Some(Loss {
                probability: probability.min(1.0),
                rng: StdRng::seed_from_u64(seed),
            })
        }
        else {
            None
        };
    }

    /// number of packets waiting to be read, across all sockets
    pub fn num_pending(&self) -> usize {
        self.lock().queues.values()
            .map(|q| q.len())
            .sum()
    }
}

pub struct LoopbackDriver {
    network: LoopbackNetwork,
    host_name: String,
    ip: Ipv4Addr,
    sockets: FxHashMap<SocketHandle, SocketAddr>,
    next_handle: u32,
    control_socket: Option<SocketHandle>,
    accept_socket: Option<SocketHandle>,
}

impl LoopbackDriver {
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    fn bound_addr(&self, socket: SocketHandle) -> anyhow::Result<SocketAddr> {
        self.sockets.get(&socket)
            .copied()
            .ok_or_else(|| anyhow!("socket {:?} is not open", socket))
    }
}

impl DatagramDriver for LoopbackDriver {
    fn name(&self) -> &str {
        "loopback"
    }

    fn init(&mut self) -> anyhow::Result<SocketHandle> {
        if let Some(control) = self.control_socket {
            return Ok(control);
        }
        let control = self.open_socket(0)?;
        self.control_socket = Some(control);
        Ok(control)
    }

    fn shutdown(&mut self) {
        let handles = self.sockets.keys().copied().collect::<Vec<_>>();
        for handle in handles {
            self.close_socket(handle);
        }
        self.control_socket = None;
        self.accept_socket = None;
    }

    fn listen(&mut self, enable: bool) -> anyhow::Result<()> {
        if enable {
            if self.accept_socket.is_none() {
                let host_port = self.network.lock().host_port;
                self.accept_socket = Some(self.open_socket(host_port)?);
            }
        }
        else if let Some(accept) = self.accept_socket.take() {
            self.close_socket(accept);
        }
        Ok(())
    }

    fn open_socket(&mut self, port: u16) -> anyhow::Result<SocketHandle> {
        let mut network = self.network.lock();
        let port = if port == 0 {
            network.ephemeral_port(self.ip)?
        }
        else {
            port
        };

        let addr = SocketAddr::from((self.ip, port));
        if network.queues.contains_key(&addr) {
            bail!("address {:?} is already in use", addr);
        }
        network.queues.insert(addr, VecDeque::new());
        drop(network);

        let handle = SocketHandle(self.next_handle);
        self.next_handle += 1;
        self.sockets.insert(handle, addr);
        Ok(handle)
    }

    fn close_socket(&mut self, socket: SocketHandle) {
        if let Some(addr) = self.sockets.remove(&socket) {
            self.network.lock().queues.remove(&addr);
        }
        if self.accept_socket == Some(socket) {
            self.accept_socket = None;
        }
        if self.control_socket == Some(socket) {
            self.control_socket = None;
        }
    }

    fn check_new_connections(&mut self) -> Option<SocketHandle> {
        self.accept_socket
    }

    fn read(&mut self, socket: SocketHandle, buf: &mut [u8]) -> anyhow::Result<Option<(usize, SocketAddr)>> {
        let addr = self.bound_addr(socket)?;
        let mut network = self.network.lock();
        let Some(queue) = network.queues.get_mut(&addr) else {
            bail!("socket {:?} was closed", socket);
        };

        match queue.pop_front() {
            None => Ok(None),
            Some((packet, from)) => {
                // datagram semantics: the excess of an oversized packet is discarded
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(Some((len, from)))
            }
        }
    }

    fn write(&mut self, socket: SocketHandle, buf: &[u8], to: SocketAddr) -> anyhow::Result<WriteOutcome> {
        let from = self.bound_addr(socket)?;
        self.network.lock().deliver(from, to, buf);
        Ok(WriteOutcome::Written(buf.len()))
    }

    fn broadcast(&mut self, socket: SocketHandle, buf: &[u8]) -> anyhow::Result<WriteOutcome> {
        let from = self.bound_addr(socket)?;
        let mut network = self.network.lock();
        let host_port = network.host_port;
        let targets = network.queues.keys()
            .filter(|addr| addr.port() == host_port)
            .copied()
            .collect::<Vec<_>>();
        for to in targets {
            network.deliver(from, to, buf);
        }
        Ok(WriteOutcome::Written(buf.len()))
    }

    fn resolve_name(&self, name: &str) -> anyhow::Result<SocketAddr> {
        let network = self.network.lock();

        let name = name.trim();
        if name.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
            return Ok(complete_partial_ipv4(name, self.ip, network.host_port)?.into());
        }

        let (host, port) = split_host_port(name, network.host_port)?;
        match network.hosts.get(&host.to_ascii_lowercase()) {
            Some(&ip) => Ok(SocketAddr::from((ip, port))),
            None => bail!("unknown host {}", host),
        }
    }

    fn reverse_resolve(&self, addr: SocketAddr) -> String {
        let network = self.network.lock();
        let known = network.hosts.iter()
            .find(|(_, &ip)| IpAddr::V4(ip) == addr.ip());
        match known {
            Some((name, _)) => name.clone(),
            None => addr.to_string(),
        }
    }

    fn socket_addr(&self, socket: SocketHandle) -> anyhow::Result<SocketAddr> {
        self.bound_addr(socket)
    }

    fn default_mtu(&self) -> usize {
        self.network.lock().mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(driver: &mut LoopbackDriver, socket: SocketHandle) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut result = Vec::new();
        let mut buf = [0u8; 64];
        while let Some((len, from)) = driver.read(socket, &mut buf).unwrap() {
            result.push((buf[..len].to_vec(), from));
        }
        result
    }

    #[test]
    fn test_unicast() {
        let network = LoopbackNetwork::default();
        let mut a = network.add_host("alpha");
        let mut b = network.add_host("beta");

        let sa = a.open_socket(0).unwrap();
        let sb = b.open_socket(27000).unwrap();
        let addr_a = a.socket_addr(sa).unwrap();
        let addr_b = b.socket_addr(sb).unwrap();
        assert_eq!(addr_b, SocketAddr::from((b.ip(), 27000)));
        assert_ne!(a.ip(), b.ip());

        assert_eq!(a.write(sa, &[1, 2, 3], addr_b).unwrap(), WriteOutcome::Written(3));
        assert_eq!(read_all(&mut b, sb), vec![(vec![1, 2, 3], addr_a)]);
        assert!(read_all(&mut b, sb).is_empty());
    }

    #[test]
    fn test_port_in_use() {
        let network = LoopbackNetwork::default();
        let mut a = network.add_host("alpha");
        a.open_socket(27000).unwrap();
        assert!(a.open_socket(27000).is_err());
    }

    #[test]
    fn test_broadcast_reaches_listeners_only() {
        let network = LoopbackNetwork::default();
        let mut client = network.add_host("client");
        let mut server1 = network.add_host("server1");
        let mut server2 = network.add_host("server2");

        let control = client.init().unwrap();
        server1.init().unwrap();
        server1.listen(true).unwrap();
        let other = server2.init().unwrap();

        client.broadcast(control, &[9]).unwrap();

        let accept = server1.check_new_connections().unwrap();
        assert_eq!(read_all(&mut server1, accept).len(), 1);
        assert!(read_all(&mut server2, other).is_empty());
        assert!(server2.check_new_connections().is_none());
    }

    #[test]
    fn test_drop_next() {
        let network = LoopbackNetwork::default();
        let mut a = network.add_host("alpha");
        let sa = a.open_socket(0).unwrap();
        let to = a.socket_addr(sa).unwrap();

        network.drop_next(1);
        a.write(sa, &[1], to).unwrap();
        a.write(sa, &[2], to).unwrap();
        assert_eq!(read_all(&mut a, sa).into_iter().map(|(p, _)| p).collect::<Vec<_>>(), vec![vec![2]]);
    }

    #[test]
    fn test_total_loss() {
        let network = LoopbackNetwork::default();
        let mut a = network.add_host("alpha");
        let sa = a.open_socket(0).unwrap();
        let to = a.socket_addr(sa).unwrap();

        network.set_loss(1.0, 7);
        a.write(sa, &[1], to).unwrap();
        assert_eq!(network.num_pending(), 0);

        network.set_loss(0.0, 7);
        a.write(sa, &[1], to).unwrap();
        assert_eq!(network.num_pending(), 1);
    }

    #[test]
    fn test_resolve() {
        let network = LoopbackNetwork::default();
        let a = network.add_host("alpha");
        let b = network.add_host("Beta");

        assert_eq!(a.resolve_name("beta").unwrap(), SocketAddr::from((b.ip(), 26000)));
        assert_eq!(a.resolve_name("BETA:27001").unwrap(), SocketAddr::from((b.ip(), 27001)));
        assert_eq!(a.resolve_name("10.0.0.2").unwrap(), SocketAddr::from((b.ip(), 26000)));
        assert_eq!(a.resolve_name("2").unwrap(), SocketAddr::from((b.ip(), 26000)));
        assert!(a.resolve_name("gamma").is_err());

        assert_eq!(a.reverse_resolve(SocketAddr::from((b.ip(), 40000))), "beta");
        assert_eq!(a.reverse_resolve("10.9.9.9:5".parse().unwrap()), "10.9.9.9:5");
    }

    #[test]
    fn test_close_discards_pending() {
        let network = LoopbackNetwork::default();
        let mut a = network.add_host("alpha");
        let sa = a.open_socket(0).unwrap();
        let to = a.socket_addr(sa).unwrap();
        a.write(sa, &[1], to).unwrap();

        a.close_socket(sa);
        assert_eq!(network.num_pending(), 0);
        assert!(a.read(sa, &mut [0u8; 8]).is_err());
    }
}
