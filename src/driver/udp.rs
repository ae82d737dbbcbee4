use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};
use crate::driver::address::{complete_partial_ipv4, split_host_port};
use crate::driver::{DatagramDriver, SocketHandle, WriteOutcome};

pub struct UdpConfig {
    /// the well-known port servers listen on and discovery broadcasts go to
    pub host_port: u16,
    /// the local interface to bind sockets to, `0.0.0.0` for all interfaces
    pub bind_ip: Ipv4Addr,
    /// The address to announce in server info replies. If `None`, the bind address is used,
    ///  or the address of the interface used for outgoing traffic if bound to all interfaces.
    pub advertise_ip: Option<Ipv4Addr>,
    pub mtu: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        UdpConfig {
            host_port: 26000,
            bind_ip: Ipv4Addr::UNSPECIFIED,
            advertise_ip: None,
            mtu: 1024,
        }
    }
}

/// IPv4 UDP driver on non-blocking sockets.
pub struct UdpDriver {
    config: UdpConfig,
    local_ip: Ipv4Addr,
    sockets: FxHashMap<SocketHandle, UdpSocket>,
    next_handle: u32,
    control_socket: Option<SocketHandle>,
    accept_socket: Option<SocketHandle>,
}

impl UdpDriver {
    pub fn new(config: UdpConfig) -> UdpDriver {
        let local_ip = config.advertise_ip.unwrap_or(config.bind_ip);
        UdpDriver {
            config,
            local_ip,
            sockets: FxHashMap::default(),
            next_handle: 0,
            control_socket: None,
            accept_socket: None,
        }
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    /// Finds the address of the interface used for outgoing traffic. Connecting a UDP socket
    ///  does not send anything, it just makes the OS pick a route.
    fn detect_local_ip() -> Option<Ipv4Addr> {
        let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        probe.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
        match probe.local_addr().ok()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
            _ => None,
        }
    }

    fn socket(&self, socket: SocketHandle) -> anyhow::Result<&UdpSocket> {
        self.sockets.get(&socket)
            .ok_or_else(|| anyhow!("socket {:?} is not open", socket))
    }

    fn create_socket(&self, port: u16) -> anyhow::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        socket.bind(&SocketAddr::from((self.config.bind_ip, port)).into())?;
        Ok(socket.into())
    }
}

impl DatagramDriver for UdpDriver {
    fn name(&self) -> &str {
        "udp"
    }

    fn init(&mut self) -> anyhow::Result<SocketHandle> {
        if let Some(control) = self.control_socket {
            return Ok(control);
        }

        if self.local_ip.is_unspecified() {
            self.local_ip = Self::detect_local_ip()
                .unwrap_or_else(|| {
                    warn!("unable to determine the local address, falling back to loopback");
                    Ipv4Addr::LOCALHOST
                });
        }

        let control = self.open_socket(0)?;
        self.control_socket = Some(control);
        info!("UDP initialized on {}, host port {}", self.local_ip, self.config.host_port);
        Ok(control)
    }

    fn shutdown(&mut self) {
        self.sockets.clear();
        self.control_socket = None;
        self.accept_socket = None;
    }

    fn listen(&mut self, enable: bool) -> anyhow::Result<()> {
        if enable {
            if self.accept_socket.is_none() {
                self.accept_socket = Some(self.open_socket(self.config.host_port)?);
            }
        }
        else if let Some(accept) = self.accept_socket.take() {
            self.close_socket(accept);
        }
        Ok(())
    }

    fn open_socket(&mut self, port: u16) -> anyhow::Result<SocketHandle> {
        let socket = self.create_socket(port)?;
        let handle = SocketHandle(self.next_handle);
        self.next_handle += 1;
        self.sockets.insert(handle, socket);
        Ok(handle)
    }

    fn close_socket(&mut self, socket: SocketHandle) {
        self.sockets.remove(&socket);
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
        match self.socket(socket)?.recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            // ICMP port unreachable from an earlier send, reported on the next read on some platforms
            Err(e) if e.kind() == ErrorKind::ConnectionReset || e.kind() == ErrorKind::ConnectionRefused => {
                debug!("ignoring {} on UDP socket {:?}", e, socket);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, socket: SocketHandle, buf: &[u8], to: SocketAddr) -> anyhow::Result<WriteOutcome> {
        match self.socket(socket)?.send_to(buf, to) {
            Ok(len) => Ok(WriteOutcome::Written(len)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    fn broadcast(&mut self, socket: SocketHandle, buf: &[u8]) -> anyhow::Result<WriteOutcome> {
        let to = SocketAddr::from((Ipv4Addr::BROADCAST, self.config.host_port));
        self.write(socket, buf, to)
    }

    fn resolve_name(&self, name: &str) -> anyhow::Result<SocketAddr> {
        let name = name.trim();
        if name.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
            return Ok(complete_partial_ipv4(name, self.local_ip, self.config.host_port)?.into());
        }

        let (host, port) = split_host_port(name, self.config.host_port)?;
        let resolved = (host, port).to_socket_addrs()?
            .find(|addr| addr.is_ipv4());
        match resolved {
            Some(addr) => Ok(addr),
            None => bail!("{} has no IPv4 address", host),
        }
    }

    fn reverse_resolve(&self, addr: SocketAddr) -> String {
        // there is no portable reverse lookup in std, so the numeric form is all we offer
        addr.to_string()
    }

    fn socket_addr(&self, socket: SocketHandle) -> anyhow::Result<SocketAddr> {
        let addr = self.socket(socket)?.local_addr()?;
        if addr.ip().is_unspecified() || addr.ip().is_loopback() {
            Ok(SocketAddr::from((self.local_ip, addr.port())))
        }
        else {
            Ok(addr)
        }
    }

    fn default_mtu(&self) -> usize {
        self.config.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost_driver() -> UdpDriver {
        UdpDriver::new(UdpConfig {
            host_port: 0,
            bind_ip: Ipv4Addr::LOCALHOST,
            advertise_ip: None,
            mtu: 1024,
        })
    }

    #[test]
    fn test_send_and_receive() {
        let mut driver = localhost_driver();
        driver.init().unwrap();
        assert_eq!(driver.local_ip(), Ipv4Addr::LOCALHOST);

        let a = driver.open_socket(0).unwrap();
        let b = driver.open_socket(0).unwrap();
        let addr_a = driver.socket_addr(a).unwrap();
        let addr_b = driver.socket_addr(b).unwrap();

        let mut buf = [0u8; 16];
        assert!(driver.read(b, &mut buf).unwrap().is_none());

        assert_eq!(driver.write(a, &[1, 2, 3], addr_b).unwrap(), WriteOutcome::Written(3));

        let mut received = None;
        for _ in 0..1000 {
            if let Some(r) = driver.read(b, &mut buf).unwrap() {
                received = Some(r);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(received, Some((3, addr_a)));
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_resolve_numeric() {
        let driver = localhost_driver();
        assert_eq!(driver.resolve_name("127.0.0.5:27001").unwrap(), "127.0.0.5:27001".parse().unwrap());
        assert_eq!(driver.resolve_name("9").unwrap(), "127.0.0.9:0".parse().unwrap());
    }

    #[test]
    fn test_closed_socket() {
        let mut driver = localhost_driver();
        let s = driver.open_socket(0).unwrap();
        driver.close_socket(s);
        assert!(driver.read(s, &mut [0u8; 4]).is_err());
        assert!(driver.socket_addr(s).is_err());
    }
}
