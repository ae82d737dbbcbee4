//! Client side of the connect handshake as an explicit state machine. The application starts
//!  a connect through the transport and then polls the returned [Connector] once per frame
//!  until it reaches a terminal state:
//!
//! ```ascii
//! AwaitingDiscovery ──> Requesting { attempts_left, deadline } ──> Connected
//!                                    │    ^                  └──> Failed
//!                                    └────┘ no reply before the deadline: resend
//! ```
//!
//! A connection slot and a fresh socket are reserved when the first request goes out, and
//!  released again on failure or [crate::transport::Transport::abort_connect].

use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};
use crate::config::NetConfig;
use crate::connection::{ConnectionId, Endpoint};
use crate::connection_pool::ConnectionPool;
use crate::console::Console;
use crate::control_messages::ControlMessage;
use crate::driver::{AddrMatch, DatagramDriver, SocketHandle};
use crate::error::ConnectFailure;
use crate::packet_header::{read_length_and_flags, PacketFlags};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectStatus {
    Pending,
    Connected(ConnectionId),
    Failed(ConnectFailure),
}

#[derive(Clone, Copy, Debug)]
struct Request {
    connection: ConnectionId,
    driver: usize,
    socket: SocketHandle,
    server: SocketAddr,
}

#[derive(Debug)]
enum ConnectState {
    /// waiting for a discovery round to find the one server to connect to
    AwaitingDiscovery,
    Requesting {
        request: Request,
        attempts_left: u32,
        deadline: Instant,
    },
    Finished(Result<ConnectionId, ConnectFailure>),
}

#[derive(Debug)]
pub struct Connector {
    state: ConnectState,
}

impl Connector {
    pub(crate) fn awaiting_discovery() -> Connector {
        Connector {
            state: ConnectState::AwaitingDiscovery,
        }
    }

    pub(crate) fn failed(failure: ConnectFailure) -> Connector {
        Connector {
            state: ConnectState::Finished(Err(failure)),
        }
    }

    pub(crate) fn is_awaiting_discovery(&self) -> bool {
        matches!(self.state, ConnectState::AwaitingDiscovery)
    }

    /// the driver the request goes through, while requesting
    pub(crate) fn driver_index(&self) -> Option<usize> {
        match &self.state {
            ConnectState::Requesting { request, .. } => Some(request.driver),
            _ => None,
        }
    }

    pub fn status(&self) -> ConnectStatus {
        match &self.state {
            ConnectState::AwaitingDiscovery | ConnectState::Requesting { .. } => ConnectStatus::Pending,
            ConnectState::Finished(Ok(id)) => ConnectStatus::Connected(*id),
            ConnectState::Finished(Err(failure)) => ConnectStatus::Failed(failure.clone()),
        }
    }

    /// Reserves a connection and a socket on the given driver, and sends the first connect
    ///  request to `server`.
    pub(crate) fn start(
        pool: &mut ConnectionPool,
        driver_index: usize,
        driver: &mut dyn DatagramDriver,
        server: SocketAddr,
        config: &NetConfig,
        console: &mut Console,
        now: Instant,
    ) -> Result<Connector, ConnectFailure> {
        let socket = driver.open_socket(0)
            .map_err(|e| {
                warn!("unable to open a socket for connecting to {:?}: {}", server, e);
                ConnectFailure::NetworkError
            })?;

        let connection = match pool.acquire(now) {
            Ok(id) => id,
            Err(_) => {
                driver.close_socket(socket);
                return Err(ConnectFailure::NoCapacity);
            }
        };
        if let Some(conn) = pool.get_mut(connection) {
            conn.endpoint = Some(Endpoint {
                driver: driver_index,
                socket,
                peer: server,
            });
            conn.mtu = driver.default_mtu();
        }

        let request = Request { connection, driver: driver_index, socket, server };

        console.print("trying...");
        if let Err(e) = Self::send_request(&request, driver, config) {
            warn!("error sending connect request to {:?}: {}", server, e);
            Self::release(&request, pool, driver);
            return Err(ConnectFailure::NetworkError);
        }

        Ok(Connector {
            state: ConnectState::Requesting {
                request,
                attempts_left: config.connect_attempts.saturating_sub(1),
                deadline: now + config.connect_attempt_timeout,
            },
        })
    }

    fn send_request(request: &Request, driver: &mut dyn DatagramDriver, config: &NetConfig) -> anyhow::Result<()> {
        let msg = ControlMessage::ConnectRequest {
            tag: config.protocol_tag.clone(),
            protocol_version: config.protocol_version,
        };
        driver.write(request.socket, &msg.ser(), request.server)?;
        Ok(())
    }

    fn release(request: &Request, pool: &mut ConnectionPool, driver: &mut dyn DatagramDriver) {
        driver.close_socket(request.socket);
        if pool.release(request.connection).is_err() {
            debug!("connection {} was released already", request.connection);
        }
    }

    /// Starts requesting after discovery picked the server.
    pub(crate) fn resume_after_discovery(&mut self, started: Result<Connector, ConnectFailure>) {
        *self = match started {
            Ok(connector) => connector,
            Err(failure) => Connector::failed(failure),
        };
    }

    /// Processes replies and handles timeouts. `driver` must be the driver the request is
    ///  sent through, see [Connector::driver_index].
    pub(crate) fn poll(
        &mut self,
        pool: &mut ConnectionPool,
        driver: &mut dyn DatagramDriver,
        config: &NetConfig,
        console: &mut Console,
        buf: &mut [u8],
        now: Instant,
    ) -> ConnectStatus {
        let ConnectState::Requesting { request, attempts_left, deadline } = &mut self.state else {
            return self.status();
        };
        let request = *request;

        let outcome = match Self::read_reply(&request, driver, buf) {
            Err(e) => {
                warn!("error reading connect reply from {:?}: {}", request.server, e);
                Some(Err(ConnectFailure::NetworkError))
            }
            Ok(Some(reply)) => Some(Self::on_reply(&request, reply, pool, driver, console, now)),
            Ok(None) if now >= *deadline => {
                console.print("still trying...");
                if *attempts_left == 0 {
                    Some(Err(ConnectFailure::NoResponse))
                }
                else if let Err(e) = Self::send_request(&request, driver, config) {
                    warn!("error sending connect request to {:?}: {}", request.server, e);
                    Some(Err(ConnectFailure::NetworkError))
                }
                else {
                    *attempts_left -= 1;
                    *deadline = now + config.connect_attempt_timeout;
                    None
                }
            }
            Ok(None) => None,
        };

        if let Some(outcome) = outcome {
            if let Err(failure) = &outcome {
                info!("connecting to {:?} failed: {}", request.server, failure);
                console.print(failure.to_string());
                Self::release(&request, pool, driver);
            }
            self.state = ConnectState::Finished(outcome);
        }
        self.status()
    }

    /// Reads until there is a reply from the server, skipping anything that is not a control
    ///  packet from the server's address. The reply is `Err` if it is not a well-formed
    ///  message.
    fn read_reply(request: &Request, driver: &mut dyn DatagramDriver, buf: &mut [u8]) -> anyhow::Result<Option<anyhow::Result<ControlMessage>>> {
        while let Some((len, from)) = driver.read(request.socket, buf)? {
            if driver.compare_addr(from, request.server) != AddrMatch::Same {
                debug!("reply from {:?} while connecting to {:?} - ignoring", from, request.server);
                continue;
            }
            let packet = &buf[..len];

            let mut word = packet;
            match read_length_and_flags(&mut word, len) {
                Ok(flags) if flags == PacketFlags::CONTROL && len > size_of::<u32>() => {}
                _ => {
                    debug!("non-control packet from {:?} while connecting - ignoring", from);
                    continue;
                }
            }
            return Ok(Some(ControlMessage::deser(packet)));
        }
        Ok(None)
    }

    fn on_reply(
        request: &Request,
        reply: anyhow::Result<ControlMessage>,
        pool: &mut ConnectionPool,
        driver: &mut dyn DatagramDriver,
        console: &mut Console,
        now: Instant,
    ) -> Result<ConnectionId, ConnectFailure> {
        let port = match reply {
            Ok(ControlMessage::Accept { port }) => port,
            Ok(ControlMessage::Reject { reason }) => return Err(ConnectFailure::Rejected(reason.trim_end().to_string())),
            Ok(other) => {
                debug!("unexpected reply {:?} from {:?}", other.opcode(), request.server);
                return Err(ConnectFailure::BadResponse);
            }
            Err(e) => {
                debug!("malformed reply from {:?}: {}", request.server, e);
                return Err(ConnectFailure::BadResponse);
            }
        };

        let Ok(port) = u16::try_from(port) else {
            return Err(ConnectFailure::ConnectToGameFailed);
        };
        if port == 0 {
            return Err(ConnectFailure::ConnectToGameFailed);
        }

        let address = driver.reverse_resolve(request.server);
        let Some(conn) = pool.get_mut(request.connection) else {
            return Err(ConnectFailure::ConnectToGameFailed);
        };
        conn.endpoint = Some(Endpoint {
            driver: request.driver,
            socket: request.socket,
            peer: SocketAddr::new(request.server.ip(), port),
        });
        conn.address = address;
        conn.last_message_time = now;

        info!("connected to {:?} on port {} as {}", request.server, port, request.connection);
        console.print("Connection accepted");
        Ok(request.connection)
    }

    /// Gives up on a pending connect, releasing the reserved connection and socket.
    pub(crate) fn abort(self, pool: &mut ConnectionPool, driver: &mut dyn DatagramDriver) {
        if let ConnectState::Requesting { request, .. } = self.state {
            debug!("connect to {:?} aborted", request.server);
            Self::release(&request, pool, driver);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use rstest::rstest;
    use crate::driver::loopback::{LoopbackDriver, LoopbackNetwork};

    struct Fixture {
        config: NetConfig,
        pool: ConnectionPool,
        console: Console,
        client: LoopbackDriver,
        server: LoopbackDriver,
        server_socket: SocketHandle,
        buf: Vec<u8>,
        start: Instant,
    }

    impl Fixture {
        fn new() -> Fixture {
            let network = LoopbackNetwork::default();
            let client = network.add_host("client");
            let mut server = network.add_host("server");
            let server_socket = server.open_socket(26000).unwrap();
            let start = Instant::now();
            Fixture {
                config: NetConfig::default(),
                pool: ConnectionPool::new(2, start),
                console: Console::default(),
                client,
                server,
                server_socket,
                buf: vec![0; 2048],
                start,
            }
        }

        fn server_addr(&self) -> SocketAddr {
            self.server.socket_addr(self.server_socket).unwrap()
        }

        fn start(&mut self) -> Result<Connector, ConnectFailure> {
            let server = self.server_addr();
            Connector::start(&mut self.pool, 0, &mut self.client, server, &self.config, &mut self.console, self.start)
        }

        fn poll(&mut self, connector: &mut Connector, now: Instant) -> ConnectStatus {
            connector.poll(&mut self.pool, &mut self.client, &self.config, &mut self.console, &mut self.buf, now)
        }

        /// reads the requests that arrived at the server, returning the last sender
        fn requests(&mut self) -> (usize, Option<SocketAddr>) {
            let mut num = 0;
            let mut last_from = None;
            let mut buf = [0u8; 64];
            while let Some((len, from)) = self.server.read(self.server_socket, &mut buf).unwrap() {
                assert_eq!(
                    ControlMessage::deser(&buf[..len]).unwrap(),
                    ControlMessage::ConnectRequest { tag: "QUAKE".to_string(), protocol_version: 3 },
                );
                num += 1;
                last_from = Some(from);
            }
            (num, last_from)
        }

        fn reply(&mut self, msg: ControlMessage) {
            let (_, from) = self.requests();
            let to = from.unwrap();
            self.server.write(self.server_socket, &msg.ser(), to).unwrap();
        }
    }

    #[test]
    fn test_accepted() {
        let mut f = Fixture::new();
        let mut connector = f.start().unwrap();
        assert_eq!(f.pool.active_count(), 1);

        let now = f.start + Duration::from_millis(100);
        f.reply(ControlMessage::Accept { port: 40123 });
        let ConnectStatus::Connected(id) = f.poll(&mut connector, now) else {
            panic!("not connected");
        };

        let conn = f.pool.get(id).unwrap();
        assert_eq!(conn.endpoint.unwrap().peer, SocketAddr::new(f.server_addr().ip(), 40123));
        assert_eq!(conn.address, "server");
        assert_eq!(conn.last_message_time, now);
        assert_eq!(f.console.lines(), &["trying...", "Connection accepted"]);

        // terminal states are sticky
        assert_eq!(f.poll(&mut connector, now), ConnectStatus::Connected(id));
    }

    #[rstest]
    #[case::rejected(ControlMessage::Reject { reason: "Server is full.\n".to_string() }, ConnectFailure::Rejected("Server is full.".to_string()))]
    #[case::unexpected(ControlMessage::RuleInfoReply(None), ConnectFailure::BadResponse)]
    #[case::port_zero(ControlMessage::Accept { port: 0 }, ConnectFailure::ConnectToGameFailed)]
    #[case::port_out_of_range(ControlMessage::Accept { port: 70000 }, ConnectFailure::ConnectToGameFailed)]
    fn test_failed_reply(#[case] reply: ControlMessage, #[case] expected: ConnectFailure) {
        let mut f = Fixture::new();
        let mut connector = f.start().unwrap();

        f.reply(reply);
        let now = f.start;
        assert_eq!(f.poll(&mut connector, now), ConnectStatus::Failed(expected.clone()));
        assert_eq!(f.pool.active_count(), 0);
        assert_eq!(f.console.lines().last(), Some(&expected.to_string()));
    }

    #[test]
    fn test_no_response() {
        let mut f = Fixture::new();
        let mut connector = f.start().unwrap();
        let timeout = f.config.connect_attempt_timeout;
        let mut num_requests = f.requests().0;

        let mut now = f.start;
        for _ in 0..2 {
            assert_eq!(f.poll(&mut connector, now + timeout - Duration::from_millis(1)), ConnectStatus::Pending);
            now += timeout;
            assert_eq!(f.poll(&mut connector, now), ConnectStatus::Pending);
            num_requests += f.requests().0;
        }
        assert_eq!(f.poll(&mut connector, now + timeout), ConnectStatus::Failed(ConnectFailure::NoResponse));

        assert_eq!(num_requests, 3);
        assert_eq!(f.pool.active_count(), 0);
        assert_eq!(f.console.lines(), &["trying...", "still trying...", "still trying...", "still trying...", "No Response"]);
    }

    #[test]
    fn test_reply_from_other_address_is_ignored() {
        let mut f = Fixture::new();
        let mut connector = f.start().unwrap();
        let (_, from) = f.requests();

        let other = f.server.open_socket(0).unwrap();
        f.server.write(other, &ControlMessage::Accept { port: 40123 }.ser(), from.unwrap()).unwrap();
        let now = f.start;
        assert_eq!(f.poll(&mut connector, now), ConnectStatus::Pending);
    }

    #[test]
    fn test_no_capacity() {
        let mut f = Fixture::new();
        let now = f.start;
        f.pool.acquire(now).unwrap();
        f.pool.acquire(now).unwrap();

        assert_eq!(f.start().err(), Some(ConnectFailure::NoCapacity));
        assert_eq!(f.requests().0, 0);
    }

    #[test]
    fn test_abort() {
        let mut f = Fixture::new();
        let connector = f.start().unwrap();
        assert_eq!(connector.driver_index(), Some(0));

        connector.abort(&mut f.pool, &mut f.client);
        assert_eq!(f.pool.active_count(), 0);
    }
}
