//! Fixtures shared by the unit tests of several modules.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use crate::config::NetConfig;
use crate::connect::ConnectStatus;
use crate::connection::{ConnectionId, Incoming};
use crate::driver::loopback::LoopbackNetwork;
use crate::driver::{compare_socket_addrs, MockDatagramDriver, WriteOutcome};
use crate::server_info::StaticServerInfo;
use crate::transport::Transport;

/// virtual time that passes per frame in [TransportPair]
pub const FRAME: Duration = Duration::from_millis(10);

pub fn peer_addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 9], 26000))
}

/// A mock driver that records all written packets, for verifying the exact bytes engines send.
pub fn recording_driver() -> (MockDatagramDriver, Arc<Mutex<Vec<Vec<u8>>>>) {
    let written = Arc::new(Mutex::new(Vec::new()));

    let mut driver = MockDatagramDriver::new();
    let w = written.clone();
    driver.expect_write()
        .returning(move |_, buf, _| {
            w.lock().unwrap().push(buf.to_vec());
            Ok(WriteOutcome::Written(buf.len()))
        });
    driver.expect_compare_addr()
        .returning(compare_socket_addrs);

    (driver, written)
}

/// A client and a server transport on a shared loopback network, with an established
///  connection between them. Time is virtual and advanced explicitly.
pub struct TransportPair {
    pub network: LoopbackNetwork,
    pub server: Transport,
    pub client: Transport,
    pub server_conn: ConnectionId,
    pub client_conn: ConnectionId,
    pub now: Instant,
}

/// The server is host "server" (10.0.0.1), the client is host "client" (10.0.0.2).
pub fn connected_pair(config: NetConfig) -> TransportPair {
    let now = Instant::now();
    let network = LoopbackNetwork::default();

    let mut server_config = config.clone();
    server_config.listen = true;
    let mut server = Transport::new(server_config, vec![Box::new(network.add_host("server"))], Box::new(StaticServerInfo::new("arena", "e1m1")), now).unwrap();
    let mut client = Transport::new(config, vec![Box::new(network.add_host("client"))], Box::new(StaticServerInfo::default()), now).unwrap();

    let mut connector = client.begin_connect("server", now).unwrap();
    let server_conn = server.check_new_connections(now).unwrap();
    let client_conn = match client.poll_connect(&mut connector, now) {
        ConnectStatus::Connected(id) => id,
        other => panic!("connect failed: {:?}", other),
    };
    client.drain_console();

    TransportPair { network, server, client, server_conn, client_conn, now }
}

impl TransportPair {
    /// One frame on both sides. Messages arriving at the client are discarded, the first
    ///  message arriving at the server is returned.
    pub fn step(&mut self) -> Option<Incoming> {
        self.client.poll_once(self.now);
        self.server.poll_once(self.now);
        while let Ok(Some(_)) = self.client.receive(self.client_conn, self.now) {}
        let received = self.server.receive(self.server_conn, self.now).unwrap();
        self.now += FRAME;
        received
    }

    pub fn run_until_server_receives(&mut self, limit: Duration) -> Option<Incoming> {
        let deadline = self.now + limit;
        while self.now < deadline {
            if let Some(incoming) = self.step() {
                return Some(incoming);
            }
        }
        None
    }

    pub fn pump(&mut self, duration: Duration) {
        self.pump_until(duration, |_| false);
    }

    pub fn pump_until(&mut self, limit: Duration, done: impl Fn(&TransportPair) -> bool) -> bool {
        let deadline = self.now + limit;
        while self.now < deadline {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }
}
