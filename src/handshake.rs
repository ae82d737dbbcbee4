//! Server side of the control channel: everything that arrives on a driver's accept socket.
//!  Queries are answered right away without touching the connection pool, and connect
//!  requests pass a series of checks before a connection is allocated:
//!
//! 1. protocol tag (silently dropped on mismatch) and protocol version
//! 2. the ban filter
//! 3. existing connections from the same host: a retransmitted request for a connection that
//!    was just accepted gets the original reply again; otherwise the old connection is stale
//!    (the client restarted) and is closed, and the request is dropped so the client retries
//!    against a clean slate
//! 4. pool capacity
//!
//! An accepted connection gets its own freshly opened socket. Its port goes back to the client
//!  in the ACCEPT reply, which is sent from the accept socket.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tracing::{debug, info, warn};
use crate::config::NetConfig;
use crate::connection::{ConnectionId, Endpoint};
use crate::connection_pool::ConnectionPool;
use crate::control_messages::{ControlMessage, PlayerInfo, ServerInfo};
use crate::driver::{AddrMatch, DatagramDriver, SocketHandle};
use crate::server_info::{nth_active_client, ServerInfoSource};

pub const REJECT_INCOMPATIBLE_VERSION: &str = "Incompatible version.\n";
pub const REJECT_BANNED: &str = "You have been banned.\n";
pub const REJECT_SERVER_FULL: &str = "Server is full.\n";

pub struct AcceptListener<'a> {
    pub config: &'a NetConfig,
    pub pool: &'a mut ConnectionPool,
    pub server_info: &'a dyn ServerInfoSource,
    pub driver_index: usize,
    pub driver: &'a mut dyn DatagramDriver,
    pub accept_socket: SocketHandle,
    pub buf: &'a mut [u8],
}

impl AcceptListener<'_> {
    /// Processes pending packets on the accept socket until one of them results in a new
    ///  connection, or there are no more packets.
    pub fn accept_pending(&mut self, now: Instant) -> anyhow::Result<Option<ConnectionId>> {
        while let Some((len, from)) = self.driver.read(self.accept_socket, self.buf)? {
            let packet = self.buf[..len].to_vec();
            if let Some(id) = self.on_control_packet(&packet, from, now)? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    pub fn on_control_packet(&mut self, packet: &[u8], from: SocketAddr, now: Instant) -> anyhow::Result<Option<ConnectionId>> {
        let msg = match ControlMessage::deser(packet) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping packet from {:?} on accept socket: {}", from, e);
                return Ok(None);
            }
        };

        match msg {
            ControlMessage::ServerInfoRequest { tag, .. } => {
                if tag == self.config.protocol_tag {
                    self.on_server_info_request(from)?;
                }
                else {
                    debug!("server info request from {:?} with unknown tag {:?}", from, tag);
                }
                Ok(None)
            }
            ControlMessage::PlayerInfoRequest { index } => {
                self.on_player_info_request(index, from)?;
                Ok(None)
            }
            ControlMessage::RuleInfoRequest { previous } => {
                let rule = self.server_info.next_rule(&previous);
                self.reply(&ControlMessage::RuleInfoReply(rule), from)?;
                Ok(None)
            }
            ControlMessage::ConnectRequest { tag, protocol_version } => {
                self.on_connect_request(&tag, protocol_version, from, now)
            }
            other => {
                debug!("unexpected {:?} from {:?} on accept socket", other.opcode(), from);
                Ok(None)
            }
        }
    }

    fn reply(&mut self, msg: &ControlMessage, to: SocketAddr) -> anyhow::Result<()> {
        self.driver.write(self.accept_socket, &msg.ser(), to)?;
        Ok(())
    }

    fn on_server_info_request(&mut self, from: SocketAddr) -> anyhow::Result<()> {
        let own_addr = self.driver.socket_addr(self.accept_socket)?;
        let info = ServerInfo {
            address: self.driver.addr_to_string(own_addr),
            name: self.server_info.server_name(),
            map: self.server_info.map_name(),
            users: self.pool.active_count().min(u8::MAX as usize) as u8,
            max_users: self.pool.max_active().min(u8::MAX as usize) as u8,
            protocol_version: self.config.protocol_version,
        };
        self.reply(&ControlMessage::ServerInfoReply(info), from)
    }

    fn on_player_info_request(&mut self, index: u8, from: SocketAddr) -> anyhow::Result<()> {
        let slots = self.server_info.client_slots();
        let Some(client) = nth_active_client(&slots, index as usize) else {
            debug!("player info request from {:?} for player {} who does not exist", from, index);
            return Ok(());
        };

        let info = PlayerInfo {
            index,
            name: client.name.clone(),
            colors: client.colors,
            frags: client.frags,
            connect_secs: client.connected_for.as_secs().min(i32::MAX as u64) as i32,
            address: client.address.clone(),
        };
        self.reply(&ControlMessage::PlayerInfoReply(info), from)
    }

    fn on_connect_request(&mut self, tag: &str, protocol_version: u8, from: SocketAddr, now: Instant) -> anyhow::Result<Option<ConnectionId>> {
        if tag != self.config.protocol_tag {
            debug!("connect request from {:?} with unknown tag {:?}", from, tag);
            return Ok(None);
        }

        if protocol_version != self.config.protocol_version {
            debug!("connect request from {:?} with protocol version {}", from, protocol_version);
            self.reply(&ControlMessage::Reject { reason: REJECT_INCOMPATIBLE_VERSION.to_string() }, from)?;
            return Ok(None);
        }

        if let (Some(ban), IpAddr::V4(ip)) = (&self.config.ban, from.ip()) {
            if ban.matches(ip) {
                info!("rejecting connect request from banned address {:?}", from);
                self.reply(&ControlMessage::Reject { reason: REJECT_BANNED.to_string() }, from)?;
                return Ok(None);
            }
        }

        if self.check_existing_connections(from, now)? {
            return Ok(None);
        }

        let id = match self.pool.acquire(now) {
            Ok(id) => id,
            Err(_) => {
                info!("rejecting connect request from {:?}: server is full", from);
                self.reply(&ControlMessage::Reject { reason: REJECT_SERVER_FULL.to_string() }, from)?;
                return Ok(None);
            }
        };

        let socket = match self.driver.open_socket(0) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("unable to open a socket for a new connection from {:?}: {}", from, e);
                self.pool.release(id)?;
                return Ok(None);
            }
        };
        let port = match self.driver.socket_addr(socket) {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!("unable to determine the address of a new socket: {}", e);
                self.driver.close_socket(socket);
                self.pool.release(id)?;
                return Ok(None);
            }
        };

        let address = self.driver.addr_to_string(from);
        let mtu = self.driver.default_mtu();
        if let Some(conn) = self.pool.get_mut(id) {
            conn.endpoint = Some(Endpoint {
                driver: self.driver_index,
                socket,
                peer: from,
            });
            conn.address = address;
            conn.mtu = mtu;
            conn.last_message_time = now;
        }

        info!("accepted connection {} from {:?} on port {}", id, from, port);
        self.reply(&ControlMessage::Accept { port: port as i32 }, from)?;
        Ok(Some(id))
    }

    /// Returns true if the request was handled because of an existing connection from the
    ///  same host.
    fn check_existing_connections(&mut self, from: SocketAddr, now: Instant) -> anyhow::Result<bool> {
        for id in self.pool.active_ids() {
            let Some(conn) = self.pool.get(id) else { continue };
            let Some(endpoint) = conn.endpoint else { continue };
            if endpoint.driver != self.driver_index {
                continue;
            }

            let addr_match = self.driver.compare_addr(from, endpoint.peer);
            if addr_match == AddrMatch::Different {
                continue;
            }

            if addr_match == AddrMatch::Same && now.saturating_duration_since(conn.connect_time) < self.config.duplicate_connect_window {
                debug!("duplicate connect request from {:?}, repeating the reply", from);
                let port = self.driver.socket_addr(endpoint.socket)?.port();
                self.reply(&ControlMessage::Accept { port: port as i32 }, from)?;
                return Ok(true);
            }

            info!("connect request from {:?} while connection {} from that host exists - closing the old connection", from, id);
            self.driver.close_socket(endpoint.socket);
            self.pool.release(id)?;
            return Ok(true);
        }
        Ok(false)
    }
}
