use std::net::SocketAddr;
use std::time::Instant;
use anyhow::bail;
use tracing::{debug, info, warn};
use crate::config::{BanFilter, NetConfig};
use crate::connect::{ConnectStatus, Connector};
use crate::connection::{Connection, ConnectionId, Incoming};
use crate::connection_pool::ConnectionPool;
use crate::console::Console;
use crate::control_messages::PlayerInfo;
use crate::discovery::{resolve, Discovery, DiscoveryContext, PollTask};
use crate::driver::{DatagramDriver, DriverSlot};
use crate::error::{ConnectFailure, QueryError, ReceiveError, SendError};
use crate::handshake::AcceptListener;
use crate::host_cache::HostCache;
use crate::link::Link;
use crate::poll_scheduler::PollScheduler;
use crate::server_info::ServerInfoSource;
use crate::stats::NetStats;
use crate::unreliable::UnreliableStream;

/// large enough for any datagram a driver can deliver
const RECEIVE_BUFFER_SIZE: usize = 65536;

/// The transport's public surface: connections, the control channel and discovery on top of a
///  set of datagram drivers.
///
/// All processing happens inside calls from the application, there are no background threads.
///  The application is expected to call [Transport::poll_once] once per frame, to call
///  [Transport::receive] for each connection until it returns `Ok(None)`, and to call
///  [Transport::check_new_connections] while listening.
pub struct Transport {
    config: NetConfig,
    drivers: Vec<DriverSlot>,
    pool: ConnectionPool,
    host_cache: HostCache,
    scheduler: PollScheduler<PollTask>,
    discovery: Discovery,
    server_info: Box<dyn ServerInfoSource>,
    console: Console,
    stats: NetStats,
    listening: bool,
    buf: Vec<u8>,
}

impl Transport {
    /// Initializes the drivers, skipping those that fail. Fails only if the configuration is
    ///  invalid, or if a dedicated host ends up without any driver.
    pub fn new(config: NetConfig, drivers: Vec<Box<dyn DatagramDriver>>, server_info: Box<dyn ServerInfoSource>, now: Instant) -> anyhow::Result<Transport> {
        config.validate()?;

        let mut slots = Vec::with_capacity(drivers.len());
        for mut driver in drivers {
            let control_socket = match driver.init() {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("unable to initialize driver {}: {}", driver.name(), e);
                    continue;
                }
            };
            if let Err(e) = NetConfig::validate_mtu(driver.default_mtu()) {
                warn!("driver {} is unusable: {}", driver.name(), e);
                driver.shutdown();
                continue;
            }
            info!("initialized driver {}", driver.name());
            slots.push(DriverSlot { driver, control_socket });
        }

        if slots.is_empty() {
            if config.dedicated {
                bail!("no datagram driver could be initialized");
            }
            warn!("no datagram driver could be initialized, networking is unavailable");
        }

        let listen = config.listen;
        let mut transport = Transport {
            pool: ConnectionPool::new(config.max_connections, now),
            host_cache: HostCache::new(config.host_cache_size),
            config,
            drivers: slots,
            scheduler: PollScheduler::new(),
            discovery: Discovery::default(),
            server_info,
            console: Console::default(),
            stats: NetStats::default(),
            listening: false,
            buf: vec![0; RECEIVE_BUFFER_SIZE],
        };
        if listen {
            transport.listen(true);
        }
        Ok(transport)
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn num_drivers(&self) -> usize {
        self.drivers.len()
    }

    fn discovery_context(&mut self) -> (DiscoveryContext<'_>, &mut Discovery) {
        (DiscoveryContext {
            config: &self.config,
            drivers: &mut self.drivers,
            host_cache: &mut self.host_cache,
            scheduler: &mut self.scheduler,
            console: &mut self.console,
            buf: &mut self.buf,
        }, &mut self.discovery)
    }

    /// Runs scheduled discovery and query steps that are due, and sends pending reliable
    ///  fragments / retransmissions for all connections.
    pub fn poll_once(&mut self, now: Instant) {
        for task in self.scheduler.take_due(now) {
            let (mut ctx, discovery) = self.discovery_context();
            discovery.run_task(&mut ctx, task, now);
        }

        for id in self.pool.active_ids() {
            let Some(conn) = self.pool.get_mut(id) else { continue };
            let Some(endpoint) = conn.endpoint else { continue };
            let Some(slot) = self.drivers.get_mut(endpoint.driver) else { continue };

            let mut link = Link::new(slot.driver.as_mut(), endpoint.socket, endpoint.peer);
            let mtu = conn.mtu;
            if let Err(e) = conn.sender.service(&mut link, mtu, self.config.resend_interval, now, &mut self.stats) {
                warn!("error sending to {:?} on connection {}, closing: {}", endpoint.peer, id, e);
                self.close(id);
            }
        }
    }

    /// Opens or closes the accept socket on every driver.
    pub fn listen(&mut self, enable: bool) {
        for slot in &mut self.drivers {
            if let Err(e) = slot.driver.listen(enable) {
                warn!("driver {} failed to {} listening: {}", slot.driver.name(), if enable { "start" } else { "stop" }, e);
            }
        }
        self.listening = enable;
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Limits the number of accepted connections, bounded by `max_connections`. Existing
    ///  connections are never closed because of this.
    pub fn set_max_connections(&mut self, max_connections: usize) {
        self.pool.set_max_active(max_connections);
    }

    pub fn active_connection_count(&self) -> usize {
        self.pool.active_count()
    }

    /// Processes pending control packets on the accept sockets, returning the next newly
    ///  accepted connection, if any. Server info, player info and rule queries are answered
    ///  along the way.
    pub fn check_new_connections(&mut self, now: Instant) -> Option<ConnectionId> {
        if !self.listening {
            return None;
        }

        for (driver_index, slot) in self.drivers.iter_mut().enumerate() {
            let Some(accept_socket) = slot.driver.check_new_connections() else { continue };

            let mut listener = AcceptListener {
                config: &self.config,
                pool: &mut self.pool,
                server_info: self.server_info.as_ref(),
                driver_index,
                driver: slot.driver.as_mut(),
                accept_socket,
                buf: &mut self.buf,
            };
            match listener.accept_pending(now) {
                Ok(Some(id)) => return Some(id),
                Ok(None) => {}
                Err(e) => warn!("error processing control packets on driver {}: {}", slot.driver.name(), e),
            }
        }
        None
    }

    /// Starts connecting to `host`. An empty host means 'the one server on the LAN': a
    ///  discovery round is started, and the connect continues once it is finished. Otherwise,
    ///  `host` is either the name of a host cache entry or something a driver can resolve.
    ///
    /// The returned [Connector] must be driven by [Transport::poll_connect] until it reaches a
    ///  terminal state. Discovery progresses only through [Transport::poll_once].
    pub fn begin_connect(&mut self, host: &str, now: Instant) -> Result<Connector, ConnectFailure> {
        let host = host.trim();
        if host.is_empty() {
            let (mut ctx, discovery) = self.discovery_context();
            if !discovery.is_in_progress() {
                discovery.start(&mut ctx, true, false, now);
            }
            return Ok(Connector::awaiting_discovery());
        }

        let host = match self.host_cache.find_by_name(host) {
            Some(entry) => entry.canonical_name.clone(),
            None => host.to_string(),
        };
        self.start_connector(&host, now)
    }

    fn start_connector(&mut self, host: &str, now: Instant) -> Result<Connector, ConnectFailure> {
        let (driver_index, server) = resolve(&self.drivers, host)
            .map_err(|_| ConnectFailure::Unresolvable(host.to_string()))?;
        debug!("connecting to {} at {:?} through driver {}", host, server, self.drivers[driver_index].driver.name());

        Connector::start(
            &mut self.pool,
            driver_index,
            self.drivers[driver_index].driver.as_mut(),
            server,
            &self.config,
            &mut self.console,
            now,
        )
    }

    pub fn poll_connect(&mut self, connector: &mut Connector, now: Instant) -> ConnectStatus {
        if connector.is_awaiting_discovery() {
            if self.discovery.is_in_progress() {
                return ConnectStatus::Pending;
            }

            let started = match self.host_cache.entries() {
                [entry] => {
                    let (name, canonical_name) = (entry.name.clone(), entry.canonical_name.clone());
                    self.console.print("Connecting to...");
                    self.console.print(format!("{} @ {}", name, canonical_name));
                    self.start_connector(&canonical_name, now)
                }
                entries => Err(ConnectFailure::NoUniqueServer { found: entries.len() }),
            };
            if let Err(failure) = &started {
                info!("connecting after discovery failed: {}", failure);
            }
            connector.resume_after_discovery(started);
        }

        let Some(driver_index) = connector.driver_index() else {
            return connector.status();
        };
        let Some(slot) = self.drivers.get_mut(driver_index) else {
            return connector.status();
        };
        connector.poll(&mut self.pool, slot.driver.as_mut(), &self.config, &mut self.console, &mut self.buf, now)
    }

    /// Gives up on a connect that is still pending.
    pub fn abort_connect(&mut self, connector: Connector) {
        if let Some(slot) = connector.driver_index().and_then(|i| self.drivers.get_mut(i)) {
            connector.abort(&mut self.pool, slot.driver.as_mut());
        }
    }

    /// Queues a message for reliable delivery and sends its first fragment. Only one reliable
    ///  message can be in flight per connection, see [Transport::can_send].
    pub fn send_reliable(&mut self, id: ConnectionId, message: &[u8], now: Instant) -> Result<(), SendError> {
        let Some(conn) = self.pool.get_mut(id) else {
            return Err(SendError::ConnectionDead);
        };
        let Some(endpoint) = conn.endpoint else {
            return Err(SendError::ConnectionDead);
        };
        let Some(slot) = self.drivers.get_mut(endpoint.driver) else {
            return Err(SendError::ConnectionDead);
        };

        conn.sender.enqueue(message, self.config.max_message_size, &mut self.stats)?;

        let mut link = Link::new(slot.driver.as_mut(), endpoint.socket, endpoint.peer);
        let mtu = conn.mtu;
        if let Err(e) = conn.sender.service(&mut link, mtu, self.config.resend_interval, now, &mut self.stats) {
            warn!("error sending to {:?} on connection {}, closing: {}", endpoint.peer, id, e);
            self.close(id);
            return Err(SendError::ConnectionDead);
        }
        Ok(())
    }

    /// Sends a single datagram that may be lost, duplicated or arrive out of order.
    pub fn send_unreliable(&mut self, id: ConnectionId, payload: &[u8]) -> Result<(), SendError> {
        let Some(conn) = self.pool.get_mut(id) else {
            return Err(SendError::ConnectionDead);
        };
        let Some(endpoint) = conn.endpoint else {
            return Err(SendError::ConnectionDead);
        };
        let Some(slot) = self.drivers.get_mut(endpoint.driver) else {
            return Err(SendError::ConnectionDead);
        };

        UnreliableStream::check_payload(payload, conn.mtu)?;

        let mut link = Link::new(slot.driver.as_mut(), endpoint.socket, endpoint.peer);
        if let Err(e) = conn.unreliable.send(payload, &mut link, &mut self.stats) {
            warn!("error sending to {:?} on connection {}, closing: {}", endpoint.peer, id, e);
            self.close(id);
            return Err(SendError::ConnectionDead);
        }
        Ok(())
    }

    /// Returns the next complete message from the peer, or `Ok(None)` if there is none right
    ///  now. This is also where retransmissions happen, and where an idle connection is found
    ///  to be timed out: it is closed, and this and all later calls return `ConnectionDead`.
    pub fn receive(&mut self, id: ConnectionId, now: Instant) -> Result<Option<Incoming>, ReceiveError> {
        let Some(conn) = self.pool.get_mut(id) else {
            return Err(ReceiveError::ConnectionDead);
        };
        let Some(endpoint) = conn.endpoint else {
            return Err(ReceiveError::ConnectionDead);
        };
        let Some(slot) = self.drivers.get_mut(endpoint.driver) else {
            return Err(ReceiveError::ConnectionDead);
        };

        let mut link = Link::new(slot.driver.as_mut(), endpoint.socket, endpoint.peer);
        let result = Self::receive_on(conn, &mut link, &self.config, &mut self.buf, &mut self.stats, now);
        let timed_out = conn.is_timed_out(now, self.config.message_timeout);

        match result {
            Ok(Some(incoming)) => Ok(Some(incoming)),
            Ok(None) if timed_out => {
                info!("connection {} to {:?} timed out", id, endpoint.peer);
                self.close(id);
                Err(ReceiveError::ConnectionDead)
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!("I/O error on connection {} to {:?}, closing: {}", id, endpoint.peer, e);
                self.close(id);
                Err(ReceiveError::ConnectionDead)
            }
        }
    }

    fn receive_on(conn: &mut Connection, link: &mut Link, config: &NetConfig, buf: &mut [u8], stats: &mut NetStats, now: Instant) -> anyhow::Result<Option<Incoming>> {
        let mtu = conn.mtu;
        conn.sender.service(link, mtu, config.resend_interval, now, stats)?;

        let mut incoming = None;
        while let Some((len, from)) = link.driver.read(link.socket, buf)? {
            if let Some(msg) = conn.on_packet(&buf[..len], from, link, config.max_message_size, now, stats)? {
                incoming = Some(msg);
                break;
            }
        }

        // an ACK that arrived above may have armed the next fragment
        conn.sender.service(link, mtu, config.resend_interval, now, stats)?;
        Ok(incoming)
    }

    /// true if a reliable message can be sent right now, i.e. the previous one was fully
    ///  acknowledged
    pub fn can_send(&self, id: ConnectionId) -> bool {
        self.pool.get(id)
            .map(|conn| conn.sender.can_send())
            .unwrap_or(false)
    }

    /// Closes a connection locally. Nothing is sent to the peer, which finds out through its
    ///  own timeout.
    pub fn close(&mut self, id: ConnectionId) {
        let conn = match self.pool.release(id) {
            Ok(conn) => conn,
            Err(_) => {
                debug!("connection {} was closed already", id);
                return;
            }
        };
        if let Some(endpoint) = conn.endpoint {
            if let Some(slot) = self.drivers.get_mut(endpoint.driver) {
                slot.driver.close_socket(endpoint.socket);
            }
        }
        info!("closed connection {} to {}", id, conn.address);
    }

    pub fn connection_address(&self, id: ConnectionId) -> Option<&str> {
        self.pool.get(id)
            .map(|conn| conn.address.as_str())
    }

    pub fn connection_peer(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.pool.get(id)
            .and_then(|conn| conn.endpoint)
            .map(|endpoint| endpoint.peer)
    }

    /// Per-connection diagnostics for the status display.
    pub fn connection_report(&self, id: ConnectionId) -> Option<Vec<String>> {
        let conn = self.pool.get(id)?;
        Some(vec![
            format!("{} ({})", conn.address, id),
            format!("canSend = {}", conn.sender.can_send()),
            format!("sendSeq = {}", conn.sender.send_sequence()),
            format!("recvSeq = {}", conn.receiver.receive_sequence()),
        ])
    }

    pub fn stats(&self) -> &NetStats {
        &self.stats
    }

    /// Takes the lines of user facing text that accumulated since the last call.
    pub fn drain_console(&mut self) -> Vec<String> {
        self.console.drain()
    }

    pub fn host_cache(&self) -> &HostCache {
        &self.host_cache
    }

    pub fn start_discovery(&mut self, broadcast: bool, silent: bool, now: Instant) -> bool {
        let (mut ctx, discovery) = self.discovery_context();
        discovery.start(&mut ctx, broadcast, silent, now)
    }

    pub fn is_discovery_in_progress(&self) -> bool {
        self.discovery.is_in_progress()
    }

    /// Sends a server info request to a single host. Run a discovery round without broadcast
    ///  to collect the reply.
    pub fn query_server(&mut self, host: &str) -> Result<(), QueryError> {
        let (mut ctx, discovery) = self.discovery_context();
        discovery.query_server(&mut ctx, host)
    }

    pub fn query_players(&mut self, host: &str, now: Instant) -> Result<(), QueryError> {
        let (mut ctx, discovery) = self.discovery_context();
        discovery.query_players(&mut ctx, host, now)
    }

    pub fn query_rules(&mut self, host: &str, now: Instant) -> Result<(), QueryError> {
        let (mut ctx, discovery) = self.discovery_context();
        discovery.query_rules(&mut ctx, host, now)
    }

    pub fn is_query_in_progress(&self) -> bool {
        self.discovery.is_player_query_in_progress() || self.discovery.is_rule_query_in_progress()
    }

    pub fn players(&self) -> &[PlayerInfo] {
        self.discovery.players()
    }

    pub fn rules(&self) -> &[(String, String)] {
        self.discovery.rules()
    }

    pub fn set_ban(&mut self, ban: Option<BanFilter>) {
        match &ban {
            Some(filter) => info!("{}", filter),
            None => info!("banning switched off"),
        }
        self.config.ban = ban;
    }

    pub fn ban_filter(&self) -> Option<BanFilter> {
        self.config.ban
    }

    /// The ban console command: without arguments it prints the current setting, otherwise the
    ///  arguments are parsed by [BanFilter::parse].
    pub fn ban(&mut self, args: &[&str]) -> anyhow::Result<()> {
        if args.is_empty() {
            let line = match &self.config.ban {
                Some(filter) => filter.to_string(),
                None => "Banning not active".to_string(),
            };
            self.console.print(line);
            return Ok(());
        }

        let ban = BanFilter::parse(args)?;
        self.set_ban(ban);
        Ok(())
    }

    /// Closes all connections, ends discovery and queries, and shuts down all drivers.
    pub fn shutdown(&mut self) {
        for id in self.pool.active_ids() {
            self.close(id);
        }

        let (mut ctx, discovery) = self.discovery_context();
        discovery.shutdown(&mut ctx);

        for slot in &mut self.drivers {
            slot.driver.shutdown();
            info!("shut down driver {}", slot.driver.name());
        }
        self.drivers.clear();
        self.listening = false;
    }
}
