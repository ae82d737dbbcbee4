//! LAN discovery and the remote diagnostic queries, all driven by the poll scheduler.
//!
//! A discovery round ('server list') broadcasts server info requests on every driver and
//!  collects the replies into the host cache:
//!
//! ```ascii
//! t=0      clear host cache, broadcast
//! t=0.1    poll for replies, every 0.1s
//! t=0.75   broadcast again (if still inside the resend window)
//! t=1.5    last poll, print the trailer
//! ```
//!
//! The player query sends one request per possible player slot up front and then collects
//!  replies for a fixed number of polls. The rule query pages through the server's rules
//!  one request per reply until the server signals the end of the list.

use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use crate::config::NetConfig;
use crate::console::Console;
use crate::control_messages::{ControlMessage, PlayerInfo};
use crate::driver::{DatagramDriver, DriverSlot, SocketHandle};
use crate::error::QueryError;
use crate::host_cache::{HostCache, HostCacheEntry};
use crate::poll_scheduler::PollScheduler;

/// number of player info requests sent if the server's capacity is unknown
pub const MAX_SCOREBOARD: u8 = 16;

pub const PLAYER_QUERY_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const PLAYER_QUERY_NUM_POLLS: u32 = 20;
pub const RULE_QUERY_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const RULE_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PollTask {
    DiscoverySend,
    DiscoveryPoll,
    PlayerQueryPoll,
    RuleQueryPoll,
}

struct DiscoveryRound {
    broadcast: bool,
    silent: bool,
    started: Instant,
    num_printed: usize,
}

struct QuerySocket {
    driver: usize,
    socket: SocketHandle,
    target: SocketAddr,
}

struct PlayerQuery {
    query: QuerySocket,
    polls_left: u32,
}

struct RuleQuery {
    query: QuerySocket,
    last_reply: Instant,
}

/// The parts of the transport that discovery and queries work on.
pub struct DiscoveryContext<'a> {
    pub config: &'a NetConfig,
    pub drivers: &'a mut [DriverSlot],
    pub host_cache: &'a mut HostCache,
    pub scheduler: &'a mut PollScheduler<PollTask>,
    pub console: &'a mut Console,
    pub buf: &'a mut [u8],
}

#[derive(Default)]
pub struct Discovery {
    round: Option<DiscoveryRound>,
    player_query: Option<PlayerQuery>,
    rule_query: Option<RuleQuery>,
    players: Vec<PlayerInfo>,
    rules: Vec<(String, String)>,
}

impl Discovery {
    pub fn is_in_progress(&self) -> bool {
        self.round.is_some()
    }

    pub fn is_player_query_in_progress(&self) -> bool {
        self.player_query.is_some()
    }

    pub fn is_rule_query_in_progress(&self) -> bool {
        self.rule_query.is_some()
    }

    /// results of the most recent player query
    pub fn players(&self) -> &[PlayerInfo] {
        &self.players
    }

    /// results of the most recent rule query
    pub fn rules(&self) -> &[(String, String)] {
        &self.rules
    }

    /// Starts a discovery round, returning false if one is in progress already. With
    ///  `broadcast == false`, no requests are sent and the round only collects replies to
    ///  earlier unicast queries.
    pub fn start(&mut self, ctx: &mut DiscoveryContext, broadcast: bool, silent: bool, now: Instant) -> bool {
        if self.round.is_some() {
            debug!("discovery is already in progress");
            return false;
        }

        if !silent {
            ctx.console.print("Looking for servers...");
            ctx.console.print(format!("{:<15} {:<15} {}", "Server", "Map", "Users"));
            ctx.console.print("--------------- --------------- -----");
        }

        ctx.host_cache.clear();
        self.round = Some(DiscoveryRound {
            broadcast,
            silent,
            started: now,
            num_printed: 0,
        });

        if broadcast {
            ctx.scheduler.schedule(PollTask::DiscoverySend, now);
        }
        ctx.scheduler.schedule(PollTask::DiscoveryPoll, now + ctx.config.discovery.poll_interval);
        true
    }

    pub fn run_task(&mut self, ctx: &mut DiscoveryContext, task: PollTask, now: Instant) {
        match task {
            PollTask::DiscoverySend => self.on_discovery_send(ctx, now),
            PollTask::DiscoveryPoll => self.on_discovery_poll(ctx, now),
            PollTask::PlayerQueryPoll => self.on_player_query_poll(ctx, now),
            PollTask::RuleQueryPoll => self.on_rule_query_poll(ctx, now),
        }
    }

    fn on_discovery_send(&mut self, ctx: &mut DiscoveryContext, now: Instant) {
        let Some(round) = &self.round else { return };
        if !round.broadcast {
            return;
        }

        let request = ControlMessage::ServerInfoRequest {
            tag: ctx.config.protocol_tag.clone(),
            protocol_version: ctx.config.protocol_version,
        }.ser();
        for slot in ctx.drivers.iter_mut() {
            if let Err(e) = slot.driver.broadcast(slot.control_socket, &request) {
                warn!("error broadcasting server info request on {}: {}", slot.driver.name(), e);
            }
        }

        if now.saturating_duration_since(round.started) < ctx.config.discovery.resend_window {
            ctx.scheduler.schedule(PollTask::DiscoverySend, now + ctx.config.discovery.resend_delay);
        }
    }

    fn on_discovery_poll(&mut self, ctx: &mut DiscoveryContext, now: Instant) {
        let Some(round) = &mut self.round else { return };

        for (driver_index, slot) in ctx.drivers.iter_mut().enumerate() {
            if let Err(e) = collect_server_info(driver_index, slot, ctx.host_cache, ctx.config, ctx.buf) {
                warn!("error collecting server info replies on {}: {}", slot.driver.name(), e);
            }
        }

        if !round.silent {
            for entry in &ctx.host_cache.entries()[round.num_printed..] {
                ctx.console.print(server_list_line(entry));
            }
        }
        round.num_printed = ctx.host_cache.len();

        if now.saturating_duration_since(round.started) < ctx.config.discovery.duration {
            ctx.scheduler.schedule(PollTask::DiscoveryPoll, now + ctx.config.discovery.poll_interval);
            return;
        }

        if !round.silent {
            if ctx.host_cache.is_empty() {
                ctx.console.print("No servers found.");
            }
            else {
                ctx.console.print("== end list ==");
            }
        }
        info!("discovery finished, found {} server(s)", ctx.host_cache.len());
        ctx.scheduler.cancel(&PollTask::DiscoverySend);
        self.round = None;
    }

    /// Sends a server info request to a single host. The reply is picked up by a discovery
    ///  round, typically one started with `broadcast == false`.
    pub fn query_server(&mut self, ctx: &mut DiscoveryContext, host: &str) -> Result<(), QueryError> {
        let (driver_index, target) = resolve(ctx.drivers, host)?;
        let slot = &mut ctx.drivers[driver_index];

        let request = ControlMessage::ServerInfoRequest {
            tag: ctx.config.protocol_tag.clone(),
            protocol_version: ctx.config.protocol_version,
        };
        slot.driver.write(slot.control_socket, &request.ser(), target)
            .map_err(|e| {
                warn!("error sending server info request to {:?}: {}", target, e);
                QueryError::Socket
            })?;
        Ok(())
    }

    /// Asks a server for information on all its players. The replies are printed to the console
    ///  and collected in [Discovery::players].
    pub fn query_players(&mut self, ctx: &mut DiscoveryContext, host: &str, now: Instant) -> Result<(), QueryError> {
        if self.player_query.is_some() {
            return Err(QueryError::InProgress);
        }

        let (host, max_players) = match ctx.host_cache.find_by_name(host) {
            Some(entry) => (entry.canonical_name.clone(), entry.max_users),
            None => (host.to_string(), MAX_SCOREBOARD),
        };
        let query = open_query_socket(ctx.drivers, &host)?;

        let driver = ctx.drivers[query.driver].driver.as_mut();
        for index in 0..max_players {
            let request = ControlMessage::PlayerInfoRequest { index };
            if let Err(e) = driver.write(query.socket, &request.ser(), query.target) {
                warn!("error sending player info request to {:?}: {}", query.target, e);
            }
        }

        self.players.clear();
        self.player_query = Some(PlayerQuery {
            query,
            polls_left: PLAYER_QUERY_NUM_POLLS,
        });
        ctx.scheduler.schedule(PollTask::PlayerQueryPoll, now + PLAYER_QUERY_POLL_INTERVAL);
        Ok(())
    }

    fn on_player_query_poll(&mut self, ctx: &mut DiscoveryContext, now: Instant) {
        let Some(player_query) = &mut self.player_query else { return };
        let query = &player_query.query;
        let driver = ctx.drivers[query.driver].driver.as_mut();

        loop {
            let (len, from) = match driver.read(query.socket, ctx.buf) {
                Ok(Some(r)) => r,
                Ok(None) => break,
                Err(e) => {
                    warn!("error reading player info replies: {}", e);
                    break;
                }
            };
            match ControlMessage::deser(&ctx.buf[..len]) {
                Ok(ControlMessage::PlayerInfoReply(info)) => {
                    ctx.console.print(info.name.clone());
                    ctx.console.print(format!("  frags:{:3}  colors:{} {}  time:{}", info.frags, (info.colors >> 4) & 0x0f, info.colors & 0x0f, info.connect_secs / 60));
                    ctx.console.print(format!("  {}", info.address));
                    self.players.push(info);
                }
                _ => debug!("unexpected reply to player info request from {:?} - dropping", from),
            }
        }

        player_query.polls_left -= 1;
        if player_query.polls_left > 0 {
            ctx.scheduler.schedule(PollTask::PlayerQueryPoll, now + PLAYER_QUERY_POLL_INTERVAL);
        }
        else {
            driver.close_socket(query.socket);
            self.player_query = None;
        }
    }

    /// Pages through a server's rules. The rules are printed to the console and collected in
    ///  [Discovery::rules].
    pub fn query_rules(&mut self, ctx: &mut DiscoveryContext, host: &str, now: Instant) -> Result<(), QueryError> {
        if self.rule_query.is_some() {
            return Err(QueryError::InProgress);
        }

        let host = match ctx.host_cache.find_by_name(host) {
            Some(entry) => entry.canonical_name.clone(),
            None => host.to_string(),
        };
        let query = open_query_socket(ctx.drivers, &host)?;
        let driver = ctx.drivers[query.driver].driver.as_mut();

        if let Err(e) = send_rule_request(driver, &query, "") {
            warn!("error sending rule info request to {:?}: {}", query.target, e);
            driver.close_socket(query.socket);
            return Err(QueryError::Socket);
        }

        self.rules.clear();
        self.rule_query = Some(RuleQuery {
            query,
            last_reply: now,
        });
        ctx.scheduler.schedule(PollTask::RuleQueryPoll, now + RULE_QUERY_POLL_INTERVAL);
        Ok(())
    }

    fn on_rule_query_poll(&mut self, ctx: &mut DiscoveryContext, now: Instant) {
        let Some(rule_query) = &mut self.rule_query else { return };
        let driver = ctx.drivers[rule_query.query.driver].driver.as_mut();

        let finished = match driver.read(rule_query.query.socket, ctx.buf) {
            Err(e) => {
                warn!("error reading rule info reply: {}", e);
                true
            }
            Ok(None) => {
                if now.saturating_duration_since(rule_query.last_reply) > RULE_QUERY_TIMEOUT {
                    ctx.console.print("No response to Rule Info request");
                    true
                }
                else {
                    false
                }
            }
            Ok(Some((len, _))) => match ControlMessage::deser(&ctx.buf[..len]) {
                Ok(ControlMessage::RuleInfoReply(None)) => true,
                Ok(ControlMessage::RuleInfoReply(Some((name, value)))) => {
                    ctx.console.print(format!("{:<16.16}  {:<16.16}", name, value));
                    rule_query.last_reply = now;
                    let sent = send_rule_request(driver, &rule_query.query, &name);
                    self.rules.push((name, value));
                    if let Err(e) = sent {
                        warn!("error sending rule info request: {}", e);
                        true
                    }
                    else {
                        false
                    }
                }
                _ => {
                    ctx.console.print("Unexpected response to Rule Info request");
                    true
                }
            }
        };

        if finished {
            driver.close_socket(rule_query.query.socket);
            self.rule_query = None;
        }
        else {
            ctx.scheduler.schedule(PollTask::RuleQueryPoll, now + RULE_QUERY_POLL_INTERVAL);
        }
    }

    /// Ends all activities, closing the query sockets.
    pub fn shutdown(&mut self, ctx: &mut DiscoveryContext) {
        if let Some(player_query) = self.player_query.take() {
            if let Some(slot) = ctx.drivers.get_mut(player_query.query.driver) {
                slot.driver.close_socket(player_query.query.socket);
            }
        }
        if let Some(rule_query) = self.rule_query.take() {
            if let Some(slot) = ctx.drivers.get_mut(rule_query.query.driver) {
                slot.driver.close_socket(rule_query.query.socket);
            }
        }
        self.round = None;
        ctx.scheduler.clear();
    }
}

/// Finds the first driver that can resolve `host`.
pub fn resolve(drivers: &[DriverSlot], host: &str) -> Result<(usize, SocketAddr), QueryError> {
    drivers.iter()
        .enumerate()
        .find_map(|(i, slot)| slot.driver.resolve_name(host).ok().map(|addr| (i, addr)))
        .ok_or_else(|| QueryError::Unresolvable(host.to_string()))
}

fn open_query_socket(drivers: &mut [DriverSlot], host: &str) -> Result<QuerySocket, QueryError> {
    let (driver, target) = resolve(drivers, host)?;
    let socket = drivers[driver].driver.open_socket(0)
        .map_err(|e| {
            warn!("unable to open a socket for querying {:?}: {}", target, e);
            QueryError::Socket
        })?;
    Ok(QuerySocket { driver, socket, target })
}

fn send_rule_request(driver: &mut dyn DatagramDriver, query: &QuerySocket, previous: &str) -> anyhow::Result<()> {
    let request = ControlMessage::RuleInfoRequest { previous: previous.to_string() };
    driver.write(query.socket, &request.ser(), query.target)?;
    Ok(())
}

/// Reads all pending server info replies from a driver's control socket into the host cache.
///  Replies from our own host are skipped.
fn collect_server_info(driver_index: usize, slot: &mut DriverSlot, host_cache: &mut HostCache, config: &NetConfig, buf: &mut [u8]) -> anyhow::Result<()> {
    let own_addr = slot.driver.socket_addr(slot.control_socket)?;

    while let Some((len, from)) = slot.driver.read(slot.control_socket, buf)? {
        if slot.driver.compare_addr(from, own_addr).is_same_host() {
            continue;
        }
        let info = match ControlMessage::deser(&buf[..len]) {
            Ok(ControlMessage::ServerInfoReply(info)) => info,
            _ => {
                debug!("dropping unexpected packet from {:?} on the control socket", from);
                continue;
            }
        };

        // servers announce the address they want to be reached on
        let addr = slot.driver.resolve_name(&info.address)
            .unwrap_or(from);

        let name = if info.protocol_version == config.protocol_version {
            info.name
        }
        else {
            HostCache::version_mismatch_name(&info.name)
        };

        let entry = HostCacheEntry {
            name,
            map: info.map,
            users: info.users,
            max_users: info.max_users,
            driver: driver_index,
            addr,
            canonical_name: slot.driver.addr_to_string(addr),
        };
        match host_cache.insert(entry) {
            Ok(Some(_)) => debug!("discovered server at {:?}", addr),
            Ok(None) => {}
            Err(_) => debug!("no room in host cache for server at {:?}", addr),
        }
    }
    Ok(())
}

fn server_list_line(entry: &HostCacheEntry) -> String {
    if entry.max_users > 0 {
        format!("{:<15.15} {:<15.15} {:2}/{:2}", entry.name, entry.map, entry.users, entry.max_users)
    }
    else {
        format!("{:<15.15} {:<15.15}", entry.name, entry.map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_messages::ServerInfo;
    use crate::driver::loopback::{LoopbackDriver, LoopbackNetwork};

    /// a server that is simulated with plain loopback sockets
    struct FakeServer {
        driver: LoopbackDriver,
        socket: SocketHandle,
        protocol_version: u8,
        name: String,
    }

    impl FakeServer {
        fn new(network: &LoopbackNetwork, name: &str, protocol_version: u8) -> FakeServer {
            let mut driver = network.add_host(name);
            let socket = driver.open_socket(26000).unwrap();
            FakeServer { driver, socket, protocol_version, name: name.to_string() }
        }

        /// answers all pending requests, returning the number of requests
        fn answer(&mut self) -> usize {
            let mut num = 0;
            let mut buf = [0u8; 256];
            while let Some((len, from)) = self.driver.read(self.socket, &mut buf).unwrap() {
                num += 1;
                let reply = match ControlMessage::deser(&buf[..len]).unwrap() {
                    ControlMessage::ServerInfoRequest { .. } => ControlMessage::ServerInfoReply(ServerInfo {
                        address: self.driver.socket_addr(self.socket).unwrap().to_string(),
                        name: self.name.clone(),
                        map: "e1m1".to_string(),
                        users: 1,
                        max_users: 4,
                        protocol_version: self.protocol_version,
                    }),
                    ControlMessage::PlayerInfoRequest { index } if index < 2 => ControlMessage::PlayerInfoReply(PlayerInfo {
                        index,
                        name: format!("player{}", index),
                        colors: 0x12,
                        frags: index as i32,
                        connect_secs: 120,
                        address: "10.0.0.77:40000".to_string(),
                    }),
                    ControlMessage::PlayerInfoRequest { .. } => continue,
                    ControlMessage::RuleInfoRequest { previous } => ControlMessage::RuleInfoReply(match previous.as_str() {
                        "" => Some(("fraglimit".to_string(), "30".to_string())),
                        "fraglimit" => Some(("timelimit".to_string(), "20".to_string())),
                        _ => None,
                    }),
                    other => panic!("unexpected request {:?}", other),
                };
                self.driver.write(self.socket, &reply.ser(), from).unwrap();
            }
            num
        }
    }

    struct Fixture {
        config: NetConfig,
        drivers: Vec<DriverSlot>,
        host_cache: HostCache,
        scheduler: PollScheduler<PollTask>,
        console: Console,
        buf: Vec<u8>,
        discovery: Discovery,
    }

    impl Fixture {
        fn new(network: &LoopbackNetwork) -> Fixture {
            let mut driver = network.add_host("client");
            let control_socket = driver.init().unwrap();
            Fixture {
                config: NetConfig::default(),
                drivers: vec![DriverSlot { driver: Box::new(driver), control_socket }],
                host_cache: HostCache::new(8),
                scheduler: PollScheduler::new(),
                console: Console::default(),
                buf: vec![0; 2048],
                discovery: Discovery::default(),
            }
        }

        fn ctx(&mut self) -> (DiscoveryContext, &mut Discovery) {
            (DiscoveryContext {
                config: &self.config,
                drivers: &mut self.drivers,
                host_cache: &mut self.host_cache,
                scheduler: &mut self.scheduler,
                console: &mut self.console,
                buf: &mut self.buf,
            }, &mut self.discovery)
        }

        fn run_until(&mut self, now: Instant, servers: &mut [&mut FakeServer]) -> usize {
            let mut num_requests = 0;
            while let Some(due) = self.scheduler.next_due() {
                if due > now {
                    break;
                }
                for server in servers.iter_mut() {
                    num_requests += server.answer();
                }
                for task in self.scheduler.take_due(due) {
                    let (mut ctx, discovery) = self.ctx();
                    discovery.run_task(&mut ctx, task, due);
                }
            }
            num_requests
        }
    }

    #[test]
    fn test_discovery() {
        let network = LoopbackNetwork::default();
        let mut fixture = Fixture::new(&network);
        let mut arena = FakeServer::new(&network, "arena", 3);
        let mut old = FakeServer::new(&network, "old-fashioned-server", 2);
        let mut twin = FakeServer::new(&network, "arena", 3);

        let t0 = Instant::now();
        let (mut ctx, discovery) = fixture.ctx();
        assert!(discovery.start(&mut ctx, true, false, t0));
        assert!(!discovery.start(&mut ctx, true, false, t0));

        let num_requests = fixture.run_until(t0 + Duration::from_secs(10), &mut [&mut arena, &mut old, &mut twin]);
        assert_eq!(num_requests, 6);
        assert!(!fixture.discovery.is_in_progress());
        assert!(fixture.scheduler.is_empty());

        let names = fixture.host_cache.entries().iter().map(|e| e.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["arena", "*old-fashioned-", "arena0"]);
        assert_eq!(fixture.host_cache.entries()[0].canonical_name, "10.0.0.2:26000");

        assert_eq!(fixture.console.lines(), &[
            "Looking for servers...",
            "Server          Map             Users",
            "--------------- --------------- -----",
            "arena           e1m1             1/ 4",
            "*old-fashioned- e1m1             1/ 4",
            "arena0          e1m1             1/ 4",
            "== end list ==",
        ]);
    }

    #[test]
    fn test_discovery_timing() {
        let network = LoopbackNetwork::default();
        let mut fixture = Fixture::new(&network);
        let mut arena = FakeServer::new(&network, "arena", 3);

        let t0 = Instant::now();
        let (mut ctx, discovery) = fixture.ctx();
        discovery.start(&mut ctx, true, true, t0);

        assert_eq!(fixture.run_until(t0 + Duration::from_millis(749), &mut [&mut arena]), 1);
        assert_eq!(fixture.run_until(t0 + Duration::from_millis(1499), &mut [&mut arena]), 1);
        assert!(fixture.discovery.is_in_progress());
        fixture.run_until(t0 + Duration::from_millis(1500), &mut [&mut arena]);
        assert!(!fixture.discovery.is_in_progress());
        assert!(fixture.console.lines().is_empty());
    }

    #[test]
    fn test_no_servers() {
        let network = LoopbackNetwork::default();
        let mut fixture = Fixture::new(&network);

        let t0 = Instant::now();
        let (mut ctx, discovery) = fixture.ctx();
        discovery.start(&mut ctx, true, false, t0);
        fixture.run_until(t0 + Duration::from_secs(2), &mut []);

        assert_eq!(fixture.console.lines().last().unwrap(), "No servers found.");
    }

    #[test]
    fn test_unicast_query_without_broadcast() {
        let network = LoopbackNetwork::default();
        let mut fixture = Fixture::new(&network);
        let mut arena = FakeServer::new(&network, "arena", 3);
        let mut other = FakeServer::new(&network, "other", 3);

        let t0 = Instant::now();
        let (mut ctx, discovery) = fixture.ctx();
        discovery.query_server(&mut ctx, "arena").unwrap();
        discovery.start(&mut ctx, false, true, t0);
        assert_eq!(discovery.query_server(&mut ctx, "nowhere"), Err(QueryError::Unresolvable("nowhere".to_string())));

        assert_eq!(fixture.run_until(t0 + Duration::from_secs(2), &mut [&mut arena, &mut other]), 1);
        assert_eq!(fixture.host_cache.len(), 1);
        assert_eq!(fixture.host_cache.entries()[0].name, "arena");
    }

    #[test]
    fn test_player_query() {
        let network = LoopbackNetwork::default();
        let mut fixture = Fixture::new(&network);
        let mut arena = FakeServer::new(&network, "arena", 3);

        let t0 = Instant::now();
        let (mut ctx, discovery) = fixture.ctx();
        discovery.query_players(&mut ctx, "arena", t0).unwrap();
        assert_eq!(discovery.query_players(&mut ctx, "arena", t0), Err(QueryError::InProgress));

        assert_eq!(fixture.run_until(t0 + Duration::from_millis(1999), &mut [&mut arena]), MAX_SCOREBOARD as usize);
        assert!(fixture.discovery.is_player_query_in_progress());
        fixture.run_until(t0 + Duration::from_millis(2000), &mut [&mut arena]);
        assert!(!fixture.discovery.is_player_query_in_progress());

        let names = fixture.discovery.players().iter().map(|p| p.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["player0", "player1"]);
        assert_eq!(&fixture.console.lines()[..3], &["player0", "  frags:  0  colors:1 2  time:2", "  10.0.0.77:40000"]);
    }

    #[test]
    fn test_player_query_uses_cached_capacity() {
        let network = LoopbackNetwork::default();
        let mut fixture = Fixture::new(&network);
        let mut arena = FakeServer::new(&network, "arena", 3);

        let t0 = Instant::now();
        let (mut ctx, discovery) = fixture.ctx();
        discovery.start(&mut ctx, true, true, t0);
        fixture.run_until(t0 + Duration::from_secs(2), &mut [&mut arena]);

        let (mut ctx, discovery) = fixture.ctx();
        discovery.query_players(&mut ctx, "ARENA", t0).unwrap();
        assert_eq!(fixture.run_until(t0 + Duration::from_secs(5), &mut [&mut arena]), 4);
    }

    #[test]
    fn test_rule_query() {
        let network = LoopbackNetwork::default();
        let mut fixture = Fixture::new(&network);
        let mut arena = FakeServer::new(&network, "arena", 3);

        let t0 = Instant::now();
        let (mut ctx, discovery) = fixture.ctx();
        discovery.query_rules(&mut ctx, "arena", t0).unwrap();

        assert_eq!(fixture.run_until(t0 + Duration::from_secs(1), &mut [&mut arena]), 3);
        assert!(!fixture.discovery.is_rule_query_in_progress());
        assert_eq!(fixture.discovery.rules(), &[
            ("fraglimit".to_string(), "30".to_string()),
            ("timelimit".to_string(), "20".to_string()),
        ]);
        assert_eq!(fixture.console.lines(), &["fraglimit         30              ", "timelimit         20              "]);
    }

    #[test]
    fn test_rule_query_gives_up() {
        let network = LoopbackNetwork::default();
        let mut fixture = Fixture::new(&network);
        let _silent = network.add_host("silent");

        let t0 = Instant::now();
        let (mut ctx, discovery) = fixture.ctx();
        discovery.query_rules(&mut ctx, "silent", t0).unwrap();

        fixture.run_until(t0 + Duration::from_millis(2000), &mut []);
        assert!(fixture.discovery.is_rule_query_in_progress());
        fixture.run_until(t0 + Duration::from_millis(2100), &mut []);
        assert!(!fixture.discovery.is_rule_query_in_progress());
        assert_eq!(fixture.console.lines(), &["No response to Rule Info request"]);
    }
}
