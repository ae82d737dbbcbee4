use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::time::Duration;
use anyhow::{anyhow, bail};
use crate::packet_header::{PacketHeader, LENGTH_MASK};

/// The tag string that connect and server-info requests must carry. It is part of the wire
///  format, so changing it makes a node invisible to peers using the default.
pub const DEFAULT_PROTOCOL_TAG: &str = "QUAKE";
pub const DEFAULT_PROTOCOL_VERSION: u8 = 3;

#[derive(Clone, Debug)]
pub struct NetConfig {
    /// Number of connection objects allocated up front. This is the hard upper bound for
    ///  concurrently active connections, client and server side combined.
    pub max_connections: usize,

    /// A dedicated host has no use for a transport without drivers, so start-up fails if no
    ///  driver can be initialized. Otherwise the transport starts with whatever is available.
    pub dedicated: bool,

    /// start accepting connections right away
    pub listen: bool,

    /// A connection that has not received any packet for this long is closed locally the next
    ///  time the application tries to receive from it.
    pub message_timeout: Duration,

    /// Fixed retransmit timeout for the most recently sent reliable fragment. There is no
    ///  backoff.
    pub resend_interval: Duration,

    pub connect_attempts: u32,
    pub connect_attempt_timeout: Duration,

    /// A connect request from an address that was accepted less than this long ago is treated
    ///  as a retransmission of the original request, and answered with the original port.
    pub duplicate_connect_window: Duration,

    pub max_message_size: usize,
    pub host_cache_size: usize,

    pub protocol_tag: String,
    pub protocol_version: u8,

    pub ban: Option<BanFilter>,

    pub discovery: DiscoveryConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            max_connections: 8,
            dedicated: false,
            listen: false,
            message_timeout: Duration::from_secs(300),
            resend_interval: Duration::from_secs(1),
            connect_attempts: 3,
            connect_attempt_timeout: Duration::from_millis(2500),
            duplicate_connect_window: Duration::from_secs(2),
            max_message_size: 8192,
            host_cache_size: 8,
            protocol_tag: DEFAULT_PROTOCOL_TAG.to_string(),
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            ban: None,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl NetConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            bail!("at least one connection slot is required");
        }
        if self.max_message_size == 0 {
            bail!("maximum message size must not be zero");
        }
        if self.max_message_size + PacketHeader::SERIALIZED_LEN > LENGTH_MASK as usize {
            bail!("maximum message size {} does not fit the 16 bit packet length field", self.max_message_size);
        }
        if self.connect_attempts == 0 {
            bail!("at least one connect attempt is required");
        }
        if self.host_cache_size == 0 {
            bail!("host cache size must not be zero");
        }
        if self.protocol_tag.is_empty() || self.protocol_tag.contains('\0') {
            bail!("protocol tag must be a non-empty string without NUL characters");
        }
        self.discovery.validate()
    }

    /// Checks that a driver's MTU can be expressed in the packet header's length field.
    pub fn validate_mtu(mtu: usize) -> anyhow::Result<()> {
        if mtu == 0 {
            bail!("MTU must not be zero");
        }
        if mtu + PacketHeader::SERIALIZED_LEN > LENGTH_MASK as usize {
            bail!("MTU {} does not fit the 16 bit packet length field", mtu);
        }
        Ok(())
    }
}

/// Timing of a LAN discovery sweep. Queries go out at the start and once more after
///  `resend_delay` if that is still inside `resend_window`; replies are collected every
///  `poll_interval` until `duration` has passed.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub resend_delay: Duration,
    pub resend_window: Duration,
    pub poll_interval: Duration,
    pub duration: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            resend_delay: Duration::from_millis(750),
            resend_window: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
            duration: Duration::from_millis(1500),
        }
    }
}

impl DiscoveryConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval.is_zero() {
            bail!("discovery poll interval must not be zero");
        }
        if self.duration < self.poll_interval {
            bail!("discovery duration must cover at least one poll interval");
        }
        Ok(())
    }
}

/// IPv4 address / mask pair. A connect request is rejected if `(source & mask) == addr`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BanFilter {
    pub addr: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl BanFilter {
    pub fn new(addr: Ipv4Addr, mask: Ipv4Addr) -> BanFilter {
        BanFilter { addr, mask }
    }

    pub fn single_host(addr: Ipv4Addr) -> BanFilter {
        BanFilter::new(addr, Ipv4Addr::BROADCAST)
    }

    pub fn matches(&self, ip: Ipv4Addr) -> bool {
        (u32::from(ip) & u32::from(self.mask)) == u32::from(self.addr)
    }

    /// Parses the arguments of a ban command: `off`, `<addr>` or `<addr> <mask>`. `Ok(None)`
    ///  means banning is switched off.
    pub fn parse(args: &[&str]) -> anyhow::Result<Option<BanFilter>> {
        match args {
            [addr] if addr.eq_ignore_ascii_case("off") => Ok(None),
            [addr] => Ok(Some(BanFilter::single_host(Self::parse_ip(addr)?))),
            [addr, mask] => Ok(Some(BanFilter::new(Self::parse_ip(addr)?, Self::parse_ip(mask)?))),
            _ => bail!("usage: ban <ip_address> [mask]"),
        }
    }

    fn parse_ip(s: &str) -> anyhow::Result<Ipv4Addr> {
        s.parse()
            .map_err(|_| anyhow!("{} is not a valid IPv4 address", s))
    }
}

impl Display for BanFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Banning {} [{}]", self.addr, self.mask)
    }
}
