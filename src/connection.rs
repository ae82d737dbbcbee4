use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use bytes::Bytes;
use tracing::{debug, trace};
use crate::driver::{AddrMatch, SocketHandle};
use crate::link::Link;
use crate::packet_header::{PacketHeader, PacketKind};
use crate::reliable::{FragmentOutcome, ReliableReceiver, ReliableSender};
use crate::stats::NetStats;
use crate::unreliable::UnreliableStream;

/// Identifies a connection slot in the pool together with the slot's generation. The generation
///  changes whenever the slot is released, so an id that outlived its connection never refers
///  to whatever connection reuses the slot later.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    pub index: u32,
    pub generation: u32,
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Where a connection's packets go: a socket of one of the transport's drivers, and the peer
///  address on that driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub driver: usize,
    pub socket: SocketHandle,
    pub peer: SocketAddr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Incoming {
    Reliable(Bytes),
    Unreliable(Bytes),
}

pub struct Connection {
    pub(crate) generation: u32,
    pub(crate) active: bool,

    /// `None` only while the slot is free
    pub endpoint: Option<Endpoint>,
    /// human readable peer address
    pub address: String,
    pub mtu: usize,

    pub connect_time: Instant,
    /// time of the most recent packet of any kind from the peer
    pub last_message_time: Instant,

    pub sender: ReliableSender,
    pub receiver: ReliableReceiver,
    pub unreliable: UnreliableStream,
}

impl Connection {
    pub(crate) fn new(now: Instant) -> Connection {
        Connection {
            generation: 0,
            active: false,
            endpoint: None,
            address: String::new(),
            mtu: 0,
            connect_time: now,
            last_message_time: now,
            sender: ReliableSender::new(now),
            receiver: ReliableReceiver::new(),
            unreliable: UnreliableStream::new(),
        }
    }

    /// Puts all protocol state back to its initial values, keeping the generation.
    pub(crate) fn reset(&mut self, now: Instant) {
        let generation = self.generation;
        *self = Connection::new(now);
        self.generation = generation;
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_message_time) > timeout
    }

    /// Processes one packet read from the connection's socket. `link` must be this connection's
    ///  link, and is used for sending ACKs.
    ///
    /// Malformed packets and packets from anyone but the peer are dropped. Errors are I/O
    ///  errors while sending an ACK.
    pub fn on_packet(&mut self, packet: &[u8], from: SocketAddr, link: &mut Link, max_message_size: usize, now: Instant, stats: &mut NetStats) -> anyhow::Result<Option<Incoming>> {
        if link.driver.compare_addr(from, link.peer) != AddrMatch::Same {
            debug!("forged packet from {:?} on connection to {:?} - dropping", from, link.peer);
            return Ok(None);
        }
        if packet.len() < PacketHeader::SERIALIZED_LEN {
            stats.short_packet_count += 1;
            return Ok(None);
        }

        let mut buf = packet;
        let header = match PacketHeader::deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                debug!("dropping malformed packet from {:?}: {}", from, e);
                return Ok(None);
            }
        };
        let payload = buf;

        trace!("received {:?} from {:?}", header, from);
        stats.packets_received += 1;
        self.last_message_time = now;

        match header.kind {
            PacketKind::Unreliable => {
                if self.unreliable.on_datagram(header.sequence, stats) {
                    return Ok(Some(Incoming::Unreliable(Bytes::copy_from_slice(payload))));
                }
            }
            PacketKind::Ack => {
                self.sender.on_ack(header.sequence, self.mtu);
            }
            PacketKind::Data { end_of_message } => {
                // acknowledge duplicates too: they mean that the previous ACK was lost
                link.send_packet(&PacketHeader::ack(header.sequence), &[])?;

                if let FragmentOutcome::Complete(message) = self.receiver.on_fragment(header.sequence, end_of_message, payload, max_message_size, stats) {
                    return Ok(Some(Incoming::Reliable(message)));
                }
            }
        }
        Ok(None)
    }
}
