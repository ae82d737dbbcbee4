use tracing::debug;
use crate::error::SendError;
use crate::link::Link;
use crate::packet_header::PacketHeader;
use crate::stats::NetStats;

/// Best effort datagrams with their own sequence numbers, independent of the reliable
///  stream. Payloads are never fragmented, and the receiver only uses the sequence number to
///  drop stale packets and to count gaps.
pub struct UnreliableStream {
    send_sequence: u32,
    receive_sequence: u32,
}

impl UnreliableStream {
    pub fn new() -> UnreliableStream {
        UnreliableStream {
            send_sequence: 0,
            receive_sequence: 0,
        }
    }

    pub fn send_sequence(&self) -> u32 {
        self.send_sequence
    }

    pub fn receive_sequence(&self) -> u32 {
        self.receive_sequence
    }

    pub fn check_payload(payload: &[u8], mtu: usize) -> Result<(), SendError> {
        if payload.len() > mtu {
            return Err(SendError::PayloadTooLarge { len: payload.len(), max: mtu });
        }
        Ok(())
    }

    /// The payload must have passed [UnreliableStream::check_payload].
    pub fn send(&mut self, payload: &[u8], link: &mut Link, stats: &mut NetStats) -> anyhow::Result<()> {
        let header = PacketHeader::unreliable(self.send_sequence, payload.len());
        self.send_sequence = self.send_sequence.wrapping_add(1);
        stats.packets_sent += 1;
        stats.unreliable_messages_sent += 1;

        link.send_packet(&header, payload)
    }

    /// Returns true if the datagram should be delivered to the application.
    pub fn on_datagram(&mut self, sequence: u32, stats: &mut NetStats) -> bool {
        if sequence < self.receive_sequence {
            debug!("stale unreliable datagram {}, expected {}", sequence, self.receive_sequence);
            return false;
        }
        if sequence != self.receive_sequence {
            let num_dropped = sequence - self.receive_sequence;
            debug!("{} unreliable datagram(s) dropped before {}", num_dropped, sequence);
            stats.dropped_datagrams += num_dropped as u64;
        }

        self.receive_sequence = sequence.wrapping_add(1);
        stats.unreliable_messages_received += 1;
        true
    }
}

impl Default for UnreliableStream {
    fn default() -> Self {
        UnreliableStream::new()
    }
}
