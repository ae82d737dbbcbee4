//! Reliable, ordered message stream on top of unreliable datagrams.
//!
//! A message is cut into MTU sized fragments that are sent strictly one at a time: the next
//!  fragment goes out only after the previous one was acknowledged, and the last fragment
//!  carries the END_OF_MESSAGE flag. So there is at most one unacknowledged fragment per
//!  connection, and at most one message in flight.
//!
//! Every fragment has its own sequence number (per fragment, not per message), and the
//!  receiver accepts only the exact next sequence number. Anything else is a duplicate of a
//!  fragment that was already processed - its ACK was presumably lost, so the receiver
//!  acknowledges it again but otherwise ignores it. There is no reordering buffer because the
//!  sender never has more than one fragment in flight.
//!
//! If no ACK arrives within the resend interval, the sender retransmits the most recent
//!  fragment with its original sequence number. There is no backoff.

use std::time::{Duration, Instant};
use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};
use crate::error::SendError;
use crate::link::Link;
use crate::packet_header::PacketHeader;
use crate::stats::NetStats;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AckOutcome {
    /// first ACK for the most recently sent fragment
    Accepted,
    /// ACK for some fragment other than the most recently sent one
    Stale,
    /// repeated ACK for the most recently sent fragment
    Duplicate,
}

pub struct ReliableSender {
    /// message bytes that were not acknowledged yet, starting with the current fragment
    buffer: BytesMut,
    can_send: bool,
    /// the current fragment was acknowledged and the next one is waiting to be sent
    send_next: bool,
    send_sequence: u32,
    ack_sequence: u32,
    last_send_time: Instant,
}

impl ReliableSender {
    pub fn new(now: Instant) -> ReliableSender {
        ReliableSender {
            buffer: BytesMut::new(),
            can_send: true,
            send_next: false,
            send_sequence: 0,
            ack_sequence: 0,
            last_send_time: now,
        }
    }

    pub fn can_send(&self) -> bool {
        self.can_send
    }

    pub fn send_sequence(&self) -> u32 {
        self.send_sequence
    }

    /// number of bytes of the current message that were not acknowledged yet
    pub fn unacknowledged_len(&self) -> usize {
        self.buffer.len()
    }

    /// Takes a message for transmission. Nothing is sent here: the first fragment goes out on
    ///  the next call to [ReliableSender::service].
    pub fn enqueue(&mut self, message: &[u8], max_message_size: usize, stats: &mut NetStats) -> Result<(), SendError> {
        if !self.can_send {
            return Err(SendError::Busy);
        }
        if message.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if message.len() > max_message_size {
            return Err(SendError::PayloadTooLarge { len: message.len(), max: max_message_size });
        }

        self.buffer.clear();
        self.buffer.extend_from_slice(message);
        self.can_send = false;
        self.send_next = true;
        stats.messages_sent += 1;
        Ok(())
    }

    /// Only the first ACK for the most recently sent fragment has an effect. It either arms the
    ///  next fragment or, for the last fragment, frees up the connection for the next message.
    pub fn on_ack(&mut self, sequence: u32, mtu: usize) -> AckOutcome {
        if sequence != self.send_sequence.wrapping_sub(1) {
            debug!("stale ACK {}, expected {}", sequence, self.send_sequence.wrapping_sub(1));
            return AckOutcome::Stale;
        }
        if sequence != self.ack_sequence {
            debug!("duplicate ACK {}", sequence);
            return AckOutcome::Duplicate;
        }

        self.ack_sequence = self.ack_sequence.wrapping_add(1);

        let fragment_len = self.buffer.len().min(mtu);
        self.buffer.advance(fragment_len);
        if self.buffer.is_empty() {
            trace!("message completely acknowledged");
            self.can_send = true;
        }
        else {
            self.send_next = true;
        }
        AckOutcome::Accepted
    }

    /// Sends the next fragment if one is pending, or retransmits the current one if it was not
    ///  acknowledged within `resend_interval`.
    pub fn service(&mut self, link: &mut Link, mtu: usize, resend_interval: Duration, now: Instant, stats: &mut NetStats) -> anyhow::Result<()> {
        if self.send_next {
            self.send_fragment(link, mtu, now, stats)
        }
        else if !self.can_send && now.saturating_duration_since(self.last_send_time) > resend_interval {
            self.resend_fragment(link, mtu, now, stats)
        }
        else {
            Ok(())
        }
    }

    fn current_fragment(&self, mtu: usize) -> (&[u8], bool) {
        let len = self.buffer.len().min(mtu);
        (&self.buffer[..len], self.buffer.len() <= mtu)
    }

    fn send_fragment(&mut self, link: &mut Link, mtu: usize, now: Instant, stats: &mut NetStats) -> anyhow::Result<()> {
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.send_next = false;
        self.last_send_time = now;
        stats.packets_sent += 1;

        let (payload, end_of_message) = self.current_fragment(mtu);
        link.send_packet(&PacketHeader::data(sequence, payload.len(), end_of_message), payload)
    }

    fn resend_fragment(&mut self, link: &mut Link, mtu: usize, now: Instant, stats: &mut NetStats) -> anyhow::Result<()> {
        let sequence = self.send_sequence.wrapping_sub(1);
        debug!("no ACK for fragment {} to {:?}, resending", sequence, link.peer);
        self.last_send_time = now;
        stats.packets_resent += 1;

        let (payload, end_of_message) = self.current_fragment(mtu);
        link.send_packet(&PacketHeader::data(sequence, payload.len(), end_of_message), payload)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FragmentOutcome {
    /// not the expected sequence number
    Duplicate,
    Buffered,
    Complete(Bytes),
    /// the end of a message that exceeded the maximum message size
    Discarded,
}

pub struct ReliableReceiver {
    receive_sequence: u32,
    buffer: BytesMut,
    /// set when the message being received outgrew the maximum message size: the rest of it
    ///  is acknowledged but not stored
    discarding: bool,
}

impl ReliableReceiver {
    pub fn new() -> ReliableReceiver {
        ReliableReceiver {
            receive_sequence: 0,
            buffer: BytesMut::new(),
            discarding: false,
        }
    }

    pub fn receive_sequence(&self) -> u32 {
        self.receive_sequence
    }

    /// The caller acknowledges every data packet before passing it here, duplicates included.
    pub fn on_fragment(&mut self, sequence: u32, end_of_message: bool, payload: &[u8], max_message_size: usize, stats: &mut NetStats) -> FragmentOutcome {
        if sequence != self.receive_sequence {
            debug!("duplicate fragment {}, expected {}", sequence, self.receive_sequence);
            stats.received_duplicate_count += 1;
            return FragmentOutcome::Duplicate;
        }
        self.receive_sequence = self.receive_sequence.wrapping_add(1);

        if !self.discarding && self.buffer.len() + payload.len() > max_message_size {
            warn!("incoming message exceeds the maximum message size of {} bytes - discarding it", max_message_size);
            self.discarding = true;
            self.buffer.clear();
        }
        if !self.discarding {
            self.buffer.extend_from_slice(payload);
        }

        if !end_of_message {
            return FragmentOutcome::Buffered;
        }

        if self.discarding {
            self.discarding = false;
            return FragmentOutcome::Discarded;
        }

        stats.messages_received += 1;
        FragmentOutcome::Complete(self.buffer.split().freeze())
    }
}

impl Default for ReliableReceiver {
    fn default() -> Self {
        ReliableReceiver::new()
    }
}
