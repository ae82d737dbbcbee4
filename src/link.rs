use std::net::SocketAddr;
use bytes::{BufMut, BytesMut};
use tracing::{debug, trace, warn};
use crate::driver::{DatagramDriver, SocketHandle, WriteOutcome};
use crate::packet_header::PacketHeader;

/// The write path from one connection to its peer: a socket on a specific driver plus the
///  peer's address. It is assembled on the fly from a connection's endpoint and the driver it
///  belongs to, and lives only for the duration of one operation.
pub struct Link<'a> {
    pub driver: &'a mut dyn DatagramDriver,
    pub socket: SocketHandle,
    pub peer: SocketAddr,
}

impl<'a> Link<'a> {
    pub fn new(driver: &'a mut dyn DatagramDriver, socket: SocketHandle, peer: SocketAddr) -> Link<'a> {
        Link { driver, socket, peer }
    }

    /// Sends a header followed by its payload as a single packet. Errors are I/O errors from the
    ///  driver; a packet the driver could not accept right now is treated as lost.
    pub fn send_packet(&mut self, header: &PacketHeader, payload: &[u8]) -> anyhow::Result<()> {
        debug_assert_eq!(header.payload_len(), payload.len());

        let mut buf = BytesMut::with_capacity(header.packet_len);
        header.ser(&mut buf);
        buf.put_slice(payload);

        trace!("sending {:?} to {:?}", header, self.peer);
        self.send_raw(&buf)
    }

    pub fn send_raw(&mut self, packet: &[u8]) -> anyhow::Result<()> {
        match self.driver.write(self.socket, packet, self.peer)? {
            WriteOutcome::Written(len) if len == packet.len() => {}
            WriteOutcome::Written(len) => warn!("short write to {:?}: {} of {} bytes", self.peer, len, packet.len()),
            WriteOutcome::WouldBlock => debug!("socket buffer full, packet to {:?} is lost", self.peer),
        }
        Ok(())
    }
}
