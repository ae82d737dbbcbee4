//! Connection oriented messaging over datagram drivers (UDP, in-memory loopback), in the style
//!  of a LAN game network layer: a fixed pool of connections, a reliable fragmented message
//!  stream and an unreliable datagram stream per connection, and an out-of-band control
//!  channel for the connect handshake, LAN discovery and remote diagnostics.
//!
//! The library does no I/O of its own accord and never blocks: everything happens inside calls
//!  from the application, which passes in the current time. See [transport::Transport] for the
//!  entry point.
//!
//! Every packet starts with a big endian length-and-flags word:
//!
//! ```ascii
//! 0: flags (high 16 bits) | packet length incl. header (low 16 bits)
//! 4: connection packets: sequence number (u32 BE), followed by the payload
//!    control packets:    opcode (u8), followed by opcode specific fields
//! ```
//!
//! Flags are DATA (reliable fragment), END_OF_MESSAGE, ACK, UNRELIABLE and CONTROL. Control
//!  packets carry CONTROL and nothing else.

pub mod config;
pub mod error;
pub mod packet_header;
pub mod control_messages;
pub mod stats;
pub mod console;
pub mod connection;
pub mod connection_pool;
pub mod link;
pub mod reliable;
pub mod unreliable;
pub mod poll_scheduler;
pub mod host_cache;
pub mod server_info;
pub mod handshake;
pub mod connect;
pub mod discovery;
pub mod transport;
pub mod driver;

#[cfg(test)] mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
