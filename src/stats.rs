/// Diagnostic counters for one [crate::transport::Transport]. They are owned by the transport
///  and handed to the engines by reference, so several transports in one process (e.g. a
///  client and a server in a test) never mix their numbers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NetStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub unreliable_messages_sent: u64,
    pub unreliable_messages_received: u64,
    pub packets_sent: u64,
    pub packets_resent: u64,
    pub packets_received: u64,
    pub received_duplicate_count: u64,
    pub short_packet_count: u64,
    pub dropped_datagrams: u64,
}

impl NetStats {
    pub fn report(&self) -> Vec<String> {
        vec![
            format!("unreliable messages sent   = {}", self.unreliable_messages_sent),
            format!("unreliable messages recv   = {}", self.unreliable_messages_received),
            format!("reliable messages sent     = {}", self.messages_sent),
            format!("reliable messages received = {}", self.messages_received),
            format!("packetsSent                = {}", self.packets_sent),
            format!("packetsReSent              = {}", self.packets_resent),
            format!("packetsReceived            = {}", self.packets_received),
            format!("receivedDuplicateCount     = {}", self.received_duplicate_count),
            format!("shortPacketCount           = {}", self.short_packet_count),
            format!("droppedDatagrams           = {}", self.dropped_datagrams),
        ]
    }
}
