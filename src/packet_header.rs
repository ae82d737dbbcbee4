use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

/// The low 16 bits of the leading word carry the total packet length (header included).
pub const LENGTH_MASK: u32 = 0x0000_ffff;

bitflags! {
    /// The high bits of the leading length word.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct PacketFlags: u32 {
        const DATA = 0x0001_0000;
        const ACK = 0x0002_0000;
        /// reserved, never sent
        const NAK = 0x0004_0000;
        const END_OF_MESSAGE = 0x0008_0000;
        const UNRELIABLE = 0x0010_0000;
        const CONTROL = 0x8000_0000;
    }
}

/// Reads the leading length-and-flags word and checks it against the number of bytes that
///  were actually read from the socket.
pub fn read_length_and_flags(buf: &mut impl Buf, packet_len: usize) -> anyhow::Result<PacketFlags> {
    let word = buf.try_get_u32()?;

    let declared_len = (word & LENGTH_MASK) as usize;
    if declared_len != packet_len {
        bail!("declared packet length {} does not match actual length {}", declared_len, packet_len);
    }

    match PacketFlags::from_bits(word & !LENGTH_MASK) {
        Some(flags) => Ok(flags),
        None => bail!("unknown packet flags {:#010x}", word & !LENGTH_MASK),
    }
}

pub fn put_length_and_flags(buf: &mut BytesMut, flags: PacketFlags, packet_len: usize) {
    debug_assert!(packet_len <= LENGTH_MASK as usize);
    buf.put_u32(flags.bits() | (packet_len as u32 & LENGTH_MASK));
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketKind {
    Data { end_of_message: bool },
    Ack,
    Unreliable,
}

impl PacketKind {
    fn flags(&self) -> PacketFlags {
        match self {
            PacketKind::Data { end_of_message: false } => PacketFlags::DATA,
            PacketKind::Data { end_of_message: true } => PacketFlags::DATA | PacketFlags::END_OF_MESSAGE,
            PacketKind::Ack => PacketFlags::ACK,
            PacketKind::Unreliable => PacketFlags::UNRELIABLE,
        }
    }

    fn from_flags(flags: PacketFlags) -> anyhow::Result<PacketKind> {
        if flags == PacketFlags::DATA {
            Ok(PacketKind::Data { end_of_message: false })
        }
        else if flags == PacketFlags::DATA | PacketFlags::END_OF_MESSAGE {
            Ok(PacketKind::Data { end_of_message: true })
        }
        else if flags == PacketFlags::ACK {
            Ok(PacketKind::Ack)
        }
        else if flags == PacketFlags::UNRELIABLE {
            Ok(PacketKind::Unreliable)
        }
        else if flags.contains(PacketFlags::CONTROL) {
            bail!("control packet on a connection socket")
        }
        else {
            bail!("invalid flag combination {:?}", flags)
        }
    }
}

/// Header of a packet that belongs to an established connection:
///
/// ```ascii
/// 0: length and flags (u32 BE) - see [PacketFlags] and [LENGTH_MASK]
/// 4: sequence number (u32 BE)
/// 8: payload (up to MTU bytes, none for ACK)
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub sequence: u32,
    /// total packet length, header included
    pub packet_len: usize,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 2 * size_of::<u32>();

    pub fn data(sequence: u32, payload_len: usize, end_of_message: bool) -> PacketHeader {
        PacketHeader {
            kind: PacketKind::Data { end_of_message },
            sequence,
            packet_len: Self::SERIALIZED_LEN + payload_len,
        }
    }

    pub fn ack(sequence: u32) -> PacketHeader {
        PacketHeader {
            kind: PacketKind::Ack,
            sequence,
            packet_len: Self::SERIALIZED_LEN,
        }
    }

    pub fn unreliable(sequence: u32, payload_len: usize) -> PacketHeader {
        PacketHeader {
            kind: PacketKind::Unreliable,
            sequence,
            packet_len: Self::SERIALIZED_LEN + payload_len,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.packet_len - Self::SERIALIZED_LEN
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        put_length_and_flags(buf, self.kind.flags(), self.packet_len);
        buf.put_u32(self.sequence);
    }

    /// `buf` must contain the complete packet as read from the socket. On success, it is
    ///  advanced to the start of the payload.
    pub fn deser(buf: &mut &[u8]) -> anyhow::Result<PacketHeader> {
        let packet_len = buf.len();
        if packet_len < Self::SERIALIZED_LEN {
            bail!("packet of length {} is shorter than the header", packet_len);
        }

        let flags = read_length_and_flags(buf, packet_len)?;
        let kind = PacketKind::from_flags(flags)?;
        let sequence = buf.try_get_u32()?;

        if kind == PacketKind::Ack && packet_len != Self::SERIALIZED_LEN {
            bail!("ACK with payload");
        }

        Ok(PacketHeader {
            kind,
            sequence,
            packet_len,
        })
    }
}
