//! Out-of-band control packets: discovery, remote diagnostics and the connect handshake. They
//!  share the length-and-flags word with connection packets (with only the CONTROL flag set),
//!  followed by a one byte opcode instead of a sequence number.
//!
//! Field encodings follow the game's message format: strings are NUL terminated, 'long'
//!  fields are little endian i32.

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::packet_header::{put_length_and_flags, read_length_and_flags, PacketFlags};

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ControlOpcode {
    ConnectRequest = 0x01,
    ServerInfoRequest = 0x02,
    PlayerInfoRequest = 0x03,
    RuleInfoRequest = 0x04,
    Accept = 0x81,
    Reject = 0x82,
    ServerInfoReply = 0x83,
    PlayerInfoReply = 0x84,
    RuleInfoReply = 0x85,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerInfo {
    /// the address the server wants to be contacted on, in driver-resolvable form
    pub address: String,
    pub name: String,
    pub map: String,
    pub users: u8,
    pub max_users: u8,
    pub protocol_version: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlayerInfo {
    pub index: u8,
    pub name: String,
    /// top / bottom color packed into the low byte as `top << 4 | bottom`
    pub colors: i32,
    pub frags: i32,
    pub connect_secs: i32,
    pub address: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlMessage {
    ConnectRequest { tag: String, protocol_version: u8 },
    ServerInfoRequest { tag: String, protocol_version: u8 },
    PlayerInfoRequest { index: u8 },
    /// asks for the rule following `previous` - the empty string asks for the first one
    RuleInfoRequest { previous: String },
    Accept { port: i32 },
    Reject { reason: String },
    ServerInfoReply(ServerInfo),
    PlayerInfoReply(PlayerInfo),
    /// `None` signals the end of the rule list (sent as the bare opcode)
    RuleInfoReply(Option<(String, String)>),
}

impl ControlMessage {
    pub fn opcode(&self) -> ControlOpcode {
        match self {
            ControlMessage::ConnectRequest { .. } => ControlOpcode::ConnectRequest,
            ControlMessage::ServerInfoRequest { .. } => ControlOpcode::ServerInfoRequest,
            ControlMessage::PlayerInfoRequest { .. } => ControlOpcode::PlayerInfoRequest,
            ControlMessage::RuleInfoRequest { .. } => ControlOpcode::RuleInfoRequest,
            ControlMessage::Accept { .. } => ControlOpcode::Accept,
            ControlMessage::Reject { .. } => ControlOpcode::Reject,
            ControlMessage::ServerInfoReply(_) => ControlOpcode::ServerInfoReply,
            ControlMessage::PlayerInfoReply(_) => ControlOpcode::PlayerInfoReply,
            ControlMessage::RuleInfoReply(_) => ControlOpcode::RuleInfoReply,
        }
    }

    /// Serializes the complete packet, including the length-and-flags word.
    pub fn ser(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u8(self.opcode().into());

        match self {
            ControlMessage::ConnectRequest { tag, protocol_version } |
            ControlMessage::ServerInfoRequest { tag, protocol_version } => {
                put_string(&mut body, tag);
                body.put_u8(*protocol_version);
            }
            ControlMessage::PlayerInfoRequest { index } => {
                body.put_u8(*index);
            }
            ControlMessage::RuleInfoRequest { previous } => {
                put_string(&mut body, previous);
            }
            ControlMessage::Accept { port } => {
                body.put_i32_le(*port);
            }
            ControlMessage::Reject { reason } => {
                put_string(&mut body, reason);
            }
            ControlMessage::ServerInfoReply(info) => {
                put_string(&mut body, &info.address);
                put_string(&mut body, &info.name);
                put_string(&mut body, &info.map);
                body.put_u8(info.users);
                body.put_u8(info.max_users);
                body.put_u8(info.protocol_version);
            }
            ControlMessage::PlayerInfoReply(info) => {
                body.put_u8(info.index);
                put_string(&mut body, &info.name);
                body.put_i32_le(info.colors);
                body.put_i32_le(info.frags);
                body.put_i32_le(info.connect_secs);
                put_string(&mut body, &info.address);
            }
            ControlMessage::RuleInfoReply(rule) => {
                if let Some((name, value)) = rule {
                    put_string(&mut body, name);
                    put_string(&mut body, value);
                }
            }
        }

        let mut buf = BytesMut::with_capacity(body.len() + size_of::<u32>());
        put_length_and_flags(&mut buf, PacketFlags::CONTROL, body.len() + size_of::<u32>());
        buf.put_slice(&body);
        buf
    }

    /// Parses a complete packet as read from a socket. Anything that is not a well-formed
    ///  control packet is rejected.
    pub fn deser(packet: &[u8]) -> anyhow::Result<ControlMessage> {
        let mut buf = packet;
        if buf.len() < size_of::<u32>() + 1 {
            bail!("control packet of length {} is too short", buf.len());
        }

        let flags = read_length_and_flags(&mut buf, packet.len())?;
        if flags != PacketFlags::CONTROL {
            bail!("not a control packet: {:?}", flags);
        }

        let opcode = ControlOpcode::try_from(buf.try_get_u8()?)?;
        let buf = &mut buf;

        let msg = match opcode {
            ControlOpcode::ConnectRequest => ControlMessage::ConnectRequest {
                tag: get_string(buf),
                protocol_version: buf.try_get_u8()?,
            },
            ControlOpcode::ServerInfoRequest => ControlMessage::ServerInfoRequest {
                tag: get_string(buf),
                protocol_version: buf.try_get_u8()?,
            },
            ControlOpcode::PlayerInfoRequest => ControlMessage::PlayerInfoRequest {
                index: buf.try_get_u8()?,
            },
            ControlOpcode::RuleInfoRequest => ControlMessage::RuleInfoRequest {
                previous: get_string(buf),
            },
            ControlOpcode::Accept => ControlMessage::Accept {
                port: buf.try_get_i32_le()?,
            },
            ControlOpcode::Reject => ControlMessage::Reject {
                reason: get_string(buf),
            },
            ControlOpcode::ServerInfoReply => ControlMessage::ServerInfoReply(ServerInfo {
                address: get_string(buf),
                name: get_string(buf),
                map: get_string(buf),
                users: buf.try_get_u8()?,
                max_users: buf.try_get_u8()?,
                protocol_version: buf.try_get_u8()?,
            }),
            ControlOpcode::PlayerInfoReply => ControlMessage::PlayerInfoReply(PlayerInfo {
                index: buf.try_get_u8()?,
                name: get_string(buf),
                colors: buf.try_get_i32_le()?,
                frags: buf.try_get_i32_le()?,
                connect_secs: buf.try_get_i32_le()?,
                address: get_string(buf),
            }),
            ControlOpcode::RuleInfoReply => {
                let name = get_string(buf);
                if name.is_empty() {
                    ControlMessage::RuleInfoReply(None)
                }
                else {
                    ControlMessage::RuleInfoReply(Some((name, get_string(buf))))
                }
            }
        };
        Ok(msg)
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Reads up to the next NUL byte or the end of the buffer, whichever comes first.
fn get_string(buf: &mut &[u8]) -> String {
    let end = buf.iter()
        .position(|&b| b == 0)
        .unwrap_or(buf.len());
    let result = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance((end + 1).min(buf.len()));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_connect_request_bytes() {
        let buf = ControlMessage::ConnectRequest { tag: "QUAKE".to_string(), protocol_version: 3 }.ser();
        assert_eq!(buf.as_ref(), &[0x80,0,0,12, 0x01, b'Q',b'U',b'A',b'K',b'E',0, 3]);
    }

    #[test]
    fn test_accept_bytes() {
        let buf = ControlMessage::Accept { port: 26001 }.ser();
        assert_eq!(buf.as_ref(), &[0x80,0,0,9, 0x81, 0x91,0x65,0,0]);
    }

    #[rstest]
    #[case::server_info_request(ControlMessage::ServerInfoRequest { tag: "QUAKE".to_string(), protocol_version: 3 })]
    #[case::player_info_request(ControlMessage::PlayerInfoRequest { index: 4 })]
    #[case::rule_info_request_first(ControlMessage::RuleInfoRequest { previous: "".to_string() })]
    #[case::reject(ControlMessage::Reject { reason: "Server is full.\n".to_string() })]
    #[case::server_info_reply(ControlMessage::ServerInfoReply(ServerInfo {
        address: "10.0.0.1:26000".to_string(),
        name: "arena".to_string(),
        map: "e1m1".to_string(),
        users: 2,
        max_users: 8,
        protocol_version: 3,
    }))]
    #[case::player_info_reply(ControlMessage::PlayerInfoReply(PlayerInfo {
        index: 1,
        name: "ranger".to_string(),
        colors: 0x4d,
        frags: -2,
        connect_secs: 300,
        address: "10.0.0.9:40001".to_string(),
    }))]
    #[case::rule_info_reply(ControlMessage::RuleInfoReply(Some(("timelimit".to_string(), "20".to_string()))))]
    #[case::rule_info_end(ControlMessage::RuleInfoReply(None))]
    fn test_ser_deser(#[case] msg: ControlMessage) {
        let buf = msg.ser();
        assert_eq!(ControlMessage::deser(&buf).unwrap(), msg);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::word_only(vec![0x80,0,0,4])]
    #[case::length_mismatch(vec![0x80,0,0,9, 0x03, 1])]
    #[case::data_flag(vec![0x80,1,0,6, 0x03, 1])]
    #[case::unknown_opcode(vec![0x80,0,0,6, 0x07, 1])]
    #[case::truncated_accept(vec![0x80,0,0,7, 0x81, 1,2])]
    #[case::truncated_request(vec![0x80,0,0,5, 0x03])]
    fn test_deser_rejects(#[case] raw: Vec<u8>) {
        assert!(ControlMessage::deser(&raw).is_err());
    }

    #[test]
    fn test_rule_info_end_bytes() {
        let buf = ControlMessage::RuleInfoReply(None).ser();
        assert_eq!(buf.as_ref(), &[0x80,0,0,5, 0x85]);
    }

    #[test]
    fn test_rule_info_end_with_empty_name() {
        let raw = [0x80,0,0,6, 0x85, 0];
        assert_eq!(ControlMessage::deser(&raw).unwrap(), ControlMessage::RuleInfoReply(None));
    }

    #[test]
    fn test_unterminated_string_at_end() {
        let raw = [0x80,0,0,8, 0x82, b'b', b'y', b'e'];
        assert_eq!(ControlMessage::deser(&raw).unwrap(), ControlMessage::Reject { reason: "bye".to_string() });
    }
}
