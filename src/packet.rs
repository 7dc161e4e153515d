use crate::error::{Error, Result};
use crate::packet_id::{MessageId, PacketId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::net::{IpAddr, Ipv6Addr};

/// UDT data packets carry four header words before the payload.
pub const DATA_HEADER_LEN: usize = 16;

const CONTROL_FLAG: u32 = 0x8000_0000;
const SEQ_MASK: u32 = 0x7FFF_FFFF;
const MSG_ID_MASK: u32 = 0x1FFF_FFFF;
const RANGE_FLAG: u32 = 0x8000_0000;

/// Control packet type tags (bit 15 of the first header word set).
#[derive(TryFromPrimitive, IntoPrimitive, Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u16)]
enum ControlType {
    Handshake = 0x0000,
    KeepAlive = 0x0001,
    Ack = 0x0002,
    Nak = 0x0003,
    Congestion = 0x0004,
    Shutdown = 0x0005,
    Ack2 = 0x0006,
    MsgDropRequest = 0x0007,
    UserDefined = 0x7FFF,
}

/// Position of a data packet within a datagram-mode message.
#[derive(TryFromPrimitive, IntoPrimitive, Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum MessageBoundary {
    Middle = 0b00,
    Last = 0b01,
    First = 0b10,
    Only = 0b11,
}

/// Socket type negotiated in the handshake; peers must match.
#[derive(TryFromPrimitive, IntoPrimitive, Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u32)]
pub enum SocketMode {
    Stream = 0,
    Datagram = 1,
}

/// Handshake request-type discriminator.
#[derive(TryFromPrimitive, IntoPrimitive, Copy, Clone, Eq, PartialEq, Debug)]
#[repr(i32)]
pub enum HandshakeReqType {
    Request = 1,
    Rendezvous = 0,
    Response = -1,
    Response2 = -2,
    Refused = 1000,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DataPacket {
    pub seq: PacketId,
    pub boundary: MessageBoundary,
    pub in_order: bool,
    pub message_id: MessageId,
    pub timestamp: u32,
    pub dst_conn_id: u32,
    pub payload: Bytes,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct HandshakeInfo {
    pub udt_version: u32,
    pub mode: SocketMode,
    pub init_seq: PacketId,
    pub max_packet_size: u32,
    pub max_flow_window: u32,
    pub req_type: HandshakeReqType,
    pub conn_id: u32,
    pub syn_cookie: u32,
    pub peer_addr: IpAddr,
}

/// Telemetry block of a full ACK.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct AckTelemetry {
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    pub avail_buf_pkts: u32,
    pub arrival_rate: u32,
    pub bandwidth: u32,
}

/// An inclusive range of lost sequence numbers, as carried in a NAK.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct LossRange {
    pub first: PacketId,
    pub last: PacketId,
}

impl LossRange {
    pub fn single(id: PacketId) -> LossRange {
        LossRange { first: id, last: id }
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ControlKind {
    Handshake(HandshakeInfo),
    KeepAlive,
    Ack {
        ack_seq_no: u32,
        recv_next: PacketId,
        telemetry: AckTelemetry,
    },
    LightAck {
        recv_next: PacketId,
    },
    Ack2 {
        ack_seq_no: u32,
    },
    Nak {
        loss: Vec<LossRange>,
    },
    Congestion,
    Shutdown,
    MsgDropRequest {
        message_id: MessageId,
        first: PacketId,
        last: PacketId,
    },
    /// Preserved verbatim for the congestion controller.
    UserDefined {
        subtype: u16,
        info: u32,
        payload: Bytes,
    },
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ControlPacket {
    pub timestamp: u32,
    pub dst_conn_id: u32,
    pub kind: ControlKind,
}

/// One UDT packet, data or control. Every packet names a destination
///  connection id and carries a timestamp in µs since the source connection
///  was created; both are stamped by the multiplexer write loop just before
///  the datagram goes out.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Packet {
    Data(DataPacket),
    Control(ControlPacket),
}

impl Packet {
    pub fn control(kind: ControlKind) -> Packet {
        Packet::Control(ControlPacket { timestamp: 0, dst_conn_id: 0, kind })
    }

    pub fn dst_conn_id(&self) -> u32 {
        match self {
            Packet::Data(d) => d.dst_conn_id,
            Packet::Control(c) => c.dst_conn_id,
        }
    }

    pub fn stamp(&mut self, dst_conn_id: u32, timestamp: u32) {
        match self {
            Packet::Data(d) => {
                d.dst_conn_id = dst_conn_id;
                d.timestamp = timestamp;
            }
            Packet::Control(c) => {
                c.dst_conn_id = dst_conn_id;
                c.timestamp = timestamp;
            }
        }
    }

    /// Control packets the receiver engine hands over to the sender engine.
    pub fn is_sender_bound(&self) -> bool {
        matches!(
            self,
            Packet::Control(ControlPacket {
                kind: ControlKind::Ack { .. }
                    | ControlKind::LightAck { .. }
                    | ControlKind::Nak { .. }
                    | ControlKind::Congestion,
                ..
            })
        )
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Packet::Data(d) => {
                buf.put_u32(d.seq.to_raw() & SEQ_MASK);
                let boundary: u8 = d.boundary.into();
                buf.put_u32(
                    ((boundary as u32) << 30)
                        | ((d.in_order as u32) << 29)
                        | (d.message_id.to_raw() & MSG_ID_MASK),
                );
                buf.put_u32(d.timestamp);
                buf.put_u32(d.dst_conn_id);
                buf.put_slice(&d.payload);
            }
            Packet::Control(c) => c.encode(buf),
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Packet> {
        let w0 = buf.try_get_u32().map_err(|_| Error::Malformed("short header"))?;
        if w0 & CONTROL_FLAG == 0 {
            let w1 = buf.try_get_u32().map_err(|_| Error::Malformed("short data header"))?;
            let timestamp = buf.try_get_u32().map_err(|_| Error::Malformed("short data header"))?;
            let dst_conn_id = buf.try_get_u32().map_err(|_| Error::Malformed("short data header"))?;
            let boundary = MessageBoundary::try_from(((w1 >> 30) & 0b11) as u8)
                .expect("two bits cover all boundary variants");
            return Ok(Packet::Data(DataPacket {
                seq: PacketId::from_raw(w0),
                boundary,
                in_order: (w1 >> 29) & 1 == 1,
                message_id: MessageId::from_raw(w1 & MSG_ID_MASK),
                timestamp,
                dst_conn_id,
                payload: buf.copy_to_bytes(buf.remaining()),
            }));
        }

        let type_tag = ((w0 >> 16) & 0x7FFF) as u16;
        let reserved = (w0 & 0xFFFF) as u16;
        let info = buf.try_get_u32().map_err(|_| Error::Malformed("short control header"))?;
        let timestamp = buf.try_get_u32().map_err(|_| Error::Malformed("short control header"))?;
        let dst_conn_id = buf.try_get_u32().map_err(|_| Error::Malformed("short control header"))?;

        let control_type =
            ControlType::try_from(type_tag).map_err(|_| Error::Malformed("unknown control type"))?;

        let kind = match control_type {
            ControlType::Handshake => ControlKind::Handshake(HandshakeInfo::decode(buf)?),
            ControlType::KeepAlive => ControlKind::KeepAlive,
            ControlType::Ack => Self::decode_ack(info, buf)?,
            ControlType::Nak => ControlKind::Nak { loss: Self::decode_loss_list(buf)? },
            ControlType::Congestion => ControlKind::Congestion,
            ControlType::Shutdown => ControlKind::Shutdown,
            ControlType::Ack2 => ControlKind::Ack2 { ack_seq_no: info },
            ControlType::MsgDropRequest => {
                let first = buf.try_get_u32().map_err(|_| Error::Malformed("short drop request"))?;
                let last = buf.try_get_u32().map_err(|_| Error::Malformed("short drop request"))?;
                ControlKind::MsgDropRequest {
                    message_id: MessageId::from_raw(info),
                    first: PacketId::from_raw(first),
                    last: PacketId::from_raw(last),
                }
            }
            ControlType::UserDefined => ControlKind::UserDefined {
                subtype: reserved,
                info,
                payload: buf.copy_to_bytes(buf.remaining()),
            },
        };

        Ok(Packet::Control(ControlPacket { timestamp, dst_conn_id, kind }))
    }

    fn decode_ack(info: u32, buf: &mut impl Buf) -> Result<ControlKind> {
        let recv_next = buf.try_get_u32().map_err(|_| Error::Malformed("short ack"))?;
        let recv_next = PacketId::from_raw(recv_next);
        if buf.remaining() == 0 {
            return Ok(ControlKind::LightAck { recv_next });
        }
        let mut word = || buf.try_get_u32().map_err(|_| Error::Malformed("short full ack"));
        Ok(ControlKind::Ack {
            ack_seq_no: info,
            recv_next,
            telemetry: AckTelemetry {
                rtt_us: word()?,
                rtt_var_us: word()?,
                avail_buf_pkts: word()?,
                arrival_rate: word()?,
                bandwidth: word()?,
            },
        })
    }

    fn decode_loss_list(buf: &mut impl Buf) -> Result<Vec<LossRange>> {
        let mut loss = Vec::new();
        while buf.remaining() > 0 {
            let entry = buf.try_get_u32().map_err(|_| Error::Malformed("short nak entry"))?;
            if entry & RANGE_FLAG != 0 {
                let last = buf.try_get_u32().map_err(|_| Error::Malformed("nak range without end"))?;
                loss.push(LossRange {
                    first: PacketId::from_raw(entry & SEQ_MASK),
                    last: PacketId::from_raw(last),
                });
            } else {
                loss.push(LossRange::single(PacketId::from_raw(entry)));
            }
        }
        if loss.is_empty() {
            return Err(Error::Malformed("empty nak"));
        }
        Ok(loss)
    }
}

impl ControlPacket {
    fn encode(&self, buf: &mut BytesMut) {
        let (control_type, reserved, info) = match &self.kind {
            ControlKind::Handshake(_) => (ControlType::Handshake, 0, 0),
            ControlKind::KeepAlive => (ControlType::KeepAlive, 0, 0),
            ControlKind::Ack { ack_seq_no, .. } => (ControlType::Ack, 0, *ack_seq_no),
            ControlKind::LightAck { .. } => (ControlType::Ack, 0, 0),
            ControlKind::Ack2 { ack_seq_no } => (ControlType::Ack2, 0, *ack_seq_no),
            ControlKind::Nak { .. } => (ControlType::Nak, 0, 0),
            ControlKind::Congestion => (ControlType::Congestion, 0, 0),
            ControlKind::Shutdown => (ControlType::Shutdown, 0, 0),
            ControlKind::MsgDropRequest { message_id, .. } => {
                (ControlType::MsgDropRequest, 0, message_id.to_raw())
            }
            ControlKind::UserDefined { subtype, info, .. } => {
                (ControlType::UserDefined, *subtype, *info)
            }
        };

        let type_tag: u16 = control_type.into();
        buf.put_u32(CONTROL_FLAG | ((type_tag as u32) << 16) | reserved as u32);
        buf.put_u32(info);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.dst_conn_id);

        match &self.kind {
            ControlKind::Handshake(hs) => hs.encode(buf),
            ControlKind::Ack { recv_next, telemetry, .. } => {
                buf.put_u32(recv_next.to_raw());
                buf.put_u32(telemetry.rtt_us);
                buf.put_u32(telemetry.rtt_var_us);
                buf.put_u32(telemetry.avail_buf_pkts);
                buf.put_u32(telemetry.arrival_rate);
                buf.put_u32(telemetry.bandwidth);
            }
            ControlKind::LightAck { recv_next } => buf.put_u32(recv_next.to_raw()),
            ControlKind::Nak { loss } => {
                for range in loss {
                    if range.first == range.last {
                        buf.put_u32(range.first.to_raw());
                    } else {
                        buf.put_u32(range.first.to_raw() | RANGE_FLAG);
                        buf.put_u32(range.last.to_raw());
                    }
                }
            }
            ControlKind::MsgDropRequest { first, last, .. } => {
                buf.put_u32(first.to_raw());
                buf.put_u32(last.to_raw());
            }
            ControlKind::UserDefined { payload, .. } => buf.put_slice(payload),
            ControlKind::KeepAlive
            | ControlKind::Ack2 { .. }
            | ControlKind::Congestion
            | ControlKind::Shutdown => {}
        }
    }
}

impl HandshakeInfo {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.udt_version);
        buf.put_u32(self.mode.into());
        buf.put_u32(self.init_seq.to_raw());
        buf.put_u32(self.max_packet_size);
        buf.put_u32(self.max_flow_window);
        let req_type: i32 = self.req_type.into();
        buf.put_i32(req_type);
        buf.put_u32(self.conn_id);
        buf.put_u32(self.syn_cookie);
        let mapped = match self.peer_addr {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        buf.put_slice(&mapped.octets());
    }

    fn decode(buf: &mut impl Buf) -> Result<HandshakeInfo> {
        let mut word = || buf.try_get_u32().map_err(|_| Error::Malformed("short handshake"));
        let udt_version = word()?;
        let mode = SocketMode::try_from(word()?)
            .map_err(|_| Error::Malformed("handshake socket type is neither stream nor datagram"))?;
        let init_seq = PacketId::from_raw(word()?);
        let max_packet_size = word()?;
        let max_flow_window = word()?;
        let req_type = HandshakeReqType::try_from(word()? as i32)
            .map_err(|_| Error::Malformed("unknown handshake request type"))?;
        let conn_id = word()?;
        let syn_cookie = word()?;

        let mut octets = [0u8; 16];
        if buf.remaining() < 16 {
            return Err(Error::Malformed("short handshake address"));
        }
        buf.copy_to_slice(&mut octets);
        let v6 = Ipv6Addr::from(octets);
        let peer_addr = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };

        Ok(HandshakeInfo {
            udt_version,
            mode,
            init_seq,
            max_packet_size,
            max_flow_window,
            req_type,
            conn_id,
            syn_cookie,
            peer_addr,
        })
    }
}
