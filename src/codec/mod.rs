//! MQTT packet codec
//!
//! Encoding and decoding for the MQTT v3.1.1 client subset the bridge
//! speaks. The decoder is incremental: feed it a buffer, it returns the
//! first complete packet plus the number of bytes consumed.

#[cfg(test)]
mod tests;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::{
    ConnAck, Connect, DecodeError, EncodeError, Packet, PacketType, PubAck, Publish, QoS, SubAck,
    Subscribe, Unsubscribe, UnsubAck, PROTOCOL_LEVEL,
};

/// Maximum remaining length (268,435,455 bytes = ~256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Read a Variable Byte Integer from buffer.
/// Returns (value, bytes_consumed) or error.
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;
    let mut pos = 0;

    loop {
        if pos >= buf.len() {
            return Err(DecodeError::InsufficientData);
        }
        if pos >= 4 {
            return Err(DecodeError::InvalidRemainingLength);
        }

        let byte = buf[pos];
        value += ((byte & 0x7F) as u32) * multiplier;
        pos += 1;

        if (byte & 0x80) == 0 {
            break;
        }

        multiplier *= 128;
    }

    Ok((value, pos))
}

/// Write a Variable Byte Integer to buffer.
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<(), EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    if s.len() > u16::MAX as usize {
        return Err(EncodeError::StringTooLong);
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn read_string(buf: &mut Bytes) -> Result<String, DecodeError> {
    if buf.remaining() < 2 {
        return Err(DecodeError::MalformedPacket("truncated string length"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(DecodeError::MalformedPacket("truncated string body"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}

/// MQTT packet encoder
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet into `buf` (fixed header + body).
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        let flags = self.encode_body(packet, &mut body)?;

        buf.put_u8((packet.packet_type() << 4) | flags);
        write_variable_int(buf, body.len() as u32)?;
        buf.put_slice(&body);
        Ok(())
    }

    /// Encode the variable header + payload, returning the fixed-header flags.
    fn encode_body(&self, packet: &Packet, buf: &mut BytesMut) -> Result<u8, EncodeError> {
        match packet {
            Packet::Connect(c) => {
                write_string(buf, "MQTT")?;
                buf.put_u8(PROTOCOL_LEVEL);

                let mut connect_flags = 0u8;
                if c.clean_session {
                    connect_flags |= 0x02;
                }
                if c.password.is_some() {
                    connect_flags |= 0x40;
                }
                if c.username.is_some() {
                    connect_flags |= 0x80;
                }
                buf.put_u8(connect_flags);
                buf.put_u16(c.keep_alive);

                write_string(buf, &c.client_id)?;
                if let Some(ref username) = c.username {
                    write_string(buf, username)?;
                }
                if let Some(ref password) = c.password {
                    if password.len() > u16::MAX as usize {
                        return Err(EncodeError::StringTooLong);
                    }
                    buf.put_u16(password.len() as u16);
                    buf.put_slice(password);
                }
                Ok(0)
            }
            Packet::ConnAck(a) => {
                buf.put_u8(a.session_present as u8);
                buf.put_u8(a.return_code);
                Ok(0)
            }
            Packet::Publish(p) => {
                if p.topic.is_empty() || p.topic.contains(['#', '+']) {
                    return Err(EncodeError::InvalidTopicName);
                }
                write_string(buf, &p.topic)?;
                if p.qos != QoS::AtMostOnce {
                    buf.put_u16(p.packet_id.unwrap_or(0));
                }
                buf.put_slice(&p.payload);

                let mut flags = (p.qos as u8) << 1;
                if p.dup {
                    flags |= 0x08;
                }
                if p.retain {
                    flags |= 0x01;
                }
                Ok(flags)
            }
            Packet::PubAck(a) => {
                buf.put_u16(a.packet_id);
                Ok(0)
            }
            Packet::Subscribe(s) => {
                buf.put_u16(s.packet_id);
                for sub in &s.subscriptions {
                    write_string(buf, &sub.filter)?;
                    buf.put_u8(sub.qos as u8);
                }
                // SUBSCRIBE requires fixed-header flags 0b0010
                Ok(0x02)
            }
            Packet::SubAck(a) => {
                buf.put_u16(a.packet_id);
                for code in &a.return_codes {
                    buf.put_u8(*code);
                }
                Ok(0)
            }
            Packet::Unsubscribe(u) => {
                buf.put_u16(u.packet_id);
                for filter in &u.filters {
                    write_string(buf, filter)?;
                }
                Ok(0x02)
            }
            Packet::UnsubAck(a) => {
                buf.put_u16(a.packet_id);
                Ok(0)
            }
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => Ok(0),
        }
    }
}

/// MQTT packet decoder
#[derive(Debug, Default)]
pub struct Decoder;

impl Decoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode the first complete packet in `buf`.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial packet;
    /// callers keep the bytes and retry after the next read.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first = buf[0];
        let packet_type =
            PacketType::from_u8(first >> 4).ok_or(DecodeError::InvalidPacketType(first >> 4))?;

        let (remaining_len, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(v) => v,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        let total = 1 + len_bytes + remaining_len as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let mut body = Bytes::copy_from_slice(&buf[1 + len_bytes..total]);
        let packet = self.decode_body(packet_type, first & 0x0F, &mut body)?;
        Ok(Some((packet, total)))
    }

    fn decode_body(
        &self,
        packet_type: PacketType,
        flags: u8,
        body: &mut Bytes,
    ) -> Result<Packet, DecodeError> {
        match packet_type {
            PacketType::Connect => {
                let _protocol_name = read_string(body)?;
                if body.remaining() < 4 {
                    return Err(DecodeError::MalformedPacket("truncated CONNECT header"));
                }
                let _level = body.get_u8();
                let connect_flags = body.get_u8();
                let keep_alive = body.get_u16();
                let client_id = read_string(body)?;

                let username = if connect_flags & 0x80 != 0 {
                    Some(read_string(body)?)
                } else {
                    None
                };
                let password = if connect_flags & 0x40 != 0 {
                    if body.remaining() < 2 {
                        return Err(DecodeError::MalformedPacket("truncated password"));
                    }
                    let len = body.get_u16() as usize;
                    if body.remaining() < len {
                        return Err(DecodeError::MalformedPacket("truncated password"));
                    }
                    Some(body.split_to(len))
                } else {
                    None
                };

                Ok(Packet::Connect(Connect {
                    client_id,
                    clean_session: connect_flags & 0x02 != 0,
                    keep_alive,
                    username,
                    password,
                }))
            }
            PacketType::ConnAck => {
                if body.remaining() < 2 {
                    return Err(DecodeError::MalformedPacket("truncated CONNACK"));
                }
                let ack_flags = body.get_u8();
                let return_code = body.get_u8();
                Ok(Packet::ConnAck(ConnAck {
                    session_present: ack_flags & 0x01 != 0,
                    return_code,
                }))
            }
            PacketType::Publish => {
                let qos_bits = (flags >> 1) & 0x03;
                let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
                let topic = read_string(body)?;
                let packet_id = if qos != QoS::AtMostOnce {
                    if body.remaining() < 2 {
                        return Err(DecodeError::MalformedPacket("truncated packet id"));
                    }
                    Some(body.get_u16())
                } else {
                    None
                };

                Ok(Packet::Publish(Publish {
                    dup: flags & 0x08 != 0,
                    qos,
                    retain: flags & 0x01 != 0,
                    topic,
                    packet_id,
                    payload: body.split_to(body.remaining()),
                }))
            }
            PacketType::PubAck => {
                if body.remaining() < 2 {
                    return Err(DecodeError::MalformedPacket("truncated PUBACK"));
                }
                Ok(Packet::PubAck(PubAck {
                    packet_id: body.get_u16(),
                }))
            }
            PacketType::Subscribe => {
                if flags != 0x02 {
                    return Err(DecodeError::InvalidFlags);
                }
                if body.remaining() < 2 {
                    return Err(DecodeError::MalformedPacket("truncated SUBSCRIBE"));
                }
                let packet_id = body.get_u16();
                let mut subscriptions = Vec::new();
                while body.has_remaining() {
                    let filter = read_string(body)?;
                    if !body.has_remaining() {
                        return Err(DecodeError::MalformedPacket("missing subscription QoS"));
                    }
                    let qos_byte = body.get_u8();
                    let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;
                    subscriptions.push(crate::protocol::Subscription { filter, qos });
                }
                if subscriptions.is_empty() {
                    return Err(DecodeError::MalformedPacket("empty SUBSCRIBE"));
                }
                Ok(Packet::Subscribe(Subscribe {
                    packet_id,
                    subscriptions,
                }))
            }
            PacketType::SubAck => {
                if body.remaining() < 2 {
                    return Err(DecodeError::MalformedPacket("truncated SUBACK"));
                }
                let packet_id = body.get_u16();
                let return_codes = body.split_to(body.remaining()).to_vec();
                Ok(Packet::SubAck(SubAck {
                    packet_id,
                    return_codes,
                }))
            }
            PacketType::Unsubscribe => {
                if flags != 0x02 {
                    return Err(DecodeError::InvalidFlags);
                }
                if body.remaining() < 2 {
                    return Err(DecodeError::MalformedPacket("truncated UNSUBSCRIBE"));
                }
                let packet_id = body.get_u16();
                let mut filters = Vec::new();
                while body.has_remaining() {
                    filters.push(read_string(body)?);
                }
                Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
            }
            PacketType::UnsubAck => {
                if body.remaining() < 2 {
                    return Err(DecodeError::MalformedPacket("truncated UNSUBACK"));
                }
                Ok(Packet::UnsubAck(UnsubAck {
                    packet_id: body.get_u16(),
                }))
            }
            PacketType::PingReq => Ok(Packet::PingReq),
            PacketType::PingResp => Ok(Packet::PingResp),
            PacketType::Disconnect => Ok(Packet::Disconnect),
        }
    }
}
