use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::key_exchange::PUBLIC_KEY_LEN;
use crate::crypto::{PacketCipher, Trailer, TRAILER_LEN};
use crate::error::ProtocolError;
use crate::handshake::{deser_public_key, ser_public_key, HandshakeMode};
use crate::registry::ConnectionIdentity;
use crate::structure_type::StructureType;
use crate::util::buf_ext::BufExt;

/// structure type, connection id, check code
pub const UDP_HEADER_LEN: usize = 1 + 4 + 4;
/// UDP header + sequence number
pub const UDP_DATA_HEADER_LEN: usize = UDP_HEADER_LEN + 4;

/// A parsed UDP datagram. Encrypted parts (DATA fragments, ACK payloads) are returned as they
///  were received: decryption needs the connection's key, so it happens after routing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UdpMessage {
    ConnectionRequest,
    ConnectionAck { identity: ConnectionIdentity },
    Handshake { identity: ConnectionIdentity, mode: HandshakeMode, trailer: Option<Trailer> },
    HandshakeAck { identity: ConnectionIdentity, mode: HandshakeMode, public_key: Option<[u8; PUBLIC_KEY_LEN]> },
    HandshakeAckAck { identity: ConnectionIdentity, mode: HandshakeMode, sealed_seed: Bytes },
    HandshakeAckAckAck { identity: ConnectionIdentity },
    Data { identity: ConnectionIdentity, sequence: u32, fragment: BytesMut, trailer: Option<Trailer> },
    Ack { identity: ConnectionIdentity, payload: [u8; 4], trailer: Option<Trailer> },
    KeepAlive { identity: ConnectionIdentity },
    KeepAliveAck { identity: ConnectionIdentity },
    Close { identity: ConnectionIdentity },
}

impl UdpMessage {
    pub fn identity(&self) -> Option<ConnectionIdentity> {
        use UdpMessage::*;
        match self {
            ConnectionRequest => None,
            ConnectionAck { identity } |
            Handshake { identity, .. } |
            HandshakeAck { identity, .. } |
            HandshakeAckAck { identity, .. } |
            HandshakeAckAckAck { identity } |
            Data { identity, .. } |
            Ack { identity, .. } |
            KeepAlive { identity } |
            KeepAliveAck { identity } |
            Close { identity } => Some(*identity),
        }
    }

    /// `crypto` determines whether DATA, ACK and via-TCP handshake datagrams carry a trailer
    pub fn deser(mut buf: BytesMut, crypto: bool) -> Result<UdpMessage, ProtocolError> {
        let tag = StructureType::parse(buf.try_get_u8()?)?;
        if tag == StructureType::ConnectionUdp {
            return Ok(UdpMessage::ConnectionRequest);
        }

        let identity = ConnectionIdentity {
            connection_id: buf.try_get_u32_le()?,
            check_code: buf.try_get_u32_le()?,
        };

        let result = match tag {
            StructureType::ConnectionUdpAck => UdpMessage::ConnectionAck { identity },
            StructureType::HandshakeUdp => {
                let mode = HandshakeMode::parse(buf.try_get_u8()?)?;
                let trailer = if crypto && mode == HandshakeMode::ViaTcp {
                    Some(read_trailer(&mut buf)?)
                }
                else {
                    None
                };
                UdpMessage::Handshake { identity, mode, trailer }
            }
            StructureType::HandshakeUdpAck => {
                let mode = HandshakeMode::parse(buf.try_get_u8()?)?;
                let public_key = match mode {
                    HandshakeMode::SelfHandshake => Some(deser_public_key(&mut buf)?),
                    HandshakeMode::ViaTcp => None,
                };
                UdpMessage::HandshakeAck { identity, mode, public_key }
            }
            StructureType::HandshakeUdpAckAck => {
                let mode = HandshakeMode::parse(buf.try_get_u8()?)?;
                UdpMessage::HandshakeAckAck { identity, mode, sealed_seed: buf.split().freeze() }
            }
            StructureType::HandshakeUdpAckAckAck => UdpMessage::HandshakeAckAckAck { identity },
            StructureType::Data => {
                let sequence = buf.try_get_u32_le()?;
                let trailer = split_trailer(&mut buf, crypto)?;
                UdpMessage::Data { identity, sequence, fragment: buf, trailer }
            }
            StructureType::Ack => {
                let mut payload = [0u8; 4];
                if buf.remaining() < payload.len() {
                    return Err(ProtocolError::Incomplete);
                }
                buf.copy_to_slice(&mut payload);
                let trailer = if crypto { Some(read_trailer(&mut buf)?) } else { None };
                UdpMessage::Ack { identity, payload, trailer }
            }
            StructureType::KeepAlive => UdpMessage::KeepAlive { identity },
            StructureType::KeepAliveAck => UdpMessage::KeepAliveAck { identity },
            StructureType::Close => UdpMessage::Close { identity },
            other => return Err(ProtocolError::Malformed(format!("{:?} is not valid in a UDP datagram", other))),
        };
        Ok(result)
    }
}

fn read_trailer(buf: &mut BytesMut) -> Result<Trailer, ProtocolError> {
    if buf.remaining() < TRAILER_LEN {
        return Err(ProtocolError::Incomplete);
    }
    let mut trailer = [0u8; TRAILER_LEN];
    buf.copy_to_slice(&mut trailer);
    Ok(trailer)
}

/// removes the trailer from the end of `buf`
fn split_trailer(buf: &mut BytesMut, crypto: bool) -> Result<Option<Trailer>, ProtocolError> {
    if !crypto {
        return Ok(None);
    }
    if buf.len() < TRAILER_LEN {
        return Err(ProtocolError::Incomplete);
    }
    let raw = buf.split_off(buf.len() - TRAILER_LEN);
    let mut trailer = [0u8; TRAILER_LEN];
    trailer.copy_from_slice(&raw);
    Ok(Some(trailer))
}

fn ser_header(buf: &mut BytesMut, tag: StructureType, identity: ConnectionIdentity) {
    buf.put_u8(tag.into());
    buf.put_u32_le(identity.connection_id);
    buf.put_u32_le(identity.check_code);
}

pub fn ser_connection_request() -> Bytes {
    Bytes::from_static(&[StructureType::ConnectionUdp as u8])
}

/// datagrams that consist of nothing but the UDP header
pub fn ser_header_only(tag: StructureType, identity: ConnectionIdentity) -> Bytes {
    let mut buf = BytesMut::with_capacity(UDP_HEADER_LEN);
    ser_header(&mut buf, tag, identity);
    buf.freeze()
}

/// In 'via TCP' mode, the datagram proves knowledge of the TCP leg's key through a trailer over
///  an empty body
pub fn ser_handshake(identity: ConnectionIdentity, mode: HandshakeMode, cipher: Option<&PacketCipher>) -> Bytes {
    let mut buf = BytesMut::with_capacity(UDP_HEADER_LEN + 1 + TRAILER_LEN);
    ser_header(&mut buf, StructureType::HandshakeUdp, identity);
    buf.put_u8(mode.into());
    if mode == HandshakeMode::ViaTcp {
        if let Some(cipher) = cipher {
            buf.put_slice(&cipher.encrypt(StructureType::HandshakeUdp, 0, &mut [0u8; 0]));
        }
    }
    buf.freeze()
}

pub fn ser_handshake_ack(identity: ConnectionIdentity, mode: HandshakeMode, public_key: Option<&[u8; PUBLIC_KEY_LEN]>) -> Bytes {
    let mut buf = BytesMut::with_capacity(UDP_HEADER_LEN + 1 + 4 + PUBLIC_KEY_LEN);
    ser_header(&mut buf, StructureType::HandshakeUdpAck, identity);
    buf.put_u8(mode.into());
    if let Some(public_key) = public_key {
        ser_public_key(&mut buf, public_key);
    }
    buf.freeze()
}

pub fn ser_handshake_ack_ack(identity: ConnectionIdentity, sealed_seed: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(UDP_HEADER_LEN + 1 + sealed_seed.len());
    ser_header(&mut buf, StructureType::HandshakeUdpAckAck, identity);
    buf.put_u8(HandshakeMode::SelfHandshake.into());
    buf.put_slice(sealed_seed);
    buf.freeze()
}

/// A DATA datagram carrying one fragment of the connection's UDP stream
pub fn ser_data(identity: ConnectionIdentity, sequence: u32, fragment: &[u8], cipher: Option<&PacketCipher>) -> Bytes {
    let mut buf = BytesMut::with_capacity(UDP_DATA_HEADER_LEN + fragment.len() + TRAILER_LEN);
    ser_header(&mut buf, StructureType::Data, identity);
    buf.put_u32_le(sequence);
    buf.put_slice(fragment);
    if let Some(cipher) = cipher {
        let trailer = cipher.encrypt(StructureType::Data, sequence, &mut buf[UDP_DATA_HEADER_LEN..]);
        buf.put_slice(&trailer);
    }
    buf.freeze()
}

pub fn ser_ack(identity: ConnectionIdentity, acked_sequence: u32, cipher: Option<&PacketCipher>) -> Bytes {
    let mut buf = BytesMut::with_capacity(UDP_HEADER_LEN + 4 + TRAILER_LEN);
    ser_header(&mut buf, StructureType::Ack, identity);
    buf.put_u32_le(acked_sequence);
    if let Some(cipher) = cipher {
        let trailer = cipher.encrypt(StructureType::Ack, 0, &mut buf[UDP_HEADER_LEN..]);
        buf.put_slice(&trailer);
    }
    buf.freeze()
}

/// Decrypts and verifies the payload of an ACK, returning the acknowledged sequence number
pub fn open_ack(mut payload: [u8; 4], trailer: Option<Trailer>, cipher: Option<&PacketCipher>) -> Option<u32> {
    match (cipher, trailer) {
        (Some(cipher), Some(trailer)) => {
            if !cipher.decrypt_and_verify(StructureType::Ack, 0, &mut payload, &trailer) {
                return None;
            }
        }
        (None, None) => {}
        _ => return None,
    }
    Some(u32::from_le_bytes(payload))
}
