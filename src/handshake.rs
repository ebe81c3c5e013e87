//! Handshake state per leg, and the messages exchanged during handshakes.
//!
//! TCP handshake (the server is the responder):
//! ```ascii
//! server                                client
//!   | -- HANDSHAKE_TCP (id, check, pk) --> |   KeyExchangeSent
//!   | <-- HANDSHAKE_TCP_ACK (seed) ------- |   KeyInstalled
//!   | -- HANDSHAKE_TCP_ACK_ACK ----------> |   Ready (server), then Ready (client)
//! ```
//!
//! A UDP leg either piggybacks on a completed TCP handshake (HANDSHAKE_UDP in 'via TCP' mode
//!  carries id and check code, the TCP key is reused), or it performs a handshake of its own:
//!  CONNECTION_UDP / _ACK to get an identity, HANDSHAKE_UDP / _ACK to transport the server's
//!  public key, and HANDSHAKE_UDP_ACK_ACK / _ACK_ACK_ACK for the seed.

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::crypto::key_exchange::{parse_public_key, PUBLIC_KEY_LEN};
use crate::error::ProtocolError;
use crate::registry::ConnectionIdentity;
use crate::structure_type::StructureType;
use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LegState {
    Idle,
    /// the responder sent its public key / the initiator asked for an identity
    KeyExchangeSent,
    /// the initiator sent its seed and uses the derived key
    KeyInstalled,
    Ready,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum HandshakeMode {
    SelfHandshake = 0,
    ViaTcp = 1,
}

impl HandshakeMode {
    pub fn parse(raw: u8) -> Result<HandshakeMode, ProtocolError> {
        HandshakeMode::try_from(raw)
            .map_err(|_| ProtocolError::Malformed(format!("invalid handshake mode {}", raw)))
    }
}

/// The responder's identity assignment and public key, body of HANDSHAKE_TCP
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KeyOffer {
    pub identity: ConnectionIdentity,
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

impl KeyOffer {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.identity.connection_id);
        buf.put_u32_le(self.identity.check_code);
        ser_public_key(buf, &self.public_key);
    }

    pub fn deser(buf: &mut impl bytes::Buf) -> Result<KeyOffer, ProtocolError> {
        let connection_id = buf.try_get_u32_le()?;
        let check_code = buf.try_get_u32_le()?;
        let public_key = deser_public_key(buf)?;
        Ok(KeyOffer {
            identity: ConnectionIdentity { connection_id, check_code },
            public_key,
        })
    }
}

pub fn ser_public_key(buf: &mut BytesMut, public_key: &[u8; PUBLIC_KEY_LEN]) {
    buf.put_u32_le(public_key.len().prechecked_cast());
    buf.put_slice(public_key);
}

pub fn deser_public_key(buf: &mut impl bytes::Buf) -> Result<[u8; PUBLIC_KEY_LEN], ProtocolError> {
    let len: usize = buf.try_get_u32_le()?.safe_cast();
    if len != PUBLIC_KEY_LEN {
        return Err(ProtocolError::Malformed(format!("public key with length {}", len)));
    }
    let raw = buf.try_get_bytes(len)?;
    parse_public_key(&raw)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// `structure type, body length, body` - the framing of HANDSHAKE_TCP and HANDSHAKE_TCP_ACK
pub fn tcp_handshake_frame(tag: StructureType, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 4 + body.len());
    buf.put_u8(tag.into());
    buf.put_u32_le(body.len().prechecked_cast());
    buf.put_slice(body);
    buf.freeze()
}
