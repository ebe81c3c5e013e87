use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::ProtocolError;

/// The one-byte tag at the start of every frame / datagram
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum StructureType {
    Data = 0,

    ConnectionTcp = 10,
    HandshakeTcp = 11,
    HandshakeTcpAck = 12,
    HandshakeTcpAckAck = 13,

    ConnectionUdp = 20,
    ConnectionUdpAck = 21,
    HandshakeUdp = 23,
    HandshakeUdpAck = 24,
    HandshakeUdpAckAck = 25,
    HandshakeUdpAckAckAck = 26,

    Ack = 29,
    KeepAlive = 30,
    KeepAliveAck = 31,

    Close = 40,
}

impl StructureType {
    pub fn parse(raw: u8) -> Result<StructureType, ProtocolError> {
        StructureType::try_from(raw)
            .map_err(|_| ProtocolError::UnknownStructureType(raw))
    }

    /// structure types that may legally appear on a TCP stream
    pub fn is_tcp(&self) -> bool {
        use StructureType::*;
        matches!(self, Data | ConnectionTcp | HandshakeTcp | HandshakeTcpAck | HandshakeTcpAckAck | KeepAlive | KeepAliveAck | Close)
    }
}

/// One transport of a connection - a connection has zero or one leg of each kind
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
}

/// The legs a server or client is configured to use
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportMode {
    Tcp,
    Udp,
    Both,
}
impl TransportMode {
    pub fn uses(&self, kind: TransportKind) -> bool {
        match self {
            TransportMode::Tcp => kind == TransportKind::Tcp,
            TransportMode::Udp => kind == TransportKind::Udp,
            TransportMode::Both => true,
        }
    }
}

/// Leg selection when sending a packet
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendRoute {
    Tcp,
    Udp,
    /// UDP if the UDP leg has completed its handshake, TCP otherwise
    Auto,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::data(0, Ok(StructureType::Data))]
    #[case::handshake_tcp(11, Ok(StructureType::HandshakeTcp))]
    #[case::ack(29, Ok(StructureType::Ack))]
    #[case::close(40, Ok(StructureType::Close))]
    #[case::gap(22, Err(ProtocolError::UnknownStructureType(22)))]
    #[case::high(255, Err(ProtocolError::UnknownStructureType(255)))]
    fn test_parse(#[case] raw: u8, #[case] expected: Result<StructureType, ProtocolError>) {
        assert_eq!(StructureType::parse(raw), expected);
    }

    #[rstest]
    #[case::data(StructureType::Data, true)]
    #[case::keep_alive(StructureType::KeepAlive, true)]
    #[case::udp_handshake(StructureType::HandshakeUdp, false)]
    #[case::ack(StructureType::Ack, false)]
    fn test_is_tcp(#[case] tag: StructureType, #[case] expected: bool) {
        assert_eq!(tag.is_tcp(), expected);
    }

    #[rstest]
    #[case::tcp(TransportMode::Tcp, true, false)]
    #[case::udp(TransportMode::Udp, false, true)]
    #[case::both(TransportMode::Both, true, true)]
    fn test_mode_uses(#[case] mode: TransportMode, #[case] tcp: bool, #[case] udp: bool) {
        assert_eq!(mode.uses(TransportKind::Tcp), tcp);
        assert_eq!(mode.uses(TransportKind::Udp), udp);
    }
}
