#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Classification of everything that can go wrong while decoding bytes received from a peer.
///
/// Reassembly code matches on this: [`ProtocolError::Incomplete`] means 'wait for more bytes',
///  everything else is a violation of the wire protocol.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ProtocolError {
    #[error("incomplete frame")]
    Incomplete,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown structure type {0}")]
    UnknownStructureType(u8),
    #[error("frame length {len} exceeds the configured maximum of {max}")]
    FrameTooLong { len: usize, max: usize },
    #[error("string of {0} bytes does not fit a u16 length prefix")]
    StringTooLong(usize),
}

/// The reason a connection was closed, reported through [`crate::events::ConnectionEvent::Closed`].
///  This is the only way errors on established connections become visible to application code.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CloseReason {
    /// closed by this side: protocol violation, keep-alive timeout, transport error
    Internal = 0,
    /// closed by application code
    ExternalForced = 1,
    /// the peer closed the connection or became unreachable
    PeerDisconnect = 2,
}

/// Callback for parts of a connection that detect a fatal condition on their own, e.g. the UDP
///  sender running out of retransmissions or a failing TCP write
#[cfg_attr(test, automock)]
pub trait CloseRequest: Send + Sync + 'static {
    fn request_close(&self, reason: CloseReason);
}
