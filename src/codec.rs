//! Packet encoding and decoding.
//!
//! Application code builds a [`sendable::SendablePacket`] with typed `put_*` calls and receives
//!  [`receivable::ReceivablePacket`]s that are read through a [`cursor::ReadCursor`]. The
//!  transports use [`frame`] to cut their byte streams into frames.

pub mod cursor;
pub mod frame;
pub mod receivable;
pub mod sendable;

/// structure type + sequence number + body length
pub const TCP_DATA_HEAD_LEN: usize = 1 + 4 + 4;
/// length prefix of a packet record in the UDP stream
pub const UDP_RECORD_HEAD_LEN: usize = 4;
pub const PROTOCOL_CODE_LEN: usize = 2;
pub const COMMAND_ID_LEN: usize = 8;
