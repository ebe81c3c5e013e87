use bytes::{Buf, Bytes, BytesMut};

use crate::crypto::{Trailer, TRAILER_LEN};
use crate::error::ProtocolError;
use crate::structure_type::StructureType;
use crate::util::safe_converter::SafeCast;

/// A complete frame cut from a TCP stream
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TcpFrame {
    /// `payload` is everything after the body length (protocol code, command id, body), still
    ///  encrypted if encryption is on
    Data { sequence: u32, payload: BytesMut, trailer: Option<Trailer> },
    /// HANDSHAKE_TCP / HANDSHAKE_TCP_ACK with their body
    Handshake { tag: StructureType, body: Bytes },
    /// frames consisting of nothing but their structure type
    Control(StructureType),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ReassemblyState {
    AwaitTag,
    AwaitHeader(StructureType),
    AwaitBody { tag: StructureType, sequence: u32, len: usize },
}

/// Cuts a TCP byte stream into frames. Bytes can be pushed in arbitrary chunks, incomplete frames
///  stay buffered until the rest arrives.
pub struct FrameReassembler {
    buf: BytesMut,
    state: ReassemblyState,
    crypto: bool,
    max_frame_len: usize,
}

impl FrameReassembler {
    pub fn new(crypto: bool, max_frame_len: usize) -> FrameReassembler {
        FrameReassembler {
            buf: BytesMut::new(),
            state: ReassemblyState::AwaitTag,
            crypto,
            max_frame_len,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame, or `None` if more bytes are needed. An error means the
    ///  stream is corrupt and can not be resynchronized.
    pub fn next_frame(&mut self) -> Result<Option<TcpFrame>, ProtocolError> {
        loop {
            match self.state {
                ReassemblyState::AwaitTag => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let tag = StructureType::parse(self.buf[0])?;
                    if !tag.is_tcp() {
                        return Err(ProtocolError::Malformed(format!("{:?} is not valid on a TCP stream", tag)));
                    }
                    self.buf.advance(1);

                    match tag {
                        StructureType::Data | StructureType::HandshakeTcp | StructureType::HandshakeTcpAck => {
                            self.state = ReassemblyState::AwaitHeader(tag);
                        }
                        _ => return Ok(Some(TcpFrame::Control(tag))),
                    }
                }
                ReassemblyState::AwaitHeader(tag) => {
                    let header_len = if tag == StructureType::Data { 8 } else { 4 };
                    if self.buf.len() < header_len {
                        return Ok(None);
                    }
                    let sequence = if tag == StructureType::Data { self.buf.get_u32_le() } else { 0 };
                    let len: usize = self.buf.get_u32_le().safe_cast();
                    if len > self.max_frame_len {
                        return Err(ProtocolError::FrameTooLong { len, max: self.max_frame_len });
                    }
                    self.state = ReassemblyState::AwaitBody { tag, sequence, len };
                }
                ReassemblyState::AwaitBody { tag, sequence, len } => {
                    let with_trailer = tag == StructureType::Data && self.crypto;
                    let total = if with_trailer { len + TRAILER_LEN } else { len };
                    if self.buf.len() < total {
                        return Ok(None);
                    }
                    self.state = ReassemblyState::AwaitTag;

                    let body = self.buf.split_to(len);
                    if tag != StructureType::Data {
                        return Ok(Some(TcpFrame::Handshake { tag, body: body.freeze() }));
                    }

                    let trailer = if with_trailer {
                        let mut trailer = [0u8; TRAILER_LEN];
                        self.buf.copy_to_slice(&mut trailer);
                        Some(trailer)
                    }
                    else {
                        None
                    };
                    return Ok(Some(TcpFrame::Data { sequence, payload: body, trailer }));
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.state = ReassemblyState::AwaitTag;
    }
}


/// Cuts the in-order byte stream of a UDP leg into packet records (`body length, payload`). The
///  returned records are the payloads.
pub struct UdpStreamAssembler {
    buf: BytesMut,
    pending_len: Option<usize>,
    max_frame_len: usize,
}

impl UdpStreamAssembler {
    pub fn new(max_frame_len: usize) -> UdpStreamAssembler {
        UdpStreamAssembler {
            buf: BytesMut::new(),
            pending_len: None,
            max_frame_len,
        }
    }

    pub fn push(&mut self, fragment: &[u8]) {
        self.buf.extend_from_slice(fragment);
    }

    pub fn next_record(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                let len: usize = self.buf.get_u32_le().safe_cast();
                if len > self.max_frame_len {
                    return Err(ProtocolError::FrameTooLong { len, max: self.max_frame_len });
                }
                self.pending_len = Some(len);
                len
            }
        };

        if self.buf.len() < len {
            return Ok(None);
        }
        self.pending_len = None;
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.pending_len = None;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn stream(crypto: bool) -> Vec<u8> {
        let mut result = vec![
            30,                                         // keep alive
            11, 3,0,0,0, 1,2,3,                         // handshake
            0, 5,0,0,0, 2,0,0,0, 7,0,                   // data, seq 5, payload len 2
        ];
        if crypto {
            result.extend_from_slice(&[9, 9, 9, 9]);
        }
        result.extend_from_slice(&[13]);                // handshake ack ack
        result.extend_from_slice(&[0, 6,0,0,0, 0,0,0,0]);  // data, seq 6, empty
        if crypto {
            result.extend_from_slice(&[8, 8, 8, 8]);
        }
        result
    }

    fn expected(crypto: bool) -> Vec<TcpFrame> {
        vec![
            TcpFrame::Control(StructureType::KeepAlive),
            TcpFrame::Handshake { tag: StructureType::HandshakeTcp, body: Bytes::from_static(&[1, 2, 3]) },
            TcpFrame::Data { sequence: 5, payload: BytesMut::from(&[7u8, 0][..]), trailer: if crypto { Some([9; 4]) } else { None } },
            TcpFrame::Control(StructureType::HandshakeTcpAckAck),
            TcpFrame::Data { sequence: 6, payload: BytesMut::new(), trailer: if crypto { Some([8; 4]) } else { None } },
        ]
    }

    fn drain(reassembler: &mut FrameReassembler, frames: &mut Vec<TcpFrame>) {
        while let Some(frame) = reassembler.next_frame().unwrap() {
            frames.push(frame);
        }
    }

    #[rstest]
    #[case::whole(false, 1000)]
    #[case::byte_by_byte(false, 1)]
    #[case::chunks_of_3(false, 3)]
    #[case::chunks_of_7(false, 7)]
    #[case::crypto_whole(true, 1000)]
    #[case::crypto_byte_by_byte(true, 1)]
    #[case::crypto_chunks_of_5(true, 5)]
    fn test_split_stream(#[case] crypto: bool, #[case] chunk_size: usize) {
        let mut reassembler = FrameReassembler::new(crypto, 1024);
        let mut frames = Vec::new();

        for chunk in stream(crypto).chunks(chunk_size) {
            reassembler.push(chunk);
            drain(&mut reassembler, &mut frames);
        }

        assert_eq!(frames, expected(crypto));
        assert_eq!(reassembler.buffered_len(), 0);
    }

    #[rstest]
    #[case::unknown_tag(vec![99], ProtocolError::UnknownStructureType(99))]
    #[case::udp_tag(vec![29], ProtocolError::Malformed("Ack is not valid on a TCP stream".to_string()))]
    #[case::too_long(vec![0, 0,0,0,0, 0,1,0,0], ProtocolError::FrameTooLong { len: 256, max: 100 })]
    fn test_corrupt_stream(#[case] raw: Vec<u8>, #[case] expected: ProtocolError) {
        let mut reassembler = FrameReassembler::new(false, 100);
        reassembler.push(&raw);
        assert_eq!(reassembler.next_frame(), Err(expected));
    }

    #[rstest]
    #[case::whole(100)]
    #[case::byte_by_byte(1)]
    #[case::chunks_of_6(6)]
    fn test_udp_records(#[case] chunk_size: usize) {
        let raw = vec![3,0,0,0, 1,2,3, 0,0,0,0, 2,0,0,0, 4,5];
        let mut assembler = UdpStreamAssembler::new(100);
        let mut records = Vec::new();
        for chunk in raw.chunks(chunk_size) {
            assembler.push(chunk);
            while let Some(record) = assembler.next_record().unwrap() {
                records.push(record.to_vec());
            }
        }
        assert_eq!(records, vec![vec![1,2,3], vec![], vec![4,5]]);
    }

    #[test]
    fn test_udp_record_too_long() {
        let mut assembler = UdpStreamAssembler::new(10);
        assembler.push(&[11, 0, 0, 0]);
        assert_eq!(assembler.next_record(), Err(ProtocolError::FrameTooLong { len: 11, max: 10 }));
    }
}
