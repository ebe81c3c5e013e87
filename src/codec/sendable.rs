use std::sync::Arc;
use std::time::SystemTime;

use anyhow::bail;
use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::buffer_pool::BufferPools;
use crate::codec::{COMMAND_ID_LEN, PROTOCOL_CODE_LEN, TCP_DATA_HEAD_LEN};
use crate::crypto::PacketCipher;
use crate::error::ProtocolError;
use crate::structure_type::{StructureType, TransportKind};
use crate::util::buf_ext::{string_len, BufMutExt};

/// Offset of the body length inside the reserved header. A UDP stream record starts here, it has
///  no structure type and no sequence number.
const BODY_LEN_OFFSET: usize = 5;

/// Position of a value written into a [`SendablePacket`], for overwriting it once the real value
///  is known
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct WriteMark(usize);

enum Storage {
    /// a single buffer from the TCP pool
    Pooled(BytesMut),
    /// list of chunks, entered when the packet outgrows a pooled buffer
    Segmented(Vec<BytesMut>),
}

/// An outgoing DATA packet: protocol code, optional command id and a body written with typed
///  `put_*` calls.
///
/// The packet starts out in a pooled buffer with room reserved for the frame header. If the
///  body does not fit, it transparently switches to a list of chunks that are concatenated by
///  [`SendablePacket::finalize`].
pub struct SendablePacket {
    pools: Arc<BufferPools>,
    protocol_code: i16,
    command_id: Option<i64>,
    storage: Storage,
    chunk_size: usize,
    len: usize,
    header_len: usize,
}

macro_rules! put_impl {
    ($name: ident, $ty:ty, $putter: ident) => {
        pub fn $name(&mut self, v: $ty) {
            self.write_with(size_of::<$ty>(), |b| b.$putter(v));
        }
    }
}

impl SendablePacket {
    pub fn new(pools: Arc<BufferPools>, protocol_code: i16, command_id: Option<i64>) -> SendablePacket {
        let mut buf = pools.acquire(TransportKind::Tcp);
        let chunk_size = pools.pool(TransportKind::Tcp).buf_size();

        // placeholders for structure type, sequence number and body length
        buf.put_u8(StructureType::Data.into());
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        buf.put_i16_le(protocol_code);
        if let Some(command_id) = command_id {
            buf.put_i64_le(command_id);
        }
        let header_len = buf.len();

        SendablePacket {
            pools,
            protocol_code,
            command_id,
            storage: Storage::Pooled(buf),
            chunk_size,
            len: header_len,
            header_len,
        }
    }

    pub fn protocol_code(&self) -> i16 {
        self.protocol_code
    }

    pub fn command_id(&self) -> Option<i64> {
        self.command_id
    }

    /// number of body bytes written so far
    pub fn body_len(&self) -> usize {
        self.len - self.header_len
    }

    /// The value of the frame's length field: protocol code, command id and body. The receiver
    ///  checks this against its `max_frame_len`.
    pub fn frame_len(&self) -> usize {
        self.len - TCP_DATA_HEAD_LEN
    }

    pub fn is_segmented(&self) -> bool {
        matches!(self.storage, Storage::Segmented(_))
    }

    fn write_with(&mut self, n: usize, f: impl FnOnce(&mut BytesMut)) {
        if let Storage::Pooled(buf) = &mut self.storage {
            if buf.len() + n <= self.chunk_size {
                f(buf);
                self.len += n;
                return;
            }

            trace!("packet outgrows pooled buffer ({} + {} bytes): switching to segmented mode", buf.len(), n);
            let pooled = std::mem::take(buf);
            let first = BytesMut::from(pooled.as_ref());
            self.pools.release(TransportKind::Tcp, pooled);
            self.storage = Storage::Segmented(vec![first]);
        }

        if let Storage::Segmented(chunks) = &mut self.storage {
            let needs_new_chunk = chunks.last()
                .map(|c| c.len() + n > self.chunk_size)
                .unwrap_or(true);
            if needs_new_chunk {
                chunks.push(BytesMut::with_capacity(self.chunk_size.max(n)));
            }
            if let Some(last) = chunks.last_mut() {
                f(last);
                self.len += n;
            }
        }
    }

    put_impl!(put_u8, u8, put_u8);
    put_impl!(put_bool, bool, put_bool);
    put_impl!(put_i16, i16, put_i16_le);
    put_impl!(put_i32, i32, put_i32_le);
    put_impl!(put_i64, i64, put_i64_le);
    put_impl!(put_f32, f32, put_f32_le);
    put_impl!(put_f64, f64, put_f64_le);

    pub fn put_date(&mut self, date: SystemTime) {
        self.write_with(8, |b| b.put_date(date));
    }

    /// Strings are limited to u16::MAX bytes. Nothing is written for a longer string.
    pub fn put_string(&mut self, s: &str) -> Result<(), ProtocolError> {
        let len = string_len(s)?;
        self.write_with(2, |b| b.put_u16_le(len));
        self.put_slice(s.as_bytes());
        Ok(())
    }

    pub fn put_slice(&mut self, mut data: &[u8]) {
        // large slices are split so no chunk grows beyond the chunk size
        while !data.is_empty() {
            let n = data.len().min(self.chunk_size);
            let (head, tail) = data.split_at(n);
            self.write_with(n, |b| b.put_slice(head));
            data = tail;
        }
    }

    /// Marks the current end of the body, e.g. before writing a placeholder value
    pub fn save_cursor(&self) -> WriteMark {
        WriteMark(self.len)
    }

    /// Overwrites previously written bytes at a mark.
    pub fn patch(&mut self, mark: WriteMark, data: &[u8]) -> anyhow::Result<()> {
        if mark.0 < self.header_len || mark.0 + data.len() > self.len {
            bail!("patching {} bytes at {} is outside the written body", data.len(), mark.0);
        }

        match &mut self.storage {
            Storage::Pooled(buf) => {
                buf[mark.0..mark.0 + data.len()].copy_from_slice(data);
            }
            Storage::Segmented(chunks) => {
                let mut chunk_start = 0;
                let mut remaining = data;
                let mut offset = mark.0;
                for chunk in chunks.iter_mut() {
                    let chunk_end = chunk_start + chunk.len();
                    if offset < chunk_end && !remaining.is_empty() {
                        let in_chunk = offset - chunk_start;
                        let n = remaining.len().min(chunk.len() - in_chunk);
                        chunk[in_chunk..in_chunk + n].copy_from_slice(&remaining[..n]);
                        remaining = &remaining[n..];
                        offset += n;
                    }
                    chunk_start = chunk_end;
                }
            }
        }
        Ok(())
    }

    pub fn patch_i32(&mut self, mark: WriteMark, v: i32) -> anyhow::Result<()> {
        self.patch(mark, &v.to_le_bytes())
    }

    /// Turns the packet into wire format for a transport leg:
    ///
    /// * TCP: `structure type, sequence number, body length, protocol code, [command id], body, [trailer]`.
    ///    If a cipher is passed, everything after the first 9 bytes is encrypted, and the trailer is
    ///    appended.
    /// * UDP: `body length, protocol code, [command id], body`, i.e. a record of the connection's
    ///    UDP stream. Encryption happens per datagram, so the cipher is not used here.
    ///
    /// The body length covers protocol code, command id and body.
    pub fn finalize(self, kind: TransportKind, cipher: Option<&PacketCipher>, packet_number: Option<u32>) -> anyhow::Result<FinalizedPacket> {
        let Ok(body_len) = u32::try_from(self.frame_len()) else {
            bail!("packet of {} bytes does not fit a frame", self.frame_len());
        };
        debug_assert_eq!(
            self.header_len - TCP_DATA_HEAD_LEN,
            PROTOCOL_CODE_LEN + if self.command_id.is_some() { COMMAND_ID_LEN } else { 0 });

        let (mut buf, pooled) = match self.storage {
            Storage::Pooled(buf) => (buf, true),
            Storage::Segmented(chunks) => {
                let mut joined = BytesMut::with_capacity(self.len + crate::crypto::TRAILER_LEN);
                for chunk in chunks {
                    joined.put_slice(&chunk);
                }
                (joined, false)
            }
        };

        buf[BODY_LEN_OFFSET..BODY_LEN_OFFSET + 4].copy_from_slice(&body_len.to_le_bytes());

        let start = match kind {
            TransportKind::Tcp => {
                let sequence = packet_number.unwrap_or(0);
                buf[1..5].copy_from_slice(&sequence.to_le_bytes());
                if let Some(cipher) = cipher {
                    let trailer = cipher.encrypt(StructureType::Data, sequence, &mut buf[TCP_DATA_HEAD_LEN..]);
                    buf.put_slice(&trailer);
                }
                0
            }
            TransportKind::Udp => BODY_LEN_OFFSET,
        };

        Ok(FinalizedPacket {
            pools: if pooled { Some(self.pools) } else { None },
            buf: Some(buf),
            start,
        })
    }
}

/// A packet in wire format. Pooled buffers go back to the pool when this is dropped.
pub struct FinalizedPacket {
    pools: Option<Arc<BufferPools>>,
    buf: Option<BytesMut>,
    start: usize,
}

impl AsRef<[u8]> for FinalizedPacket {
    fn as_ref(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[self.start..],
            None => &[],
        }
    }
}

impl Drop for FinalizedPacket {
    fn drop(&mut self) {
        if let (Some(pools), Some(buf)) = (self.pools.take(), self.buf.take()) {
            pools.release(TransportKind::Tcp, buf);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketConfig;
    use crate::crypto::rc4::CipherKey;
    use rstest::rstest;
    use std::net::SocketAddr;

    fn pools(tcp_buffer_size: usize) -> Arc<BufferPools> {
        let mut config = SocketConfig::new(SocketAddr::from(([127, 0, 0, 1], 1)));
        config.tcp_buffer_size = tcp_buffer_size;
        Arc::new(BufferPools::new(&config))
    }

    #[rstest]
    #[case::tcp_plain(TransportKind::Tcp, None, Some(3), vec![0, 3,0,0,0, 5,0,0,0, 7,0, 1,2,3])]
    #[case::tcp_no_packet_number(TransportKind::Tcp, None, None, vec![0, 0,0,0,0, 5,0,0,0, 7,0, 1,2,3])]
    #[case::tcp_command_id(TransportKind::Tcp, Some(9), Some(1), vec![0, 1,0,0,0, 13,0,0,0, 7,0, 9,0,0,0,0,0,0,0, 1,2,3])]
    #[case::udp_plain(TransportKind::Udp, None, Some(3), vec![5,0,0,0, 7,0, 1,2,3])]
    #[case::udp_command_id(TransportKind::Udp, Some(-1), None, vec![13,0,0,0, 7,0, 255,255,255,255,255,255,255,255, 1,2,3])]
    fn test_finalize_layout(#[case] kind: TransportKind, #[case] command_id: Option<i64>, #[case] packet_number: Option<u32>, #[case] expected: Vec<u8>) {
        let mut packet = SendablePacket::new(pools(1024), 7, command_id);
        packet.put_slice(&[1, 2, 3]);
        assert_eq!(packet.body_len(), 3);

        let finalized = packet.finalize(kind, None, packet_number).unwrap();
        assert_eq!(finalized.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_finalize_encrypted() {
        let key = CipherKey::from_seed(b"abc").unwrap();
        let cipher = PacketCipher::new(key.clone(), 4, 5);

        let mut packet = SendablePacket::new(pools(1024), 7, None);
        packet.put_string("hello").unwrap();
        let finalized = packet.finalize(TransportKind::Tcp, Some(&cipher), Some(2)).unwrap();
        let raw = finalized.as_ref().to_vec();

        assert_eq!(raw.len(), TCP_DATA_HEAD_LEN + 2 + 7 + 4);
        assert_eq!(&raw[..TCP_DATA_HEAD_LEN], &[0, 2,0,0,0, 9,0,0,0]);

        let (body, trailer) = raw[TCP_DATA_HEAD_LEN..].split_at(9);
        let mut body = body.to_vec();
        assert!(cipher.decrypt_and_verify(StructureType::Data, 2, &mut body, trailer));
        assert_eq!(body, vec![7,0, 5,0, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_segmented_mode() {
        let pools = pools(16);
        let mut packet = SendablePacket::new(pools.clone(), 1, None);
        assert!(!packet.is_segmented());

        for i in 0..20i32 {
            packet.put_i32(i);
        }
        assert!(packet.is_segmented());
        assert_eq!(packet.body_len(), 80);
        // the pooled buffer went back when the packet switched modes
        assert_eq!(pools.pool(TransportKind::Tcp).available(), 1);

        let finalized = packet.finalize(TransportKind::Tcp, None, Some(0)).unwrap();
        let raw = finalized.as_ref();
        assert_eq!(raw.len(), TCP_DATA_HEAD_LEN + 2 + 80);
        assert_eq!(&raw[5..9], &82u32.to_le_bytes());
        for i in 0..20usize {
            let offset = TCP_DATA_HEAD_LEN + 2 + 4*i;
            assert_eq!(&raw[offset..offset+4], &(i as i32).to_le_bytes());
        }
    }

    #[test]
    fn test_large_slice_is_split_into_chunks() {
        let mut packet = SendablePacket::new(pools(16), 1, None);
        let data = (0..100u8).collect::<Vec<_>>();
        packet.put_slice(&data);

        let finalized = packet.finalize(TransportKind::Udp, None, None).unwrap();
        assert_eq!(&finalized.as_ref()[6..], data.as_slice());
    }

    #[rstest]
    #[case::pooled(1024)]
    #[case::segmented(16)]
    fn test_patch(#[case] buf_size: usize) {
        let mut packet = SendablePacket::new(pools(buf_size), 1, None);
        packet.put_i16(1);
        let mark = packet.save_cursor();
        packet.put_i32(0);
        packet.put_slice(&[9; 20]);
        packet.patch_i32(mark, 0x01020304).unwrap();

        assert!(packet.patch(WriteMark(0), &[1]).is_err());
        assert!(packet.patch(packet.save_cursor(), &[1]).is_err());

        let finalized = packet.finalize(TransportKind::Udp, None, None).unwrap();
        assert_eq!(&finalized.as_ref()[6..12], &[1, 0, 4, 3, 2, 1]);
    }

    #[test]
    fn test_string_too_long() {
        let mut packet = SendablePacket::new(pools(1024), 1, None);
        packet.put_i16(3);
        assert_eq!(packet.put_string(&"x".repeat(70_000)), Err(ProtocolError::StringTooLong(70_000)));
        assert_eq!(packet.body_len(), 2);

        packet.put_string(&"x".repeat(u16::MAX as usize)).unwrap();
        assert!(packet.is_segmented());
        assert_eq!(packet.body_len(), 2 + 2 + u16::MAX as usize);
        assert_eq!(packet.frame_len(), 2 + packet.body_len());
    }

    #[test]
    fn test_pooled_buffer_is_returned_on_drop() {
        let pools = pools(1024);
        let packet = SendablePacket::new(pools.clone(), 1, None);
        assert_eq!(pools.pool(TransportKind::Tcp).checked_out(), 1);

        drop(packet.finalize(TransportKind::Tcp, None, None).unwrap());
        assert_eq!(pools.pool(TransportKind::Tcp).checked_out(), 0);
        assert_eq!(pools.pool(TransportKind::Tcp).available(), 1);
    }
}
