//! The TCP leg of a connection: an outgoing frame channel drained by a writer task, and the
//!  receive-side sequence and integrity checks.

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::codec::frame::{FrameReassembler, TcpFrame};
use crate::config::SocketConfig;
use crate::crypto::{PacketCipher, Trailer};
use crate::error::{CloseReason, CloseRequest, ProtocolError};
use crate::structure_type::StructureType;

/// Sending side of a TCP stream, abstracted away for testing
#[cfg_attr(test, automock)]
pub trait StreamSink: Send + Sync + 'static {
    /// Queues a complete frame for writing. This never blocks.
    fn send_frame(&self, frame: Bytes) -> anyhow::Result<()>;

    /// Frames that were queued before are still written, then the stream is shut down
    fn shutdown(&self);
}

/// Writes frames to a TCP stream from a dedicated task, so senders never wait for the socket
pub struct TcpWriter {
    sender: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl TcpWriter {
    pub fn spawn<W>(mut write_half: W, close_request: Arc<dyn CloseRequest>) -> TcpWriter
    where W: AsyncWrite + Unpin + Send + 'static
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Bytes>();

        tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                trace!("writing {} bytes to TCP stream", frame.len());
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!("error writing to TCP stream: {}", e);
                    close_request.request_close(CloseReason::Internal);
                    return;
                }
            }
            let _ = write_half.shutdown().await;
            trace!("TCP writer finished");
        });

        TcpWriter {
            sender: Mutex::new(Some(sender)),
        }
    }
}

impl StreamSink for TcpWriter {
    fn send_frame(&self, frame: Bytes) -> anyhow::Result<()> {
        match self.sender.lock().unwrap().as_ref() {
            Some(sender) => sender.send(frame)
                .map_err(|_| anyhow!("TCP writer terminated")),
            None => Err(anyhow!("TCP stream is shut down")),
        }
    }

    fn shutdown(&self) {
        self.sender.lock().unwrap().take();
    }
}

/// Verdict on a received DATA frame
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DataVerdict {
    Accepted,
    /// the frame is dropped, the connection stays open
    Rejected,
    /// too many consecutive rejects: the stream can not be trusted any more
    Fatal,
}

/// Per-connection state of a TCP leg
pub struct TcpLeg {
    sink: Arc<dyn StreamSink>,
    send_sequence: u32,
    expected_sequence: u32,
    consecutive_rejects: u32,
    max_rejects: u32,
    reassembler: FrameReassembler,
}

impl TcpLeg {
    pub fn new(sink: Arc<dyn StreamSink>, config: &SocketConfig) -> TcpLeg {
        TcpLeg {
            sink,
            send_sequence: 0,
            expected_sequence: 0,
            consecutive_rejects: 0,
            max_rejects: config.max_sequence_mismatches,
            reassembler: FrameReassembler::new(config.crypto, config.max_frame_len),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.reassembler.push(data);
    }

    pub fn next_frame(&mut self) -> Result<Option<TcpFrame>, ProtocolError> {
        self.reassembler.next_frame()
    }

    pub fn next_send_sequence(&mut self) -> u32 {
        let result = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        result
    }

    pub fn send(&self, frame: Bytes) -> anyhow::Result<()> {
        self.sink.send_frame(frame)
    }

    pub fn send_control(&self, tag: StructureType) -> anyhow::Result<()> {
        self.sink.send_frame(Bytes::copy_from_slice(&[tag.into()]))
    }

    pub fn shutdown(&mut self) {
        self.sink.shutdown();
        if self.reassembler.buffered_len() > 0 {
            debug!("discarding {} buffered bytes of an incomplete TCP frame", self.reassembler.buffered_len());
        }
        self.reassembler.clear();
    }

    /// Checks sequence number and (if a cipher is passed) the integrity trailer of a DATA frame,
    ///  decrypting the payload in place.
    ///
    /// A rejected frame does not advance the expected sequence number. TCP delivers in order, so
    ///  a mismatch means the peer is broken or the stream was tampered with - after
    ///  `max_sequence_mismatches` consecutive rejects, the connection must be closed.
    pub fn accept_data(&mut self, sequence: u32, payload: &mut BytesMut, trailer: Option<Trailer>, cipher: Option<&PacketCipher>) -> DataVerdict {
        let valid = if sequence != self.expected_sequence {
            debug!("TCP DATA with sequence number {}, expected {} - dropping", sequence, self.expected_sequence);
            false
        }
        else {
            match (cipher, trailer) {
                (Some(cipher), Some(trailer)) => {
                    let verified = cipher.decrypt_and_verify(StructureType::Data, sequence, payload, &trailer);
                    if !verified {
                        debug!("TCP DATA #{} failed verification - dropping", sequence);
                    }
                    verified
                }
                (None, None) => true,
                _ => {
                    debug!("TCP DATA #{} with unexpected trailer configuration - dropping", sequence);
                    false
                }
            }
        };

        if valid {
            self.expected_sequence = self.expected_sequence.wrapping_add(1);
            self.consecutive_rejects = 0;
            return DataVerdict::Accepted;
        }

        self.consecutive_rejects += 1;
        if self.consecutive_rejects >= self.max_rejects {
            warn!("{} consecutive TCP DATA frames were rejected", self.consecutive_rejects);
            DataVerdict::Fatal
        }
        else {
            DataVerdict::Rejected
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::rc4::CipherKey;
    use crate::error::MockCloseRequest;
    use rstest::rstest;
    use std::net::SocketAddr;
    use tokio::io::AsyncReadExt;
    use tokio::runtime::Builder;

    fn leg() -> TcpLeg {
        let config = SocketConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        TcpLeg::new(Arc::new(MockStreamSink::new()), &config)
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2], vec![DataVerdict::Accepted, DataVerdict::Accepted, DataVerdict::Accepted])]
    #[case::single_mismatch(vec![0, 5, 1], vec![DataVerdict::Accepted, DataVerdict::Rejected, DataVerdict::Accepted])]
    #[case::counter_resets(vec![1, 1, 0, 2, 2, 1], vec![DataVerdict::Rejected, DataVerdict::Rejected, DataVerdict::Accepted, DataVerdict::Rejected, DataVerdict::Rejected, DataVerdict::Accepted])]
    #[case::fatal(vec![3, 4, 5], vec![DataVerdict::Rejected, DataVerdict::Rejected, DataVerdict::Fatal])]
    fn test_sequence_check(#[case] sequences: Vec<u32>, #[case] expected: Vec<DataVerdict>) {
        let mut leg = leg();
        let actual = sequences.into_iter()
            .map(|s| leg.accept_data(s, &mut BytesMut::new(), None, None))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_integrity_check() {
        let cipher = PacketCipher::new(CipherKey::from_seed(b"key").unwrap(), 1, 2);
        let mut leg = leg();

        let mut payload = BytesMut::from(&b"payload"[..]);
        let trailer = cipher.encrypt(StructureType::Data, 0, &mut payload);

        let mut tampered = payload.clone();
        tampered[0] ^= 1;
        assert_eq!(leg.accept_data(0, &mut tampered, Some(trailer), Some(&cipher)), DataVerdict::Rejected);
        assert_eq!(leg.accept_data(0, &mut payload, None, Some(&cipher)), DataVerdict::Rejected);

        let mut payload = BytesMut::from(&b"payload"[..]);
        let trailer = cipher.encrypt(StructureType::Data, 0, &mut payload);
        assert_eq!(leg.accept_data(0, &mut payload, Some(trailer), Some(&cipher)), DataVerdict::Accepted);
        assert_eq!(payload.as_ref(), b"payload");
    }

    #[test]
    fn test_send_sequence() {
        let mut leg = leg();
        assert_eq!(leg.next_send_sequence(), 0);
        assert_eq!(leg.next_send_sequence(), 1);
    }

    #[test]
    fn test_control_frame() {
        let config = SocketConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        let mut sink = MockStreamSink::new();
        sink.expect_send_frame()
            .withf(|frame| frame.as_ref() == [30])
            .times(1)
            .returning(|_| Ok(()));
        let leg = TcpLeg::new(Arc::new(sink), &config);
        leg.send_control(StructureType::KeepAlive).unwrap();
    }

    #[test]
    fn test_writer_flushes_before_shutdown() {
        Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
            let (client, mut server) = tokio::io::duplex(64);
            let mut close_request = MockCloseRequest::new();
            close_request.expect_request_close().never();

            let writer = TcpWriter::spawn(client, Arc::new(close_request));
            writer.send_frame(Bytes::from_static(b"abc")).unwrap();
            writer.send_frame(Bytes::from_static(b"de")).unwrap();
            writer.shutdown();
            assert!(writer.send_frame(Bytes::from_static(b"f")).is_err());

            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, b"abcde");
        });
    }

    #[test]
    fn test_write_error_requests_close() {
        Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
            let (client, server) = tokio::io::duplex(64);
            drop(server);

            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut close_request = MockCloseRequest::new();
            close_request.expect_request_close()
                .returning(move |reason| { let _ = tx.send(reason); });

            let writer = TcpWriter::spawn(client, Arc::new(close_request));
            writer.send_frame(Bytes::from_static(b"abc")).unwrap();
            assert_eq!(rx.recv().await, Some(CloseReason::Internal));
        });
    }
}
