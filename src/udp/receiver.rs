use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::codec::frame::UdpStreamAssembler;
use crate::crypto::{PacketCipher, Trailer};
use crate::error::ProtocolError;
use crate::structure_type::StructureType;

/// What the connection has to do after a DATA datagram was processed
#[derive(Debug, Default, Eq, PartialEq)]
pub struct DataOutcome {
    /// the sequence number to acknowledge, if any
    pub ack: Option<u32>,
    /// complete packet records that became available, in stream order
    pub records: Vec<Bytes>,
}

/// The receiving half of a UDP leg. It decrypts DATA fragments, restores sequence order and cuts
///  the resulting byte stream into packet records.
///
/// This is a pure state machine without I/O - the connection sends the ACKs and dispatches
///  the records.
pub struct UdpReceiver {
    next_expected: u32,
    /// decrypted fragments that arrived ahead of `next_expected`
    reorder_buffer: BTreeMap<u32, BytesMut>,
    /// fragments further ahead than this are dropped without ACK, the sender will resend them
    max_reorder_distance: u32,
    assembler: UdpStreamAssembler,
}

impl UdpReceiver {
    pub fn new(max_reorder_distance: u32, max_frame_len: usize) -> UdpReceiver {
        UdpReceiver {
            next_expected: 0,
            reorder_buffer: BTreeMap::new(),
            max_reorder_distance,
            assembler: UdpStreamAssembler::new(max_frame_len),
        }
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub fn num_buffered(&self) -> usize {
        self.reorder_buffer.len()
    }

    /// An error means the reassembled stream is corrupt, which can not be recovered from
    pub fn on_data(&mut self, sequence: u32, mut fragment: BytesMut, trailer: Option<Trailer>, cipher: Option<&PacketCipher>) -> Result<DataOutcome, ProtocolError> {
        // sequence numbers wrap around, so 'behind' means less than half the number space behind
        let ahead = sequence.wrapping_sub(self.next_expected);
        let is_behind = ahead > u32::MAX / 2;
        if is_behind || self.reorder_buffer.contains_key(&sequence) {
            trace!("duplicate UDP datagram #{} - re-sending ACK", sequence);
            return Ok(DataOutcome { ack: Some(sequence), records: vec![] });
        }
        if ahead >= self.max_reorder_distance {
            debug!("UDP datagram #{} is too far ahead of #{} - dropping", sequence, self.next_expected);
            return Ok(DataOutcome::default());
        }

        match (cipher, trailer) {
            (Some(cipher), Some(trailer)) => {
                if !cipher.decrypt_and_verify(StructureType::Data, sequence, &mut fragment, &trailer) {
                    debug!("UDP datagram #{} failed verification - dropping", sequence);
                    return Ok(DataOutcome::default());
                }
            }
            (None, None) => {}
            _ => {
                debug!("UDP datagram #{} with unexpected trailer configuration - dropping", sequence);
                return Ok(DataOutcome::default());
            }
        }

        if sequence != self.next_expected {
            trace!("UDP datagram #{} arrived ahead of #{} - buffering", sequence, self.next_expected);
            self.reorder_buffer.insert(sequence, fragment);
            return Ok(DataOutcome { ack: Some(sequence), records: vec![] });
        }

        self.assembler.push(&fragment);
        self.next_expected = self.next_expected.wrapping_add(1);
        while let Some(buffered) = self.reorder_buffer.remove(&self.next_expected) {
            self.assembler.push(&buffered);
            self.next_expected = self.next_expected.wrapping_add(1);
        }

        let mut records = Vec::new();
        while let Some(record) = self.assembler.next_record()? {
            records.push(record);
        }
        Ok(DataOutcome { ack: Some(sequence), records })
    }

    pub fn clear(&mut self) {
        self.reorder_buffer.clear();
        self.assembler.clear();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::rc4::CipherKey;
    use rstest::rstest;

    /// a single-fragment record
    fn record(body: &[u8]) -> Vec<u8> {
        let mut result = (body.len() as u32).to_le_bytes().to_vec();
        result.extend_from_slice(body);
        result
    }

    fn receive(receiver: &mut UdpReceiver, sequence: u32, fragment: &[u8]) -> DataOutcome {
        receiver.on_data(sequence, BytesMut::from(fragment), None, None).unwrap()
    }

    fn bodies(outcome: &DataOutcome) -> Vec<Vec<u8>> {
        outcome.records.iter().map(|r| r.to_vec()).collect()
    }

    #[test]
    fn test_in_order() {
        let mut receiver = UdpReceiver::new(100, 1000);
        let outcome = receive(&mut receiver, 0, &record(b"A"));
        assert_eq!(outcome.ack, Some(0));
        assert_eq!(bodies(&outcome), vec![b"A".to_vec()]);
        assert_eq!(receiver.next_expected(), 1);
    }

    #[test]
    fn test_duplicate_is_acked_but_not_dispatched() {
        let mut receiver = UdpReceiver::new(100, 1000);
        receive(&mut receiver, 0, &record(b"A"));

        let outcome = receive(&mut receiver, 0, &record(b"A"));
        assert_eq!(outcome, DataOutcome { ack: Some(0), records: vec![] });
        assert_eq!(receiver.next_expected(), 1);
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2])]
    #[case::one_delayed(vec![0, 2, 1])]
    #[case::reversed(vec![2, 1, 0])]
    #[case::with_duplicates(vec![2, 2, 0, 2, 1, 0])]
    fn test_dispatch_order(#[case] arrival: Vec<u32>) {
        let fragments = [record(b"x"), record(b"y"), record(b"z")];
        let mut receiver = UdpReceiver::new(100, 1000);

        let mut dispatched = Vec::new();
        for sequence in arrival {
            let outcome = receive(&mut receiver, sequence, &fragments[sequence as usize]);
            assert_eq!(outcome.ack, Some(sequence));
            dispatched.extend(bodies(&outcome));
        }

        assert_eq!(dispatched, vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]);
        assert_eq!(receiver.num_buffered(), 0);
    }

    #[test]
    fn test_sequence_wrap_around() {
        let fragments = [record(b"a"), record(b"b"), record(b"c"), record(b"d")];
        let mut receiver = UdpReceiver::new(100, 1000);
        receiver.next_expected = u32::MAX - 1;

        assert_eq!(bodies(&receive(&mut receiver, u32::MAX - 1, &fragments[0])), vec![b"a".to_vec()]);
        let outcome = receive(&mut receiver, 1, &fragments[3]);
        assert_eq!(outcome, DataOutcome { ack: Some(1), records: vec![] });
        assert_eq!(receiver.num_buffered(), 1);

        assert_eq!(bodies(&receive(&mut receiver, u32::MAX, &fragments[1])), vec![b"b".to_vec()]);
        assert_eq!(bodies(&receive(&mut receiver, 0, &fragments[2])), vec![b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(receiver.next_expected(), 2);

        // from before the wrap, so duplicates
        assert_eq!(receive(&mut receiver, u32::MAX, &fragments[1]), DataOutcome { ack: Some(u32::MAX), records: vec![] });
        assert_eq!(receive(&mut receiver, u32::MAX - 1, &fragments[0]), DataOutcome { ack: Some(u32::MAX - 1), records: vec![] });
        assert_eq!(receiver.next_expected(), 2);
    }

    #[test]
    fn test_record_spanning_fragments() {
        let raw = record(b"a longer body");
        let (first, second) = raw.split_at(6);
        let mut receiver = UdpReceiver::new(100, 1000);

        assert!(receive(&mut receiver, 1, second).records.is_empty());
        let outcome = receive(&mut receiver, 0, first);
        assert_eq!(bodies(&outcome), vec![b"a longer body".to_vec()]);
    }

    #[test]
    fn test_too_far_ahead_is_dropped() {
        let mut receiver = UdpReceiver::new(4, 1000);
        assert_eq!(receive(&mut receiver, 4, &record(b"x")), DataOutcome::default());
        assert_eq!(receive(&mut receiver, 3, &record(b"x")).ack, Some(3));
    }

    #[test]
    fn test_encrypted() {
        let cipher = PacketCipher::new(CipherKey::from_seed(b"seed").unwrap(), 1, 2);
        let mut receiver = UdpReceiver::new(100, 1000);

        let mut fragment = record(b"secret");
        let trailer = cipher.encrypt(StructureType::Data, 0, &mut fragment);

        let mut tampered = fragment.clone();
        tampered[5] ^= 1;
        let outcome = receiver.on_data(0, BytesMut::from(tampered.as_slice()), Some(trailer), Some(&cipher)).unwrap();
        assert_eq!(outcome, DataOutcome::default());

        let outcome = receiver.on_data(0, BytesMut::from(fragment.as_slice()), Some(trailer), Some(&cipher)).unwrap();
        assert_eq!(bodies(&outcome), vec![b"secret".to_vec()]);
    }

    #[test]
    fn test_missing_trailer_is_dropped() {
        let cipher = PacketCipher::new(CipherKey::from_seed(b"seed").unwrap(), 1, 2);
        let mut receiver = UdpReceiver::new(100, 1000);
        let outcome = receiver.on_data(0, BytesMut::from(record(b"x").as_slice()), None, Some(&cipher)).unwrap();
        assert_eq!(outcome, DataOutcome::default());
        assert_eq!(receiver.next_expected(), 0);
    }

    #[test]
    fn test_corrupt_stream() {
        let mut receiver = UdpReceiver::new(100, 10);
        let result = receiver.on_data(0, BytesMut::from(&[200u8, 0, 0, 0][..]), None, None);
        assert_eq!(result, Err(ProtocolError::FrameTooLong { len: 200, max: 10 }));
    }
}
