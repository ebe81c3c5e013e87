//! Encryption of DATA packets (and UDP ACKs) with a per-connection RC4 style keystream, and the
//!  integrity trailer that goes with it.
//!
//! The symmetric key is derived from a random seed that the initiator of a connection sends
//!  during the handshake, see [`key_exchange`].

pub mod key_exchange;
pub mod rc4;

use crate::crypto::rc4::CipherKey;
use crate::structure_type::StructureType;
use crate::util::safe_converter::SafeCast;

pub const TRAILER_LEN: usize = 4;

pub type Trailer = [u8; TRAILER_LEN];

fn checksum_base(tag: StructureType, connection_id: u32, check_code: u32, sequence: u32, body_len: usize) -> u32 {
    let tag: u8 = tag.into();
    tag.safe_cast()
        .wrapping_add(connection_id)
        .wrapping_add(check_code)
        .wrapping_add(sequence)
        .wrapping_add(body_len as u32)
        .wrapping_add(CipherKey::STATE_LEN as u32)
}

fn seal_checksum(sum: u32, key: &CipherKey) -> Trailer {
    let mut trailer = sum.to_le_bytes();
    key.keystream().apply(&mut trailer);
    trailer
}

/// Encrypts `body` in place and returns the trailer to append to the packet. The trailer is the
///  encrypted additive checksum of the packet's metadata and the plaintext body.
pub fn encrypt_packet(tag: StructureType, connection_id: u32, check_code: u32, sequence: u32, body: &mut [u8], key: &CipherKey) -> Trailer {
    let mut sum = checksum_base(tag, connection_id, check_code, sequence, body.len());
    let mut keystream = key.keystream();
    for b in body.iter_mut() {
        sum = sum.wrapping_add((*b).safe_cast());
        *b ^= keystream.next_byte();
    }
    seal_checksum(sum, key)
}

/// Decrypts `body` in place and returns the trailer the sender must have computed. Callers
///  compare it to the received trailer and drop the packet on a mismatch.
pub fn decrypt_packet(tag: StructureType, connection_id: u32, check_code: u32, sequence: u32, body: &mut [u8], key: &CipherKey) -> Trailer {
    let mut sum = checksum_base(tag, connection_id, check_code, sequence, body.len());
    let mut keystream = key.keystream();
    for b in body.iter_mut() {
        *b ^= keystream.next_byte();
        sum = sum.wrapping_add((*b).safe_cast());
    }
    seal_checksum(sum, key)
}

/// The symmetric key of a connection together with the connection's identity, which is part of
///  every checksum
pub struct PacketCipher {
    key: CipherKey,
    connection_id: u32,
    check_code: u32,
}

impl PacketCipher {
    pub fn new(key: CipherKey, connection_id: u32, check_code: u32) -> PacketCipher {
        PacketCipher { key, connection_id, check_code }
    }

    pub fn encrypt(&self, tag: StructureType, sequence: u32, body: &mut [u8]) -> Trailer {
        encrypt_packet(tag, self.connection_id, self.check_code, sequence, body, &self.key)
    }

    /// Decrypts in place and checks the trailer. On `false`, the body is garbage and the packet
    ///  must be discarded.
    pub fn decrypt_and_verify(&self, tag: StructureType, sequence: u32, body: &mut [u8], received_trailer: &[u8]) -> bool {
        let expected = decrypt_packet(tag, self.connection_id, self.check_code, sequence, body, &self.key);
        expected.as_slice() == received_trailer
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn key(seed: &[u8]) -> CipherKey {
        CipherKey::from_seed(seed).unwrap()
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::single(vec![65])]
    #[case::text(b"hello, world".to_vec())]
    #[case::long((0..=255u8).cycle().take(1000).collect())]
    fn test_round_trip(#[case] plain: Vec<u8>) {
        let key = key(b"0123456789abcdefghijklmnopqrstuv");

        let mut body = plain.clone();
        let trailer = encrypt_packet(StructureType::Data, 5, 77, 3, &mut body, &key);
        if plain.len() > 4 {
            assert_ne!(body, plain);
        }

        let expected = decrypt_packet(StructureType::Data, 5, 77, 3, &mut body, &key);
        assert_eq!(body, plain);
        assert_eq!(expected, trailer);
    }

    #[rstest]
    #[case::wrong_key(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaab".as_slice(), 5, 3)]
    #[case::wrong_sequence(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".as_slice(), 5, 4)]
    #[case::wrong_connection_id(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".as_slice(), 6, 3)]
    fn test_mismatch(#[case] receiver_seed: &[u8], #[case] receiver_id: u32, #[case] receiver_sequence: u32) {
        let sender = PacketCipher::new(key(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"), 5, 99);
        let receiver = PacketCipher::new(key(receiver_seed), receiver_id, 99);

        let mut body = b"some payload".to_vec();
        let trailer = sender.encrypt(StructureType::Data, 3, &mut body);

        assert!(!receiver.decrypt_and_verify(StructureType::Data, receiver_sequence, &mut body, &trailer));
    }

    #[test]
    fn test_verify() {
        let cipher = PacketCipher::new(key(b"seed"), 1, 2);

        let mut body = b"payload".to_vec();
        let trailer = cipher.encrypt(StructureType::Ack, 0, &mut body);
        assert!(cipher.decrypt_and_verify(StructureType::Ack, 0, &mut body, &trailer));
        assert_eq!(body, b"payload");
    }

    #[test]
    fn test_tampered_body_is_detected() {
        let cipher = PacketCipher::new(key(b"seed"), 1, 2);

        let mut body = b"payload".to_vec();
        let trailer = cipher.encrypt(StructureType::Data, 7, &mut body);
        body[2] ^= 0x01;
        assert!(!cipher.decrypt_and_verify(StructureType::Data, 7, &mut body, &trailer));
    }
}
