use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tracing::warn;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::rc4::CipherKey;
use crate::util::random::Random;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SEED_LEN: usize = 32;

/// The public half of a process's key pair. A server sends it to every peer during the
///  handshake.
///
/// Peers do not encrypt the seed with it (see [`SeedOffer::seal_for`]), so the secret half is
///  dropped and zeroized right after deriving the public key.
pub struct KeyPair {
    public: PublicKey,
}

impl KeyPair {
    pub fn generate<R: Random>() -> KeyPair {
        let secret = StaticSecret::from(R::secret_bytes());
        KeyPair {
            public: PublicKey::from(&secret),
        }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        *self.public.as_bytes()
    }
}

pub fn parse_public_key(raw: &[u8]) -> anyhow::Result<[u8; PUBLIC_KEY_LEN]> {
    match raw.try_into() {
        Ok(key) => Ok(key),
        Err(_) => bail!("public key has length {}, expected {}", raw.len(), PUBLIC_KEY_LEN),
    }
}

/// The initiator's side of the key exchange: a fresh random seed and the key derived from it
pub struct SeedOffer {
    pub seed: Vec<u8>,
    pub key: CipherKey,
}

impl SeedOffer {
    pub fn generate<R: Random>() -> anyhow::Result<SeedOffer> {
        let seed = R::key_seed(SEED_LEN);
        let key = CipherKey::from_seed(&seed)?;
        Ok(SeedOffer { seed, key })
    }

    /// Serializes the seed for sending to the responder.
    ///
    /// NB: This is a known security gap: the seed travels in the clear, the responder's public key
    ///      is checked for well-formedness but not used to protect the seed. Closing the gap needs
    ///      an agreed ciphertext format on both sides.
    pub fn seal_for(&self, _peer_public_key: &[u8; PUBLIC_KEY_LEN]) -> Bytes {
        warn!("sending key seed unprotected - the symmetric key is visible to anyone observing the handshake");
        BytesMut::from(self.seed.as_slice()).freeze()
    }
}

/// The responder's side: derive the connection key from the seed received during the handshake
pub fn open_seed(sealed: &[u8]) -> anyhow::Result<CipherKey> {
    if sealed.len() != SEED_LEN {
        bail!("key seed has length {}, expected {}", sealed.len(), SEED_LEN);
    }
    CipherKey::from_seed(sealed)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::random::{MockRandom, RngRandom, MOCK_RANDOM_MUTEX};

    #[test]
    fn test_seed_exchange_yields_same_key() {
        let responder = KeyPair::generate::<RngRandom>();
        let offer = SeedOffer::generate::<RngRandom>().unwrap();

        let sealed = offer.seal_for(&parse_public_key(&responder.public_key()).unwrap());
        let responder_key = open_seed(&sealed).unwrap();

        let mut a = *b"payload!";
        let mut b = a;
        offer.key.keystream().apply(&mut a);
        responder_key.keystream().apply(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_pairs_differ() {
        let a = KeyPair::generate::<RngRandom>();
        let b = KeyPair::generate::<RngRandom>();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_public_key_is_derived_from_secret() {
        let _lock = MOCK_RANDOM_MUTEX.lock();
        let ctx = MockRandom::secret_bytes_context();
        ctx.expect().return_const([7u8; 32]);

        let key_pair = KeyPair::generate::<MockRandom>();
        assert_eq!(key_pair.public_key(), *PublicKey::from(&StaticSecret::from([7u8; 32])).as_bytes());
    }

    #[test]
    fn test_malformed_input() {
        assert!(parse_public_key(&[1, 2, 3]).is_err());
        assert!(open_seed(b"too short").is_err());
    }
}
