use anyhow::bail;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The keystream permutation of a connection, derived once from the handshake seed. Every packet
///  is encrypted with a keystream starting at this state.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey {
    state: [u8; CipherKey::STATE_LEN],
}

impl CipherKey {
    pub const STATE_LEN: usize = 256;

    /// RC4 key scheduling with the seed as key
    pub fn from_seed(seed: &[u8]) -> anyhow::Result<CipherKey> {
        if seed.is_empty() {
            bail!("empty key seed");
        }

        let mut state = [0u8; Self::STATE_LEN];
        for (i, s) in state.iter_mut().enumerate() {
            *s = i as u8;
        }

        let mut j = 0u8;
        for i in 0..Self::STATE_LEN {
            j = j.wrapping_add(state[i]).wrapping_add(seed[i % seed.len()]);
            state.swap(i, j as usize);
        }

        Ok(CipherKey { state })
    }

    pub fn keystream(&self) -> Keystream {
        Keystream {
            state: self.state,
            i: 0,
            j: 0,
        }
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keystream {
    state: [u8; CipherKey::STATE_LEN],
    i: u8,
    j: u8,
}

impl Keystream {
    pub fn next_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.state[self.i as usize]);
        self.state.swap(self.i as usize, self.j as usize);
        let idx = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
        self.state[idx as usize]
    }

    pub fn apply(&mut self, buf: &mut [u8]) {
        for b in buf {
            *b ^= self.next_byte();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::key(b"Key".as_slice(), b"Plaintext".as_slice(), vec![0xBB, 0xF3, 0x16, 0xE8, 0xD9, 0x40, 0xAF, 0x0A, 0xD3])]
    #[case::wiki(b"Wiki".as_slice(), b"pedia".as_slice(), vec![0x10, 0x21, 0xBF, 0x04, 0x20])]
    #[case::secret(b"Secret".as_slice(), b"Attack at dawn".as_slice(), vec![0x45, 0xA0, 0x1F, 0x64, 0x5F, 0xC3, 0x5B, 0x38, 0x35, 0x52, 0x54, 0x4B, 0x9B, 0xF5])]
    fn test_known_vectors(#[case] key: &[u8], #[case] plain: &[u8], #[case] expected: Vec<u8>) {
        let key = CipherKey::from_seed(key).unwrap();
        let mut buf = plain.to_vec();
        key.keystream().apply(&mut buf);
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_keystream_restarts() {
        let key = CipherKey::from_seed(b"abc").unwrap();
        let mut a = key.keystream();
        let mut b = key.keystream();
        for _ in 0..10 {
            assert_eq!(a.next_byte(), b.next_byte());
        }
    }

    #[test]
    fn test_empty_seed() {
        assert!(CipherKey::from_seed(&[]).is_err());
    }
}
