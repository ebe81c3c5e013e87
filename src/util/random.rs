use rand::{Rng, RngCore};
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

const SEED_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    /// check codes are non-negative when interpreted as i32
    fn check_code() -> u32;
    fn key_seed(len: usize) -> Vec<u8>;
    fn secret_bytes() -> [u8; 32];
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn check_code() -> u32 {
        rand::thread_rng().gen_range(0..i32::MAX as u32)
    }

    fn key_seed(len: usize) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        (0..len)
            .map(|_| SEED_ALPHABET[rng.gen_range(0..SEED_ALPHABET.len())])
            .collect()
    }

    fn secret_bytes() -> [u8; 32] {
        let mut result = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut result);
        result
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_seed_alphabet() {
        let seed = RngRandom::key_seed(32);
        assert_eq!(seed.len(), 32);
        assert!(seed.iter().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }

    #[test]
    fn test_check_code_range() {
        for _ in 0..100 {
            assert!(RngRandom::check_code() < i32::MAX as u32);
        }
    }
}
