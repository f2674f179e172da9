//! EME wide-block tweakable cipher (ECB-Mix-ECB) over AES-256.
//!
//! Filenames are encrypted as a single wide block so that a one-bit change
//! anywhere in the name flips the entire ciphertext. The construction is
//! Halevi-Rogaway EME as used by the gocryptfs on-disk format: input length
//! must be a multiple of 16 bytes, between 1 and 128 AES blocks, and the
//! tweak is the 16-byte per-directory IV.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use thiserror::Error;

/// AES block size in bytes.
const BLOCK: usize = 16;

/// EME is defined for at most 128 AES blocks (2048 bytes).
const MAX_BLOCKS: usize = 128;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EmeError {
    /// Input is empty, too long, or not a multiple of the AES block size.
    #[error("EME input length {0} invalid: must be a multiple of 16 in [16, 2048]")]
    InvalidLength(usize),
}

#[derive(Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// EME cipher instance holding the AES-256 key schedule.
pub struct EmeCipher {
    block: Aes256,
}

impl EmeCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            block: Aes256::new(GenericArray::from_slice(key)),
        }
    }

    /// Encrypt `plaintext` (16-byte multiple) under the 16-byte `tweak`.
    pub fn encrypt(&self, tweak: &[u8; BLOCK], plaintext: &[u8]) -> Result<Vec<u8>, EmeError> {
        self.transform(tweak, plaintext, Direction::Encrypt)
    }

    /// Decrypt `ciphertext` (16-byte multiple) under the 16-byte `tweak`.
    pub fn decrypt(&self, tweak: &[u8; BLOCK], ciphertext: &[u8]) -> Result<Vec<u8>, EmeError> {
        self.transform(tweak, ciphertext, Direction::Decrypt)
    }

    fn aes_transform(&self, data: &mut [u8; BLOCK], dir: Direction) {
        let ga = GenericArray::from_mut_slice(data);
        match dir {
            Direction::Encrypt => self.block.encrypt_block(ga),
            Direction::Decrypt => self.block.decrypt_block(ga),
        }
    }

    /// L table: L_j = 2^(j+1) * AES-enc(0^16), always using the *encryption*
    /// direction regardless of the transform direction.
    fn tabulate_l(&self, m: usize) -> Vec<[u8; BLOCK]> {
        let mut li = [0u8; BLOCK];
        self.block
            .encrypt_block(GenericArray::from_mut_slice(&mut li));
        let mut table = Vec::with_capacity(m);
        for _ in 0..m {
            li = mult_by_two(&li);
            table.push(li);
        }
        table
    }

    fn transform(
        &self,
        tweak: &[u8; BLOCK],
        data: &[u8],
        dir: Direction,
    ) -> Result<Vec<u8>, EmeError> {
        if data.is_empty() || data.len() % BLOCK != 0 || data.len() > MAX_BLOCKS * BLOCK {
            return Err(EmeError::InvalidLength(data.len()));
        }
        let m = data.len() / BLOCK;
        let l_table = self.tabulate_l(m);

        let mut c = vec![0u8; data.len()];
        for j in 0..m {
            let mut ppj = xor_blocks(block_at(data, j), &l_table[j]);
            self.aes_transform(&mut ppj, dir);
            c[j * BLOCK..(j + 1) * BLOCK].copy_from_slice(&ppj);
        }

        let mut mp = xor_blocks(block_at(&c, 0), tweak);
        for j in 1..m {
            mp = xor_blocks(&mp, block_at(&c, j));
        }
        let mut mc = mp;
        self.aes_transform(&mut mc, dir);
        let mut mask = xor_blocks(&mp, &mc);

        for j in 1..m {
            mask = mult_by_two(&mask);
            let cccj = xor_blocks(block_at(&c, j), &mask);
            c[j * BLOCK..(j + 1) * BLOCK].copy_from_slice(&cccj);
        }

        let mut ccc1 = xor_blocks(&mc, tweak);
        for j in 1..m {
            ccc1 = xor_blocks(&ccc1, block_at(&c, j));
        }
        c[0..BLOCK].copy_from_slice(&ccc1);

        for j in 0..m {
            let mut ccj = *block_at(&c, j);
            self.aes_transform(&mut ccj, dir);
            let out = xor_blocks(&ccj, &l_table[j]);
            c[j * BLOCK..(j + 1) * BLOCK].copy_from_slice(&out);
        }
        Ok(c)
    }
}

impl std::fmt::Debug for EmeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EmeCipher(..)")
    }
}

fn block_at(data: &[u8], j: usize) -> &[u8; BLOCK] {
    data[j * BLOCK..(j + 1) * BLOCK].try_into().unwrap()
}

fn xor_blocks(a: &[u8; BLOCK], b: &[u8; BLOCK]) -> [u8; BLOCK] {
    let mut out = [0u8; BLOCK];
    for i in 0..BLOCK {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// GF(2^128) doubling in the byte order EME specifies.
fn mult_by_two(input: &[u8; BLOCK]) -> [u8; BLOCK] {
    let mut out = [0u8; BLOCK];
    out[0] = input[0].wrapping_mul(2);
    if input[BLOCK - 1] >= 128 {
        out[0] ^= 135;
    }
    for j in 1..BLOCK {
        out[j] = input[j].wrapping_mul(2);
        if input[j - 1] >= 128 {
            out[j] += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> EmeCipher {
        EmeCipher::new(&[0x1fu8; 32])
    }

    #[test]
    fn test_roundtrip_single_block() {
        let eme = test_cipher();
        let tweak = [0x55u8; 16];
        let pt = [0xabu8; 16];
        let ct = eme.encrypt(&tweak, &pt).unwrap();
        assert_eq!(ct.len(), 16);
        assert_ne!(ct, pt);
        assert_eq!(eme.decrypt(&tweak, &ct).unwrap(), pt);
    }

    #[test]
    fn test_roundtrip_all_valid_lengths() {
        let eme = test_cipher();
        let tweak = [3u8; 16];
        for blocks in [1usize, 2, 3, 16, 127, 128] {
            let pt: Vec<u8> = (0..blocks * 16).map(|i| i as u8).collect();
            let ct = eme.encrypt(&tweak, &pt).unwrap();
            assert_eq!(ct.len(), pt.len());
            assert_eq!(eme.decrypt(&tweak, &ct).unwrap(), pt);
        }
    }

    #[test]
    fn test_tweak_changes_ciphertext() {
        let eme = test_cipher();
        let pt = [9u8; 32];
        let a = eme.encrypt(&[0u8; 16], &pt).unwrap();
        let b = eme.encrypt(&[1u8; 16], &pt).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_single_bit_diffuses() {
        // A wide-block cipher must flip (roughly half of) the whole output
        // when one input bit changes, not just one 16-byte block.
        let eme = test_cipher();
        let tweak = [7u8; 16];
        let mut pt = vec![0u8; 64];
        let a = eme.encrypt(&tweak, &pt).unwrap();
        pt[63] ^= 1;
        let b = eme.encrypt(&tweak, &pt).unwrap();
        let differing_blocks = (0..4)
            .filter(|&j| a[j * 16..(j + 1) * 16] != b[j * 16..(j + 1) * 16])
            .count();
        assert_eq!(differing_blocks, 4);
    }

    #[test]
    fn test_deterministic() {
        let eme = test_cipher();
        let tweak = [2u8; 16];
        let pt = b"0123456789abcdef";
        assert_eq!(
            eme.encrypt(&tweak, pt).unwrap(),
            eme.encrypt(&tweak, pt).unwrap()
        );
    }

    #[test]
    fn test_invalid_lengths_rejected() {
        let eme = test_cipher();
        let tweak = [0u8; 16];
        assert_eq!(
            eme.encrypt(&tweak, &[]).unwrap_err(),
            EmeError::InvalidLength(0)
        );
        assert_eq!(
            eme.encrypt(&tweak, &[0u8; 15]).unwrap_err(),
            EmeError::InvalidLength(15)
        );
        assert_eq!(
            eme.encrypt(&tweak, &[0u8; 2064]).unwrap_err(),
            EmeError::InvalidLength(2064)
        );
    }

    #[test]
    fn test_mult_by_two_known_step() {
        // Doubling a unit vector shifts the bit within the first byte.
        let mut v = [0u8; 16];
        v[0] = 1;
        let doubled = mult_by_two(&v);
        assert_eq!(doubled[0], 2);
        assert!(doubled[1..].iter().all(|&b| b == 0));
        // Overflow of the last byte folds back via the reduction polynomial.
        let mut hi = [0u8; 16];
        hi[15] = 0x80;
        let folded = mult_by_two(&hi);
        assert_eq!(folded[0], 135);
        assert_eq!(folded[15], 0);
    }
}
