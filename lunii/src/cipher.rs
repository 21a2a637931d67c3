//! Storyteller index cipher
//!
//! Every encrypted file on the device uses XXTEA (Corrected Block TEA) with
//! two deviations from the reference construction:
//! - the round count is `1 + 52 / words` instead of `6 + 52 / words`
//! - no length prefix or padding, the ciphertext is exactly the plaintext size
//!
//! Content files only cipher their first 512 bytes. Everything past that
//! boundary is stored in the clear, see [`Xxtea::decrypt_file`].

use byteorder::{ByteOrder, LE};

/// Number of leading bytes ciphered in a content file.
pub const FILE_BLOCK_SIZE: usize = 0x200;

const DELTA: u32 = 0x9E37_79B9;

/// Raw 16-byte cipher key.
pub type Key = [u8; 16];

/// Device-family key shared by every unit, stored on the external flash as
/// four little-endian words.
pub const GENERIC_KEY: Key = key_from_words([0x91BD7A0A, 0xA75440A9, 0xBBD49D6C, 0xE0DCC0E3]);

const fn key_from_words(words: [u32; 4]) -> Key {
    let mut key = [0; 16];
    let mut i = 0;
    while i < 4 {
        let bytes = words[i].to_le_bytes();
        let mut j = 0;
        while j < 4 {
            key[i * 4 + j] = bytes[j];
            j += 1;
        }
        i += 1;
    }
    key
}

/// Round count used for a ciphered span of `len` bytes.
pub fn rounds(len: usize) -> u32 {
    1 + (52 / (len / 4).max(1)) as u32
}

#[derive(Clone)]
pub struct Xxtea {
    key: [u32; 4],
}

impl std::fmt::Debug for Xxtea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Xxtea(..)")
    }
}

impl Xxtea {
    pub fn new(key: &Key) -> Self {
        let mut words = [0; 4];
        LE::read_u32_into(key, &mut words);
        Self { key: words }
    }

    fn words(data: &[u8]) -> Result<Vec<u32>, super::Error> {
        if data.len() % 4 != 0 {
            return Err(super::Error::DecryptionFailure {
                len: data.len(),
                reason: "length is not a multiple of 4",
            });
        }
        if data.len() < 8 {
            return Err(super::Error::DecryptionFailure {
                len: data.len(),
                reason: "at least two words are required",
            });
        }
        let mut words = vec![0; data.len() / 4];
        LE::read_u32_into(data, &mut words);
        Ok(words)
    }

    fn bytes(words: &[u32]) -> Vec<u8> {
        let mut bytes = vec![0; words.len() * 4];
        LE::write_u32_into(words, &mut bytes);
        bytes
    }

    #[inline]
    fn mx(&self, sum: u32, y: u32, z: u32, p: usize, e: usize) -> u32 {
        (((z >> 5) ^ (y << 2)).wrapping_add((y >> 3) ^ (z << 4)))
            ^ ((sum ^ y).wrapping_add(self.key[(p & 3) ^ e] ^ z))
    }

    fn decrypt_words(&self, v: &mut [u32]) {
        let n = v.len();
        let mut sum = rounds(n * 4).wrapping_mul(DELTA);
        let mut y = v[0];
        for _ in 0..rounds(n * 4) {
            let e = ((sum >> 2) & 3) as usize;
            for p in (1..n).rev() {
                let z = v[p - 1];
                v[p] = v[p].wrapping_sub(self.mx(sum, y, z, p, e));
                y = v[p];
            }
            let z = v[n - 1];
            v[0] = v[0].wrapping_sub(self.mx(sum, y, z, 0, e));
            y = v[0];
            sum = sum.wrapping_sub(DELTA);
        }
    }

    fn encrypt_words(&self, v: &mut [u32]) {
        let n = v.len();
        let mut sum = 0u32;
        let mut z = v[n - 1];
        for _ in 0..rounds(n * 4) {
            sum = sum.wrapping_add(DELTA);
            let e = ((sum >> 2) & 3) as usize;
            for p in 0..n - 1 {
                let y = v[p + 1];
                v[p] = v[p].wrapping_add(self.mx(sum, y, z, p, e));
                z = v[p];
            }
            let y = v[0];
            v[n - 1] = v[n - 1].wrapping_add(self.mx(sum, y, z, n - 1, e));
            z = v[n - 1];
        }
    }

    /// Deciphers the whole buffer, round count derived from its length.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, super::Error> {
        let mut words = Self::words(data)?;
        self.decrypt_words(&mut words);
        Ok(Self::bytes(&words))
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, super::Error> {
        let mut words = Self::words(data)?;
        self.encrypt_words(&mut words);
        Ok(Self::bytes(&words))
    }

    /// Deciphers the leading [`FILE_BLOCK_SIZE`] bytes of a content file and
    /// appends the plaintext tail untouched.
    pub fn decrypt_file(&self, data: &[u8]) -> Result<Vec<u8>, super::Error> {
        if data.is_empty() {
            return Ok(vec![]);
        }
        let (block, tail) = data.split_at(data.len().min(FILE_BLOCK_SIZE));
        let mut out = self.decrypt(block)?;
        out.extend_from_slice(tail);
        Ok(out)
    }

    pub fn encrypt_file(&self, data: &[u8]) -> Result<Vec<u8>, super::Error> {
        if data.is_empty() {
            return Ok(vec![]);
        }
        let (block, tail) = data.split_at(data.len().min(FILE_BLOCK_SIZE));
        let mut out = self.encrypt(block)?;
        out.extend_from_slice(tail);
        Ok(out)
    }
}

/// Deciphers `data` as a single block with `key`.
pub fn decrypt(key: &Key, data: &[u8]) -> Result<Vec<u8>, super::Error> {
    Xxtea::new(key).decrypt(data)
}

pub fn encrypt(key: &Key, data: &[u8]) -> Result<Vec<u8>, super::Error> {
    Xxtea::new(key).encrypt(data)
}

pub fn decrypt_file(key: &Key, data: &[u8]) -> Result<Vec<u8>, super::Error> {
    Xxtea::new(key).decrypt_file(data)
}

pub fn encrypt_file(key: &Key, data: &[u8]) -> Result<Vec<u8>, super::Error> {
    Xxtea::new(key).encrypt_file(data)
}
