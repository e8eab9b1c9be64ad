use aes::Aes256;
use anyhow::anyhow;
use ctr::cipher::{KeyIvInit, StreamCipher};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

// The whole 16-byte IV is the initial value of a 128-bit big-endian counter.
pub struct AesCtr(Aes256Ctr);

impl AesCtr {
    pub fn new(key: &[u8], iv: &[u8]) -> anyhow::Result<Self> {
        let inner = Aes256Ctr::new_from_slices(key, iv)
            .map_err(|e| anyhow!("invalid aes-256-ctr key or iv: {e}"))?;
        Ok(AesCtr(inner))
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }

    pub fn encrypt_b2b(&mut self, input: &[u8], output: &mut [u8]) -> anyhow::Result<()> {
        self.0
            .apply_keystream_b2b(input, output)
            .map_err(|e| anyhow!("aes-256-ctr: {e}"))
    }

    pub fn decrypt_b2b(&mut self, input: &[u8], output: &mut [u8]) -> anyhow::Result<()> {
        self.encrypt_b2b(input, output)
    }
}
