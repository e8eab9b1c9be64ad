//! Stream ciphers used on both legs of the inbound tunnel.
//!
//! A [`Cipher`] covers one direction of one session. The read side is built
//! from the IV the client sends first; the write side generates its own IV,
//! which is sent back to the client in the clear before any payload.
//!
//! Sessions only transform in place or buffer to buffer. The whole-slice
//! `encrypt`/`decrypt` helpers are compiled for tests alone.

mod aes_ctr;

use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};
use rand::RngCore;

use crate::buffer::Buffer;
use crate::error::ProtocolError;

use aes_ctr::AesCtr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherMode {
    Aes256Ctr,
}

impl CipherMode {
    pub fn key_len(self) -> usize {
        match self {
            CipherMode::Aes256Ctr => aes_ctr::KEY_LEN,
        }
    }

    pub fn iv_len(self) -> usize {
        match self {
            CipherMode::Aes256Ctr => aes_ctr::IV_LEN,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CipherMode::Aes256Ctr => "aes-256-ctr",
        }
    }

    /// Derives the session key for this mode from a password.
    pub fn derive_key(self, password: &str) -> Vec<u8> {
        password_to_key(password, self.key_len())
    }
}

impl FromStr for CipherMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aes-256-ctr" => Ok(CipherMode::Aes256Ctr),
            other => Err(ProtocolError::UnsupportedCipher(other.to_owned())),
        }
    }
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `MD5(p) ++ MD5(MD5(p) ++ p) ++ ...` truncated to `size` bytes.
/// For a 32-byte key this is exactly two rounds.
pub fn password_to_key(password: &str, size: usize) -> Vec<u8> {
    let pass = password.as_bytes();
    let mut key = Vec::with_capacity(size + 16);
    let mut sum = Md5::digest(pass).to_vec();
    key.extend_from_slice(&sum);
    while key.len() < size {
        let mut hasher = Md5::new();
        hasher.update(&sum);
        hasher.update(pass);
        sum = hasher.finalize().to_vec();
        key.extend_from_slice(&sum);
    }
    key.truncate(size);
    key
}

enum Inner {
    Aes256Ctr(AesCtr),
}

pub struct Cipher {
    iv: Vec<u8>,
    inner: Option<Inner>,
}

impl Cipher {
    /// Creates a cipher with a freshly generated IV, for the return stream.
    pub fn encryptor(mode: CipherMode, key: &[u8]) -> anyhow::Result<Self> {
        let mut iv = vec![0u8; mode.iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);
        Self::with_iv(mode, key, iv)
    }

    /// Creates a cipher keyed with an IV received from the peer.
    pub fn decryptor(mode: CipherMode, key: &[u8], iv: &[u8]) -> anyhow::Result<Self> {
        if iv.len() != mode.iv_len() {
            return Err(ProtocolError::IvLength {
                expected: mode.iv_len(),
                actual: iv.len(),
            }
            .into());
        }
        Self::with_iv(mode, key, iv.to_vec())
    }

    fn with_iv(mode: CipherMode, key: &[u8], iv: Vec<u8>) -> anyhow::Result<Self> {
        let inner = match mode {
            CipherMode::Aes256Ctr => Inner::Aes256Ctr(AesCtr::new(key, &iv)?),
        };
        Ok(Cipher {
            iv,
            inner: Some(inner),
        })
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn decrypt_in_place(&mut self, data: &mut [u8]) -> anyhow::Result<()> {
        match self.inner_mut()? {
            Inner::Aes256Ctr(c) => c.decrypt(data),
        }
        Ok(())
    }

    /// Encrypts every filled byte of `src` onto the end of `dst`, then empties `src`.
    pub fn encrypt_buf(&mut self, src: &mut Buffer, dst: &mut Buffer) -> anyhow::Result<()> {
        let n = src.len();
        dst.reserve(n);
        match self.inner_mut()? {
            Inner::Aes256Ctr(c) => c.encrypt_b2b(src.filled(), &mut dst.unfilled_mut()[..n])?,
        }
        dst.advance(n);
        src.clear();
        Ok(())
    }

    /// Decrypts every filled byte of `src` onto the end of `dst`, then empties `src`.
    pub fn decrypt_buf(&mut self, src: &mut Buffer, dst: &mut Buffer) -> anyhow::Result<()> {
        let n = src.len();
        dst.reserve(n);
        match self.inner_mut()? {
            Inner::Aes256Ctr(c) => c.decrypt_b2b(src.filled(), &mut dst.unfilled_mut()[..n])?,
        }
        dst.advance(n);
        src.clear();
        Ok(())
    }

    /// Releases the cipher state. Returns `true` only for the call that
    /// actually finalized it; later calls are no-ops.
    pub fn finish(&mut self) -> bool {
        self.inner.take().is_some()
    }

    fn inner_mut(&mut self) -> anyhow::Result<&mut Inner> {
        self.inner
            .as_mut()
            .ok_or_else(|| ProtocolError::CipherFinished.into())
    }
}

/// Whole-slice helpers for driving the client side in tests.
#[cfg(test)]
impl Cipher {
    pub fn encrypt(&mut self, plain: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut out = vec![0u8; plain.len()];
        match self.inner_mut()? {
            Inner::Aes256Ctr(c) => c.encrypt_b2b(plain, &mut out)?,
        }
        Ok(out)
    }

    pub fn decrypt(&mut self, sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut out = sealed.to_vec();
        self.decrypt_in_place(&mut out)?;
        Ok(out)
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_none()
    }
}

impl Drop for Cipher {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn key_derivation_matches_known_values() {
        assert_eq!(
            password_to_key("password", 32),
            unhex("5f4dcc3b5aa765d61d8327deb882cf992b95990a9151374abd8ff8c5a7a0fe08")
        );
        assert_eq!(
            CipherMode::Aes256Ctr.derive_key(""),
            unhex("d41d8cd98f00b204e9800998ecf8427e59adb24ef3cdbe0297f05b395827453f")
        );
    }

    #[test]
    fn key_derivation_is_deterministic_and_distinct() {
        let passwords = ["holo", "password", "Password", "pässwörd", "a", "aa", ""];
        let keys: Vec<_> = passwords.iter().map(|p| password_to_key(p, 32)).collect();
        for (i, p) in passwords.iter().enumerate() {
            assert_eq!(keys[i], password_to_key(p, 32));
            assert_eq!(keys[i].len(), 32);
            for j in (i + 1)..keys.len() {
                assert_ne!(keys[i], keys[j], "{:?} vs {:?}", passwords[i], passwords[j]);
            }
        }
    }

    #[test]
    fn aes_256_ctr_known_answer() {
        let key = unhex("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4");
        let iv = unhex("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff");
        let plain = unhex("6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51");
        let mut c = Cipher::decryptor(CipherMode::Aes256Ctr, &key, &iv).unwrap();
        assert_eq!(
            c.encrypt(&plain).unwrap(),
            unhex("601ec313775789a5b7a7f504bbf3d228f443e3ca4d62b59aca84e990cacaf5c5")
        );
    }

    #[test]
    fn round_trip_across_uneven_chunks() {
        let key = CipherMode::Aes256Ctr.derive_key("holo");
        let mut enc = Cipher::encryptor(CipherMode::Aes256Ctr, &key).unwrap();
        let mut dec = Cipher::decryptor(CipherMode::Aes256Ctr, &key, enc.iv()).unwrap();
        assert_eq!(enc.iv().len(), 16);

        let plain: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut cipher_text = Vec::new();
        for chunk in plain.chunks(13) {
            let out = enc.encrypt(chunk).unwrap();
            assert_eq!(out.len(), chunk.len());
            cipher_text.extend_from_slice(&out);
        }
        assert_ne!(cipher_text, plain);

        let mut decoded = Vec::new();
        let mut rest = &cipher_text[..];
        for size in [1usize, 2, 15, 16, 17, 100, 4096].iter().cycle() {
            if rest.is_empty() {
                break;
            }
            let n = (*size).min(rest.len());
            decoded.extend_from_slice(&dec.decrypt(&rest[..n]).unwrap());
            rest = &rest[n..];
        }
        assert_eq!(decoded, plain);
    }

    #[test]
    fn buffer_variants_consume_source() {
        let key = CipherMode::Aes256Ctr.derive_key("holo");
        let mut enc = Cipher::encryptor(CipherMode::Aes256Ctr, &key).unwrap();
        let mut dec = Cipher::decryptor(CipherMode::Aes256Ctr, &key, enc.iv()).unwrap();

        let mut plain = Buffer::with_capacity(8);
        let mut sealed = Buffer::with_capacity(8);
        plain.extend_from_slice(b"hello, world");
        enc.encrypt_buf(&mut plain, &mut sealed).unwrap();
        assert!(plain.is_empty());
        assert_eq!(sealed.len(), 12);

        let mut opened = Buffer::with_capacity(4);
        opened.extend_from_slice(b">");
        dec.decrypt_buf(&mut sealed, &mut opened).unwrap();
        assert!(sealed.is_empty());
        assert_eq!(opened.filled(), b">hello, world");
    }

    #[test]
    fn finish_is_idempotent() {
        let key = CipherMode::Aes256Ctr.derive_key("holo");
        let mut c = Cipher::encryptor(CipherMode::Aes256Ctr, &key).unwrap();
        assert!(c.finish());
        assert!(!c.finish());
        assert!(c.is_finished());
        let err = c.encrypt(b"x").unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProtocolError>(),
            Some(&ProtocolError::CipherFinished)
        );

        // never used, still finishable
        let mut unused = Cipher::encryptor(CipherMode::Aes256Ctr, &key).unwrap();
        assert!(unused.finish());
    }

    #[test]
    fn mode_selection() {
        assert_eq!("aes-256-ctr".parse::<CipherMode>(), Ok(CipherMode::Aes256Ctr));
        assert_eq!(
            "rc4-md5".parse::<CipherMode>(),
            Err(ProtocolError::UnsupportedCipher("rc4-md5".into()))
        );
        let key = CipherMode::Aes256Ctr.derive_key("holo");
        assert!(Cipher::decryptor(CipherMode::Aes256Ctr, &key, &[0u8; 8]).is_err());
    }
}
