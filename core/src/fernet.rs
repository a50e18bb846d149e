//! Fernet tokens: AES-128-CBC with PKCS#7 padding, authenticated by
//! HMAC-SHA256, in a urlsafe-base64 envelope.
//!
//! Legacy v1 vault files were sealed this way with a key kept in a separate
//! key file. Only what the vault needs is here; token TTLs are not checked.
//!
//! ```text
//! 0x80 | timestamp (u64 BE) | IV (16) | ciphertext (n * 16) | HMAC (32)
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};

const VERSION: u8 = 0x80;
const HALF_KEY_LEN: usize = 16;
const IV_LEN: usize = 16;
const HEADER_LEN: usize = 1 + 8 + IV_LEN;
const TAG_LEN: usize = 32;
const BLOCK_LEN: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

const REJECTED: &str = "cannot decrypt legacy vault: wrong key file or tampered data";

/// A 32-byte Fernet key: signing half then encryption half.
pub struct FernetKey {
    signing: [u8; HALF_KEY_LEN],
    encryption: [u8; HALF_KEY_LEN],
}

impl FernetKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 2 * HALF_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    fn from_bytes(bytes: [u8; 2 * HALF_KEY_LEN]) -> Self {
        let mut signing = [0u8; HALF_KEY_LEN];
        let mut encryption = [0u8; HALF_KEY_LEN];
        signing.copy_from_slice(&bytes[..HALF_KEY_LEN]);
        encryption.copy_from_slice(&bytes[HALF_KEY_LEN..]);
        Self {
            signing,
            encryption,
        }
    }

    /// Parse the urlsafe-base64 key file contents (padding optional).
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes: [u8; 2 * HALF_KEY_LEN] = decode(encoded)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| Error::authentication("legacy key file does not hold a Fernet key"))?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn to_base64(&self) -> String {
        let mut bytes = Vec::with_capacity(2 * HALF_KEY_LEN);
        bytes.extend_from_slice(&self.signing);
        bytes.extend_from_slice(&self.encryption);
        URL_SAFE.encode(bytes)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        let ciphertext = Aes128CbcEnc::new_from_slices(&self.encryption, &iv)
            .map_err(|_| Error::internal("invalid Fernet key length"))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut token = Vec::with_capacity(HEADER_LEN + ciphertext.len() + TAG_LEN);
        token.push(VERSION);
        token.extend_from_slice(&timestamp.to_be_bytes());
        token.extend_from_slice(&iv);
        token.extend_from_slice(&ciphertext);
        let tag = self.mac(&token)?.finalize().into_bytes();
        token.extend_from_slice(&tag);
        Ok(URL_SAFE.encode(token))
    }

    /// Verify and decrypt a token. Any failure is [`Error::Authentication`].
    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>> {
        let token = decode(token).ok_or_else(|| Error::authentication(REJECTED))?;
        if token.len() < HEADER_LEN + BLOCK_LEN + TAG_LEN
            || token[0] != VERSION
            || (token.len() - HEADER_LEN - TAG_LEN) % BLOCK_LEN != 0
        {
            return Err(Error::authentication(REJECTED));
        }

        let (signed, tag) = token.split_at(token.len() - TAG_LEN);
        self.mac(signed)?
            .verify_slice(tag)
            .map_err(|_| Error::authentication(REJECTED))?;

        let iv = &signed[HEADER_LEN - IV_LEN..HEADER_LEN];
        let ciphertext = &signed[HEADER_LEN..];
        Aes128CbcDec::new_from_slices(&self.encryption, iv)
            .map_err(|_| Error::internal("invalid Fernet key length"))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::authentication(REJECTED))
    }

    fn mac(&self, data: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.signing)
            .map_err(|_| Error::internal("invalid Fernet key length"))?;
        mac.update(data);
        Ok(mac)
    }
}

fn decode(encoded: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(encoded.trim().trim_end_matches('='))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    // Reference vector from the Fernet specification
    const KEY: &str = "cw_0x689RpI-jtRR7oE8h_eQsKImvJapLeSbXpwF4e4=";
    const TOKEN: &str = "gAAAAAAdwJ6wAAECAwQFBgcICQoLDA0ODy021cpGVWKZ_eEwCGM4BLLF_5CV9dOPmrhuVUPgJobwOz7JcbmrR64jVmpU4IwqDA==";

    #[test]
    fn decrypts_reference_token() {
        let key = FernetKey::from_base64(KEY).unwrap();
        assert_eq!(key.decrypt(TOKEN).unwrap(), b"hello");
        assert_eq!(key.to_base64(), KEY);
    }

    #[test]
    fn tampered_token_or_wrong_key_is_rejected() {
        let key = FernetKey::from_base64(KEY).unwrap();
        let mut tampered = TOKEN.to_string();
        tampered.replace_range(40..41, "A");
        assert_eq!(key.decrypt(&tampered).unwrap_err().kind(), ErrorKind::Authentication);

        let other = FernetKey::generate();
        assert_eq!(other.decrypt(TOKEN).unwrap_err().kind(), ErrorKind::Authentication);
        assert_eq!(other.decrypt("not a token").unwrap_err().kind(), ErrorKind::Authentication);
    }

    #[test]
    fn own_tokens_decrypt() {
        let key = FernetKey::generate();
        let token = key.encrypt(br#"{"h1":{}}"#).unwrap();
        assert!(token.starts_with("gAAAAA"));
        assert_eq!(key.decrypt(&token).unwrap(), br#"{"h1":{}}"#);
    }

    #[test]
    fn short_key_file_is_rejected() {
        assert!(FernetKey::from_base64("c2hvcnQ=").is_err());
    }
}
