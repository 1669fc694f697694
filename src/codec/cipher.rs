// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use crate::error::Error;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::URL_SAFE, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use std::time::{SystemTime, UNIX_EPOCH};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Version octet of the authenticated token format.
const VERSION: u8 = 0x80;

/// Smallest valid token: version, timestamp, IV, one cipher block, MAC.
const MIN_TOKEN_LEN: usize = 1 + 8 + 16 + 16 + 32;

/// Authenticated, self-delimited byte transform applied to every wire record.
pub trait Cipher: Send + Sync {
    /// Encrypt `data`.
    fn encrypt(&self, data: &[u8]) -> Vec<u8>;

    /// Authenticate and decrypt `data`.
    fn decrypt(&self, data: &[u8]) -> crate::Result<Vec<u8>>;
}

/// Cleartext passthrough used when no cipher key is configured.
pub struct Plain;

impl Cipher for Plain {
    fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn decrypt(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Fernet-style cipher: AES-128-CBC with an HMAC-SHA256 tag.
///
/// The usual base64 envelope is stripped so the wire form is raw token
/// bytes: `0x80 || timestamp || iv || ciphertext || hmac`. The timestamp is
/// recorded but never enforced.
pub struct Fernet {
    /// First half of the decoded key, authenticates the token.
    signing_key: [u8; 16],

    /// Second half of the decoded key, encrypts the payload.
    encryption_key: [u8; 16],
}

impl Fernet {
    /// Create new [`Fernet`] from a urlsafe-base64 32-byte `key`.
    pub fn new(key: &str) -> crate::Result<Self> {
        let decoded = URL_SAFE
            .decode(key)
            .map_err(|_| Error::Config(String::from("cipher key is not valid base64")))?;

        let decoded: [u8; 32] = decoded
            .try_into()
            .map_err(|_| Error::Config(String::from("cipher key must decode to 32 bytes")))?;

        let mut signing_key = [0u8; 16];
        let mut encryption_key = [0u8; 16];
        signing_key.copy_from_slice(&decoded[..16]);
        encryption_key.copy_from_slice(&decoded[16..]);

        Ok(Self {
            signing_key,
            encryption_key,
        })
    }
}

impl Cipher for Fernet {
    fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let ciphertext = Aes128CbcEnc::new_from_slices(&self.encryption_key, &iv)
            .expect("key and iv lengths are fixed")
            .encrypt_padded_vec_mut::<Pkcs7>(data);

        let mut token = Vec::with_capacity(MIN_TOKEN_LEN + ciphertext.len());
        token.push(VERSION);
        token.extend_from_slice(&timestamp.to_be_bytes());
        token.extend_from_slice(&iv);
        token.extend_from_slice(&ciphertext);

        let mut mac = HmacSha256::new_from_slice(&self.signing_key).expect("any key length is valid");
        mac.update(&token);
        token.extend_from_slice(&mac.finalize().into_bytes());

        token
    }

    fn decrypt(&self, data: &[u8]) -> crate::Result<Vec<u8>> {
        if data.len() < MIN_TOKEN_LEN || data[0] != VERSION {
            return Err(Error::Cipher);
        }

        let (signed, tag) = data.split_at(data.len() - 32);

        let mut mac = HmacSha256::new_from_slice(&self.signing_key).expect("any key length is valid");
        mac.update(signed);
        mac.verify_slice(tag).map_err(|_| Error::Cipher)?;

        Aes128CbcDec::new_from_slices(&self.encryption_key, &signed[9..25])
            .expect("key and iv lengths are fixed")
            .decrypt_padded_vec_mut::<Pkcs7>(&signed[25..])
            .map_err(|_| Error::Cipher)
    }
}

/// Generate a fresh urlsafe-base64 cipher key.
pub fn generate_key() -> String {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);

    URL_SAFE.encode(key)
}

/// Compare two byte strings without leaking the mismatch position.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.iter().zip(b.iter()).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "bdDmN4VexpDvTrs6gw8xTzaFvIBobFg1Cx2McFB1RmI=";

    #[test]
    fn encrypt_decrypt() {
        let cipher = Fernet::new(KEY).unwrap();

        for data in [&b""[..], &b"a"[..], &b"test data"[..], &[0xffu8; 1000][..]] {
            let encrypted = cipher.encrypt(data);

            assert_ne!(&encrypted, data);
            assert_eq!(cipher.decrypt(&encrypted).unwrap(), data);
        }
    }

    #[test]
    fn tampering_is_rejected() {
        let cipher = Fernet::new(KEY).unwrap();
        let mut encrypted = cipher.encrypt(b"test data");

        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;

        assert!(matches!(cipher.decrypt(&encrypted), Err(Error::Cipher)));
    }

    #[test]
    fn truncated_token_is_rejected() {
        let cipher = Fernet::new(KEY).unwrap();

        assert!(matches!(cipher.decrypt(b"short"), Err(Error::Cipher)));
        assert!(matches!(cipher.decrypt(&[]), Err(Error::Cipher)));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let cipher = Fernet::new(KEY).unwrap();
        let mut encrypted = cipher.encrypt(b"test data");
        encrypted[0] = 0x81;

        assert!(matches!(cipher.decrypt(&encrypted), Err(Error::Cipher)));
    }

    #[test]
    fn invalid_key_is_rejected() {
        assert!(Fernet::new("not base64!").is_err());
        assert!(Fernet::new("dG9vIHNob3J0").is_err());
    }

    #[test]
    fn generated_keys_are_valid() {
        let key = generate_key();

        assert_eq!(key.len(), 44);
        assert!(Fernet::new(&key).is_ok());
    }

    #[test]
    fn plain_is_identity() {
        assert_eq!(Plain.encrypt(b"test data"), b"test data");
        assert_eq!(Plain.decrypt(b"test data").unwrap(), b"test data");
    }

    #[test]
    fn comparison_checks_length_and_content() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secres"));
        assert!(!constant_time_eq(b"secret", b"secret "));
        assert!(constant_time_eq(b"", b""));
    }
}
