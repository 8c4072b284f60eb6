//! Chunk sealing using ChaCha20-Poly1305
//!
//! Every chunk is sealed with the volume's chunk key and bound to its
//! coordinate through the associated data. The sealed format is:
//! `version (1 byte) || nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptError;

/// Size of ChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of ChaCha20-Poly1305 key in bytes (256 bits)
pub const SECRET_SIZE: usize = 32;
/// Size of the Poly1305 authentication tag in bytes
pub const TAG_SIZE: usize = 16;
/// Leading byte of every sealed frame
pub const FRAME_VERSION: u8 = 1;
/// Bytes a sealed frame adds on top of its plaintext
pub const FRAME_OVERHEAD: usize = 1 + NONCE_SIZE + TAG_SIZE;

/// A 256-bit symmetric key. Wiped from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret([u8; SECRET_SIZE]);

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

impl From<[u8; SECRET_SIZE]> for Secret {
    fn from(bytes: [u8; SECRET_SIZE]) -> Self {
        Secret(bytes)
    }
}

impl Secret {
    /// Create a secret from a byte slice
    ///
    /// # Errors
    ///
    /// Returns an error if the slice length is not exactly `SECRET_SIZE` bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, CryptError> {
        if data.len() != SECRET_SIZE {
            return Err(CryptError::Malformed(format!(
                "invalid secret size, expected {}, got {}",
                SECRET_SIZE,
                data.len()
            )));
        }
        let mut buff = [0; SECRET_SIZE];
        buff.copy_from_slice(data);
        Ok(buff.into())
    }

    /// Derive a sub-key for a purpose named by `context`.
    pub fn derive(&self, context: &str) -> Secret {
        Secret(blake3::derive_key(context, &self.0))
    }

    pub fn bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.bytes()))
    }

    /// Seal `plaintext` under `aad` using the caller-supplied nonce.
    ///
    /// Nonces come from the engine's random source; reusing one under the
    /// same key breaks confidentiality of both frames.
    pub fn seal(
        &self,
        plaintext: &[u8],
        aad: &[u8],
        nonce: [u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, CryptError> {
        let ciphertext = self
            .cipher()
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptError::Encrypt)?;

        let mut out = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        out.push(FRAME_VERSION);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed frame. Any tampering with the frame, or a mismatch in
    /// `aad`, fails authentication; `what` names the frame in the error.
    pub fn open(&self, frame: &[u8], aad: &[u8], what: &str) -> Result<Vec<u8>, CryptError> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(CryptError::AuthenticationFailure(format!(
                "{what}: frame too short ({} bytes)",
                frame.len()
            )));
        }
        if frame[0] != FRAME_VERSION {
            return Err(CryptError::AuthenticationFailure(format!(
                "{what}: unknown frame version {}",
                frame[0]
            )));
        }
        let nonce = Nonce::from_slice(&frame[1..1 + NONCE_SIZE]);
        self.cipher()
            .decrypt(
                nonce,
                Payload {
                    msg: &frame[1 + NONCE_SIZE..],
                    aad,
                },
            )
            .map_err(|_| CryptError::AuthenticationFailure(what.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key() -> Secret {
        Secret::from([7u8; SECRET_SIZE])
    }

    #[test]
    fn test_seal_open() {
        let secret = key();
        let data = b"hello world, this is a test message for encryption";

        let sealed = secret.seal(data, b"ctx", [1; NONCE_SIZE]).unwrap();
        assert_eq!(sealed.len(), data.len() + FRAME_OVERHEAD);
        assert_eq!(sealed[0], FRAME_VERSION);

        let opened = secret.open(&sealed, b"ctx", "test").unwrap();
        assert_eq!(data.as_slice(), opened.as_slice());
    }

    #[test]
    fn test_wrong_context_fails() {
        let secret = key();
        let sealed = secret.seal(b"block", b"ctx-a", [2; NONCE_SIZE]).unwrap();
        assert!(matches!(
            secret.open(&sealed, b"ctx-b", "test"),
            Err(CryptError::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn test_tamper_fails() {
        let secret = key();
        let mut sealed = secret.seal(b"some block bytes", b"ctx", [3; NONCE_SIZE]).unwrap();
        sealed[1 + NONCE_SIZE + 2] ^= 0xFF;
        assert!(secret.open(&sealed, b"ctx", "test").is_err());

        // truncated frames never reach the cipher
        assert!(secret.open(&sealed[..5], b"ctx", "test").is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = key().seal(b"data", b"ctx", [4; NONCE_SIZE]).unwrap();
        let other = Secret::from([8u8; SECRET_SIZE]);
        assert!(other.open(&sealed, b"ctx", "test").is_err());
    }

    #[test]
    fn test_secret_size_validation() {
        assert!(Secret::from_slice(&[1u8; 16]).is_err());
        assert!(Secret::from_slice(&[1u8; 64]).is_err());
        assert!(Secret::from_slice(&[1u8; SECRET_SIZE]).is_ok());
    }

    #[test]
    fn test_empty_data() {
        let secret = key();
        let sealed = secret.seal(b"", b"", [5; NONCE_SIZE]).unwrap();
        assert!(secret.open(&sealed, b"", "test").unwrap().is_empty());
    }

    #[test]
    fn test_derived_keys_differ() {
        let master = key();
        assert_ne!(master.derive("a").bytes(), master.derive("b").bytes());
        assert_eq!(master.derive("a").bytes(), master.derive("a").bytes());
    }
}
