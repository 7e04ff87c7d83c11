//! Blind signing key
//!
//! The coordinator signs blinded output scripts during input registration
//! and later checks the unblinded signature when the output is registered,
//! without ever learning which input the output belongs to.
//!
//! Textbook RSA blind signatures:
//!
//! ```text
//!  client:      b = H(script) * r^e mod n
//!  coordinator: s' = b^d mod n                (sign_blinded)
//!  client:      s = s' * r^-1 mod n
//!  coordinator: s^e mod n == H(script)        (verify_output)
//! ```
//!
//! The key persists across restarts as `RsaKey.json` in the data directory.

use std::fs;
use std::io;
use std::path::Path;

use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

pub const KEY_FILE_NAME: &str = "RsaKey.json";

#[derive(Error, Debug)]
pub enum BlindingKeyError {
    #[error("key file I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("key file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("message is not smaller than the key modulus")]
    MessageOutOfRange,
}

#[derive(Debug, Clone)]
pub struct BlindingRsaKey {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl BlindingRsaKey {
    pub fn generate(bits: usize) -> Result<Self, BlindingKeyError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)?;
        Ok(Self::from_private(private))
    }

    fn from_private(private: RsaPrivateKey) -> Self {
        let public = private.to_public_key();
        Self { private, public }
    }

    /// Read the key at `path`, or generate one of `bits` and write it there.
    /// Blocking; key generation can take seconds.
    pub fn load_or_create(path: &Path, bits: usize) -> Result<Self, BlindingKeyError> {
        if path.exists() {
            let json = fs::read_to_string(path)?;
            let key = Self::from_json(&json)?;
            info!(path = %path.display(), "Loaded blinding key");
            return Ok(key);
        }

        let key = Self::generate(bits)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, key.to_json()?)?;
        info!(path = %path.display(), bits, "Created new blinding key");
        Ok(key)
    }

    pub fn to_json(&self) -> Result<String, BlindingKeyError> {
        Ok(serde_json::to_string_pretty(&self.private)?)
    }

    pub fn from_json(json: &str) -> Result<Self, BlindingKeyError> {
        let private: RsaPrivateKey = serde_json::from_str(json)?;
        private.validate()?;
        Ok(Self::from_private(private))
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Sign a client-blinded message: `blinded^d mod n`
    pub fn sign_blinded(&self, blinded: &[u8]) -> Result<Vec<u8>, BlindingKeyError> {
        let m = self.in_range(blinded)?;
        let signature = rsa::hazmat::rsa_decrypt_and_check(&self.private, Some(&mut OsRng), &m)?;
        Ok(signature.to_bytes_be())
    }

    /// Reject a blinded message this key could never sign
    pub fn check_blinded(&self, blinded: &[u8]) -> Result<(), BlindingKeyError> {
        self.in_range(blinded).map(|_| ())
    }

    /// Check an unblinded signature over `message`: `signature^e mod n == message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let (Ok(m), Ok(s)) = (self.in_range(message), self.in_range(signature)) else {
            return false;
        };
        match rsa::hazmat::rsa_encrypt(&self.public, &s) {
            Ok(recovered) => recovered == m,
            Err(_) => false,
        }
    }

    /// Check an unblinded signature over the SHA-256 of an output script
    pub fn verify_output(&self, script: &[u8], signature: &[u8]) -> bool {
        let digest = Sha256::digest(script);
        self.verify(digest.as_slice(), signature)
    }

    fn in_range(&self, bytes: &[u8]) -> Result<BigUint, BlindingKeyError> {
        let value = BigUint::from_bytes_be(bytes);
        if &value >= self.public.n() {
            return Err(BlindingKeyError::MessageOutOfRange);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn key() -> &'static BlindingRsaKey {
        static KEY: OnceLock<BlindingRsaKey> = OnceLock::new();
        KEY.get_or_init(|| BlindingRsaKey::generate(1024).unwrap())
    }

    #[test]
    fn test_sign_and_verify_output() {
        let key = key();
        let script = [0x00, 0x14, 0xab, 0xcd];
        let digest = Sha256::digest(script);

        let signature = key.sign_blinded(digest.as_slice()).unwrap();
        assert!(key.verify_output(&script, &signature));
        assert!(!key.verify_output(&[0x00, 0x14, 0xab, 0xce], &signature));
    }

    #[test]
    fn test_blinding_factor_carries_through() {
        let key = key();
        let n = key.public_key().n();
        let e = key.public_key().e();

        let m = BigUint::from_bytes_be(Sha256::digest(b"output").as_slice());
        let r = BigUint::from(1_000_003u32);
        let blinded = (&m * r.modpow(e, n)) % n;

        let blind_sig = BigUint::from_bytes_be(&key.sign_blinded(&blinded.to_bytes_be()).unwrap());
        let plain_sig = BigUint::from_bytes_be(&key.sign_blinded(&m.to_bytes_be()).unwrap());
        assert_eq!(blind_sig, (&plain_sig * &r) % n);
    }

    #[test]
    fn test_out_of_range_message_rejected() {
        let key = key();
        let too_big = vec![0xff; 256];
        assert!(matches!(
            key.sign_blinded(&too_big),
            Err(BlindingKeyError::MessageOutOfRange)
        ));
        assert!(!key.verify(&too_big, &[1]));
    }

    #[test]
    fn test_load_or_create_persists_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEY_FILE_NAME);
        fs::write(&path, key().to_json().unwrap()).unwrap();

        let loaded = BlindingRsaKey::load_or_create(&path, 1024).unwrap();
        assert_eq!(loaded.public_key(), key().public_key());
    }

    #[test]
    fn test_corrupt_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEY_FILE_NAME);
        fs::write(&path, "not json").unwrap();

        assert!(matches!(
            BlindingRsaKey::load_or_create(&path, 1024),
            Err(BlindingKeyError::Json(_))
        ));
    }
}
