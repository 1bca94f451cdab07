use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier as _;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("malformed public key")]
    MalformedKey(#[from] rsa::pkcs1::Error),

    #[error("invalid signature encoding")]
    MalformedSignature,

    #[error("signature verification failed")]
    BadSignature,
}

/// Computes the SHA-256 digest of a file's full contents, hex-encoded.
pub fn sha256_file(path: &Path) -> Result<String, VerifyError> {
    let mut file = File::open(path)?;
    sha256_reader(&mut file)
}

/// Computes the SHA-256 digest over a stream, hex-encoded. Used by the
/// Fetcher's streaming digest variant, which re-hashes any bytes already on
/// disk before continuing over newly-downloaded ones.
pub fn sha256_reader<R: Read>(reader: &mut R) -> Result<String, VerifyError> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

/// A running SHA-256 digest a caller can feed bytes into incrementally, for
/// `fetch_sha256`'s resume-then-continue usage.
#[derive(Default)]
pub struct StreamingSha256(Sha256);

impl StreamingSha256 {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize_hex(self) -> String {
        hex_encode(&self.0.finalize())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Verifies that the SHA-256 of `path` equals `expected` (lowercase hex).
pub fn verify_sha256(path: &Path, expected: &str) -> Result<(), VerifyError> {
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(VerifyError::HashMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// A repository or package public key, as stored under
/// `<metadir>/keys/<fingerprint>.plist`.
pub struct PublicKey {
    key: RsaPublicKey,
}

impl PublicKey {
    /// Parses a DER-encoded RSA public key (the `public-key` idxmeta field).
    pub fn from_der(der: &[u8]) -> Result<Self, VerifyError> {
        Ok(PublicKey {
            key: RsaPublicKey::from_pkcs1_der(der)?,
        })
    }

    /// The SHA-256 fingerprint used as the on-disk key filename.
    pub fn fingerprint(&self) -> String {
        let der = self.key.to_pkcs1_der().expect("valid key").as_bytes().to_vec();
        let mut hasher = Sha256::new();
        hasher.update(&der);
        hex_encode(&hasher.finalize())
    }

    /// Verifies a PKCS#1v1.5 signature over `message` (the raw bytes of
    /// `index.plist`, or a package artifact's payload bytes).
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), VerifyError> {
        let sig = Signature::try_from(signature).map_err(|_| VerifyError::MalformedSignature)?;
        let verifying_key = VerifyingKey::<Sha256>::new(self.key.clone());
        verifying_key
            .verify(message, &sig)
            .map_err(|_| VerifyError::BadSignature)
    }
}

#[cfg(test)]
#[path = "verify.test.rs"]
mod test;
