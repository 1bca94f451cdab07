use std::io::Write;

use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tempfile::tempdir;

use super::*;
use crate::internal::test_utils::assert;

#[test]
fn sha256_file_matches_known_digest() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.bin");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(b"hello world")
        .unwrap();

    let digest = sha256_file(&path).unwrap();
    assert!(digest == "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde");
}

#[test]
fn verify_sha256_rejects_mismatch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.bin");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(b"hello world")
        .unwrap();

    assert!(verify_sha256(&path, &"0".repeat(64)).is_err());
    assert!(verify_sha256(
        &path,
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde"
    )
    .is_ok());
}

#[test]
fn public_key_verifies_its_own_signature() {
    let mut rng = rsa::rand_core::OsRng;
    let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let public = RsaPublicKey::from(&private);

    let signing_key = SigningKey::<Sha256>::new(private);
    let message = b"index.plist contents";
    let signature = signing_key.sign(message);

    let der = public.to_pkcs1_der().unwrap();
    let key = PublicKey::from_der(der.as_bytes()).unwrap();

    assert!(key.verify(message, &signature.to_bytes()).is_ok());
    assert!(key.verify(b"tampered", &signature.to_bytes()).is_err());
}
