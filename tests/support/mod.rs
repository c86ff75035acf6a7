//! Shared fixtures for the end-to-end tests: a throwaway self-signed
//! certificate/key pair for the TLS/DTLS scenarios, generated
//! with the same `openssl` crate the library itself links against rather
//! than shelling out to the `openssl` CLI.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

pub use tempfile::TempDir;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder};

/// Writes a fresh self-signed certificate and private key (PEM) under
/// `dir`, returning `(cert_path, key_path)`.
pub fn generate_self_signed(dir: &Path) -> (PathBuf, PathBuf) {
    let rsa = Rsa::generate(2048).expect("generate RSA key");
    let pkey = PKey::from_rsa(rsa).expect("wrap RSA key");

    let mut name_builder = X509NameBuilder::new().expect("new name builder");
    name_builder
        .append_entry_by_text("CN", "localhost")
        .expect("set CN");
    let name = name_builder.build();

    let mut serial = BigNum::new().expect("new bignum");
    serial.rand(64, MsbOption::MAYBE_ZERO, false).expect("random serial");
    let serial_number = serial.to_asn1_integer().expect("serial to asn1");

    let mut builder = X509Builder::new().expect("new cert builder");
    builder.set_version(2).expect("set version");
    builder.set_serial_number(&serial_number).expect("set serial");
    builder.set_subject_name(&name).expect("set subject");
    builder.set_issuer_name(&name).expect("set issuer");
    builder.set_pubkey(&pkey).expect("set pubkey");
    let not_before = Asn1Time::days_from_now(0).expect("not_before");
    let not_after = Asn1Time::days_from_now(365).expect("not_after");
    builder.set_not_before(&not_before).expect("set not_before");
    builder.set_not_after(&not_after).expect("set not_after");
    builder.sign(&pkey, MessageDigest::sha256()).expect("sign cert");
    let cert = builder.build();

    let cert_pem = cert.to_pem().expect("cert to pem");
    let key_pem = pkey.private_key_to_pem_pkcs8().expect("key to pem");

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    std::fs::write(&cert_path, cert_pem).expect("write cert");
    std::fs::write(&key_path, key_pem).expect("write key");
    (cert_path, key_path)
}
