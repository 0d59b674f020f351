// ABOUTME: Access to the ed25519 key fixtures under tests/fixtures.
// ABOUTME: Host keys A and B stand in for a genuine server and an impostor.

use russh::keys::{PrivateKey, PublicKey};
use std::path::PathBuf;

pub const HOST_A: &str = "host_a_ed25519";
pub const HOST_B: &str = "host_b_ed25519";
pub const CLIENT: &str = "client_ed25519";
/// Encrypted with [`CLIENT_PASSPHRASE`].
pub const CLIENT_PROTECTED: &str = "client_protected_ed25519";
pub const CLIENT_PASSPHRASE: &str = "hunter2";

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn public_key(name: &str) -> PublicKey {
    let path = fixture_path(&format!("{}.pub", name));
    let text = std::fs::read_to_string(&path).expect("fixture public key should exist");
    PublicKey::from_openssh(text.trim()).expect("fixture public key should parse")
}

pub fn private_key(name: &str) -> PrivateKey {
    russh::keys::load_secret_key(fixture_path(name), None).expect("fixture key should load")
}
