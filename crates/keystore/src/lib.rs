//! MumbleChat Keystore
//!
//! Node key management and path utilities shared by the daemon and CLI.
//!
//! ## Features
//!
//! - Ed25519 node keypair loading/generation
//! - Cross-platform path expansion (`~`, environment variables)
//! - Owner-only key file permissions on unix

mod keypair;
mod paths;

pub use keypair::{
    load_or_generate_identity,
    load_or_generate_signing_keypair,
    load_signing_keypair,
    save_keypair_bytes,
    KeystoreError,
};
pub use paths::{default_config_dir, default_key_path, expand_path};

pub type Result<T> = std::result::Result<T, KeystoreError>;
