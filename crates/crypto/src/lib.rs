//! MumbleChat Cryptography
//!
//! Ed25519 signing, wallet-address derivation and handshake proofs.

mod identity;
mod keys;
mod sign;

pub use identity::*;
pub use keys::*;
pub use sign::*;
