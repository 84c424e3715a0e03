//! MumbleChat Core Types
//!
//! This crate defines the fundamental data structures shared by the relay
//! transport, relay storage, registry client and node manager.

mod error;
mod instance;
mod tier;
mod types;

pub use error::*;
pub use instance::*;
pub use tier::*;
pub use types::*;
