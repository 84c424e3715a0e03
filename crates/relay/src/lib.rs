//! MumbleChat Relay
//!
//! Store-and-forward for offline recipients. Messages are held under the
//! recipient's key hash and pushed when the recipient reconnects, either
//! directly or through a hub session.

mod error;
mod service;
mod store;

pub use error::{RelayError, Result};
pub use service::{Delivery, RelayService, RelayServiceConfig};
pub use store::{PublicKeyRecord, RelayStats, RelayStorage, StorageConfig};
