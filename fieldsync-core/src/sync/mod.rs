//! Counter-driven sync of signed records between devices.
//!
//! - Canonical signing representation shared by records and handshakes
//! - Per-device monotonic counters minting collision-free record ids
//! - Device identity, authority trust, and the own-device context
//! - Nonce-based mutual session handshake
//! - Watermark diff/exchange with partial-failure tolerant import

pub mod canonical;
pub mod counter;
pub mod device;
pub mod engine;
pub mod record;
pub mod records;
pub mod session;
pub mod wire;

pub use device::{Device, LocalIdentity};
pub use engine::SyncExchange;
pub use record::{SyncMeta, SyncedRecord};
pub use session::SyncSession;
