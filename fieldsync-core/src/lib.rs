//! FieldSync Core Library
//!
//! Offline-first synchronization of cryptographically signed records
//! between a central authority and disconnected field devices:
//! - Ed25519 device identity with a trust hierarchy rooted at a
//!   self-signed central authority device
//! - Deterministic record ids derived from (device, per-device counter)
//! - Counter-watermark incremental diff/exchange of signed records
//! - Nonce-based mutual session handshake gating every exchange

pub mod crypto;
pub mod database;
pub mod sync;

pub use crypto::{CryptoError, DeviceKeys};
pub use database::{Database, DatabaseError};
pub use sync::device::{
    create_central_authority_device, get_own_device, register_own_device,
    register_trusted_authority, Device, DeviceMetadata, DeviceSaveOptions, LocalIdentity,
};
pub use sync::engine::{RejectedRecord, SyncExchange, SYNCING_RECORD_TYPES};
pub use sync::record::{SyncMeta, SyncedRecord, ValidationError};
pub use sync::records::{
    DeviceZone, Facility, FacilityUser, Organization, Zone, ZoneOrganization, ZoneRole,
};
pub use sync::session::{HandshakeError, SessionState, SyncSession};

use thiserror::Error;

/// Result type for fieldsync operations
pub type Result<T> = std::result::Result<T, FieldSyncError>;

/// General error type for fieldsync operations
#[derive(Error, Debug)]
pub enum FieldSyncError {
    /// The store has no usable own-device identity for the requested
    /// operation. Surfaced to the caller, never retried internally.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Malformed wire payload (batch-level). Per-record problems during
    /// import are converted to rejected-record entries instead.
    #[error("Malformed wire payload: {0}")]
    Wire(String),
}
