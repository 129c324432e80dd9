//! The synced-record contract.
//!
//! Every syncable record type carries the same sync metadata and moves
//! through the same save/sign/verify/validate lifecycle. Ids are derived
//! deterministically from (signing device identity, per-device counter),
//! which is what lets disconnected devices create records without a
//! central id allocator and without collisions.

use crate::crypto::{self, DeviceKeys};
use crate::sync::canonical::{canonical_representation, FieldValue};
use crate::sync::counter::next_counter;
use crate::sync::device::{self, Device, LocalIdentity};
use crate::sync::wire::WireRecord;
use crate::{FieldSyncError, Result};
use rusqlite::Connection;
use thiserror::Error;
use uuid::Uuid;

/// Validation failures for signed records. A record failing validation
/// is untrusted and must never be persisted as valid.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Signature on {record_type} record {id} is invalid")]
    SignatureInvalid {
        record_type: &'static str,
        id: String,
    },

    #[error("{record_type} record {id} must be signed by a trusted authority")]
    TrustViolation {
        record_type: &'static str,
        id: String,
    },
}

/// Sync metadata common to every syncable record.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMeta {
    /// 32-hex opaque identifier, assigned on first save.
    pub id: Option<String>,
    /// The issuing device's local sequence number at creation time.
    pub counter: Option<i64>,
    /// Base64 detached signature; empty until signed.
    pub signature: String,
    /// Id of the signing device.
    pub signed_by: Option<String>,
    /// Schema tag, included unconditionally in the signing input.
    pub signed_version: i32,
}

impl Default for SyncMeta {
    fn default() -> Self {
        Self {
            id: None,
            counter: None,
            signature: String::new(),
            signed_by: None,
            signed_version: 1,
        }
    }
}

impl SyncMeta {
    pub fn require_id(&self) -> Result<&str> {
        self.id.as_deref().ok_or_else(|| {
            FieldSyncError::Configuration("record has no id; it was never saved".to_string())
        })
    }

    pub fn require_counter(&self) -> Result<i64> {
        self.counter.ok_or_else(|| {
            FieldSyncError::Configuration("record has no counter; it was never saved".to_string())
        })
    }
}

/// Contract implemented by every syncable record type.
pub trait SyncedRecord: Sized {
    /// Wire tag for the concrete type.
    const RECORD_TYPE: &'static str;
    /// Whether records of this type must be signed by a trusted
    /// authority to validate.
    const REQUIRES_AUTHORITY_SIGNATURE: bool;

    fn meta(&self) -> &SyncMeta;
    fn meta_mut(&mut self) -> &mut SyncMeta;

    /// Payload fields for canonicalization and the wire format.
    /// References contribute the referenced record's primary id.
    fn payload_fields(&self) -> Vec<(&'static str, FieldValue)>;

    /// Explicit canonical field list, for types that sign a fixed
    /// subset of their fields.
    fn canonical_fields() -> Option<&'static [&'static str]> {
        None
    }

    /// Transport-encoded public key carried inside the record itself,
    /// used to verify a self-signed record whose signer is not in the
    /// store yet (trust bootstrap).
    fn embedded_key(&self) -> Option<&str> {
        None
    }

    /// Insert or update the record row. Sync import semantics: an
    /// existing id is an update, never an insert conflict.
    fn upsert(&self, conn: &Connection) -> Result<()>;

    /// Records signed by `signer_id` with `counter >= min_counter`, in
    /// counter order.
    fn select_by_signer(conn: &Connection, signer_id: &str, min_counter: i64)
        -> Result<Vec<Self>>;

    fn from_wire(record: &WireRecord) -> Result<Self>;

    fn to_wire(&self) -> WireRecord {
        WireRecord::from_parts(Self::RECORD_TYPE, self.meta(), &self.payload_fields())
    }
}

/// Canonical representation of a record, the sole input to signing and
/// verification.
pub fn canonical_of<R: SyncedRecord>(record: &R) -> String {
    canonical_representation(record.meta(), &record.payload_fields(), R::canonical_fields())
}

/// Derive a record id from an id namespace and a counter value.
///
/// Replaying the same (namespace, counter) pair always yields the same
/// id; distinct devices have distinct namespaces and so never collide.
pub fn derive_id(namespace: &Uuid, counter: i64) -> String {
    Uuid::new_v5(namespace, counter.to_string().as_bytes())
        .simple()
        .to_string()
}

/// Save a record, assigning counter, id, and signature as needed.
///
/// The acting own-device is the explicit `identity` when given,
/// otherwise the store's registered own device; with neither, the save
/// fails with a configuration error. The record is persisted once to
/// materialize its id (the id is part of the canonical representation),
/// signed if unsigned, then persisted again, so the signature always
/// covers the final persisted id.
pub fn save<R: SyncedRecord>(
    conn: &Connection,
    record: &mut R,
    identity: Option<&LocalIdentity>,
) -> Result<()> {
    let resolved;
    let identity = match identity {
        Some(identity) => identity,
        None => {
            resolved = device::get_own_identity(conn)?.ok_or_else(|| {
                FieldSyncError::Configuration(
                    "cannot save a synced record before registering this device".to_string(),
                )
            })?;
            &resolved
        }
    };

    materialize(conn, record, identity)?;

    if record.meta().signature.is_empty() {
        sign(record, &identity.device, &identity.keys)?;
    }

    record.upsert(conn)
}

/// First phase of a save: assign counter and id, and persist the row so
/// the id exists before any signature over it is computed.
pub fn materialize<R: SyncedRecord>(
    conn: &Connection,
    record: &mut R,
    identity: &LocalIdentity,
) -> Result<()> {
    // Counter and id namespace are always scoped to the acting local
    // device, even when the record ends up signed by another device.
    let counter = match record.meta().counter {
        Some(counter) => counter,
        None => {
            let counter = next_counter(conn, &identity.device)?;
            record.meta_mut().counter = Some(counter);
            counter
        }
    };

    if record.meta().id.is_none() {
        let namespace = match &identity.device.meta.id {
            Some(id) => Uuid::parse_str(id).map_err(|e| {
                FieldSyncError::Configuration(format!("own device id is not a valid uuid: {}", e))
            })?,
            // Bootstrap: the own device itself has no id yet.
            None => Uuid::new_v4(),
        };
        record.meta_mut().id = Some(derive_id(&namespace, counter));
        record.upsert(conn)?;
    }

    Ok(())
}

/// Sign a record as the given device.
pub fn sign<R: SyncedRecord>(record: &mut R, device: &Device, keys: &DeviceKeys) -> Result<()> {
    let device_id = device.meta.id.clone().ok_or_else(|| {
        FieldSyncError::Configuration("signing device has no persisted id".to_string())
    })?;
    record.meta_mut().signed_by = Some(device_id);
    let message = canonical_of(record);
    record.meta_mut().signature = keys.sign_base64(message.as_bytes());
    Ok(())
}

/// Verify a record's signature against its signer's public key.
///
/// Fails closed: no signer, unknown signer, or a signature that does
/// not check out all return `false`.
pub fn verify<R: SyncedRecord>(conn: &Connection, record: &R) -> Result<bool> {
    let Some(signer_id) = record.meta().signed_by.clone() else {
        return Ok(false);
    };

    let key = match Device::load(conn, &signer_id)? {
        Some(signer) => signer.verifying_key()?,
        None => match record.embedded_key() {
            Some(encoded) if record.meta().id.as_deref() == Some(signer_id.as_str()) => {
                crypto::decode_public_key(encoded)?
            }
            _ => return Ok(false),
        },
    };

    let message = canonical_of(record);
    Ok(crypto::verify_base64(
        &key,
        message.as_bytes(),
        &record.meta().signature,
    ))
}

/// Validate a record that may already carry a signature, as done before
/// any save during sync ingestion.
pub fn validate<R: SyncedRecord>(conn: &Connection, record: &R) -> Result<()> {
    if record.meta().signature.is_empty() {
        return Ok(());
    }

    if !verify(conn, record)? {
        return Err(ValidationError::SignatureInvalid {
            record_type: R::RECORD_TYPE,
            id: record.meta().id.clone().unwrap_or_default(),
        }
        .into());
    }

    if R::REQUIRES_AUTHORITY_SIGNATURE {
        let trusted = match record.meta().signed_by.as_deref() {
            Some(signer_id) => device::get_metadata(conn, signer_id)?
                .map(|m| m.is_trusted_authority)
                .unwrap_or(false),
            None => false,
        };
        if !trusted {
            return Err(ValidationError::TrustViolation {
                record_type: R::RECORD_TYPE,
                id: record.meta().id.clone().unwrap_or_default(),
            }
            .into());
        }
    }

    Ok(())
}
