//! Device identity, trust metadata, and the own-device context.
//!
//! A device is itself a synced record: its canonical representation
//! covers a fixed field subset (name, description, public key) so that
//! the signature survives local-only changes such as revocation flags.
//! Trust is rooted at a self-signed central authority device.

use crate::crypto::{self, keystore, DeviceKeys};
use crate::sync::canonical::FieldValue;
use crate::sync::record::{self, SyncMeta, SyncedRecord, ValidationError};
use crate::sync::wire::WireRecord;
use crate::{DatabaseError, FieldSyncError, Result};
use ed25519_dalek::VerifyingKey;
use rusqlite::{Connection, Row};
use tracing::info;

/// A device identity participating in sync.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub meta: SyncMeta,
    pub name: String,
    pub description: String,
    /// Transport-encoded public key (colon-joined base64 blocks).
    pub public_key: String,
    pub revoked: bool,
}

/// Per-device local state. Never synced: trust and ownership are
/// decisions each store makes for itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMetadata {
    pub device_id: String,
    /// May sign records of types that require authority trust.
    pub is_trusted_authority: bool,
    /// Marks the single identity this store acts as.
    pub is_own_device: bool,
    /// Last-issued local counter value.
    pub counter_position: i64,
}

/// The identity a store acts as: the own device plus its signing keys.
/// Passed explicitly into every operation that signs, so tests can run
/// several independent identities in one process.
#[derive(Clone)]
pub struct LocalIdentity {
    pub device: Device,
    pub keys: DeviceKeys,
}

/// Flags for the two-phase device save.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceSaveOptions {
    /// The device signs its own record and becomes a trusted authority.
    pub self_signed: bool,
    /// The device becomes this store's own identity.
    pub is_own_device: bool,
}

impl Device {
    pub fn new(name: &str) -> Self {
        Self {
            meta: SyncMeta::default(),
            name: name.to_string(),
            description: String::new(),
            public_key: String::new(),
            revoked: false,
        }
    }

    /// Store a public key in its transport encoding. Round-trips
    /// exactly through [`Device::verifying_key`].
    pub fn set_public_key(&mut self, key: &VerifyingKey) {
        self.public_key = crypto::encode_public_key(key);
    }

    /// Decode the device's public key.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        Ok(crypto::decode_public_key(&self.public_key)?)
    }

    /// Load a device by id.
    pub fn load(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let result = conn.query_row(
            "SELECT id, counter, signature, signed_by, signed_version,
                    name, description, public_key, revoked
             FROM devices WHERE id = ?1",
            [id],
            Self::from_row,
        );
        match result {
            Ok(device) => Ok(Some(device)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DatabaseError::Sqlite(e).into()),
        }
    }

    /// Two-phase persistence of a device record.
    ///
    /// An own-device registration must first persist unsigned to
    /// materialize an id (counter 0, fresh namespace), because the
    /// device signs its own record and the signature covers the id.
    /// Only then is the signature finalized and the row saved again.
    pub fn save(&mut self, conn: &Connection, keys: &DeviceKeys, opts: DeviceSaveOptions) -> Result<()> {
        if opts.is_own_device {
            let bootstrap = LocalIdentity {
                device: self.clone(),
                keys: keys.clone(),
            };
            record::materialize(conn, self, &bootstrap)?;

            if opts.self_signed {
                self.set_public_key(&keys.verifying_key());
                self.meta.signature.clear();
            }
            if self.meta.signature.is_empty() {
                let signer = self.clone();
                record::sign(self, &signer, keys)?;
            }
            self.upsert(conn)?;
        } else {
            record::save(conn, self, None)?;
        }

        if opts.self_signed {
            mark_trusted_authority(conn, self.meta.require_id()?)?;
        }
        if opts.is_own_device {
            set_own_device(conn, self.meta.require_id()?)?;
        }
        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            meta: SyncMeta {
                id: Some(row.get(0)?),
                counter: Some(row.get(1)?),
                signature: row.get(2)?,
                signed_by: row.get(3)?,
                signed_version: row.get(4)?,
            },
            name: row.get(5)?,
            description: row.get(6)?,
            public_key: row.get(7)?,
            revoked: row.get(8)?,
        })
    }
}

impl SyncedRecord for Device {
    const RECORD_TYPE: &'static str = "device";
    const REQUIRES_AUTHORITY_SIGNATURE: bool = true;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn payload_fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("name", FieldValue::Text(self.name.clone())),
            ("description", FieldValue::Text(self.description.clone())),
            ("public_key", FieldValue::Text(self.public_key.clone())),
            ("revoked", FieldValue::Bool(self.revoked)),
        ]
    }

    fn canonical_fields() -> Option<&'static [&'static str]> {
        Some(&["signed_version", "name", "description", "public_key"])
    }

    fn embedded_key(&self) -> Option<&str> {
        (!self.public_key.is_empty()).then_some(self.public_key.as_str())
    }

    fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO devices (id, counter, signature, signed_by, signed_version,
                                  name, description, public_key, revoked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                counter = excluded.counter,
                signature = excluded.signature,
                signed_by = excluded.signed_by,
                signed_version = excluded.signed_version,
                name = excluded.name,
                description = excluded.description,
                public_key = excluded.public_key,
                revoked = excluded.revoked",
            rusqlite::params![
                self.meta.require_id()?,
                self.meta.require_counter()?,
                self.meta.signature,
                self.meta.signed_by,
                self.meta.signed_version,
                self.name,
                self.description,
                self.public_key,
                self.revoked,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn select_by_signer(conn: &Connection, signer_id: &str, min_counter: i64) -> Result<Vec<Self>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, counter, signature, signed_by, signed_version,
                        name, description, public_key, revoked
                 FROM devices
                 WHERE signed_by = ?1 AND counter >= ?2
                 ORDER BY counter",
            )
            .map_err(DatabaseError::Sqlite)?;
        let rows = stmt
            .query_map(rusqlite::params![signer_id, min_counter], Self::from_row)
            .map_err(DatabaseError::Sqlite)?;

        let mut devices = Vec::new();
        for row in rows {
            devices.push(row.map_err(DatabaseError::Sqlite)?);
        }
        Ok(devices)
    }

    fn from_wire(record: &WireRecord) -> Result<Self> {
        Ok(Self {
            meta: record.meta()?,
            name: record.text("name")?,
            description: record.text("description")?,
            public_key: record.text("public_key")?,
            revoked: record.boolean("revoked")?,
        })
    }
}

/// Metadata for a device, or `None` when none has been stored.
pub fn get_metadata(conn: &Connection, device_id: &str) -> Result<Option<DeviceMetadata>> {
    let result = conn.query_row(
        "SELECT device_id, is_trusted_authority, is_own_device, counter_position
         FROM device_metadata WHERE device_id = ?1",
        [device_id],
        |row| {
            Ok(DeviceMetadata {
                device_id: row.get(0)?,
                is_trusted_authority: row.get(1)?,
                is_own_device: row.get(2)?,
                counter_position: row.get(3)?,
            })
        },
    );
    match result {
        Ok(metadata) => Ok(Some(metadata)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(DatabaseError::Sqlite(e).into()),
    }
}

/// Existing metadata, or a fresh unsaved row bound to the device. Never
/// persists implicitly.
pub fn metadata_or_default(conn: &Connection, device_id: &str) -> Result<DeviceMetadata> {
    Ok(get_metadata(conn, device_id)?.unwrap_or_else(|| DeviceMetadata {
        device_id: device_id.to_string(),
        ..DeviceMetadata::default()
    }))
}

impl DeviceMetadata {
    /// Persist the metadata row (upsert).
    pub fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO device_metadata (device_id, is_trusted_authority, is_own_device, counter_position)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(device_id) DO UPDATE SET
                is_trusted_authority = excluded.is_trusted_authority,
                is_own_device = excluded.is_own_device,
                counter_position = excluded.counter_position",
            rusqlite::params![
                self.device_id,
                self.is_trusted_authority,
                self.is_own_device,
                self.counter_position,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }
}

/// Flag a device as a trusted authority for this store.
pub fn mark_trusted_authority(conn: &Connection, device_id: &str) -> Result<()> {
    let mut metadata = metadata_or_default(conn, device_id)?;
    metadata.is_trusted_authority = true;
    metadata.upsert(conn)
}

/// Make a device this store's own identity. Any previous claim is torn
/// down first: at most one own device exists per store.
pub fn set_own_device(conn: &Connection, device_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE device_metadata SET is_own_device = 0 WHERE is_own_device = 1",
        [],
    )
    .map_err(DatabaseError::Sqlite)?;
    let mut metadata = metadata_or_default(conn, device_id)?;
    metadata.is_own_device = true;
    metadata.upsert(conn)
}

/// The device this store acts as, or `None` before registration.
pub fn get_own_device(conn: &Connection) -> Result<Option<Device>> {
    let result = conn.query_row(
        "SELECT d.id, d.counter, d.signature, d.signed_by, d.signed_version,
                d.name, d.description, d.public_key, d.revoked
         FROM devices d
         JOIN device_metadata m ON m.device_id = d.id
         WHERE m.is_own_device = 1
         LIMIT 1",
        [],
        Device::from_row,
    );
    match result {
        Ok(device) => Ok(Some(device)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(DatabaseError::Sqlite(e).into()),
    }
}

/// The own device together with its signing keys.
pub fn get_own_identity(conn: &Connection) -> Result<Option<LocalIdentity>> {
    let Some(device) = get_own_device(conn)? else {
        return Ok(None);
    };
    let keys = keystore::load_local_keys(conn)?.ok_or_else(|| {
        FieldSyncError::Configuration(
            "own device is registered but its signing key is missing".to_string(),
        )
    })?;
    Ok(Some(LocalIdentity { device, keys }))
}

/// Register this store's own identity: generates a keypair and saves a
/// self-signed (but untrusted) device record flagged as own.
pub fn register_own_device(conn: &Connection, name: &str) -> Result<LocalIdentity> {
    let keys = DeviceKeys::generate();
    keystore::store_local_keys(conn, &keys)?;

    let mut device = Device::new(name);
    device.set_public_key(&keys.verifying_key());
    device.save(
        conn,
        &keys,
        DeviceSaveOptions {
            self_signed: false,
            is_own_device: true,
        },
    )?;

    info!(device_id = device.meta.id.as_deref().unwrap_or(""), "registered own device");
    Ok(LocalIdentity { device, keys })
}

/// Establish the root of trust: construct a device with a fresh
/// provider-issued keypair and save it as both self-signed and own.
pub fn create_central_authority_device(conn: &Connection, name: &str) -> Result<LocalIdentity> {
    let keys = DeviceKeys::generate();
    keystore::store_local_keys(conn, &keys)?;

    let mut device = Device::new(name);
    device.set_public_key(&keys.verifying_key());
    device.save(
        conn,
        &keys,
        DeviceSaveOptions {
            self_signed: true,
            is_own_device: true,
        },
    )?;

    info!(
        device_id = device.meta.id.as_deref().unwrap_or(""),
        "registered central authority device"
    );
    Ok(LocalIdentity { device, keys })
}

/// Root trust in an externally created authority device: verify its
/// self-signature against the key embedded in the record, persist it,
/// and flag it trusted for this store.
pub fn register_trusted_authority(conn: &Connection, device: &Device) -> Result<()> {
    let id = device.meta.require_id()?.to_string();

    if device.meta.signed_by.as_deref() != Some(id.as_str()) {
        return Err(ValidationError::TrustViolation {
            record_type: Device::RECORD_TYPE,
            id,
        }
        .into());
    }
    if !record::verify(conn, device)? {
        return Err(ValidationError::SignatureInvalid {
            record_type: Device::RECORD_TYPE,
            id,
        }
        .into());
    }

    device.upsert(conn)?;
    mark_trusted_authority(conn, &id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::sync::record;

    fn store() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db
    }

    #[test]
    fn central_authority_is_self_signed_trusted_and_own() {
        let db = store();
        let identity = create_central_authority_device(db.conn(), "central").unwrap();

        let id = identity.device.meta.id.clone().unwrap();
        assert_eq!(id.len(), 32);
        assert_eq!(identity.device.meta.counter, Some(0));
        assert_eq!(identity.device.meta.signed_by.as_deref(), Some(id.as_str()));
        assert!(record::verify(db.conn(), &identity.device).unwrap());

        let metadata = get_metadata(db.conn(), &id).unwrap().unwrap();
        assert!(metadata.is_trusted_authority);
        assert!(metadata.is_own_device);
    }

    #[test]
    fn own_device_is_resolvable_after_registration() {
        let db = store();
        assert!(get_own_device(db.conn()).unwrap().is_none());

        let identity = create_central_authority_device(db.conn(), "central").unwrap();
        let own = get_own_device(db.conn()).unwrap().unwrap();
        assert_eq!(own.meta.id, identity.device.meta.id);

        let resolved = get_own_identity(db.conn()).unwrap().unwrap();
        assert_eq!(
            resolved.keys.verifying_key().to_bytes(),
            identity.keys.verifying_key().to_bytes()
        );
    }

    #[test]
    fn re_registration_replaces_the_own_device() {
        let db = store();
        let first = create_central_authority_device(db.conn(), "first").unwrap();
        let second = create_central_authority_device(db.conn(), "second").unwrap();

        let own = get_own_device(db.conn()).unwrap().unwrap();
        assert_eq!(own.meta.id, second.device.meta.id);

        // Only one own-device row may exist store-wide.
        let count: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM device_metadata WHERE is_own_device = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_ne!(first.device.meta.id, second.device.meta.id);
    }

    #[test]
    fn registering_a_second_device_signs_it_with_the_authority() {
        let db = store();
        let authority = create_central_authority_device(db.conn(), "central").unwrap();

        let field_keys = DeviceKeys::generate();
        let mut field_device = Device::new("clinic-3");
        field_device.set_public_key(&field_keys.verifying_key());
        field_device
            .save(db.conn(), &field_keys, DeviceSaveOptions::default())
            .unwrap();

        assert_eq!(field_device.meta.signed_by, authority.device.meta.id);
        assert!(record::verify(db.conn(), &field_device).unwrap());
        record::validate(db.conn(), &field_device).unwrap();
    }

    #[test]
    fn saving_a_device_without_an_own_identity_fails() {
        let db = store();
        let keys = DeviceKeys::generate();
        let mut device = Device::new("orphan");
        device.set_public_key(&keys.verifying_key());

        let err = device
            .save(db.conn(), &keys, DeviceSaveOptions::default())
            .unwrap_err();
        assert!(matches!(err, FieldSyncError::Configuration(_)));
    }

    #[test]
    fn metadata_is_lazy_and_never_persists_implicitly() {
        let db = store();
        assert!(get_metadata(db.conn(), "nope").unwrap().is_none());

        let fresh = metadata_or_default(db.conn(), "nope").unwrap();
        assert_eq!(fresh.device_id, "nope");
        assert!(!fresh.is_trusted_authority);
        assert!(get_metadata(db.conn(), "nope").unwrap().is_none());
    }

    #[test]
    fn own_record_retains_its_signer_after_resave() {
        let db = store();
        let identity = create_central_authority_device(db.conn(), "central").unwrap();

        let mut device = Device::load(db.conn(), identity.device.meta.id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        let original_signer = device.meta.signed_by.clone();
        device.description = "relabelled".to_string();
        device.upsert(db.conn()).unwrap();

        let reloaded = Device::load(db.conn(), identity.device.meta.id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.meta.signed_by, original_signer);
    }

    #[test]
    fn trust_can_be_rooted_from_a_wire_record() {
        let source = store();
        let authority = create_central_authority_device(source.conn(), "central").unwrap();
        let wire = authority.device.to_wire();

        let target = store();
        let imported = Device::from_wire(&wire).unwrap();
        register_trusted_authority(target.conn(), &imported).unwrap();

        let id = imported.meta.id.clone().unwrap();
        let metadata = get_metadata(target.conn(), &id).unwrap().unwrap();
        assert!(metadata.is_trusted_authority);
        assert!(Device::load(target.conn(), &id).unwrap().is_some());
        record::validate(target.conn(), &imported).unwrap();
    }

    #[test]
    fn rooting_trust_in_a_non_self_signed_device_is_refused() {
        let db = store();
        let authority = create_central_authority_device(db.conn(), "central").unwrap();

        let field_keys = DeviceKeys::generate();
        let mut field_device = Device::new("clinic-9");
        field_device.set_public_key(&field_keys.verifying_key());
        field_device
            .save(db.conn(), &field_keys, DeviceSaveOptions::default())
            .unwrap();

        let target = store();
        let err = register_trusted_authority(target.conn(), &field_device).unwrap_err();
        assert!(matches!(
            err,
            FieldSyncError::Validation(ValidationError::TrustViolation { .. })
        ));
        drop(authority);
    }

    #[test]
    fn tampered_authority_record_cannot_root_trust() {
        let source = store();
        let authority = create_central_authority_device(source.conn(), "central").unwrap();

        let mut forged = authority.device.clone();
        forged.name = "evil-central".to_string();

        let target = store();
        let err = register_trusted_authority(target.conn(), &forged).unwrap_err();
        assert!(matches!(
            err,
            FieldSyncError::Validation(ValidationError::SignatureInvalid { .. })
        ));
    }
}
