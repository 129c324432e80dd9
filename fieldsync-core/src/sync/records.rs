//! Concrete syncable record types.
//!
//! These are the domain records that flow through the exchange engine.
//! They carry no behavior of their own beyond the synced-record
//! contract; reference fields hold the referenced record's id.

use crate::sync::canonical::FieldValue;
use crate::sync::record::{SyncMeta, SyncedRecord};
use crate::sync::wire::WireRecord;
use crate::{DatabaseError, FieldSyncError, Result};
use rusqlite::{Connection, Row};

/// An organization operating zones of facilities.
#[derive(Debug, Clone, PartialEq)]
pub struct Organization {
    pub meta: SyncMeta,
    pub name: String,
    pub description: String,
}

/// A geographic or administrative grouping of facilities.
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub meta: SyncMeta,
    pub name: String,
    pub description: String,
    /// Owning organization id.
    pub organization: String,
}

/// Role an organization holds within a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneRole {
    /// Full administrative privileges.
    Superuser,
    /// Can view analytics, but not administer.
    Analytics,
}

impl ZoneRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Superuser => "superuser",
            Self::Analytics => "analytics",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "superuser" => Some(Self::Superuser),
            "analytics" => Some(Self::Analytics),
            _ => None,
        }
    }
}

/// Membership link between a zone and an organization.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneOrganization {
    pub meta: SyncMeta,
    pub zone: String,
    pub organization: String,
    pub role: ZoneRole,
    pub notes: String,
}

/// A physical site inside a zone.
#[derive(Debug, Clone, PartialEq)]
pub struct Facility {
    pub meta: SyncMeta,
    pub name: String,
    pub description: String,
    pub address: String,
    pub address_normalized: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Containing zone id.
    pub zone: String,
}

/// A user account local to a facility. The password is stored as an
/// opaque `[algo]$[salt]$[hexdigest]` hash string, never in clear.
#[derive(Debug, Clone, PartialEq)]
pub struct FacilityUser {
    pub meta: SyncMeta,
    pub facility: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub notes: String,
    pub password: String,
}

/// Membership link binding a device into a zone.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceZone {
    pub meta: SyncMeta,
    pub device: String,
    pub zone: String,
    pub is_primary: bool,
}

impl SyncedRecord for Organization {
    const RECORD_TYPE: &'static str = "organization";
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
        ]
    }

    fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO organizations (id, counter, signature, signed_by, signed_version,
                                        name, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                counter = excluded.counter,
                signature = excluded.signature,
                signed_by = excluded.signed_by,
                signed_version = excluded.signed_version,
                name = excluded.name,
                description = excluded.description",
            rusqlite::params![
                self.meta.require_id()?,
                self.meta.require_counter()?,
                self.meta.signature,
                self.meta.signed_by,
                self.meta.signed_version,
                self.name,
                self.description,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn select_by_signer(conn: &Connection, signer_id: &str, min_counter: i64) -> Result<Vec<Self>> {
        select_rows(
            conn,
            "SELECT id, counter, signature, signed_by, signed_version, name, description
             FROM organizations WHERE signed_by = ?1 AND counter >= ?2 ORDER BY counter",
            signer_id,
            min_counter,
            |row| {
                Ok(Self {
                    meta: meta_from_row(row)?,
                    name: row.get(5)?,
                    description: row.get(6)?,
                })
            },
        )
    }

    fn from_wire(record: &WireRecord) -> Result<Self> {
        Ok(Self {
            meta: record.meta()?,
            name: record.text("name")?,
            description: record.text("description")?,
        })
    }
}

impl SyncedRecord for Zone {
    const RECORD_TYPE: &'static str = "zone";
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
            ("organization", FieldValue::Reference(self.organization.clone())),
        ]
    }

    fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO zones (id, counter, signature, signed_by, signed_version,
                                name, description, organization_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                counter = excluded.counter,
                signature = excluded.signature,
                signed_by = excluded.signed_by,
                signed_version = excluded.signed_version,
                name = excluded.name,
                description = excluded.description,
                organization_id = excluded.organization_id",
            rusqlite::params![
                self.meta.require_id()?,
                self.meta.require_counter()?,
                self.meta.signature,
                self.meta.signed_by,
                self.meta.signed_version,
                self.name,
                self.description,
                self.organization,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn select_by_signer(conn: &Connection, signer_id: &str, min_counter: i64) -> Result<Vec<Self>> {
        select_rows(
            conn,
            "SELECT id, counter, signature, signed_by, signed_version,
                    name, description, organization_id
             FROM zones WHERE signed_by = ?1 AND counter >= ?2 ORDER BY counter",
            signer_id,
            min_counter,
            |row| {
                Ok(Self {
                    meta: meta_from_row(row)?,
                    name: row.get(5)?,
                    description: row.get(6)?,
                    organization: row.get(7)?,
                })
            },
        )
    }

    fn from_wire(record: &WireRecord) -> Result<Self> {
        Ok(Self {
            meta: record.meta()?,
            name: record.text("name")?,
            description: record.text("description")?,
            organization: record.text("organization")?,
        })
    }
}

impl SyncedRecord for ZoneOrganization {
    const RECORD_TYPE: &'static str = "zone_organization";
    const REQUIRES_AUTHORITY_SIGNATURE: bool = true;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn payload_fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("zone", FieldValue::Reference(self.zone.clone())),
            ("organization", FieldValue::Reference(self.organization.clone())),
            ("role", FieldValue::Text(self.role.as_str().to_string())),
            ("notes", FieldValue::Text(self.notes.clone())),
        ]
    }

    fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO zone_organizations (id, counter, signature, signed_by, signed_version,
                                             zone_id, organization_id, role, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                counter = excluded.counter,
                signature = excluded.signature,
                signed_by = excluded.signed_by,
                signed_version = excluded.signed_version,
                zone_id = excluded.zone_id,
                organization_id = excluded.organization_id,
                role = excluded.role,
                notes = excluded.notes",
            rusqlite::params![
                self.meta.require_id()?,
                self.meta.require_counter()?,
                self.meta.signature,
                self.meta.signed_by,
                self.meta.signed_version,
                self.zone,
                self.organization,
                self.role.as_str(),
                self.notes,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn select_by_signer(conn: &Connection, signer_id: &str, min_counter: i64) -> Result<Vec<Self>> {
        select_rows(
            conn,
            "SELECT id, counter, signature, signed_by, signed_version,
                    zone_id, organization_id, role, notes
             FROM zone_organizations WHERE signed_by = ?1 AND counter >= ?2 ORDER BY counter",
            signer_id,
            min_counter,
            |row| {
                let role_str: String = row.get(7)?;
                Ok(Self {
                    meta: meta_from_row(row)?,
                    zone: row.get(5)?,
                    organization: row.get(6)?,
                    role: ZoneRole::parse(&role_str).unwrap_or(ZoneRole::Analytics),
                    notes: row.get(8)?,
                })
            },
        )
    }

    fn from_wire(record: &WireRecord) -> Result<Self> {
        let role_str = record.text("role")?;
        let role = ZoneRole::parse(&role_str).ok_or_else(|| {
            FieldSyncError::Wire(format!("unknown zone role '{}'", role_str))
        })?;
        Ok(Self {
            meta: record.meta()?,
            zone: record.text("zone")?,
            organization: record.text("organization")?,
            role,
            notes: record.text("notes")?,
        })
    }
}

impl SyncedRecord for Facility {
    const RECORD_TYPE: &'static str = "facility";
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
            ("address", FieldValue::Text(self.address.clone())),
            (
                "address_normalized",
                FieldValue::Text(self.address_normalized.clone()),
            ),
            (
                "latitude",
                self.latitude.map(FieldValue::Float).unwrap_or(FieldValue::Null),
            ),
            (
                "longitude",
                self.longitude.map(FieldValue::Float).unwrap_or(FieldValue::Null),
            ),
            ("zone", FieldValue::Reference(self.zone.clone())),
        ]
    }

    fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO facilities (id, counter, signature, signed_by, signed_version,
                                     name, description, address, address_normalized,
                                     latitude, longitude, zone_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                counter = excluded.counter,
                signature = excluded.signature,
                signed_by = excluded.signed_by,
                signed_version = excluded.signed_version,
                name = excluded.name,
                description = excluded.description,
                address = excluded.address,
                address_normalized = excluded.address_normalized,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                zone_id = excluded.zone_id",
            rusqlite::params![
                self.meta.require_id()?,
                self.meta.require_counter()?,
                self.meta.signature,
                self.meta.signed_by,
                self.meta.signed_version,
                self.name,
                self.description,
                self.address,
                self.address_normalized,
                self.latitude,
                self.longitude,
                self.zone,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn select_by_signer(conn: &Connection, signer_id: &str, min_counter: i64) -> Result<Vec<Self>> {
        select_rows(
            conn,
            "SELECT id, counter, signature, signed_by, signed_version,
                    name, description, address, address_normalized,
                    latitude, longitude, zone_id
             FROM facilities WHERE signed_by = ?1 AND counter >= ?2 ORDER BY counter",
            signer_id,
            min_counter,
            |row| {
                Ok(Self {
                    meta: meta_from_row(row)?,
                    name: row.get(5)?,
                    description: row.get(6)?,
                    address: row.get(7)?,
                    address_normalized: row.get(8)?,
                    latitude: row.get(9)?,
                    longitude: row.get(10)?,
                    zone: row.get(11)?,
                })
            },
        )
    }

    fn from_wire(record: &WireRecord) -> Result<Self> {
        Ok(Self {
            meta: record.meta()?,
            name: record.text("name")?,
            description: record.text("description")?,
            address: record.text("address")?,
            address_normalized: record.text("address_normalized")?,
            latitude: record.optional_float("latitude")?,
            longitude: record.optional_float("longitude")?,
            zone: record.text("zone")?,
        })
    }
}

impl SyncedRecord for FacilityUser {
    const RECORD_TYPE: &'static str = "facility_user";
    // Facility users are created in the field; they do not need the
    // central authority's signature to be accepted.
    const REQUIRES_AUTHORITY_SIGNATURE: bool = false;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn payload_fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("facility", FieldValue::Reference(self.facility.clone())),
            ("username", FieldValue::Text(self.username.clone())),
            ("first_name", FieldValue::Text(self.first_name.clone())),
            ("last_name", FieldValue::Text(self.last_name.clone())),
            ("notes", FieldValue::Text(self.notes.clone())),
            ("password", FieldValue::Text(self.password.clone())),
        ]
    }

    fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO facility_users (id, counter, signature, signed_by, signed_version,
                                         facility_id, username, first_name, last_name,
                                         notes, password)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                counter = excluded.counter,
                signature = excluded.signature,
                signed_by = excluded.signed_by,
                signed_version = excluded.signed_version,
                facility_id = excluded.facility_id,
                username = excluded.username,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                notes = excluded.notes,
                password = excluded.password",
            rusqlite::params![
                self.meta.require_id()?,
                self.meta.require_counter()?,
                self.meta.signature,
                self.meta.signed_by,
                self.meta.signed_version,
                self.facility,
                self.username,
                self.first_name,
                self.last_name,
                self.notes,
                self.password,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn select_by_signer(conn: &Connection, signer_id: &str, min_counter: i64) -> Result<Vec<Self>> {
        select_rows(
            conn,
            "SELECT id, counter, signature, signed_by, signed_version,
                    facility_id, username, first_name, last_name, notes, password
             FROM facility_users WHERE signed_by = ?1 AND counter >= ?2 ORDER BY counter",
            signer_id,
            min_counter,
            |row| {
                Ok(Self {
                    meta: meta_from_row(row)?,
                    facility: row.get(5)?,
                    username: row.get(6)?,
                    first_name: row.get(7)?,
                    last_name: row.get(8)?,
                    notes: row.get(9)?,
                    password: row.get(10)?,
                })
            },
        )
    }

    fn from_wire(record: &WireRecord) -> Result<Self> {
        Ok(Self {
            meta: record.meta()?,
            facility: record.text("facility")?,
            username: record.text("username")?,
            first_name: record.text("first_name")?,
            last_name: record.text("last_name")?,
            notes: record.text("notes")?,
            password: record.text("password")?,
        })
    }
}

impl SyncedRecord for DeviceZone {
    const RECORD_TYPE: &'static str = "device_zone";
    const REQUIRES_AUTHORITY_SIGNATURE: bool = true;

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn payload_fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("device", FieldValue::Reference(self.device.clone())),
            ("zone", FieldValue::Reference(self.zone.clone())),
            ("is_primary", FieldValue::Bool(self.is_primary)),
        ]
    }

    fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO device_zones (id, counter, signature, signed_by, signed_version,
                                       device_id, zone_id, is_primary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                counter = excluded.counter,
                signature = excluded.signature,
                signed_by = excluded.signed_by,
                signed_version = excluded.signed_version,
                device_id = excluded.device_id,
                zone_id = excluded.zone_id,
                is_primary = excluded.is_primary",
            rusqlite::params![
                self.meta.require_id()?,
                self.meta.require_counter()?,
                self.meta.signature,
                self.meta.signed_by,
                self.meta.signed_version,
                self.device,
                self.zone,
                self.is_primary,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn select_by_signer(conn: &Connection, signer_id: &str, min_counter: i64) -> Result<Vec<Self>> {
        select_rows(
            conn,
            "SELECT id, counter, signature, signed_by, signed_version,
                    device_id, zone_id, is_primary
             FROM device_zones WHERE signed_by = ?1 AND counter >= ?2 ORDER BY counter",
            signer_id,
            min_counter,
            |row| {
                Ok(Self {
                    meta: meta_from_row(row)?,
                    device: row.get(5)?,
                    zone: row.get(6)?,
                    is_primary: row.get(7)?,
                })
            },
        )
    }

    fn from_wire(record: &WireRecord) -> Result<Self> {
        Ok(Self {
            meta: record.meta()?,
            device: record.text("device")?,
            zone: record.text("zone")?,
            is_primary: record.boolean("is_primary")?,
        })
    }
}

/// Sync metadata columns, in the shared leading column order.
fn meta_from_row(row: &Row<'_>) -> rusqlite::Result<SyncMeta> {
    Ok(SyncMeta {
        id: Some(row.get(0)?),
        counter: Some(row.get(1)?),
        signature: row.get(2)?,
        signed_by: row.get(3)?,
        signed_version: row.get(4)?,
    })
}

fn select_rows<T>(
    conn: &Connection,
    sql: &str,
    signer_id: &str,
    min_counter: i64,
    map: impl Fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql).map_err(DatabaseError::Sqlite)?;
    let rows = stmt
        .query_map(rusqlite::params![signer_id, min_counter], map)
        .map_err(DatabaseError::Sqlite)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.map_err(DatabaseError::Sqlite)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::sync::device::create_central_authority_device;
    use crate::sync::record::{save, validate, verify};

    fn store_with_authority() -> (Database, crate::sync::device::LocalIdentity) {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        let identity = create_central_authority_device(db.conn(), "central").unwrap();
        (db, identity)
    }

    #[test]
    fn zone_role_string_roundtrip() {
        for role in [ZoneRole::Superuser, ZoneRole::Analytics] {
            assert_eq!(ZoneRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(ZoneRole::parse("janitor"), None);
    }

    #[test]
    fn facility_survives_store_and_wire_roundtrip() {
        let (db, identity) = store_with_authority();

        let mut facility = Facility {
            meta: SyncMeta::default(),
            name: "Northern Clinic".to_string(),
            description: String::new(),
            address: "14 Hill Road".to_string(),
            address_normalized: String::new(),
            latitude: Some(-1.2863),
            longitude: None,
            zone: "feedbeeffeedbeeffeedbeeffeedbeef".to_string(),
        };
        save(db.conn(), &mut facility, Some(&identity)).unwrap();

        let signer = identity.device.meta.id.as_deref().unwrap();
        let selected = Facility::select_by_signer(db.conn(), signer, 0).unwrap();
        assert_eq!(selected, vec![facility.clone()]);

        let roundtripped = Facility::from_wire(&facility.to_wire()).unwrap();
        assert_eq!(roundtripped, facility);
        assert!(verify(db.conn(), &roundtripped).unwrap());
    }

    #[test]
    fn facility_user_needs_no_authority_signature() {
        let (db, identity) = store_with_authority();

        let mut user = FacilityUser {
            meta: SyncMeta::default(),
            facility: "feedbeeffeedbeeffeedbeeffeedbeef".to_string(),
            username: "asha".to_string(),
            first_name: "Asha".to_string(),
            last_name: String::new(),
            notes: String::new(),
            password: "sha1$c0ffee$1234abcd".to_string(),
        };
        save(db.conn(), &mut user, Some(&identity)).unwrap();

        // Strip the signer's authority trust; the user must still pass.
        db.conn()
            .execute("UPDATE device_metadata SET is_trusted_authority = 0", [])
            .unwrap();
        validate(db.conn(), &user).unwrap();
    }

    #[test]
    fn zone_organization_rejects_unknown_role_on_the_wire() {
        let (db, identity) = store_with_authority();

        let mut link = ZoneOrganization {
            meta: SyncMeta::default(),
            zone: "11111111111111111111111111111111".to_string(),
            organization: "22222222222222222222222222222222".to_string(),
            role: ZoneRole::Superuser,
            notes: String::new(),
        };
        save(db.conn(), &mut link, Some(&identity)).unwrap();

        let mut wire = link.to_wire();
        wire.fields.insert(
            "role".to_string(),
            serde_json::Value::String("janitor".to_string()),
        );
        assert!(ZoneOrganization::from_wire(&wire).is_err());
    }

    #[test]
    fn selection_respects_the_counter_watermark() {
        let (db, identity) = store_with_authority();
        let signer = identity.device.meta.id.clone().unwrap();

        let mut counters = Vec::new();
        for name in ["one", "two", "three"] {
            let mut org = Organization {
                meta: SyncMeta::default(),
                name: name.to_string(),
                description: String::new(),
            };
            save(db.conn(), &mut org, Some(&identity)).unwrap();
            counters.push(org.meta.counter.unwrap());
        }

        let all = Organization::select_by_signer(db.conn(), &signer, 0).unwrap();
        assert_eq!(all.len(), 3);

        let from_second = Organization::select_by_signer(db.conn(), &signer, counters[1]).unwrap();
        assert_eq!(from_second.len(), 2);
        assert_eq!(from_second[0].name, "two");

        let beyond = Organization::select_by_signer(db.conn(), &signer, counters[2] + 1).unwrap();
        assert!(beyond.is_empty());
    }
}
