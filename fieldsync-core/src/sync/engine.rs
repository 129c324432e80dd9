//! Watermark diff/exchange of signed records.
//!
//! Export answers "what does the peer not have yet" from a map of
//! per-device counter watermarks; import re-verifies every record and
//! commits what it can, reporting the rest. Both directions require a
//! verified session.

use crate::sync::device::Device;
use crate::sync::record::{self, SyncedRecord};
use crate::sync::records::{
    DeviceZone, Facility, FacilityUser, Organization, Zone, ZoneOrganization,
};
use crate::sync::session::{HandshakeError, SyncSession};
use crate::sync::wire::{self, WireRecord};
use crate::{DatabaseError, FieldSyncError, Result};
use rusqlite::Connection;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Record types in exchange order. Devices come first so signer
/// identities land before the records they sign.
pub const SYNCING_RECORD_TYPES: &[&str] = &[
    Device::RECORD_TYPE,
    Organization::RECORD_TYPE,
    Zone::RECORD_TYPE,
    DeviceZone::RECORD_TYPE,
    ZoneOrganization::RECORD_TYPE,
    Facility::RECORD_TYPE,
    FacilityUser::RECORD_TYPE,
];

/// A record that failed validation during import. The rest of its batch
/// still commits.
#[derive(Debug, Clone)]
pub struct RejectedRecord {
    pub record: WireRecord,
    pub reason: String,
}

/// An exchange bound to a verified session. Construction is the gate:
/// there is no way to export or import without one.
#[derive(Debug)]
pub struct SyncExchange<'a> {
    session: &'a SyncSession,
}

impl<'a> SyncExchange<'a> {
    pub fn begin(session: &'a SyncSession) -> Result<Self> {
        if !session.is_verified() {
            return Err(HandshakeError::NotVerified.into());
        }
        Ok(Self { session })
    }

    /// Serialize every record the peer is missing.
    ///
    /// `device_counters` maps device id to the lowest counter value the
    /// peer still needs (`counter >= watermark` is selected). With no
    /// map, every known device is exported from zero. Accumulation runs
    /// in fixed type order, then device-id order, and stops at `limit`.
    pub fn export_outstanding(
        &self,
        conn: &Connection,
        device_counters: Option<&BTreeMap<String, i64>>,
        limit: usize,
    ) -> Result<String> {
        let counters: BTreeMap<String, i64> = match device_counters {
            Some(map) => map.clone(),
            None => all_device_ids(conn)?
                .into_iter()
                .map(|id| (id, 0))
                .collect(),
        };

        let mut batch: Vec<WireRecord> = Vec::new();
        for record_type in SYNCING_RECORD_TYPES {
            for (device_id, watermark) in &counters {
                let mut outstanding = collect_outstanding(conn, record_type, device_id, *watermark)?;
                batch.append(&mut outstanding);
                if batch.len() >= limit {
                    batch.truncate(limit);
                    debug!(
                        session = %self.session.client_nonce,
                        records = batch.len(),
                        "export reached batch limit"
                    );
                    return wire::serialize_batch(&batch);
                }
            }
        }

        debug!(
            session = %self.session.client_nonce,
            records = batch.len(),
            "exported outstanding records"
        );
        wire::serialize_batch(&batch)
    }

    /// Deserialize, validate, and commit a batch from the peer.
    ///
    /// Each record is validated and persisted on its own; a record
    /// failing validation is skipped and returned, never rolling back
    /// its batch-mates. Malformed batches and storage failures still
    /// propagate to the caller.
    pub fn import_batch(&self, conn: &Connection, data: &str) -> Result<Vec<RejectedRecord>> {
        let records = wire::parse_batch(data)?;
        let total = records.len();

        let mut rejected = Vec::new();
        for record in records {
            match import_record(conn, &record) {
                Ok(()) => {}
                Err(
                    error @ (FieldSyncError::Validation(_)
                    | FieldSyncError::Wire(_)
                    | FieldSyncError::Crypto(_)),
                ) => {
                    warn!(
                        record_type = %record.record_type,
                        %error,
                        "rejected record during import"
                    );
                    rejected.push(RejectedRecord {
                        record,
                        reason: error.to_string(),
                    });
                }
                Err(error) => return Err(error),
            }
        }

        debug!(
            session = %self.session.client_nonce,
            committed = total - rejected.len(),
            rejected = rejected.len(),
            "imported batch"
        );
        Ok(rejected)
    }
}

fn all_device_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT id FROM devices ORDER BY id")
        .map_err(DatabaseError::Sqlite)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(DatabaseError::Sqlite)?;

    let mut ids = Vec::new();
    for row in rows {
        ids.push(row.map_err(DatabaseError::Sqlite)?);
    }
    Ok(ids)
}

fn collect_outstanding(
    conn: &Connection,
    record_type: &str,
    signer_id: &str,
    watermark: i64,
) -> Result<Vec<WireRecord>> {
    if record_type == Device::RECORD_TYPE {
        outstanding_of::<Device>(conn, signer_id, watermark)
    } else if record_type == Organization::RECORD_TYPE {
        outstanding_of::<Organization>(conn, signer_id, watermark)
    } else if record_type == Zone::RECORD_TYPE {
        outstanding_of::<Zone>(conn, signer_id, watermark)
    } else if record_type == DeviceZone::RECORD_TYPE {
        outstanding_of::<DeviceZone>(conn, signer_id, watermark)
    } else if record_type == ZoneOrganization::RECORD_TYPE {
        outstanding_of::<ZoneOrganization>(conn, signer_id, watermark)
    } else if record_type == Facility::RECORD_TYPE {
        outstanding_of::<Facility>(conn, signer_id, watermark)
    } else if record_type == FacilityUser::RECORD_TYPE {
        outstanding_of::<FacilityUser>(conn, signer_id, watermark)
    } else {
        Ok(Vec::new())
    }
}

fn outstanding_of<R: SyncedRecord>(
    conn: &Connection,
    signer_id: &str,
    watermark: i64,
) -> Result<Vec<WireRecord>> {
    Ok(R::select_by_signer(conn, signer_id, watermark)?
        .iter()
        .map(|record| record.to_wire())
        .collect())
}

fn import_record(conn: &Connection, record: &WireRecord) -> Result<()> {
    let record_type = record.record_type.as_str();
    if record_type == Device::RECORD_TYPE {
        apply::<Device>(conn, record)
    } else if record_type == Organization::RECORD_TYPE {
        apply::<Organization>(conn, record)
    } else if record_type == Zone::RECORD_TYPE {
        apply::<Zone>(conn, record)
    } else if record_type == DeviceZone::RECORD_TYPE {
        apply::<DeviceZone>(conn, record)
    } else if record_type == ZoneOrganization::RECORD_TYPE {
        apply::<ZoneOrganization>(conn, record)
    } else if record_type == Facility::RECORD_TYPE {
        apply::<Facility>(conn, record)
    } else if record_type == FacilityUser::RECORD_TYPE {
        apply::<FacilityUser>(conn, record)
    } else {
        Err(FieldSyncError::Wire(format!(
            "unknown record type '{}'",
            record.record_type
        )))
    }
}

/// Validate-then-upsert for one incoming record. An existing id is an
/// update, not an insert conflict.
fn apply<R: SyncedRecord>(conn: &Connection, wire_record: &WireRecord) -> Result<()> {
    let incoming = R::from_wire(wire_record)?;
    record::validate(conn, &incoming)?;
    incoming.upsert(conn)
}
