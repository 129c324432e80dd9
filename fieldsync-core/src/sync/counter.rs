//! Per-device monotonic counter allocation.
//!
//! Counters drive both id derivation and sync watermarks. They are
//! per-device and strictly increasing; they are not a vector clock and
//! are never synchronized across devices.

use crate::sync::device::Device;
use crate::{DatabaseError, Result};
use rusqlite::Connection;

/// Allocate the next counter value for a device.
///
/// The increment-and-read runs against the device's metadata row while
/// the caller holds the connection, so no two allocations for the same
/// device can observe the same pre-increment value.
///
/// A device with no persisted identity yet returns 0 without
/// incrementing: the very first registration of a device's own record.
pub fn next_counter(conn: &Connection, device: &Device) -> Result<i64> {
    let Some(device_id) = &device.meta.id else {
        return Ok(0);
    };

    conn.execute(
        "INSERT OR IGNORE INTO device_metadata (device_id) VALUES (?1)",
        [device_id],
    )
    .map_err(DatabaseError::Sqlite)?;

    conn.execute(
        "UPDATE device_metadata SET counter_position = counter_position + 1
         WHERE device_id = ?1",
        [device_id],
    )
    .map_err(DatabaseError::Sqlite)?;

    let counter: i64 = conn
        .query_row(
            "SELECT counter_position FROM device_metadata WHERE device_id = ?1",
            [device_id],
            |row| row.get(0),
        )
        .map_err(DatabaseError::Sqlite)?;

    Ok(counter)
}
