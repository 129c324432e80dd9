//! Local signing-key persistence.
//!
//! A store holds at most one signing key, belonging to the device the
//! process runs as. Stored as the raw 32-byte seed in a single-row table.

use crate::crypto::DeviceKeys;
use crate::{DatabaseError, Result};
use rusqlite::Connection;
use zeroize::Zeroize;

/// Store the local signing key, replacing any previous one.
pub fn store_local_keys(conn: &Connection, keys: &DeviceKeys) -> Result<()> {
    let mut seed = keys.seed_bytes();
    let result = conn.execute(
        "INSERT INTO local_keys (id, signing_key) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET signing_key = excluded.signing_key",
        [seed.as_slice()],
    );
    seed.zeroize();
    result.map_err(DatabaseError::Sqlite)?;
    Ok(())
}

/// Load the local signing key, if one has been stored.
pub fn load_local_keys(conn: &Connection) -> Result<Option<DeviceKeys>> {
    let result = conn.query_row("SELECT signing_key FROM local_keys WHERE id = 1", [], |row| {
        row.get::<_, Vec<u8>>(0)
    });

    match result {
        Ok(mut seed) => {
            let keys = DeviceKeys::from_seed(&seed);
            seed.zeroize();
            Ok(Some(keys?))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(DatabaseError::Sqlite(e).into()),
    }
}
