//! Database schema and connection management.

use crate::{DatabaseError, Result};
use rusqlite::Connection;
use std::path::Path;

/// Sync metadata columns shared by every syncable record table.
const SYNC_COLUMNS: &str = "id TEXT PRIMARY KEY,
                counter INTEGER NOT NULL,
                signature TEXT NOT NULL DEFAULT '',
                signed_by TEXT,
                signed_version INTEGER NOT NULL DEFAULT 1";

/// Main database connection and schema manager
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(DatabaseError::Sqlite)?;

        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Sqlite)?;

        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;

        Ok(Self { conn })
    }

    /// Access the underlying connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Initialize the database schema
    pub fn initialize_schema(&self) -> Result<()> {
        self.create_device_tables()?;
        self.create_session_table()?;
        self.create_record_tables()?;
        self.create_indexes()?;
        Ok(())
    }

    fn create_device_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS devices (
                {SYNC_COLUMNS},
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                public_key TEXT NOT NULL DEFAULT '',
                revoked INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS device_metadata (
                device_id TEXT PRIMARY KEY,
                is_trusted_authority INTEGER NOT NULL DEFAULT 0,
                is_own_device INTEGER NOT NULL DEFAULT 0,
                counter_position INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS local_keys (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                signing_key BLOB NOT NULL
            );"
            ))
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_session_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS sync_sessions (
                client_nonce TEXT PRIMARY KEY,
                client_device_id TEXT NOT NULL,
                server_nonce TEXT NOT NULL DEFAULT '',
                server_device_id TEXT,
                state TEXT NOT NULL DEFAULT 'initiated',
                created_at INTEGER NOT NULL
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_record_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS organizations (
                {SYNC_COLUMNS},
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS zones (
                {SYNC_COLUMNS},
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                organization_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS zone_organizations (
                {SYNC_COLUMNS},
                zone_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                role TEXT NOT NULL,
                notes TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS facilities (
                {SYNC_COLUMNS},
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                address TEXT NOT NULL DEFAULT '',
                address_normalized TEXT NOT NULL DEFAULT '',
                latitude REAL,
                longitude REAL,
                zone_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS facility_users (
                {SYNC_COLUMNS},
                facility_id TEXT NOT NULL,
                username TEXT NOT NULL,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                notes TEXT NOT NULL DEFAULT '',
                password TEXT NOT NULL,
                UNIQUE (facility_id, username)
            );

            CREATE TABLE IF NOT EXISTS device_zones (
                {SYNC_COLUMNS},
                device_id TEXT NOT NULL,
                zone_id TEXT NOT NULL,
                is_primary INTEGER NOT NULL DEFAULT 1,
                UNIQUE (device_id, zone_id)
            );"
            ))
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_indexes(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE INDEX IF NOT EXISTS idx_devices_signer
                ON devices(signed_by, counter);
            CREATE INDEX IF NOT EXISTS idx_organizations_signer
                ON organizations(signed_by, counter);
            CREATE INDEX IF NOT EXISTS idx_zones_signer
                ON zones(signed_by, counter);
            CREATE INDEX IF NOT EXISTS idx_zone_organizations_signer
                ON zone_organizations(signed_by, counter);
            CREATE INDEX IF NOT EXISTS idx_facilities_signer
                ON facilities(signed_by, counter);
            CREATE INDEX IF NOT EXISTS idx_facility_users_signer
                ON facility_users(signed_by, counter);
            CREATE INDEX IF NOT EXISTS idx_device_zones_signer
                ON device_zones(signed_by, counter);
            CREATE INDEX IF NOT EXISTS idx_sessions_created
                ON sync_sessions(created_at);",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }
}
