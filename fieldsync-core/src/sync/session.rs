//! Mutual session handshake between two devices.
//!
//! Before any exchange, client and server each prove control of their
//! device key by signing the shared nonce string. Either side failing
//! verification terminates the session; no partial trust is granted.

use crate::crypto::{self, DeviceKeys};
use crate::sync::device::Device;
use crate::{DatabaseError, Result};
use rusqlite::Connection;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Handshake errors.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// A nonce signature failed to verify in either direction. The
    /// session is terminal; no exchange may use it.
    #[error("Handshake rejected: {0}")]
    Rejected(String),

    #[error("Session is in state '{0}', transition not allowed")]
    InvalidState(&'static str),

    #[error("Session is not verified; sync exchange refused")]
    NotVerified,
}

/// Handshake progression. `Verified` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initiated,
    ServerResponded,
    Verified,
    Rejected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::ServerResponded => "server_responded",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "server_responded" => Self::ServerResponded,
            "verified" => Self::Verified,
            "rejected" => Self::Rejected,
            _ => Self::Initiated,
        }
    }
}

/// A single handshake attempt, keyed by its client nonce.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSession {
    pub client_nonce: String,
    pub client_device_id: String,
    pub server_nonce: String,
    pub server_device_id: Option<String>,
    pub state: SessionState,
    pub created_at: i64,
}

impl SyncSession {
    /// Start a handshake as the client: generate a fresh nonce and
    /// persist the attempt. A nonce identifies exactly one attempt; the
    /// primary key enforces single use.
    pub fn initiate(conn: &Connection, client_device: &Device) -> Result<Self> {
        let session = Self {
            client_nonce: Uuid::new_v4().simple().to_string(),
            client_device_id: client_device.meta.require_id()?.to_string(),
            server_nonce: String::new(),
            server_device_id: None,
            state: SessionState::Initiated,
            created_at: chrono::Utc::now().timestamp(),
        };

        conn.execute(
            "INSERT INTO sync_sessions (client_nonce, client_device_id, server_nonce,
                                        server_device_id, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                session.client_nonce,
                session.client_device_id,
                session.server_nonce,
                session.server_device_id,
                session.state.as_str(),
                session.created_at,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;

        Ok(session)
    }

    /// Fill in the server half of the handshake.
    pub fn respond(&mut self, conn: &Connection, server_device: &Device) -> Result<()> {
        if self.state != SessionState::Initiated {
            return Err(HandshakeError::InvalidState(self.state.as_str()).into());
        }
        self.server_nonce = Uuid::new_v4().simple().to_string();
        self.server_device_id = Some(server_device.meta.require_id()?.to_string());
        self.state = SessionState::ServerResponded;
        self.update(conn)
    }

    /// The string both sides sign: nonces and device ids in a fixed
    /// order, so neither side can swap identities after the fact.
    pub fn canonical_string(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.client_nonce,
            self.client_device_id,
            self.server_nonce,
            self.server_device_id.as_deref().unwrap_or("")
        )
    }

    /// Sign the session as one of the two parties.
    pub fn sign(&self, keys: &DeviceKeys) -> String {
        keys.sign_base64(self.canonical_string().as_bytes())
    }

    pub fn verify_client_signature(&self, conn: &Connection, signature: &str) -> Result<bool> {
        self.verify_party(conn, Some(self.client_device_id.as_str()), signature)
    }

    pub fn verify_server_signature(&self, conn: &Connection, signature: &str) -> Result<bool> {
        self.verify_party(conn, self.server_device_id.as_deref(), signature)
    }

    fn verify_party(
        &self,
        conn: &Connection,
        device_id: Option<&str>,
        signature: &str,
    ) -> Result<bool> {
        let Some(device_id) = device_id else {
            return Ok(false);
        };
        let Some(device) = Device::load(conn, device_id)? else {
            return Ok(false);
        };
        let key = device.verifying_key()?;
        Ok(crypto::verify_base64(
            &key,
            self.canonical_string().as_bytes(),
            signature,
        ))
    }

    /// Check both signatures and move to a terminal state. Both must
    /// verify for `Verified`; anything less rejects the session.
    pub fn finalize(
        &mut self,
        conn: &Connection,
        client_signature: &str,
        server_signature: &str,
    ) -> Result<()> {
        if self.state != SessionState::ServerResponded {
            return Err(HandshakeError::InvalidState(self.state.as_str()).into());
        }

        let client_ok = self.verify_client_signature(conn, client_signature)?;
        let server_ok = self.verify_server_signature(conn, server_signature)?;

        if client_ok && server_ok {
            self.state = SessionState::Verified;
            self.update(conn)?;
            debug!(client_nonce = %self.client_nonce, "session verified");
            Ok(())
        } else {
            self.state = SessionState::Rejected;
            self.update(conn)?;
            let side = if client_ok { "server" } else { "client" };
            Err(HandshakeError::Rejected(format!("{} nonce signature did not verify", side)).into())
        }
    }

    pub fn is_verified(&self) -> bool {
        self.state == SessionState::Verified
    }

    /// Load a handshake attempt by its client nonce.
    pub fn load(conn: &Connection, client_nonce: &str) -> Result<Option<Self>> {
        let result = conn.query_row(
            "SELECT client_nonce, client_device_id, server_nonce, server_device_id,
                    state, created_at
             FROM sync_sessions WHERE client_nonce = ?1",
            [client_nonce],
            |row| {
                let state: String = row.get(4)?;
                Ok(Self {
                    client_nonce: row.get(0)?,
                    client_device_id: row.get(1)?,
                    server_nonce: row.get(2)?,
                    server_device_id: row.get(3)?,
                    state: SessionState::parse(&state),
                    created_at: row.get(5)?,
                })
            },
        );
        match result {
            Ok(session) => Ok(Some(session)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DatabaseError::Sqlite(e).into()),
        }
    }

    fn update(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "UPDATE sync_sessions SET server_nonce = ?1, server_device_id = ?2, state = ?3
             WHERE client_nonce = ?4",
            rusqlite::params![
                self.server_nonce,
                self.server_device_id,
                self.state.as_str(),
                self.client_nonce,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    /// Discard handshake attempts older than `max_age_secs`.
    pub fn prune_stale(conn: &Connection, max_age_secs: i64) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp() - max_age_secs;
        let pruned = conn
            .execute("DELETE FROM sync_sessions WHERE created_at < ?1", [cutoff])
            .map_err(DatabaseError::Sqlite)?;
        if pruned > 0 {
            debug!(pruned, "pruned stale sync sessions");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::sync::device::{create_central_authority_device, register_own_device, LocalIdentity};
    use crate::FieldSyncError;

    /// One store holding both parties' device records, as each side of
    /// a real exchange would after syncing devices.
    fn two_party_store() -> (Database, LocalIdentity, LocalIdentity) {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        let server = create_central_authority_device(db.conn(), "central").unwrap();
        let client = register_own_device(db.conn(), "clinic-7").unwrap();
        (db, client, server)
    }

    #[test]
    fn full_handshake_verifies() {
        let (db, client, server) = two_party_store();

        let mut session = SyncSession::initiate(db.conn(), &client.device).unwrap();
        assert_eq!(session.state, SessionState::Initiated);
        assert_eq!(session.client_nonce.len(), 32);
        assert!(session.server_nonce.is_empty());

        session.respond(db.conn(), &server.device).unwrap();
        assert_eq!(session.state, SessionState::ServerResponded);

        let client_sig = session.sign(&client.keys);
        let server_sig = session.sign(&server.keys);
        session
            .finalize(db.conn(), &client_sig, &server_sig)
            .unwrap();
        assert!(session.is_verified());

        let stored = SyncSession::load(db.conn(), &session.client_nonce)
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, SessionState::Verified);
    }

    #[test]
    fn wrong_server_key_rejects_the_session() {
        let (db, client, server) = two_party_store();

        let mut session = SyncSession::initiate(db.conn(), &client.device).unwrap();
        session.respond(db.conn(), &server.device).unwrap();

        let client_sig = session.sign(&client.keys);
        // Server signs with a key that does not match its device record.
        let imposter = DeviceKeys::generate();
        let server_sig = session.sign(&imposter);

        let err = session
            .finalize(db.conn(), &client_sig, &server_sig)
            .unwrap_err();
        assert!(matches!(
            err,
            FieldSyncError::Handshake(HandshakeError::Rejected(_))
        ));
        assert_eq!(session.state, SessionState::Rejected);

        let stored = SyncSession::load(db.conn(), &session.client_nonce)
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, SessionState::Rejected);
    }

    #[test]
    fn wrong_client_key_rejects_the_session() {
        let (db, client, server) = two_party_store();

        let mut session = SyncSession::initiate(db.conn(), &client.device).unwrap();
        session.respond(db.conn(), &server.device).unwrap();

        let imposter = DeviceKeys::generate();
        let client_sig = session.sign(&imposter);
        let server_sig = session.sign(&server.keys);

        assert!(session
            .finalize(db.conn(), &client_sig, &server_sig)
            .is_err());
        assert_eq!(session.state, SessionState::Rejected);
    }

    #[test]
    fn canonical_string_binds_nonces_and_identities() {
        let (db, client, server) = two_party_store();

        let mut session = SyncSession::initiate(db.conn(), &client.device).unwrap();
        session.respond(db.conn(), &server.device).unwrap();

        let expected = format!(
            "{}:{}:{}:{}",
            session.client_nonce,
            client.device.meta.id.as_deref().unwrap(),
            session.server_nonce,
            server.device.meta.id.as_deref().unwrap(),
        );
        assert_eq!(session.canonical_string(), expected);
    }

    #[test]
    fn signature_over_a_different_session_does_not_transfer() {
        let (db, client, server) = two_party_store();

        let mut first = SyncSession::initiate(db.conn(), &client.device).unwrap();
        first.respond(db.conn(), &server.device).unwrap();

        let mut second = SyncSession::initiate(db.conn(), &client.device).unwrap();
        second.respond(db.conn(), &server.device).unwrap();

        // Signatures are bound to the nonces of their own session.
        let replayed_client_sig = first.sign(&client.keys);
        let server_sig = second.sign(&server.keys);
        assert!(second
            .finalize(db.conn(), &replayed_client_sig, &server_sig)
            .is_err());
    }

    #[test]
    fn finalize_requires_a_server_response() {
        let (db, client, server) = two_party_store();

        let mut session = SyncSession::initiate(db.conn(), &client.device).unwrap();
        let sig = session.sign(&client.keys);
        let err = session.finalize(db.conn(), &sig, &sig).unwrap_err();
        assert!(matches!(
            err,
            FieldSyncError::Handshake(HandshakeError::InvalidState(_))
        ));
        drop(server);
    }

    #[test]
    fn stale_sessions_are_pruned() {
        let (db, client, server) = two_party_store();

        let mut session = SyncSession::initiate(db.conn(), &client.device).unwrap();
        session.respond(db.conn(), &server.device).unwrap();

        // Age the session past the cutoff.
        db.conn()
            .execute(
                "UPDATE sync_sessions SET created_at = created_at - 7200 WHERE client_nonce = ?1",
                [&session.client_nonce],
            )
            .unwrap();

        let pruned = SyncSession::prune_stale(db.conn(), 3600).unwrap();
        assert_eq!(pruned, 1);
        assert!(SyncSession::load(db.conn(), &session.client_nonce)
            .unwrap()
            .is_none());
    }
}
