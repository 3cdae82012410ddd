//! SQLite storage layer for the relay.
//!
//! Owns schema creation and CRUD for all persistent entities: devices, the
//! phone→DID mapping, account salts, encrypted message metadata with
//! per-recipient delivery rows, and the jar receipt log with its materialized
//! membership view. All timestamps are integer milliseconds since epoch.
//! Every statement is prepared with bound parameters.

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
    NotFound(String),
    /// A unique constraint fired; callers with a retry plan (sequence
    /// assignment) catch this variant specifically.
    Conflict(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Serde(e) => write!(f, "serialization error: {e}"),
            StorageError::NotFound(msg) => write!(f, "not found: {msg}"),
            StorageError::Conflict(msg) => write!(f, "conflict: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serde(e)
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::ConstraintViolation
    )
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

pub const DEVICE_STATUS_ACTIVE: &str = "active";
pub const DEVICE_STATUS_INACTIVE: &str = "inactive";

pub const MEMBER_STATUS_ACTIVE: &str = "active";
pub const MEMBER_STATUS_PENDING: &str = "pending";
pub const MEMBER_STATUS_REMOVED: &str = "removed";

pub const ROLE_OWNER: &str = "owner";
pub const ROLE_MEMBER: &str = "member";

/// Device row stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRow {
    pub device_id: String,
    pub owner_did: String,
    pub owner_encrypted_phone: String,
    pub device_name: String,
    pub pubkey_x25519: String,
    pub pubkey_ed25519: String,
    pub push_token: Option<String>,
    pub status: String,
    pub registered_at: i64,
    pub last_seen_at: i64,
}

/// Encrypted message metadata row. Exactly one of `blob_key` or
/// `payload_inline` (legacy base64 ciphertext) is set.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub message_id: String,
    pub receipt_cid: String,
    pub sender_did: String,
    pub sender_device_id: String,
    pub recipient_dids: Vec<String>,
    pub wrapped_keys: HashMap<String, String>,
    pub signature: String,
    pub blob_key: Option<String>,
    pub payload_inline: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Jar receipt envelope row. `sequence_number` is relay-assigned and lives
/// only in the envelope, never in the signed bytes.
#[derive(Debug, Clone)]
pub struct ReceiptRow {
    pub jar_id: String,
    pub sequence_number: i64,
    pub receipt_cid: String,
    pub receipt_data: Vec<u8>,
    pub signature: Vec<u8>,
    pub sender_did: String,
    pub received_at: i64,
    pub parent_cid: Option<String>,
}

/// Materialized jar membership row.
#[derive(Debug, Clone)]
pub struct JarMemberRow {
    pub jar_id: String,
    pub member_did: String,
    pub status: String,
    pub role: String,
    pub added_at: i64,
    pub removed_at: Option<i64>,
    pub added_by_receipt_cid: Option<String>,
    pub removed_by_receipt_cid: Option<String>,
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Main storage handle wrapping a SQLite connection.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;
             PRAGMA synchronous=NORMAL;",
        )?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    /// Cheap connectivity probe for the health endpoint.
    pub fn ping(&self) -> Result<(), StorageError> {
        self.conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS devices (
                device_id               TEXT PRIMARY KEY,
                owner_did               TEXT NOT NULL,
                owner_encrypted_phone   TEXT NOT NULL,
                device_name             TEXT NOT NULL,
                pubkey_x25519           TEXT NOT NULL,
                pubkey_ed25519          TEXT NOT NULL,
                push_token              TEXT,
                status                  TEXT NOT NULL DEFAULT 'active',
                registered_at           INTEGER NOT NULL,
                last_seen_at            INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_devices_owner
                ON devices(owner_did);
            CREATE INDEX IF NOT EXISTS idx_devices_phone
                ON devices(owner_encrypted_phone);
            CREATE INDEX IF NOT EXISTS idx_devices_status
                ON devices(status, last_seen_at);
            CREATE INDEX IF NOT EXISTS idx_devices_push
                ON devices(push_token);

            CREATE TABLE IF NOT EXISTS phone_to_did (
                encrypted_phone TEXT PRIMARY KEY,
                did             TEXT NOT NULL,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS account_salts (
                encrypted_phone TEXT PRIMARY KEY,
                salt            TEXT NOT NULL,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS encrypted_messages (
                message_id          TEXT PRIMARY KEY,
                receipt_cid         TEXT NOT NULL,
                sender_did          TEXT NOT NULL,
                sender_device_id    TEXT NOT NULL,
                recipient_dids      TEXT NOT NULL,
                wrapped_keys        TEXT NOT NULL,
                signature           TEXT NOT NULL,
                blob_key            TEXT,
                payload_inline      TEXT,
                created_at          INTEGER NOT NULL,
                expires_at          INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_blob_key
                ON encrypted_messages(blob_key);
            CREATE INDEX IF NOT EXISTS idx_messages_receipt_cid
                ON encrypted_messages(receipt_cid);
            CREATE INDEX IF NOT EXISTS idx_messages_expires
                ON encrypted_messages(expires_at);

            CREATE TABLE IF NOT EXISTS message_delivery (
                message_id      TEXT NOT NULL,
                recipient_did   TEXT NOT NULL,
                delivered_at    INTEGER,
                PRIMARY KEY (message_id, recipient_did)
            );

            CREATE INDEX IF NOT EXISTS idx_delivery_recipient
                ON message_delivery(recipient_did);

            CREATE TABLE IF NOT EXISTS jar_receipts (
                jar_id          TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                receipt_cid     TEXT NOT NULL UNIQUE,
                receipt_data    BLOB NOT NULL,
                signature       BLOB NOT NULL,
                sender_did      TEXT NOT NULL,
                received_at     INTEGER NOT NULL,
                parent_cid      TEXT,
                PRIMARY KEY (jar_id, sequence_number)
            );

            CREATE INDEX IF NOT EXISTS idx_receipts_sender
                ON jar_receipts(sender_did);
            CREATE INDEX IF NOT EXISTS idx_receipts_parent
                ON jar_receipts(parent_cid);

            CREATE TABLE IF NOT EXISTS jar_members (
                jar_id                  TEXT NOT NULL,
                member_did              TEXT NOT NULL,
                status                  TEXT NOT NULL,
                role                    TEXT NOT NULL,
                added_at                INTEGER NOT NULL,
                removed_at              INTEGER,
                added_by_receipt_cid    TEXT,
                removed_by_receipt_cid  TEXT,
                PRIMARY KEY (jar_id, member_did)
            );

            CREATE INDEX IF NOT EXISTS idx_members_did
                ON jar_members(member_did);
            CREATE INDEX IF NOT EXISTS idx_members_jar_status
                ON jar_members(jar_id, status);
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Account salts
    // -----------------------------------------------------------------------

    /// Insert a salt unless one already exists for the encrypted phone.
    /// Returns true when this call created the row. Concurrent first-time
    /// callers race on the primary key; exactly one insert wins and the rest
    /// re-read the winner's value.
    pub fn insert_salt_if_absent(
        &self,
        encrypted_phone: &str,
        salt: &str,
        now: i64,
    ) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "INSERT OR IGNORE INTO account_salts (encrypted_phone, salt, created_at)
             VALUES (?1, ?2, ?3)",
            params![encrypted_phone, salt, now],
        )?;
        Ok(affected > 0)
    }

    pub fn get_salt(&self, encrypted_phone: &str) -> Result<Option<String>, StorageError> {
        let salt = self
            .conn
            .query_row(
                "SELECT salt FROM account_salts WHERE encrypted_phone = ?1",
                params![encrypted_phone],
                |row| row.get(0),
            )
            .optional()?;
        Ok(salt)
    }

    // -----------------------------------------------------------------------
    // Phone → DID mapping
    // -----------------------------------------------------------------------

    pub fn upsert_phone_did(
        &self,
        encrypted_phone: &str,
        did: &str,
        now: i64,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO phone_to_did (encrypted_phone, did, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(encrypted_phone) DO UPDATE SET did = excluded.did",
            params![encrypted_phone, did, now],
        )?;
        Ok(())
    }

    pub fn get_did(&self, encrypted_phone: &str) -> Result<Option<String>, StorageError> {
        let did = self
            .conn
            .query_row(
                "SELECT did FROM phone_to_did WHERE encrypted_phone = ?1",
                params![encrypted_phone],
                |row| row.get(0),
            )
            .optional()?;
        Ok(did)
    }

    /// Resolve up to 12 encrypted phones in one IN-list query. Phones without
    /// a mapping are simply absent from the result.
    pub fn get_dids(
        &self,
        encrypted_phones: &[String],
    ) -> Result<Vec<(String, String)>, StorageError> {
        if encrypted_phones.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; encrypted_phones.len()].join(", ");
        let sql = format!(
            "SELECT encrypted_phone, did FROM phone_to_did WHERE encrypted_phone IN ({placeholders})"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let bind_refs: Vec<&dyn rusqlite::types::ToSql> = encrypted_phones
            .iter()
            .map(|p| p as &dyn rusqlite::types::ToSql)
            .collect();
        let rows = stmt.query_map(bind_refs.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    /// Insert a device, or on device_id conflict refresh its keys, name, push
    /// token and liveness while preserving registered_at.
    pub fn upsert_device(&self, row: &DeviceRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO devices
             (device_id, owner_did, owner_encrypted_phone, device_name,
              pubkey_x25519, pubkey_ed25519, push_token, status,
              registered_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(device_id) DO UPDATE SET
                device_name   = excluded.device_name,
                pubkey_x25519 = excluded.pubkey_x25519,
                pubkey_ed25519 = excluded.pubkey_ed25519,
                push_token    = excluded.push_token,
                status        = excluded.status,
                last_seen_at  = excluded.last_seen_at",
            params![
                row.device_id,
                row.owner_did,
                row.owner_encrypted_phone,
                row.device_name,
                row.pubkey_x25519,
                row.pubkey_ed25519,
                row.push_token,
                row.status,
                row.registered_at,
                row.last_seen_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_device(&self, device_id: &str) -> Result<Option<DeviceRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, owner_did, owner_encrypted_phone, device_name,
                    pubkey_x25519, pubkey_ed25519, push_token, status,
                    registered_at, last_seen_at
             FROM devices WHERE device_id = ?1",
        )?;
        let row = stmt
            .query_row(params![device_id], Self::map_device)
            .optional()?;
        Ok(row)
    }

    pub fn count_active_devices(&self, owner_did: &str) -> Result<i64, StorageError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM devices WHERE owner_did = ?1 AND status = 'active'",
            params![owner_did],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Active devices for up to 12 owner DIDs.
    pub fn list_active_devices(&self, dids: &[String]) -> Result<Vec<DeviceRow>, StorageError> {
        if dids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; dids.len()].join(", ");
        let sql = format!(
            "SELECT device_id, owner_did, owner_encrypted_phone, device_name,
                    pubkey_x25519, pubkey_ed25519, push_token, status,
                    registered_at, last_seen_at
             FROM devices
             WHERE status = 'active' AND owner_did IN ({placeholders})
             ORDER BY owner_did, registered_at"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let bind_refs: Vec<&dyn rusqlite::types::ToSql> =
            dids.iter().map(|d| d as &dyn rusqlite::types::ToSql).collect();
        let rows = stmt.query_map(bind_refs.as_slice(), Self::map_device)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Update last_seen_at for an active device. Returns false if the device
    /// is absent or inactive.
    pub fn touch_device(&self, device_id: &str, now: i64) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "UPDATE devices SET last_seen_at = ?1
             WHERE device_id = ?2 AND status = 'active'",
            params![now, device_id],
        )?;
        Ok(affected > 0)
    }

    /// The Ed25519 public key of the most recently registered active device
    /// for a DID, used to verify receipt signatures.
    pub fn latest_active_ed25519(&self, owner_did: &str) -> Result<Option<String>, StorageError> {
        let key = self
            .conn
            .query_row(
                "SELECT pubkey_ed25519 FROM devices
                 WHERE owner_did = ?1 AND status = 'active'
                 ORDER BY registered_at DESC, last_seen_at DESC
                 LIMIT 1",
                params![owner_did],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    /// (device_id, push_token) for every active device of the given DIDs that
    /// has a push token.
    pub fn active_push_targets(
        &self,
        dids: &[String],
    ) -> Result<Vec<(String, String)>, StorageError> {
        if dids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; dids.len()].join(", ");
        let sql = format!(
            "SELECT device_id, push_token FROM devices
             WHERE status = 'active' AND push_token IS NOT NULL
               AND owner_did IN ({placeholders})"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let bind_refs: Vec<&dyn rusqlite::types::ToSql> =
            dids.iter().map(|d| d as &dyn rusqlite::types::ToSql).collect();
        let rows = stmt.query_map(bind_refs.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Mark a device inactive and drop its push token (provider reported the
    /// token gone).
    pub fn deactivate_device(&self, device_id: &str) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "UPDATE devices SET status = 'inactive', push_token = NULL
             WHERE device_id = ?1",
            params![device_id],
        )?;
        Ok(affected > 0)
    }

    /// Delete devices not seen since the cutoff. Returns how many went.
    pub fn delete_idle_devices(&self, cutoff: i64) -> Result<usize, StorageError> {
        let affected = self.conn.execute(
            "DELETE FROM devices WHERE last_seen_at < ?1",
            params![cutoff],
        )?;
        Ok(affected)
    }

    fn map_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceRow> {
        Ok(DeviceRow {
            device_id: row.get(0)?,
            owner_did: row.get(1)?,
            owner_encrypted_phone: row.get(2)?,
            device_name: row.get(3)?,
            pubkey_x25519: row.get(4)?,
            pubkey_ed25519: row.get(5)?,
            push_token: row.get(6)?,
            status: row.get(7)?,
            registered_at: row.get(8)?,
            last_seen_at: row.get(9)?,
        })
    }

    // -----------------------------------------------------------------------
    // Encrypted messages & delivery
    // -----------------------------------------------------------------------

    pub fn insert_message(&self, row: &MessageRow) -> Result<(), StorageError> {
        let recipient_dids = serde_json::to_string(&row.recipient_dids)?;
        let wrapped_keys = serde_json::to_string(&row.wrapped_keys)?;
        self.conn.execute(
            "INSERT INTO encrypted_messages
             (message_id, receipt_cid, sender_did, sender_device_id,
              recipient_dids, wrapped_keys, signature, blob_key,
              payload_inline, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                row.message_id,
                row.receipt_cid,
                row.sender_did,
                row.sender_device_id,
                recipient_dids,
                wrapped_keys,
                row.signature,
                row.blob_key,
                row.payload_inline,
                row.created_at,
                row.expires_at,
            ],
        )?;
        Ok(())
    }

    pub fn message_exists(&self, message_id: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM encrypted_messages WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<MessageRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, receipt_cid, sender_did, sender_device_id,
                    recipient_dids, wrapped_keys, signature, blob_key,
                    payload_inline, created_at, expires_at
             FROM encrypted_messages WHERE message_id = ?1",
        )?;
        let raw = stmt
            .query_row(params![message_id], Self::map_message_raw)
            .optional()?;
        raw.map(Self::finish_message).transpose()
    }

    /// Non-expired messages deliverable to `did`, newest first. `since` is an
    /// exclusive lower bound on created_at.
    pub fn inbox(
        &self,
        did: &str,
        since: Option<i64>,
        limit: u32,
        now: i64,
    ) -> Result<Vec<MessageRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT m.message_id, m.receipt_cid, m.sender_did, m.sender_device_id,
                    m.recipient_dids, m.wrapped_keys, m.signature, m.blob_key,
                    m.payload_inline, m.created_at, m.expires_at
             FROM encrypted_messages m
             JOIN message_delivery d ON d.message_id = m.message_id
             WHERE d.recipient_did = ?1
               AND m.created_at > ?2
               AND m.expires_at > ?3
             ORDER BY m.created_at DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![did, since.unwrap_or(0), now, limit],
            Self::map_message_raw,
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(Self::finish_message(row?)?);
        }
        Ok(result)
    }

    pub fn insert_delivery(
        &self,
        message_id: &str,
        recipient_did: &str,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO message_delivery (message_id, recipient_did, delivered_at)
             VALUES (?1, ?2, NULL)",
            params![message_id, recipient_did],
        )?;
        Ok(())
    }

    /// Set delivered_at on a pending delivery. The NULL guard makes the ack
    /// monotonic: a second ack is a no-op returning false.
    pub fn mark_delivered(
        &self,
        message_id: &str,
        recipient_did: &str,
        now: i64,
    ) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "UPDATE message_delivery SET delivered_at = ?1
             WHERE message_id = ?2 AND recipient_did = ?3 AND delivered_at IS NULL",
            params![now, message_id, recipient_did],
        )?;
        Ok(affected > 0)
    }

    pub fn has_pending_delivery(
        &self,
        message_id: &str,
        recipient_did: &str,
    ) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM message_delivery
             WHERE message_id = ?1 AND recipient_did = ?2 AND delivered_at IS NULL",
            params![message_id, recipient_did],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Delete a message and its delivery rows in one transaction.
    pub fn delete_message(&self, message_id: &str) -> Result<bool, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM message_delivery WHERE message_id = ?1",
            params![message_id],
        )?;
        let affected = tx.execute(
            "DELETE FROM encrypted_messages WHERE message_id = ?1",
            params![message_id],
        )?;
        tx.commit()?;
        Ok(affected > 0)
    }

    /// (message_id, blob_key) of every expired message.
    pub fn expired_messages(
        &self,
        now: i64,
    ) -> Result<Vec<(String, Option<String>)>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, blob_key FROM encrypted_messages WHERE expires_at < ?1",
        )?;
        let rows = stmt.query_map(params![now], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Delete delivery rows whose message no longer exists. Returns the count.
    pub fn delete_orphan_deliveries(&self) -> Result<usize, StorageError> {
        let affected = self.conn.execute(
            "DELETE FROM message_delivery
             WHERE message_id NOT IN (SELECT message_id FROM encrypted_messages)",
            [],
        )?;
        Ok(affected)
    }

    fn map_message_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
        Ok(RawMessage {
            message_id: row.get(0)?,
            receipt_cid: row.get(1)?,
            sender_did: row.get(2)?,
            sender_device_id: row.get(3)?,
            recipient_dids: row.get(4)?,
            wrapped_keys: row.get(5)?,
            signature: row.get(6)?,
            blob_key: row.get(7)?,
            payload_inline: row.get(8)?,
            created_at: row.get(9)?,
            expires_at: row.get(10)?,
        })
    }

    fn finish_message(raw: RawMessage) -> Result<MessageRow, StorageError> {
        Ok(MessageRow {
            message_id: raw.message_id,
            receipt_cid: raw.receipt_cid,
            sender_did: raw.sender_did,
            sender_device_id: raw.sender_device_id,
            recipient_dids: serde_json::from_str(&raw.recipient_dids)?,
            wrapped_keys: serde_json::from_str(&raw.wrapped_keys)?,
            signature: raw.signature,
            blob_key: raw.blob_key,
            payload_inline: raw.payload_inline,
            created_at: raw.created_at,
            expires_at: raw.expires_at,
        })
    }

    // -----------------------------------------------------------------------
    // Jar receipts
    // -----------------------------------------------------------------------

    pub fn get_receipt_by_cid(&self, cid: &str) -> Result<Option<ReceiptRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT jar_id, sequence_number, receipt_cid, receipt_data,
                    signature, sender_did, received_at, parent_cid
             FROM jar_receipts WHERE receipt_cid = ?1",
        )?;
        let row = stmt.query_row(params![cid], Self::map_receipt).optional()?;
        Ok(row)
    }

    pub fn receipt_cid_exists(&self, cid: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM jar_receipts WHERE receipt_cid = ?1",
            params![cid],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn has_receipts(&self, jar_id: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM jar_receipts WHERE jar_id = ?1",
            params![jar_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Append a receipt with the next dense sequence number for its jar.
    ///
    /// The sequence is computed inside the INSERT itself so two concurrent
    /// appends race only on the (jar_id, sequence_number) unique constraint;
    /// the loser surfaces as [`StorageError::Conflict`] for the caller's
    /// bounded retry.
    pub fn insert_receipt_next_seq(
        &self,
        jar_id: &str,
        receipt_cid: &str,
        receipt_data: &[u8],
        signature: &[u8],
        sender_did: &str,
        received_at: i64,
        parent_cid: Option<&str>,
    ) -> Result<i64, StorageError> {
        let inserted = self.conn.execute(
            "INSERT INTO jar_receipts
             (jar_id, sequence_number, receipt_cid, receipt_data,
              signature, sender_did, received_at, parent_cid)
             VALUES (
                ?1,
                (SELECT COALESCE(MAX(sequence_number), 0) + 1
                 FROM jar_receipts WHERE jar_id = ?1),
                ?2, ?3, ?4, ?5, ?6, ?7
             )",
            params![
                jar_id,
                receipt_cid,
                receipt_data,
                signature,
                sender_did,
                received_at,
                parent_cid,
            ],
        );
        match inserted {
            Ok(_) => {
                let sequence = self.conn.query_row(
                    "SELECT sequence_number FROM jar_receipts WHERE receipt_cid = ?1",
                    params![receipt_cid],
                    |row| row.get(0),
                )?;
                Ok(sequence)
            }
            Err(e) if is_unique_violation(&e) => {
                Err(StorageError::Conflict(format!("sequence race in jar {jar_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Receipts with sequence_number > `after`, ascending, capped at `limit`.
    pub fn receipts_after(
        &self,
        jar_id: &str,
        after: i64,
        limit: u32,
    ) -> Result<Vec<ReceiptRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT jar_id, sequence_number, receipt_cid, receipt_data,
                    signature, sender_did, received_at, parent_cid
             FROM jar_receipts
             WHERE jar_id = ?1 AND sequence_number > ?2
             ORDER BY sequence_number ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![jar_id, after, limit], Self::map_receipt)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Receipts with sequence_number in [from, to], ascending.
    pub fn receipts_range(
        &self,
        jar_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<ReceiptRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT jar_id, sequence_number, receipt_cid, receipt_data,
                    signature, sender_did, received_at, parent_cid
             FROM jar_receipts
             WHERE jar_id = ?1 AND sequence_number >= ?2 AND sequence_number <= ?3
             ORDER BY sequence_number ASC",
        )?;
        let rows = stmt.query_map(params![jar_id, from, to], Self::map_receipt)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn map_receipt(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReceiptRow> {
        Ok(ReceiptRow {
            jar_id: row.get(0)?,
            sequence_number: row.get(1)?,
            receipt_cid: row.get(2)?,
            receipt_data: row.get(3)?,
            signature: row.get(4)?,
            sender_did: row.get(5)?,
            received_at: row.get(6)?,
            parent_cid: row.get(7)?,
        })
    }

    // -----------------------------------------------------------------------
    // Jar members (materialized view)
    // -----------------------------------------------------------------------

    pub fn get_member(
        &self,
        jar_id: &str,
        member_did: &str,
    ) -> Result<Option<JarMemberRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT jar_id, member_did, status, role, added_at, removed_at,
                    added_by_receipt_cid, removed_by_receipt_cid
             FROM jar_members WHERE jar_id = ?1 AND member_did = ?2",
        )?;
        let row = stmt
            .query_row(params![jar_id, member_did], Self::map_member)
            .optional()?;
        Ok(row)
    }

    pub fn is_active_member(&self, jar_id: &str, did: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM jar_members
             WHERE jar_id = ?1 AND member_did = ?2 AND status = 'active'",
            params![jar_id, did],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn count_active_members(&self, jar_id: &str) -> Result<i64, StorageError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM jar_members WHERE jar_id = ?1 AND status = 'active'",
            params![jar_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Insert or replace a membership row. Re-adding after removal overwrites
    /// the old row wholesale.
    pub fn upsert_member(&self, row: &JarMemberRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO jar_members
             (jar_id, member_did, status, role, added_at, removed_at,
              added_by_receipt_cid, removed_by_receipt_cid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.jar_id,
                row.member_did,
                row.status,
                row.role,
                row.added_at,
                row.removed_at,
                row.added_by_receipt_cid,
                row.removed_by_receipt_cid,
            ],
        )?;
        Ok(())
    }

    pub fn set_member_removed(
        &self,
        jar_id: &str,
        member_did: &str,
        removed_at: i64,
        removed_by_receipt_cid: &str,
    ) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "UPDATE jar_members
             SET status = 'removed', removed_at = ?1, removed_by_receipt_cid = ?2
             WHERE jar_id = ?3 AND member_did = ?4",
            params![removed_at, removed_by_receipt_cid, jar_id, member_did],
        )?;
        Ok(affected > 0)
    }

    pub fn set_member_active(
        &self,
        jar_id: &str,
        member_did: &str,
    ) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "UPDATE jar_members SET status = 'active'
             WHERE jar_id = ?1 AND member_did = ?2",
            params![jar_id, member_did],
        )?;
        Ok(affected > 0)
    }

    /// Every (jar_id, role) where the DID is an active member.
    pub fn list_jars_for(&self, did: &str) -> Result<Vec<(String, String)>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT jar_id, role FROM jar_members
             WHERE member_did = ?1 AND status = 'active'
             ORDER BY jar_id",
        )?;
        let rows = stmt.query_map(params![did], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn list_members(&self, jar_id: &str) -> Result<Vec<JarMemberRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT jar_id, member_did, status, role, added_at, removed_at,
                    added_by_receipt_cid, removed_by_receipt_cid
             FROM jar_members WHERE jar_id = ?1 ORDER BY member_did",
        )?;
        let rows = stmt.query_map(params![jar_id], Self::map_member)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Drop a jar's membership view ahead of a replay rebuild.
    pub fn clear_members(&self, jar_id: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "DELETE FROM jar_members WHERE jar_id = ?1",
            params![jar_id],
        )?;
        Ok(())
    }

    fn map_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<JarMemberRow> {
        Ok(JarMemberRow {
            jar_id: row.get(0)?,
            member_did: row.get(1)?,
            status: row.get(2)?,
            role: row.get(3)?,
            added_at: row.get(4)?,
            removed_at: row.get(5)?,
            added_by_receipt_cid: row.get(6)?,
            removed_by_receipt_cid: row.get(7)?,
        })
    }
}

/// Intermediate row with the JSON columns still encoded.
struct RawMessage {
    message_id: String,
    receipt_cid: String,
    sender_did: String,
    sender_device_id: String,
    recipient_dids: String,
    wrapped_keys: String,
    signature: String,
    blob_key: Option<String>,
    payload_inline: Option<String>,
    created_at: i64,
    expires_at: i64,
}
