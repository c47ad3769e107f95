//! SQLite connection wrapper.

use crate::error::{StorageError, StorageResult};
use crate::row::{ObjectRow, PeerState, RowWrite, ORIGIN_LEN};
use crate::schema::{self, ROW_COLUMNS};
use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Options applied when a connection is opened.
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// One connection to a setup's database file.
///
/// A backend is owned by a single thread. Several backends may point at
/// the same file; SQLite serializes their writers.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Connection,
    path: PathBuf,
}

impl SqliteBackend {
    /// Opens the database file at `path`, creating it and its parent
    /// directory if needed, and installs the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created or the
    /// schema cannot be installed.
    pub fn open(path: &Path, options: OpenOptions) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(options.busy_timeout)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(schema::SCHEMA)?;
        tracing::trace!(path = %path.display(), journal_mode = %mode, "opened sqlite connection");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Returns the path of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of all object types that have ever been written.
    pub fn type_names(&self) -> StorageResult<Vec<String>> {
        Ok(schema::all_tables(&self.conn)?
            .into_iter()
            .map(|(type_name, _)| type_name)
            .collect())
    }

    /// Number of live (non-tombstoned) objects of a type.
    pub fn count(&self, type_name: &str) -> StorageResult<u64> {
        let Some(table) = schema::lookup_table(&self.conn, type_name)? else {
            return Ok(0);
        };
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{table}\" WHERE tombstone = 0"),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Keys of all live objects of a type, in ascending order.
    pub fn keys(&self, type_name: &str) -> StorageResult<Vec<String>> {
        let Some(table) = schema::lookup_table(&self.conn, type_name)? else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT key FROM \"{table}\" WHERE tombstone = 0 ORDER BY key"
        ))?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// Reads a single row, tombstones included.
    pub fn get(&self, type_name: &str, key: &str) -> StorageResult<Option<ObjectRow>> {
        read_one(&self.conn, type_name, key)
    }

    /// All live rows of a type, ordered by key.
    pub fn load_all(&self, type_name: &str) -> StorageResult<Vec<ObjectRow>> {
        self.select(type_name, "tombstone = 0", None)
    }

    /// Live rows whose key matches a glob pattern (`*`, `?`, `[...]`).
    pub fn search(&self, type_name: &str, pattern: &str) -> StorageResult<Vec<ObjectRow>> {
        self.select(type_name, "tombstone = 0 AND key GLOB ?1", Some(pattern))
    }

    fn select(
        &self,
        type_name: &str,
        filter: &str,
        pattern: Option<&str>,
    ) -> StorageResult<Vec<ObjectRow>> {
        let Some(table) = schema::lookup_table(&self.conn, type_name)? else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ROW_COLUMNS} FROM \"{table}\" WHERE {filter} ORDER BY key"
        ))?;
        let rows = match pattern {
            Some(pattern) => stmt
                .query_map(params![pattern], |row| schema::read_row(type_name, row))?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], |row| schema::read_row(type_name, row))?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    /// Rows committed after `since`, across all types, in sequence order.
    ///
    /// With `pending_only` set, rows already acknowledged by a peer are
    /// skipped.
    pub fn changes_since(
        &self,
        since: u64,
        limit: usize,
        pending_only: bool,
    ) -> StorageResult<Vec<ObjectRow>> {
        let filter = if pending_only {
            "seq > ?1 AND pending = 1"
        } else {
            "seq > ?1"
        };
        let mut rows = Vec::new();
        for (type_name, table) in schema::all_tables(&self.conn)? {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {ROW_COLUMNS} FROM \"{table}\" WHERE {filter} ORDER BY seq LIMIT ?2"
            ))?;
            let found = stmt
                .query_map(params![since as i64, limit as i64], |row| {
                    schema::read_row(&type_name, row)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.extend(found);
        }
        rows.sort_by_key(|row| row.seq);
        rows.truncate(limit);
        Ok(rows)
    }

    /// Number of rows waiting for acknowledgement.
    pub fn pending_count(&self) -> StorageResult<u64> {
        let mut total = 0u64;
        for (_, table) in schema::all_tables(&self.conn)? {
            let count: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM \"{table}\" WHERE pending = 1"),
                [],
                |row| row.get(0),
            )?;
            total += count as u64;
        }
        Ok(total)
    }

    /// Highest sequence number committed so far (0 when empty).
    pub fn last_seq(&self) -> StorageResult<u64> {
        Ok(schema::read_next_seq(&self.conn)?.saturating_sub(1))
    }

    /// Replication state kept for `peer`.
    pub fn peer_state(&self, peer: &[u8; ORIGIN_LEN]) -> StorageResult<PeerState> {
        schema::read_peer(&self.conn, peer)
    }

    /// The peer with the most recent handshake, if any.
    pub fn last_peer(&self) -> StorageResult<Option<[u8; ORIGIN_LEN]>> {
        let mut stmt = self
            .conn
            .prepare("SELECT peer FROM peer_state ORDER BY last_seen DESC LIMIT 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => {
                let bytes: Vec<u8> = row.get(0)?;
                let peer = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::corrupted("peer id must be 16 bytes"))?;
                Ok(Some(peer))
            }
            None => Ok(None),
        }
    }

    /// Reads a free-form metadata value.
    pub fn meta(&self, name: &str) -> StorageResult<Option<String>> {
        schema::read_meta(&self.conn, name)
    }

    /// Runs `f` inside an immediate (write-locking) transaction.
    ///
    /// The transaction commits if `f` returns `Ok` and rolls back
    /// otherwise.
    pub fn write<T, E>(&mut self, f: impl FnOnce(&WriteTxn<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)?;
        let txn = WriteTxn { tx };
        let value = f(&txn)?;
        txn.tx.commit().map_err(StorageError::from)?;
        Ok(value)
    }
}

fn read_one(conn: &Connection, type_name: &str, key: &str) -> StorageResult<Option<ObjectRow>> {
    let Some(table) = schema::lookup_table(conn, type_name)? else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {ROW_COLUMNS} FROM \"{table}\" WHERE key = ?1"
    ))?;
    let mut rows = stmt.query(params![key])?;
    match rows.next()? {
        Some(row) => Ok(Some(schema::read_row(type_name, row)?)),
        None => Ok(None),
    }
}

/// An open write transaction.
pub struct WriteTxn<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl WriteTxn<'_> {
    /// Reads a row as seen inside this transaction.
    pub fn get(&self, type_name: &str, key: &str) -> StorageResult<Option<ObjectRow>> {
        read_one(&self.tx, type_name, key)
    }

    /// Writes a row and returns the sequence number assigned to it.
    pub fn put(&self, write: RowWrite<'_>) -> StorageResult<u64> {
        let table = schema::ensure_table(&self.tx, write.type_name)?;
        let seq = self.allocate_seq()?;
        self.tx.execute(
            &format!(
                "INSERT INTO \"{table}\" ({ROW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(key) DO UPDATE SET
                    payload = excluded.payload,
                    version = excluded.version,
                    origin = excluded.origin,
                    tombstone = excluded.tombstone,
                    seq = excluded.seq,
                    pending = excluded.pending"
            ),
            params![
                write.key,
                write.payload,
                write.version as i64,
                write.origin.as_slice(),
                write.tombstone,
                seq as i64,
                write.pending,
            ],
        )?;
        Ok(seq)
    }

    fn allocate_seq(&self) -> StorageResult<u64> {
        let seq = schema::read_next_seq(&self.tx)?;
        schema::write_meta(&self.tx, schema::NEXT_SEQ, &(seq + 1).to_string())?;
        Ok(seq)
    }

    /// Replication state kept for `peer`.
    pub fn peer_state(&self, peer: &[u8; ORIGIN_LEN]) -> StorageResult<PeerState> {
        schema::read_peer(&self.tx, peer)
    }

    /// Stores the highest applied sequence number of the peer's stream.
    pub fn set_cursor(&self, peer: &[u8; ORIGIN_LEN], cursor: Option<u64>) -> StorageResult<()> {
        schema::ensure_peer(&self.tx, peer)?;
        self.tx.execute(
            "UPDATE peer_state SET cursor = ?2 WHERE peer = ?1",
            params![peer.as_slice(), cursor.map(|c| c as i64)],
        )?;
        Ok(())
    }

    /// Records that the peer holds every local row up to `seq` and clears
    /// the pending flag on those rows. Returns the number of rows cleared.
    pub fn acknowledge(&self, peer: &[u8; ORIGIN_LEN], seq: u64) -> StorageResult<u64> {
        schema::ensure_peer(&self.tx, peer)?;
        self.tx.execute(
            "UPDATE peer_state SET acknowledged = MAX(acknowledged, ?2) WHERE peer = ?1",
            params![peer.as_slice(), seq as i64],
        )?;
        let mut cleared = 0u64;
        for (_, table) in schema::all_tables(&self.tx)? {
            cleared += self.tx.execute(
                &format!("UPDATE \"{table}\" SET pending = 0 WHERE pending = 1 AND seq <= ?1"),
                params![seq as i64],
            )? as u64;
        }
        Ok(cleared)
    }

    /// Stores the local key index the peer has confirmed.
    pub fn set_confirmed_key_index(
        &self,
        peer: &[u8; ORIGIN_LEN],
        key_index: u32,
    ) -> StorageResult<()> {
        schema::ensure_peer(&self.tx, peer)?;
        self.tx.execute(
            "UPDATE peer_state SET confirmed_key_index = ?2 WHERE peer = ?1",
            params![peer.as_slice(), i64::from(key_index)],
        )?;
        Ok(())
    }

    /// Marks the peer as seen at `now_ms`.
    pub fn touch_peer(&self, peer: &[u8; ORIGIN_LEN], now_ms: u64) -> StorageResult<()> {
        schema::ensure_peer(&self.tx, peer)?;
        self.tx.execute(
            "UPDATE peer_state SET last_seen = ?2 WHERE peer = ?1",
            params![peer.as_slice(), now_ms as i64],
        )?;
        Ok(())
    }

    /// Writes a free-form metadata value.
    pub fn set_meta(&self, name: &str, value: &str) -> StorageResult<()> {
        schema::write_meta(&self.tx, name, value)
    }

    /// Reads a free-form metadata value.
    pub fn meta(&self, name: &str) -> StorageResult<Option<String>> {
        schema::read_meta(&self.tx, name)
    }

    /// Deletes every object and all replication state. The sequence
    /// counter and metadata survive.
    pub fn clear(&self) -> StorageResult<()> {
        for (_, table) in schema::all_tables(&self.tx)? {
            self.tx.execute(&format!("DELETE FROM \"{table}\""), [])?;
        }
        self.tx.execute("DELETE FROM peer_state", [])?;
        Ok(())
    }
}
