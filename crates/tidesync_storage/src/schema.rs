//! Table layout and shared read helpers.
//!
//! Every object type gets its own table named `obj_<hex(type_name)>`,
//! registered in `object_types`. Commit sequence numbers come from the
//! `next_seq` entry of `store_meta`.

use crate::error::{StorageError, StorageResult};
use crate::row::{ObjectRow, PeerState, ORIGIN_LEN};
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS store_meta (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS object_types (
    type_name TEXT PRIMARY KEY,
    table_name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS peer_state (
    peer BLOB PRIMARY KEY,
    cursor INTEGER,
    acknowledged INTEGER NOT NULL DEFAULT 0,
    confirmed_key_index INTEGER,
    last_seen INTEGER NOT NULL DEFAULT 0
);
";

pub(crate) const NEXT_SEQ: &str = "next_seq";

/// Derives the table name for a type. Hex keeps arbitrary type names
/// out of identifier quoting.
pub(crate) fn table_name(type_name: &str) -> String {
    let mut name = String::with_capacity(4 + type_name.len() * 2);
    name.push_str("obj_");
    for byte in type_name.as_bytes() {
        name.push_str(&format!("{byte:02x}"));
    }
    name
}

pub(crate) fn lookup_table(conn: &Connection, type_name: &str) -> StorageResult<Option<String>> {
    let table = conn
        .query_row(
            "SELECT table_name FROM object_types WHERE type_name = ?1",
            params![type_name],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(table)
}

pub(crate) fn all_tables(conn: &Connection) -> StorageResult<Vec<(String, String)>> {
    let mut stmt =
        conn.prepare("SELECT type_name, table_name FROM object_types ORDER BY type_name")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn ensure_table(conn: &Connection, type_name: &str) -> StorageResult<String> {
    if let Some(table) = lookup_table(conn, type_name)? {
        return Ok(table);
    }
    let table = table_name(type_name);
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
            key TEXT PRIMARY KEY,
            payload BLOB NOT NULL,
            version INTEGER NOT NULL,
            origin BLOB NOT NULL,
            tombstone INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            pending INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS \"{table}_seq\" ON \"{table}\"(seq);"
    ))?;
    conn.execute(
        "INSERT INTO object_types (type_name, table_name) VALUES (?1, ?2)",
        params![type_name, table],
    )?;
    tracing::debug!(type_name, table = %table, "created object table");
    Ok(table)
}

pub(crate) const ROW_COLUMNS: &str = "key, payload, version, origin, tombstone, seq, pending";

pub(crate) fn read_row(type_name: &str, row: &Row<'_>) -> rusqlite::Result<ObjectRow> {
    let origin: Vec<u8> = row.get(3)?;
    let origin: [u8; ORIGIN_LEN] = origin.as_slice().try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Blob,
            format!("origin must be {ORIGIN_LEN} bytes, got {}", origin.len()).into(),
        )
    })?;
    Ok(ObjectRow {
        type_name: type_name.to_string(),
        key: row.get(0)?,
        payload: row.get(1)?,
        version: row.get::<_, i64>(2)? as u64,
        origin,
        tombstone: row.get(4)?,
        seq: row.get::<_, i64>(5)? as u64,
        pending: row.get(6)?,
    })
}

pub(crate) fn read_meta(conn: &Connection, name: &str) -> StorageResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM store_meta WHERE name = ?1",
            params![name],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

pub(crate) fn write_meta(conn: &Connection, name: &str, value: &str) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO store_meta (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        params![name, value],
    )?;
    Ok(())
}

pub(crate) fn read_next_seq(conn: &Connection) -> StorageResult<u64> {
    match read_meta(conn, NEXT_SEQ)? {
        Some(value) => value
            .parse()
            .map_err(|_| StorageError::corrupted(format!("invalid sequence counter {value:?}"))),
        None => Ok(1),
    }
}

pub(crate) fn read_peer(conn: &Connection, peer: &[u8; ORIGIN_LEN]) -> StorageResult<PeerState> {
    let state = conn
        .query_row(
            "SELECT cursor, acknowledged, confirmed_key_index, last_seen
             FROM peer_state WHERE peer = ?1",
            params![peer.as_slice()],
            |row| {
                Ok(PeerState {
                    cursor: row.get::<_, Option<i64>>(0)?.map(|c| c as u64),
                    acknowledged: row.get::<_, i64>(1)? as u64,
                    confirmed_key_index: row.get::<_, Option<i64>>(2)?.map(|i| i as u32),
                    last_seen: row.get::<_, i64>(3)? as u64,
                })
            },
        )
        .optional()?;
    Ok(state.unwrap_or_default())
}

pub(crate) fn ensure_peer(conn: &Connection, peer: &[u8; ORIGIN_LEN]) -> StorageResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO peer_state (peer) VALUES (?1)",
        params![peer.as_slice()],
    )?;
    Ok(())
}
