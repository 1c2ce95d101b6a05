//! Thin façade over the embedded SQLite store: an append-only message log
//! plus a receiver registry (serno -> tunnel port).
//!
//! A single `rusqlite::Connection`, an idempotent `CREATE TABLE IF NOT
//! EXISTS` schema applied at open, and a `thiserror` error enum.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use sgm_protocol::{Serno, Timestamp};
use thiserror::Error;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// A generous busy-wait protects concurrent writers.
const BUSY_TIMEOUT_MS: u32 = 60_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The `'2'` topic byte ("sync-launched") is the marker `LastSyncTime`
/// searches the log for.
const SYNC_LAUNCHED_BYTE: &str = "2";

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS as u64))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store { conn })
    }

    /// Inserts one log row. Statement is prepared-and-cached, not
    /// recompiled per call.
    pub fn record_message(&self, ts: Timestamp, sender: &str, text: &str) -> StoreResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO log (ts, sender, message) VALUES (?1, ?2, ?3)")?;
        stmt.execute(rusqlite::params![ts.as_secs_f64(), sender, text])?;
        Ok(())
    }

    /// Maximum `ts` from the log where `sender = serno` and the message's
    /// first byte is `'2'` (sync-launched). `None` if there is no such row.
    pub fn last_sync_time(&self, serno: &Serno) -> StoreResult<Option<Timestamp>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT MAX(ts) FROM log WHERE sender = ?1 AND substr(message, 1, 1) = ?2",
        )?;
        let ts: Option<f64> =
            stmt.query_row(rusqlite::params![serno.as_str(), SYNC_LAUNCHED_BYTE], |row| {
                row.get(0)
            })?;
        Ok(ts.map(Timestamp::from_secs_f64))
    }

    /// Tunnel port registered for `serno`, or `None` if it has never been
    /// provisioned.
    pub fn tunnel_port(&self, serno: &Serno) -> StoreResult<Option<u16>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT tunnel_port FROM receivers WHERE serno = ?1")?;
        let port: Option<Option<i64>> = stmt
            .query_row(rusqlite::params![serno.as_str()], |row| row.get(0))
            .optional()?;
        Ok(port.flatten().map(|p| p as u16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serno() -> Serno {
        Serno::parse("SG-0000000000AA").unwrap()
    }

    #[test]
    fn schema_init_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        // Re-applying the schema on the same connection must not error.
        store.conn.execute_batch(SCHEMA_SQL).unwrap();
    }

    #[test]
    fn record_message_then_read_back() {
        let store = Store::open_in_memory().unwrap();
        store
            .record_message(Timestamp::now(), "SG-0000000000AA", "Hello")
            .unwrap();
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn last_sync_time_is_none_with_no_matching_rows() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.last_sync_time(&serno()).unwrap(), None);
    }

    #[test]
    fn last_sync_time_finds_the_max_sync_launched_ts() {
        let store = Store::open_in_memory().unwrap();
        let sn = serno();
        store.record_message(Timestamp::from_secs_f64(100.0), sn.as_str(), "2launch-a").unwrap();
        store.record_message(Timestamp::from_secs_f64(200.0), sn.as_str(), "2launch-b").unwrap();
        // Different topic byte, should be ignored.
        store.record_message(Timestamp::from_secs_f64(999.0), sn.as_str(), "3pending").unwrap();
        let ts = store.last_sync_time(&sn).unwrap().unwrap();
        assert_eq!(ts.as_secs_f64(), 200.0);
    }

    #[test]
    fn tunnel_port_is_none_when_receiver_not_registered() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.tunnel_port(&serno()).unwrap(), None);
    }

    #[test]
    fn tunnel_port_reads_from_receivers_table() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO receivers (serno, creation_ts, tunnel_port) VALUES (?1, ?2, ?3)",
                rusqlite::params!["SG-0000000000AA", 0.0, 20001],
            )
            .unwrap();
        assert_eq!(store.tunnel_port(&serno()).unwrap(), Some(20001));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sgm.sqlite3");
        {
            let store = Store::open(&path).unwrap();
            store
                .record_message(Timestamp::from_secs_f64(42.0), "SG-0000000000AA", "2x")
                .unwrap();
        }
        let reopened = Store::open(&path).unwrap();
        let ts = reopened.last_sync_time(&serno()).unwrap().unwrap();
        assert_eq!(ts.as_secs_f64(), 42.0);
    }
}
