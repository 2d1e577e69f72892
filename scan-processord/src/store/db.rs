use std::path::Path;
use std::time::Duration;
use rusqlite::{Connection, params, OptionalExtension};
use shared::types::{CanonicalRecord, ScanKey, StoredScan};
use crate::error::StoreError;

/// Result of an ordered upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The row was inserted or replaced
    Written,
    /// A newer observation is already stored; nothing changed
    Stale,
}

impl UpsertOutcome {
    pub fn written(self) -> bool {
        matches!(self, UpsertOutcome::Written)
    }
}

pub struct ScanDb {
    conn: Connection,
}

impl ScanDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        // Other processes may hold the write lock on a shared file
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS scans (
                ip           TEXT NOT NULL,
                port         INTEGER NOT NULL,
                service      TEXT NOT NULL,
                last_scanned INTEGER NOT NULL,
                response     TEXT NOT NULL,
                PRIMARY KEY (ip, port, service)
            );

            CREATE INDEX IF NOT EXISTS idx_scans_last_scanned ON scans(last_scanned);
            "#,
        )?;

        Ok(Self { conn })
    }

    /// Insert or replace the row for the record's key unless the stored row
    /// has a strictly newer `last_scanned`. Equal timestamps replace.
    ///
    /// The comparison and the write are one statement, so concurrent writers
    /// (including other processes on the same file) cannot interleave between
    /// them.
    pub fn upsert_scan(&self, record: &CanonicalRecord) -> Result<UpsertOutcome, StoreError> {
        let changed = self.conn.execute(
            r#"
            INSERT INTO scans (ip, port, service, last_scanned, response)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(ip, port, service) DO UPDATE SET
                last_scanned = excluded.last_scanned,
                response = excluded.response
            WHERE excluded.last_scanned >= scans.last_scanned
            "#,
            params![
                &record.key.ip,
                record.key.port,
                &record.key.service,
                record.timestamp,
                &record.response,
            ],
        )?;

        Ok(if changed > 0 {
            UpsertOutcome::Written
        } else {
            UpsertOutcome::Stale
        })
    }

    /// Get the stored row for a key
    pub fn get_scan(&self, key: &ScanKey) -> Result<Option<StoredScan>, StoreError> {
        let scan = self
            .conn
            .query_row(
                "SELECT ip, port, service, last_scanned, response
                 FROM scans WHERE ip = ?1 AND port = ?2 AND service = ?3",
                params![&key.ip, key.port, &key.service],
                Self::row_to_scan,
            )
            .optional()?;

        Ok(scan)
    }

    /// Number of distinct (ip, port, service) keys
    pub fn count_keys(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM scans", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Most recently scanned rows, newest first
    pub fn recent_scans(&self, limit: u32) -> Result<Vec<StoredScan>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT ip, port, service, last_scanned, response
             FROM scans ORDER BY last_scanned DESC LIMIT ?1",
        )?;

        let scans = stmt
            .query_map([limit], Self::row_to_scan)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(scans)
    }

    fn row_to_scan(row: &rusqlite::Row) -> Result<StoredScan, rusqlite::Error> {
        Ok(StoredScan {
            ip: row.get(0)?,
            port: row.get::<_, u16>(1)?,
            service: row.get(2)?,
            last_scanned: row.get(3)?,
            response: row.get(4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> ScanKey {
        ScanKey {
            ip: "192.0.2.1".to_string(),
            port: 80,
            service: "http".to_string(),
        }
    }

    fn record(timestamp: i64, response: &str) -> CanonicalRecord {
        CanonicalRecord {
            key: test_key(),
            timestamp,
            response: response.to_string(),
        }
    }

    #[test]
    fn test_insert_and_query() {
        let db = ScanDb::open_in_memory().unwrap();

        let outcome = db.upsert_scan(&record(100, "Hello World")).unwrap();
        assert_eq!(outcome, UpsertOutcome::Written);

        let stored = db.get_scan(&test_key()).unwrap().unwrap();
        assert_eq!(
            stored,
            StoredScan {
                ip: "192.0.2.1".to_string(),
                port: 80,
                service: "http".to_string(),
                last_scanned: 100,
                response: "Hello World".to_string(),
            }
        );
    }

    #[test]
    fn test_stale_write_is_rejected() {
        let db = ScanDb::open_in_memory().unwrap();
        db.upsert_scan(&record(100, "Hello World")).unwrap();

        let outcome = db.upsert_scan(&record(50, "Stale")).unwrap();
        assert_eq!(outcome, UpsertOutcome::Stale);
        assert!(!outcome.written());

        let stored = db.get_scan(&test_key()).unwrap().unwrap();
        assert_eq!(stored.last_scanned, 100);
        assert_eq!(stored.response, "Hello World");
    }

    #[test]
    fn test_equal_timestamp_replaces() {
        let db = ScanDb::open_in_memory().unwrap();
        db.upsert_scan(&record(100, "first")).unwrap();

        let outcome = db.upsert_scan(&record(100, "second")).unwrap();
        assert_eq!(outcome, UpsertOutcome::Written);
        assert_eq!(db.get_scan(&test_key()).unwrap().unwrap().response, "second");
    }

    #[test]
    fn test_reapplying_same_record_is_idempotent() {
        let db = ScanDb::open_in_memory().unwrap();
        let scan = record(100, "Hello World");

        db.upsert_scan(&scan).unwrap();
        let once = db.get_scan(&test_key()).unwrap();
        db.upsert_scan(&scan).unwrap();
        let twice = db.get_scan(&test_key()).unwrap();

        assert_eq!(once, twice);
        assert_eq!(db.count_keys().unwrap(), 1);
    }

    #[test]
    fn test_newest_wins_in_either_order() {
        for order in [[10, 20], [20, 10]] {
            let db = ScanDb::open_in_memory().unwrap();
            for ts in order {
                db.upsert_scan(&record(ts, &format!("at {}", ts))).unwrap();
            }
            let stored = db.get_scan(&test_key()).unwrap().unwrap();
            assert_eq!(stored.last_scanned, 20, "order {:?}", order);
            assert_eq!(stored.response, "at 20");
        }
    }

    #[test]
    fn test_count_and_recent() {
        let db = ScanDb::open_in_memory().unwrap();

        for (i, service) in ["http", "ssh", "dns"].iter().enumerate() {
            let mut scan = record(i as i64 * 10, "banner");
            scan.key.service = service.to_string();
            db.upsert_scan(&scan).unwrap();
        }
        // Another observation of an existing key does not add a row
        let mut newer = record(100, "banner v2");
        newer.key.service = "http".to_string();
        db.upsert_scan(&newer).unwrap();

        assert_eq!(db.count_keys().unwrap(), 3);

        let recent = db.recent_scans(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].service, "http");
        assert_eq!(recent[0].last_scanned, 100);
        assert_eq!(recent[1].service, "dns");
    }

    #[test]
    fn test_missing_key() {
        let db = ScanDb::open_in_memory().unwrap();
        assert!(db.get_scan(&test_key()).unwrap().is_none());
        assert_eq!(db.count_keys().unwrap(), 0);
        assert!(db.recent_scans(10).unwrap().is_empty());
    }

    #[test]
    fn test_two_connections_share_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scans.db");
        let a = ScanDb::open(&path, Duration::from_secs(5)).unwrap();
        let b = ScanDb::open(&path, Duration::from_secs(5)).unwrap();

        assert_eq!(a.upsert_scan(&record(20, "from a")).unwrap(), UpsertOutcome::Written);
        assert_eq!(b.upsert_scan(&record(10, "from b")).unwrap(), UpsertOutcome::Stale);

        let stored = b.get_scan(&test_key()).unwrap().unwrap();
        assert_eq!(stored.last_scanned, 20);
        assert_eq!(stored.response, "from a");
    }
}
