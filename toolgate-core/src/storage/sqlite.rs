//! Embedded store over SQLite WAL.
//!
//! One connection guarded by a mutex serves the whole gateway; every write
//! is a single bounded transaction. `:memory:` paths serve tests and
//! ephemeral deployments.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use super::{AuditFilter, AuditRecord, AuditStats, AuditStatus, GatewayStore, MeterRow, StoreError};

/// Busy timeout for concurrent openers.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default page size for audit queries.
const DEFAULT_QUERY_LIMIT: u32 = 100;

/// SQLite-backed [`GatewayStore`].
pub struct SqliteStore {
    connection: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the database cannot be opened or its
    /// schema cannot be initialized.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if path != Path::new(":memory:") {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
                }
            }
        }
        let connection = if path == Path::new(":memory:") {
            Connection::open_in_memory().map_err(db_err)?
        } else {
            Connection::open(path).map_err(db_err)?
        };
        connection
            .busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))
            .map_err(db_err)?;
        // WAL is unsupported for in-memory databases; ignore the pragma there.
        let _ = connection.pragma_update(None, "journal_mode", "wal");
        initialize_schema(&connection)?;
        info!(path = %path.display(), "audit store opened");
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.connection
            .lock()
            .map_err(|_| StoreError::Db("store mutex poisoned".to_string()))
    }
}

fn initialize_schema(connection: &Connection) -> Result<(), StoreError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id          TEXT PRIMARY KEY,
                timestamp   TEXT NOT NULL,
                consumer_id TEXT NOT NULL,
                api_key_id  TEXT NOT NULL,
                server_id   TEXT NOT NULL,
                tool        TEXT NOT NULL,
                args        TEXT NOT NULL,
                response    TEXT NOT NULL,
                latency_ms  INTEGER NOT NULL,
                status      TEXT NOT NULL,
                error       TEXT,
                prev_hash   TEXT,
                hash        TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log (timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_consumer  ON audit_log (consumer_id);
            CREATE INDEX IF NOT EXISTS idx_audit_server    ON audit_log (server_id);
            CREATE INDEX IF NOT EXISTS idx_audit_status    ON audit_log (status);
            CREATE INDEX IF NOT EXISTS idx_audit_tool      ON audit_log (tool);
            CREATE TABLE IF NOT EXISTS meter (
                consumer_id      TEXT NOT NULL,
                server_id        TEXT NOT NULL,
                tool             TEXT NOT NULL,
                period_key       TEXT NOT NULL,
                calls            INTEGER NOT NULL,
                errors           INTEGER NOT NULL,
                total_latency_ms INTEGER NOT NULL,
                PRIMARY KEY (consumer_id, server_id, tool, period_key)
            );",
        )
        .map_err(db_err)
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Db(e.to_string())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let status_label: String = row.get("status")?;
    Ok(AuditRecord {
        id: row.get("id")?,
        timestamp: row.get("timestamp")?,
        consumer_id: row.get("consumer_id")?,
        credential_id: row.get("api_key_id")?,
        server_id: row.get("server_id")?,
        tool: row.get("tool")?,
        args: row.get("args")?,
        response: row.get("response")?,
        latency_ms: row.get::<_, i64>("latency_ms")? as u64,
        status: AuditStatus::parse(&status_label).unwrap_or(AuditStatus::Error),
        error: row.get("error")?,
        prev_hash: row.get("prev_hash")?,
        hash: row.get("hash")?,
    })
}

impl GatewayStore for SqliteStore {
    fn insert_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO audit_log (id, timestamp, consumer_id, api_key_id, server_id, tool, \
                 args, response, latency_ms, status, error, prev_hash, hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.id,
                    record.timestamp,
                    record.consumer_id,
                    record.credential_id,
                    record.server_id,
                    record.tool,
                    record.args,
                    record.response,
                    record.latency_ms as i64,
                    record.status.as_str(),
                    record.error,
                    record.prev_hash,
                    record.hash,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, StoreError> {
        let mut sql = String::from("SELECT * FROM audit_log WHERE 1=1");
        let mut bind: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        let mut push = |sql: &mut String, clause: &str, value: Box<dyn rusqlite::ToSql>| {
            bind.push(value);
            sql.push_str(&format!(" AND {} ?{}", clause, bind.len()));
        };
        if let Some(consumer_id) = &filter.consumer_id {
            push(&mut sql, "consumer_id =", Box::new(consumer_id.clone()));
        }
        if let Some(server_id) = &filter.server_id {
            push(&mut sql, "server_id =", Box::new(server_id.clone()));
        }
        if let Some(tool) = &filter.tool {
            push(&mut sql, "tool =", Box::new(tool.clone()));
        }
        if let Some(status) = filter.status {
            push(&mut sql, "status =", Box::new(status.as_str()));
        }
        if let Some(from) = &filter.from {
            push(&mut sql, "timestamp >=", Box::new(from.clone()));
        }
        if let Some(to) = &filter.to {
            push(&mut sql, "timestamp <", Box::new(to.clone()));
        }

        bind.push(Box::new(filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT)));
        bind.push(Box::new(filter.offset.unwrap_or(0)));
        sql.push_str(&format!(
            " ORDER BY timestamp DESC LIMIT ?{} OFFSET ?{}",
            bind.len() - 1,
            bind.len()
        ));

        let connection = self.lock()?;
        let mut statement = connection.prepare(&sql).map_err(db_err)?;
        let rows = statement
            .query_map(
                rusqlite::params_from_iter(bind.iter().map(|b| b.as_ref())),
                row_to_record,
            )
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn last_hash(&self) -> Result<Option<String>, StoreError> {
        let connection = self.lock()?;
        connection
            .query_row(
                "SELECT hash FROM audit_log ORDER BY rowid DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
    }

    fn for_each_ordered(
        &self,
        visit: &mut dyn FnMut(AuditRecord) -> bool,
    ) -> Result<(), StoreError> {
        let connection = self.lock()?;
        let mut statement = connection
            .prepare("SELECT * FROM audit_log ORDER BY rowid ASC")
            .map_err(db_err)?;
        let mut rows = statement.query([]).map_err(db_err)?;
        while let Some(row) = rows.next().map_err(db_err)? {
            let record = row_to_record(row).map_err(db_err)?;
            if !visit(record) {
                break;
            }
        }
        Ok(())
    }

    fn audit_stats(&self) -> Result<AuditStats, StoreError> {
        let connection = self.lock()?;
        let mut stats = AuditStats::default();
        stats.total = connection
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(db_err)? as u64;

        let mut by_status = connection
            .prepare("SELECT status, COUNT(*) FROM audit_log GROUP BY status")
            .map_err(db_err)?;
        let rows = by_status
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(db_err)?;
        for row in rows {
            let (status, count) = row.map_err(db_err)?;
            stats.by_status.insert(status, count);
        }

        let mut by_server = connection
            .prepare("SELECT server_id, COUNT(*) FROM audit_log GROUP BY server_id")
            .map_err(db_err)?;
        let rows = by_server
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(db_err)?;
        for row in rows {
            let (server, count) = row.map_err(db_err)?;
            stats.by_server.insert(server, count);
        }

        Ok(stats)
    }

    fn upsert_meter(&self, row: &MeterRow) -> Result<(), StoreError> {
        let connection = self.lock()?;
        connection
            .execute(
                "INSERT INTO meter (consumer_id, server_id, tool, period_key, calls, errors, \
                 total_latency_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (consumer_id, server_id, tool, period_key) DO UPDATE SET \
                 calls = calls + excluded.calls, \
                 errors = errors + excluded.errors, \
                 total_latency_ms = total_latency_ms + excluded.total_latency_ms",
                params![
                    row.consumer_id,
                    row.server_id,
                    row.tool,
                    row.period_key,
                    row.calls as i64,
                    row.errors as i64,
                    row.total_latency_ms as i64,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn query_meter(&self, consumer_id: Option<&str>) -> Result<Vec<MeterRow>, StoreError> {
        let connection = self.lock()?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<MeterRow> {
            Ok(MeterRow {
                consumer_id: row.get(0)?,
                server_id: row.get(1)?,
                tool: row.get(2)?,
                period_key: row.get(3)?,
                calls: row.get::<_, i64>(4)? as u64,
                errors: row.get::<_, i64>(5)? as u64,
                total_latency_ms: row.get::<_, i64>(6)? as u64,
            })
        };
        let sql_all = "SELECT consumer_id, server_id, tool, period_key, calls, errors, \
                       total_latency_ms FROM meter";
        let rows = match consumer_id {
            Some(consumer_id) => {
                let mut statement = connection
                    .prepare(&format!("{sql_all} WHERE consumer_id = ?1"))
                    .map_err(db_err)?;
                let rows = statement
                    .query_map(params![consumer_id], map_row)
                    .map_err(db_err)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            }
            None => {
                let mut statement = connection.prepare(sql_all).map_err(db_err)?;
                let rows = statement.query_map([], map_row).map_err(db_err)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            }
        };
        rows.map_err(db_err)
    }

    fn close(&self) -> Result<(), StoreError> {
        // The connection is released when the store drops; a WAL checkpoint
        // here keeps the main database file current for external readers.
        let connection = self.lock()?;
        let _ = connection.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, status: AuditStatus, server: &str) -> AuditRecord {
        AuditRecord {
            id: id.to_string(),
            timestamp: format!("2026-08-02T10:00:0{}Z", id.len() % 10),
            consumer_id: "acme".into(),
            credential_id: "k1".into(),
            server_id: server.into(),
            tool: "get_series".into(),
            args: "{}".into(),
            response: "{}".into(),
            latency_ms: 12,
            status,
            error: None,
            prev_hash: None,
            hash: format!("hash-{id}"),
        }
    }

    fn memory_store() -> SqliteStore {
        SqliteStore::open(Path::new(":memory:")).unwrap()
    }

    #[test]
    fn test_insert_and_query_roundtrip() {
        let store = memory_store();
        store
            .insert_audit(&record("a", AuditStatus::Success, "s1"))
            .unwrap();

        let rows = store.query_audit(&AuditFilter::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "a");
        assert_eq!(rows[0].status, AuditStatus::Success);
        assert_eq!(rows[0].credential_id, "k1");
    }

    #[test]
    fn test_query_filters_by_status_and_server() {
        let store = memory_store();
        store.insert_audit(&record("a", AuditStatus::Success, "s1")).unwrap();
        store.insert_audit(&record("bb", AuditStatus::Denied, "s1")).unwrap();
        store.insert_audit(&record("ccc", AuditStatus::Denied, "s2")).unwrap();

        let denied = store
            .query_audit(&AuditFilter {
                status: Some(AuditStatus::Denied),
                ..AuditFilter::default()
            })
            .unwrap();
        assert_eq!(denied.len(), 2);

        let denied_s2 = store
            .query_audit(&AuditFilter {
                status: Some(AuditStatus::Denied),
                server_id: Some("s2".into()),
                ..AuditFilter::default()
            })
            .unwrap();
        assert_eq!(denied_s2.len(), 1);
        assert_eq!(denied_s2[0].id, "ccc");
    }

    #[test]
    fn test_query_time_range_half_open() {
        let store = memory_store();
        let mut early = record("a", AuditStatus::Success, "s1");
        early.timestamp = "2026-08-02T09:00:00Z".into();
        let mut late = record("b", AuditStatus::Success, "s1");
        late.timestamp = "2026-08-02T11:00:00Z".into();
        store.insert_audit(&early).unwrap();
        store.insert_audit(&late).unwrap();

        let rows = store
            .query_audit(&AuditFilter {
                from: Some("2026-08-02T09:00:00Z".into()),
                to: Some("2026-08-02T11:00:00Z".into()),
                ..AuditFilter::default()
            })
            .unwrap();
        // `to` is exclusive: the 11:00 row is outside the range.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "a");
    }

    #[test]
    fn test_query_orders_descending_and_paginates() {
        let store = memory_store();
        for (id, ts) in [("a", "09"), ("b", "10"), ("c", "11")] {
            let mut r = record(id, AuditStatus::Success, "s1");
            r.timestamp = format!("2026-08-02T{ts}:00:00Z");
            store.insert_audit(&r).unwrap();
        }
        let rows = store
            .query_audit(&AuditFilter {
                limit: Some(2),
                ..AuditFilter::default()
            })
            .unwrap();
        assert_eq!(rows.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["c", "b"]);

        let rows = store
            .query_audit(&AuditFilter {
                limit: Some(2),
                offset: Some(2),
                ..AuditFilter::default()
            })
            .unwrap();
        assert_eq!(rows.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["a"]);
    }

    #[test]
    fn test_last_hash_tracks_insertion_order() {
        let store = memory_store();
        assert!(store.last_hash().unwrap().is_none());
        store.insert_audit(&record("a", AuditStatus::Success, "s1")).unwrap();
        store.insert_audit(&record("b", AuditStatus::Success, "s1")).unwrap();
        assert_eq!(store.last_hash().unwrap().as_deref(), Some("hash-b"));
    }

    #[test]
    fn test_for_each_ordered_visits_insertion_order() {
        let store = memory_store();
        for id in ["x", "y", "z"] {
            store.insert_audit(&record(id, AuditStatus::Success, "s1")).unwrap();
        }
        let mut seen = Vec::new();
        store
            .for_each_ordered(&mut |r| {
                seen.push(r.id);
                true
            })
            .unwrap();
        assert_eq!(seen, ["x", "y", "z"]);

        // The visitor can stop early.
        let mut count = 0;
        store
            .for_each_ordered(&mut |_| {
                count += 1;
                count < 2
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_audit_stats_aggregates() {
        let store = memory_store();
        store.insert_audit(&record("a", AuditStatus::Success, "s1")).unwrap();
        store.insert_audit(&record("b", AuditStatus::Denied, "s1")).unwrap();
        store.insert_audit(&record("c", AuditStatus::Denied, "s2")).unwrap();

        let stats = store.audit_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status.get("denied"), Some(&2));
        assert_eq!(stats.by_status.get("success"), Some(&1));
        assert_eq!(stats.by_server.get("s1"), Some(&2));
    }

    #[test]
    fn test_meter_upsert_accumulates() {
        let store = memory_store();
        let row = MeterRow {
            consumer_id: "acme".into(),
            server_id: "s1".into(),
            tool: "get_series".into(),
            period_key: "2026-08-02T10".into(),
            calls: 3,
            errors: 1,
            total_latency_ms: 90,
        };
        store.upsert_meter(&row).unwrap();
        store.upsert_meter(&row).unwrap();

        let rows = store.query_meter(Some("acme")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].calls, 6);
        assert_eq!(rows[0].errors, 2);
        assert_eq!(rows[0].total_latency_ms, 180);

        assert!(store.query_meter(Some("other")).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_on_disk_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_audit(&record("a", AuditStatus::Success, "s1")).unwrap();
            store.close().unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.last_hash().unwrap().as_deref(), Some("hash-a"));
    }
}
