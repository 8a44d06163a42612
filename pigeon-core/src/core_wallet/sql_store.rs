//! SQLite storage backend
//!
//! Records live in one table keyed by (scope, type, id); tags live in a side
//! table so tag filters compile to `EXISTS` subqueries. Blocking SQLite calls
//! run on the blocking pool. Every write runs in a `BEGIN IMMEDIATE`
//! transaction on a WAL database.

use super::backend::StorageBackend;
use super::errors::{WalletError, WalletResult};
use super::record::{current_timestamp_ms, StorageRecord, TagFilter, Tags, WriteOp};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;

const POOL_SIZE: u32 = 8;

#[derive(Clone)]
pub struct SqlStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

fn map_sql_error(context: &str, e: rusqlite::Error) -> WalletError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            WalletError::transient(format!("{}: {}", context, e))
        }
        _ => WalletError::storage(format!("{}: {}", context, e)),
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

impl SqlStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> WalletResult<Self> {
        Self::with_manager(SqliteConnectionManager::file(db_path), Pool::builder().max_size(POOL_SIZE))
    }

    /// Private in-memory database; a single pooled connection that is never
    /// recycled keeps it alive
    pub fn in_memory() -> WalletResult<Self> {
        let builder = Pool::builder().max_size(1).max_lifetime(None).idle_timeout(None);
        Self::with_manager(SqliteConnectionManager::memory(), builder)
    }

    fn with_manager(
        manager: SqliteConnectionManager,
        builder: r2d2::Builder<SqliteConnectionManager>,
    ) -> WalletResult<Self> {
        let manager = manager.with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
            Ok(())
        });
        let pool = builder
            .build(manager)
            .map_err(|e| WalletError::storage(format!("Failed to create connection pool: {}", e)))?;

        let store = Self { pool: Arc::new(pool) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> WalletResult<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| WalletError::storage(format!("Failed to get connection: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                scope TEXT NOT NULL,
                record_type TEXT NOT NULL,
                record_id TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (scope, record_type, record_id)
            );

            CREATE TABLE IF NOT EXISTS record_tags (
                record_pk INTEGER NOT NULL REFERENCES records(pk) ON DELETE CASCADE,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (record_pk, name)
            );

            CREATE INDEX IF NOT EXISTS idx_record_tags_lookup
                ON record_tags(name, value);
            "#,
        )
        .map_err(|e| map_sql_error("Failed to initialize schema", e))
    }

    /// Run `f` on a pooled connection off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> WalletResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> WalletResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| WalletError::transient(format!("Failed to get connection: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| WalletError::storage(format!("Task join error: {}", e)))?
    }
}

/// Write transaction holding the write lock from `BEGIN`; contention waits
/// on `busy_timeout`
fn begin_immediate(conn: &mut Connection) -> WalletResult<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| map_sql_error("Failed to begin transaction", e))
}

fn write_tags(conn: &Connection, pk: i64, tags: &Tags) -> WalletResult<()> {
    conn.execute("DELETE FROM record_tags WHERE record_pk = ?", params![pk])
        .map_err(|e| map_sql_error("Failed to clear tags", e))?;
    for (name, value) in tags {
        conn.execute(
            "INSERT INTO record_tags (record_pk, name, value) VALUES (?, ?, ?)",
            params![pk, name, value],
        )
        .map_err(|e| map_sql_error("Failed to write tag", e))?;
    }
    Ok(())
}

fn read_tags(conn: &Connection, pk: i64) -> WalletResult<Tags> {
    let mut stmt = conn
        .prepare_cached("SELECT name, value FROM record_tags WHERE record_pk = ?")
        .map_err(|e| map_sql_error("Failed to prepare tag query", e))?;
    let rows = stmt
        .query_map(params![pk], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(|e| map_sql_error("Failed to read tags", e))?;

    let mut tags = Tags::new();
    for row in rows {
        let (name, value) = row.map_err(|e| map_sql_error("Failed to read tag", e))?;
        tags.insert(name, value);
    }
    Ok(tags)
}

fn lookup_pk(conn: &Connection, scope: &str, record_type: &str, id: &str) -> WalletResult<Option<i64>> {
    conn.query_row(
        "SELECT pk FROM records WHERE scope = ? AND record_type = ? AND record_id = ?",
        params![scope, record_type, id],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| map_sql_error("Failed to look up record", e))
}

fn not_found(record_type: &str, id: &str) -> WalletError {
    WalletError::NotFound(format!("{}/{}", record_type, id))
}

fn insert_record(conn: &Connection, scope: &str, record: &StorageRecord) -> WalletResult<()> {
    let now = current_timestamp_ms();
    let inserted = conn.execute(
        r#"
        INSERT INTO records (scope, record_type, record_id, value, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
        params![scope, &record.record_type, &record.id, &record.value, now, now],
    );
    match inserted {
        Ok(_) => write_tags(conn, conn.last_insert_rowid(), &record.tags),
        Err(e) if is_unique_violation(&e) => Err(WalletError::DuplicateRecord {
            record_type: record.record_type.clone(),
            id: record.id.clone(),
        }),
        Err(e) => Err(map_sql_error("Failed to insert record", e)),
    }
}

fn replace_record(conn: &Connection, scope: &str, record: &StorageRecord) -> WalletResult<()> {
    let pk = lookup_pk(conn, scope, &record.record_type, &record.id)?
        .ok_or_else(|| not_found(&record.record_type, &record.id))?;
    conn.execute(
        "UPDATE records SET value = ?, updated_at = ? WHERE pk = ?",
        params![&record.value, current_timestamp_ms(), pk],
    )
    .map_err(|e| map_sql_error("Failed to update record", e))?;
    write_tags(conn, pk, &record.tags)
}

fn delete_record(conn: &Connection, scope: &str, record_type: &str, id: &str) -> WalletResult<()> {
    let pk = lookup_pk(conn, scope, record_type, id)?.ok_or_else(|| not_found(record_type, id))?;
    conn.execute("DELETE FROM record_tags WHERE record_pk = ?", params![pk])
        .map_err(|e| map_sql_error("Failed to delete tags", e))?;
    conn.execute("DELETE FROM records WHERE pk = ?", params![pk])
        .map_err(|e| map_sql_error("Failed to delete record", e))?;
    Ok(())
}

fn apply_op(conn: &Connection, scope: &str, op: &WriteOp) -> WalletResult<()> {
    match op {
        WriteOp::Insert(record) => insert_record(conn, scope, record),
        WriteOp::Replace(record) => replace_record(conn, scope, record),
        WriteOp::Upsert(record) => {
            if lookup_pk(conn, scope, &record.record_type, &record.id)?.is_some() {
                replace_record(conn, scope, record)
            } else {
                insert_record(conn, scope, record)
            }
        }
        WriteOp::Delete { record_type, id } => delete_record(conn, scope, record_type, id),
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 1);
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Compile a filter to a boolean SQL expression over alias `r`
fn filter_clause(filter: &TagFilter, args: &mut Vec<Value>) -> String {
    const TAG_EXISTS: &str =
        "EXISTS (SELECT 1 FROM record_tags t WHERE t.record_pk = r.pk AND t.name = ? AND ";
    match filter {
        TagFilter::All => "1 = 1".to_string(),
        TagFilter::Eq(name, value) => {
            args.push(Value::Text(name.clone()));
            args.push(Value::Text(value.clone()));
            format!("{}t.value = ?)", TAG_EXISTS)
        }
        TagFilter::Prefix(name, prefix) => {
            args.push(Value::Text(name.clone()));
            args.push(Value::Text(escape_like(prefix)));
            format!("{}t.value LIKE ? ESCAPE '\\')", TAG_EXISTS)
        }
        TagFilter::And(parts) if parts.is_empty() => "1 = 1".to_string(),
        TagFilter::And(parts) => {
            let clauses: Vec<String> = parts.iter().map(|p| filter_clause(p, args)).collect();
            format!("({})", clauses.join(" AND "))
        }
    }
}

#[async_trait]
impl StorageBackend for SqlStore {
    async fn insert(&self, scope: &str, record: StorageRecord) -> WalletResult<()> {
        let scope = scope.to_string();
        self.with_conn(move |conn| {
            let tx = begin_immediate(conn)?;
            insert_record(&tx, &scope, &record)?;
            tx.commit().map_err(|e| map_sql_error("Failed to commit transaction", e))
        })
        .await
    }

    async fn fetch(&self, scope: &str, record_type: &str, id: &str) -> WalletResult<StorageRecord> {
        let (scope, record_type, id) = (scope.to_string(), record_type.to_string(), id.to_string());
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT pk, value FROM records WHERE scope = ? AND record_type = ? AND record_id = ?",
                    params![&scope, &record_type, &id],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()
                .map_err(|e| map_sql_error("Failed to fetch record", e))?;

            let (pk, value) = row.ok_or_else(|| not_found(&record_type, &id))?;
            let tags = read_tags(conn, pk)?;
            Ok(StorageRecord { record_type, id, value, tags })
        })
        .await
    }

    async fn scan(
        &self,
        scope: &str,
        record_type: &str,
        filter: &TagFilter,
        offset: usize,
        limit: usize,
    ) -> WalletResult<Vec<StorageRecord>> {
        let mut args = vec![Value::Text(scope.to_string()), Value::Text(record_type.to_string())];
        let clause = filter_clause(filter, &mut args);
        args.push(Value::Integer(limit.min(i64::MAX as usize) as i64));
        args.push(Value::Integer(offset.min(i64::MAX as usize) as i64));
        let sql = format!(
            "SELECT r.pk, r.record_id, r.value FROM records r \
             WHERE r.scope = ? AND r.record_type = ? AND {} \
             ORDER BY r.record_id LIMIT ? OFFSET ?",
            clause
        );
        let record_type = record_type.to_string();

        self.with_conn(move |conn| {
            let rows: Vec<(i64, String, String)> = {
                let mut stmt =
                    conn.prepare(&sql).map_err(|e| map_sql_error("Failed to prepare scan", e))?;
                let mapped = stmt
                    .query_map(params_from_iter(args), |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })
                    .map_err(|e| map_sql_error("Failed to scan records", e))?;
                mapped
                    .collect::<Result<_, _>>()
                    .map_err(|e| map_sql_error("Failed to read record", e))?
            };

            rows.into_iter()
                .map(|(pk, id, value)| {
                    Ok(StorageRecord { record_type: record_type.clone(), id, value, tags: read_tags(conn, pk)? })
                })
                .collect()
        })
        .await
    }

    async fn replace(&self, scope: &str, record: StorageRecord) -> WalletResult<()> {
        let scope = scope.to_string();
        self.with_conn(move |conn| {
            let tx = begin_immediate(conn)?;
            replace_record(&tx, &scope, &record)?;
            tx.commit().map_err(|e| map_sql_error("Failed to commit transaction", e))
        })
        .await
    }

    async fn delete(&self, scope: &str, record_type: &str, id: &str) -> WalletResult<()> {
        let (scope, record_type, id) = (scope.to_string(), record_type.to_string(), id.to_string());
        self.with_conn(move |conn| {
            let tx = begin_immediate(conn)?;
            delete_record(&tx, &scope, &record_type, &id)?;
            tx.commit().map_err(|e| map_sql_error("Failed to commit transaction", e))
        })
        .await
    }

    async fn commit(&self, scope: &str, ops: Vec<WriteOp>) -> WalletResult<()> {
        let scope = scope.to_string();
        self.with_conn(move |conn| {
            let tx = begin_immediate(conn)?;
            for op in &ops {
                apply_op(&tx, &scope, op)?;
            }
            tx.commit().map_err(|e| map_sql_error("Failed to commit transaction", e))
        })
        .await
    }

    async fn purge(&self, scope: &str) -> WalletResult<usize> {
        let scope = scope.to_string();
        self.with_conn(move |conn| {
            let tx = begin_immediate(conn)?;
            tx.execute(
                "DELETE FROM record_tags WHERE record_pk IN (SELECT pk FROM records WHERE scope = ?)",
                params![&scope],
            )
            .map_err(|e| map_sql_error("Failed to purge tags", e))?;
            let removed = tx
                .execute("DELETE FROM records WHERE scope = ?", params![&scope])
                .map_err(|e| map_sql_error("Failed to purge records", e))?;
            tx.commit().map_err(|e| map_sql_error("Failed to commit transaction", e))?;
            Ok(removed)
        })
        .await
    }
}
