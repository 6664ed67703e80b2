//! Bundled SQLite execution backend

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use super::service::{ExecutionError, ExecutionService, QueryRows};

/// Progress-handler granularity, in VM instructions
const PROGRESS_OPS: i32 = 1000;

/// Runs queries on a single SQLite connection from the blocking pool.
///
/// The statement timeout is enforced with a progress handler that
/// interrupts the VM once the deadline passes; SQLite then reports
/// "interrupted".
#[derive(Clone)]
pub struct SqliteExecutionService {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutionService {
    /// Open an existing database file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExecutionError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| ExecutionError::Unavailable(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, ExecutionError> {
        let conn =
            Connection::open_in_memory().map_err(|e| ExecutionError::Unavailable(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run setup statements (DDL, fixtures) outside the read-only path.
    pub fn execute_batch(&self, sql: &str) -> Result<(), ExecutionError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| ExecutionError::Unavailable("connection lock poisoned".to_string()))?;
        conn.execute_batch(sql)
            .map_err(|e| ExecutionError::Query(e.to_string()))
    }
}

#[async_trait]
impl ExecutionService for SqliteExecutionService {
    async fn execute(
        &self,
        sql: &str,
        timeout: Duration,
        row_cap: usize,
    ) -> Result<QueryRows, ExecutionError> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || run_query(&conn, &sql, timeout, row_cap))
            .await
            .map_err(|e| ExecutionError::Unavailable(format!("query task failed: {}", e)))?
    }
}

fn run_query(
    conn: &Mutex<Connection>,
    sql: &str,
    timeout: Duration,
    row_cap: usize,
) -> Result<QueryRows, ExecutionError> {
    let conn = conn
        .lock()
        .map_err(|_| ExecutionError::Unavailable("connection lock poisoned".to_string()))?;

    let deadline = Instant::now() + timeout;
    conn.progress_handler(PROGRESS_OPS, Some(move || Instant::now() > deadline));
    let result = collect_rows(&conn, sql, row_cap);
    conn.progress_handler(0, None::<fn() -> bool>);
    result
}

fn collect_rows(conn: &Connection, sql: &str, row_cap: usize) -> Result<QueryRows, ExecutionError> {
    let mut stmt = conn.prepare(sql).map_err(query_error)?;
    if !stmt.readonly() {
        return Err(ExecutionError::Query(
            "attempt to write a readonly database".to_string(),
        ));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let column_count = columns.len();
    let mut rows = stmt.query([]).map_err(query_error)?;

    let mut out = Vec::new();
    while out.len() < row_cap {
        let Some(row) = rows.next().map_err(query_error)? else {
            break;
        };
        let mut values = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            values.push(to_json(row.get_ref(idx).map_err(query_error)?));
        }
        out.push(values);
    }
    debug!("[Executor] SQLite returned {} row(s)", out.len());

    Ok(QueryRows { columns, rows: out })
}

fn query_error(err: rusqlite::Error) -> ExecutionError {
    ExecutionError::Query(err.to_string())
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn seeded() -> SqliteExecutionService {
        let service = SqliteExecutionService::open_in_memory().unwrap();
        service
            .execute_batch(
                "CREATE TABLE products (product_id INTEGER PRIMARY KEY, name TEXT, price REAL);
                 INSERT INTO products (name, price)
                 VALUES ('pen', 1.5), ('book', 12.0), ('lamp', 30.0);",
            )
            .unwrap();
        service
    }

    #[tokio::test]
    async fn returns_rows_as_json() {
        let rows = seeded()
            .execute(
                "SELECT name, price FROM products ORDER BY product_id",
                Duration::from_secs(5),
                10,
            )
            .await
            .unwrap();
        assert_eq!(rows.columns, vec!["name", "price"]);
        assert_eq!(rows.rows[0], vec![serde_json::json!("pen"), serde_json::json!(1.5)]);
        assert_eq!(rows.rows.len(), 3);
    }

    #[tokio::test]
    async fn caps_materialized_rows() {
        let rows = seeded()
            .execute("SELECT name FROM products", Duration::from_secs(5), 2)
            .await
            .unwrap();
        assert_eq!(rows.rows.len(), 2);
    }

    #[tokio::test]
    async fn reports_provider_text() {
        let err = seeded()
            .execute("SELECT id FROM products", Duration::from_secs(5), 10)
            .await
            .unwrap_err();
        assert!(err.message().contains("no such column: id"), "{}", err);
    }

    #[tokio::test]
    async fn refuses_writes() {
        let err = seeded()
            .execute("DELETE FROM products", Duration::from_secs(5), 10)
            .await
            .unwrap_err();
        assert!(err.message().contains("readonly"));
    }

    #[tokio::test]
    async fn interrupts_runaway_queries() {
        let sql = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) \
                   SELECT COUNT(*) FROM n";
        let err = seeded()
            .execute(sql, Duration::from_millis(50), 10)
            .await
            .unwrap_err();
        assert!(err.message().contains("interrupted"), "{}", err);
    }
}
