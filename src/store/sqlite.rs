//! SQLite-backed transactional executor.

use std::{path::Path, sync::Arc, time::Duration};

use rusqlite::{
    Connection, OptionalExtension, Transaction, TransactionBehavior, params, params_from_iter,
    types::{Value as SqlValue, ValueRef},
};
use serde_json::{Number, Value};

use crate::{
    op::Operation,
    query::Query,
    request::RequestInfo,
    types::{Row, now_secs},
};

use super::{Applied, Deadline, Interrupt, OperationResult, Store, StoreError, StoreResult};

/// Execution log table. Not addressable by requests.
pub const SYNC_LOG_TABLE: &str = "sync_log";

/// Outcome recorded for a request id.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub request_id: String,
    pub client_id: String,
    pub operation: String,
    /// `SUCCESS` or `ERROR`.
    pub status: String,
    pub error_message: Option<String>,
    pub results: Vec<OperationResult>,
}

/// SQLite implementation of [`Store`].
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens or creates the database at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Message(format!("cannot create {}: {e}", parent.display())))?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wraps an existing connection and installs the execution log.
    pub fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self { conn })
    }

    /// Runs schema DDL supplied by the deployment.
    pub fn apply_schema(&self, sql: &str) -> StoreResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Logged outcome of `request_id`, if any.
    pub fn log_entry(&self, request_id: &str) -> StoreResult<Option<LogEntry>> {
        let row = self
            .conn
            .query_row(
                "SELECT request_id, client_id, operation, status, error_message, result
                 FROM sync_log WHERE request_id = ?1",
                params![request_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((request_id, client_id, operation, status, error_message, result)) = row else {
            return Ok(None);
        };
        let results = match result {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        Ok(Some(LogEntry {
            request_id,
            client_id,
            operation,
            status,
            error_message,
            results,
        }))
    }
}

impl Store for SqliteStore {
    fn apply(&mut self, info: RequestInfo<'_>, ops: &[Operation], deadline: Deadline) -> StoreResult<Applied> {
        deadline.check()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(results) = committed_results(&tx, info.request_id)? {
            return Ok(Applied {
                results,
                replayed: true,
            });
        }

        let mut results = Vec::with_capacity(ops.len());
        for (i, op) in ops.iter().enumerate() {
            let index = i + 1;
            deadline.check()?;
            let result = apply_operation(&tx, op, index).map_err(|e| e.at_operation(index))?;
            results.push(result);
        }
        deadline.check()?;

        let encoded = serde_json::to_string(&results)?;
        tx.execute(
            "INSERT INTO sync_log(request_id, client_id, operation, timestamp, status, result, completed_at)
             VALUES (?1, ?2, ?3, ?4, 'SUCCESS', ?5, ?6)
             ON CONFLICT(request_id) DO UPDATE SET
                status = 'SUCCESS', error_message = NULL,
                result = excluded.result, completed_at = excluded.completed_at",
            params![
                info.request_id,
                info.client_id,
                info.kind.as_str(),
                info.timestamp,
                encoded,
                now_secs()
            ],
        )?;
        tx.commit()?;
        Ok(Applied {
            results,
            replayed: false,
        })
    }

    fn select(&mut self, query: &Query, deadline: Deadline) -> StoreResult<Vec<Row>> {
        deadline.check()?;
        let columns = if query.columns.is_empty() {
            "*".to_string()
        } else {
            query.columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ")
        };
        let mut sql = format!("SELECT {columns} FROM {}", quote(&query.table));
        let (clause, bound) = where_clause(&query.filter);
        if !clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        if let Some(order) = &query.order_by {
            let dir = if order.descending { "DESC" } else { "ASC" };
            sql.push_str(&format!(" ORDER BY {} {dir}", quote(&order.column)));
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit.min(i64::MAX as u64)));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(bound))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            deadline.check()?;
            let mut map = Row::new();
            for (i, name) in names.iter().enumerate() {
                map.insert(name.clone(), sql_to_json(row.get_ref(i)?));
            }
            out.push(map);
        }
        Ok(out)
    }

    fn committed(&mut self, request_id: &str) -> StoreResult<Option<Applied>> {
        Ok(committed_results(&self.conn, request_id)?.map(|results| Applied {
            results,
            replayed: true,
        }))
    }

    fn record_failure(&mut self, info: RequestInfo<'_>, reason: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO sync_log(request_id, client_id, operation, timestamp, status, error_message, completed_at)
             VALUES (?1, ?2, ?3, ?4, 'ERROR', ?5, ?6)
             ON CONFLICT(request_id) DO UPDATE SET
                error_message = excluded.error_message, completed_at = excluded.completed_at
             WHERE sync_log.status <> 'SUCCESS'",
            params![
                info.request_id,
                info.client_id,
                info.kind.as_str(),
                info.timestamp,
                reason,
                now_secs()
            ],
        )?;
        Ok(())
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        Some(Arc::new(self.conn.get_interrupt_handle()))
    }
}

fn committed_results(conn: &Connection, request_id: &str) -> StoreResult<Option<Vec<OperationResult>>> {
    let logged: Option<Option<String>> = conn
        .query_row(
            "SELECT result FROM sync_log WHERE request_id = ?1 AND status = 'SUCCESS'",
            params![request_id],
            |row| row.get(0),
        )
        .optional()?;
    match logged {
        Some(Some(raw)) => Ok(Some(serde_json::from_str(&raw)?)),
        Some(None) => Ok(Some(Vec::new())),
        None => Ok(None),
    }
}

fn apply_operation(tx: &Transaction<'_>, op: &Operation, index: usize) -> StoreResult<OperationResult> {
    if op.table().eq_ignore_ascii_case(SYNC_LOG_TABLE) {
        return Err(StoreError::Message(format!(
            "operation {index}: table `{SYNC_LOG_TABLE}` is reserved"
        )));
    }
    let table = quote(op.table());
    let (sql, bound): (String, Vec<SqlValue>) = match op {
        Operation::Insert { values, .. } => {
            let columns = values.keys().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
            let marks = vec!["?"; values.len()].join(", ");
            (
                format!("INSERT INTO {table} ({columns}) VALUES ({marks})"),
                values.values().map(json_to_sql).collect(),
            )
        }
        Operation::Update { values, filter, .. } => {
            let set = values
                .keys()
                .map(|c| format!("{} = ?", quote(c)))
                .collect::<Vec<_>>()
                .join(", ");
            let (clause, where_bound) = where_clause(filter);
            let mut bound: Vec<SqlValue> = values.values().map(json_to_sql).collect();
            bound.extend(where_bound);
            (format!("UPDATE {table} SET {set} WHERE {clause}"), bound)
        }
        Operation::Delete { filter, .. } => {
            let (clause, bound) = where_clause(filter);
            (format!("DELETE FROM {table} WHERE {clause}"), bound)
        }
    };

    let rows_affected = tx.execute(&sql, params_from_iter(bound))? as u64;
    let inserted_id = matches!(op, Operation::Insert { .. }).then(|| tx.last_insert_rowid());
    Ok(OperationResult {
        operation_index: index,
        op_type: op.op_type(),
        table: op.table().to_string(),
        rows_affected,
        inserted_id,
    })
}

/// AND-joined equality predicates. JSON null matches with `IS NULL`.
fn where_clause(filter: &Row) -> (String, Vec<SqlValue>) {
    let mut parts = Vec::with_capacity(filter.len());
    let mut bound = Vec::with_capacity(filter.len());
    for (column, value) in filter {
        if value.is_null() {
            parts.push(format!("{} IS NULL", quote(column)));
        } else {
            parts.push(format!("{} = ?", quote(column)));
            bound.push(json_to_sql(value));
        }
    }
    (parts.join(" AND "), bound)
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}
