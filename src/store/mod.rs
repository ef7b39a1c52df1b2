//! Transactional executor seam.
//!
//! The processor owns exactly one [`Store`] and hands it every request in
//! turn; implementations apply a request's operations inside one native
//! transaction. [`sqlite::SqliteStore`] is the production implementation.

pub mod sqlite;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::{
    op::{Operation, OperationType},
    query::Query,
    request::{ErrorKind, Payload, Request, RequestInfo, RequestKind, ResponseError},
    types::Row,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {message}")]
    Constraint {
        operation: Option<usize>,
        message: String,
    },
    #[error("execution timed out")]
    Timeout,
    #[error("sqlite error: {source}")]
    Sqlite {
        operation: Option<usize>,
        #[source]
        source: rusqlite::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(source: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match source.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch) => Self::Constraint {
                operation: None,
                message: source.to_string(),
            },
            Some(ErrorCode::OperationInterrupted) => Self::Timeout,
            _ => Self::Sqlite {
                operation: None,
                source,
            },
        }
    }
}

impl StoreError {
    /// Tags the error with the 1-based index of the operation that raised it.
    pub fn at_operation(self, index: usize) -> Self {
        match self {
            Self::Constraint { message, .. } => Self::Constraint {
                operation: Some(index),
                message,
            },
            Self::Sqlite { source, .. } => Self::Sqlite {
                operation: Some(index),
                source,
            },
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Constraint { .. } => ErrorKind::ConstraintViolation,
            Self::Timeout => ErrorKind::Timeout,
            _ => ErrorKind::Store,
        }
    }

    pub fn operation_index(&self) -> Option<usize> {
        match self {
            Self::Constraint { operation, .. } | Self::Sqlite { operation, .. } => *operation,
            _ => None,
        }
    }

    /// Wire form of this failure.
    pub fn to_response_error(&self) -> ResponseError {
        ResponseError {
            kind: self.kind(),
            message: self.to_string(),
            operation_index: self.operation_index(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Aborts a statement running on another thread.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

impl Interrupt for rusqlite::InterruptHandle {
    fn interrupt(&self) {
        rusqlite::InterruptHandle::interrupt(self)
    }
}

/// Point in time after which execution must give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Never expires.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn after(budget: Duration) -> Self {
        Self(Instant::now().checked_add(budget))
    }

    pub fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// `Err(Timeout)` once expired.
    pub fn check(&self) -> StoreResult<()> {
        if self.expired() {
            Err(StoreError::Timeout)
        } else {
            Ok(())
        }
    }
}

/// Outcome of one applied operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    /// 1-based position in the request.
    pub operation_index: usize,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub table: String,
    pub rows_affected: u64,
    /// Row id assigned by an INSERT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inserted_id: Option<i64>,
}

/// Committed mutation request.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub results: Vec<OperationResult>,
    /// True when the request id had already committed and the logged
    /// results were returned without touching user tables.
    pub replayed: bool,
}

impl Applied {
    pub fn total_affected(&self) -> u64 {
        self.results.iter().map(|r| r.rows_affected).sum()
    }
}

/// Successful execution of any request kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Applied(Applied),
    Rows(Vec<Row>),
}

impl Execution {
    /// Response `data` for a request of `kind`.
    pub fn to_data(&self, kind: RequestKind) -> Value {
        match self {
            Self::Rows(rows) => Value::Array(rows.iter().cloned().map(Value::Object).collect()),
            Self::Applied(applied) => match kind {
                RequestKind::Single => {
                    let first = applied.results.first();
                    json!({
                        "rows_affected": first.map_or(0, |r| r.rows_affected),
                        "inserted_id": first.and_then(|r| r.inserted_id),
                    })
                }
                _ => json!({
                    "transaction_success": true,
                    "operations_count": applied.results.len(),
                    "total_affected_rows": applied.total_affected(),
                    "results": applied.results,
                }),
            },
        }
    }

    pub fn replayed(&self) -> bool {
        matches!(self, Self::Applied(Applied { replayed: true, .. }))
    }
}

/// Exclusive handle to the central database.
pub trait Store: Send {
    /// Applies `ops` in order inside one transaction and records the outcome
    /// under `info.request_id`. Any error leaves user tables unchanged.
    fn apply(&mut self, info: RequestInfo<'_>, ops: &[Operation], deadline: Deadline) -> StoreResult<Applied>;

    /// Runs a read-only select.
    fn select(&mut self, query: &Query, deadline: Deadline) -> StoreResult<Vec<Row>>;

    /// Results previously committed under `request_id`, if any.
    fn committed(&mut self, _request_id: &str) -> StoreResult<Option<Applied>> {
        Ok(None)
    }

    /// Logs a failed mutation request. Never overrides a recorded success.
    fn record_failure(&mut self, _info: RequestInfo<'_>, _reason: &str) -> StoreResult<()> {
        Ok(())
    }

    /// Handle able to abort the statement currently running on this store.
    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }
}

/// Dispatches a validated request to `store`.
pub fn execute_request(store: &mut dyn Store, request: &Request, deadline: Deadline) -> StoreResult<Execution> {
    match &request.payload {
        Payload::Query(query) => store.select(query, deadline).map(Execution::Rows),
        Payload::Single(_) | Payload::Transaction(_) => store
            .apply(request.info(), request.operations(), deadline)
            .map(Execution::Applied),
    }
}
