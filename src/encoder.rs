//! Transaction encoder: accumulates operations and stamps them into a request.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use uuid::Uuid;

use crate::{
    op::{Operation, OperationType, ValidationError},
    query::Query,
    request::{Payload, Request},
    types::{Metadata, RequestId, Row, now_secs, sanitize_id_part},
};

/// Default key column used by [`TransactionBuilder::add_update`] and
/// [`TransactionBuilder::add_delete`].
pub const DEFAULT_PRIMARY_KEY: &str = "task_id";

/// Allocates `{client}_{purpose}_{timestamp_ms}_{nonce}`.
///
/// The nonce is a random v4 UUID, so two calls never collide even within the
/// same millisecond on the same host.
pub fn new_request_id(client_id: &str, purpose: &str) -> RequestId {
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!(
        "{}_{}_{}_{}",
        sanitize_id_part(client_id),
        sanitize_id_part(purpose),
        ts_ms,
        Uuid::new_v4().simple()
    )
}

/// Builds a `TRANSACTION` request from an ordered list of operations.
///
/// Invalid additions are remembered and reported by [`build`](Self::build),
/// so calls can be chained without checking each one.
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    operations: Vec<Operation>,
    metadata: Metadata,
    primary_key: String,
    purpose: String,
    error: Option<ValidationError>,
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self {
            operations: Vec::new(),
            metadata: Metadata::new(),
            primary_key: DEFAULT_PRIMARY_KEY.to_string(),
            purpose: "txn".to_string(),
            error: None,
        }
    }

    /// Column used as the `where` key by the keyed helpers.
    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    /// Purpose segment of generated request ids.
    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }

    pub fn add_insert(&mut self, table: impl Into<String>, values: Row) -> &mut Self {
        self.push(Operation::Insert {
            table: table.into(),
            values,
        })
    }

    /// UPDATE with `where = {primary_key: key}`.
    pub fn add_update(
        &mut self,
        table: impl Into<String>,
        key: impl Into<Value>,
        values: Row,
    ) -> &mut Self {
        let filter = self.key_filter(key);
        self.add_update_with_conditions(table, values, filter)
    }

    pub fn add_update_with_conditions(
        &mut self,
        table: impl Into<String>,
        values: Row,
        filter: Row,
    ) -> &mut Self {
        self.push(Operation::Update {
            table: table.into(),
            values,
            filter,
        })
    }

    /// DELETE with `where = {primary_key: key}`.
    pub fn add_delete(&mut self, table: impl Into<String>, key: impl Into<Value>) -> &mut Self {
        let filter = self.key_filter(key);
        self.add_delete_with_conditions(table, filter)
    }

    pub fn add_delete_with_conditions(&mut self, table: impl Into<String>, filter: Row) -> &mut Self {
        self.push(Operation::Delete {
            table: table.into(),
            filter,
        })
    }

    /// Attaches a metadata entry for downstream collaborators.
    pub fn metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Drops every operation, metadata entry and remembered error.
    pub fn clear(&mut self) -> &mut Self {
        self.operations.clear();
        self.metadata.clear();
        self.error = None;
        self
    }

    /// Stamps the accumulated operations into an immutable request.
    ///
    /// Each call allocates a new identifier and timestamp.
    pub fn build(&self, client_id: &str) -> Result<Request, ValidationError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.operations.is_empty() {
            return Err(ValidationError::EmptyTransaction);
        }
        let request = Request {
            request_id: new_request_id(client_id, &self.purpose),
            client_id: client_id.to_string(),
            payload: Payload::Transaction(self.operations.clone()),
            timestamp: now_secs(),
            metadata: self.metadata.clone(),
        };
        request.validate()?;
        Ok(request)
    }

    fn key_filter(&self, key: impl Into<Value>) -> Row {
        let mut filter = Row::new();
        filter.insert(self.primary_key.clone(), key.into());
        filter
    }

    fn push(&mut self, op: Operation) -> &mut Self {
        let index = self.operations.len() + 1;
        match op.validate(index) {
            Ok(()) => self.operations.push(op),
            Err(err) => {
                self.error.get_or_insert(err);
            }
        }
        self
    }
}

/// Builds a `SINGLE` request.
pub fn single_request(
    client_id: &str,
    op: Operation,
    metadata: Metadata,
) -> Result<Request, ValidationError> {
    let purpose = match op.op_type() {
        OperationType::Insert => "insert",
        OperationType::Update => "update",
        OperationType::Delete => "delete",
    };
    let request = Request {
        request_id: new_request_id(client_id, purpose),
        client_id: client_id.to_string(),
        payload: Payload::Single(op),
        timestamp: now_secs(),
        metadata,
    };
    request.validate()?;
    Ok(request)
}

/// Builds a `QUERY` request.
pub fn query_request(client_id: &str, query: Query) -> Result<Request, ValidationError> {
    let request = Request {
        request_id: new_request_id(client_id, "query"),
        client_id: client_id.to_string(),
        payload: Payload::Query(query),
        timestamp: now_secs(),
        metadata: Metadata::new(),
    };
    request.validate()?;
    Ok(request)
}
