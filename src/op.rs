//! Mutation operation model and its wire representation.
//!
//! [`Operation`] is a closed sum type: each variant carries exactly the fields
//! its type requires. Documents arriving from clients are decoded into the
//! loose [`OperationDocument`] shape first and only become an `Operation`
//! once [`Operation::from_document`] has checked that contract.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Row, is_scalar, is_sql_identifier};

/// Kind of mutation carried by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    /// Insert one row.
    Insert,
    /// Update rows matching `where`.
    Update,
    /// Delete rows matching `where`.
    Delete,
}

impl OperationType {
    /// Upper-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural problems found before a request reaches the store.
///
/// `operation` indices are 1-based positions inside the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed request document: {0}")]
    Malformed(String),
    #[error("invalid request identifier `{0}`")]
    InvalidRequestId(String),
    #[error("request identifier `{found}` does not match mailbox entry `{expected}`")]
    IdMismatch { expected: String, found: String },
    #[error("client identifier is empty")]
    MissingClientId,
    #[error("transaction carries no operations")]
    EmptyTransaction,
    #[error("operation {operation}: invalid table name `{table}`")]
    InvalidTable { operation: usize, table: String },
    #[error("operation {operation}: invalid column name `{column}`")]
    InvalidColumn { operation: usize, column: String },
    #[error("operation {operation}: {op_type} requires non-empty values")]
    MissingValues { operation: usize, op_type: OperationType },
    #[error("operation {operation}: {op_type} requires a non-empty where clause")]
    MissingFilter { operation: usize, op_type: OperationType },
    #[error("operation {operation}: {op_type} does not accept `{field}`")]
    UnexpectedField {
        operation: usize,
        op_type: OperationType,
        field: &'static str,
    },
    #[error("operation {operation}: column `{column}` holds a non-scalar value")]
    NonScalarValue { operation: usize, column: String },
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl ValidationError {
    /// 1-based index of the offending operation, when the error is tied to one.
    pub fn operation_index(&self) -> Option<usize> {
        match self {
            Self::InvalidTable { operation, .. }
            | Self::InvalidColumn { operation, .. }
            | Self::MissingValues { operation, .. }
            | Self::MissingFilter { operation, .. }
            | Self::UnexpectedField { operation, .. }
            | Self::NonScalarValue { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

/// The `{values, where}` body shared by every operation on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationData {
    /// Column assignments.
    #[serde(default, skip_serializing_if = "Row::is_empty")]
    pub values: Row,
    /// Equality predicates, combined with AND.
    #[serde(default, rename = "where", skip_serializing_if = "Row::is_empty")]
    pub filter: Row,
}

/// Wire shape of one operation inside a transaction: `{type, table, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDocument {
    /// Mutation kind.
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Target table.
    pub table: String,
    /// Values and predicates.
    #[serde(default)]
    pub data: OperationData,
}

/// A validated mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Insert one row built from `values`.
    Insert { table: String, values: Row },
    /// Assign `values` on every row matching `filter`.
    Update {
        table: String,
        values: Row,
        filter: Row,
    },
    /// Remove every row matching `filter`.
    Delete { table: String, filter: Row },
}

impl Operation {
    /// Builds an operation from its wire parts and checks its field contract.
    ///
    /// `index` is the 1-based position used in error messages.
    pub fn from_parts(
        op_type: OperationType,
        table: String,
        data: OperationData,
        index: usize,
    ) -> Result<Self, ValidationError> {
        let OperationData { values, filter } = data;
        let op = match op_type {
            OperationType::Insert => {
                if !filter.is_empty() {
                    return Err(ValidationError::UnexpectedField {
                        operation: index,
                        op_type,
                        field: "where",
                    });
                }
                Self::Insert { table, values }
            }
            OperationType::Update => Self::Update {
                table,
                values,
                filter,
            },
            OperationType::Delete => {
                if !values.is_empty() {
                    return Err(ValidationError::UnexpectedField {
                        operation: index,
                        op_type,
                        field: "values",
                    });
                }
                Self::Delete { table, filter }
            }
        };
        op.validate(index)?;
        Ok(op)
    }

    /// Decodes one entry of a transaction's `operations` array.
    pub fn from_document(doc: OperationDocument, index: usize) -> Result<Self, ValidationError> {
        Self::from_parts(doc.op_type, doc.table, doc.data, index)
    }

    /// Wire representation of this operation.
    pub fn to_document(&self) -> OperationDocument {
        let (values, filter) = match self {
            Self::Insert { values, .. } => (values.clone(), Row::new()),
            Self::Update { values, filter, .. } => (values.clone(), filter.clone()),
            Self::Delete { filter, .. } => (Row::new(), filter.clone()),
        };
        OperationDocument {
            op_type: self.op_type(),
            table: self.table().to_string(),
            data: OperationData { values, filter },
        }
    }

    /// Checks table/column names, required maps and scalar values.
    pub fn validate(&self, index: usize) -> Result<(), ValidationError> {
        let op_type = self.op_type();
        if !is_sql_identifier(self.table()) {
            return Err(ValidationError::InvalidTable {
                operation: index,
                table: self.table().to_string(),
            });
        }
        if let Some(values) = self.values() {
            if values.is_empty() {
                return Err(ValidationError::MissingValues {
                    operation: index,
                    op_type,
                });
            }
            check_columns(values, index)?;
        }
        if let Some(filter) = self.filter() {
            if filter.is_empty() {
                return Err(ValidationError::MissingFilter {
                    operation: index,
                    op_type,
                });
            }
            check_columns(filter, index)?;
        }
        Ok(())
    }

    /// Mutation kind.
    pub fn op_type(&self) -> OperationType {
        match self {
            Self::Insert { .. } => OperationType::Insert,
            Self::Update { .. } => OperationType::Update,
            Self::Delete { .. } => OperationType::Delete,
        }
    }

    /// Target table.
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. } | Self::Update { table, .. } | Self::Delete { table, .. } => {
                table
            }
        }
    }

    /// Column assignments, for INSERT and UPDATE.
    pub fn values(&self) -> Option<&Row> {
        match self {
            Self::Insert { values, .. } | Self::Update { values, .. } => Some(values),
            Self::Delete { .. } => None,
        }
    }

    /// Row filter, for UPDATE and DELETE.
    pub fn filter(&self) -> Option<&Row> {
        match self {
            Self::Update { filter, .. } | Self::Delete { filter, .. } => Some(filter),
            Self::Insert { .. } => None,
        }
    }
}

fn check_columns(row: &Row, index: usize) -> Result<(), ValidationError> {
    for (column, value) in row {
        if !is_sql_identifier(column) {
            return Err(ValidationError::InvalidColumn {
                operation: index,
                column: column.clone(),
            });
        }
        if !is_scalar(value) {
            return Err(ValidationError::NonScalarValue {
                operation: index,
                column: column.clone(),
            });
        }
    }
    Ok(())
}
