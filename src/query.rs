//! Read-only select requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    op::ValidationError,
    types::{Row, is_scalar, is_sql_identifier},
};

/// Sort key for a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// Column to sort on.
    pub column: String,
    /// Sort descending instead of ascending.
    pub descending: bool,
}

impl OrderBy {
    /// Parses `column`, `column ASC` or `column DESC`.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let mut parts = raw.split_whitespace();
        let column = parts
            .next()
            .ok_or_else(|| ValidationError::InvalidQuery("empty order_by".to_string()))?;
        let descending = match parts.next().map(str::to_ascii_uppercase).as_deref() {
            None | Some("ASC") => false,
            Some("DESC") => true,
            Some(other) => {
                return Err(ValidationError::InvalidQuery(format!(
                    "unknown sort direction `{other}`"
                )));
            }
        };
        if parts.next().is_some() || !is_sql_identifier(column) {
            return Err(ValidationError::InvalidQuery(format!(
                "unsupported order_by `{raw}`"
            )));
        }
        Ok(Self {
            column: column.to_string(),
            descending,
        })
    }

    fn to_wire(&self) -> String {
        if self.descending {
            format!("{} DESC", self.column)
        } else {
            self.column.clone()
        }
    }
}

/// Wire body of a `QUERY` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryData {
    /// Columns to return; empty selects all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    /// Equality predicates, combined with AND.
    #[serde(default, rename = "where", skip_serializing_if = "Row::is_empty")]
    pub filter: Row,
    /// `column [ASC|DESC]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    /// Row cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

/// A validated select against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Table to read.
    pub table: String,
    /// Columns to return; empty selects all.
    pub columns: Vec<String>,
    /// Equality predicates, combined with AND. May be empty.
    pub filter: Row,
    /// Optional sort key.
    pub order_by: Option<OrderBy>,
    /// Optional row cap.
    pub limit: Option<u64>,
}

impl Query {
    /// Selects every row of `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            filter: Row::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Adds an equality predicate.
    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(column.into(), value.into());
        self
    }

    /// Replaces the predicate map.
    pub fn filter_by(mut self, filter: Row) -> Self {
        self.filter = filter;
        self
    }

    /// Restricts the returned columns.
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Sorts the result.
    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(OrderBy {
            column: column.into(),
            descending,
        });
        self
    }

    /// Caps the number of rows.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Decodes the wire body of a `QUERY` request addressed at `table`.
    pub fn from_data(table: String, data: QueryData) -> Result<Self, ValidationError> {
        let order_by = data.order_by.as_deref().map(OrderBy::parse).transpose()?;
        let query = Self {
            table,
            columns: data.columns,
            filter: data.filter,
            order_by,
            limit: data.limit,
        };
        query.validate()?;
        Ok(query)
    }

    /// Wire body for this query.
    pub fn to_data(&self) -> QueryData {
        QueryData {
            columns: self.columns.clone(),
            filter: self.filter.clone(),
            order_by: self.order_by.as_ref().map(OrderBy::to_wire),
            limit: self.limit,
        }
    }

    /// Checks every identifier and predicate value.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_sql_identifier(&self.table) {
            return Err(ValidationError::InvalidQuery(format!(
                "invalid table name `{}`",
                self.table
            )));
        }
        let names = self
            .columns
            .iter()
            .chain(self.filter.keys())
            .chain(self.order_by.iter().map(|o| &o.column));
        for name in names {
            if !is_sql_identifier(name) {
                return Err(ValidationError::InvalidQuery(format!(
                    "invalid column name `{name}`"
                )));
            }
        }
        if let Some((column, _)) = self.filter.iter().find(|(_, v)| !is_scalar(v)) {
            return Err(ValidationError::InvalidQuery(format!(
                "column `{column}` holds a non-scalar value"
            )));
        }
        Ok(())
    }
}
