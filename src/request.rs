//! Request and response documents exchanged through the mailboxes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    op::{Operation, OperationData, OperationDocument, OperationType, ValidationError},
    query::{Query, QueryData},
    types::{ClientId, Metadata, RequestId, is_request_id, now_secs},
};

/// Request discriminator carried in the `operation` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestKind {
    /// One implicit operation on the request's `table`.
    Single,
    /// An ordered list of operations applied atomically.
    Transaction,
    /// A read-only select.
    Query,
}

impl RequestKind {
    /// Upper-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "SINGLE",
            Self::Transaction => "TRANSACTION",
            Self::Query => "QUERY",
        }
    }
}

/// Decoded body of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// One operation.
    Single(Operation),
    /// Operations in commit order.
    Transaction(Vec<Operation>),
    /// A select.
    Query(Query),
}

/// A validated request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Mailbox-wide unique identifier.
    pub request_id: RequestId,
    /// Submitting host.
    pub client_id: ClientId,
    /// What to do.
    pub payload: Payload,
    /// Creation time, epoch seconds.
    pub timestamp: f64,
    /// Opaque to the core; consumed by notification hooks.
    pub metadata: Metadata,
}

/// Borrowed identity of a request, handed to the store for its execution log.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    /// Request identifier.
    pub request_id: &'a str,
    /// Submitting host.
    pub client_id: &'a str,
    /// Request discriminator.
    pub kind: RequestKind,
    /// Creation time, epoch seconds.
    pub timestamp: f64,
}

/// Wire shape of a request file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDocument {
    pub request_id: String,
    pub client_id: String,
    pub operation: RequestKind,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Serialize, Deserialize)]
struct SingleData {
    #[serde(rename = "type")]
    op_type: OperationType,
    #[serde(flatten)]
    data: OperationData,
}

#[derive(Debug, Serialize, Deserialize)]
struct TransactionData {
    operations: Vec<OperationDocument>,
}

impl Request {
    /// Request discriminator.
    pub fn kind(&self) -> RequestKind {
        match self.payload {
            Payload::Single(_) => RequestKind::Single,
            Payload::Transaction(_) => RequestKind::Transaction,
            Payload::Query(_) => RequestKind::Query,
        }
    }

    /// Operations to apply, in order. Empty for queries.
    pub fn operations(&self) -> &[Operation] {
        match &self.payload {
            Payload::Single(op) => std::slice::from_ref(op),
            Payload::Transaction(ops) => ops,
            Payload::Query(_) => &[],
        }
    }

    /// True when executing the request mutates the store.
    pub fn is_mutation(&self) -> bool {
        !matches!(self.payload, Payload::Query(_))
    }

    pub fn info(&self) -> RequestInfo<'_> {
        RequestInfo {
            request_id: &self.request_id,
            client_id: &self.client_id,
            kind: self.kind(),
            timestamp: self.timestamp,
        }
    }

    /// Copy of this request under a different identifier and a fresh timestamp.
    ///
    /// Used for resubmission: the copy is a new request, not a replay.
    pub fn reissue(&self, request_id: RequestId) -> Self {
        Self {
            request_id,
            timestamp: now_secs(),
            ..self.clone()
        }
    }

    /// Checks the envelope and every operation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_request_id(&self.request_id) {
            return Err(ValidationError::InvalidRequestId(self.request_id.clone()));
        }
        if self.client_id.trim().is_empty() {
            return Err(ValidationError::MissingClientId);
        }
        match &self.payload {
            Payload::Single(op) => op.validate(1),
            Payload::Transaction(ops) => {
                if ops.is_empty() {
                    return Err(ValidationError::EmptyTransaction);
                }
                ops.iter()
                    .enumerate()
                    .try_for_each(|(i, op)| op.validate(i + 1))
            }
            Payload::Query(query) => query.validate(),
        }
    }

    /// Wire representation.
    pub fn to_document(&self) -> RequestDocument {
        let (table, data) = match &self.payload {
            Payload::Single(op) => {
                let doc = op.to_document();
                let data = SingleData {
                    op_type: doc.op_type,
                    data: doc.data,
                };
                (doc.table, to_value(&data))
            }
            Payload::Transaction(ops) => {
                let data = TransactionData {
                    operations: ops.iter().map(Operation::to_document).collect(),
                };
                (String::new(), to_value(&data))
            }
            Payload::Query(query) => (query.table.clone(), to_value(&query.to_data())),
        };
        RequestDocument {
            request_id: self.request_id.clone(),
            client_id: self.client_id.clone(),
            operation: self.kind(),
            table,
            data,
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
        }
    }

    /// Decodes and validates a wire document.
    pub fn from_document(doc: RequestDocument) -> Result<Self, ValidationError> {
        let payload = match doc.operation {
            RequestKind::Single => {
                let single: SingleData = from_value(doc.data)?;
                Payload::Single(Operation::from_parts(single.op_type, doc.table, single.data, 1)?)
            }
            RequestKind::Transaction => {
                // Each operation names its own table.
                if !doc.table.is_empty() {
                    return Err(ValidationError::Malformed(format!(
                        "TRANSACTION requests carry an empty top-level table, found `{}`",
                        doc.table
                    )));
                }
                let txn: TransactionData = from_value(doc.data)?;
                let ops = txn
                    .operations
                    .into_iter()
                    .enumerate()
                    .map(|(i, op)| Operation::from_document(op, i + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                Payload::Transaction(ops)
            }
            RequestKind::Query => {
                let data: QueryData = if doc.data.is_null() {
                    QueryData::default()
                } else {
                    from_value(doc.data)?
                };
                Payload::Query(Query::from_data(doc.table, data)?)
            }
        };
        let request = Self {
            request_id: doc.request_id,
            client_id: doc.client_id,
            payload,
            timestamp: doc.timestamp,
            metadata: doc.metadata,
        };
        request.validate()?;
        Ok(request)
    }
}

fn to_value<T: Serialize>(data: &T) -> Value {
    // Plain structs of maps, strings and numbers always serialize.
    serde_json::to_value(data).unwrap_or(Value::Null)
}

fn from_value<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, ValidationError> {
    serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))
}

/// A request file that could not be turned into a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// Client id recovered from the raw document, if any.
    pub client_id: Option<ClientId>,
    /// Why the document was rejected.
    pub error: ValidationError,
}

/// Serializes a request document as pretty-printed JSON.
pub fn encode_request(request: &Request) -> Vec<u8> {
    serde_json::to_vec_pretty(&request.to_document()).unwrap_or_default()
}

/// Parses and validates a request file.
pub fn decode_request(bytes: &[u8]) -> Result<Request, Rejection> {
    let raw: Value = serde_json::from_slice(bytes).map_err(|e| Rejection {
        client_id: None,
        error: ValidationError::Malformed(e.to_string()),
    })?;
    let client_id = raw
        .get("client_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let reject = |error| Rejection {
        client_id: client_id.clone(),
        error,
    };
    let doc: RequestDocument = serde_json::from_value(raw)
        .map_err(|e| reject(ValidationError::Malformed(e.to_string())))?;
    Request::from_document(doc).map_err(reject)
}

/// Failure classes reported in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The request was malformed and never touched the store.
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    /// The store rejected a mutation; the whole request was rolled back.
    #[serde(rename = "CONSTRAINT_VIOLATION")]
    ConstraintViolation,
    /// Execution exceeded its budget; in-flight work was rolled back.
    #[serde(rename = "TIMEOUT_ERROR")]
    Timeout,
    /// Any other store failure (unknown table, I/O); rolled back.
    #[serde(rename = "STORE_ERROR")]
    Store,
}

/// Structured failure description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub kind: ErrorKind,
    pub message: String,
    /// 1-based index of the failing operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_index: Option<usize>,
}

impl From<&ValidationError> for ResponseError {
    fn from(error: &ValidationError) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: error.to_string(),
            operation_index: error.operation_index(),
        }
    }
}

/// Outcome document for exactly one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: RequestId,
    #[serde(default)]
    pub client_id: ClientId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    /// Completion time, epoch seconds.
    pub timestamp: f64,
}

impl Response {
    /// Successful outcome carrying `data`.
    pub fn success(request_id: impl Into<RequestId>, client_id: impl Into<ClientId>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            client_id: client_id.into(),
            success: true,
            data: Some(data),
            error: None,
            timestamp: now_secs(),
        }
    }

    /// Failed outcome.
    pub fn failure(
        request_id: impl Into<RequestId>,
        client_id: impl Into<ClientId>,
        error: ResponseError,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            client_id: client_id.into(),
            success: false,
            data: None,
            error: Some(error),
            timestamp: now_secs(),
        }
    }

    /// Failure kind, if the request failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// `rows_affected` of a SINGLE result or `total_affected_rows` of a transaction.
    pub fn rows_affected(&self) -> Option<u64> {
        let data = self.data.as_ref()?;
        data.get("rows_affected")
            .or_else(|| data.get("total_affected_rows"))
            .and_then(Value::as_u64)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
