//! Database synchronization over shared-folder mailboxes.
//!
//! Clients drop request files into a `requests` folder; a single processor
//! claims them, applies each one atomically to the central SQLite database and
//! answers through a `responses` folder. No network port is opened on either
//! side.
//!
//! # Examples
//!
//! Building a transaction with [`encoder::TransactionBuilder`]:
//! ```
//! use serde_json::json;
//! use syncsys::{encoder::TransactionBuilder, request::RequestKind};
//!
//! let mut txn = TransactionBuilder::new();
//! txn.add_insert("tasks", json!({"task_id": 7, "title": "survey"}).as_object().cloned().unwrap_or_default())
//!     .add_update("tasks", 7, json!({"status": "done"}).as_object().cloned().unwrap_or_default());
//! let request = txn.build("site-a").expect("valid transaction");
//! assert_eq!(request.kind(), RequestKind::Transaction);
//! assert_eq!(request.operations().len(), 2);
//! ```
//!
//! Running the processor and a client against the same folders:
//! ```no_run
//! use std::sync::Arc;
//!
//! use syncsys::{
//!     channel::dir::DirMailbox,
//!     client::SyncClient,
//!     config::{ClientConfig, ProcessorConfig},
//!     processor::Processor,
//!     store::sqlite::SqliteStore,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let requests = Arc::new(DirMailbox::open("shared/requests").expect("requests"));
//! let responses = Arc::new(DirMailbox::open("shared/responses").expect("responses"));
//! let store = SqliteStore::open("central.db").expect("open sqlite");
//! let handle = Processor::new(Box::new(store), requests.clone(), responses.clone(), ProcessorConfig::default())
//!     .spawn()
//!     .expect("spawn");
//!
//! let client = SyncClient::new("site-a", requests, responses, ClientConfig::default());
//! let rows = client.find_all("tasks", Default::default()).await.expect("select");
//! println!("{} tasks", rows.len());
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```

/// Filesystem rendezvous channel.
pub mod channel;
/// Request submission, correlation and retry.
pub mod client;
/// JSON configuration.
pub mod config;
/// Request construction and identifier allocation.
pub mod encoder;
/// Post-commit notification seam.
pub mod notify;
/// Mutation operations and validation.
pub mod op;
/// Admission-controlled request processor.
pub mod processor;
/// Read-only queries.
pub mod query;
/// Request and response documents.
pub mod request;
/// Transactional executor.
pub mod store;
/// Shared primitive types.
pub mod types;
