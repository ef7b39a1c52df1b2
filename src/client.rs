//! Client side of the mailbox protocol: publish, wait, retry.

use std::{
    path::Path,
    sync::Arc,
    time::{Instant, SystemTime},
};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    channel::{ChannelError, Claim, ClaimOutcome, Entry, Mailbox, dir::DirMailbox},
    config::{ClientConfig, SyncConfig},
    encoder::{TransactionBuilder, new_request_id, query_request, single_request},
    op::{Operation, ValidationError},
    query::Query,
    request::{Request, Response, ResponseError, encode_request},
    types::{Metadata, Row, sanitize_id_part},
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no response for `{last_request_id}` after {attempts} attempts")]
    NoResponse { attempts: u32, last_request_id: String },
    #[error("request `{request_id}` failed: {}", .error.message)]
    Failed {
        request_id: String,
        error: ResponseError,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("undecodable response for `{request_id}`: {message}")]
    Decode { request_id: String, message: String },
    #[error("background task failed: {0}")]
    Join(String),
}

/// Host identifier: `{hostname}-{8 hex}`.
pub fn generate_client_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "client".to_string());
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{}-{}", sanitize_id_part(&host), &nonce[..8])
}

/// Publishes requests and correlates their responses by request id.
#[derive(Clone)]
pub struct SyncClient {
    client_id: String,
    requests: Arc<dyn Mailbox>,
    responses: Arc<dyn Mailbox>,
    config: ClientConfig,
}

impl SyncClient {
    pub fn new(
        client_id: impl Into<String>,
        requests: Arc<dyn Mailbox>,
        responses: Arc<dyn Mailbox>,
        config: ClientConfig,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            requests,
            responses,
            config,
        }
    }

    /// Opens the shared-folder mailboxes named by `config`.
    pub fn from_config(config: &SyncConfig, client_id: impl Into<String>) -> Result<Self, ClientError> {
        let folder = &config.shared_folder;
        let open = |path: &Path| -> Result<Arc<dyn Mailbox>, ChannelError> {
            let mut mailbox = DirMailbox::open(path)?.with_retry(folder.retry_policy());
            if folder.archive {
                mailbox = mailbox.with_archive()?;
            }
            Ok(Arc::new(mailbox))
        };
        Ok(Self::new(
            client_id,
            open(folder.requests.as_path())?,
            open(folder.responses.as_path())?,
            config.client.clone(),
        ))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends `request` and waits for its response.
    ///
    /// When no response arrives within `request_timeout`, the unclaimed
    /// request is withdrawn if possible and resubmitted under a new id, up to
    /// `retry_attempts` times. The last copy is withdrawn too before
    /// [`ClientError::NoResponse`] is returned. A resubmitted mutation may execute twice if the
    /// first copy was processed but its response was lost.
    pub async fn submit(&self, request: Request) -> Result<Response, ClientError> {
        request.validate()?;
        let attempts = self.config.retry_attempts.saturating_add(1);
        let mut current = request;
        let mut attempt = 1;
        loop {
            self.publish(&current).await?;
            debug!(request_id = %current.request_id, attempt, "request published");
            if let Some(response) = self.await_response(&current.request_id).await? {
                return Ok(response);
            }
            if self.withdraw(&current.request_id).await? {
                debug!(request_id = %current.request_id, "withdrew unprocessed request");
            }
            if attempt >= attempts {
                warn!(request_id = %current.request_id, attempts, "giving up, no response");
                return Err(ClientError::NoResponse {
                    attempts,
                    last_request_id: current.request_id,
                });
            }
            tokio::time::sleep(self.config.retry_delay).await;
            let next = current.reissue(new_request_id(&self.client_id, "resubmit"));
            info!(
                previous = %current.request_id,
                request_id = %next.request_id,
                attempt = attempt + 1,
                "resubmitting after timeout"
            );
            current = next;
            attempt += 1;
        }
    }

    /// Submits and turns a failed response into [`ClientError::Failed`].
    pub async fn execute(&self, request: Request) -> Result<Value, ClientError> {
        let response = self.submit(request).await?;
        match response.error {
            Some(error) if !response.success => Err(ClientError::Failed {
                request_id: response.request_id,
                error,
            }),
            _ => Ok(response.data.unwrap_or(Value::Null)),
        }
    }

    /// Inserts one row and returns its row id.
    pub async fn insert(&self, table: impl Into<String>, values: Row) -> Result<Option<i64>, ClientError> {
        let op = Operation::Insert {
            table: table.into(),
            values,
        };
        let data = self.execute(single_request(&self.client_id, op, Metadata::new())?).await?;
        Ok(data.get("inserted_id").and_then(Value::as_i64))
    }

    /// Updates matching rows and returns how many changed.
    pub async fn update(&self, table: impl Into<String>, values: Row, filter: Row) -> Result<u64, ClientError> {
        let op = Operation::Update {
            table: table.into(),
            values,
            filter,
        };
        let data = self.execute(single_request(&self.client_id, op, Metadata::new())?).await?;
        Ok(rows_affected(&data))
    }

    /// Deletes matching rows and returns how many went.
    pub async fn delete(&self, table: impl Into<String>, filter: Row) -> Result<u64, ClientError> {
        let op = Operation::Delete {
            table: table.into(),
            filter,
        };
        let data = self.execute(single_request(&self.client_id, op, Metadata::new())?).await?;
        Ok(rows_affected(&data))
    }

    /// Commits every operation in `builder` atomically and returns the summary.
    pub async fn transaction(&self, builder: &TransactionBuilder) -> Result<Value, ClientError> {
        self.execute(builder.build(&self.client_id)?).await
    }

    pub async fn select(&self, query: Query) -> Result<Vec<Row>, ClientError> {
        let data = self.execute(query_request(&self.client_id, query)?).await?;
        Ok(match data {
            Value::Array(rows) => rows
                .into_iter()
                .filter_map(|row| match row {
                    Value::Object(row) => Some(row),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        })
    }

    pub async fn find_one(&self, table: impl Into<String>, filter: Row) -> Result<Option<Row>, ClientError> {
        let rows = self.select(Query::new(table).filter_by(filter).limit(1)).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn find_all(&self, table: impl Into<String>, filter: Row) -> Result<Vec<Row>, ClientError> {
        self.select(Query::new(table).filter_by(filter)).await
    }

    pub async fn count(&self, table: impl Into<String>, filter: Row) -> Result<usize, ClientError> {
        Ok(self.find_all(table, filter).await?.len())
    }

    pub async fn exists(&self, table: impl Into<String>, filter: Row) -> Result<bool, ClientError> {
        Ok(self.find_one(table, filter).await?.is_some())
    }

    /// Keyed helpers bound to one table.
    pub fn table(&self, name: impl Into<String>) -> Table<'_> {
        Table {
            client: self,
            name: name.into(),
            primary_key: crate::encoder::DEFAULT_PRIMARY_KEY.to_string(),
        }
    }

    async fn publish(&self, request: &Request) -> Result<(), ClientError> {
        let mailbox = Arc::clone(&self.requests);
        let id = request.request_id.clone();
        let body = encode_request(request);
        run_blocking(move || mailbox.publish(&id, &body)).await??;
        Ok(())
    }

    async fn await_response(&self, request_id: &str) -> Result<Option<Response>, ClientError> {
        let started = Instant::now();
        loop {
            if let Some(response) = self.take_response(request_id).await? {
                return Ok(Some(response));
            }
            let elapsed = started.elapsed();
            if elapsed >= self.config.request_timeout {
                return Ok(None);
            }
            let remaining = self.config.request_timeout - elapsed;
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }

    /// Claims, decodes and consumes the response for `request_id`, if published.
    async fn take_response(&self, request_id: &str) -> Result<Option<Response>, ClientError> {
        let mailbox = Arc::clone(&self.responses);
        let id = request_id.to_string();
        run_blocking(move || take(mailbox.as_ref(), &id)).await?
    }

    /// Deletes our own request if the processor has not claimed it yet.
    async fn withdraw(&self, request_id: &str) -> Result<bool, ClientError> {
        let mailbox = Arc::clone(&self.requests);
        let id = request_id.to_string();
        let withdrawn = run_blocking(move || -> Result<bool, ChannelError> {
            match mailbox.claim(&ready_entry(&id))? {
                ClaimOutcome::Claimed(claim) => mailbox.ack(claim).map(|()| true),
                ClaimOutcome::Lost => Ok(false),
            }
        })
        .await??;
        Ok(withdrawn)
    }
}

fn ready_entry(id: &str) -> Entry {
    Entry {
        id: id.to_string(),
        modified: SystemTime::now(),
    }
}

/// Acks only a response that decodes; anything else goes back to the mailbox.
fn take(mailbox: &dyn Mailbox, id: &str) -> Result<Option<Response>, ClientError> {
    let claim: Claim = match mailbox.claim(&ready_entry(id))? {
        ClaimOutcome::Claimed(claim) => claim,
        ClaimOutcome::Lost => return Ok(None),
    };
    let decoded = mailbox
        .read(&claim)
        .map_err(ClientError::from)
        .and_then(|body| {
            Response::decode(&body).map_err(|e| ClientError::Decode {
                request_id: id.to_string(),
                message: e.to_string(),
            })
        });
    match decoded {
        Ok(response) => {
            mailbox.ack(claim)?;
            Ok(Some(response))
        }
        Err(err) => {
            if let Err(requeue_err) = mailbox.requeue(claim) {
                warn!(request_id = id, error = %requeue_err, "could not return unusable response");
            }
            Err(err)
        }
    }
}

fn rows_affected(data: &Value) -> u64 {
    data.get("rows_affected").and_then(Value::as_u64).unwrap_or(0)
}

async fn run_blocking<T, F>(f: F) -> Result<T, ClientError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ClientError::Join(e.to_string()))
}

/// Keyed row helpers for one table.
pub struct Table<'a> {
    client: &'a SyncClient,
    name: String,
    primary_key: String,
}

impl Table<'_> {
    /// Key column used by [`get`](Self::get), [`update`](Self::update) and [`delete`](Self::delete).
    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self, key: impl Into<Value>) -> Row {
        let mut filter = Row::new();
        filter.insert(self.primary_key.clone(), key.into());
        filter
    }

    pub async fn insert(&self, values: Row) -> Result<Option<i64>, ClientError> {
        self.client.insert(self.name.clone(), values).await
    }

    pub async fn update(&self, key: impl Into<Value>, values: Row) -> Result<u64, ClientError> {
        self.client.update(self.name.clone(), values, self.key(key)).await
    }

    pub async fn delete(&self, key: impl Into<Value>) -> Result<u64, ClientError> {
        self.client.delete(self.name.clone(), self.key(key)).await
    }

    pub async fn get(&self, key: impl Into<Value>) -> Result<Option<Row>, ClientError> {
        self.client.find_one(self.name.clone(), self.key(key)).await
    }

    pub async fn all(&self) -> Result<Vec<Row>, ClientError> {
        self.client.find_all(self.name.clone(), Row::new()).await
    }

    pub async fn find(&self, filter: Row) -> Result<Vec<Row>, ClientError> {
        self.client.find_all(self.name.clone(), filter).await
    }

    pub async fn count(&self, filter: Row) -> Result<usize, ClientError> {
        self.client.count(self.name.clone(), filter).await
    }
}
