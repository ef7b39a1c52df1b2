//! Rendezvous channel abstraction.
//!
//! A [`Mailbox`] is a one-directional message drop: many publishers, and
//! readers that take exclusive ownership of an entry through [`Mailbox::claim`]
//! before reading it. [`dir::DirMailbox`] implements it over a shared folder.

pub mod dir;

use std::{
    io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, SystemTime},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("mailbox I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("identifier `{0}` is already present in the mailbox")]
    DuplicateIdentifier(String),
    #[error("`{0}` is not a valid mailbox identifier")]
    InvalidIdentifier(String),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// A fully published message visible to pollers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Message identifier (the request id).
    pub id: String,
    /// Last modification time of the published artifact.
    pub modified: SystemTime,
}

/// Exclusive ownership of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub id: String,
    /// How many times the entry was requeued before this claim.
    pub attempt: u32,
    pub claimed_at: SystemTime,
}

/// Result of racing for an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller now owns the entry.
    Claimed(Claim),
    /// Someone else moved the entry first. Not an error.
    Lost,
}

/// Durable, atomic message drop.
///
/// Publishers never expose partially written messages: an entry appears in
/// [`poll`](Mailbox::poll) only once its body is complete.
pub trait Mailbox: Send + Sync {
    /// Makes `body` visible under `id`. Fails with
    /// [`ChannelError::DuplicateIdentifier`] if `id` is pending, claimed or archived.
    fn publish(&self, id: &str, body: &[u8]) -> ChannelResult<()>;

    /// Ready entries in discovery order. No global ordering across publishers.
    fn poll(&self) -> ChannelResult<Vec<Entry>>;

    /// Moves `entry` into the processing namespace.
    fn claim(&self, entry: &Entry) -> ChannelResult<ClaimOutcome>;

    /// Body of a claimed entry.
    fn read(&self, claim: &Claim) -> ChannelResult<Vec<u8>>;

    /// Finishes a claim: the entry is deleted or archived and never polled again.
    fn ack(&self, claim: Claim) -> ChannelResult<()>;

    /// Returns a claimed entry to the ready set with its attempt count bumped.
    fn requeue(&self, claim: Claim) -> ChannelResult<()>;

    /// Every outstanding claim, including ones held by crashed owners.
    fn claims(&self) -> ChannelResult<Vec<Claim>>;

    /// Removes ready and archived entries last modified before `cutoff`.
    /// Claims are left alone. Returns the number of artifacts removed.
    fn sweep(&self, cutoff: SystemTime) -> ChannelResult<usize>;

    /// Deletes claims taken before `cutoff` without answering them. Only for
    /// mailboxes whose readers keep no state beyond the claim, such as
    /// clients consuming responses. Returns the number of claims removed.
    fn sweep_claims(&self, cutoff: SystemTime) -> ChannelResult<usize>;
}

/// Bounded retry with fixed backoff for transient filesystem failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first one. Zero is treated as one.
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Runs `op`, retrying transient errors. Permanent errors (`NotFound`,
    /// `AlreadyExists`, ...) are returned on the first occurrence.
    pub fn run_io<T>(&self, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        let attempts = self.attempts.max(1);
        let mut tried = 0;
        loop {
            tried += 1;
            match op() {
                Ok(v) => return Ok(v),
                Err(err) if tried < attempts && is_transient(&err) => {
                    tracing::debug!(error = %err, tried, "transient mailbox I/O failure, retrying");
                    thread::sleep(self.backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Like [`run_io`](Self::run_io), escalating the final error as
    /// [`ChannelError::Io`] for `path`.
    pub fn run<T>(&self, path: &Path, op: impl FnMut() -> io::Result<T>) -> ChannelResult<T> {
        self.run_io(op).map_err(|source| ChannelError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn is_transient(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::NotFound
            | io::ErrorKind::AlreadyExists
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::InvalidData
            | io::ErrorKind::Unsupported
    )
}
