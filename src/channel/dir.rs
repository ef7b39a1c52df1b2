//! Shared-folder mailbox.
//!
//! Layout under the mailbox root:
//!
//! ```text
//! {id}.json               published, ready to claim
//! .{id}.{nonce}.tmp       publisher scratch file, never polled
//! .processing/{id}.json   claimed
//! .archive/{id}.json      acknowledged, kept until the retention sweep
//! .attempts/{id}          requeue counter of a ready entry
//! ```
//!
//! Publishing hard-links a fully written scratch file into place, which fails
//! when the id is already taken. Every later state change is a single `rename`
//! inside one directory tree, so a reader sees either the whole message or
//! nothing.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    time::SystemTime,
};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::is_request_id;

use super::{ChannelError, ChannelResult, Claim, ClaimOutcome, Entry, Mailbox, RetryPolicy};

const EXT: &str = "json";
const PROCESSING_DIR: &str = ".processing";
const ARCHIVE_DIR: &str = ".archive";
const ATTEMPTS_DIR: &str = ".attempts";

/// [`Mailbox`] over a directory, usually on a network share.
#[derive(Debug, Clone)]
pub struct DirMailbox {
    root: PathBuf,
    processing: PathBuf,
    archive: Option<PathBuf>,
    attempts: PathBuf,
    retry: RetryPolicy,
}

impl DirMailbox {
    /// Opens the mailbox at `root`, creating its directories when missing.
    pub fn open(root: impl AsRef<Path>) -> ChannelResult<Self> {
        let root = root.as_ref().to_path_buf();
        let mailbox = Self {
            processing: root.join(PROCESSING_DIR),
            archive: None,
            attempts: root.join(ATTEMPTS_DIR),
            root,
            retry: RetryPolicy::default(),
        };
        for dir in [&mailbox.root, &mailbox.processing, &mailbox.attempts] {
            mailbox.retry.run(dir, || fs::create_dir_all(dir))?;
        }
        Ok(mailbox)
    }

    /// Moves acknowledged entries to `.archive/` instead of deleting them.
    pub fn with_archive(mut self) -> ChannelResult<Self> {
        let archive = self.root.join(ARCHIVE_DIR);
        self.retry.run(&archive, || fs::create_dir_all(&archive))?;
        self.archive = Some(archive);
        Ok(self)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ready_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.{EXT}"))
    }

    fn claim_path(&self, id: &str) -> PathBuf {
        self.processing.join(format!("{id}.{EXT}"))
    }

    fn archive_path(&self, id: &str) -> Option<PathBuf> {
        self.archive.as_ref().map(|dir| dir.join(format!("{id}.{EXT}")))
    }

    fn attempts_path(&self, id: &str) -> PathBuf {
        self.attempts.join(id)
    }

    fn check_id(id: &str) -> ChannelResult<()> {
        if is_request_id(id) {
            Ok(())
        } else {
            Err(ChannelError::InvalidIdentifier(id.to_string()))
        }
    }

    fn exists(&self, path: &Path) -> ChannelResult<bool> {
        self.retry.run(path, || path.try_exists())
    }

    fn read_attempts(&self, id: &str) -> u32 {
        fs::read_to_string(self.attempts_path(id))
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    }

    fn write_temp(&self, id: &str, body: &[u8]) -> io::Result<PathBuf> {
        let tmp = self
            .root
            .join(format!(".{id}.{}.tmp", Uuid::new_v4().simple()));
        let written = File::create(&tmp).and_then(|mut file| {
            file.write_all(body)?;
            file.sync_all()
        });
        match written {
            Ok(()) => Ok(tmp),
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                Err(err)
            }
        }
    }

    /// Ids and modification times of the `.json` files directly inside `dir`.
    fn list(&self, dir: &Path) -> ChannelResult<Vec<Entry>> {
        let read = self.retry.run(dir, || fs::read_dir(dir))?;
        let mut out = Vec::new();
        for item in read {
            let item = match item {
                Ok(item) => item,
                Err(err) => {
                    debug!(dir = %dir.display(), error = %err, "skipping unreadable directory entry");
                    continue;
                }
            };
            let path = item.path();
            let Some(id) = stem_id(&path) else { continue };
            // A concurrent claim can move the file between listing and stat.
            let modified = match item.metadata().and_then(|m| {
                if m.is_file() {
                    m.modified()
                } else {
                    Err(io::Error::from(io::ErrorKind::NotFound))
                }
            }) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            out.push(Entry { id, modified });
        }
        Ok(out)
    }

    fn remove_older(&self, dir: &Path, cutoff: SystemTime, pick: impl Fn(&str) -> bool) -> usize {
        let Ok(read) = fs::read_dir(dir) else {
            return 0;
        };
        let mut removed = 0;
        for item in read.flatten() {
            let name = item.file_name();
            let Some(name) = name.to_str() else { continue };
            if !pick(name) {
                continue;
            }
            let old = item
                .metadata()
                .and_then(|m| m.modified())
                .map(|t| t < cutoff)
                .unwrap_or(false);
            if old {
                match fs::remove_file(item.path()) {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => warn!(path = %item.path().display(), error = %err, "sweep could not remove file"),
                }
            }
        }
        removed
    }
}

impl Mailbox for DirMailbox {
    fn publish(&self, id: &str, body: &[u8]) -> ChannelResult<()> {
        Self::check_id(id)?;
        let target = self.ready_path(id);
        let mut taken = vec![target.clone(), self.claim_path(id)];
        taken.extend(self.archive_path(id));
        for path in &taken {
            if self.exists(path)? {
                return Err(ChannelError::DuplicateIdentifier(id.to_string()));
            }
        }

        let tmp = self.retry.run(&self.root, || self.write_temp(id, body))?;
        // The link fails if the target exists, so concurrent publishers of one id get one winner.
        let linked = self.retry.run_io(|| fs::hard_link(&tmp, &target));
        if let Err(err) = fs::remove_file(&tmp) {
            debug!(path = %tmp.display(), error = %err, "could not remove publish scratch file");
        }
        match linked {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(ChannelError::DuplicateIdentifier(id.to_string()));
            }
            Err(source) => return Err(ChannelError::Io { path: target, source }),
        }
        debug!(mailbox = %self.root.display(), id, bytes = body.len(), "published");
        Ok(())
    }

    fn poll(&self) -> ChannelResult<Vec<Entry>> {
        let mut entries = self.list(&self.root)?;
        entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    fn claim(&self, entry: &Entry) -> ChannelResult<ClaimOutcome> {
        Self::check_id(&entry.id)?;
        let from = self.ready_path(&entry.id);
        let to = self.claim_path(&entry.id);
        match self.retry.run_io(|| fs::rename(&from, &to)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(id = %entry.id, "claim lost");
                return Ok(ClaimOutcome::Lost);
            }
            Err(source) => return Err(ChannelError::Io { path: from, source }),
        }

        let claimed_at = SystemTime::now();
        // Rename keeps the publish mtime; the stuck-claim sweep measures from the claim.
        if let Err(err) = File::options()
            .write(true)
            .open(&to)
            .and_then(|f| f.set_modified(claimed_at))
        {
            warn!(id = %entry.id, error = %err, "could not stamp claim time");
        }
        Ok(ClaimOutcome::Claimed(Claim {
            id: entry.id.clone(),
            attempt: self.read_attempts(&entry.id),
            claimed_at,
        }))
    }

    fn read(&self, claim: &Claim) -> ChannelResult<Vec<u8>> {
        let path = self.claim_path(&claim.id);
        self.retry.run(&path, || fs::read(&path))
    }

    fn ack(&self, claim: Claim) -> ChannelResult<()> {
        let path = self.claim_path(&claim.id);
        let done = match self.archive_path(&claim.id) {
            Some(dest) => self.retry.run_io(|| fs::rename(&path, &dest)).map(|()| {
                if let Err(err) = File::options()
                    .write(true)
                    .open(&dest)
                    .and_then(|f| f.set_modified(SystemTime::now()))
                {
                    debug!(id = %claim.id, error = %err, "could not stamp archive time");
                }
            }),
            None => self.retry.run_io(|| fs::remove_file(&path)),
        };
        match done {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(id = %claim.id, "claim already gone at ack");
            }
            Err(source) => return Err(ChannelError::Io { path, source }),
        }
        match fs::remove_file(self.attempts_path(&claim.id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ChannelError::Io {
                path: self.attempts_path(&claim.id),
                source,
            }),
        }
    }

    fn requeue(&self, claim: Claim) -> ChannelResult<()> {
        let marker = self.attempts_path(&claim.id);
        let next = claim.attempt.saturating_add(1).to_string();
        self.retry.run(&marker, || fs::write(&marker, next.as_bytes()))?;
        let from = self.claim_path(&claim.id);
        let to = self.ready_path(&claim.id);
        self.retry.run(&from, || fs::rename(&from, &to))?;
        debug!(id = %claim.id, attempt = claim.attempt + 1, "requeued");
        Ok(())
    }

    fn claims(&self) -> ChannelResult<Vec<Claim>> {
        let mut claims: Vec<Claim> = self
            .list(&self.processing)?
            .into_iter()
            .map(|entry| Claim {
                attempt: self.read_attempts(&entry.id),
                id: entry.id,
                claimed_at: entry.modified,
            })
            .collect();
        claims.sort_by(|a, b| a.claimed_at.cmp(&b.claimed_at));
        Ok(claims)
    }

    fn sweep(&self, cutoff: SystemTime) -> ChannelResult<usize> {
        let mut removed = self.remove_older(&self.root, cutoff, |name| {
            (!name.starts_with('.') && name.ends_with(".json")) || is_temp_name(name)
        });
        if let Some(archive) = &self.archive {
            removed += self.remove_older(archive, cutoff, |name| name.ends_with(".json"));
        }
        // Markers only matter while their entry is ready or claimed.
        removed += self.remove_older(&self.attempts, cutoff, |id| {
            !self.ready_path(id).exists() && !self.claim_path(id).exists()
        });
        if removed > 0 {
            debug!(mailbox = %self.root.display(), removed, "swept");
        }
        Ok(removed)
    }

    fn sweep_claims(&self, cutoff: SystemTime) -> ChannelResult<usize> {
        let removed = self.remove_older(&self.processing, cutoff, |name| name.ends_with(".json"));
        if removed > 0 {
            debug!(mailbox = %self.root.display(), removed, "dropped abandoned claims");
        }
        Ok(removed)
    }
}

fn stem_id(path: &Path) -> Option<String> {
    if path.extension()? != EXT {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    is_request_id(stem).then(|| stem.to_string())
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}
