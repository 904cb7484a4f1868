//! Claim chain: cross-process exclusive ownership of named resources.
//!
//! Each resource has two files under `claims/`:
//! - `<stem>.claim`: the lock artifact (JSON [`Claim`]), created with
//!   exclusive-create semantics and removed on release or reclaim.
//! - `<stem>.guard`: an advisory lock held while a process inspects, creates,
//!   renews or removes the artifact.
//!
//! Every path that changes an artifact runs under its guard, and the OS drops
//! the guard of a dead process, so two live claims for one key cannot coexist.
//! A holder that stops renewing is treated as dead once `expires_at_ms` passes.

use crate::core::config::BoardConfig;
use crate::core::error::{BlockedError, BoardError};
use crate::core::lockfile::FileLock;
use crate::core::store::Store;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub resource_key: String,
    pub holder: String,
    pub token: String,
    pub acquired_at_ms: u64,
    pub expires_at_ms: u64,
}

impl Claim {
    pub fn is_live_at(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }

    pub fn is_live(&self) -> bool {
        self.is_live_at(time::now_epoch_millis())
    }
}

/// What the artifact on disk says.
enum Artifact {
    Missing,
    Valid(Claim),
    /// Present but undecodable; only its age is trustworthy.
    Corrupt { modified_ms: u64 },
}

enum Attempt {
    Acquired(Claim),
    Held(Claim),
}

pub struct ClaimChain {
    store: Store,
    config: BoardConfig,
}

impl ClaimChain {
    pub fn new(store: Store, config: BoardConfig) -> Self {
        Self { store, config }
    }

    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BoardError> {
        let store = Store::new(root);
        let config = BoardConfig::load(&store)?;
        Ok(Self::new(store, config))
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    /// Acquires `resource_key` for `agent_id`, waiting up to `timeout` while
    /// another live holder owns it.
    ///
    /// Re-claiming a resource the agent already holds renews the lease and keeps
    /// the token. Fails with [`BoardError::Blocked`] when the wait runs out.
    pub fn claim(
        &self,
        resource_key: &str,
        agent_id: &str,
        timeout: Duration,
    ) -> Result<Claim, BoardError> {
        validate_key(resource_key, agent_id)?;
        self.store.ensure_claims_dir()?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let held = match self.lock_guard(resource_key, remaining)? {
                Some(_guard) => match self.attempt(resource_key, agent_id)? {
                    Attempt::Acquired(claim) => return Ok(claim),
                    Attempt::Held(current) => current,
                },
                None => Claim {
                    resource_key: resource_key.to_string(),
                    holder: "unknown".to_string(),
                    token: String::new(),
                    acquired_at_ms: 0,
                    expires_at_ms: 0,
                },
            };

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    resource = resource_key,
                    agent = agent_id,
                    holder = %held.holder,
                    "claim blocked"
                );
                return Err(BoardError::Blocked(BlockedError {
                    resource: resource_key.to_string(),
                    holder: held.holder,
                    expires_at_ms: held.expires_at_ms,
                }));
            }
            std::thread::sleep(self.config.claim_poll().min(deadline - now));
        }
    }

    /// Single attempt, no waiting.
    pub fn try_claim(&self, resource_key: &str, agent_id: &str) -> Result<Claim, BoardError> {
        self.claim(resource_key, agent_id, Duration::ZERO)
    }

    /// Releases the claim if `agent_id` holds it. Returns `false` (and leaves the
    /// artifact alone) when someone else, or nobody, holds it.
    pub fn release(&self, resource_key: &str, agent_id: &str) -> Result<bool, BoardError> {
        validate_key(resource_key, agent_id)?;
        if !self.store.claims_dir().is_dir() {
            return Ok(false);
        }
        let _guard = self.require_guard(resource_key)?;
        let path = self.store.claim_path(resource_key);
        match read_artifact(&path)? {
            Artifact::Valid(current) if current.holder == agent_id => {
                remove_artifact(&path)?;
                debug!(resource = resource_key, agent = agent_id, "claim released");
                Ok(true)
            }
            Artifact::Valid(current) => {
                debug!(
                    resource = resource_key,
                    agent = agent_id,
                    holder = %current.holder,
                    "release ignored: not the holder"
                );
                Ok(false)
            }
            Artifact::Missing | Artifact::Corrupt { .. } => Ok(false),
        }
    }

    /// Extends the lease of a claim the caller still holds (same holder and token).
    pub fn renew(&self, claim: &Claim) -> Result<Claim, BoardError> {
        validate_key(&claim.resource_key, &claim.holder)?;
        self.store.ensure_claims_dir()?;
        let _guard = self.require_guard(&claim.resource_key)?;
        let path = self.store.claim_path(&claim.resource_key);
        match read_artifact(&path)? {
            Artifact::Valid(current)
                if current.holder == claim.holder && current.token == claim.token =>
            {
                let renewed = Claim {
                    expires_at_ms: time::now_epoch_millis().saturating_add(self.config.lease_ms),
                    ..current
                };
                self.replace_artifact(&path, &renewed)?;
                Ok(renewed)
            }
            _ => Err(BoardError::NotHolder {
                resource: claim.resource_key.clone(),
                agent_id: claim.holder.clone(),
            }),
        }
    }

    /// The recorded claim for `resource_key`, live or expired.
    pub fn inspect(&self, resource_key: &str) -> Result<Option<Claim>, BoardError> {
        match read_artifact(&self.store.claim_path(resource_key))? {
            Artifact::Valid(claim) => Ok(Some(claim)),
            Artifact::Missing | Artifact::Corrupt { .. } => Ok(None),
        }
    }

    /// Live claims, ordered by resource key.
    pub fn list(&self) -> Result<Vec<Claim>, BoardError> {
        let now = time::now_epoch_millis();
        let mut out: Vec<Claim> = self
            .artifact_paths()?
            .iter()
            .filter_map(|p| match read_artifact(p) {
                Ok(Artifact::Valid(claim)) if claim.is_live_at(now) => Some(claim),
                _ => None,
            })
            .collect();
        out.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        Ok(out)
    }

    /// Removes artifacts whose lease has run out. Returns how many were removed.
    pub fn reap_expired(&self) -> Result<usize, BoardError> {
        let mut reaped = 0;
        for path in self.artifact_paths()? {
            let Artifact::Valid(claim) = read_artifact(&path)? else {
                continue;
            };
            if claim.is_live() {
                continue;
            }
            let _guard = self.require_guard(&claim.resource_key)?;
            // Re-check under the guard; it may have been renewed or replaced.
            if let Artifact::Valid(current) = read_artifact(&path)? {
                if current.token == claim.token && !current.is_live() {
                    remove_artifact(&path)?;
                    reaped += 1;
                }
            }
        }
        Ok(reaped)
    }

    /// Acquires and wraps the claim in a guard that releases it on drop.
    pub fn acquire(
        &self,
        resource_key: &str,
        agent_id: &str,
        timeout: Duration,
    ) -> Result<ClaimGuard<'_>, BoardError> {
        let claim = self.claim(resource_key, agent_id, timeout)?;
        Ok(ClaimGuard {
            chain: self,
            claim,
            released: false,
        })
    }

    /// Runs `f` while holding `resource_key`, releasing afterwards either way.
    pub fn with_claim<F, R>(
        &self,
        resource_key: &str,
        agent_id: &str,
        timeout: Duration,
        f: F,
    ) -> Result<R, BoardError>
    where
        F: FnOnce(&Claim) -> Result<R, BoardError>,
    {
        let guard = self.acquire(resource_key, agent_id, timeout)?;
        let result = f(guard.claim());
        guard.release()?;
        result
    }

    fn lock_guard(
        &self,
        resource_key: &str,
        timeout: Duration,
    ) -> Result<Option<FileLock>, BoardError> {
        FileLock::acquire(
            &self.store.claim_guard_path(resource_key),
            timeout,
            self.config.claim_poll(),
        )
    }

    /// Guard for short maintenance sections (release, renew, reap).
    fn require_guard(&self, resource_key: &str) -> Result<FileLock, BoardError> {
        self.lock_guard(resource_key, self.config.claim_timeout())?
            .ok_or_else(|| {
                BoardError::Blocked(BlockedError {
                    resource: resource_key.to_string(),
                    holder: "unknown".to_string(),
                    expires_at_ms: 0,
                })
            })
    }

    /// One acquisition attempt. Caller holds the resource guard.
    fn attempt(&self, resource_key: &str, agent_id: &str) -> Result<Attempt, BoardError> {
        let path = self.store.claim_path(resource_key);
        let now = time::now_epoch_millis();
        let expires_at_ms = now.saturating_add(self.config.lease_ms);

        match read_artifact(&path)? {
            Artifact::Missing => {}
            Artifact::Valid(current) if current.is_live_at(now) => {
                if current.holder != agent_id {
                    return Ok(Attempt::Held(current));
                }
                let renewed = Claim {
                    expires_at_ms,
                    ..current
                };
                self.replace_artifact(&path, &renewed)?;
                debug!(resource = resource_key, agent = agent_id, "claim renewed");
                return Ok(Attempt::Acquired(renewed));
            }
            Artifact::Valid(stale) => {
                warn!(
                    resource = resource_key,
                    stale_holder = %stale.holder,
                    expired_at_ms = stale.expires_at_ms,
                    agent = agent_id,
                    "reclaiming expired claim"
                );
                remove_artifact(&path)?;
            }
            Artifact::Corrupt { modified_ms } => {
                let expires = modified_ms.saturating_add(self.config.lease_ms);
                if now < expires {
                    return Ok(Attempt::Held(Claim {
                        resource_key: resource_key.to_string(),
                        holder: "unknown".to_string(),
                        token: String::new(),
                        acquired_at_ms: modified_ms,
                        expires_at_ms: expires,
                    }));
                }
                warn!(
                    resource = resource_key,
                    agent = agent_id,
                    "reclaiming unreadable claim artifact"
                );
                remove_artifact(&path)?;
            }
        }

        let claim = Claim {
            resource_key: resource_key.to_string(),
            holder: agent_id.to_string(),
            token: time::new_event_id(),
            acquired_at_ms: now,
            expires_at_ms,
        };
        if !self.create_artifact(&path, &claim)? {
            // Only reachable if something bypassed the guard.
            return match read_artifact(&path)? {
                Artifact::Valid(current) => Ok(Attempt::Held(current)),
                _ => Err(BoardError::ValidationError(format!(
                    "claim artifact for '{}' appeared concurrently",
                    resource_key
                ))),
            };
        }
        debug!(resource = resource_key, agent = agent_id, token = %claim.token, "claim acquired");
        Ok(Attempt::Acquired(claim))
    }

    /// Exclusive create of a fully written artifact. `false` if one already exists.
    fn create_artifact(&self, path: &Path, claim: &Claim) -> Result<bool, BoardError> {
        let tmp = self.write_temp(path, claim)?;
        let linked = fs::hard_link(&tmp, path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => {
                debug!(error = %e, "hard link unavailable; falling back to create_new");
                let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
                    Err(e) => return Err(BoardError::IoError(e)),
                };
                file.write_all(&serde_json::to_vec(claim)?)
                    .map_err(BoardError::IoError)?;
                if self.config.fsync {
                    file.sync_data().map_err(BoardError::IoError)?;
                }
                Ok(true)
            }
        }
    }

    /// Atomic replace of an artifact this process already owns.
    fn replace_artifact(&self, path: &Path, claim: &Claim) -> Result<(), BoardError> {
        let tmp = self.write_temp(path, claim)?;
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            BoardError::IoError(e)
        })
    }

    fn write_temp(&self, path: &Path, claim: &Claim) -> Result<PathBuf, BoardError> {
        let tmp = path.with_extension(format!("{}.tmp", time::new_event_id()));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .map_err(BoardError::IoError)?;
        file.write_all(&serde_json::to_vec(claim)?)
            .map_err(BoardError::IoError)?;
        if self.config.fsync {
            file.sync_data().map_err(BoardError::IoError)?;
        }
        Ok(tmp)
    }

    fn artifact_paths(&self) -> Result<Vec<PathBuf>, BoardError> {
        let entries = match fs::read_dir(self.store.claims_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BoardError::IoError(e)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let path = entry.map_err(BoardError::IoError)?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("claim") {
                out.push(path);
            }
        }
        Ok(out)
    }
}

/// Holds a claim until dropped or explicitly released.
pub struct ClaimGuard<'a> {
    chain: &'a ClaimChain,
    claim: Claim,
    released: bool,
}

impl ClaimGuard<'_> {
    pub fn claim(&self) -> &Claim {
        &self.claim
    }

    pub fn renew(&mut self) -> Result<(), BoardError> {
        self.claim = self.chain.renew(&self.claim)?;
        Ok(())
    }

    pub fn release(mut self) -> Result<bool, BoardError> {
        self.released = true;
        self.chain
            .release(&self.claim.resource_key, &self.claim.holder)
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self
            .chain
            .release(&self.claim.resource_key, &self.claim.holder)
        {
            // Lease expiry reclaims it eventually.
            warn!(
                resource = %self.claim.resource_key,
                error = %e,
                "failed to release claim on drop"
            );
        }
    }
}

fn validate_key(resource_key: &str, agent_id: &str) -> Result<(), BoardError> {
    if resource_key.trim().is_empty() {
        return Err(BoardError::ValidationError("resource key must not be empty".into()));
    }
    if agent_id.trim().is_empty() {
        return Err(BoardError::ValidationError("agent id must not be empty".into()));
    }
    Ok(())
}

fn read_artifact(path: &Path) -> Result<Artifact, BoardError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Artifact::Missing),
        Err(e) => return Err(BoardError::IoError(e)),
    };
    match serde_json::from_slice::<Claim>(&bytes) {
        Ok(claim) => Ok(Artifact::Valid(claim)),
        Err(_) => {
            let modified_ms = fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or_else(time::now_epoch_millis);
            Ok(Artifact::Corrupt { modified_ms })
        }
    }
}

fn remove_artifact(path: &Path) -> Result<(), BoardError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BoardError::IoError(e)),
    }
}
