use crate::config::SyncPolicy;
use crate::engine::{self, ConflictChoice, Outcome};
use crate::error::{RemoteError, SyncError};
use crate::model::{Snapshot, SnapshotSummary, SyncMetadata};
use crate::remote::{RemoteSnapshot, RemoteStore, VersionToken};
use crate::store::LocalStore;
use crate::validate::validate_snapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Syncing,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Syncing => write!(f, "syncing"),
            Phase::Error => write!(f, "error"),
        }
    }
}

/// The presentation layer, as seen from the orchestrator.
#[async_trait]
pub trait SyncObserver: Send + Sync {
    fn on_status(&self, phase: Phase, message: &str);

    fn on_merge_result(&self, outcome: Outcome, snapshot: &Snapshot);

    /// Ask how to settle diverged local and remote state.
    async fn on_conflict(&self, remote: &SnapshotSummary, local: &SnapshotSummary) -> ConflictChoice;
}

/// Observer that only logs, answering every conflict with a fixed choice.
#[derive(Debug, Clone, Copy)]
pub struct LogObserver {
    pub choice: ConflictChoice,
}

impl Default for LogObserver {
    fn default() -> Self {
        LogObserver {
            choice: ConflictChoice::Defer,
        }
    }
}

#[async_trait]
impl SyncObserver for LogObserver {
    fn on_status(&self, phase: Phase, message: &str) {
        tracing::info!(%phase, "{message}");
    }

    fn on_merge_result(&self, outcome: Outcome, snapshot: &Snapshot) {
        tracing::info!(%outcome, summary = %snapshot.summary(), "pull finished");
    }

    async fn on_conflict(&self, remote: &SnapshotSummary, local: &SnapshotSummary) -> ConflictChoice {
        tracing::warn!(%remote, %local, choice = %self.choice, "conflict resolved by policy");
        self.choice
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PullReport {
    /// Another sync was already running.
    Skipped,
    /// Local data changed while the remote was being read or while a
    /// conflict choice was pending; nothing applied.
    Superseded,
    Applied {
        outcome: Outcome,
        choice: Option<ConflictChoice>,
        pushed: Option<PushReport>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushReport {
    Skipped,
    /// Nothing unsynced.
    Clean,
    Pushed {
        attempts: u32,
        /// Remote changes were merged in before the write.
        merged: bool,
        /// Invalid records left out of the upload.
        dropped: usize,
        token: VersionToken,
    },
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives pulls and pushes between the local store and the remote document.
/// At most one sync runs at a time; triggers arriving meanwhile are skipped.
pub struct Syncer {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    observer: Arc<dyn SyncObserver>,
    policy: SyncPolicy,
    in_flight: AtomicBool,
    online: AtomicBool,
}

impl Syncer {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        observer: Arc<dyn SyncObserver>,
        policy: SyncPolicy,
    ) -> Self {
        Syncer {
            store,
            remote,
            observer,
            policy,
            in_flight: AtomicBool::new(false),
            online: AtomicBool::new(true),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn try_begin(&self) -> Option<InFlight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(&self.in_flight))
    }

    fn ensure_online(&self) -> Result<(), SyncError> {
        if self.is_online() {
            Ok(())
        } else {
            self.observer.on_status(Phase::Error, "Offline");
            Err(SyncError::Offline)
        }
    }

    fn report<T>(&self, result: &Result<T, SyncError>, failure: &str) {
        match result {
            Ok(_) => self.observer.on_status(Phase::Idle, "Connected"),
            Err(e) => {
                tracing::error!(error = %e, "{failure}");
                self.observer.on_status(Phase::Error, &format!("{failure}: {e}"));
            }
        }
    }

    /// Bound a remote call by the configured request timeout.
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        let limit = self.policy.request_timeout();
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(RemoteError::Timeout(limit)))
    }

    async fn backoff(&self, attempt: u32, error: &RemoteError) {
        let delay = self.policy.backoff(attempt);
        tracing::warn!(
            attempt = attempt + 1,
            max = self.policy.max_retries,
            ?delay,
            %error,
            "retrying"
        );
        self.observer.on_status(
            Phase::Syncing,
            &format!("Retrying ({}/{})...", attempt + 1, self.policy.max_retries),
        );
        tokio::time::sleep(delay).await;
    }

    // --- Triggers ---

    /// Application start: pull if online.
    pub async fn on_start(&self) -> Result<PullReport, SyncError> {
        if !self.is_online() {
            self.observer.on_status(Phase::Error, "Offline");
            return Ok(PullReport::Skipped);
        }
        self.pull().await
    }

    /// Explicit "open": fetch remote and reconcile.
    pub async fn open(&self) -> Result<PullReport, SyncError> {
        self.pull().await
    }

    /// Explicit "save": push local state even when not dirty.
    pub async fn save(&self) -> Result<PushReport, SyncError> {
        let Some(_guard) = self.try_begin() else {
            tracing::debug!("save skipped, sync in flight");
            return Ok(PushReport::Skipped);
        };
        self.ensure_online()?;
        self.observer.on_status(Phase::Syncing, "Syncing...");
        let result = self.push_inner(true).await;
        self.report(&result, "Sync failed");
        result
    }

    pub async fn pull(&self) -> Result<PullReport, SyncError> {
        let Some(_guard) = self.try_begin() else {
            tracing::debug!("pull skipped, sync in flight");
            return Ok(PullReport::Skipped);
        };
        self.ensure_online()?;
        self.observer.on_status(Phase::Syncing, "Loading...");
        let result = self.pull_inner().await;
        self.report(&result, "Load failed");
        result
    }

    /// Push only if local has unsynced changes. Used by the debounce timer.
    pub async fn push_if_dirty(&self) -> Result<PushReport, SyncError> {
        let Some(_guard) = self.try_begin() else {
            return Ok(PushReport::Skipped);
        };
        self.ensure_online()?;
        self.observer.on_status(Phase::Syncing, "Syncing...");
        let result = self.push_inner(false).await;
        self.report(&result, "Sync failed");
        result
    }

    /// Periodic tick: pull, then push if still dirty. Does nothing offline.
    pub async fn tick(&self) -> Result<PullReport, SyncError> {
        if !self.is_online() {
            return Ok(PullReport::Skipped);
        }
        self.pull_then_push().await
    }

    /// Network came back: pull the latest, then push local changes.
    pub async fn on_reconnect(&self) -> Result<PullReport, SyncError> {
        self.online.store(true, Ordering::Release);
        tracing::info!("connection restored");
        self.pull_then_push().await
    }

    pub fn on_offline(&self) {
        self.online.store(false, Ordering::Release);
        tracing::info!("connection lost");
        self.observer.on_status(Phase::Error, "Offline");
    }

    async fn pull_then_push(&self) -> Result<PullReport, SyncError> {
        let Some(_guard) = self.try_begin() else {
            tracing::debug!("sync skipped, already in flight");
            return Ok(PullReport::Skipped);
        };
        self.observer.on_status(Phase::Syncing, "Syncing...");
        let result: Result<PullReport, SyncError> = async {
            let mut report = self.pull_inner().await?;
            if let PullReport::Applied { pushed, .. } = &mut report {
                if pushed.is_none() && self.store.read_metadata()?.dirty {
                    *pushed = Some(self.push_inner(false).await?);
                }
            }
            Ok(report)
        }
        .await;
        self.report(&result, "Sync failed");
        result
    }

    // --- Pull protocol ---

    async fn fetch_with_retry(&self) -> Result<Option<RemoteSnapshot>, SyncError> {
        let mut attempt = 0;
        loop {
            match self.call(self.remote.fetch_snapshot()).await {
                Ok(remote) => return Ok(Some(remote)),
                Err(RemoteError::NotFound) => {
                    tracing::info!("remote document not found, will create on first write");
                    return Ok(None);
                }
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    self.backoff(attempt, &e).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn pull_inner(&self) -> Result<PullReport, SyncError> {
        let before = self.store.read_metadata()?;
        let local = self.store.snapshot()?;
        let fetched = self.fetch_with_retry().await?;

        let mut meta = self.store.read_metadata()?;
        if meta.last_modified != before.last_modified {
            tracing::warn!("local data changed during pull, not applying remote");
            return Ok(PullReport::Superseded);
        }

        let rec = engine::reconcile(fetched.as_ref().map(|f| &f.snapshot), &local, &meta);
        let mut choice = None;
        let mut pushed = None;
        let mut result = rec.result;

        match (rec.outcome, fetched) {
            (Outcome::IdenticalContent, Some(remote)) => {
                meta.mark_synced(remote.snapshot.last_updated, Some(remote.token));
                self.store.write_metadata(&meta)?;
            }
            (Outcome::AutoAdoptRemote, Some(remote)) => {
                self.store.apply_snapshot(&remote.snapshot)?;
                meta.mark_synced(remote.snapshot.last_updated, Some(remote.token));
                self.store.write_metadata(&meta)?;
            }
            (Outcome::Conflict, Some(remote)) => {
                let picked = self
                    .observer
                    .on_conflict(&remote.snapshot.summary(), &local.summary())
                    .await;
                tracing::info!(choice = %picked, "conflict resolved");
                let meta = self.store.read_metadata()?;
                if meta.last_modified != before.last_modified {
                    tracing::warn!("local data changed while choosing, not applying remote");
                    return Ok(PullReport::Superseded);
                }
                choice = Some(picked);
                let (applied, push) = self.apply_choice(picked, remote, &local, meta)?;
                result = applied;
                if push {
                    pushed = Some(self.push_inner(false).await?);
                }
            }
            _ => {}
        }

        self.observer.on_merge_result(rec.outcome, &result);
        Ok(PullReport::Applied {
            outcome: rec.outcome,
            choice,
            pushed,
        })
    }

    /// Apply a conflict choice locally. Choices that keep local data still
    /// acknowledge the remote version, so the next write replaces it instead
    /// of prompting again.
    fn apply_choice(
        &self,
        choice: ConflictChoice,
        remote: RemoteSnapshot,
        local: &Snapshot,
        mut meta: SyncMetadata,
    ) -> Result<(Snapshot, bool), SyncError> {
        let resolution = engine::resolve_conflict(choice, &remote.snapshot, local);
        if let Some(ref snapshot) = resolution.apply {
            self.store.apply_snapshot(snapshot)?;
        }
        if resolution.dirty {
            meta.last_sync_timestamp = Some(remote.snapshot.last_updated);
            meta.version_token = Some(remote.token);
            meta.dirty = true;
        } else {
            meta.mark_synced(remote.snapshot.last_updated, Some(remote.token));
        }
        self.store.write_metadata(&meta)?;
        let push = resolution.push;
        Ok((resolution.apply.unwrap_or_else(|| local.clone()), push))
    }

    // --- Push protocol ---

    async fn push_inner(&self, force: bool) -> Result<PushReport, SyncError> {
        let before = self.store.read_metadata()?;
        if !before.dirty && !force {
            return Ok(PushReport::Clean);
        }

        let local = self.store.snapshot()?;
        self.store.push_backup(&local, self.policy.backup_retention)?;
        let (mut candidate, failures) = validate_snapshot(&local);
        if let Some(last) = before.last_sync_timestamp {
            stamp_after(&mut candidate, last);
        }

        let mut token = before.version_token.clone();
        // Without a known token, read the current one before writing.
        let mut need_fetch = token.is_none();
        let mut merged = false;
        let mut attempt: u32 = 0;

        let new_token = loop {
            let step = self
                .push_attempt(&mut candidate, &mut token, &mut need_fetch, &mut merged)
                .await;
            let error = match step {
                Ok(new_token) => break new_token,
                Err(e @ (RemoteError::VersionConflict | RemoteError::Unavailable(_) | RemoteError::Timeout(_))) => e,
                Err(e) => {
                    self.store.write_failure_backup(&candidate)?;
                    return Err(e.into());
                }
            };
            if error == RemoteError::VersionConflict {
                need_fetch = true;
            }
            if attempt >= self.policy.max_retries {
                tracing::error!(attempts = attempt + 1, %error, "giving up on remote write");
                self.store.write_failure_backup(&candidate)?;
                return Err(SyncError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: error,
                });
            }
            self.backoff(attempt, &error).await;
            attempt += 1;
        };

        // Remote records merged in during the loop go to local data too.
        if merged {
            let current = self.store.snapshot()?;
            self.store
                .apply_snapshot(&engine::merge_into_local(&candidate, &current))?;
        }
        let mut meta = self.store.read_metadata()?;
        if meta.last_modified != before.last_modified {
            // Edited while uploading: keep those edits and stay dirty.
            tracing::warn!("local data changed during push, staying dirty");
            meta.last_sync_timestamp = Some(candidate.last_updated);
            meta.version_token = Some(new_token.clone());
        } else {
            meta.mark_synced(candidate.last_updated, Some(new_token.clone()));
        }
        self.store.write_metadata(&meta)?;
        tracing::info!(attempts = attempt + 1, merged, dropped = failures.len(), "pushed to remote");

        Ok(PushReport::Pushed {
            attempts: attempt + 1,
            merged,
            dropped: failures.len(),
            token: new_token,
        })
    }

    /// One write attempt, re-reading and merging the remote first when the
    /// previous attempt lost a version race.
    async fn push_attempt(
        &self,
        candidate: &mut Snapshot,
        token: &mut Option<VersionToken>,
        need_fetch: &mut bool,
        merged: &mut bool,
    ) -> Result<VersionToken, RemoteError> {
        if *need_fetch {
            match self.call(self.remote.fetch_snapshot()).await {
                Ok(remote) => {
                    *candidate = engine::merge_for_upload(&remote.snapshot, candidate, Utc::now());
                    stamp_after(candidate, remote.snapshot.last_updated);
                    *token = Some(remote.token);
                    *merged = true;
                }
                Err(RemoteError::NotFound) => *token = None,
                Err(e) => return Err(e),
            }
            *need_fetch = false;
        }
        self.call(self.remote.write_snapshot(candidate, token.as_deref()))
            .await
    }
}

/// Keep `lastUpdated` of a written document strictly ahead of the version it
/// replaces, so other devices see it as newer even across clock skew.
fn stamp_after(snapshot: &mut Snapshot, floor: DateTime<Utc>) {
    if snapshot.last_updated <= floor {
        snapshot.last_updated = floor + chrono::Duration::milliseconds(1);
    }
}

/// Status line in the style of the sync indicator: configuration, then
/// connectivity, then recency of the last sync.
pub fn describe_status(
    meta: &SyncMetadata,
    configured: bool,
    online: bool,
    now: DateTime<Utc>,
) -> (Phase, String) {
    if !configured {
        return (Phase::Error, "Not configured".to_string());
    }
    if !online {
        return (Phase::Error, "Offline".to_string());
    }
    match meta.last_sync_at {
        Some(at) => {
            let minutes = (now - at).num_minutes();
            if minutes < 5 {
                (Phase::Idle, "Connected".to_string())
            } else {
                (Phase::Syncing, format!("{minutes}m ago"))
            }
        }
        None => (Phase::Syncing, "Never synced".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn status_unconfigured_first() {
        let meta = SyncMetadata::new("device_x".to_string());
        let (phase, msg) = describe_status(&meta, false, false, Utc::now());
        assert_eq!(phase, Phase::Error);
        assert_eq!(msg, "Not configured");
    }

    #[test]
    fn status_offline() {
        let meta = SyncMetadata::new("device_x".to_string());
        assert_eq!(
            describe_status(&meta, true, false, Utc::now()).1,
            "Offline"
        );
    }

    #[test]
    fn status_recency() {
        let now = Utc::now();
        let mut meta = SyncMetadata::new("device_x".to_string());
        assert_eq!(describe_status(&meta, true, true, now).1, "Never synced");

        meta.last_sync_at = Some(now - Duration::minutes(2));
        assert_eq!(
            describe_status(&meta, true, true, now),
            (Phase::Idle, "Connected".to_string())
        );

        meta.last_sync_at = Some(now - Duration::minutes(12));
        assert_eq!(
            describe_status(&meta, true, true, now),
            (Phase::Syncing, "12m ago".to_string())
        );
    }
}
