use crate::error::RemoteError;
use crate::id::content_hash;
use crate::model::Snapshot;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Opaque compare-and-swap token of the remote document (a content hash).
pub type VersionToken = String;

/// A fetched remote document together with the token needed to replace it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
    pub snapshot: Snapshot,
    pub token: VersionToken,
}

/// The single JSON document held by the remote file host.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fails with [`RemoteError::NotFound`] when no document exists yet.
    async fn fetch_snapshot(&self) -> Result<RemoteSnapshot, RemoteError>;

    /// Replace the document. `expected` must match the current token; pass
    /// `None` only to create the document for the first time.
    async fn write_snapshot(
        &self,
        snapshot: &Snapshot,
        expected: Option<&str>,
    ) -> Result<VersionToken, RemoteError>;

    /// Human-readable location, for status output.
    fn describe(&self) -> String;
}

#[derive(Debug, Default)]
struct MemoryState {
    document: Option<(String, VersionToken)>,
    fetch_failures: VecDeque<RemoteError>,
    write_failures: VecDeque<RemoteError>,
    fetches: usize,
    writes: usize,
    delay: Option<Duration>,
}

/// In-process remote with the same compare-and-swap rules as the real host.
/// Failures can be scripted to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        MemoryRemote::default()
    }

    pub fn with_snapshot(snapshot: &Snapshot) -> Self {
        let remote = MemoryRemote::new();
        remote.put(snapshot);
        remote
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Overwrite the document unconditionally, as another device would.
    pub fn put(&self, snapshot: &Snapshot) -> VersionToken {
        let json = serde_json::to_string_pretty(snapshot).unwrap_or_default();
        let token = content_hash(json.as_bytes());
        self.lock().document = Some((json, token.clone()));
        token
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        let state = self.lock();
        let (json, _) = state.document.as_ref()?;
        serde_json::from_str(json).ok()
    }

    pub fn token(&self) -> Option<VersionToken> {
        self.lock().document.as_ref().map(|(_, token)| token.clone())
    }

    pub fn fail_next_fetch(&self, error: RemoteError) {
        self.lock().fetch_failures.push_back(error);
    }

    pub fn fail_next_write(&self, error: RemoteError) {
        self.lock().write_failures.push_back(error);
    }

    /// Make every call wait this long before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    async fn wait(&self) {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_snapshot(&self) -> Result<RemoteSnapshot, RemoteError> {
        self.wait().await;
        let mut state = self.lock();
        state.fetches += 1;
        if let Some(error) = state.fetch_failures.pop_front() {
            return Err(error);
        }
        let (json, token) = state.document.as_ref().ok_or(RemoteError::NotFound)?;
        let snapshot =
            serde_json::from_str(json).map_err(|e| RemoteError::Malformed(e.to_string()))?;
        Ok(RemoteSnapshot {
            snapshot,
            token: token.clone(),
        })
    }

    async fn write_snapshot(
        &self,
        snapshot: &Snapshot,
        expected: Option<&str>,
    ) -> Result<VersionToken, RemoteError> {
        self.wait().await;
        let mut state = self.lock();
        state.writes += 1;
        if let Some(error) = state.write_failures.pop_front() {
            return Err(error);
        }
        let current = state.document.as_ref().map(|(_, token)| token.as_str());
        if current != expected {
            return Err(RemoteError::VersionConflict);
        }
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| RemoteError::Malformed(e.to_string()))?;
        let token = content_hash(json.as_bytes());
        state.document = Some((json, token.clone()));
        Ok(token)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::epoch;

    #[tokio::test]
    async fn fetch_empty_is_not_found() {
        let remote = MemoryRemote::new();
        assert_eq!(
            remote.fetch_snapshot().await.unwrap_err(),
            RemoteError::NotFound
        );
    }

    #[tokio::test]
    async fn create_requires_no_token() {
        let remote = MemoryRemote::new();
        let snap = Snapshot::new(epoch(), None);
        assert_eq!(
            remote.write_snapshot(&snap, Some("stale")).await.unwrap_err(),
            RemoteError::VersionConflict
        );
        let token = remote.write_snapshot(&snap, None).await.unwrap();
        assert_eq!(remote.token(), Some(token));
    }

    #[tokio::test]
    async fn write_with_stale_token_conflicts() {
        let snap = Snapshot::new(epoch(), Some("device_a".to_string()));
        let remote = MemoryRemote::with_snapshot(&snap);
        let fetched = remote.fetch_snapshot().await.unwrap();
        assert_eq!(fetched.snapshot, snap);

        let other = Snapshot::new(epoch(), Some("device_b".to_string()));
        remote.put(&other);
        assert_eq!(
            remote
                .write_snapshot(&snap, Some(&fetched.token))
                .await
                .unwrap_err(),
            RemoteError::VersionConflict
        );
        // Existing document cannot be blindly overwritten either
        assert_eq!(
            remote.write_snapshot(&snap, None).await.unwrap_err(),
            RemoteError::VersionConflict
        );
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let remote = MemoryRemote::with_snapshot(&Snapshot::new(epoch(), None));
        remote.fail_next_fetch(RemoteError::Unauthorized);
        remote.fail_next_fetch(RemoteError::Unavailable("down".to_string()));
        assert_eq!(
            remote.fetch_snapshot().await.unwrap_err(),
            RemoteError::Unauthorized
        );
        assert!(remote.fetch_snapshot().await.unwrap_err().is_transient());
        assert!(remote.fetch_snapshot().await.is_ok());
        assert_eq!(remote.fetch_count(), 3);
    }
}
