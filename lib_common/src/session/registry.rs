//! # Stream Registry
//!
//! Viewer ID → control flag for every live stream of a session. An entry is
//! inserted when a stream is started and removed only when the worker's
//! [`StreamLease`] is dropped, so a duplicate start cannot spawn a second
//! worker while the first is still winding down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Running,
    StopRequested,
}

struct Entry {
    control: StreamControl,
    token: CancellationToken,
}

#[derive(Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<Mutex<HashMap<String, Entry>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // Entries stay consistent even if a holder panicked.
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `viewer` as running. Returns `None` if it already has an entry.
    ///
    /// The lease's token is a child of `parent`, so cancelling the cohort
    /// reaches every worker.
    pub fn try_start(&self, viewer: &str, parent: &CancellationToken) -> Option<StreamLease> {
        let mut streams = self.lock();
        if streams.contains_key(viewer) {
            return None;
        }

        let token = parent.child_token();
        streams.insert(
            viewer.to_string(),
            Entry {
                control: StreamControl::Running,
                token: token.clone(),
            },
        );
        log::debug!("Stream registered for {} ({} active)", viewer, streams.len());

        Some(StreamLease {
            registry: self.clone(),
            viewer: viewer.to_string(),
            token,
        })
    }

    /// Flags `viewer` for stop and wakes its worker. Returns whether a
    /// running stream was flagged; repeated calls are harmless.
    pub fn request_stop(&self, viewer: &str) -> bool {
        let mut streams = self.lock();
        match streams.get_mut(viewer) {
            Some(entry) if entry.control == StreamControl::Running => {
                entry.control = StreamControl::StopRequested;
                entry.token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn control(&self, viewer: &str) -> Option<StreamControl> {
        self.lock().get(viewer).map(|entry| entry.control)
    }

    pub fn contains(&self, viewer: &str) -> bool {
        self.lock().contains_key(viewer)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn remove(&self, viewer: &str) {
        let mut streams = self.lock();
        if streams.remove(viewer).is_some() {
            log::debug!("Stream removed for {} ({} active)", viewer, streams.len());
        }
    }
}

/// Ownership of one registry entry, held by its stream worker.
///
/// Dropping the lease removes the entry.
pub struct StreamLease {
    registry: StreamRegistry,
    viewer: String,
    token: CancellationToken,
}

impl StreamLease {
    pub fn viewer(&self) -> &str {
        &self.viewer
    }

    /// Cancelled on stop request or cohort cancellation.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn stop_requested(&self) -> bool {
        self.registry.control(&self.viewer) != Some(StreamControl::Running)
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.registry.remove(&self.viewer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_start_is_rejected_until_lease_drops() {
        let registry = StreamRegistry::new();
        let parent = CancellationToken::new();

        let lease = registry.try_start("a", &parent).expect("first start");
        assert!(registry.try_start("a", &parent).is_none());
        assert_eq!(registry.len(), 1);

        drop(lease);
        assert!(registry.is_empty());
        assert!(registry.try_start("a", &parent).is_some());
    }

    #[test]
    fn stop_is_idempotent() {
        let registry = StreamRegistry::new();
        let parent = CancellationToken::new();
        let lease = registry.try_start("x", &parent).unwrap();

        assert!(registry.request_stop("x"));
        assert!(!registry.request_stop("x"));
        assert!(!registry.request_stop("never-started"));

        assert_eq!(registry.control("x"), Some(StreamControl::StopRequested));
        assert!(lease.stop_requested());
        assert!(lease.token().is_cancelled());
        assert!(registry.contains("x"));

        drop(lease);
        assert!(!registry.contains("x"));
        assert!(!registry.request_stop("x"));
    }

    #[test]
    fn cohort_cancellation_reaches_leases_without_flagging_stop() {
        let registry = StreamRegistry::new();
        let parent = CancellationToken::new();
        let a = registry.try_start("a", &parent).unwrap();
        let b = registry.try_start("b", &parent).unwrap();

        parent.cancel();
        assert!(a.token().is_cancelled() && b.token().is_cancelled());
        assert!(!a.stop_requested());
    }

    #[test]
    fn stopping_one_viewer_leaves_others_running() {
        let registry = StreamRegistry::new();
        let parent = CancellationToken::new();
        let a = registry.try_start("a", &parent).unwrap();
        let b = registry.try_start("b", &parent).unwrap();

        registry.request_stop("a");
        assert!(a.stop_requested());
        assert!(!b.stop_requested());
        assert!(!b.token().is_cancelled());
    }
}
