//! Observable shared document with monotonic revisions

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::{Result, StagehandError};

/// Snapshot of the shared document
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedDocument {
    /// Document text (scene markup or transcript)
    pub content: String,

    /// Incremented on every write, starting at 0
    pub revision: u64,

    /// Time of the last write
    pub updated_at: DateTime<Utc>,
}

/// Last-writer-wins document cell
///
/// Observers always see the latest value; intermediate values may be skipped
/// when several writes land before an observer wakes up.
#[derive(Clone)]
pub struct DocumentStore {
    tx: Arc<watch::Sender<SharedDocument>>,
}

impl DocumentStore {
    /// Create a store at revision 0
    pub fn new(initial: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(SharedDocument {
            content: initial.into(),
            revision: 0,
            updated_at: Utc::now(),
        });
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot
    pub fn current(&self) -> SharedDocument {
        self.tx.borrow().clone()
    }

    pub fn content(&self) -> String {
        self.tx.borrow().content.clone()
    }

    pub fn revision(&self) -> u64 {
        self.tx.borrow().revision
    }

    /// Replace the content unconditionally and return the new revision
    pub fn set(&self, next: impl Into<String>) -> u64 {
        let next = next.into();
        let mut revision = 0;
        self.tx.send_modify(|doc| {
            doc.content = next;
            doc.revision += 1;
            doc.updated_at = Utc::now();
            revision = doc.revision;
        });
        debug!(revision, "document replaced");
        revision
    }

    /// Replace the content only if the store is still at `expected`
    ///
    /// Fails with [`StagehandError::StaleWrite`] when another write landed first.
    pub fn set_if_revision(&self, expected: u64, next: impl Into<String>) -> Result<u64> {
        let next = next.into();
        let mut outcome = Err(0);
        self.tx.send_if_modified(|doc| {
            if doc.revision != expected {
                outcome = Err(doc.revision);
                return false;
            }
            doc.content = next;
            doc.revision += 1;
            doc.updated_at = Utc::now();
            outcome = Ok(doc.revision);
            true
        });

        match outcome {
            Ok(revision) => {
                debug!(revision, "document committed");
                Ok(revision)
            }
            Err(actual) => {
                trace!(expected, actual, "conditional write rejected");
                Err(StagehandError::StaleWrite(format!(
                    "expected revision {}, found {}",
                    expected, actual
                )))
            }
        }
    }

    /// Subscribe to changes, replaying the current value first
    pub fn observe(&self) -> watch::Receiver<SharedDocument> {
        let mut rx = self.tx.subscribe();
        rx.mark_changed();
        rx
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("current", &*self.tx.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_set_increments_revision() {
        let store = DocumentStore::new("<scene></scene>");
        assert_eq!(store.revision(), 0);

        assert_eq!(store.set("<scene><a/></scene>"), 1);
        assert_eq!(store.set("<scene><a/></scene>"), 2);
        assert_eq!(store.content(), "<scene><a/></scene>");
    }

    #[test]
    fn test_conditional_write() {
        let store = DocumentStore::new("v0");
        assert_eq!(store.set_if_revision(0, "v1").unwrap(), 1);

        let err = store.set_if_revision(0, "stale").unwrap_err();
        assert!(matches!(err, StagehandError::StaleWrite(_)));
        assert_eq!(store.content(), "v1");
        assert_eq!(store.revision(), 1);
    }

    #[tokio::test]
    async fn test_observe_replays_latest() {
        let store = DocumentStore::new("v0");
        store.set("v1");

        let mut rx = store.observe();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().content, "v1");

        store.set("v2");
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow_and_update().revision, 2);
    }

    #[tokio::test]
    async fn test_rejected_write_does_not_notify() {
        let store = DocumentStore::new("v0");
        let mut rx = store.observe();
        rx.borrow_and_update();

        let _ = store.set_if_revision(7, "nope");
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_clones_share_state() {
        let store = DocumentStore::new("a");
        let other = store.clone();
        other.set("b");
        assert_eq!(store.current().content, "b");
    }
}
