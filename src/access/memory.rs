//! In-memory access-governance backend.
//!
//! Holds requests in a map and fans out changes to watchers. Names are
//! assigned sequentially (`req-00000001`, ...). Watch delivery never blocks the
//! writer: when a watcher's buffer is full the change is dropped for that
//! watcher, matching the at-least-once-with-gaps behaviour of a real watch
//! stream. The reconciler covers those gaps.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use crate::types::{AccessRequest, AccessRequestState, AccessReview};

use super::{AccessClient, AccessError, AccessRequestFilter, Result, WatchEvent};

/// Default buffer of each watch subscription.
const DEFAULT_WATCH_CAPACITY: usize = 64;

struct Watcher {
    filter: AccessRequestFilter,
    tx: mpsc::Sender<WatchEvent>,
}

#[derive(Default)]
pub struct MemoryAccessClient {
    requests: RwLock<BTreeMap<String, AccessRequest>>,
    watchers: Mutex<Vec<Watcher>>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
    watch_capacity: Option<usize>,
}

impl MemoryAccessClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the buffer size of subsequent watch subscriptions.
    pub fn with_watch_capacity(mut self, capacity: usize) -> Self {
        self.watch_capacity = Some(capacity.max(1));
        self
    }

    /// Simulates an outage: every trait call fails with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn get(&self, name: &str) -> Option<AccessRequest> {
        self.requests.read().await.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Records a review and moves the request to `state`.
    pub async fn review(
        &self,
        name: &str,
        author: impl Into<String>,
        state: AccessRequestState,
        reason: impl Into<String>,
    ) -> Result<AccessRequest> {
        let updated = {
            let mut requests = self.requests.write().await;
            let request = requests
                .get_mut(name)
                .ok_or_else(|| AccessError::NotFound(name.to_string()))?;
            request.add_review(AccessReview {
                author: author.into(),
                state,
                reason: reason.into(),
                created: Utc::now(),
            });
            request.set_state(state);
            request.clone()
        };

        debug!(request = %name, state = %state, "access request reviewed");
        self.notify(WatchEvent::Put(updated.clone()));
        Ok(updated)
    }

    pub async fn delete(&self, name: &str) -> Result<AccessRequest> {
        let removed = self
            .requests
            .write()
            .await
            .remove(name)
            .ok_or_else(|| AccessError::NotFound(name.to_string()))?;
        self.notify(WatchEvent::Delete(name.to_string()));
        Ok(removed)
    }

    /// Drops every open watch subscription, ending their streams.
    pub fn disconnect_watchers(&self) {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AccessError::Unavailable(
                "in-memory backend marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn notify(&self, event: WatchEvent) {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.retain(|watcher| {
            let relevant = match &event {
                WatchEvent::Put(request) => watcher.filter.matches(request),
                WatchEvent::Delete(_) => true,
            };
            if !relevant {
                return !watcher.tx.is_closed();
            }
            match watcher.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("watch subscriber lagging; change dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

impl AccessClient for MemoryAccessClient {
    async fn get_access_requests(
        &self,
        filter: &AccessRequestFilter,
    ) -> Result<Vec<AccessRequest>> {
        self.check_available()?;
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn create_access_request(&self, mut draft: AccessRequest) -> Result<AccessRequest> {
        self.check_available()?;
        if draft.user().is_empty() {
            return Err(AccessError::InvalidRequest("user is required".to_string()));
        }
        if draft.roles().is_empty() {
            return Err(AccessError::InvalidRequest(
                "at least one role is required".to_string(),
            ));
        }

        let created = {
            let mut requests = self.requests.write().await;
            if draft.name().is_empty() {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                draft.set_name(format!("req-{id:08}"));
            } else if requests.contains_key(draft.name()) {
                return Err(AccessError::AlreadyExists(draft.name().to_string()));
            }
            draft.set_state(AccessRequestState::Pending);
            requests.insert(draft.name().to_string(), draft.clone());
            draft
        };

        debug!(request = %created.name(), user = %created.user(), "access request created");
        self.notify(WatchEvent::Put(created.clone()));
        Ok(created)
    }

    async fn watch_access_requests(
        &self,
        filter: AccessRequestFilter,
    ) -> Result<mpsc::Receiver<WatchEvent>> {
        self.check_available()?;
        let (tx, rx) = mpsc::channel(self.watch_capacity.unwrap_or(DEFAULT_WATCH_CAPACITY));
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Watcher { filter, tx });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(user: &str) -> AccessRequest {
        let mut draft = AccessRequest::draft(user, vec!["gha-build-prod".to_string()]);
        draft.set_label("environment", "build/prod");
        draft
    }

    #[tokio::test]
    async fn create_assigns_sequential_names() {
        let client = MemoryAccessClient::new();
        let first = client.create_access_request(draft("bot")).await.unwrap();
        let second = client.create_access_request(draft("bot")).await.unwrap();

        assert_eq!(first.name(), "req-00000001");
        assert_eq!(second.name(), "req-00000002");
        assert_eq!(first.state(), AccessRequestState::Pending);
        assert_eq!(client.len().await, 2);
    }

    #[tokio::test]
    async fn create_rejects_incomplete_drafts() {
        let client = MemoryAccessClient::new();
        let no_roles = AccessRequest::draft("bot", vec![]);
        assert!(matches!(
            client.create_access_request(no_roles).await,
            Err(AccessError::InvalidRequest(_))
        ));

        let named = AccessRequest::new("fixed", "bot", vec!["r".into()]);
        client.create_access_request(named.clone()).await.unwrap();
        assert_eq!(
            client.create_access_request(named).await,
            Err(AccessError::AlreadyExists("fixed".to_string()))
        );
    }

    #[tokio::test]
    async fn list_applies_filter() {
        let client = MemoryAccessClient::new();
        client.create_access_request(draft("bot")).await.unwrap();
        client.create_access_request(draft("other")).await.unwrap();

        let mine = client
            .get_access_requests(&AccessRequestFilter::for_user("bot"))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].user(), "bot");
    }

    #[tokio::test]
    async fn review_records_reviewer_and_state() {
        let client = MemoryAccessClient::new();
        let created = client.create_access_request(draft("bot")).await.unwrap();

        let reviewed = client
            .review(created.name(), "alice", AccessRequestState::Approved, "ship it")
            .await
            .unwrap();

        assert_eq!(reviewed.state(), AccessRequestState::Approved);
        assert_eq!(reviewed.reviewers(), vec!["alice"]);
        assert_eq!(client.get(created.name()).await, Some(reviewed));
    }

    #[tokio::test]
    async fn watchers_receive_matching_changes() {
        let client = MemoryAccessClient::new();
        let mut rx = client
            .watch_access_requests(AccessRequestFilter::for_user("bot"))
            .await
            .unwrap();

        client.create_access_request(draft("other")).await.unwrap();
        let created = client.create_access_request(draft("bot")).await.unwrap();
        client
            .review(created.name(), "alice", AccessRequestState::Denied, "no")
            .await
            .unwrap();
        client.delete(created.name()).await.unwrap();

        let WatchEvent::Put(first) = rx.recv().await.unwrap() else {
            panic!("expected put");
        };
        assert_eq!(first.name(), created.name());
        assert_eq!(first.state(), AccessRequestState::Pending);

        let WatchEvent::Put(second) = rx.recv().await.unwrap() else {
            panic!("expected put");
        };
        assert_eq!(second.state(), AccessRequestState::Denied);

        assert_eq!(
            rx.recv().await.unwrap(),
            WatchEvent::Delete(created.name().to_string())
        );
    }

    #[tokio::test]
    async fn lagging_watcher_drops_changes_without_blocking() {
        let client = MemoryAccessClient::new().with_watch_capacity(1);
        let mut rx = client
            .watch_access_requests(AccessRequestFilter::default())
            .await
            .unwrap();

        client.create_access_request(draft("bot")).await.unwrap();
        client.create_access_request(draft("bot")).await.unwrap();

        assert!(matches!(rx.recv().await, Some(WatchEvent::Put(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_ends_streams() {
        let client = MemoryAccessClient::new();
        let mut rx = client
            .watch_access_requests(AccessRequestFilter::default())
            .await
            .unwrap();
        client.disconnect_watchers();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unavailable_backend_fails_calls() {
        let client = MemoryAccessClient::new();
        client.set_unavailable(true);
        assert!(matches!(
            client.get_access_requests(&AccessRequestFilter::default()).await,
            Err(AccessError::Unavailable(_))
        ));
        client.set_unavailable(false);
        assert!(client.get_access_requests(&AccessRequestFilter::default()).await.is_ok());
    }
}
