use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bridge_protocol::IceMessage;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::peer::PeerSession;
use crate::source::SharedSource;

/// Single source of truth for which viewers have live sessions, and the
/// ordered teardown of a session's resources.
///
/// Reserve-then-release pattern: a new offer supersedes any existing session
/// for the same viewer-id by removing it from the map before the new one is
/// negotiated, so no two sessions for one viewer are ever live together.
pub(crate) struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
    in_flight: StdMutex<Vec<JoinHandle<()>>>,
    shared_source: Arc<SharedSource>,
}

impl SessionRegistry {
    pub fn new(shared_source: Arc<SharedSource>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            in_flight: StdMutex::new(Vec::new()),
            shared_source,
        })
    }

    /// Step 1 of offer handling: if a session already exists for this
    /// viewer-id, remove it and run its teardown, then settle briefly before
    /// the caller proceeds to negotiate a replacement.
    pub async fn supersede(&self, viewer_id: &str) {
        let existing = self.sessions.write().await.remove(viewer_id);
        if let Some(session) = existing {
            tracing::info!(viewer_id, "superseding existing session");
            self.teardown(session).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    pub async fn insert(&self, session: Arc<PeerSession>) {
        self.sessions
            .write()
            .await
            .insert(session.viewer_id.clone(), session);
    }

    pub async fn on_remote_ice(&self, viewer_id: &str, msg: IceMessage) {
        let session = self.sessions.read().await.get(viewer_id).cloned();
        match session {
            Some(session) => session.on_remote_ice(msg).await,
            None => tracing::debug!(viewer_id, "ice candidate for unknown session, ignoring"),
        }
    }

    /// Tear down a session whose peer connection went terminal on its own
    /// (ICE failure, remote close) rather than via a new offer. Tracked in
    /// the in-flight set so shutdown can wait for it.
    pub fn spawn_teardown(self: &Arc<Self>, viewer_id: String) {
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let existing = registry.sessions.write().await.remove(&viewer_id);
            if let Some(session) = existing {
                registry.teardown(session).await;
            }
        });
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
    }

    /// The teardown procedure: stop/close the peer session (steps 1-4, see
    /// `PeerSession::close`), release the shared source (step 5), then yield
    /// briefly for event-loop callbacks to drain (step 6). Ordering matters:
    /// the peer must be closed before `remove_client` so the shared source
    /// doesn't tear down the puller while transceivers still hold senders.
    async fn teardown(&self, session: Arc<PeerSession>) {
        session.close().await;
        self.shared_source.remove_client(&session.viewer_id).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    /// Tear down every live session and wait for any in-flight teardowns
    /// spawned by terminal-state callbacks. Used during process shutdown.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().map(|(_, v)| v).collect();
        for session in sessions {
            self.teardown(session).await;
        }

        let handles: Vec<_> = std::mem::take(
            &mut *self.in_flight.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_protocol::CameraConfig;

    #[tokio::test]
    async fn supersede_on_empty_registry_is_a_no_op() {
        let shared_source = SharedSource::new(
            "rtsp://203.0.113.1/stream".to_string(),
            CameraConfig::default(),
            "devabc".to_string(),
        );
        let registry = SessionRegistry::new(shared_source);
        registry.supersede("viewer-a").await;
        assert!(registry.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn shutdown_on_empty_registry_completes_immediately() {
        let shared_source = SharedSource::new(
            "rtsp://203.0.113.1/stream".to_string(),
            CameraConfig::default(),
            "devabc".to_string(),
        );
        let registry = SessionRegistry::new(shared_source);
        registry.shutdown().await;
    }
}
