//! Per-connection session state machine.
//!
//! ```text
//!            open()                 handle(update) *
//! Connecting ──────► Active ─────────────────────────┐
//!   │ snapshot         │ close(reason)               │
//!   │ register         ▼                             │
//!   └──────────────► Closed ◄────────────────────────┘
//!                      unregister, disconnect notice, evict owned containers
//! ```
//!
//! All sessions share one [`SyncHub`]: the scene store behind a single mutex
//! plus the subscriber registry. The mutex is the only ordering mechanism;
//! every store operation from every session is totally ordered by it.
//!
//! [`BroadcastOrdering`] decides whether fan-out happens inside that critical
//! section (`Serialized`) or after it (`Relaxed`). With `Relaxed`, two
//! updates applied as U1 then U2 may reach a third subscriber as U2 then U1.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use covis_core::model::{ContainerUuid, SubscriberId, Update};

use crate::protocol::{encode_update, ProtocolError};
use crate::registry::{FrameReceiver, SubscriberRegistry};
use crate::store::{SceneStore, StoreError};

/// Whether apply-then-broadcast is atomic with respect to other sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastOrdering {
    /// Broadcast after the store lock is released. Subscribers may observe
    /// concurrent updates in a different order than the store applied them.
    Relaxed,
    /// Apply and broadcast under one lock. Snapshot and registration of a new
    /// session also share one critical section, so no update is missed or
    /// duplicated during connection setup.
    #[default]
    Serialized,
}

impl fmt::Display for BroadcastOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relaxed => write!(f, "relaxed"),
            Self::Serialized => write!(f, "serialized"),
        }
    }
}

impl FromStr for BroadcastOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relaxed" => Ok(Self::Relaxed),
            "serialized" => Ok(Self::Serialized),
            other => Err(format!("unknown broadcast ordering '{other}' (expected relaxed|serialized)")),
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// What the transport should do after an inbound update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    /// The client asked to leave
    Disconnect,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Client closed its stream
    Completed,
    /// Transport error
    Error(String),
    /// Client sent a Disconnect update
    Voluntary,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "stream completed"),
            Self::Error(e) => write!(f, "stream error: {e}"),
            Self::Voluntary => write!(f, "voluntary disconnect"),
        }
    }
}

/// Failure while handling one inbound update. The session stays usable.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("update rejected: {0}")]
    Rejected(#[from] StoreError),
    #[error("broadcast failed: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Shared state of all sessions.
#[derive(Clone)]
pub struct SyncHub {
    store: Arc<Mutex<SceneStore>>,
    registry: Arc<SubscriberRegistry>,
    ordering: BroadcastOrdering,
}

impl SyncHub {
    pub fn new(ordering: BroadcastOrdering) -> Self {
        Self::with_store(SceneStore::new(), ordering)
    }

    /// Start from an existing store (tests, tooling).
    pub fn with_store(store: SceneStore, ordering: BroadcastOrdering) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            registry: Arc::new(SubscriberRegistry::new()),
            ordering,
        }
    }

    pub fn store(&self) -> &Arc<Mutex<SceneStore>> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn ordering(&self) -> BroadcastOrdering {
        self.ordering
    }

    /// Open a session for a new connection.
    ///
    /// Assigns a fresh subscriber id, queues one container update per stored
    /// container (in store order) on the returned receiver, then registers
    /// the subscriber so it starts receiving broadcasts.
    pub async fn open(&self) -> Result<(Session, FrameReceiver), ProtocolError> {
        let id = Uuid::new_v4().to_string();
        let mut session = Session {
            id: id.clone(),
            hub: self.clone(),
            state: SessionState::Connecting,
        };
        log::info!("Syncing with a new client with id {id}");

        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.store.lock().await;
        let snapshot = store.list_all();
        let guard = match self.ordering {
            BroadcastOrdering::Serialized => Some(store),
            BroadcastOrdering::Relaxed => {
                drop(store);
                None
            }
        };

        let count = snapshot.len();
        for (_, container) in snapshot {
            let frame = encode_update(&Update::container(container))?;
            // The receiver is still held locally, so this cannot fail.
            let _ = tx.send(Arc::new(frame));
        }
        self.registry.register(id.clone(), tx);
        drop(guard);

        session.state = SessionState::Active;
        log::debug!("Session {id} active after {count} snapshot containers");
        Ok((session, rx))
    }
}

/// One client's view of the hub.
pub struct Session {
    id: SubscriberId,
    hub: SyncHub,
    state: SessionState,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply an inbound update and fan the raw update out to everyone else.
    ///
    /// Subscribers receive the sender's delta, not the merged result. A
    /// rejected update is not broadcast; the session remains active.
    pub async fn handle(&mut self, update: &Update) -> Result<Disposition, SessionError> {
        if update.is_disconnect() {
            log::info!("Subscriber {} requested disconnect", self.id);
            return Ok(Disposition::Disconnect);
        }
        log::trace!("Processing {} update from {}", update.kind(), self.id);

        // Encoded before the store is touched, so an encoding failure
        // cannot leave an applied but unrelayed update behind.
        let frame = Arc::new(encode_update(update)?);
        let delivered = match self.hub.ordering {
            BroadcastOrdering::Serialized => {
                let mut store = self.hub.store.lock().await;
                store.apply(update, &self.id)?;
                self.hub.registry.broadcast_frame_except(&self.id, frame)
            }
            BroadcastOrdering::Relaxed => {
                self.hub.store.lock().await.apply(update, &self.id)?;
                self.hub.registry.broadcast_frame_except(&self.id, frame)
            }
        };
        log::trace!("Sent {} update from {} to {delivered} subscribers", update.kind(), self.id);
        Ok(Disposition::Continue)
    }

    /// Tear the session down. Consumes the session, so cleanup runs once.
    ///
    /// Unregisters the subscriber (which completes its outbound channel),
    /// tells the remaining subscribers which containers it owned, and evicts
    /// those containers from the store. Returns the evicted container uuids.
    pub async fn close(mut self, reason: CloseReason) -> Vec<ContainerUuid> {
        log::info!("Closing session {} ({reason})", self.id);
        self.state = SessionState::Closed;
        self.hub.registry.unregister(&self.id);

        let mut store = self.hub.store.lock().await;
        let owned = store.owned_by(&self.id);
        let notice = Update::disconnect(owned);

        if self.hub.ordering == BroadcastOrdering::Relaxed {
            drop(store);
            self.broadcast_notice(&notice);
            store = self.hub.store.lock().await;
        } else {
            self.broadcast_notice(&notice);
        }
        store.remove_subscriber(&self.id)
    }

    fn broadcast_notice(&self, notice: &Update) {
        match self.hub.registry.broadcast_except(&self.id, notice) {
            Ok(n) => log::debug!("Disconnect notice for {} sent to {n} subscribers", self.id),
            Err(e) => log::error!("Failed to broadcast disconnect notice for {}: {e}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SyncMessage;
    use crate::registry::Frame;
    use covis_core::model::{Container, Syncable, UpdatePayload, Vec3, Vec4};

    const ORDERINGS: [BroadcastOrdering; 2] =
        [BroadcastOrdering::Relaxed, BroadcastOrdering::Serialized];

    fn decode(frame: &Frame) -> Update {
        SyncMessage::decode(frame).unwrap().to_update().unwrap()
    }

    fn drain(rx: &mut FrameReceiver) -> Vec<Update> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(decode(&frame));
        }
        out
    }

    fn container(uuid: &str, syncable: &str) -> Container {
        Container::new(uuid)
            .with_name(uuid)
            .with_syncable(syncable, Syncable::new(syncable).with_position(Vec3::ZERO))
    }

    #[tokio::test]
    async fn test_open_sends_snapshot_in_store_order() {
        for ordering in ORDERINGS {
            let mut store = SceneStore::new();
            store.apply_container_upsert(&container("c1", "s1"), "x").unwrap();
            store.apply_container_upsert(&container("c2", "s2"), "y").unwrap();
            let hub = SyncHub::with_store(store, ordering);

            let (session, mut rx) = hub.open().await.unwrap();
            assert_eq!(session.state(), SessionState::Active);
            assert!(hub.registry().contains(session.id()));

            let received = drain(&mut rx);
            let uuids: Vec<&str> = received
                .iter()
                .map(|u| match &u.payload {
                    UpdatePayload::Container(c) => c.uuid.as_str(),
                    other => panic!("Expected container snapshot, got {other:?}"),
                })
                .collect();
            assert_eq!(uuids, vec!["c1", "c2"]);
        }
    }

    #[tokio::test]
    async fn test_sessions_get_distinct_ids() {
        let hub = SyncHub::new(BroadcastOrdering::default());
        let (a, _rx_a) = hub.open().await.unwrap();
        let (b, _rx_b) = hub.open().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(hub.registry().subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_raw_delta_broadcast_to_others_only() {
        for ordering in ORDERINGS {
            let hub = SyncHub::new(ordering);
            let (mut a, mut rx_a) = hub.open().await.unwrap();
            let (_b, mut rx_b) = hub.open().await.unwrap();

            a.handle(&Update::container(container("c1", "s1"))).await.unwrap();
            let delta = Update::syncable(Syncable::new("s1").with_rotation(Vec4::IDENTITY));
            assert_eq!(a.handle(&delta).await.unwrap(), Disposition::Continue);

            let received = drain(&mut rx_b);
            assert_eq!(received.len(), 2);
            // The delta arrives as sent, without the stored position merged in.
            assert_eq!(received[1], delta);
            assert!(drain(&mut rx_a).is_empty());

            let store = hub.store().lock().await;
            let stored = &store.get("c1").unwrap().container.syncables["s1"];
            assert_eq!(stored.position, Some(Vec3::ZERO));
            assert_eq!(stored.rotation, Some(Vec4::IDENTITY));
        }
    }

    #[tokio::test]
    async fn test_rejected_update_not_broadcast() {
        let hub = SyncHub::new(BroadcastOrdering::Serialized);
        let (mut a, _rx_a) = hub.open().await.unwrap();
        let (_b, mut rx_b) = hub.open().await.unwrap();

        let err = a.handle(&Update::syncable(Syncable::new("ghost"))).await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected(StoreError::UnknownSyncable(_))));
        assert!(drain(&mut rx_b).is_empty());

        // The session keeps working after a rejection.
        a.handle(&Update::container(container("c1", "s1"))).await.unwrap();
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert_eq!(a.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_relayed_frame_encoded_once_before_apply() {
        for ordering in ORDERINGS {
            let hub = SyncHub::new(ordering);
            let (mut a, _rx_a) = hub.open().await.unwrap();
            let (_b, mut rx_b) = hub.open().await.unwrap();
            let (_c, mut rx_c) = hub.open().await.unwrap();

            let update = Update::container(container("c1", "s1"));
            a.handle(&update).await.unwrap();

            let to_b = rx_b.try_recv().unwrap();
            let to_c = rx_c.try_recv().unwrap();
            assert!(Arc::ptr_eq(&to_b, &to_c));
            assert_eq!(*to_b, encode_update(&update).unwrap());

            // A rejected update leaves the store exactly as it was.
            let before = hub.store().lock().await.clone();
            assert!(a.handle(&Update::container(Container::new(" "))).await.is_err());
            assert_eq!(*hub.store().lock().await, before);
            assert!(rx_b.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_client_disconnect_is_voluntary_close() {
        let hub = SyncHub::new(BroadcastOrdering::Serialized);
        let (mut a, _rx_a) = hub.open().await.unwrap();
        a.handle(&Update::container(container("c1", "s1"))).await.unwrap();

        let disposition = a.handle(&Update::disconnect(Vec::new())).await.unwrap();
        assert_eq!(disposition, Disposition::Disconnect);
        // Nothing is evicted until the session is actually closed.
        assert_eq!(hub.store().lock().await.len(), 1);

        let removed = a.close(CloseReason::Voluntary).await;
        assert_eq!(removed, vec!["c1".to_string()]);
        assert!(hub.store().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_cleanup() {
        for ordering in ORDERINGS {
            let hub = SyncHub::new(ordering);
            let (mut a, _rx_a) = hub.open().await.unwrap();
            let (mut b, mut rx_b) = hub.open().await.unwrap();
            let (_observer, mut rx_o) = hub.open().await.unwrap();

            let c1 = container("c1", "s1");
            let c2 = container("c2", "s2");
            let c3 = container("c3", "s3");
            a.handle(&Update::container(c1.clone())).await.unwrap();
            a.handle(&Update::container(c2.clone())).await.unwrap();
            b.handle(&Update::container(c3.clone())).await.unwrap();
            drain(&mut rx_b);
            drain(&mut rx_o);

            let removed = a.close(CloseReason::Completed).await;
            assert_eq!(removed, vec!["c1".to_string(), "c2".to_string()]);

            {
                let store = hub.store().lock().await;
                assert_eq!(store.list_all(), vec![(b.id().to_string(), c3.clone())]);
                assert_eq!(store.index_len(), 1);
                assert_eq!(store.index_lookup("s3"), Some("c3"));
                store.check_consistency().unwrap();
            }

            for rx in [&mut rx_b, &mut rx_o] {
                let received = drain(rx);
                assert_eq!(received.len(), 1);
                match &received[0].payload {
                    UpdatePayload::Disconnect { containers } => {
                        assert_eq!(containers, &vec![c1.clone(), c2.clone()]);
                    }
                    other => panic!("Expected disconnect notice, got {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_close_completes_outbound_channel() {
        let hub = SyncHub::new(BroadcastOrdering::Serialized);
        let (a, mut rx_a) = hub.open().await.unwrap();
        let id = a.id().to_string();
        a.close(CloseReason::Error("reset by peer".into())).await;

        assert!(!hub.registry().contains(&id));
        assert!(rx_a.recv().await.is_none());
        // Unregistering again is harmless.
        assert!(!hub.registry().unregister(&id));
    }

    #[tokio::test]
    async fn test_last_writer_owns_container() {
        let hub = SyncHub::new(BroadcastOrdering::Serialized);
        let (mut a, _rx_a) = hub.open().await.unwrap();
        let (mut b, _rx_b) = hub.open().await.unwrap();
        a.handle(&Update::container(container("c1", "s1"))).await.unwrap();
        b.handle(&Update::syncable(Syncable::new("s1").with_position(Vec3::new(1.0, 0.0, 0.0))))
            .await
            .unwrap();

        // a leaves, but c1 now belongs to b and survives.
        assert!(a.close(CloseReason::Completed).await.is_empty());
        assert_eq!(hub.store().lock().await.owner_of("c1"), Some(b.id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serialized_mirror_matches_store() {
        let hub = SyncHub::new(BroadcastOrdering::Serialized);
        let (mut seed, _rx_seed) = hub.open().await.unwrap();
        seed.handle(&Update::container(container("c1", "s1"))).await.unwrap();

        let (_observer, mut rx_o) = hub.open().await.unwrap();

        let mut writers = Vec::new();
        for w in 0..4 {
            let (mut session, _rx) = hub.open().await.unwrap();
            writers.push(tokio::spawn(async move {
                for i in 0..50 {
                    let position = Vec3::new(w as f64, i as f64, 0.0);
                    let update = Update::syncable(Syncable::new("s1").with_position(position));
                    session.handle(&update).await.unwrap();
                }
                session
            }));
        }
        for w in writers {
            w.await.unwrap();
        }

        let mut mirror = SceneStore::new();
        for update in drain(&mut rx_o) {
            mirror.apply(&update, "mirror").unwrap();
        }
        let store = hub.store().lock().await;
        assert_eq!(
            mirror.get("c1").unwrap().container,
            store.get("c1").unwrap().container
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sessions_keep_index_consistent() {
        for ordering in ORDERINGS {
            let hub = SyncHub::new(ordering);
            let mut tasks = Vec::new();
            for t in 0..8 {
                let hub = hub.clone();
                tasks.push(tokio::spawn(async move {
                    let (mut session, _rx) = hub.open().await.unwrap();
                    for i in 0..20 {
                        let c = container(&format!("c{t}-{i}"), &format!("s{t}-{i}"));
                        session.handle(&Update::container(c)).await.unwrap();
                        if i % 3 == 0 {
                            session
                                .handle(&Update::delete_syncable(format!("s{t}-{i}")))
                                .await
                                .unwrap();
                        }
                    }
                    if t % 2 == 0 {
                        session.close(CloseReason::Completed).await;
                    }
                }));
            }
            for t in tasks {
                t.await.unwrap();
            }

            let store = hub.store().lock().await;
            store.check_consistency().unwrap();
            assert_eq!(store.len(), 4 * 20);
        }
    }
}
