//! Client session tracking.
//!
//! The session table is the gate's only state: who is connected, which
//! entity each session is bound to, and which space that entity is in. All
//! of it is id-and-lookup; sessions reference entities by id, never by
//! handle, and the two-way maps resolve in both directions.

use std::collections::HashSet;
use std::net::SocketAddr;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use meridian_proto::{EntityId, Packet, SessionId};

/// Bound on each session's outbound packet queue. Overflow drops the
/// session; a reconnecting client gets fresh state.
pub const CLIENT_SEND_QUEUE_SIZE: usize = 1024;

#[derive(Debug)]
struct SessionEntry {
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Packet>,
    bound_entity: Option<EntityId>,
}

/// The gate's session table and subscription indexes.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<SessionId, SessionEntry>,
    by_entity: DashMap<EntityId, SessionId>,
    entity_space: DashMap<EntityId, EntityId>,
    space_sessions: DashMap<EntityId, HashSet<SessionId>>,
}

impl SessionManager {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a freshly accepted connection and returns its session id and
    /// the receiving end of its outbound queue.
    pub fn add_session(&self, remote_addr: SocketAddr) -> (SessionId, mpsc::Receiver<Packet>) {
        let session = SessionId::new();
        let (outbound, rx) = mpsc::channel(CLIENT_SEND_QUEUE_SIZE);
        self.sessions.insert(
            session,
            SessionEntry {
                remote_addr,
                outbound,
                bound_entity: None,
            },
        );
        info!(%session, %remote_addr, "client connected");
        (session, rx)
    }

    /// Removes a session and every index entry referring to it.
    pub fn remove_session(&self, session: SessionId) {
        let Some((_, entry)) = self.sessions.remove(&session) else {
            return;
        };
        info!(%session, remote_addr = %entry.remote_addr, "client disconnected");
        if let Some(entity) = entry.bound_entity {
            self.by_entity.remove(&entity);
            if let Some((_, space)) = self.entity_space.remove(&entity) {
                if let Some(mut members) = self.space_sessions.get_mut(&space) {
                    members.remove(&session);
                }
            }
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are connected.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether the session is bound to an entity.
    pub fn is_bound(&self, session: SessionId) -> bool {
        self.sessions
            .get(&session)
            .map(|entry| entry.bound_entity.is_some())
            .unwrap_or(false)
    }

    /// The session bound to `entity`, if any.
    pub fn session_for(&self, entity: EntityId) -> Option<SessionId> {
        self.by_entity.get(&entity).map(|entry| *entry.value())
    }

    /// Records a confirmed binding.
    pub fn bind(&self, session: SessionId, entity: EntityId) {
        let Some(mut entry) = self.sessions.get_mut(&session) else {
            warn!(%session, %entity, "binding for unknown session dropped");
            return;
        };
        if let Some(previous) = entry.bound_entity.replace(entity) {
            self.by_entity.remove(&previous);
        }
        self.by_entity.insert(entity, session);
        debug!(%session, %entity, "session bound");
    }

    /// Updates the space index when a bound entity enters a space.
    ///
    /// Returns `true` when the update changed a subscription (the entity
    /// belongs to one of this gate's sessions).
    pub fn entity_entered_space(&self, entity: EntityId, space: EntityId) -> bool {
        let Some(session) = self.session_for(entity) else {
            return false;
        };
        if let Some((_, old_space)) = self.entity_space.remove(&entity) {
            if let Some(mut members) = self.space_sessions.get_mut(&old_space) {
                members.remove(&session);
            }
        }
        self.entity_space.insert(entity, space);
        self.space_sessions.entry(space).or_default().insert(session);
        debug!(%entity, %space, %session, "subscription moved to space");
        true
    }

    /// Updates the space index when a bound entity leaves its space.
    pub fn entity_left_space(&self, entity: EntityId, space: EntityId) -> bool {
        let Some(session) = self.session_for(entity) else {
            return false;
        };
        self.entity_space.remove(&entity);
        if let Some(mut members) = self.space_sessions.get_mut(&space) {
            members.remove(&session);
        }
        debug!(%entity, %space, %session, "subscription left space");
        true
    }

    /// Sessions subscribed to a space.
    pub fn sessions_in_space(&self, space: EntityId) -> Vec<SessionId> {
        self.space_sessions
            .get(&space)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Queues a packet for one session.
    ///
    /// Returns `false` when the session's queue is full or gone; the caller
    /// must drop the session (slow consumer policy).
    pub fn try_deliver(&self, session: SessionId, packet: Packet) -> bool {
        let Some(entry) = self.sessions.get(&session) else {
            return false;
        };
        match entry.outbound.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%session, "outbound queue overflow, dropping session");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn bind_and_lookup() {
        let manager = SessionManager::new();
        let (session, _rx) = manager.add_session(addr());
        assert!(!manager.is_bound(session));

        let entity = EntityId::new();
        manager.bind(session, entity);
        assert!(manager.is_bound(session));
        assert_eq!(manager.session_for(entity), Some(session));

        manager.remove_session(session);
        assert_eq!(manager.session_for(entity), None);
        assert!(manager.is_empty());
    }

    #[test]
    fn space_subscription_moves_with_entity() {
        let manager = SessionManager::new();
        let (session, _rx) = manager.add_session(addr());
        let entity = EntityId::new();
        manager.bind(session, entity);

        let s = EntityId::new();
        let t = EntityId::new();
        assert!(manager.entity_entered_space(entity, s));
        assert_eq!(manager.sessions_in_space(s), vec![session]);

        // Moving to another space removes the old subscription exactly once.
        assert!(manager.entity_left_space(entity, s));
        assert!(manager.entity_entered_space(entity, t));
        assert!(manager.sessions_in_space(s).is_empty());
        assert_eq!(manager.sessions_in_space(t), vec![session]);
    }

    #[test]
    fn unbound_entities_do_not_subscribe() {
        let manager = SessionManager::new();
        let (_session, _rx) = manager.add_session(addr());
        let stranger = EntityId::new();
        assert!(!manager.entity_entered_space(stranger, EntityId::new()));
    }

    #[tokio::test]
    async fn delivery_reports_overflow() {
        let manager = SessionManager::new();
        let (session, mut rx) = manager.add_session(addr());

        for _ in 0..CLIENT_SEND_QUEUE_SIZE {
            assert!(manager.try_deliver(session, Packet::Tick));
        }
        // Queue full: the caller must kick the session.
        assert!(!manager.try_deliver(session, Packet::Tick));

        // Draining makes room again.
        rx.recv().await.expect("queued");
        assert!(manager.try_deliver(session, Packet::Tick));
    }
}
