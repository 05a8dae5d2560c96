//! Delta fan-out: which sessions see which attribute change.
//!
//! Owner-visible deltas go to the one session bound to the source entity;
//! all-visible deltas go to every session whose bound entity shares the
//! source's space. The server already filtered out server-only keys, so
//! everything arriving here is client-visible to *someone*; the gate's job
//! is picking exactly whom.

use meridian_proto::{DeltaScope, Packet, SessionId};

use crate::session::SessionManager;

/// Resolves the sessions a delta packet must be delivered to.
///
/// Returns an empty list for non-delta packets.
pub fn fanout_targets(sessions: &SessionManager, packet: &Packet) -> Vec<SessionId> {
    let scope = match packet {
        Packet::AttrSet { scope, .. }
        | Packet::AttrDel { scope, .. }
        | Packet::ListAppend { scope, .. }
        | Packet::ListPop { scope, .. } => scope,
        _ => return Vec::new(),
    };
    match scope {
        DeltaScope::OwnClient { session, .. } => {
            // The binding may have raced away; deliver only if still live.
            vec![*session]
        }
        DeltaScope::Space { space } => sessions.sessions_in_space(*space),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_proto::{EntityId, GateId, Value};

    fn addr() -> std::net::SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn own_delta(entity: EntityId, session: SessionId) -> Packet {
        Packet::AttrSet {
            entity,
            path: vec![],
            key: "hp".into(),
            value: Value::Int(10),
            scope: DeltaScope::OwnClient {
                session,
                gate: GateId(1),
            },
        }
    }

    fn space_delta(entity: EntityId, space: EntityId) -> Packet {
        Packet::AttrSet {
            entity,
            path: vec![],
            key: "pos".into(),
            value: Value::Int(1),
            scope: DeltaScope::Space { space },
        }
    }

    #[test]
    fn own_scope_targets_only_the_bound_session() {
        let manager = SessionManager::new();
        let (session_a, _rx_a) = manager.add_session(addr());
        let (_session_b, _rx_b) = manager.add_session(addr());
        let entity = EntityId::new();
        manager.bind(session_a, entity);

        let targets = fanout_targets(&manager, &own_delta(entity, session_a));
        assert_eq!(targets, vec![session_a]);
    }

    // S4's observable: after an entity switches spaces, all-visible deltas
    // reach exactly the sessions subscribed to the new space.
    #[test]
    fn space_scope_targets_cohabitants_and_tracks_moves() {
        let manager = SessionManager::new();
        let (session_a, _rx_a) = manager.add_session(addr());
        let (session_b, _rx_b) = manager.add_session(addr());
        let e1 = EntityId::new();
        let e2 = EntityId::new();
        manager.bind(session_a, e1);
        manager.bind(session_b, e2);

        let space_s = EntityId::new();
        let space_t = EntityId::new();
        manager.entity_entered_space(e1, space_s);
        manager.entity_entered_space(e2, space_s);

        let mut targets = fanout_targets(&manager, &space_delta(e1, space_s));
        targets.sort_by_key(|s| s.to_string());
        let mut both = vec![session_a, session_b];
        both.sort_by_key(|s| s.to_string());
        assert_eq!(targets, both);

        // E1 leaves S and enters T: its session stops seeing S's deltas and
        // starts seeing T's, exactly once each.
        manager.entity_left_space(e1, space_s);
        manager.entity_entered_space(e1, space_t);

        assert_eq!(fanout_targets(&manager, &space_delta(e2, space_s)), vec![session_b]);
        assert_eq!(fanout_targets(&manager, &space_delta(e1, space_t)), vec![session_a]);
    }

    #[test]
    fn non_delta_packets_have_no_targets() {
        let manager = SessionManager::new();
        assert!(fanout_targets(&manager, &Packet::Tick).is_empty());
    }
}
