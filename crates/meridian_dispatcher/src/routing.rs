//! Routing tables and the migration state machine.
//!
//! Pure logic: packets in, `(destination, packet)` pairs out. The service
//! layer owns the sockets; everything ordering-sensitive happens here, on the
//! dispatcher's single actor task.
//!
//! The migration ordering pivot: every packet for an entity accepted *before*
//! its `MigrateAck` is emitted has already been routed to the source server
//! (same connection, so it sits ahead of the ack in the stream); everything
//! accepted *after* is buffered and flushed to the target in arrival order
//! when `MigrateReady` lands. That is the invariant that makes per-entity
//! FIFO survive a handover.

use std::collections::{BTreeSet, HashMap};

use tokio::time::Instant;
use tracing::{debug, error, warn};

use meridian_proto::{DeltaScope, EntityId, ErrorKind, GateId, Packet, ServerId, SessionId};

pub use meridian_proto::DISPATCHER_MIGRATE_TIMEOUT;

/// Unknown-entity drops are logged once per this many occurrences.
pub const UNKNOWN_DROP_LOG_EVERY: u64 = 100;

/// A registered dispatcher peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    Server(ServerId),
    Gate(GateId),
}

/// Where an outbound packet goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Server(ServerId),
    Gate(GateId),
    /// Every connected gate (space-scoped attribute deltas, membership).
    AllGates,
}

impl From<Peer> for Destination {
    fn from(peer: Peer) -> Self {
        match peer {
            Peer::Server(id) => Destination::Server(id),
            Peer::Gate(id) => Destination::Gate(id),
        }
    }
}

#[derive(Debug)]
struct PendingMigration {
    from: ServerId,
    to: ServerId,
    /// Destination space when the migration implements an enter-space.
    space: Option<EntityId>,
    /// Packets accepted after `MigrateAck`, in arrival order.
    buffer: Vec<Packet>,
    deadline: Instant,
}

/// The dispatcher's authoritative routing state.
#[derive(Debug, Default)]
pub struct RoutingTable {
    entity_location: HashMap<EntityId, ServerId>,
    space_location: HashMap<EntityId, ServerId>,
    pending: HashMap<EntityId, PendingMigration>,
    servers: BTreeSet<ServerId>,
    gates: BTreeSet<GateId>,
    session_entity: HashMap<SessionId, EntityId>,
    session_gate: HashMap<SessionId, GateId>,
    round_robin: usize,
    unknown_drops: u64,
}

/// Output sink for one `handle` call.
pub type Outbox = Vec<(Destination, Packet)>;

impl RoutingTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a server connection (first registration or reconnect).
    pub fn add_server(&mut self, server: ServerId) {
        self.servers.insert(server);
    }

    /// Records a gate connection.
    pub fn add_gate(&mut self, gate: GateId) {
        self.gates.insert(gate);
    }

    /// Connected gates, for `AllGates` fan-out.
    pub fn gates(&self) -> impl Iterator<Item = GateId> + '_ {
        self.gates.iter().copied()
    }

    /// Number of entities currently routed.
    pub fn entity_count(&self) -> usize {
        self.entity_location.len()
    }

    /// The current owner of an entity, if known and not migrating.
    pub fn owner_of(&self, entity: EntityId) -> Option<ServerId> {
        if self.pending.contains_key(&entity) {
            return None;
        }
        self.entity_location.get(&entity).copied()
    }

    /// Whether a migration is in flight for `entity`.
    pub fn is_migrating(&self, entity: EntityId) -> bool {
        self.pending.contains_key(&entity)
    }

    /// Handles a server disconnect: drops its routing entries and resolves
    /// any migration it was part of.
    pub fn remove_server(&mut self, server: ServerId, out: &mut Outbox) {
        self.servers.remove(&server);

        let involved: Vec<EntityId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.from == server || p.to == server)
            .map(|(id, _)| *id)
            .collect();
        for entity in involved {
            let pending = self.pending.remove(&entity).expect("collected above");
            if pending.from == server {
                // Source died mid-handover: the only full copy is gone.
                self.entity_location.remove(&entity);
                self.space_location.remove(&entity);
                error!(%entity, %server, "migration source lost, entity is gone");
                out.push((
                    Destination::Server(pending.to),
                    Packet::ErrorNotify {
                        kind: ErrorKind::EntityLost,
                        about: Some(entity),
                        detail: format!("source {server} lost during migration"),
                    },
                ));
            } else {
                // Target died: roll back to the source.
                warn!(%entity, %server, "migration target lost, rolling back");
                out.push((
                    Destination::Server(pending.from),
                    Packet::MigrateAbort {
                        entity,
                        reason: format!("target {server} disconnected"),
                    },
                ));
                for packet in pending.buffer {
                    out.push((Destination::Server(pending.from), packet));
                }
            }
        }

        self.entity_location.retain(|_, owner| *owner != server);
        self.space_location.retain(|_, owner| *owner != server);
    }

    /// Handles a gate disconnect: its sessions are gone; owning servers are
    /// told so they unbind.
    pub fn remove_gate(&mut self, gate: GateId, out: &mut Outbox) {
        self.gates.remove(&gate);
        let sessions: Vec<SessionId> = self
            .session_gate
            .iter()
            .filter(|(_, g)| **g == gate)
            .map(|(s, _)| *s)
            .collect();
        for session in sessions {
            self.session_gate.remove(&session);
            if let Some(entity) = self.session_entity.remove(&session) {
                self.route_to_entity(
                    Peer::Gate(gate),
                    entity,
                    Packet::ClientDisconnect { session },
                    out,
                );
            }
        }
    }

    /// Expires overdue migrations: rollback to the source, or `EntityLost`
    /// when the source is unreachable.
    pub fn sweep_deadlines(&mut self, now: Instant, out: &mut Outbox) {
        let expired: Vec<EntityId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for entity in expired {
            let pending = self.pending.remove(&entity).expect("collected above");
            if self.servers.contains(&pending.from) {
                warn!(%entity, from = %pending.from, to = %pending.to, "migration timed out, rolling back");
                out.push((
                    Destination::Server(pending.from),
                    Packet::MigrateAbort {
                        entity,
                        reason: "migration deadline exceeded".into(),
                    },
                ));
                out.push((
                    Destination::Server(pending.to),
                    Packet::MigrateAbort {
                        entity,
                        reason: "migration deadline exceeded".into(),
                    },
                ));
                for packet in pending.buffer {
                    out.push((Destination::Server(pending.from), packet));
                }
            } else {
                error!(%entity, from = %pending.from, "migration timed out with unreachable source, entity is gone");
                self.entity_location.remove(&entity);
                self.space_location.remove(&entity);
                out.push((
                    Destination::Server(pending.to),
                    Packet::ErrorNotify {
                        kind: ErrorKind::EntityLost,
                        about: Some(entity),
                        detail: "source unreachable at migration deadline".into(),
                    },
                ));
            }
        }
    }

    /// Processes one packet from a registered peer.
    pub fn handle(&mut self, origin: Peer, packet: Packet, now: Instant, out: &mut Outbox) {
        match packet {
            Packet::RegisterEntity {
                entity,
                type_name,
                space,
                space_kind,
            } => self.on_register_entity(origin, entity, type_name, space, space_kind, out),
            Packet::UnregisterEntity { entity } => {
                if let Peer::Server(server) = origin {
                    if self.entity_location.get(&entity) == Some(&server) {
                        self.entity_location.remove(&entity);
                        self.space_location.remove(&entity);
                    }
                }
            }
            Packet::Call {
                from,
                to,
                method,
                args,
            } => {
                let call = Packet::Call {
                    from,
                    to,
                    method,
                    args,
                };
                self.route_to_entity(origin, to, call, out);
            }
            packet @ (Packet::AttrSet { .. }
            | Packet::AttrDel { .. }
            | Packet::ListAppend { .. }
            | Packet::ListPop { .. }) => self.route_delta(packet, out),
            Packet::StartMigrate { entity, to, space } => {
                self.on_start_migrate(origin, entity, to, space, now, out);
            }
            Packet::MigrateData { entity, blob } => {
                if let Some(pending) = self.pending.get(&entity) {
                    out.push((
                        Destination::Server(pending.to),
                        Packet::MigrateData { entity, blob },
                    ));
                } else {
                    warn!(%entity, "migrate data with no pending migration dropped");
                }
            }
            Packet::MigrateReady { entity } => self.on_migrate_ready(origin, entity, out),
            Packet::MigrateAbort { entity, reason } => self.on_migrate_abort(entity, reason, out),
            Packet::ClientConnect { session, gate } => {
                self.session_gate.insert(session, gate);
                match self.pick_server() {
                    Some(server) => out.push((
                        Destination::Server(server),
                        Packet::ClientConnect { session, gate },
                    )),
                    None => out.push((
                        Destination::Gate(gate),
                        Packet::ErrorNotify {
                            kind: ErrorKind::Unavailable,
                            about: None,
                            detail: "no server available for client".into(),
                        },
                    )),
                }
            }
            Packet::ClientDisconnect { session } => {
                self.session_gate.remove(&session);
                if let Some(entity) = self.session_entity.remove(&session) {
                    self.route_to_entity(origin, entity, Packet::ClientDisconnect { session }, out);
                }
            }
            Packet::ClientCall {
                session,
                method,
                args,
            } => match self.session_entity.get(&session) {
                Some(&entity) => {
                    let call = Packet::Call {
                        from: None,
                        to: entity,
                        method,
                        args,
                    };
                    self.route_to_entity(origin, entity, call, out);
                }
                None => out.push((
                    origin.into(),
                    Packet::ErrorNotify {
                        kind: ErrorKind::UnknownEntity,
                        about: None,
                        detail: format!("session {session} is not bound"),
                    },
                )),
            },
            Packet::BindClient {
                session,
                gate,
                entity,
            } => match origin {
                // The owning server confirmed the binding; record and tell
                // the gate.
                Peer::Server(_) => {
                    self.session_entity.insert(session, entity);
                    self.session_gate.insert(session, gate);
                    out.push((
                        Destination::Gate(gate),
                        Packet::BindClient {
                            session,
                            gate,
                            entity,
                        },
                    ));
                }
                // The gate asked for a binding; forward to the owner.
                Peer::Gate(_) => {
                    self.route_to_entity(
                        origin,
                        entity,
                        Packet::BindClient {
                            session,
                            gate,
                            entity,
                        },
                        out,
                    );
                }
            },
            Packet::SpaceEntered { .. } | Packet::SpaceLeft { .. } => {
                out.push((Destination::AllGates, packet));
            }
            Packet::EnterSpaceRequest { entity, space } => {
                self.on_enter_space_request(origin, entity, space, out);
            }
            Packet::CreateEntityRequest { type_name, space } => {
                let target = space
                    .and_then(|s| self.space_location.get(&s).copied())
                    .or_else(|| self.pick_server());
                match target {
                    Some(server) => out.push((
                        Destination::Server(server),
                        Packet::CreateEntityRequest { type_name, space },
                    )),
                    None => out.push((
                        origin.into(),
                        Packet::ErrorNotify {
                            kind: ErrorKind::Unavailable,
                            about: None,
                            detail: "no server available for entity creation".into(),
                        },
                    )),
                }
            }
            Packet::ErrorNotify { kind, about, detail } => {
                debug!(%kind, ?about, detail, "peer error notification");
            }
            Packet::Tick
            | Packet::MigrateAck { .. }
            | Packet::MigrateFinish { .. }
            | Packet::LocalEnterSpace { .. }
            | Packet::EnterSpaceFailed { .. }
            | Packet::EnterSpaceResolved { .. }
            | Packet::RegisterServer { .. }
            | Packet::RegisterGate { .. } => {
                debug!(?origin, "dispatcher-bound packet type ignored");
            }
        }
    }

    fn on_register_entity(
        &mut self,
        origin: Peer,
        entity: EntityId,
        type_name: String,
        _space: Option<EntityId>,
        space_kind: Option<i64>,
        out: &mut Outbox,
    ) {
        let Peer::Server(server) = origin else {
            warn!(%entity, "entity registration from a gate dropped");
            return;
        };
        if let Some(&owner) = self.entity_location.get(&entity) {
            if owner != server {
                // Two live copies would diverge; the late registrant must die.
                error!(
                    %entity,
                    type_name,
                    first = %owner,
                    second = %server,
                    "duplicate entity registration across servers"
                );
                out.push((
                    Destination::Server(server),
                    Packet::ErrorNotify {
                        kind: ErrorKind::Fatal,
                        about: Some(entity),
                        detail: format!("entity already registered to {owner}"),
                    },
                ));
                return;
            }
        }
        self.entity_location.insert(entity, server);
        if space_kind.is_some() {
            self.space_location.insert(entity, server);
        }
    }

    fn on_start_migrate(
        &mut self,
        origin: Peer,
        entity: EntityId,
        to: ServerId,
        space: Option<EntityId>,
        now: Instant,
        out: &mut Outbox,
    ) {
        let Peer::Server(from) = origin else {
            warn!(%entity, "migration request from a gate dropped");
            return;
        };
        if self.entity_location.get(&entity) != Some(&from) {
            out.push((
                origin.into(),
                Packet::ErrorNotify {
                    kind: ErrorKind::UnknownEntity,
                    about: Some(entity),
                    detail: "migration source does not own entity".into(),
                },
            ));
            return;
        }
        if self.pending.contains_key(&entity) {
            out.push((
                origin.into(),
                Packet::ErrorNotify {
                    kind: ErrorKind::Unavailable,
                    about: Some(entity),
                    detail: "entity is already migrating".into(),
                },
            ));
            return;
        }
        if !self.servers.contains(&to) {
            out.push((
                origin.into(),
                Packet::ErrorNotify {
                    kind: ErrorKind::Unavailable,
                    about: Some(entity),
                    detail: format!("migration target {to} is not connected"),
                },
            ));
            return;
        }

        // From this point no further packets reach the source for this
        // entity; the ack travels the same connection, behind anything
        // already routed.
        self.pending.insert(
            entity,
            PendingMigration {
                from,
                to,
                space,
                buffer: Vec::new(),
                deadline: now + DISPATCHER_MIGRATE_TIMEOUT,
            },
        );
        out.push((Destination::Server(from), Packet::MigrateAck { entity }));
    }

    fn on_migrate_ready(&mut self, origin: Peer, entity: EntityId, out: &mut Outbox) {
        let Some(pending) = self.pending.remove(&entity) else {
            warn!(%entity, "migrate ready with no pending migration dropped");
            return;
        };
        if origin != Peer::Server(pending.to) {
            warn!(%entity, ?origin, "migrate ready from unexpected peer dropped");
            self.pending.insert(entity, pending);
            return;
        }

        self.entity_location.insert(entity, pending.to);
        if self.space_location.contains_key(&entity) {
            self.space_location.insert(entity, pending.to);
        }

        // Buffered packets flush in arrival order, ahead of the space entry
        // and anything routed afterwards.
        for packet in pending.buffer {
            out.push((Destination::Server(pending.to), packet));
        }
        if let Some(space) = pending.space {
            out.push((
                Destination::Server(pending.to),
                Packet::LocalEnterSpace { entity, space },
            ));
        }
        out.push((
            Destination::Server(pending.from),
            Packet::MigrateFinish { entity },
        ));
    }

    fn on_migrate_abort(&mut self, entity: EntityId, reason: String, out: &mut Outbox) {
        let Some(pending) = self.pending.remove(&entity) else {
            return;
        };
        warn!(%entity, reason, "migration aborted, routing stays at source");
        out.push((
            Destination::Server(pending.from),
            Packet::MigrateAbort {
                entity,
                reason,
            },
        ));
        for packet in pending.buffer {
            out.push((Destination::Server(pending.from), packet));
        }
    }

    fn on_enter_space_request(
        &mut self,
        origin: Peer,
        entity: EntityId,
        space: EntityId,
        out: &mut Outbox,
    ) {
        let Peer::Server(from) = origin else {
            return;
        };
        match self.space_location.get(&space) {
            Some(&owner) if owner == from => {
                out.push((
                    Destination::Server(from),
                    Packet::LocalEnterSpace { entity, space },
                ));
            }
            Some(&owner) => {
                out.push((
                    Destination::Server(from),
                    Packet::EnterSpaceResolved {
                        entity,
                        space,
                        server: owner,
                    },
                ));
            }
            None => {
                out.push((
                    Destination::Server(from),
                    Packet::EnterSpaceFailed {
                        entity,
                        space,
                        reason: "space not registered".into(),
                    },
                ));
            }
        }
    }

    fn route_delta(&mut self, packet: Packet, out: &mut Outbox) {
        let scope = match &packet {
            Packet::AttrSet { scope, .. }
            | Packet::AttrDel { scope, .. }
            | Packet::ListAppend { scope, .. }
            | Packet::ListPop { scope, .. } => *scope,
            _ => return,
        };
        match scope {
            DeltaScope::OwnClient { gate, .. } => out.push((Destination::Gate(gate), packet)),
            DeltaScope::Space { .. } => out.push((Destination::AllGates, packet)),
        }
    }

    // Routes an entity-addressed packet: forward, buffer, or bounce.
    fn route_to_entity(&mut self, origin: Peer, entity: EntityId, packet: Packet, out: &mut Outbox) {
        if let Some(pending) = self.pending.get_mut(&entity) {
            pending.buffer.push(packet);
            return;
        }
        match self.entity_location.get(&entity) {
            Some(&owner) => out.push((Destination::Server(owner), packet)),
            None => {
                self.unknown_drops += 1;
                if self.unknown_drops % UNKNOWN_DROP_LOG_EVERY == 1 {
                    warn!(
                        %entity,
                        total_drops = self.unknown_drops,
                        "packet for unknown entity dropped"
                    );
                }
                out.push((
                    origin.into(),
                    Packet::ErrorNotify {
                        kind: ErrorKind::UnknownEntity,
                        about: Some(entity),
                        detail: "entity not in routing table".into(),
                    },
                ));
            }
        }
    }

    fn pick_server(&mut self) -> Option<ServerId> {
        if self.servers.is_empty() {
            return None;
        }
        let index = self.round_robin % self.servers.len();
        self.round_robin = self.round_robin.wrapping_add(1);
        self.servers.iter().nth(index).copied()
    }
}
