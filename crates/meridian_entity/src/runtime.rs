//! The per-entity serial runtime.
//!
//! Every entity gets its own lightweight task consuming an ordered mailbox of
//! [`EntityCommand`]s. Two commands posted in order execute in that order and
//! never interleave; commands for different entities run concurrently. This
//! is the whole concurrency story for entity state; nothing else ever
//! touches an [`Entity`].
//!
//! After each command the runtime *flushes*: recorded attribute changes are
//! journaled, turned into client delta packets where visible, and handed to
//! their observers; effects collected in the [`EntityContext`] become
//! [`HostEvent`]s for the hosting server. Observers may mutate attributes
//! themselves, so the flush loops until the change log is empty.
//!
//! Timers do not survive a migration freeze; an entity re-arms what it needs
//! from its `on_enter_space` handler on the target server.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use meridian_proto::{DeltaScope, EntityId, GateId, Packet, SessionId, Value};

use crate::attrs::{AttrChange, AttrTree};
use crate::entity::{ClientRef, Effect, Entity, EntityContext, EntityError};
use crate::kinds::{AttrVisibility, EntityTypeDef};
use crate::timer::TimerWheel;

use std::sync::Arc;

/// Method name reserved for resuming a request-style call.
pub const RESUME_METHOD: &str = "__resume__";
/// Built-in method adding a member to a space entity.
pub const SPACE_ADD_METHOD: &str = "__space_add__";
/// Built-in method removing a member from a space entity.
pub const SPACE_REMOVE_METHOD: &str = "__space_remove__";
/// Root attribute key under which a space tracks its member set.
pub const MEMBERS_KEY: &str = "members";

/// A command in an entity's mailbox.
#[derive(Debug)]
pub enum EntityCommand {
    /// Execute a method call.
    Call {
        from: Option<EntityId>,
        method: String,
        args: Vec<Value>,
    },
    /// A wheel timer fired; run its callback if still live.
    TimerFired { timer: u64 },
    /// A client session was bound to this entity.
    BindClient { session: SessionId, gate: GateId },
    /// The bound client went away.
    UnbindClient,
    /// The entity's space membership changed.
    SetSpace { space: Option<EntityId> },
    /// Serialize the attribute tree for a periodic save.
    Snapshot { reply: oneshot::Sender<Vec<u8>> },
    /// Serialize for migration and stop; replies with the blob.
    Freeze { reply: oneshot::Sender<Vec<u8>> },
    /// Destroy the entity.
    Destroy,
}

/// Events the runtime raises toward the hosting server.
#[derive(Debug)]
pub enum HostEvent {
    /// A packet to route (the server may shortcut locally addressed calls).
    Packet(Packet),
    /// A handler asked for a new entity.
    CreateEntity {
        type_name: String,
        space: Option<EntityId>,
        by: EntityId,
    },
    /// A handler asked to move its entity into a space.
    EnterSpace { entity: EntityId, space: EntityId },
    /// A handler asked to leave the current space.
    LeaveSpace { entity: EntityId },
    /// The entity has unsaved persistent changes.
    Dirty(EntityId),
    /// The entity is gone; `snapshot` carries the final persistent state.
    Destroyed {
        entity: EntityId,
        snapshot: Option<Vec<u8>>,
    },
}

/// Initial state for a spawned entity.
#[derive(Debug, Default)]
pub struct EntitySeed {
    pub attrs: AttrTree,
    pub space: Option<EntityId>,
    pub client: Option<ClientRef>,
}

impl EntitySeed {
    /// A seed with no attributes, space, or client.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Decodes a migration blob into its type name and seed.
pub fn seed_from_blob(blob: &[u8]) -> Result<(String, EntitySeed), EntityError> {
    let value = Value::decode_from_slice(blob).map_err(|e| EntityError::BadBlob {
        detail: e.to_string(),
    })?;
    let Value::Map(mut root) = value else {
        return Err(EntityError::BadBlob {
            detail: "blob root is not a map".into(),
        });
    };

    let type_name = match root.remove("type") {
        Some(Value::Str(s)) => s,
        other => {
            return Err(EntityError::BadBlob {
                detail: format!("missing or non-string type field: {other:?}"),
            })
        }
    };
    let attrs = match root.remove("attrs") {
        Some(Value::Map(m)) => AttrTree::from_snapshot(m),
        other => {
            return Err(EntityError::BadBlob {
                detail: format!("missing or non-map attrs field: {other:?}"),
            })
        }
    };
    let space = match root.remove("space") {
        Some(Value::Str(s)) => Some(EntityId::parse(&s).map_err(|e| EntityError::BadBlob {
            detail: format!("bad space id: {e}"),
        })?),
        _ => None,
    };
    let client = match (root.remove("session"), root.remove("gate")) {
        (Some(Value::Str(session)), Some(Value::Uint(gate))) => Some(ClientRef {
            session: SessionId(
                uuid::Uuid::parse_str(&session).map_err(|e| EntityError::BadBlob {
                    detail: format!("bad session id: {e}"),
                })?,
            ),
            gate: GateId(gate as u16),
        }),
        _ => None,
    };

    Ok((
        type_name,
        EntitySeed {
            attrs,
            space,
            client,
        },
    ))
}

/// Handle to a live entity's mailbox.
#[derive(Debug, Clone)]
pub struct EntityHandle {
    id: EntityId,
    type_name: String,
    sender: mpsc::UnboundedSender<EntityCommand>,
}

impl EntityHandle {
    /// The entity's id.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The entity's type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Posts a command to the mailbox, preserving post order.
    ///
    /// Returns `false` if the entity's task has already stopped.
    pub fn post(&self, command: EntityCommand) -> bool {
        self.sender.send(command).is_ok()
    }

    /// Whether the entity's task has stopped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Spawns an entity task and returns its mailbox handle.
pub fn spawn_entity(
    id: EntityId,
    typ: Arc<EntityTypeDef>,
    seed: EntitySeed,
    wheel: Arc<TimerWheel>,
    events: mpsc::UnboundedSender<HostEvent>,
) -> EntityHandle {
    let (sender, receiver) = mpsc::unbounded_channel();
    let handle = EntityHandle {
        id,
        type_name: typ.name().to_string(),
        sender,
    };
    let entity = Entity::new(
        id,
        typ,
        seed.attrs,
        seed.space,
        seed.client,
        Arc::clone(&wheel),
    );
    tokio::spawn(entity_task(entity, receiver, wheel, events));
    handle
}

async fn entity_task(
    mut entity: Entity,
    mut mailbox: mpsc::UnboundedReceiver<EntityCommand>,
    wheel: Arc<TimerWheel>,
    events: mpsc::UnboundedSender<HostEvent>,
) {
    let id = entity.id();

    {
        let mut ctx = EntityContext::for_caller(None);
        run_lifecycle(&mut entity, &mut ctx, "on_created", &[]);
        if flush(&mut entity, ctx, &events) {
            destroy(&mut entity, &wheel, &events);
            return;
        }
    }

    while let Some(command) = mailbox.recv().await {
        let destroy_requested = match command {
            EntityCommand::Call { from, method, args } => {
                handle_call(&mut entity, &events, from, method, args)
            }
            EntityCommand::TimerFired { timer } => {
                if entity.is_destroyed() {
                    false
                } else {
                    let mut ctx = EntityContext::for_caller(None);
                    entity.run_timer(&mut ctx, timer);
                    flush(&mut entity, ctx, &events)
                }
            }
            EntityCommand::BindClient { session, gate } => {
                entity.set_client(Some(ClientRef { session, gate }));
                let mut ctx = EntityContext::for_caller(None);
                run_lifecycle(&mut entity, &mut ctx, "on_client_connected", &[]);
                flush(&mut entity, ctx, &events)
            }
            EntityCommand::UnbindClient => {
                entity.set_client(None);
                let mut ctx = EntityContext::for_caller(None);
                run_lifecycle(&mut entity, &mut ctx, "on_client_disconnected", &[]);
                flush(&mut entity, ctx, &events)
            }
            EntityCommand::SetSpace { space } => {
                let previous = entity.space();
                entity.set_space(space);
                let mut ctx = EntityContext::for_caller(None);
                if let Some(old) = previous {
                    run_lifecycle(
                        &mut entity,
                        &mut ctx,
                        "on_leave_space",
                        &[Value::Str(old.to_string())],
                    );
                }
                if let Some(new) = space {
                    run_lifecycle(
                        &mut entity,
                        &mut ctx,
                        "on_enter_space",
                        &[Value::Str(new.to_string())],
                    );
                }
                flush(&mut entity, ctx, &events)
            }
            EntityCommand::Snapshot { reply } => {
                let _ = reply.send(entity.attrs.snapshot().encode_to_vec());
                false
            }
            EntityCommand::Freeze { reply } => {
                // Timers do not travel; the target server starts fresh.
                wheel.cancel_all_for(id);
                let blob = entity.migration_snapshot().encode_to_vec();
                if reply.send(blob).is_err() {
                    warn!(entity = %id, "freeze requester vanished, snapshot dropped");
                }
                debug!(entity = %id, "frozen for migration");
                return;
            }
            EntityCommand::Destroy => {
                destroy(&mut entity, &wheel, &events);
                return;
            }
        };

        if destroy_requested {
            destroy(&mut entity, &wheel, &events);
            return;
        }
    }
}

fn handle_call(
    entity: &mut Entity,
    events: &mpsc::UnboundedSender<HostEvent>,
    from: Option<EntityId>,
    method: String,
    args: Vec<Value>,
) -> bool {
    let mut ctx = EntityContext::for_caller(from);
    match method.as_str() {
        RESUME_METHOD => match args.split_first() {
            Some((Value::Uint(request_id), rest)) => {
                entity.resume_continuation(&mut ctx, *request_id, rest.to_vec());
            }
            _ => warn!(entity = %entity.id(), "resume call without request id, dropped"),
        },
        SPACE_ADD_METHOD => space_member_update(entity, &mut ctx, events, &args, true),
        SPACE_REMOVE_METHOD => space_member_update(entity, &mut ctx, events, &args, false),
        _ => match entity.type_def().method_named(&method) {
            Some(handler) => {
                if let Err(err) = handler(entity, &mut ctx, &args) {
                    warn!(entity = %entity.id(), method, %err, "method handler failed");
                }
            }
            None => {
                warn!(
                    entity = %entity.id(),
                    type_name = entity.type_def().name(),
                    method,
                    "call to unknown method dropped"
                );
            }
        },
    }
    flush(entity, ctx, events)
}

// Applies a member add/remove on a space entity: updates the member set
// attribute, notifies the gates, and runs the space's lifecycle handler.
fn space_member_update(
    entity: &mut Entity,
    ctx: &mut EntityContext,
    events: &mpsc::UnboundedSender<HostEvent>,
    args: &[Value],
    add: bool,
) {
    let Some(kind) = entity.type_def().space_kind_value() else {
        warn!(entity = %entity.id(), "space member update on non-space entity dropped");
        return;
    };
    let Some(Value::Str(member_hex)) = args.first() else {
        warn!(entity = %entity.id(), "space member update without member id dropped");
        return;
    };
    let Ok(member) = EntityId::parse(member_hex) else {
        warn!(entity = %entity.id(), member = %member_hex, "unparseable member id dropped");
        return;
    };

    let path = [MEMBERS_KEY.to_string()];
    let result = if add {
        entity.attrs.set(&path, member_hex, Value::Bool(true))
    } else {
        entity.attrs.del(&path, member_hex)
    };
    if let Err(err) = result {
        warn!(entity = %entity.id(), %err, "space member set update failed");
        return;
    }

    let packet = if add {
        Packet::SpaceEntered {
            entity: member,
            space: entity.id(),
            kind,
        }
    } else {
        Packet::SpaceLeft {
            entity: member,
            space: entity.id(),
        }
    };
    let _ = events.send(HostEvent::Packet(packet));

    let lifecycle = if add { "on_entity_enter" } else { "on_entity_leave" };
    run_lifecycle(entity, ctx, lifecycle, &[Value::Str(member_hex.clone())]);
}

fn run_lifecycle(entity: &mut Entity, ctx: &mut EntityContext, name: &str, args: &[Value]) {
    match entity.type_def().method_named(name) {
        Some(handler) => {
            if let Err(err) = handler(entity, ctx, args) {
                warn!(entity = %entity.id(), lifecycle = name, %err, "lifecycle handler failed");
            }
        }
        None => debug!(entity = %entity.id(), lifecycle = name, "no lifecycle handler"),
    }
}

/// Flushes attribute changes and collected effects after a command.
///
/// Returns `true` when a handler requested destruction.
fn flush(
    entity: &mut Entity,
    mut ctx: EntityContext,
    events: &mpsc::UnboundedSender<HostEvent>,
) -> bool {
    let mut dirty = false;

    // Observers may mutate attributes, producing further changes; loop until
    // the change log drains. Each individual change is observed exactly once.
    loop {
        let changes = entity.attrs.take_changes();
        if changes.is_empty() {
            break;
        }
        for change in changes {
            dirty = true;
            if let Some(scope) = delta_scope(entity, change.root_key()) {
                let _ = events.send(HostEvent::Packet(delta_packet(entity.id(), &change, scope)));
            }
            match entity.type_def().observer_for(change.root_key()) {
                Some(observer) => observer(entity, &mut ctx, &change),
                None => warn!(
                    entity = %entity.id(),
                    type_name = entity.type_def().name(),
                    root_key = change.root_key(),
                    "attribute change with no registered observer"
                ),
            }
        }
    }

    if dirty && entity.type_def().is_persistent() {
        let _ = events.send(HostEvent::Dirty(entity.id()));
    }

    let mut destroy_requested = false;
    for effect in ctx.take_effects() {
        match effect {
            Effect::Call { to, method, args } => {
                let _ = events.send(HostEvent::Packet(Packet::Call {
                    from: Some(entity.id()),
                    to,
                    method,
                    args,
                }));
            }
            Effect::CreateEntity { type_name, space } => {
                let _ = events.send(HostEvent::CreateEntity {
                    type_name,
                    space,
                    by: entity.id(),
                });
            }
            Effect::EnterSpace { space } => {
                let _ = events.send(HostEvent::EnterSpace {
                    entity: entity.id(),
                    space,
                });
            }
            Effect::LeaveSpace => {
                let _ = events.send(HostEvent::LeaveSpace {
                    entity: entity.id(),
                });
            }
            Effect::Destroy => destroy_requested = true,
        }
    }
    destroy_requested
}

fn destroy(entity: &mut Entity, wheel: &TimerWheel, events: &mpsc::UnboundedSender<HostEvent>) {
    let mut ctx = EntityContext::for_caller(None);
    run_lifecycle(entity, &mut ctx, "on_destroy", &[]);
    flush(entity, ctx, events);

    wheel.cancel_all_for(entity.id());
    entity.mark_destroyed();

    let snapshot = entity
        .type_def()
        .is_persistent()
        .then(|| entity.attrs.snapshot().encode_to_vec());
    let _ = events.send(HostEvent::Destroyed {
        entity: entity.id(),
        snapshot,
    });
    debug!(entity = %entity.id(), "destroyed");
}

fn delta_scope(entity: &Entity, root_key: &str) -> Option<DeltaScope> {
    match entity.type_def().visibility_of(root_key) {
        AttrVisibility::ServerOnly => None,
        AttrVisibility::OwnClient => entity.client().map(|c| DeltaScope::OwnClient {
            session: c.session,
            gate: c.gate,
        }),
        AttrVisibility::AllClients => match entity.space() {
            Some(space) => Some(DeltaScope::Space { space }),
            None => entity.client().map(|c| DeltaScope::OwnClient {
                session: c.session,
                gate: c.gate,
            }),
        },
    }
}

fn delta_packet(entity: EntityId, change: &AttrChange, scope: DeltaScope) -> Packet {
    match change {
        AttrChange::Set { path, key, value } => Packet::AttrSet {
            entity,
            path: path.clone(),
            key: key.clone(),
            value: value.clone(),
            scope,
        },
        AttrChange::Del { path, key } => Packet::AttrDel {
            entity,
            path: path.clone(),
            key: key.clone(),
            scope,
        },
        AttrChange::ListAppend { path, key, value } => Packet::ListAppend {
            entity,
            path: path.clone(),
            key: key.clone(),
            value: value.clone(),
            scope,
        },
        AttrChange::ListPop { path, key } => Packet::ListPop {
            entity,
            path: path.clone(),
            key: key.clone(),
            scope,
        },
    }
}
