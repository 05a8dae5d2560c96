//! Typed packets and their wire codes.
//!
//! Every message on a dispatcher/server/gate link is one of the [`Packet`]
//! variants below. Wire codes are stable; adding a variant means picking a
//! new code, never renumbering.
//!
//! | Code | Packet |
//! |---|---|
//! | 1-3 | entity registration and calls |
//! | 4-7 | attribute deltas |
//! | 8-13 | migration protocol |
//! | 20-23 | client session lifecycle |
//! | 24-25 | space membership notifications |
//! | 30 | intra-process tick |
//! | 40-43 | enter-space brokering |
//! | 50 | typed error notification |
//! | 60-62 | peer registration and placement |

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtoError;
use crate::ids::{EntityId, ErrorKind, GateId, ServerId, SessionId};
use crate::value::{get_len, get_str, get_u8, need, put_str, Value};

/// Who may observe an attribute delta leaving the owning server.
///
/// Server-only attributes never reach the wire, so the scope set here is
/// strictly the client-visible half of the visibility model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaScope {
    /// Only the session bound to the source entity sees the delta.
    OwnClient {
        /// The bound session.
        session: SessionId,
        /// The gate hosting that session.
        gate: GateId,
    },
    /// Every session whose bound entity shares the source's space sees it.
    Space {
        /// The space the source entity is in.
        space: EntityId,
    },
}

/// A decoded inter-process message.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Server → dispatcher: this server now hosts `entity`.
    ///
    /// `space` is the space the entity currently occupies; `space_kind` is
    /// set when the entity is itself a space, so the dispatcher can record
    /// its location for enter-space resolution.
    RegisterEntity {
        entity: EntityId,
        type_name: String,
        space: Option<EntityId>,
        space_kind: Option<i64>,
    },
    /// Server → dispatcher: `entity` was destroyed locally.
    UnregisterEntity { entity: EntityId },
    /// Cross-entity method call, routed by `to`.
    Call {
        from: Option<EntityId>,
        to: EntityId,
        method: String,
        args: Vec<Value>,
    },
    /// Attribute subtree replaced or inserted.
    AttrSet {
        entity: EntityId,
        path: Vec<String>,
        key: String,
        value: Value,
        scope: DeltaScope,
    },
    /// Attribute removed.
    AttrDel {
        entity: EntityId,
        path: Vec<String>,
        key: String,
        scope: DeltaScope,
    },
    /// Item appended to an attribute list.
    ListAppend {
        entity: EntityId,
        path: Vec<String>,
        key: String,
        value: Value,
        scope: DeltaScope,
    },
    /// Item popped from an attribute list.
    ListPop {
        entity: EntityId,
        path: Vec<String>,
        key: String,
        scope: DeltaScope,
    },
    /// Source server → dispatcher: begin migrating `entity` to `to`.
    ///
    /// `space` carries the destination space when the migration implements
    /// an enter-space operation; the dispatcher delivers a matching
    /// `LocalEnterSpace` to the target server after the handover completes.
    StartMigrate {
        entity: EntityId,
        to: ServerId,
        space: Option<EntityId>,
    },
    /// Dispatcher → source server: routing is paused, send the snapshot.
    MigrateAck { entity: EntityId },
    /// Source server → dispatcher → target server: serialized entity state.
    MigrateData { entity: EntityId, blob: Vec<u8> },
    /// Target server → dispatcher: entity restored, flush buffered packets.
    MigrateReady { entity: EntityId },
    /// Dispatcher → source server: handover done, discard the local copy.
    MigrateFinish { entity: EntityId },
    /// Dispatcher → both servers: migration failed, routing rolled back.
    MigrateAbort { entity: EntityId, reason: String },
    /// Gate → dispatcher: a client connected and needs a bound entity.
    ClientConnect { session: SessionId, gate: GateId },
    /// Gate → dispatcher → owning server: the client went away.
    ClientDisconnect { session: SessionId },
    /// Gate → dispatcher → owning server: client-originated call.
    ClientCall {
        session: SessionId,
        method: String,
        args: Vec<Value>,
    },
    /// Owning server → dispatcher → gate: session is bound to `entity`.
    BindClient {
        session: SessionId,
        gate: GateId,
        entity: EntityId,
    },
    /// Server → dispatcher → gates: `entity` joined `space`.
    SpaceEntered {
        entity: EntityId,
        space: EntityId,
        kind: i64,
    },
    /// Server → dispatcher → gates: `entity` left `space`.
    SpaceLeft { entity: EntityId, space: EntityId },
    /// Intra-process heartbeat driving timers and deferred work.
    Tick,
    /// Server → dispatcher: move `entity` into `space`, wherever it lives.
    EnterSpaceRequest { entity: EntityId, space: EntityId },
    /// Dispatcher → server: source and space share a server, enter locally.
    LocalEnterSpace { entity: EntityId, space: EntityId },
    /// Dispatcher → requesting server: the enter-space operation failed.
    EnterSpaceFailed {
        entity: EntityId,
        space: EntityId,
        reason: String,
    },
    /// Dispatcher → requesting server: the space lives on `server`; migrate
    /// the entity there to complete the enter.
    EnterSpaceResolved {
        entity: EntityId,
        space: EntityId,
        server: ServerId,
    },
    /// Typed error carried between processes; mapped by kind, not text.
    ErrorNotify {
        kind: ErrorKind,
        about: Option<EntityId>,
        detail: String,
    },
    /// Server → dispatcher, first packet after connect or reconnect.
    RegisterServer { server: ServerId },
    /// Gate → dispatcher, first packet after connect or reconnect.
    RegisterGate { gate: GateId },
    /// Anywhere → dispatcher: create an entity on a server of the
    /// dispatcher's choosing.
    CreateEntityRequest {
        type_name: String,
        space: Option<EntityId>,
    },
}

impl Packet {
    /// The stable `u16` code written into the frame header.
    pub fn wire_type(&self) -> u16 {
        match self {
            Packet::RegisterEntity { .. } => 1,
            Packet::UnregisterEntity { .. } => 2,
            Packet::Call { .. } => 3,
            Packet::AttrSet { .. } => 4,
            Packet::AttrDel { .. } => 5,
            Packet::ListAppend { .. } => 6,
            Packet::ListPop { .. } => 7,
            Packet::StartMigrate { .. } => 8,
            Packet::MigrateAck { .. } => 9,
            Packet::MigrateData { .. } => 10,
            Packet::MigrateReady { .. } => 11,
            Packet::MigrateFinish { .. } => 12,
            Packet::MigrateAbort { .. } => 13,
            Packet::ClientConnect { .. } => 20,
            Packet::ClientDisconnect { .. } => 21,
            Packet::ClientCall { .. } => 22,
            Packet::BindClient { .. } => 23,
            Packet::SpaceEntered { .. } => 24,
            Packet::SpaceLeft { .. } => 25,
            Packet::Tick => 30,
            Packet::EnterSpaceRequest { .. } => 40,
            Packet::LocalEnterSpace { .. } => 41,
            Packet::EnterSpaceFailed { .. } => 42,
            Packet::EnterSpaceResolved { .. } => 43,
            Packet::ErrorNotify { .. } => 50,
            Packet::RegisterServer { .. } => 60,
            Packet::RegisterGate { .. } => 61,
            Packet::CreateEntityRequest { .. } => 62,
        }
    }

    /// Whether this packet must survive a dispatcher-link reconnect.
    ///
    /// Entity-control traffic is held and resent after the link recovers;
    /// client-bound attribute deltas are transient and dropped instead.
    pub fn is_entity_control(&self) -> bool {
        !matches!(
            self,
            Packet::AttrSet { .. }
                | Packet::AttrDel { .. }
                | Packet::ListAppend { .. }
                | Packet::ListPop { .. }
                | Packet::Tick
        )
    }

    /// Encodes the payload (everything after the frame header) into `buf`.
    pub fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Packet::RegisterEntity {
                entity,
                type_name,
                space,
                space_kind,
            } => {
                entity.put(buf);
                put_str(buf, type_name);
                put_opt_id(buf, space);
                match space_kind {
                    Some(kind) => {
                        buf.put_u8(1);
                        buf.put_i64_le(*kind);
                    }
                    None => buf.put_u8(0),
                }
            }
            Packet::UnregisterEntity { entity } => entity.put(buf),
            Packet::Call {
                from,
                to,
                method,
                args,
            } => {
                put_opt_id(buf, from);
                to.put(buf);
                put_str(buf, method);
                buf.put_u32_le(args.len() as u32);
                for arg in args {
                    arg.encode(buf);
                }
            }
            Packet::AttrSet {
                entity,
                path,
                key,
                value,
                scope,
            } => {
                entity.put(buf);
                put_path(buf, path);
                put_str(buf, key);
                value.encode(buf);
                put_scope(buf, scope);
            }
            Packet::AttrDel {
                entity,
                path,
                key,
                scope,
            } => {
                entity.put(buf);
                put_path(buf, path);
                put_str(buf, key);
                put_scope(buf, scope);
            }
            Packet::ListAppend {
                entity,
                path,
                key,
                value,
                scope,
            } => {
                entity.put(buf);
                put_path(buf, path);
                put_str(buf, key);
                value.encode(buf);
                put_scope(buf, scope);
            }
            Packet::ListPop {
                entity,
                path,
                key,
                scope,
            } => {
                entity.put(buf);
                put_path(buf, path);
                put_str(buf, key);
                put_scope(buf, scope);
            }
            Packet::StartMigrate { entity, to, space } => {
                entity.put(buf);
                buf.put_u16_le(to.0);
                put_opt_id(buf, space);
            }
            Packet::MigrateAck { entity }
            | Packet::MigrateReady { entity }
            | Packet::MigrateFinish { entity } => entity.put(buf),
            Packet::MigrateData { entity, blob } => {
                entity.put(buf);
                buf.put_u32_le(blob.len() as u32);
                buf.put_slice(blob);
            }
            Packet::MigrateAbort { entity, reason } => {
                entity.put(buf);
                put_str(buf, reason);
            }
            Packet::ClientConnect { session, gate } => {
                session.put(buf);
                buf.put_u16_le(gate.0);
            }
            Packet::ClientDisconnect { session } => session.put(buf),
            Packet::ClientCall {
                session,
                method,
                args,
            } => {
                session.put(buf);
                put_str(buf, method);
                buf.put_u32_le(args.len() as u32);
                for arg in args {
                    arg.encode(buf);
                }
            }
            Packet::BindClient {
                session,
                gate,
                entity,
            } => {
                session.put(buf);
                buf.put_u16_le(gate.0);
                entity.put(buf);
            }
            Packet::SpaceEntered {
                entity,
                space,
                kind,
            } => {
                entity.put(buf);
                space.put(buf);
                buf.put_i64_le(*kind);
            }
            Packet::SpaceLeft { entity, space } => {
                entity.put(buf);
                space.put(buf);
            }
            Packet::Tick => {}
            Packet::EnterSpaceRequest { entity, space }
            | Packet::LocalEnterSpace { entity, space } => {
                entity.put(buf);
                space.put(buf);
            }
            Packet::EnterSpaceFailed {
                entity,
                space,
                reason,
            } => {
                entity.put(buf);
                space.put(buf);
                put_str(buf, reason);
            }
            Packet::EnterSpaceResolved {
                entity,
                space,
                server,
            } => {
                entity.put(buf);
                space.put(buf);
                buf.put_u16_le(server.0);
            }
            Packet::ErrorNotify {
                kind,
                about,
                detail,
            } => {
                buf.put_u8(kind.wire_code());
                put_opt_id(buf, about);
                put_str(buf, detail);
            }
            Packet::RegisterServer { server } => buf.put_u16_le(server.0),
            Packet::RegisterGate { gate } => buf.put_u16_le(gate.0),
            Packet::CreateEntityRequest { type_name, space } => {
                put_str(buf, type_name);
                put_opt_id(buf, space);
            }
        }
    }

    /// Encodes a complete frame (header + payload) into `buf`.
    pub fn encode_frame(&self, buf: &mut BytesMut) -> Result<(), ProtoError> {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload);
        crate::frame::encode_frame_into(buf, self.wire_type(), &payload)
    }

    /// Decodes a packet from a frame's type code and payload.
    pub fn decode(packet_type: u16, payload: &mut impl Buf) -> Result<Packet, ProtoError> {
        let packet = match packet_type {
            1 => {
                let entity = EntityId::get(payload)?;
                let type_name = get_str(payload)?;
                let space = get_opt_id(payload)?;
                let space_kind = match get_u8(payload)? {
                    0 => None,
                    _ => {
                        need(payload, 8)?;
                        Some(payload.get_i64_le())
                    }
                };
                Packet::RegisterEntity {
                    entity,
                    type_name,
                    space,
                    space_kind,
                }
            }
            2 => Packet::UnregisterEntity {
                entity: EntityId::get(payload)?,
            },
            3 => Packet::Call {
                from: get_opt_id(payload)?,
                to: EntityId::get(payload)?,
                method: get_str(payload)?,
                args: get_args(payload)?,
            },
            4 => Packet::AttrSet {
                entity: EntityId::get(payload)?,
                path: get_path(payload)?,
                key: get_str(payload)?,
                value: Value::decode(payload)?,
                scope: get_scope(payload)?,
            },
            5 => Packet::AttrDel {
                entity: EntityId::get(payload)?,
                path: get_path(payload)?,
                key: get_str(payload)?,
                scope: get_scope(payload)?,
            },
            6 => Packet::ListAppend {
                entity: EntityId::get(payload)?,
                path: get_path(payload)?,
                key: get_str(payload)?,
                value: Value::decode(payload)?,
                scope: get_scope(payload)?,
            },
            7 => Packet::ListPop {
                entity: EntityId::get(payload)?,
                path: get_path(payload)?,
                key: get_str(payload)?,
                scope: get_scope(payload)?,
            },
            8 => {
                let entity = EntityId::get(payload)?;
                need(payload, 2)?;
                let to = ServerId(payload.get_u16_le());
                let space = get_opt_id(payload)?;
                Packet::StartMigrate { entity, to, space }
            }
            9 => Packet::MigrateAck {
                entity: EntityId::get(payload)?,
            },
            10 => {
                let entity = EntityId::get(payload)?;
                let len = get_len(payload)?;
                need(payload, len)?;
                let mut blob = vec![0u8; len];
                payload.copy_to_slice(&mut blob);
                Packet::MigrateData { entity, blob }
            }
            11 => Packet::MigrateReady {
                entity: EntityId::get(payload)?,
            },
            12 => Packet::MigrateFinish {
                entity: EntityId::get(payload)?,
            },
            13 => Packet::MigrateAbort {
                entity: EntityId::get(payload)?,
                reason: get_str(payload)?,
            },
            20 => Packet::ClientConnect {
                session: SessionId::get(payload)?,
                gate: get_gate(payload)?,
            },
            21 => Packet::ClientDisconnect {
                session: SessionId::get(payload)?,
            },
            22 => Packet::ClientCall {
                session: SessionId::get(payload)?,
                method: get_str(payload)?,
                args: get_args(payload)?,
            },
            23 => Packet::BindClient {
                session: SessionId::get(payload)?,
                gate: get_gate(payload)?,
                entity: EntityId::get(payload)?,
            },
            24 => {
                let entity = EntityId::get(payload)?;
                let space = EntityId::get(payload)?;
                need(payload, 8)?;
                let kind = payload.get_i64_le();
                Packet::SpaceEntered {
                    entity,
                    space,
                    kind,
                }
            }
            25 => Packet::SpaceLeft {
                entity: EntityId::get(payload)?,
                space: EntityId::get(payload)?,
            },
            30 => Packet::Tick,
            40 => Packet::EnterSpaceRequest {
                entity: EntityId::get(payload)?,
                space: EntityId::get(payload)?,
            },
            41 => Packet::LocalEnterSpace {
                entity: EntityId::get(payload)?,
                space: EntityId::get(payload)?,
            },
            42 => Packet::EnterSpaceFailed {
                entity: EntityId::get(payload)?,
                space: EntityId::get(payload)?,
                reason: get_str(payload)?,
            },
            43 => {
                let entity = EntityId::get(payload)?;
                let space = EntityId::get(payload)?;
                need(payload, 2)?;
                Packet::EnterSpaceResolved {
                    entity,
                    space,
                    server: ServerId(payload.get_u16_le()),
                }
            }
            50 => Packet::ErrorNotify {
                kind: ErrorKind::from_wire(get_u8(payload)?)?,
                about: get_opt_id(payload)?,
                detail: get_str(payload)?,
            },
            60 => {
                need(payload, 2)?;
                Packet::RegisterServer {
                    server: ServerId(payload.get_u16_le()),
                }
            }
            61 => {
                need(payload, 2)?;
                Packet::RegisterGate {
                    gate: GateId(payload.get_u16_le()),
                }
            }
            62 => Packet::CreateEntityRequest {
                type_name: get_str(payload)?,
                space: get_opt_id(payload)?,
            },
            other => return Err(ProtoError::UnknownPacketType(other)),
        };
        Ok(packet)
    }
}

fn put_opt_id(buf: &mut BytesMut, id: &Option<EntityId>) {
    match id {
        Some(id) => {
            buf.put_u8(1);
            id.put(buf);
        }
        None => buf.put_u8(0),
    }
}

fn get_opt_id(buf: &mut impl Buf) -> Result<Option<EntityId>, ProtoError> {
    match get_u8(buf)? {
        0 => Ok(None),
        _ => Ok(Some(EntityId::get(buf)?)),
    }
}

fn put_path(buf: &mut BytesMut, path: &[String]) {
    buf.put_u32_le(path.len() as u32);
    for segment in path {
        put_str(buf, segment);
    }
}

fn get_path(buf: &mut impl Buf) -> Result<Vec<String>, ProtoError> {
    let count = get_len(buf)?;
    let mut path = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        path.push(get_str(buf)?);
    }
    Ok(path)
}

fn get_args(buf: &mut impl Buf) -> Result<Vec<Value>, ProtoError> {
    let count = get_len(buf)?;
    let mut args = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        args.push(Value::decode(buf)?);
    }
    Ok(args)
}

fn get_gate(buf: &mut impl Buf) -> Result<GateId, ProtoError> {
    need(buf, 2)?;
    Ok(GateId(buf.get_u16_le()))
}

fn put_scope(buf: &mut BytesMut, scope: &DeltaScope) {
    match scope {
        DeltaScope::OwnClient { session, gate } => {
            buf.put_u8(1);
            session.put(buf);
            buf.put_u16_le(gate.0);
        }
        DeltaScope::Space { space } => {
            buf.put_u8(2);
            space.put(buf);
        }
    }
}

fn get_scope(buf: &mut impl Buf) -> Result<DeltaScope, ProtoError> {
    match get_u8(buf)? {
        1 => Ok(DeltaScope::OwnClient {
            session: SessionId::get(buf)?,
            gate: get_gate(buf)?,
        }),
        2 => Ok(DeltaScope::Space {
            space: EntityId::get(buf)?,
        }),
        other => Err(ProtoError::Malformed {
            packet: "AttrDelta",
            detail: format!("unknown delta scope {other}"),
        }),
    }
}
