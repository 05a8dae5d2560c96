//! Cluster-wide identifier types.
//!
//! All identifiers are newtypes so an [`EntityId`] can never be confused with
//! a [`SessionId`] at a call site. Entity and session ids are UUIDs rendered
//! as fixed-width 32-character lowercase hex; server and gate ids are small
//! integers assigned by configuration and survive process restarts.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtoError;

/// Globally unique, opaque identifier for an entity.
///
/// Assigned once at creation and immutable for the entity's lifetime; this is
/// the addressing key on every hop between gate, dispatcher, and server.
///
/// The display form is always exactly 32 lowercase hex characters, so ids
/// sort and compare as fixed-width strings (the persisted keyspace relies on
/// this).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// String length of the display form.
    pub const STR_LEN: usize = 32;

    /// Creates a new random entity id (UUID v4).
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an id from its 32-character hex form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    pub(crate) fn put(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.0.as_bytes());
    }

    pub(crate) fn get(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        if buf.remaining() < 16 {
            return Err(ProtoError::Truncated {
                needed: 16,
                have: buf.remaining(),
            });
        }
        let mut raw = [0u8; 16];
        buf.copy_to_slice(&mut raw);
        Ok(Self(Uuid::from_bytes(raw)))
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl std::str::FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identifier of a client session, assigned by the gate that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a new random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub(crate) fn put(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.0.as_bytes());
    }

    pub(crate) fn get(buf: &mut impl Buf) -> Result<Self, ProtoError> {
        EntityId::get(buf).map(|id| Self(id.0))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identifier of a hosting server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub u16);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

/// Identifier of a gate (client edge) process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GateId(pub u16);

impl std::fmt::Display for GateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gate-{}", self.0)
    }
}

/// Error kinds carried by `ErrorNotify` packets.
///
/// Receivers map errors by kind, never by the free-text detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The peer link was down while the operation was in flight.
    Unavailable,
    /// The addressed entity is not in the routing table.
    UnknownEntity,
    /// A deadline expired before the operation completed.
    Timeout,
    /// The peer sent a frame we could not decode.
    Decode,
    /// The storage backend failed; the operation is retryable.
    Storage,
    /// The entity was lost during a failed migration. Fatal for the entity.
    EntityLost,
    /// Invariant violation; the receiving process must abort.
    Fatal,
}

impl ErrorKind {
    pub(crate) fn wire_code(self) -> u8 {
        match self {
            ErrorKind::Unavailable => 1,
            ErrorKind::UnknownEntity => 2,
            ErrorKind::Timeout => 3,
            ErrorKind::Decode => 4,
            ErrorKind::Storage => 5,
            ErrorKind::EntityLost => 6,
            ErrorKind::Fatal => 7,
        }
    }

    pub(crate) fn from_wire(code: u8) -> Result<Self, ProtoError> {
        Ok(match code {
            1 => ErrorKind::Unavailable,
            2 => ErrorKind::UnknownEntity,
            3 => ErrorKind::Timeout,
            4 => ErrorKind::Decode,
            5 => ErrorKind::Storage,
            6 => ErrorKind::EntityLost,
            7 => ErrorKind::Fatal,
            other => {
                return Err(ProtoError::Malformed {
                    packet: "ErrorNotify",
                    detail: format!("unknown error kind {other}"),
                })
            }
        })
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::UnknownEntity => "unknown-entity",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Decode => "decode",
            ErrorKind::Storage => "storage",
            ErrorKind::EntityLost => "entity-lost",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_display_is_fixed_width() {
        for _ in 0..64 {
            let id = EntityId::new();
            assert_eq!(id.to_string().len(), EntityId::STR_LEN);
        }
    }

    #[test]
    fn entity_id_parse_roundtrip() {
        let id = EntityId::new();
        let parsed = EntityId::parse(&id.to_string()).expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn error_kind_wire_roundtrip() {
        let kinds = [
            ErrorKind::Unavailable,
            ErrorKind::UnknownEntity,
            ErrorKind::Timeout,
            ErrorKind::Decode,
            ErrorKind::Storage,
            ErrorKind::EntityLost,
            ErrorKind::Fatal,
        ];
        for kind in kinds {
            assert_eq!(ErrorKind::from_wire(kind.wire_code()).expect("known"), kind);
        }
        assert!(ErrorKind::from_wire(0).is_err());
        assert!(ErrorKind::from_wire(200).is_err());
    }
}
