//! # Meridian Wire Protocol
//!
//! Everything that crosses a process boundary in a meridian cluster is framed
//! and encoded by this crate. The format is deliberately small:
//!
//! * **Framing**: `[length:u32 LE][type:u16 LE][payload]`, where `length`
//!   covers the type word plus the payload. Frames are capped at 2 MiB;
//!   anything larger is treated as a peer bug and terminates the connection.
//! * **Values**: a self-describing, type-tagged encoding for booleans,
//!   64-bit integers, floats, strings, byte blobs, ordered lists, and ordered
//!   string-keyed mappings. Entity attribute trees, call arguments, and
//!   persisted blobs all use this one encoding.
//! * **Packets**: a closed set of typed messages ([`Packet`]) with stable
//!   `u16` wire codes, used on every dispatcher/server/gate link.
//!
//! Decoding failures are never recovered from: a malformed frame means the
//! peer is broken, and the owning connection is dropped.

pub mod error;
pub mod frame;
pub mod ids;
pub mod packets;
pub mod peer;
pub mod pool;
pub mod value;

pub use error::ProtoError;
pub use frame::{
    encode_frame_into, read_frame, read_packet, run_coalescing_writer, write_frame,
    COALESCE_DELAY, FRAME_HEADER_SIZE, MAX_FRAME_SIZE,
};
pub use ids::{EntityId, ErrorKind, GateId, ServerId, SessionId};
pub use packets::{DeltaScope, Packet};
pub use peer::{DispatcherLink, LinkConfig, RegistrationFn, PACKET_QUEUE_SIZE};
pub use pool::BufferPool;
pub use value::Value;

/// Deadline for a whole migration, from `StartMigrate` to `MigrateReady`.
///
/// A protocol constant: the dispatcher enforces it and servers derive their
/// enter-space deadline from it, so both sides must agree.
pub const DISPATCHER_MIGRATE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
