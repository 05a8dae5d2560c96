//! # Meridian Entity System
//!
//! The in-process half of the cluster: entity state, behavior registration,
//! and the serial execution model.
//!
//! * [`attrs`]: the per-entity attribute tree with change tracking. Every
//!   mutation is recorded and later journaled, broadcast to clients, and
//!   observed by registered callbacks.
//! * [`kinds`]: the entity type registry. Behavior is declared up front as
//!   explicit method and observer tables; there is no dispatch by reflection.
//! * [`entity`]: the entity itself: attributes, client binding, timers, and
//!   the request-id → continuation table for cross-entity round trips.
//! * [`runtime`]: one lightweight task per entity consuming an ordered
//!   mailbox. At most one command runs against an entity at a time, and
//!   commands run in arrival order.
//! * [`timer`]: the process-wide timer wheel, ticked every 10 ms.
//! * [`registry`]: the `EntityId → handle` table and the space index.

pub mod attrs;
pub mod entity;
pub mod kinds;
pub mod registry;
pub mod runtime;
pub mod timer;

pub use attrs::{AttrChange, AttrTree};
pub use entity::{ClientRef, Entity, EntityContext, EntityError};
pub use kinds::{AttrVisibility, EntityTypeDef, EntityTypeRegistry, SPACE_KIND_MAX, SPACE_KIND_MIN};
pub use registry::EntityRegistry;
pub use runtime::{
    seed_from_blob, spawn_entity, EntityCommand, EntityHandle, EntitySeed, HostEvent, MEMBERS_KEY,
    RESUME_METHOD, SPACE_ADD_METHOD, SPACE_REMOVE_METHOD,
};
pub use timer::{TimerHandle, TimerWheel, SERVER_TICK_INTERVAL};

pub use meridian_proto::{EntityId, GateId, ServerId, SessionId};
