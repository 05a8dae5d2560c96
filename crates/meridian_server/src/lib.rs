//! # Meridian Server Runtime
//!
//! The per-process container for entity instances. A [`ServerNode`] owns the
//! dispatcher link, the entity registry and timer wheel, the space
//! bookkeeping, and the persistence driver, and runs one orchestration task
//! that consumes the dispatcher's packet stream strictly in arrival order,
//! which, together with per-entity mailboxes, is what delivers FIFO per
//! entity across the whole cluster.
//!
//! Migration is executed here on both ends: the source freezes its entity
//! after observing `MigrateAck` in-order and ships the snapshot; the target
//! restores it and reports `MigrateReady`. The frozen snapshot is retained
//! until `MigrateFinish` so an abort can roll back.

pub mod core;
pub mod space;

pub use crate::core::{ServerConfig, ServerError, ServerHandle, ServerNode};
pub use crate::space::ENTER_SPACE_REQUEST_TIMEOUT;
