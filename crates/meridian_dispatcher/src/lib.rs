//! # Meridian Dispatcher
//!
//! The cluster's single source of truth for entity and space placement, and
//! the broker for every inter-process message and entity migration.
//!
//! The dispatcher is an owned actor: [`Dispatcher::start`] spawns the serial
//! routing task plus the TCP service, and returns a [`DispatcherHandle`] for
//! shutdown. All routing-table mutations happen on the one actor task;
//! per-connection reader tasks only decode frames and forward them, so
//! per-connection FIFO order is preserved end to end and there is no global
//! reordering.
//!
//! The pure routing logic lives in [`routing`] and is driven entirely by
//! values in and `(destination, packet)` pairs out, which is what the
//! property tests exercise.

pub mod routing;
pub mod service;

pub use routing::{Destination, Peer, RoutingTable, DISPATCHER_MIGRATE_TIMEOUT, UNKNOWN_DROP_LOG_EVERY};
pub use service::{Dispatcher, DispatcherConfig, DispatcherError, DispatcherHandle, PACKET_QUEUE_SIZE};
