//! # Meridian Gate
//!
//! The client-facing edge of a meridian cluster. A gate terminates many
//! client TCP connections, tags inbound calls with their session id, and
//! forwards them over its dispatcher link; outbound, it receives attribute
//! delta packets and delivers each only to the sessions subscribed to it:
//! the session bound to the source entity for owner-visible deltas, plus
//! every session whose bound entity shares the source's space for
//! all-visible ones.
//!
//! Backpressure is asymmetric on purpose: a slow client overflows its
//! bounded outbound queue and is dropped (it can reconnect and resync), but
//! server-bound packets are never dropped; the gate simply stops reading
//! from the client socket, letting TCP push back.

pub mod fanout;
pub mod service;
pub mod session;

pub use fanout::fanout_targets;
pub use service::{GateConfig, GateError, GateHandle, GateNode};
pub use session::{SessionManager, CLIENT_SEND_QUEUE_SIZE};
