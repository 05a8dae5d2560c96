//! The entity: state, timers, and cross-entity round trips.
//!
//! An [`Entity`] is only ever touched from inside its own serial context (see
//! [`crate::runtime`]), so none of its state needs interior locking. Handlers
//! receive `&mut Entity` plus an [`EntityContext`] that collects outward
//! effects; the runtime applies those effects after the handler returns,
//! which keeps handler execution free of re-entrancy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use meridian_proto::{EntityId, ErrorKind, GateId, SessionId, Value};

use crate::attrs::AttrTree;
use crate::kinds::EntityTypeDef;
use crate::timer::{TimerHandle, TimerWheel};

/// Errors surfaced by entity operations and method handlers.
#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    /// An attribute path did not resolve.
    #[error("attribute path error: {detail}")]
    AttrPath { detail: String },

    /// A call named a method the type does not declare.
    #[error("type {type_name:?} has no method {method:?}")]
    NoSuchMethod { type_name: String, method: String },

    /// A method received arguments it could not interpret.
    #[error("bad arguments for {method:?}: {detail}")]
    BadArgs { method: String, detail: String },

    /// A handler failed for a reason of its own.
    #[error("handler error: {0}")]
    Handler(String),

    /// A migration blob could not be decoded.
    #[error("bad migration blob: {detail}")]
    BadBlob { detail: String },
}

/// The client bound to an entity, by id (the gate resolves the session).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRef {
    pub session: SessionId,
    pub gate: GateId,
}

/// An outward effect requested by a handler, applied after it returns.
#[derive(Debug)]
pub(crate) enum Effect {
    Call {
        to: EntityId,
        method: String,
        args: Vec<Value>,
    },
    CreateEntity {
        type_name: String,
        space: Option<EntityId>,
    },
    EnterSpace {
        space: EntityId,
    },
    LeaveSpace,
    Destroy,
}

/// Collects the effects of one handler invocation.
///
/// Handed to every method handler, observer, and timer callback alongside the
/// entity itself.
#[derive(Debug, Default)]
pub struct EntityContext {
    caller: Option<EntityId>,
    effects: Vec<Effect>,
}

impl EntityContext {
    pub(crate) fn for_caller(caller: Option<EntityId>) -> Self {
        Self {
            caller,
            effects: Vec::new(),
        }
    }

    /// The entity that issued the call being handled, if any.
    pub fn caller(&self) -> Option<EntityId> {
        self.caller
    }

    /// Sends a one-way call to another entity (possibly on another server).
    pub fn call(&mut self, to: EntityId, method: &str, args: Vec<Value>) {
        self.effects.push(Effect::Call {
            to,
            method: method.to_string(),
            args,
        });
    }

    /// Replies to a request-style call. `request_id` is the id the caller
    /// passed as its first argument.
    pub fn reply(&mut self, request_id: u64, mut values: Vec<Value>) {
        if let Some(caller) = self.caller {
            let mut args = vec![Value::Uint(request_id)];
            args.append(&mut values);
            self.effects.push(Effect::Call {
                to: caller,
                method: crate::runtime::RESUME_METHOD.to_string(),
                args,
            });
        } else {
            debug!(request_id, "reply with no caller to address, dropped");
        }
    }

    /// Asks the hosting server to create a new entity.
    pub fn create_entity(&mut self, type_name: &str, space: Option<EntityId>) {
        self.effects.push(Effect::CreateEntity {
            type_name: type_name.to_string(),
            space,
        });
    }

    /// Moves this entity into `space`, migrating between servers if needed.
    pub fn enter_space(&mut self, space: EntityId) {
        self.effects.push(Effect::EnterSpace { space });
    }

    /// Removes this entity from its current space.
    pub fn leave_space(&mut self) {
        self.effects.push(Effect::LeaveSpace);
    }

    /// Destroys this entity once the current command finishes.
    pub fn destroy(&mut self) {
        self.effects.push(Effect::Destroy);
    }

    pub(crate) fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }
}

/// A timer callback, run inside the entity's serial context.
pub type TimerCb = Box<dyn FnMut(&mut Entity, &mut EntityContext) + Send>;

/// A continuation resumed when a reply (or its timeout) arrives.
pub type ContinuationFn =
    Box<dyn FnOnce(&mut Entity, &mut EntityContext, Result<Vec<Value>, ErrorKind>) + Send>;

struct TimerSlot {
    cb: Option<TimerCb>,
    repeating: bool,
}

struct Continuation {
    resume: ContinuationFn,
    timeout_timer: Option<TimerHandle>,
}

/// The unit of state and behavior.
pub struct Entity {
    id: EntityId,
    typ: Arc<EntityTypeDef>,
    space: Option<EntityId>,
    client: Option<ClientRef>,
    /// The attribute tree. Mutations are tracked and flushed by the runtime
    /// after every command.
    pub attrs: AttrTree,
    timers: HashMap<u64, TimerSlot>,
    continuations: HashMap<u64, Continuation>,
    next_request: u64,
    destroyed: bool,
    wheel: Arc<TimerWheel>,
}

impl Entity {
    pub(crate) fn new(
        id: EntityId,
        typ: Arc<EntityTypeDef>,
        attrs: AttrTree,
        space: Option<EntityId>,
        client: Option<ClientRef>,
        wheel: Arc<TimerWheel>,
    ) -> Self {
        Self {
            id,
            typ,
            space,
            client,
            attrs,
            timers: HashMap::new(),
            continuations: HashMap::new(),
            next_request: 1,
            destroyed: false,
            wheel,
        }
    }

    /// This entity's id.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The type this entity was created as.
    pub fn type_def(&self) -> &Arc<EntityTypeDef> {
        &self.typ
    }

    /// The space this entity is in, if any.
    pub fn space(&self) -> Option<EntityId> {
        self.space
    }

    pub(crate) fn set_space(&mut self, space: Option<EntityId>) {
        self.space = space;
    }

    /// The bound client, if any.
    pub fn client(&self) -> Option<ClientRef> {
        self.client
    }

    pub(crate) fn set_client(&mut self, client: Option<ClientRef>) {
        self.client = client;
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub(crate) fn mark_destroyed(&mut self) {
        self.destroyed = true;
    }

    /// Schedules a one-shot callback after `delay`.
    pub fn add_callback(&mut self, delay: Duration, cb: TimerCb) -> TimerHandle {
        let handle = self.wheel.schedule(self.id, delay, None);
        self.timers.insert(
            handle.id(),
            TimerSlot {
                cb: Some(cb),
                repeating: false,
            },
        );
        handle
    }

    /// Schedules a repeating callback every `interval`.
    pub fn add_timer(&mut self, interval: Duration, cb: TimerCb) -> TimerHandle {
        let handle = self.wheel.schedule(self.id, interval, Some(interval));
        self.timers.insert(
            handle.id(),
            TimerSlot {
                cb: Some(cb),
                repeating: true,
            },
        );
        handle
    }

    /// Cancels a timer.
    ///
    /// Cancellation is observed synchronously: the callback will not run
    /// after this returns, even if the fire was already queued in the
    /// mailbox.
    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        self.timers.remove(&handle.id());
        self.wheel.cancel(handle);
    }

    /// Number of live timers on this entity.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    // Runs a fired timer if it is still live. The slot's callback is taken
    // out for the duration of the call so the callback itself can borrow the
    // entity; if the callback cancelled its own handle the slot is gone and
    // the callback is dropped instead of reinserted.
    pub(crate) fn run_timer(&mut self, ctx: &mut EntityContext, timer_id: u64) {
        let Some(slot) = self.timers.get_mut(&timer_id) else {
            // Cancelled after the fire was queued.
            return;
        };
        let Some(mut cb) = slot.cb.take() else {
            return;
        };
        let repeating = slot.repeating;
        cb(self, ctx);
        if repeating {
            if let Some(slot) = self.timers.get_mut(&timer_id) {
                slot.cb = Some(cb);
            }
        } else {
            self.timers.remove(&timer_id);
        }
    }

    /// Issues a request-style call: sends `method` to `to` with a fresh
    /// request id prepended to `args`, and registers `resume` to run when
    /// the reply arrives; or with `Err(Timeout)` when `timeout` expires
    /// first.
    ///
    /// While the request is outstanding the entity's serial context is free;
    /// other queued calls run normally.
    pub fn call_with_reply(
        &mut self,
        ctx: &mut EntityContext,
        to: EntityId,
        method: &str,
        mut args: Vec<Value>,
        timeout: Duration,
        resume: ContinuationFn,
    ) -> u64 {
        let request_id = self.next_request;
        self.next_request += 1;

        let timeout_timer = self.add_callback(
            timeout,
            Box::new(move |entity, ctx| {
                entity.fail_continuation(ctx, request_id, ErrorKind::Timeout);
            }),
        );
        self.continuations.insert(
            request_id,
            Continuation {
                resume,
                timeout_timer: Some(timeout_timer),
            },
        );

        let mut full_args = vec![Value::Uint(request_id)];
        full_args.append(&mut args);
        ctx.call(to, method, full_args);
        request_id
    }

    pub(crate) fn resume_continuation(
        &mut self,
        ctx: &mut EntityContext,
        request_id: u64,
        values: Vec<Value>,
    ) {
        let Some(continuation) = self.continuations.remove(&request_id) else {
            debug!(entity = %self.id, request_id, "stale resume, continuation already gone");
            return;
        };
        if let Some(timer) = continuation.timeout_timer {
            self.cancel_timer(timer);
        }
        (continuation.resume)(self, ctx, Ok(values));
    }

    pub(crate) fn fail_continuation(
        &mut self,
        ctx: &mut EntityContext,
        request_id: u64,
        kind: ErrorKind,
    ) {
        let Some(continuation) = self.continuations.remove(&request_id) else {
            return;
        };
        if let Some(timer) = continuation.timeout_timer {
            self.cancel_timer(timer);
        }
        (continuation.resume)(self, ctx, Err(kind));
    }

    /// Serializes everything that travels in a migration: type, space,
    /// client binding, and the full attribute tree.
    pub fn migration_snapshot(&self) -> Value {
        let mut root = std::collections::BTreeMap::new();
        root.insert("type".to_string(), Value::Str(self.typ.name().to_string()));
        root.insert("attrs".to_string(), self.attrs.snapshot());
        if let Some(space) = self.space {
            root.insert("space".to_string(), Value::Str(space.to_string()));
        }
        if let Some(client) = self.client {
            root.insert("session".to_string(), Value::Str(client.session.to_string()));
            root.insert("gate".to_string(), Value::Uint(u64::from(client.gate.0)));
        }
        Value::Map(root)
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("type", &self.typ.name())
            .field("space", &self.space)
            .field("client", &self.client)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}
