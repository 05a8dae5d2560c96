//! Space entry and exit.
//!
//! Member-set updates always go through the space entity's own mailbox, so
//! enter and leave events are totally ordered per space. A migrating entity
//! leaves its space before `StartMigrate` and only joins the target space
//! after landing, so it is never in any member set mid-flight.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use meridian_entity::{EntityCommand, EntityId, SPACE_ADD_METHOD, SPACE_REMOVE_METHOD};
use meridian_proto::{Packet, Value, DISPATCHER_MIGRATE_TIMEOUT};

use crate::core::Core;

/// Deadline for a whole enter-space operation, local or migratory.
pub const ENTER_SPACE_REQUEST_TIMEOUT: Duration =
    Duration::from_secs(DISPATCHER_MIGRATE_TIMEOUT.as_secs() + 5);

/// One outstanding enter-space operation.
#[derive(Debug)]
pub(crate) struct EnterSpacePending {
    pub(crate) space: EntityId,
    pub(crate) deadline: Instant,
}

impl Core {
    /// Begins moving `entity` into `space`, wherever that space lives.
    pub(crate) fn request_enter_space(&mut self, entity: EntityId, space: EntityId) {
        if !self.registry.contains(entity) {
            warn!(%entity, %space, "enter-space for entity not hosted here dropped");
            return;
        }
        // Out of the old space first; a migrating entity is in no member set.
        self.local_leave_space(entity);

        if self.registry.space_kind(space).is_some() {
            self.local_enter_space(entity, space);
            return;
        }

        self.enter_pending.insert(
            entity,
            EnterSpacePending {
                space,
                deadline: Instant::now() + ENTER_SPACE_REQUEST_TIMEOUT,
            },
        );
        self.link.send(Packet::EnterSpaceRequest { entity, space });
    }

    /// Handles the dispatcher's instruction to enter a space hosted here.
    pub(crate) fn on_local_enter_space(&mut self, entity: EntityId, space: EntityId) {
        if self.registry.space_kind(space).is_none() {
            self.fail_enter_space(entity, space, "space is no longer hosted here");
            return;
        }
        if !self.registry.contains(entity) {
            warn!(%entity, %space, "local enter for entity not hosted here dropped");
            return;
        }
        self.local_leave_space(entity);
        self.local_enter_space(entity, space);
    }

    fn local_enter_space(&mut self, entity: EntityId, space: EntityId) {
        self.enter_pending.remove(&entity);
        if let Some(space_handle) = self.registry.get(space) {
            space_handle.post(EntityCommand::Call {
                from: None,
                method: SPACE_ADD_METHOD.to_string(),
                args: vec![Value::Str(entity.to_string())],
            });
        }
        if let Some(handle) = self.registry.get(entity) {
            handle.post(EntityCommand::SetSpace { space: Some(space) });
        }
        debug!(%entity, %space, "entered space");
    }

    /// Removes `entity` from its current space, if it is in one.
    pub(crate) fn local_leave_space(&mut self, entity: EntityId) {
        let Some(space) = self.registry.space_of(entity) else {
            return;
        };
        if let Some(space_handle) = self.registry.get(space) {
            space_handle.post(EntityCommand::Call {
                from: None,
                method: SPACE_REMOVE_METHOD.to_string(),
                args: vec![Value::Str(entity.to_string())],
            });
        }
        if let Some(handle) = self.registry.get(entity) {
            handle.post(EntityCommand::SetSpace { space: None });
        }
        // The mirror updates eagerly so a follow-up enter sees the exit.
        self.registry.remove_member(space, entity);
        debug!(%entity, %space, "left space");
    }

    /// Marks the entity not-in-space and fires its failure callback.
    pub(crate) fn fail_enter_space(&mut self, entity: EntityId, space: EntityId, reason: &str) {
        self.enter_pending.remove(&entity);
        warn!(%entity, %space, reason, "enter-space failed");
        if let Some(handle) = self.registry.get(entity) {
            handle.post(EntityCommand::SetSpace { space: None });
            handle.post(EntityCommand::Call {
                from: None,
                method: "on_enter_space_failed".to_string(),
                args: vec![Value::Str(space.to_string()), Value::Str(reason.to_string())],
            });
        }
    }
}
