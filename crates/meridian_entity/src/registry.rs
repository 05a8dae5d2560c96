//! The in-process entity table and space index.
//!
//! Maps `EntityId → EntityHandle` for O(1) mailbox lookup, and mirrors space
//! membership for fast "who is in this space" queries. Entries appear on
//! creation or migration-in and disappear on destruction or migration-out.
//! The dispatcher, not this table, is the cluster-wide source of truth for
//! ownership; this is one server's local view.

use std::collections::HashSet;

use dashmap::DashMap;

use meridian_proto::EntityId;

use crate::runtime::EntityHandle;

/// One hosted space's local bookkeeping.
#[derive(Debug, Clone)]
pub struct SpaceEntry {
    pub kind: i64,
    pub members: HashSet<EntityId>,
}

/// The per-process registry of live entities.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: DashMap<EntityId, EntityHandle>,
    spaces: DashMap<EntityId, SpaceEntry>,
    member_space: DashMap<EntityId, EntityId>,
}

impl EntityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a freshly spawned or migrated-in entity.
    ///
    /// Returns the previous handle if the id was already present; callers
    /// treat that as an invariant violation.
    pub fn insert(&self, handle: EntityHandle) -> Option<EntityHandle> {
        self.entities.insert(handle.id(), handle)
    }

    /// Removes an entity on destruction or migration-out.
    pub fn remove(&self, id: EntityId) -> Option<EntityHandle> {
        if let Some(space) = self.member_space.remove(&id).map(|(_, s)| s) {
            if let Some(mut entry) = self.spaces.get_mut(&space) {
                entry.members.remove(&id);
            }
        }
        self.spaces.remove(&id);
        self.entities.remove(&id).map(|(_, handle)| handle)
    }

    /// Looks up an entity's mailbox handle.
    pub fn get(&self, id: EntityId) -> Option<EntityHandle> {
        self.entities.get(&id).map(|entry| entry.value().clone())
    }

    /// Whether the entity is hosted here.
    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Ids of all hosted entities, with their type names.
    pub fn hosted(&self) -> Vec<(EntityId, String)> {
        self.entities
            .iter()
            .map(|entry| (entry.id(), entry.type_name().to_string()))
            .collect()
    }

    /// Number of hosted entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether no entities are hosted.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Records a hosted space.
    pub fn register_space(&self, space: EntityId, kind: i64) {
        self.spaces.insert(
            space,
            SpaceEntry {
                kind,
                members: HashSet::new(),
            },
        );
    }

    /// The kind of a hosted space, if it is one.
    pub fn space_kind(&self, space: EntityId) -> Option<i64> {
        self.spaces.get(&space).map(|entry| entry.kind)
    }

    /// Mirrors a member joining a space.
    pub fn add_member(&self, space: EntityId, member: EntityId) {
        if let Some(mut entry) = self.spaces.get_mut(&space) {
            entry.members.insert(member);
            self.member_space.insert(member, space);
        }
    }

    /// Mirrors a member leaving a space.
    pub fn remove_member(&self, space: EntityId, member: EntityId) {
        if let Some(mut entry) = self.spaces.get_mut(&space) {
            entry.members.remove(&member);
        }
        self.member_space.remove(&member);
    }

    /// The space a hosted entity is currently in.
    pub fn space_of(&self, member: EntityId) -> Option<EntityId> {
        self.member_space.get(&member).map(|entry| *entry.value())
    }

    /// Members of a hosted space.
    pub fn members_of(&self, space: EntityId) -> Vec<EntityId> {
        self.spaces
            .get(&space)
            .map(|entry| entry.members.iter().copied().collect())
            .unwrap_or_default()
    }
}
