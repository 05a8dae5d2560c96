//! Entity type registration.
//!
//! A type declares its whole behavior set up front: method handlers, attribute
//! observers, per-root-key client visibility, persistence, and (for spaces)
//! the space kind. Lookup is a plain table hit; there is no dispatch by
//! name reflection anywhere, and the registered tables double as a static
//! audit of which root keys a type observes.

use std::collections::HashMap;
use std::sync::Arc;

use compact_str::CompactString;
use dashmap::DashMap;

use crate::attrs::AttrChange;
use crate::entity::{Entity, EntityContext, EntityError};
use meridian_proto::Value;

/// Smallest valid space kind.
pub const SPACE_KIND_MIN: i64 = 1;
/// Largest valid space kind.
pub const SPACE_KIND_MAX: i64 = 9999;

/// Who may observe deltas for a root-level attribute key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttrVisibility {
    /// Never leaves the owning server.
    #[default]
    ServerOnly,
    /// Replicated only to the session bound to the entity.
    OwnClient,
    /// Replicated to every session whose bound entity shares the space.
    AllClients,
}

/// A method handler: runs inside the entity's serial context.
pub type MethodFn =
    dyn Fn(&mut Entity, &mut EntityContext, &[Value]) -> Result<(), EntityError> + Send + Sync;

/// An attribute observer: fires once per applied change on its root key.
pub type AttrObserverFn = dyn Fn(&mut Entity, &mut EntityContext, &AttrChange) + Send + Sync;

/// The behavior set for one entity type.
///
/// Built once at startup with the builder methods and then frozen behind an
/// `Arc`; entities hold a shared reference to their type for their lifetime.
pub struct EntityTypeDef {
    name: CompactString,
    persistent: bool,
    space_kind: Option<i64>,
    methods: HashMap<CompactString, Arc<MethodFn>>,
    observers: HashMap<CompactString, Arc<AttrObserverFn>>,
    visibility: HashMap<CompactString, AttrVisibility>,
}

impl EntityTypeDef {
    /// Starts declaring a type with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: CompactString::new(name),
            persistent: false,
            space_kind: None,
            methods: HashMap::new(),
            observers: HashMap::new(),
            visibility: HashMap::new(),
        }
    }

    /// Marks instances of this type as persisted to storage.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Declares this type as a space with the given kind.
    ///
    /// # Panics
    ///
    /// Panics at registration time if `kind` is outside
    /// `[SPACE_KIND_MIN, SPACE_KIND_MAX]`; a misdeclared space is a startup
    /// bug, not a runtime condition.
    pub fn space_kind(mut self, kind: i64) -> Self {
        assert!(
            (SPACE_KIND_MIN..=SPACE_KIND_MAX).contains(&kind),
            "space kind {kind} outside [{SPACE_KIND_MIN}, {SPACE_KIND_MAX}]"
        );
        self.space_kind = Some(kind);
        self
    }

    /// Registers a method handler.
    pub fn method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut Entity, &mut EntityContext, &[Value]) -> Result<(), EntityError>
            + Send
            + Sync
            + 'static,
    {
        self.methods.insert(CompactString::new(name), Arc::new(f));
        self
    }

    /// Registers an observer for changes whose root key is `key`.
    pub fn observe_attr<F>(mut self, key: &str, f: F) -> Self
    where
        F: Fn(&mut Entity, &mut EntityContext, &AttrChange) + Send + Sync + 'static,
    {
        self.observers.insert(CompactString::new(key), Arc::new(f));
        self
    }

    /// Sets the client visibility of a root key. Unset keys are server-only.
    pub fn visibility(mut self, key: &str, visibility: AttrVisibility) -> Self {
        self.visibility.insert(CompactString::new(key), visibility);
        self
    }

    /// The type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether instances are persisted.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// The space kind, if this type is a space.
    pub fn space_kind_value(&self) -> Option<i64> {
        self.space_kind
    }

    /// Whether this type is a space.
    pub fn is_space(&self) -> bool {
        self.space_kind.is_some()
    }

    /// Looks up a method handler.
    pub fn method_named(&self, name: &str) -> Option<Arc<MethodFn>> {
        self.methods.get(name).cloned()
    }

    /// Looks up the observer for a root key.
    pub fn observer_for(&self, key: &str) -> Option<Arc<AttrObserverFn>> {
        self.observers.get(key).cloned()
    }

    /// The visibility of a root key.
    pub fn visibility_of(&self, key: &str) -> AttrVisibility {
        self.visibility.get(key).copied().unwrap_or_default()
    }
}

impl std::fmt::Debug for EntityTypeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityTypeDef")
            .field("name", &self.name)
            .field("persistent", &self.persistent)
            .field("space_kind", &self.space_kind)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("observers", &self.observers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Process-wide table of registered entity types.
#[derive(Debug, Default)]
pub struct EntityTypeRegistry {
    types: DashMap<CompactString, Arc<EntityTypeDef>>,
}

impl EntityTypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type, returning its shared definition.
    ///
    /// Re-registering a name replaces the previous definition; live entities
    /// keep the definition they were created with.
    pub fn register(&self, def: EntityTypeDef) -> Arc<EntityTypeDef> {
        let def = Arc::new(def);
        self.types.insert(def.name.clone(), Arc::clone(&def));
        def
    }

    /// Looks up a type by name.
    pub fn get(&self, name: &str) -> Option<Arc<EntityTypeDef>> {
        self.types.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no types are registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_and_lookup() {
        let registry = EntityTypeRegistry::new();
        registry.register(
            EntityTypeDef::new("Avatar")
                .persistent(true)
                .method("Foo", |_entity, _ctx, _args| Ok(()))
                .visibility("hp", AttrVisibility::AllClients),
        );

        let def = registry.get("Avatar").expect("registered");
        assert_eq!(def.name(), "Avatar");
        assert!(def.is_persistent());
        assert!(!def.is_space());
        assert!(def.method_named("Foo").is_some());
        assert!(def.method_named("Bar").is_none());
        assert_eq!(def.visibility_of("hp"), AttrVisibility::AllClients);
        assert_eq!(def.visibility_of("secret"), AttrVisibility::ServerOnly);
        assert!(registry.get("Monster").is_none());
    }

    #[test]
    fn space_kind_declaration() {
        let def = EntityTypeDef::new("Plains").space_kind(3);
        assert!(def.is_space());
        assert_eq!(def.space_kind_value(), Some(3));
    }

    #[test]
    #[should_panic(expected = "space kind")]
    fn out_of_range_space_kind_panics() {
        let _ = EntityTypeDef::new("Bad").space_kind(0);
    }
}
