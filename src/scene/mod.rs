//! Scene capabilities the prediction core relies on
//!
//! The engine owns entities, their sub-components and attribute reflection.
//! The core only needs to enumerate and read/write replicated attributes,
//! and to create, look up and remove entities and components by id.

pub mod memory;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::net::wire::{StringHash, Value, ValueType, VariantMap};

pub use memory::{MemoryComponent, MemoryEntity, MemoryScene};

/// Entity id, stable between server and clients
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntityId(pub u32);

/// Component id, stable between server and clients
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ComponentId(pub u32);

/// Replicated scene id
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SceneId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Describes one replicated attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeInfo {
    pub name: &'static str,
    pub value_type: ValueType,
}

impl AttributeInfo {
    pub const fn new(name: &'static str, value_type: ValueType) -> Self {
        Self { name, value_type }
    }
}

/// Reflection over an object's replicated attributes
pub trait AttributeProvider {
    /// Replicated attributes, in wire order
    fn attributes(&self) -> &[AttributeInfo];

    fn attribute(&self, index: usize) -> Value;

    fn set_attribute(&mut self, index: usize, value: Value);

    /// Late-apply hook run after a batch of `set_attribute` calls
    fn apply_attributes(&mut self) {}
}

pub trait SceneComponent: AttributeProvider {
    fn id(&self) -> ComponentId;

    fn type_hash(&self) -> StringHash;
}

pub trait SceneEntity: AttributeProvider {
    type Component: SceneComponent;

    fn id(&self) -> EntityId;

    fn vars(&self) -> &VariantMap;

    fn set_var(&mut self, key: StringHash, value: Value);

    fn components(&self) -> &[Self::Component];

    fn component_mut(&mut self, id: ComponentId) -> Option<&mut Self::Component>;

    fn remove_component(&mut self, id: ComponentId) -> bool;

    /// Called once on entities created from a snapshot so motion smoothing
    /// snaps to the received state instead of interpolating from the origin.
    fn reset_smoothing(&mut self) {}
}

/// Mutable registry of the entities of one scene
pub trait EntityRegistry {
    type Entity: SceneEntity;

    /// Attribute layout shared by every entity
    fn entity_schema(&self) -> &[AttributeInfo];

    /// Attribute layout of a component type, `None` if the type is unknown
    fn component_schema(&self, type_hash: StringHash) -> Option<&[AttributeInfo]>;

    fn create_entity(&mut self, id: EntityId) -> &mut Self::Entity;

    fn entity(&self, id: EntityId) -> Option<&Self::Entity>;

    fn entity_mut(&mut self, id: EntityId) -> Option<&mut Self::Entity>;

    fn remove_entity(&mut self, id: EntityId) -> bool;

    /// Replicated entities currently in the scene
    fn entity_ids(&self) -> Vec<EntityId>;

    /// Creates a component of a known type on an existing entity
    fn create_component(
        &mut self,
        entity: EntityId,
        type_hash: StringHash,
        id: ComponentId,
    ) -> Option<&mut <Self::Entity as SceneEntity>::Component>;
}

/// Lookup of scenes by id, used by the server to reach every scene in use
pub trait SceneSource {
    type Registry: EntityRegistry;

    fn scene(&self, id: SceneId) -> Option<&Self::Registry>;

    fn scene_mut(&mut self, id: SceneId) -> Option<&mut Self::Registry>;
}

impl<R: EntityRegistry> SceneSource for HashMap<SceneId, R> {
    type Registry = R;

    fn scene(&self, id: SceneId) -> Option<&R> {
        self.get(&id)
    }

    fn scene_mut(&mut self, id: SceneId) -> Option<&mut R> {
        self.get_mut(&id)
    }
}

impl<R: EntityRegistry> SceneSource for BTreeMap<SceneId, R> {
    type Registry = R;

    fn scene(&self, id: SceneId) -> Option<&R> {
        self.get(&id)
    }

    fn scene_mut(&mut self, id: SceneId) -> Option<&mut R> {
        self.get_mut(&id)
    }
}
