//! In-memory scene used by the demo and tests

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::{
    AttributeInfo, AttributeProvider, ComponentId, EntityId, EntityRegistry, SceneComponent,
    SceneEntity,
};
use crate::net::wire::{StringHash, Value, ValueType, VariantMap};

/// Attribute layout of every [`MemoryEntity`]
pub const ENTITY_ATTRIBUTES: &[AttributeInfo] = &[
    AttributeInfo::new("Name", ValueType::String),
    AttributeInfo::new("Position", ValueType::Vector3),
    AttributeInfo::new("Rotation", ValueType::Quaternion),
];

const POSITION: usize = 1;
const ROTATION: usize = 2;

fn defaults(schema: &[AttributeInfo]) -> Vec<Value> {
    schema.iter().map(|a| a.value_type.default_value()).collect()
}

fn store(schema: &[AttributeInfo], values: &mut [Value], index: usize, value: Value) {
    match schema.get(index) {
        Some(info) if info.value_type == value.value_type() => values[index] = value,
        Some(info) => debug!(
            attribute = info.name,
            expected = ?info.value_type,
            got = ?value.value_type(),
            "Ignoring attribute of the wrong type"
        ),
        None => debug!(index, "Ignoring attribute index out of range"),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryComponent {
    id: ComponentId,
    type_hash: StringHash,
    #[serde(skip)]
    schema: Arc<[AttributeInfo]>,
    values: Vec<Value>,
    #[serde(skip)]
    apply_count: u32,
}

impl MemoryComponent {
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// How many times `apply_attributes` ran
    pub fn apply_count(&self) -> u32 {
        self.apply_count
    }
}

impl AttributeProvider for MemoryComponent {
    fn attributes(&self) -> &[AttributeInfo] {
        &self.schema
    }

    fn attribute(&self, index: usize) -> Value {
        self.values.get(index).cloned().unwrap_or_default()
    }

    fn set_attribute(&mut self, index: usize, value: Value) {
        store(&self.schema, &mut self.values, index, value);
    }

    fn apply_attributes(&mut self) {
        self.apply_count += 1;
    }
}

impl SceneComponent for MemoryComponent {
    fn id(&self) -> ComponentId {
        self.id
    }

    fn type_hash(&self) -> StringHash {
        self.type_hash
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryEntity {
    id: EntityId,
    values: Vec<Value>,
    vars: VariantMap,
    components: Vec<MemoryComponent>,
    #[serde(skip)]
    snapped: bool,
    #[serde(skip)]
    apply_count: u32,
}

impl MemoryEntity {
    fn new(id: EntityId) -> Self {
        Self {
            id,
            values: defaults(ENTITY_ATTRIBUTES),
            vars: VariantMap::new(),
            components: Vec::new(),
            snapped: false,
            apply_count: 0,
        }
    }

    pub fn position(&self) -> [f32; 3] {
        self.values[POSITION].as_vector3().unwrap_or_default()
    }

    pub fn set_position(&mut self, position: [f32; 3]) {
        self.values[POSITION] = Value::Vector3(position);
    }

    pub fn set_rotation(&mut self, rotation: [f32; 4]) {
        self.values[ROTATION] = Value::Quaternion(rotation);
    }

    pub fn var(&self, key: &str) -> Option<&Value> {
        self.vars.get(&StringHash::new(key))
    }

    pub fn component(&self, id: ComponentId) -> Option<&MemoryComponent> {
        self.components.iter().find(|c| c.id == id)
    }

    /// True once `reset_smoothing` ran on this entity
    pub fn was_snapped(&self) -> bool {
        self.snapped
    }

    pub fn apply_count(&self) -> u32 {
        self.apply_count
    }
}

impl AttributeProvider for MemoryEntity {
    fn attributes(&self) -> &[AttributeInfo] {
        ENTITY_ATTRIBUTES
    }

    fn attribute(&self, index: usize) -> Value {
        self.values.get(index).cloned().unwrap_or_default()
    }

    fn set_attribute(&mut self, index: usize, value: Value) {
        store(ENTITY_ATTRIBUTES, &mut self.values, index, value);
    }

    fn apply_attributes(&mut self) {
        self.apply_count += 1;
    }
}

impl SceneEntity for MemoryEntity {
    type Component = MemoryComponent;

    fn id(&self) -> EntityId {
        self.id
    }

    fn vars(&self) -> &VariantMap {
        &self.vars
    }

    fn set_var(&mut self, key: StringHash, value: Value) {
        self.vars.insert(key, value);
    }

    fn components(&self) -> &[MemoryComponent] {
        &self.components
    }

    fn component_mut(&mut self, id: ComponentId) -> Option<&mut MemoryComponent> {
        self.components.iter_mut().find(|c| c.id == id)
    }

    fn remove_component(&mut self, id: ComponentId) -> bool {
        let before = self.components.len();
        self.components.retain(|c| c.id != id);
        self.components.len() != before
    }

    fn reset_smoothing(&mut self) {
        self.snapped = true;
    }
}

/// Entities keyed by id, plus the component types this scene can create
#[derive(Debug, Clone, Default)]
pub struct MemoryScene {
    entities: BTreeMap<EntityId, MemoryEntity>,
    component_types: HashMap<StringHash, Arc<[AttributeInfo]>>,
}

impl MemoryScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_component_type(mut self, name: &str, attributes: &[AttributeInfo]) -> Self {
        self.register_component_type(name, attributes);
        self
    }

    pub fn register_component_type(&mut self, name: &str, attributes: &[AttributeInfo]) {
        self.component_types
            .insert(StringHash::new(name), Arc::from(attributes));
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = &MemoryEntity> {
        self.entities.values()
    }

    /// Shorthand for adding a component by type name in demos and tests
    pub fn add_component(
        &mut self,
        entity: EntityId,
        type_name: &str,
        id: ComponentId,
    ) -> Option<&mut MemoryComponent> {
        self.create_component(entity, StringHash::new(type_name), id)
    }
}

impl EntityRegistry for MemoryScene {
    type Entity = MemoryEntity;

    fn entity_schema(&self) -> &[AttributeInfo] {
        ENTITY_ATTRIBUTES
    }

    fn component_schema(&self, type_hash: StringHash) -> Option<&[AttributeInfo]> {
        self.component_types.get(&type_hash).map(|s| &s[..])
    }

    fn create_entity(&mut self, id: EntityId) -> &mut MemoryEntity {
        self.entities
            .entry(id)
            .or_insert_with(|| MemoryEntity::new(id))
    }

    fn entity(&self, id: EntityId) -> Option<&MemoryEntity> {
        self.entities.get(&id)
    }

    fn entity_mut(&mut self, id: EntityId) -> Option<&mut MemoryEntity> {
        self.entities.get_mut(&id)
    }

    fn remove_entity(&mut self, id: EntityId) -> bool {
        self.entities.remove(&id).is_some()
    }

    fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    fn create_component(
        &mut self,
        entity: EntityId,
        type_hash: StringHash,
        id: ComponentId,
    ) -> Option<&mut MemoryComponent> {
        let schema = self.component_types.get(&type_hash)?.clone();
        let entity = self.entities.get_mut(&entity)?;
        entity.components.retain(|c| c.id != id);
        entity.components.push(MemoryComponent {
            id,
            type_hash,
            values: defaults(&schema),
            schema,
            apply_count: 0,
        });
        entity.components.last_mut()
    }
}
