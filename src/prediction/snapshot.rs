//! Scene snapshot building, encoding and application
//!
//! STATE message layout:
//! - last applied input id: u32 (placeholder, stamped per recipient)
//! - entity count: VLE
//! - for each entity
//!     - id: u32
//!     - entity attributes (untagged, entity schema order)
//!     - user variable count: VLE, then (key hash, tagged value) pairs
//!     - component count: VLE
//!     - for each component
//!         - id: u32
//!         - type: hash
//!         - component attributes (untagged, component schema order)

use std::collections::BTreeSet;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::sequence::SequenceId;
use crate::net::wire::{
    write_string_hash, write_value, write_value_data, write_vle, StringHash, Value, VariantMap,
    WireError, WireReader,
};
use crate::scene::{
    AttributeInfo, AttributeProvider, ComponentId, EntityId, EntityRegistry, SceneComponent,
    SceneEntity,
};

/// Size of the acknowledgment slot at the start of every STATE message
pub const ACK_SLOT_LEN: usize = 4;

/// Snapshot decoding errors. Any of these aborts the whole message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("Malformed snapshot: {0}")]
    Wire(#[from] WireError),

    #[error("Unknown component type {type_hash} (component {component} on entity {entity})")]
    UnknownComponentType {
        entity: EntityId,
        component: ComponentId,
        type_hash: StringHash,
    },

    #[error("{0} trailing bytes after snapshot")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ComponentState {
    pub id: ComponentId,
    pub type_hash: StringHash,
    pub attributes: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityState {
    pub id: EntityId,
    pub attributes: Vec<Value>,
    pub vars: VariantMap,
    pub components: Vec<ComponentState>,
}

/// All replicated entities of one scene at one instant
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SceneState {
    pub entities: Vec<EntityState>,
}

/// What applying a snapshot changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
}

fn read_attributes(target: &impl AttributeProvider) -> Vec<Value> {
    (0..target.attributes().len())
        .map(|i| target.attribute(i))
        .collect()
}

fn write_attributes(buf: &mut BytesMut, values: &[Value]) {
    for value in values {
        write_value_data(buf, value);
    }
}

fn decode_attributes(
    reader: &mut WireReader<'_>,
    schema: &[AttributeInfo],
) -> Result<Vec<Value>, WireError> {
    schema
        .iter()
        .map(|info| reader.read_value_data(info.value_type))
        .collect()
}

fn set_attributes(target: &mut impl AttributeProvider, values: Vec<Value>) {
    for (index, value) in values.into_iter().enumerate() {
        target.set_attribute(index, value);
    }
}

impl EntityState {
    pub fn capture<E: SceneEntity>(entity: &E) -> Self {
        Self {
            id: entity.id(),
            attributes: read_attributes(entity),
            vars: entity.vars().clone(),
            components: entity
                .components()
                .iter()
                .map(|c| ComponentState {
                    id: c.id(),
                    type_hash: c.type_hash(),
                    attributes: read_attributes(c),
                })
                .collect(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.id.0);
        write_attributes(buf, &self.attributes);

        write_vle(buf, self.vars.len() as u32);
        for (key, value) in &self.vars {
            write_string_hash(buf, *key);
            write_value(buf, value);
        }

        write_vle(buf, self.components.len() as u32);
        for component in &self.components {
            buf.put_u32_le(component.id.0);
            write_string_hash(buf, component.type_hash);
            write_attributes(buf, &component.attributes);
        }
    }

    fn decode<R: EntityRegistry>(
        reader: &mut WireReader<'_>,
        registry: &R,
    ) -> Result<Self, SnapshotError> {
        let id = EntityId(reader.read_u32()?);
        let attributes = decode_attributes(reader, registry.entity_schema())?;

        let mut vars = VariantMap::new();
        for _ in 0..reader.read_vle()? {
            let key = reader.read_string_hash()?;
            vars.insert(key, reader.read_value()?);
        }

        let count = reader.read_vle()?;
        let mut components = Vec::new();
        for _ in 0..count {
            let component = ComponentId(reader.read_u32()?);
            let type_hash = reader.read_string_hash()?;
            // Without the schema the remaining bytes cannot be framed
            let schema = registry.component_schema(type_hash).ok_or(
                SnapshotError::UnknownComponentType {
                    entity: id,
                    component,
                    type_hash,
                },
            )?;
            components.push(ComponentState {
                id: component,
                type_hash,
                attributes: decode_attributes(reader, schema)?,
            });
        }

        Ok(Self {
            id,
            attributes,
            vars,
            components,
        })
    }
}

impl SceneState {
    /// Captures the listed entities. Ids with no live entity are skipped.
    pub fn capture<R: EntityRegistry>(
        registry: &R,
        ids: impl IntoIterator<Item = EntityId>,
    ) -> Self {
        Self {
            entities: ids
                .into_iter()
                .filter_map(|id| registry.entity(id))
                .map(EntityState::capture)
                .collect(),
        }
    }

    /// Captures every replicated entity of the registry
    pub fn capture_all<R: EntityRegistry>(registry: &R) -> Self {
        Self::capture(registry, registry.entity_ids())
    }

    /// Writes the entity count and entities (everything after the ack slot)
    pub fn encode(&self, buf: &mut BytesMut) {
        write_vle(buf, self.entities.len() as u32);
        for entity in &self.entities {
            entity.encode(buf);
        }
    }

    /// Decodes a whole scene body using the registry's schema, consuming the reader
    pub fn decode<R: EntityRegistry>(
        reader: &mut WireReader<'_>,
        registry: &R,
    ) -> Result<Self, SnapshotError> {
        let count = reader.read_vle()?;
        let mut entities = Vec::new();
        for _ in 0..count {
            entities.push(EntityState::decode(reader, registry)?);
        }
        if !reader.is_empty() {
            return Err(SnapshotError::TrailingBytes(reader.remaining()));
        }
        Ok(Self { entities })
    }

    /// Makes the registry match this snapshot.
    ///
    /// Missing entities are created and snapped, existing ones updated, and
    /// replicated entities the snapshot does not mention are removed.
    pub fn apply<R: EntityRegistry>(self, registry: &mut R) -> ApplyReport {
        let mut unused: BTreeSet<EntityId> = registry.entity_ids().into_iter().collect();
        let mut report = ApplyReport::default();

        for state in self.entities {
            let existed = registry.entity(state.id).is_some();
            unused.remove(&state.id);

            let entity = if existed {
                match registry.entity_mut(state.id) {
                    Some(entity) => entity,
                    None => continue,
                }
            } else {
                registry.create_entity(state.id)
            };

            set_attributes(entity, state.attributes);
            if existed {
                entity.apply_attributes();
                report.updated += 1;
            } else {
                // No late apply on creation; only snap the smoothing
                entity.reset_smoothing();
                report.created += 1;
            }

            for (key, value) in state.vars {
                entity.set_var(key, value);
            }

            for component in state.components {
                apply_component(registry, state.id, component);
            }
        }

        for id in unused {
            if registry.remove_entity(id) {
                debug!(entity = %id, "Removed entity absent from snapshot");
                report.removed += 1;
            }
        }

        report
    }
}

fn apply_component<R: EntityRegistry>(registry: &mut R, entity: EntityId, state: ComponentState) {
    let same_type = registry.entity(entity).and_then(|e| {
        e.components()
            .iter()
            .find(|c| c.id() == state.id)
            .map(|c| c.type_hash() == state.type_hash)
    });

    if same_type == Some(false) {
        if let Some(e) = registry.entity_mut(entity) {
            e.remove_component(state.id);
        }
    }

    let component = if same_type == Some(true) {
        registry
            .entity_mut(entity)
            .and_then(|e| e.component_mut(state.id))
    } else {
        registry.create_component(entity, state.type_hash, state.id)
    };

    match component {
        Some(component) => {
            set_attributes(component, state.attributes);
            component.apply_attributes();
        }
        None => warn!(
            entity = %entity,
            component = %state.id,
            type_hash = %state.type_hash,
            "Could not create component from snapshot"
        ),
    }
}

/// Clears `buf` and writes a STATE message for the given entities with a
/// zero acknowledgment placeholder. Returns the number of entities written.
pub fn write_scene<R: EntityRegistry>(
    registry: &R,
    ids: impl IntoIterator<Item = EntityId>,
    buf: &mut BytesMut,
) -> usize {
    buf.clear();
    buf.put_u32_le(0);
    let scene = SceneState::capture(registry, ids);
    scene.encode(buf);
    scene.entities.len()
}

/// Overwrites the acknowledgment slot of an encoded STATE message
pub fn stamp_ack(message: &mut [u8], ack: SequenceId) {
    if let Some(slot) = message.get_mut(..ACK_SLOT_LEN) {
        slot.copy_from_slice(&ack.0.to_le_bytes());
    }
}

pub fn read_ack(reader: &mut WireReader<'_>) -> Result<SequenceId, WireError> {
    reader.read_u32().map(SequenceId)
}

/// Decodes a scene body and applies it. On error the registry is untouched.
pub fn read_scene<R: EntityRegistry>(
    reader: &mut WireReader<'_>,
    registry: &mut R,
) -> Result<ApplyReport, SnapshotError> {
    let scene = SceneState::decode(reader, registry)?;
    Ok(scene.apply(registry))
}

/// Running snapshot statistics
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct SnapshotStats {
    pub total_snapshots: u64,
    pub total_bytes: u64,
    pub avg_entities_per_snapshot: f32,
}

impl SnapshotStats {
    pub fn record(&mut self, entity_count: usize, bytes: usize) {
        self.total_snapshots += 1;
        self.total_bytes += bytes as u64;

        // Running average
        let n = self.total_snapshots as f32;
        self.avg_entities_per_snapshot =
            self.avg_entities_per_snapshot * ((n - 1.0) / n) + (entity_count as f32 / n);
    }
}
