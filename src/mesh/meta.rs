//! Mesh metadata: the part registry and field definitions.
//!
//! Parts are named entity subsets (element blocks, side sets, attribute parts such as
//! "active"). A part declared with a primary rank induces membership onto the nodes
//! and sides of its entities, which is how nodal fields restricted to an element block
//! or an interface side set reach their nodes.

use crate::mesh_error::MeshError;
use crate::topology::entity::EntityRank;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldId(pub u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub id: PartId,
    pub name: String,
    /// Rank of the entities this part primarily holds; drives induced membership.
    pub rank: Option<EntityRank>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDef {
    pub id: FieldId,
    pub name: String,
    pub rank: EntityRank,
    pub components: usize,
    /// Empty means "every entity of `rank`".
    pub parts: BTreeSet<PartId>,
}

#[derive(Clone, Debug)]
pub struct MetaData {
    spatial_dim: usize,
    parts: Vec<Part>,
    part_names: HashMap<String, PartId>,
    fields: Vec<FieldDef>,
    field_names: HashMap<String, FieldId>,
    coordinates: FieldId,
}

pub const COORDINATES_FIELD: &str = "coordinates";

impl MetaData {
    pub fn new(spatial_dim: usize) -> Self {
        let mut meta = Self {
            spatial_dim,
            parts: Vec::new(),
            part_names: HashMap::new(),
            fields: Vec::new(),
            field_names: HashMap::new(),
            coordinates: FieldId(0),
        };
        meta.coordinates = meta.declare_field(COORDINATES_FIELD, EntityRank::Node, 3);
        meta
    }

    pub fn spatial_dim(&self) -> usize {
        self.spatial_dim
    }

    /// Declare (or look up) a part by name.
    pub fn declare_part(&mut self, name: &str, rank: Option<EntityRank>) -> PartId {
        if let Some(&id) = self.part_names.get(name) {
            return id;
        }
        let id = PartId(self.parts.len() as u32);
        self.parts.push(Part {
            id,
            name: name.to_string(),
            rank,
        });
        self.part_names.insert(name.to_string(), id);
        id
    }

    pub fn get_part(&self, name: &str) -> Option<PartId> {
        self.part_names.get(name).copied()
    }

    pub fn require_part(&self, name: &str) -> Result<PartId, MeshError> {
        self.get_part(name)
            .ok_or_else(|| MeshError::UnknownPart(name.to_string()))
    }

    pub fn part(&self, id: PartId) -> &Part {
        &self.parts[id.0 as usize]
    }

    pub fn part_name(&self, id: PartId) -> &str {
        &self.parts[id.0 as usize].name
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Declare (or look up) a field by name.
    pub fn declare_field(&mut self, name: &str, rank: EntityRank, components: usize) -> FieldId {
        if let Some(&id) = self.field_names.get(name) {
            return id;
        }
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(FieldDef {
            id,
            name: name.to_string(),
            rank,
            components,
            parts: BTreeSet::new(),
        });
        self.field_names.insert(name.to_string(), id);
        id
    }

    /// Restrict `field` to (the union of) the parts it is put on.
    pub fn put_field_on_part(&mut self, field: FieldId, part: PartId) {
        self.fields[field.0 as usize].parts.insert(part);
    }

    pub fn get_field(&self, name: &str) -> Option<FieldId> {
        self.field_names.get(name).copied()
    }

    pub fn field(&self, id: FieldId) -> &FieldDef {
        &self.fields[id.0 as usize]
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn coordinates_field(&self) -> FieldId {
        self.coordinates
    }

    /// Whether `field` lives on an entity of `rank` with part membership `parts`.
    pub fn field_is_defined(&self, field: FieldId, rank: EntityRank, parts: &BTreeSet<PartId>) -> bool {
        let def = self.field(field);
        def.rank == rank && (def.parts.is_empty() || !def.parts.is_disjoint(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declarations_are_idempotent() {
        let mut meta = MetaData::new(2);
        let a = meta.declare_part("block_1", Some(EntityRank::Element));
        assert_eq!(meta.declare_part("block_1", None), a);
        let t = meta.declare_field("temperature", EntityRank::Node, 1);
        assert_eq!(meta.declare_field("temperature", EntityRank::Node, 1), t);
        assert_eq!(meta.get_field(COORDINATES_FIELD), Some(meta.coordinates_field()));
        assert!(meta.require_part("nope").is_err());
    }

    #[test]
    fn restricted_field_needs_part_overlap() {
        let mut meta = MetaData::new(2);
        let surf = meta.declare_part("surface_1", Some(EntityRank::Edge));
        let flux = meta.declare_field("flux", EntityRank::Node, 1);
        meta.put_field_on_part(flux, surf);
        assert!(!meta.field_is_defined(flux, EntityRank::Node, &BTreeSet::new()));
        assert!(meta.field_is_defined(flux, EntityRank::Node, &BTreeSet::from([surf])));
        assert!(!meta.field_is_defined(flux, EntityRank::Element, &BTreeSet::from([surf])));
    }
}
