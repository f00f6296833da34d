//! `BulkData`: the per-rank view of a distributed unstructured mesh.
//!
//! Entities live in a `BTreeMap<EntityKey, EntityRecord>` so every iteration is in
//! global-id order on every rank. Structural changes (declare, destroy, part changes)
//! are only legal between [`BulkData::modification_begin`] and
//! [`BulkData::modification_end`]; the end of a cycle recomputes induced part
//! membership and (re)allocates field data to match it.

use crate::debug_invariants::DebugInvariants;
use crate::mesh::meta::{FieldId, MetaData, PartId};
use crate::mesh_error::MeshError;
use crate::topology::cell_topology::CellTopology;
use crate::topology::entity::{EntityId, EntityKey, EntityRank};
use crate::topology::entity_comm::{CommMapChangeListener, EntityCommDatabase, EntityCommInfo};
use nalgebra::Vector3;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Stored state of one entity.
#[derive(Clone, Debug, Default)]
pub struct EntityRecord {
    owner: usize,
    parts: BTreeSet<PartId>,
    induced: BTreeSet<PartId>,
    topology: Option<CellTopology>,
    nodes: Vec<EntityId>,
    upward: BTreeSet<EntityKey>,
    sides: BTreeMap<usize, EntityId>,
}

impl EntityRecord {
    pub fn owner(&self) -> usize {
        self.owner
    }
    pub fn topology(&self) -> Option<CellTopology> {
        self.topology
    }
    /// Downward node connectivity (empty for nodes).
    pub fn nodes(&self) -> &[EntityId] {
        &self.nodes
    }
    /// Explicit part membership.
    pub fn explicit_parts(&self) -> &BTreeSet<PartId> {
        &self.parts
    }
    /// Explicit and induced membership.
    pub fn parts(&self) -> BTreeSet<PartId> {
        self.parts.union(&self.induced).copied().collect()
    }
    /// Higher-rank entities connected to this one.
    pub fn upward(&self) -> &BTreeSet<EntityKey> {
        &self.upward
    }
    /// Side entities of an element by side ordinal.
    pub fn sides(&self) -> &BTreeMap<usize, EntityId> {
        &self.sides
    }
}

/// Keeps the list of communicated entities in step with the comm database.
struct CommListUpdater {
    list: Arc<Mutex<BTreeSet<EntityKey>>>,
}

impl CommMapChangeListener for CommListUpdater {
    fn removed_ghost(&mut self, _key: EntityKey, _ghost_id: u32, _proc: usize) {}

    fn removed_key(&mut self, key: EntityKey) {
        self.list.lock().remove(&key);
    }
}

pub struct BulkData {
    meta: MetaData,
    rank: usize,
    size: usize,
    entities: BTreeMap<EntityKey, EntityRecord>,
    comm: EntityCommDatabase,
    comm_list: Arc<Mutex<BTreeSet<EntityKey>>>,
    field_data: HashMap<(FieldId, EntityKey), Vec<f64>>,
    in_modification: bool,
    sync_count: u64,
}

impl std::fmt::Debug for BulkData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkData")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("entities", &self.entities.len())
            .field("sync_count", &self.sync_count)
            .finish()
    }
}

impl BulkData {
    pub fn new(meta: MetaData, rank: usize, size: usize) -> Self {
        let comm_list = Arc::new(Mutex::new(BTreeSet::new()));
        let mut comm = EntityCommDatabase::new();
        comm.set_listener(Box::new(CommListUpdater {
            list: comm_list.clone(),
        }));
        Self {
            meta,
            rank,
            size,
            entities: BTreeMap::new(),
            comm,
            comm_list,
            field_data: HashMap::new(),
            in_modification: false,
            sync_count: 0,
        }
    }

    pub fn meta(&self) -> &MetaData {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut MetaData {
        &mut self.meta
    }

    pub fn parallel_rank(&self) -> usize {
        self.rank
    }

    pub fn parallel_size(&self) -> usize {
        self.size
    }

    pub fn spatial_dim(&self) -> usize {
        self.meta.spatial_dim()
    }

    /// Number of completed modification cycles.
    pub fn sync_count(&self) -> u64 {
        self.sync_count
    }

    pub fn in_modification_cycle(&self) -> bool {
        self.in_modification
    }

    // ----- transactions -------------------------------------------------

    pub fn modification_begin(&mut self) -> Result<(), MeshError> {
        if self.in_modification {
            return Err(MeshError::ModificationState("modification already in progress"));
        }
        self.in_modification = true;
        Ok(())
    }

    pub fn modification_end(&mut self) -> Result<(), MeshError> {
        if !self.in_modification {
            return Err(MeshError::ModificationState("no modification in progress"));
        }
        self.recompute_induced_parts();
        self.reallocate_field_data();
        self.in_modification = false;
        self.sync_count += 1;
        crate::debug_invariants!(self.validate_invariants(), "BulkData::modification_end");
        Ok(())
    }

    fn require_modification(&self) -> Result<(), MeshError> {
        if self.in_modification {
            Ok(())
        } else {
            Err(MeshError::ModificationState("structural change outside modification cycle"))
        }
    }

    fn recompute_induced_parts(&mut self) {
        let mut induced: BTreeMap<EntityKey, BTreeSet<PartId>> = BTreeMap::new();
        for (key, rec) in &self.entities {
            if key.rank == EntityRank::Node {
                continue;
            }
            let inducible: Vec<PartId> = rec
                .parts
                .iter()
                .copied()
                .filter(|p| self.meta.part(*p).rank == Some(key.rank))
                .collect();
            if inducible.is_empty() {
                continue;
            }
            let targets = rec
                .nodes
                .iter()
                .map(|n| EntityKey::node(*n))
                .chain(rec.sides.values().filter_map(|s| self.side_key(*s)));
            for t in targets {
                induced.entry(t).or_default().extend(inducible.iter().copied());
            }
        }
        for (key, rec) in self.entities.iter_mut() {
            rec.induced = induced.remove(key).unwrap_or_default();
        }
    }

    fn reallocate_field_data(&mut self) {
        let mut data = std::mem::take(&mut self.field_data);
        for (key, rec) in &self.entities {
            let parts = rec.parts();
            for def in self.meta.fields() {
                let slot = (def.id, *key);
                if self.meta.field_is_defined(def.id, key.rank, &parts) {
                    data.entry(slot).or_insert_with(|| vec![0.0; def.components]);
                }
            }
        }
        data.retain(|(field, key), _| {
            self.entities
                .get(key)
                .is_some_and(|rec| self.meta.field_is_defined(*field, key.rank, &rec.parts()))
        });
        self.field_data = data;
    }

    fn side_key(&self, side: EntityId) -> Option<EntityKey> {
        let rank = EntityRank::side_rank(self.spatial_dim())?;
        Some(EntityKey::new(rank, side))
    }

    // ----- declarations ------------------------------------------------

    /// Declare a node owned by this rank (or add `parts` to an existing one).
    pub fn declare_node(
        &mut self,
        id: EntityId,
        coords: Vector3<f64>,
        parts: &[PartId],
    ) -> Result<EntityKey, MeshError> {
        self.require_modification()?;
        let key = EntityKey::node(id);
        let rank = self.rank;
        let rec = self.entities.entry(key).or_insert_with(|| EntityRecord {
            owner: rank,
            ..EntityRecord::default()
        });
        rec.parts.extend(parts.iter().copied());
        let coord_field = self.meta.coordinates_field();
        self.field_data
            .insert((coord_field, key), coords.iter().copied().collect());
        Ok(key)
    }

    pub fn declare_element(
        &mut self,
        id: EntityId,
        topology: CellTopology,
        nodes: &[EntityId],
        parts: &[PartId],
    ) -> Result<EntityKey, MeshError> {
        self.declare_connected(EntityKey::element(id), topology, nodes, parts)
    }

    /// Declare a side entity (edge in 2D, face in 3D) with its nodes.
    pub fn declare_side(
        &mut self,
        id: EntityId,
        topology: CellTopology,
        nodes: &[EntityId],
        parts: &[PartId],
    ) -> Result<EntityKey, MeshError> {
        let rank = EntityRank::side_rank(self.spatial_dim())
            .ok_or(MeshError::ModificationState("1D meshes carry no sides"))?;
        self.declare_connected(EntityKey::new(rank, id), topology, nodes, parts)
    }

    fn declare_connected(
        &mut self,
        key: EntityKey,
        topology: CellTopology,
        nodes: &[EntityId],
        parts: &[PartId],
    ) -> Result<EntityKey, MeshError> {
        self.require_modification()?;
        if self.entities.contains_key(&key) {
            return Err(MeshError::DuplicateEntity(key));
        }
        if nodes.len() != topology.num_nodes() {
            return Err(MeshError::InvalidConnectivity {
                key,
                reason: format!("{topology:?} needs {} nodes, got {}", topology.num_nodes(), nodes.len()),
            });
        }
        for n in nodes {
            let nk = EntityKey::node(*n);
            self.entities
                .get_mut(&nk)
                .ok_or(MeshError::MissingEntity(nk))?
                .upward
                .insert(key);
        }
        self.entities.insert(
            key,
            EntityRecord {
                owner: self.rank,
                parts: parts.iter().copied().collect(),
                topology: Some(topology),
                nodes: nodes.to_vec(),
                ..EntityRecord::default()
            },
        );
        Ok(key)
    }

    /// Relate `side` to `elem` at side ordinal `ordinal`.
    pub fn connect_side(&mut self, elem: EntityId, ordinal: usize, side: EntityId) -> Result<(), MeshError> {
        self.require_modification()?;
        let side_key = self
            .side_key(side)
            .ok_or(MeshError::ModificationState("1D meshes carry no sides"))?;
        let ek = EntityKey::element(elem);
        if !self.entities.contains_key(&side_key) {
            return Err(MeshError::MissingEntity(side_key));
        }
        self.entities
            .get_mut(&ek)
            .ok_or(MeshError::MissingEntity(ek))?
            .sides
            .insert(ordinal, side);
        if let Some(rec) = self.entities.get_mut(&side_key) {
            rec.upward.insert(ek);
        }
        Ok(())
    }

    /// Destroy an entity. Nodes must no longer be used by any element or side.
    pub fn destroy_entity(&mut self, key: EntityKey) -> Result<(), MeshError> {
        self.require_modification()?;
        let rec = self.entities.get(&key).ok_or(MeshError::MissingEntity(key))?;
        if key.rank == EntityRank::Node && !rec.upward.is_empty() {
            return Err(MeshError::InvalidConnectivity {
                key,
                reason: "node still has upward relations".into(),
            });
        }
        let Some(rec) = self.entities.remove(&key) else {
            return Err(MeshError::MissingEntity(key));
        };
        for n in &rec.nodes {
            if let Some(nr) = self.entities.get_mut(&EntityKey::node(*n)) {
                nr.upward.remove(&key);
            }
        }
        for s in rec.sides.values() {
            if let Some(sk) = self.side_key(*s) {
                if let Some(sr) = self.entities.get_mut(&sk) {
                    sr.upward.remove(&key);
                }
            }
        }
        for up in &rec.upward {
            if let Some(ur) = self.entities.get_mut(up) {
                ur.sides.retain(|_, s| *s != key.id);
            }
        }
        self.comm.comm_clear(key);
        self.field_data.retain(|(_, k), _| *k != key);
        Ok(())
    }

    pub fn change_entity_parts(
        &mut self,
        key: EntityKey,
        add: &[PartId],
        remove: &[PartId],
    ) -> Result<(), MeshError> {
        self.require_modification()?;
        let rec = self.entities.get_mut(&key).ok_or(MeshError::MissingEntity(key))?;
        for p in remove {
            rec.parts.remove(p);
        }
        rec.parts.extend(add.iter().copied());
        Ok(())
    }

    pub fn set_owner(&mut self, key: EntityKey, owner: usize) -> Result<(), MeshError> {
        self.entities
            .get_mut(&key)
            .ok_or(MeshError::MissingEntity(key))?
            .owner = owner;
        Ok(())
    }

    /// Record that `key` is shared with `proc`.
    pub fn add_sharing(&mut self, key: EntityKey, proc: usize) -> Result<(), MeshError> {
        if !self.entities.contains_key(&key) {
            return Err(MeshError::MissingEntity(key));
        }
        if proc != self.rank && self.comm.insert_info(key, EntityCommInfo::shared(proc)) {
            self.comm_list.lock().insert(key);
        }
        Ok(())
    }

    // ----- queries -----------------------------------------------------

    pub fn entity(&self, key: EntityKey) -> Option<&EntityRecord> {
        self.entities.get(&key)
    }

    pub fn require(&self, key: EntityKey) -> Result<&EntityRecord, MeshError> {
        self.entities.get(&key).ok_or(MeshError::MissingEntity(key))
    }

    pub fn is_valid(&self, key: EntityKey) -> bool {
        self.entities.contains_key(&key)
    }

    /// Keys of one rank in id order.
    pub fn keys(&self, rank: EntityRank) -> impl Iterator<Item = EntityKey> + '_ {
        self.entities
            .keys()
            .copied()
            .filter(move |k| k.rank == rank)
    }

    pub fn owned_keys(&self, rank: EntityRank) -> impl Iterator<Item = EntityKey> + '_ {
        self.entities
            .iter()
            .filter(move |(k, r)| k.rank == rank && r.owner == self.rank)
            .map(|(k, _)| *k)
    }

    pub fn owner(&self, key: EntityKey) -> Option<usize> {
        self.entities.get(&key).map(|r| r.owner)
    }

    pub fn is_locally_owned(&self, key: EntityKey) -> bool {
        self.owner(key) == Some(self.rank)
    }

    pub fn parts_of(&self, key: EntityKey) -> BTreeSet<PartId> {
        self.entities.get(&key).map(EntityRecord::parts).unwrap_or_default()
    }

    pub fn has_part(&self, key: EntityKey, part: PartId) -> bool {
        self.entities
            .get(&key)
            .is_some_and(|r| r.parts.contains(&part) || r.induced.contains(&part))
    }

    pub fn topology(&self, key: EntityKey) -> Option<CellTopology> {
        self.entities.get(&key).and_then(|r| r.topology)
    }

    pub fn nodes_of(&self, key: EntityKey) -> &[EntityId] {
        self.entities.get(&key).map_or(&[], |r| r.nodes.as_slice())
    }

    /// Elements using `node`, ascending.
    pub fn node_elements(&self, node: EntityId) -> Vec<EntityId> {
        self.entities
            .get(&EntityKey::node(node))
            .map(|r| {
                r.upward
                    .iter()
                    .filter(|k| k.rank == EntityRank::Element)
                    .map(|k| k.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Elements connected to side `side`, ascending.
    pub fn side_elements(&self, side: EntityId) -> Vec<EntityId> {
        self.side_key(side)
            .and_then(|k| self.entities.get(&k))
            .map(|r| r.upward.iter().map(|k| k.id).collect())
            .unwrap_or_default()
    }

    /// Existing side whose node set equals `nodes`.
    pub fn find_side(&self, nodes: &[EntityId]) -> Option<EntityId> {
        let rank = EntityRank::side_rank(self.spatial_dim())?;
        let first = self.entities.get(&EntityKey::node(*nodes.first()?))?;
        let mut wanted: Vec<EntityId> = nodes.to_vec();
        wanted.sort_unstable();
        first
            .upward
            .iter()
            .filter(|k| k.rank == rank)
            .find(|k| {
                let mut have = self.nodes_of(**k).to_vec();
                have.sort_unstable();
                have == wanted
            })
            .map(|k| k.id)
    }

    pub fn coordinates(&self, node: EntityId) -> Result<Vector3<f64>, MeshError> {
        let key = EntityKey::node(node);
        let data = self
            .field_data
            .get(&(self.meta.coordinates_field(), key))
            .ok_or(MeshError::MissingEntity(key))?;
        Ok(Vector3::new(data[0], data[1], data[2]))
    }

    pub fn set_coordinates(&mut self, node: EntityId, x: &Vector3<f64>) -> Result<(), MeshError> {
        let key = EntityKey::node(node);
        if !self.entities.contains_key(&key) {
            return Err(MeshError::MissingEntity(key));
        }
        self.field_data
            .insert((self.meta.coordinates_field(), key), x.iter().copied().collect());
        Ok(())
    }

    pub fn field_data(&self, field: FieldId, key: EntityKey) -> Option<&[f64]> {
        self.field_data.get(&(field, key)).map(Vec::as_slice)
    }

    pub fn field_data_mut(&mut self, field: FieldId, key: EntityKey) -> Option<&mut [f64]> {
        self.field_data.get_mut(&(field, key)).map(Vec::as_mut_slice)
    }

    /// Fields with data on `key`, ascending, coordinates excluded.
    pub fn fields_on(&self, key: EntityKey) -> Vec<FieldId> {
        let coords = self.meta.coordinates_field();
        self.meta
            .fields()
            .iter()
            .map(|f| f.id)
            .filter(|f| *f != coords && self.field_data.contains_key(&(*f, key)))
            .collect()
    }

    pub fn comm_db(&self) -> &EntityCommDatabase {
        &self.comm
    }

    /// Entities currently sharing or ghosting with another rank.
    pub fn comm_list(&self) -> Vec<EntityKey> {
        self.comm_list.lock().iter().copied().collect()
    }

    pub fn is_shared(&self, key: EntityKey) -> bool {
        self.comm.is_shared(key)
    }

    pub fn sharing_procs(&self, key: EntityKey) -> Vec<usize> {
        self.comm.sharing_procs(key)
    }

    /// Procs (other than this one) sharing every node of `nodes`, ascending.
    pub fn shared_procs_intersection(&self, nodes: &[EntityId]) -> Vec<usize> {
        let mut iter = nodes.iter();
        let Some(first) = iter.next() else {
            return Vec::new();
        };
        let mut procs = self.sharing_procs(EntityKey::node(*first));
        for n in iter {
            if procs.is_empty() {
                break;
            }
            let other = self.sharing_procs(EntityKey::node(*n));
            procs.retain(|p| other.binary_search(p).is_ok());
        }
        procs
    }

    pub fn max_local_id(&self, rank: EntityRank) -> u64 {
        self.keys(rank).map(|k| k.id.get()).max().unwrap_or(0)
    }
}

impl DebugInvariants for BulkData {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "BulkData");
    }

    fn validate_invariants(&self) -> Result<(), MeshError> {
        for (key, rec) in &self.entities {
            for n in &rec.nodes {
                let nk = EntityKey::node(*n);
                let up = self.entities.get(&nk).ok_or(MeshError::MissingEntity(nk))?;
                if !up.upward.contains(key) {
                    return Err(MeshError::InvalidConnectivity {
                        key: *key,
                        reason: format!("node {n} lacks the upward relation"),
                    });
                }
            }
            for up in &rec.upward {
                if !self.entities.contains_key(up) {
                    return Err(MeshError::InvalidConnectivity {
                        key: *key,
                        reason: format!("dangling upward relation to {up}"),
                    });
                }
            }
        }
        self.comm.validate_invariants()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::meta::MetaData;

    fn id(n: u64) -> EntityId {
        EntityId::new(n).unwrap()
    }

    fn two_triangles() -> (BulkData, PartId) {
        let mut meta = MetaData::new(2);
        let block = meta.declare_part("block_1", Some(EntityRank::Element));
        let mut mesh = BulkData::new(meta, 0, 1);
        mesh.modification_begin().unwrap();
        for (i, (x, y)) in [(0., 0.), (1., 0.), (1., 1.), (0., 1.)].iter().enumerate() {
            mesh.declare_node(id(i as u64 + 1), Vector3::new(*x, *y, 0.0), &[])
                .unwrap();
        }
        mesh.declare_element(id(1), CellTopology::Triangle3, &[id(1), id(2), id(3)], &[block])
            .unwrap();
        mesh.declare_element(id(2), CellTopology::Triangle3, &[id(1), id(3), id(4)], &[block])
            .unwrap();
        mesh.modification_end().unwrap();
        (mesh, block)
    }

    #[test]
    fn block_parts_induce_onto_nodes() {
        let (mesh, block) = two_triangles();
        assert!(mesh.has_part(EntityKey::node(id(3)), block));
        assert_eq!(mesh.node_elements(id(1)), vec![id(1), id(2)]);
        assert!(mesh.require(EntityKey::node(id(3))).unwrap().explicit_parts().is_empty());
    }

    #[test]
    fn structural_change_requires_cycle() {
        let (mut mesh, _) = two_triangles();
        let err = mesh.declare_node(id(9), Vector3::zeros(), &[]);
        assert!(matches!(err, Err(MeshError::ModificationState(_))));
    }

    #[test]
    fn sides_connect_and_destroy_cleanly() {
        let (mut mesh, _) = two_triangles();
        mesh.modification_begin().unwrap();
        mesh.declare_side(id(1), CellTopology::Line2, &[id(1), id(3)], &[]).unwrap();
        mesh.connect_side(id(1), 2, id(1)).unwrap();
        mesh.connect_side(id(2), 0, id(1)).unwrap();
        mesh.modification_end().unwrap();
        assert_eq!(mesh.find_side(&[id(3), id(1)]), Some(id(1)));
        assert_eq!(mesh.side_elements(id(1)), vec![id(1), id(2)]);

        mesh.modification_begin().unwrap();
        mesh.destroy_entity(EntityKey::element(id(2))).unwrap();
        assert!(mesh.destroy_entity(EntityKey::node(id(1))).is_err());
        mesh.destroy_entity(EntityKey::node(id(4))).unwrap();
        mesh.modification_end().unwrap();
        assert_eq!(mesh.side_elements(id(1)), vec![id(1)]);
        mesh.validate_invariants().unwrap();
    }

    #[test]
    fn restricted_fields_follow_membership() {
        let (mut mesh, block) = two_triangles();
        let t = mesh.meta_mut().declare_field("temperature", EntityRank::Node, 1);
        mesh.meta_mut().put_field_on_part(t, block);
        mesh.modification_begin().unwrap();
        mesh.declare_node(id(5), Vector3::new(2.0, 2.0, 0.0), &[]).unwrap();
        mesh.modification_end().unwrap();
        assert!(mesh.field_data(t, EntityKey::node(id(1))).is_some());
        assert!(mesh.field_data(t, EntityKey::node(id(5))).is_none());
        assert_eq!(mesh.fields_on(EntityKey::node(id(2))), vec![t]);
    }

    #[test]
    fn sharing_intersection_and_comm_list() {
        let (mut mesh, _) = two_triangles();
        mesh.add_sharing(EntityKey::node(id(1)), 1).unwrap();
        mesh.add_sharing(EntityKey::node(id(1)), 2).unwrap();
        mesh.add_sharing(EntityKey::node(id(3)), 2).unwrap();
        assert_eq!(mesh.shared_procs_intersection(&[id(1), id(3)]), vec![2]);
        assert_eq!(mesh.comm_list().len(), 2);
    }
}
