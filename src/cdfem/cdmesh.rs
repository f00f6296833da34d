//! One decomposition snapshot of the background mesh.
//!
//! A [`CDMesh`] is built fresh for every step: [`CDMesh::generate_nonconformal_elements`]
//! wraps the background elements, [`CDMesh::decompose`] cuts them against every interface
//! and afterwards the snapshot is read by the mesh mutation and prolongation passes. It is
//! never edited in place once a newer snapshot exists.

use crate::algs::communicator::{Communicator, tags};
use crate::algs::sparse_exchange::{all_reduce_bitor_u64, all_reduce_or, all_reduce_sum_f64};
use crate::cdfem::ancestry::NodeAncestry;
use crate::cdfem::element::{LeafNodes, MeshElement, SubElement, leaf_signature};
use crate::cdfem::node::{NodeArena, NodeIdx};
use crate::cdfem::phase::PhaseSupport;
use crate::cdfem::sync::{build_parallel_hanging_edge_nodes, sync_scores, sync_signs};
use crate::geometry::interface::{InterfaceGeometry, InterfaceId, PhaseTag, sign_of};
use crate::geometry::quality::cell_measure;
use crate::mesh::bulk::BulkData;
use crate::mesh_error::MeshError;
use crate::topology::entity::{EntityId, EntityKey, EntityRank};
use crate::topology::periodic::PeriodicNodeMap;
use nalgebra::Vector3;
use std::collections::{BTreeMap, HashMap};

/// Interfaces are tracked in one `u64` mask during the global reduction.
const MAX_INTERFACES: usize = 64;

/// Node field rule codes.
pub const RULE_EDGE: f64 = 1.0;
pub const RULE_MIDSIDE: f64 = 2.0;

/// Crossings this close to an end node, as a fraction of the edge, land on the node.
pub const DEFAULT_SNAP_TOLERANCE: f64 = 1.0e-6;

#[derive(Clone, Debug)]
pub struct CDMesh {
    spatial_dim: usize,
    step_count: i32,
    arena: NodeArena,
    elements: Vec<MeshElement>,
    index: HashMap<EntityId, usize>,
    interfaces: Vec<InterfaceId>,
    active_interfaces: Vec<InterfaceId>,
    snap_tolerance: f64,
}

impl CDMesh {
    pub fn new(spatial_dim: usize, step_count: i32) -> Self {
        Self {
            spatial_dim,
            step_count,
            arena: NodeArena::new(),
            elements: Vec::new(),
            index: HashMap::new(),
            interfaces: Vec::new(),
            active_interfaces: Vec::new(),
            snap_tolerance: DEFAULT_SNAP_TOLERANCE,
        }
    }

    /// Zero keeps every crossing where the geometry puts it.
    pub fn set_snap_tolerance(&mut self, tolerance: f64) {
        self.snap_tolerance = tolerance;
    }
    pub fn snap_tolerance(&self) -> f64 {
        self.snap_tolerance
    }

    pub fn clear(&mut self) {
        self.arena.clear();
        self.elements.clear();
        self.index.clear();
        self.interfaces.clear();
        self.active_interfaces.clear();
    }

    pub fn spatial_dim(&self) -> usize {
        self.spatial_dim
    }
    pub fn step_count(&self) -> i32 {
        self.step_count
    }
    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }
    pub fn arena_mut(&mut self) -> &mut NodeArena {
        &mut self.arena
    }
    /// Elements in ascending entity order.
    pub fn elements(&self) -> &[MeshElement] {
        &self.elements
    }
    pub fn element(&self, entity: EntityId) -> Option<&MeshElement> {
        self.index.get(&entity).map(|&i| &self.elements[i])
    }
    /// Arena and elements at once, for passes that bind entities to both.
    pub fn parts_mut(&mut self) -> (&mut NodeArena, &mut [MeshElement]) {
        (&mut self.arena, &mut self.elements)
    }
    /// Every interface the last decomposition processed.
    pub fn interfaces(&self) -> &[InterfaceId] {
        &self.interfaces
    }
    /// Interfaces that cut at least one element on some rank.
    pub fn active_interfaces(&self) -> &[InterfaceId] {
        &self.active_interfaces
    }

    /// Wrap every element of a decomposed block that is not itself a child element.
    pub fn generate_nonconformal_elements(&mut self, mesh: &BulkData, phases: &PhaseSupport) -> Result<(), MeshError> {
        self.clear();
        let keys: Vec<EntityKey> = mesh.keys(EntityRank::Element).collect();
        for key in keys {
            if mesh.has_part(key, phases.child_part()) {
                continue;
            }
            if phases.decomposed_block_of(&mesh.parts_of(key)).is_none() {
                continue;
            }
            let topology = mesh.topology(key).ok_or(MeshError::MissingEntity(key))?;
            if !topology.is_supported_for_decomposition() {
                return Err(MeshError::UnsupportedTopology(topology));
            }
            let mut nodes = Vec::with_capacity(topology.num_nodes());
            for &n in mesh.nodes_of(key) {
                nodes.push(self.arena.create_mesh_node(n, key.id, mesh.coordinates(n)?));
            }
            let element = MeshElement::new(key.id, topology, nodes, &self.arena)?;
            self.index.insert(key.id, self.elements.len());
            self.elements.push(element);
        }
        log::debug!(
            "step {}: {} nonconformal elements, {} mesh nodes",
            self.step_count,
            self.elements.len(),
            self.arena.len()
        );
        Ok(())
    }

    /// Interfaces a geometry defines: one per surface, or one per surface pair when each
    /// phase has its own level set.
    pub fn all_interface_ids<G: InterfaceGeometry + ?Sized>(geometry: &G) -> Vec<InterfaceId> {
        let surfaces = geometry.surface_identifiers();
        if geometry.one_levelset_per_phase() {
            surfaces
                .iter()
                .enumerate()
                .flat_map(|(i, a)| surfaces[i + 1..].iter().map(move |b| InterfaceId::new(*a, *b)))
                .collect()
        } else {
            surfaces.into_iter().map(InterfaceId::single).collect()
        }
    }

    /// Cut every element against every interface, keeping shared and periodic copies in
    /// agreement, then assign a phase to every leaf. Collective.
    ///
    /// A crossing within the snap tolerance of an edge end moves onto that node, which
    /// then lies on the interface. Every node on an interface records it as captured.
    pub fn decompose<G, C>(
        &mut self,
        mesh: &BulkData,
        geometry: &G,
        comm: &C,
        periodic: &PeriodicNodeMap,
    ) -> Result<(), MeshError>
    where
        G: InterfaceGeometry + ?Sized,
        C: Communicator,
    {
        let interfaces = Self::all_interface_ids(geometry);
        if interfaces.len() > MAX_INTERFACES {
            return Err(MeshError::Config(format!(
                "{} interfaces, at most {MAX_INTERFACES} are supported",
                interfaces.len()
            )));
        }
        let mut local_mask = 0u64;
        for (bit, &interface) in interfaces.iter().enumerate() {
            self.arena.clear_signs();
            let indices: Vec<NodeIdx> = self.arena.indices().collect();
            for idx in indices {
                let value = geometry.interface_value(interface, self.arena.coordinates(idx));
                self.arena.set_sign(idx, sign_of(value))?;
            }
            let mut snapped = Vec::new();
            for element in &self.elements {
                snapped.extend(element.snap_candidates(&self.arena, geometry, interface, self.snap_tolerance)?);
            }
            snapped.sort();
            snapped.dedup();
            for &idx in &snapped {
                self.arena.snap_to_interface(idx);
            }
            sync_signs(&mut self.arena, mesh, comm, periodic)?;
            let on_interface: Vec<NodeIdx> = self
                .arena
                .indices()
                .filter(|idx| matches!(self.arena.sign(*idx), Ok(0)))
                .collect();
            for idx in on_interface {
                self.arena.capture(idx, interface);
            }

            let mut created = Vec::new();
            for element in &mut self.elements {
                if element.record_signs(&self.arena, interface)? {
                    local_mask |= 1 << bit;
                    created.extend(element.create_edge_nodes(&mut self.arena, geometry, interface)?);
                }
            }
            build_parallel_hanging_edge_nodes(&mut self.arena, mesh, comm, &created)?;
            sync_scores(&mut self.arena, mesh, comm, periodic)?;

            for element in &mut self.elements {
                element.triangulate(&self.arena, geometry, interface)?;
            }
            log::debug!(
                "interface {interface}: {} crossing nodes created locally, {} nodes snapped",
                created.len(),
                snapped.len()
            );
        }

        let mask = all_reduce_bitor_u64(comm, tags::COLLECTIVE, local_mask)?;
        self.active_interfaces = interfaces
            .iter()
            .enumerate()
            .filter(|(bit, _)| mask & (1 << bit) != 0)
            .map(|(_, i)| *i)
            .collect();
        self.interfaces = interfaces;

        let surfaces = geometry.surface_identifiers();
        let closest = geometry.one_levelset_per_phase().then_some(surfaces.as_slice());
        for element in &mut self.elements {
            let uncut = geometry.phase_for_uncut_element(element.entity());
            element.assign_phases(&mut self.arena, closest, uncut)?;
        }
        Ok(())
    }

    fn element_signature(&self, element: &MeshElement) -> Vec<(Vec<NodeAncestry>, PhaseTag)> {
        let mut sig: Vec<_> = element
            .leaves()
            .iter()
            .map(|l| (leaf_signature(&self.arena, l), l.phase().clone()))
            .collect();
        sig.sort();
        sig
    }

    /// Whether this snapshot differs from `previous` anywhere. Collective.
    pub fn decomposition_has_changed<C: Communicator>(
        &self,
        previous: Option<&CDMesh>,
        comm: &C,
    ) -> Result<bool, MeshError> {
        let changed = match previous {
            None => true,
            Some(old) => {
                old.elements.len() != self.elements.len()
                    || self.elements.iter().any(|e| match old.element(e.entity()) {
                        None => true,
                        Some(o) => self.element_signature(e) != old.element_signature(o),
                    })
            }
        };
        all_reduce_or(comm, tags::COLLECTIVE, changed)
    }

    /// Whether a node that both snapshots share by ancestry sits somewhere else now.
    /// Crossing nodes keep their ancestry while the interface slides along their edge.
    /// Collective.
    pub fn coordinates_have_changed<C: Communicator>(
        &self,
        previous: Option<&CDMesh>,
        comm: &C,
    ) -> Result<bool, MeshError> {
        let moved = match previous {
            None => true,
            Some(old) => self.arena.iter().any(|(idx, node)| {
                old.arena
                    .find_by_ancestry(&self.arena.ancestry(idx))
                    .is_some_and(|o| (old.arena.coordinates(o) - node.coordinates()).norm() > 0.0)
            }),
        };
        all_reduce_or(comm, tags::COLLECTIVE, moved)
    }

    /// Rebuild a snapshot from the mesh database alone, using the parent ids stored on
    /// child nodes and child elements.
    pub fn restore_from_mesh(mesh: &BulkData, phases: &PhaseSupport, step_count: i32) -> Result<Self, MeshError> {
        let mut cd = CDMesh::new(mesh.spatial_dim(), step_count);
        cd.generate_nonconformal_elements(mesh, phases)?;
        let restored = cd.restore_child_nodes(mesh, phases)?;

        let lookup = |arena: &NodeArena, id: EntityId| arena.mesh_node(id).or_else(|| restored.get(&id).copied());
        let parent_field = phases.parent_element_id_field();
        let mut children: BTreeMap<EntityId, Vec<SubElement>> = BTreeMap::new();
        let keys: Vec<EntityKey> = mesh.keys(EntityRank::Element).collect();
        for key in keys {
            if !mesh.has_part(key, phases.child_part()) {
                continue;
            }
            let parent = mesh
                .field_data(parent_field, key)
                .and_then(|v| EntityId::new(v[0] as u64).ok())
                .ok_or_else(|| MeshError::Ancestry(format!("child element {key} has no parent id")))?;
            let topology = mesh.topology(key).ok_or(MeshError::MissingEntity(key))?;
            let nodes = mesh
                .nodes_of(key)
                .iter()
                .map(|n| {
                    lookup(&cd.arena, *n)
                        .ok_or_else(|| MeshError::Ancestry(format!("node {n} of {key} is not derivable")))
                })
                .collect::<Result<LeafNodes, _>>()?;
            let phase = conformal_phase(mesh, phases, key);
            children
                .entry(parent)
                .or_default()
                .push(SubElement::restored(topology, nodes, phase, key.id));
        }

        for element in &mut cd.elements {
            let key = EntityKey::element(element.entity());
            let leaves = children.remove(&element.entity()).unwrap_or_default();
            let phase = conformal_phase(mesh, phases, key);
            element.restore(leaves, phase)?;
        }
        if let Some(parent) = children.keys().next() {
            return Err(MeshError::Ancestry(format!(
                "child elements refer to unknown parent element {parent}"
            )));
        }
        Ok(cd)
    }

    /// Recreate child nodes from their parent id field, parents first.
    fn restore_child_nodes(&mut self, mesh: &BulkData, phases: &PhaseSupport) -> Result<HashMap<EntityId, NodeIdx>, MeshError> {
        let field = phases.parent_node_ids_field();
        let mut pending: Vec<(EntityId, [f64; 3])> = mesh
            .keys(EntityRank::Node)
            .filter(|k| mesh.has_part(*k, phases.child_edge_node_part()))
            .filter_map(|k| {
                let v = mesh.field_data(field, k)?;
                Some((k.id, [v[0], v[1], v[2]]))
            })
            .collect();
        let mut restored: HashMap<EntityId, NodeIdx> = HashMap::new();
        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::new();
            for (node, [p0, p1, rule]) in pending {
                let find = |raw: f64| {
                    let id = EntityId::new(raw as u64).ok()?;
                    self.arena.mesh_node(id).or_else(|| restored.get(&id).copied())
                };
                let (Some(a), Some(b)) = (find(p0), find(p1)) else {
                    waiting.push((node, [p0, p1, rule]));
                    continue;
                };
                let owner = mesh.node_elements(node).first().copied().unwrap_or(node);
                let idx = if rule == RULE_MIDSIDE {
                    self.arena.create_midside_node(owner, a, b)
                } else {
                    let x = mesh.coordinates(node)?;
                    let (x0, x1) = (*self.arena.coordinates(a), *self.arena.coordinates(b));
                    let d = x1 - x0;
                    let t = if d.norm_squared() > 0.0 {
                        ((x - x0).dot(&d) / d.norm_squared()).clamp(f64::EPSILON, 1.0 - f64::EPSILON)
                    } else {
                        0.5
                    };
                    self.arena.create_edge_node(owner, a, b, t)?
                };
                self.arena.set_entity(idx, node)?;
                restored.insert(node, idx);
            }
            if waiting.len() == before {
                return Err(MeshError::Ancestry(format!(
                    "{} child nodes have parents that cannot be restored",
                    waiting.len()
                )));
            }
            pending = waiting;
        }
        Ok(restored)
    }

    /// Global volume of every conformal part and area of every interface part, logged
    /// and returned by part name. Collective.
    pub fn conformal_volumes_and_surface_areas<C: Communicator>(
        mesh: &BulkData,
        phases: &PhaseSupport,
        comm: &C,
    ) -> Result<Vec<(String, f64)>, MeshError> {
        let mut parts = Vec::new();
        for block in phases.decomposed_blocks() {
            parts.extend(phases.conformal_parts(block));
        }
        let volume_parts = parts.len();
        parts.extend(phases.interface_parts().iter().copied());

        let mut local = vec![0.0; parts.len()];
        let side_rank = EntityRank::side_rank(mesh.spatial_dim()).unwrap_or(EntityRank::Node);
        for (i, part) in parts.iter().enumerate() {
            let rank = if i < volume_parts { EntityRank::Element } else { side_rank };
            for key in mesh.owned_keys(rank) {
                if !mesh.has_part(key, *part) || !mesh.has_part(key, phases.active_part()) {
                    continue;
                }
                local[i] += entity_measure(mesh, key)?;
            }
        }
        let global = all_reduce_sum_f64(comm, tags::COLLECTIVE, &local)?;
        let named: Vec<(String, f64)> = parts
            .iter()
            .zip(global)
            .map(|(p, v)| (mesh.meta().part_name(*p).to_string(), v))
            .collect();
        for (name, value) in &named {
            log::info!("conformal part {name}: {value:.6e}");
        }
        Ok(named)
    }
}

/// Phase of the conformal part `key` belongs to, empty when it is in none.
fn conformal_phase(mesh: &BulkData, phases: &PhaseSupport, key: EntityKey) -> PhaseTag {
    phases
        .conformal_subset(&mesh.parts_of(key))
        .into_iter()
        .find_map(|p| phases.phase_of_conformal(p).cloned())
        .unwrap_or_default()
}

/// Length, area or volume of an element or side; nodes count as one.
pub fn entity_measure(mesh: &BulkData, key: EntityKey) -> Result<f64, MeshError> {
    if key.rank == EntityRank::Node {
        return Ok(1.0);
    }
    let topology = mesh.topology(key).ok_or(MeshError::MissingEntity(key))?;
    let x = mesh.nodes_of(key)[..topology.num_vertices()]
        .iter()
        .map(|n| mesh.coordinates(*n))
        .collect::<Result<Vec<Vector3<f64>>, _>>()?;
    Ok(match (key.rank, x.len()) {
        (EntityRank::Element, _) => cell_measure(topology, &x)?.abs(),
        (_, 2) => (x[1] - x[0]).norm(),
        (_, 3) => 0.5 * (x[1] - x[0]).cross(&(x[2] - x[0])).norm(),
        _ => 1.0,
    })
}
