//! Committing a decomposed snapshot to the mesh database.
//!
//! Two modification cycles per step. The first declares crossing nodes and child
//! elements, reuses whatever the previous step left with the same identity and
//! destroys the rest. The second runs once connectivity is final on every rank: it
//! creates interface sides and settles side, node and activity parts.

use crate::algs::communicator::{Communicator, tags};
use crate::algs::communicator::CommTag;
use crate::algs::sparse_exchange::{all_reduce_or, exchange};
use crate::cdfem::cdmesh::{CDMesh, RULE_EDGE, RULE_MIDSIDE};
use crate::cdfem::node::{NodeArena, NodeIdx, NodeKind};
use crate::cdfem::options::CdfemOptions;
use crate::cdfem::phase::{PARENT_ELEMENT_ID_FIELD, PARENT_NODE_IDS_FIELD, PhaseSupport};
use crate::cdfem::sync::sharing_procs_of;
use crate::geometry::interface::PhaseTag;
use crate::mesh::bulk::BulkData;
use crate::mesh::meta::PartId;
use crate::mesh::parallel::{
    NewEntityRequest, ResolvedEntity, SideRequest, apply_resolution, batch_create_sides,
    exchange_shared_node_parts, generate_new_ids, resolve_new_entities,
};
use crate::mesh_error::MeshError;
use crate::topology::entity::{EntityId, EntityKey, EntityRank};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// What one mutation did on this rank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MutationReport {
    pub nodes_created: usize,
    pub nodes_reused: usize,
    /// Reused nodes whose coordinates followed the interface along their edge.
    pub nodes_moved: usize,
    pub nodes_destroyed: usize,
    pub elements_created: usize,
    pub elements_reused: usize,
    pub elements_destroyed: usize,
    pub sides_declared: usize,
}

type ChildNodeKey = (EntityId, EntityId, NodeKind);

fn child_node_key(a: EntityId, b: EntityId, kind: NodeKind) -> ChildNodeKey {
    if a <= b { (a, b, kind) } else { (b, a, kind) }
}

fn rule_code(kind: NodeKind) -> Result<f64, MeshError> {
    match kind {
        NodeKind::Edge => Ok(RULE_EDGE),
        NodeKind::MidSide => Ok(RULE_MIDSIDE),
        other => Err(MeshError::Ancestry(format!("{other:?} nodes cannot be stored in the mesh"))),
    }
}

fn rule_kind(code: f64) -> Option<NodeKind> {
    if code == RULE_EDGE {
        Some(NodeKind::Edge)
    } else if code == RULE_MIDSIDE {
        Some(NodeKind::MidSide)
    } else {
        None
    }
}

fn two_parents(arena: &NodeArena, idx: NodeIdx) -> Result<[NodeIdx; 2], MeshError> {
    match arena.get(idx).parents() {
        [a, b] => Ok([*a, *b]),
        other => Err(MeshError::Ancestry(format!(
            "node {idx:?} has {} parents, stored child nodes need two",
            other.len()
        ))),
    }
}

/// Child nodes already in the mesh, by parent entities and rule.
fn existing_child_nodes(mesh: &BulkData, phases: &PhaseSupport) -> HashMap<ChildNodeKey, EntityId> {
    let field = phases.parent_node_ids_field();
    mesh.keys(EntityRank::Node)
        .filter(|k| mesh.has_part(*k, phases.child_edge_node_part()))
        .filter_map(|k| {
            let v = mesh.field_data(field, k)?;
            let a = EntityId::new(v[0] as u64).ok()?;
            let b = EntityId::new(v[1] as u64).ok()?;
            Some((child_node_key(a, b, rule_kind(v[2])?), k.id))
        })
        .collect()
}

/// Every node a leaf uses, plus their ancestors.
fn nodes_in_use(cd: &CDMesh) -> BTreeSet<NodeIdx> {
    let arena = cd.arena();
    let mut out = BTreeSet::new();
    let mut stack: Vec<NodeIdx> = cd
        .elements()
        .iter()
        .flat_map(|e| e.leaves())
        .flat_map(|l| l.nodes().iter().copied())
        .collect();
    while let Some(n) = stack.pop() {
        if out.insert(n) {
            stack.extend(arena.get(n).parents().iter().copied());
        }
    }
    out
}

/// Derived nodes bound to the entity they had before, and those needing a new one.
struct NodeBinding {
    reused: Vec<NodeIdx>,
    fresh: Vec<(NodeIdx, ResolvedEntity)>,
}

/// Bind every derived node in use to a mesh entity: the entity the same node had in
/// `previous`, an existing child node with the same parents and rule, or a fresh id
/// agreed with the ranks that share the node. Collective.
fn bind_child_nodes<C: Communicator>(
    arena: &mut NodeArena,
    mesh: &BulkData,
    phases: &PhaseSupport,
    comm: &C,
    in_use: &BTreeSet<NodeIdx>,
    previous: Option<&CDMesh>,
) -> Result<NodeBinding, MeshError> {
    let child_node = phases.child_edge_node_part();
    let still_child = |id: EntityId| mesh.has_part(EntityKey::node(id), child_node);
    // the parent id scan is only needed for nodes the previous snapshot does not know
    let mut by_parents: Option<HashMap<ChildNodeKey, EntityId>> = None;
    let mut reused = Vec::new();
    let mut fresh = Vec::new();
    // arena order puts parents before their children
    for &idx in in_use {
        if arena.get(idx).entity().is_some() {
            continue;
        }
        let kind = arena.kind(idx);
        rule_code(kind)?;
        let from_previous = previous.and_then(|old| {
            let o = old.arena().find_by_ancestry(&arena.ancestry(idx))?;
            old.arena().get(o).entity().filter(|id| still_child(*id))
        });
        let id = match from_previous {
            Some(id) => Some(id),
            None => {
                let [a, b] = two_parents(arena, idx)?;
                match (arena.get(a).entity(), arena.get(b).entity()) {
                    (Some(ea), Some(eb)) => by_parents
                        .get_or_insert_with(|| existing_child_nodes(mesh, phases))
                        .get(&child_node_key(ea, eb, kind))
                        .copied(),
                    _ => None,
                }
            }
        };
        match id {
            Some(id) => {
                arena.set_entity(idx, id)?;
                reused.push(idx);
            }
            None => fresh.push(idx),
        }
    }

    let requests: Vec<NewEntityRequest> = fresh
        .iter()
        .map(|&idx| {
            let ancestry = arena.ancestry(idx);
            NewEntityRequest {
                candidates: sharing_procs_of(mesh, &ancestry),
                identity: ancestry.identity_key(),
            }
        })
        .collect();
    let resolved = resolve_new_entities(mesh, comm, EntityRank::Node, &requests)?;
    for (&idx, res) in fresh.iter().zip(&resolved) {
        arena.set_entity(idx, res.id)?;
    }
    Ok(NodeBinding { reused, fresh: fresh.into_iter().zip(resolved).collect() })
}

fn entity_of(arena: &NodeArena, idx: NodeIdx) -> Result<EntityId, MeshError> {
    arena
        .get(idx)
        .entity()
        .ok_or_else(|| MeshError::NodeState(format!("node {idx:?} has no mesh entity")))
}

/// Existing child elements by parent, with their sorted node sets.
fn existing_children(
    mesh: &BulkData,
    phases: &PhaseSupport,
) -> Result<BTreeMap<EntityId, Vec<(Vec<EntityId>, EntityId)>>, MeshError> {
    let field = phases.parent_element_id_field();
    let mut out: BTreeMap<EntityId, Vec<(Vec<EntityId>, EntityId)>> = BTreeMap::new();
    for key in mesh.keys(EntityRank::Element) {
        if !mesh.has_part(key, phases.child_part()) {
            continue;
        }
        let parent = mesh
            .field_data(field, key)
            .and_then(|v| EntityId::new(v[0] as u64).ok())
            .ok_or_else(|| MeshError::Ancestry(format!("child element {key} has no parent id")))?;
        let mut nodes = mesh.nodes_of(key).to_vec();
        nodes.sort_unstable();
        out.entry(parent).or_default().push((nodes, key.id));
    }
    Ok(out)
}

fn conformal_part_for(phases: &PhaseSupport, block: PartId, phase: &PhaseTag) -> Result<PartId, MeshError> {
    phases.conformal_part(block, phase).ok_or_else(|| {
        MeshError::Config(format!(
            "no phase of block `{}` matches {phase}",
            phases.block_name(block).unwrap_or("?")
        ))
    })
}

#[derive(Default)]
struct ElementPlan {
    /// `(key, add, remove)`
    parts: Vec<(EntityKey, Vec<PartId>, Vec<PartId>)>,
    /// `(element, leaf, entity)` for leaves that keep an existing element.
    bind: Vec<(usize, usize, EntityId)>,
    /// `(element, leaf, conformal part)` for leaves that need a new element.
    create: Vec<(usize, usize, PartId)>,
    destroy: Vec<EntityKey>,
}

fn plan_elements(cd: &CDMesh, mesh: &BulkData, phases: &PhaseSupport) -> Result<ElementPlan, MeshError> {
    let arena = cd.arena();
    let (active, parent) = (phases.active_part(), phases.parent_part());
    let mut children = existing_children(mesh, phases)?;
    let mut plan = ElementPlan::default();

    for (ei, element) in cd.elements().iter().enumerate() {
        let key = EntityKey::element(element.entity());
        let block = phases
            .decomposed_block_of(&mesh.parts_of(key))
            .ok_or_else(|| MeshError::Config(format!("element {key} is in no decomposed block")))?;
        let all_conformal = phases.conformal_parts(block);
        let mut old = children.remove(&element.entity()).unwrap_or_default();

        if !element.is_cut() {
            let conformal = conformal_part_for(phases, block, element.leaves()[0].phase())?;
            let mut remove: Vec<PartId> = all_conformal.iter().copied().filter(|p| *p != conformal).collect();
            remove.push(parent);
            plan.parts.push((key, vec![active, conformal], remove));
            plan.bind.push((ei, 0, element.entity()));
        } else {
            let mut remove = all_conformal.clone();
            remove.push(active);
            plan.parts.push((key, vec![parent], remove));
            for (li, leaf) in element.leaves().iter().enumerate() {
                let conformal = conformal_part_for(phases, block, leaf.phase())?;
                let mut nodes = leaf
                    .nodes()
                    .iter()
                    .map(|n| entity_of(arena, *n))
                    .collect::<Result<Vec<_>, _>>()?;
                nodes.sort_unstable();
                match old.iter().position(|(n, _)| *n == nodes) {
                    Some(pos) => {
                        let (_, id) = old.swap_remove(pos);
                        let others = all_conformal.iter().copied().filter(|p| *p != conformal).collect();
                        plan.parts.push((EntityKey::element(id), vec![active, conformal], others));
                        plan.bind.push((ei, li, id));
                    }
                    None => plan.create.push((ei, li, conformal)),
                }
            }
        }
        plan.destroy.extend(old.into_iter().map(|(_, id)| EntityKey::element(id)));
    }
    // children of parents that left the decomposition
    plan.destroy
        .extend(children.into_values().flatten().map(|(_, id)| EntityKey::element(id)));

    for key in mesh.keys(EntityRank::Element) {
        if cd.element(key.id).is_none() && !mesh.has_part(key, phases.child_part()) {
            plan.parts.push((key, vec![active], Vec::new()));
        }
    }
    Ok(plan)
}

/// Sides left without elements and child nodes nothing uses any more.
fn destroy_orphans(
    mesh: &mut BulkData,
    phases: &PhaseSupport,
    keep: &BTreeSet<EntityId>,
) -> Result<usize, MeshError> {
    let child_node = phases.child_edge_node_part();
    let orphaned = |mesh: &BulkData, k: EntityKey| mesh.entity(k).is_some_and(|r| r.upward().is_empty());
    if let Some(side_rank) = EntityRank::side_rank(mesh.spatial_dim()) {
        let view: &BulkData = mesh;
        let sides: Vec<EntityKey> = view
            .keys(side_rank)
            .filter(|k| orphaned(view, *k))
            .filter(|k| view.nodes_of(*k).iter().any(|n| view.has_part(EntityKey::node(*n), child_node)))
            .collect();
        for key in sides {
            mesh.destroy_entity(key)?;
        }
    }
    let view: &BulkData = mesh;
    let nodes: Vec<EntityKey> = view
        .keys(EntityRank::Node)
        .filter(|k| view.has_part(*k, child_node) && !keep.contains(&k.id) && orphaned(view, *k))
        .collect();
    for key in &nodes {
        mesh.destroy_entity(*key)?;
    }
    Ok(nodes.len())
}

/// Write the snapshot into the mesh database. Collective.
///
/// `previous` is the snapshot the mesh currently holds, if any; its nodes hand their
/// entities to the nodes of `cd` with the same ancestry. On return every leaf of `cd`
/// is bound to the element holding it and every node in use to its mesh node, placed
/// where `cd` puts it.
pub fn modify_mesh<C: Communicator>(
    cd: &mut CDMesh,
    mesh: &mut BulkData,
    phases: &PhaseSupport,
    comm: &C,
    options: &CdfemOptions,
    previous: Option<&CDMesh>,
) -> Result<MutationReport, MeshError> {
    let mut report = MutationReport::default();
    let in_use = nodes_in_use(cd);
    let NodeBinding { reused, fresh } = bind_child_nodes(cd.arena_mut(), mesh, phases, comm, &in_use, previous)?;
    report.nodes_reused = reused.len();
    report.nodes_created = fresh.len();
    let plan = plan_elements(cd, mesh, phases)?;
    let new_ids = generate_new_ids(mesh, comm, EntityRank::Element, plan.create.len())?;

    let (child_node, child, active) = (phases.child_edge_node_part(), phases.child_part(), phases.active_part());
    mesh.modification_begin()?;
    for key in &plan.destroy {
        mesh.destroy_entity(*key)?;
    }
    for (idx, res) in &fresh {
        let key = mesh.declare_node(res.id, *cd.arena().coordinates(*idx), &[child_node])?;
        apply_resolution(mesh, key, res)?;
    }
    for &idx in &reused {
        let id = entity_of(cd.arena(), idx)?;
        let x = cd.arena().coordinates(idx);
        if mesh.coordinates(id)? != *x {
            mesh.set_coordinates(id, x)?;
            report.nodes_moved += 1;
        }
    }
    for (&(ei, li, conformal), id) in plan.create.iter().zip(&new_ids) {
        let leaf = &cd.elements()[ei].leaves()[li];
        let nodes = leaf
            .nodes()
            .iter()
            .map(|n| entity_of(cd.arena(), *n))
            .collect::<Result<Vec<_>, _>>()?;
        mesh.declare_element(*id, leaf.topology(), &nodes, &[conformal, child, active])?;
    }
    for (key, add, remove) in &plan.parts {
        mesh.change_entity_parts(*key, add, remove)?;
    }
    let keep: BTreeSet<EntityId> = in_use.iter().filter_map(|n| cd.arena().get(*n).entity()).collect();
    report.nodes_destroyed = destroy_orphans(mesh, phases, &keep)?;
    mesh.modification_end()?;

    let node_field = phases.parent_node_ids_field();
    for (idx, res) in &fresh {
        let [a, b] = two_parents(cd.arena(), *idx)?;
        let values = [
            entity_of(cd.arena(), a)?.get() as f64,
            entity_of(cd.arena(), b)?.get() as f64,
            rule_code(cd.arena().kind(*idx))?,
        ];
        let key = EntityKey::node(res.id);
        mesh.field_data_mut(node_field, key)
            .ok_or_else(|| MeshError::FieldNotDefined { field: PARENT_NODE_IDS_FIELD.into(), key })?
            .copy_from_slice(&values);
    }
    let element_field = phases.parent_element_id_field();
    for (&(ei, _, _), id) in plan.create.iter().zip(&new_ids) {
        let key = EntityKey::element(*id);
        let parent = cd.elements()[ei].entity();
        mesh.field_data_mut(element_field, key)
            .ok_or_else(|| MeshError::FieldNotDefined { field: PARENT_ELEMENT_ID_FIELD.into(), key })?[0] =
            parent.get() as f64;
    }

    let (_, elements) = cd.parts_mut();
    for &(ei, li, id) in &plan.bind {
        elements[ei].leaves_mut()[li].set_entity(id)?;
    }
    for (&(ei, li, _), id) in plan.create.iter().zip(&new_ids) {
        elements[ei].leaves_mut()[li].set_entity(*id)?;
    }
    report.elements_created = new_ids.len();
    report.elements_reused = plan.bind.len();
    report.elements_destroyed = plan.destroy.len();

    mesh.modification_begin()?;
    if EntityRank::side_rank(mesh.spatial_dim()).is_some() {
        let requests = side_requests(cd, mesh, phases, comm, options)?;
        report.sides_declared = batch_create_sides(mesh, comm, &requests)?;
    }
    update_element_side_parts(mesh, phases, comm)?;
    activate_nodes(mesh, phases)?;
    mesh.modification_end()?;

    if options.check_side_parts {
        check_element_side_parts(mesh, phases, comm)?;
    }
    log::debug!("mesh modification on rank {}: {report:?}", comm.rank());
    Ok(report)
}

/// Sides that may lie on an interface, judged from the conformal parts of their nodes
/// on every rank, plus internal sides between subelements when asked for. Collective.
fn side_requests<C: Communicator>(
    cd: &CDMesh,
    mesh: &BulkData,
    phases: &PhaseSupport,
    comm: &C,
    options: &CdfemOptions,
) -> Result<Vec<SideRequest>, MeshError> {
    let node_parts = exchange_shared_node_parts(mesh, comm)?;
    let conformal_of = |n: EntityId| match node_parts.get(&n) {
        Some(parts) => phases.conformal_subset(parts),
        None => phases.conformal_subset(&mesh.parts_of(EntityKey::node(n))),
    };

    let mut requests = Vec::new();
    for key in mesh.keys(EntityRank::Element) {
        if !mesh.has_part(key, phases.active_part()) {
            continue;
        }
        let Some(topology) = mesh.topology(key) else {
            continue;
        };
        let nodes = mesh.nodes_of(key);
        for ordinal in 0..topology.num_sides() {
            let common = topology
                .side_vertices(ordinal)
                .iter()
                .map(|&i| conformal_of(nodes[i]))
                .reduce(|acc, here| acc.intersection(&here).copied().collect());
            if common.is_some_and(|c| c.len() >= 2) {
                requests.push(SideRequest { element: key.id, ordinal, parts: Vec::new() });
            }
        }
    }

    if options.build_internal_sides {
        for element in cd.elements().iter().filter(|e| e.is_cut()) {
            for leaf in element.leaves() {
                let Some(id) = leaf.entity() else {
                    continue;
                };
                let topology = leaf.topology();
                for ordinal in 0..topology.num_sides() {
                    let side: Vec<NodeIdx> = topology
                        .side_vertices(ordinal)
                        .iter()
                        .map(|&i| leaf.nodes()[i])
                        .collect();
                    if element.parent_side_of(cd.arena(), &side).is_none() {
                        requests.push(SideRequest { element: id, ordinal, parts: Vec::new() });
                    }
                }
            }
        }
    }
    Ok(requests)
}

/// Rank carrying interface parts: sides, or nodes in 1D.
fn interface_rank(spatial_dim: usize) -> EntityRank {
    EntityRank::side_rank(spatial_dim).unwrap_or(EntityRank::Node)
}

/// Conformal parts of the active elements touching a side (or a node in 1D).
fn touching_conformal_parts(mesh: &BulkData, phases: &PhaseSupport, key: EntityKey) -> BTreeSet<PartId> {
    let elements = if key.rank == EntityRank::Node {
        mesh.node_elements(key.id)
    } else {
        mesh.side_elements(key.id)
    };
    elements
        .into_iter()
        .map(EntityKey::element)
        .filter(|e| mesh.has_part(*e, phases.active_part()))
        .flat_map(|e| phases.conformal_subset(&mesh.parts_of(e)))
        .collect()
}

/// Conformal parts touching every side (node in 1D), merged over the ranks sharing it.
/// Collective.
fn gather_touching_parts<C: Communicator>(
    mesh: &BulkData,
    phases: &PhaseSupport,
    comm: &C,
    tag: CommTag,
) -> Result<BTreeMap<EntityKey, BTreeSet<PartId>>, MeshError> {
    let mut touching: BTreeMap<EntityKey, BTreeSet<PartId>> = mesh
        .keys(interface_rank(mesh.spatial_dim()))
        .map(|k| (k, touching_conformal_parts(mesh, phases, k)))
        .collect();

    let mut outgoing: BTreeMap<usize, Vec<(EntityKey, Vec<u32>)>> = BTreeMap::new();
    for (key, parts) in &touching {
        if !mesh.is_shared(*key) {
            continue;
        }
        let raw: Vec<u32> = parts.iter().map(|p| p.0).collect();
        for p in mesh.sharing_procs(*key) {
            outgoing.entry(p).or_default().push((*key, raw.clone()));
        }
    }
    for (_, items) in exchange(comm, tag, &outgoing)? {
        for (key, raw) in items {
            if let Some(set) = touching.get_mut(&key) {
                set.extend(raw.into_iter().map(PartId));
            }
        }
    }
    Ok(touching)
}

/// Interface part a side touched by `conformal` must carry.
pub fn expected_interface_part(phases: &PhaseSupport, conformal: &BTreeSet<PartId>) -> Option<PartId> {
    let mut iter = conformal.iter();
    match (iter.next(), iter.next(), iter.next()) {
        (Some(a), Some(b), None) => phases.interface_part(*a, *b),
        _ => None,
    }
}

/// Put every side on the interface part matching the conformal parts around it on all
/// ranks, mark block boundaries and side activity. Collective.
pub fn update_element_side_parts<C: Communicator>(
    mesh: &mut BulkData,
    phases: &PhaseSupport,
    comm: &C,
) -> Result<(), MeshError> {
    let touching = gather_touching_parts(mesh, phases, comm, tags::SIDE_PARTS)?;
    let interface_parts: Vec<PartId> = phases.interface_parts().iter().copied().collect();
    let (active, boundary) = (phases.active_part(), phases.block_boundary_part());
    for (key, parts) in touching {
        let expected = expected_interface_part(phases, &parts);
        let mut remove: Vec<PartId> = interface_parts.iter().copied().filter(|p| Some(*p) != expected).collect();
        let mut add: Vec<PartId> = expected.into_iter().collect();
        let blocks: BTreeSet<PartId> = parts.iter().filter_map(|p| phases.block_of_conformal(*p)).collect();
        if blocks.len() > 1 {
            add.push(boundary);
        } else {
            remove.push(boundary);
        }
        if key.rank != EntityRank::Node {
            let locally_active = mesh
                .side_elements(key.id)
                .into_iter()
                .any(|e| mesh.has_part(EntityKey::element(e), active));
            if locally_active || !parts.is_empty() {
                add.push(active);
            } else {
                remove.push(active);
            }
        }
        mesh.change_entity_parts(key, &add, &remove)?;
    }
    Ok(())
}

/// Nodes are active exactly when an active element uses them.
fn activate_nodes(mesh: &mut BulkData, phases: &PhaseSupport) -> Result<(), MeshError> {
    let active = phases.active_part();
    let keys: Vec<EntityKey> = mesh.keys(EntityRank::Node).collect();
    for key in keys {
        let used = mesh
            .node_elements(key.id)
            .into_iter()
            .any(|e| mesh.has_part(EntityKey::element(e), active));
        if used {
            mesh.change_entity_parts(key, &[active], &[])?;
        } else {
            mesh.change_entity_parts(key, &[], &[active])?;
        }
    }
    Ok(())
}

/// Every active side is touched by at most two conformal parts, counted over all
/// ranks sharing it, and carries exactly the interface part they call for. Collective:
/// a failure on any rank fails every rank.
pub fn check_element_side_parts<C: Communicator>(
    mesh: &BulkData,
    phases: &PhaseSupport,
    comm: &C,
) -> Result<(), MeshError> {
    let touching = gather_touching_parts(mesh, phases, comm, tags::SIDE_PART_CHECK)?;
    let mut failure = None;
    for (key, parts) in touching {
        if parts.is_empty() {
            continue;
        }
        let problem = if parts.len() > 2 {
            Some(format!("{} conformal parts touch it", parts.len()))
        } else {
            let expected: Vec<PartId> = expected_interface_part(phases, &parts).into_iter().collect();
            let present: Vec<PartId> = phases
                .interface_parts()
                .iter()
                .copied()
                .filter(|p| mesh.has_part(key, *p))
                .collect();
            (present != expected).then(|| format!("interface parts {present:?}, expected {expected:?}"))
        };
        if let Some(reason) = problem {
            log::error!("side part check failed on {key}: {reason}");
            failure = Some(format!("side parts of {key}: {reason}"));
            break;
        }
    }
    if all_reduce_or(comm, tags::SIDE_PART_CHECK.offset(2), failure.is_some())? {
        return Err(MeshError::InvariantViolation(
            failure.unwrap_or_else(|| "side part check failed on another rank".into()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::cdfem::cdmesh::entity_measure;
    use crate::cdfem::phase::PhaseSupportConfig;
    use crate::geometry::interface::{AnalyticGeometry, LevelSet, SurfaceId};
    use crate::mesh::meta::MetaData;
    use crate::mesh_generation::{DEFAULT_BLOCK, Partition, interval_mesh, triangle_mesh};
    use crate::topology::periodic::PeriodicNodeMap;
    use approx::assert_relative_eq;

    fn plane_x(offset: f64) -> AnalyticGeometry {
        AnalyticGeometry::new(vec![LevelSet::Plane { normal: [1.0, 0.0, 0.0], offset }])
    }

    fn strip() -> (BulkData, PhaseSupport) {
        let mut mesh = triangle_mesh(MetaData::new(2), 4, 2, 1.0, 0.5, Partition::serial(), Default::default())
            .unwrap()
            .mesh;
        let config = PhaseSupportConfig::two_phase(DEFAULT_BLOCK, SurfaceId(0));
        let phases = PhaseSupport::declare(mesh.meta_mut(), &config).unwrap();
        (mesh, phases)
    }

    fn cut(mesh: &mut BulkData, phases: &PhaseSupport, offset: f64) -> (CDMesh, MutationReport) {
        cut_after(mesh, phases, offset, None)
    }

    fn cut_after(
        mesh: &mut BulkData,
        phases: &PhaseSupport,
        offset: f64,
        previous: Option<&CDMesh>,
    ) -> (CDMesh, MutationReport) {
        let mut cd = CDMesh::new(mesh.spatial_dim(), 0);
        cd.generate_nonconformal_elements(mesh, phases).unwrap();
        cd.decompose(mesh, &plane_x(offset), &NoComm, &PeriodicNodeMap::new()).unwrap();
        let options = CdfemOptions { check_side_parts: true, ..CdfemOptions::default() };
        let report = modify_mesh(&mut cd, mesh, phases, &NoComm, &options, previous).unwrap();
        (cd, report)
    }

    fn measure_of(mesh: &BulkData, rank: EntityRank, part: PartId, active: PartId) -> f64 {
        mesh.keys(rank)
            .filter(|k| mesh.has_part(*k, part) && mesh.has_part(*k, active))
            .map(|k| entity_measure(mesh, k).unwrap())
            .sum()
    }

    #[test]
    fn strip_cut_builds_children_and_interface_sides() {
        let (mut mesh, phases) = strip();
        let (cd, report) = cut(&mut mesh, &phases, 0.3);
        let leaves: usize = cd.elements().iter().filter(|e| e.is_cut()).map(|e| e.leaves().len()).sum();
        assert_eq!(report.elements_created, leaves);
        assert_eq!(report.elements_destroyed, 0);
        assert!(cd.elements().iter().flat_map(|e| e.leaves()).all(|l| l.entity().is_some()));

        let parents: Vec<EntityKey> = mesh
            .keys(EntityRank::Element)
            .filter(|k| mesh.has_part(*k, phases.parent_part()))
            .collect();
        assert_eq!(parents.len(), 4);
        assert!(parents.iter().all(|k| !mesh.has_part(*k, phases.active_part())));

        let block = mesh.meta().require_part(DEFAULT_BLOCK).unwrap();
        let conformal = phases.conformal_parts(block);
        let (a, b) = (conformal[0], conformal[1]);
        let surface = phases.interface_part(a, b).unwrap();
        let active = phases.active_part();
        assert_relative_eq!(measure_of(&mesh, EntityRank::Element, a, active), 0.15, epsilon = 1e-12);
        assert_relative_eq!(measure_of(&mesh, EntityRank::Element, b, active), 0.35, epsilon = 1e-12);
        assert_relative_eq!(measure_of(&mesh, EntityRank::Edge, surface, active), 0.5, epsilon = 1e-12);

        let crossing = mesh
            .keys(EntityRank::Node)
            .filter(|k| mesh.has_part(*k, phases.child_edge_node_part()))
            .count();
        assert_eq!(crossing, report.nodes_created);
        for k in mesh.keys(EntityRank::Node).filter(|k| mesh.has_part(*k, phases.child_edge_node_part())) {
            assert_relative_eq!(mesh.coordinates(k.id).unwrap().x, 0.3, epsilon = 1e-12);
            assert!(mesh.has_part(k, surface));
        }
    }

    #[test]
    fn unchanged_cut_reuses_every_entity() {
        let (mut mesh, phases) = strip();
        let (_, first) = cut(&mut mesh, &phases, 0.3);
        let (_, second) = cut(&mut mesh, &phases, 0.3);
        assert_eq!(second.nodes_created, 0);
        assert_eq!(second.nodes_reused, first.nodes_created);
        assert_eq!(second.elements_created, 0);
        assert_eq!(second.elements_destroyed, 0);
        assert_eq!(second.sides_declared, 0);
    }

    #[test]
    fn sliding_crossings_keep_their_entities_and_move() {
        let (mut mesh, phases) = strip();
        let (first_cd, first) = cut(&mut mesh, &phases, 0.3);
        let ids: BTreeSet<EntityId> = first_cd.arena().iter().filter_map(|(_, n)| n.entity()).collect();
        let (cd, second) = cut_after(&mut mesh, &phases, 0.35, Some(&first_cd));
        assert_eq!(second.nodes_created, 0);
        assert_eq!(second.nodes_reused, first.nodes_created);
        assert_eq!(second.nodes_moved, first.nodes_created);
        assert_eq!(second.elements_created, 0);
        let now: BTreeSet<EntityId> = cd.arena().iter().filter_map(|(_, n)| n.entity()).collect();
        assert_eq!(now, ids);
        for k in mesh.keys(EntityRank::Node).filter(|k| mesh.has_part(*k, phases.child_edge_node_part())) {
            assert_relative_eq!(mesh.coordinates(k.id).unwrap().x, 0.35, epsilon = 1e-12);
        }
        let (_, third) = cut_after(&mut mesh, &phases, 0.35, Some(&cd));
        assert_eq!(third.nodes_moved, 0);
    }

    #[test]
    fn side_part_check_flags_a_missing_interface_part() {
        let (mut mesh, phases) = strip();
        cut(&mut mesh, &phases, 0.3);
        let surface = *phases.interface_parts().iter().next().unwrap();
        let side = mesh.keys(EntityRank::Edge).find(|k| mesh.has_part(*k, surface)).unwrap();
        mesh.modification_begin().unwrap();
        mesh.change_entity_parts(side, &[], &[surface]).unwrap();
        mesh.modification_end().unwrap();
        assert!(matches!(
            check_element_side_parts(&mesh, &phases, &NoComm),
            Err(MeshError::InvariantViolation(_))
        ));
    }

    #[test]
    fn moved_interface_replaces_children() {
        let (mut mesh, phases) = strip();
        let (_, first) = cut(&mut mesh, &phases, 0.3);
        let (_, second) = cut(&mut mesh, &phases, 0.7);
        assert_eq!(second.elements_destroyed, first.elements_created);
        assert_eq!(second.nodes_destroyed, first.nodes_created);
        for k in mesh.keys(EntityRank::Node).filter(|k| mesh.has_part(*k, phases.child_edge_node_part())) {
            assert_relative_eq!(mesh.coordinates(k.id).unwrap().x, 0.7, epsilon = 1e-12);
        }
        // the column cut before is whole again
        let parents = mesh
            .keys(EntityRank::Element)
            .filter(|k| mesh.has_part(*k, phases.parent_part()))
            .count();
        assert_eq!(parents, 4);
        check_element_side_parts(&mesh, &phases, &NoComm).unwrap();
    }

    #[test]
    fn interval_interface_lives_on_the_crossing_node() {
        let mut mesh = interval_mesh(MetaData::new(1), 4, 0.0, 1.0, Partition::serial(), Default::default())
            .unwrap()
            .mesh;
        let config = PhaseSupportConfig::two_phase(DEFAULT_BLOCK, SurfaceId(0));
        let phases = PhaseSupport::declare(mesh.meta_mut(), &config).unwrap();
        let (_, report) = cut(&mut mesh, &phases, 0.3);
        assert_eq!(report.nodes_created, 1);
        assert_eq!(report.elements_created, 2);
        let surface = *phases.interface_parts().iter().next().unwrap();
        let on_surface: Vec<EntityKey> = mesh.keys(EntityRank::Node).filter(|k| mesh.has_part(*k, surface)).collect();
        assert_eq!(on_surface.len(), 1);
        assert_relative_eq!(mesh.coordinates(on_surface[0].id).unwrap().x, 0.3, epsilon = 1e-12);
    }
}
