//! Agreement on per-node state across ranks and periodic partners.
//!
//! Nodes are addressed on the wire by [`NodeAncestry`], never by arena index. A node is
//! sent to every rank that shares all of its background mesh nodes, which is exactly
//! the set of ranks that can hold the same derived node.

use crate::algs::communicator::{CommTag, Communicator, tags};
use crate::algs::sparse_exchange::exchange;
use crate::algs::wire::Packable;
use crate::cdfem::ancestry::NodeAncestry;
use crate::cdfem::node::{NodeArena, NodeIdx, NodeVariant};
use crate::mesh::bulk::BulkData;
use crate::mesh_error::MeshError;
use crate::topology::entity::EntityId;
use crate::topology::periodic::PeriodicNodeMap;
use std::collections::{BTreeMap, BTreeSet};

/// Rounds of merging; two let a value cross one periodic and one rank boundary.
const SYNC_ROUNDS: usize = 2;

/// Ranks besides this one that may hold a node derived from `ancestry`.
pub fn sharing_procs_of(mesh: &BulkData, ancestry: &NodeAncestry) -> Vec<usize> {
    let leaves: Vec<EntityId> = ancestry.leaf_mesh_nodes().into_iter().collect();
    mesh.shared_procs_intersection(&leaves)
}

/// Send each `(ancestry, destinations, value)` to its destinations; returns what arrived
/// here, ordered by source rank.
pub fn scatter_by_ancestry<C, T>(
    comm: &C,
    tag: CommTag,
    items: Vec<(NodeAncestry, Vec<usize>, T)>,
) -> Result<Vec<(NodeAncestry, T)>, MeshError>
where
    C: Communicator,
    T: Packable + Clone,
{
    let me = comm.rank();
    let mut outgoing: BTreeMap<usize, Vec<(NodeAncestry, T)>> = BTreeMap::new();
    for (ancestry, procs, value) in items {
        for p in procs.into_iter().filter(|&p| p != me) {
            outgoing.entry(p).or_default().push((ancestry.clone(), value.clone()));
        }
    }
    Ok(exchange(comm, tag, &outgoing)?.into_values().flatten().collect())
}

/// Outgoing copies of `value` for node `idx`: its own ancestry plus every periodic
/// variant, each to the ranks that can hold it.
fn addressed<T: Clone>(
    arena: &NodeArena,
    mesh: &BulkData,
    periodic: &PeriodicNodeMap,
    idx: NodeIdx,
    value: T,
    out: &mut Vec<(NodeAncestry, Vec<usize>, T)>,
) {
    let ancestry = arena.ancestry(idx);
    for variant in ancestry.constrained_variants(periodic) {
        let procs = sharing_procs_of(mesh, &variant);
        if !procs.is_empty() {
            out.push((variant, procs, value.clone()));
        }
    }
    let procs = sharing_procs_of(mesh, &ancestry);
    if !procs.is_empty() {
        out.push((ancestry, procs, value));
    }
}

/// Merge node signs so every copy of a node, here or elsewhere, agrees.
pub fn sync_signs<C: Communicator>(
    arena: &mut NodeArena,
    mesh: &BulkData,
    comm: &C,
    periodic: &PeriodicNodeMap,
) -> Result<(), MeshError> {
    for _ in 0..SYNC_ROUNDS {
        let signed: Vec<NodeIdx> = arena
            .iter()
            .filter(|(_, n)| n.sign_is_set())
            .map(|(i, _)| i)
            .collect();
        if !periodic.is_empty() {
            for &idx in &signed {
                for partner in arena.constrained_nodes(idx, periodic) {
                    if arena.get(partner).sign_is_set() {
                        let s = arena.sign(partner)?;
                        arena.merge_sign(idx, s);
                    }
                }
            }
        }
        let mut items = Vec::new();
        for &idx in &signed {
            addressed(arena, mesh, periodic, idx, arena.sign(idx)?, &mut items);
        }
        for (ancestry, sign) in scatter_by_ancestry(comm, tags::SIGN_SYNC, items)? {
            if let Some(idx) = arena.find_by_ancestry(&ancestry) {
                arena.merge_sign(idx, sign);
            }
        }
    }
    Ok(())
}

/// Merge crossing scores; the smallest score seen anywhere wins.
pub fn sync_scores<C: Communicator>(
    arena: &mut NodeArena,
    mesh: &BulkData,
    comm: &C,
    periodic: &PeriodicNodeMap,
) -> Result<(), MeshError> {
    for _ in 0..SYNC_ROUNDS {
        let scored: Vec<NodeIdx> = arena
            .iter()
            .filter(|(_, n)| n.score_is_set())
            .map(|(i, _)| i)
            .collect();
        if !periodic.is_empty() {
            for &idx in &scored {
                for partner in arena.constrained_nodes(idx, periodic) {
                    if arena.get(partner).score_is_set() {
                        let s = arena.score(partner)?;
                        arena.merge_score(idx, s);
                    }
                }
            }
        }
        let mut items = Vec::new();
        for &idx in &scored {
            addressed(arena, mesh, periodic, idx, arena.score(idx)?, &mut items);
        }
        for (ancestry, score) in scatter_by_ancestry(comm, tags::SCORE_SYNC, items)? {
            if let Some(idx) = arena.find_by_ancestry(&ancestry) {
                arena.merge_score(idx, score);
            }
        }
    }
    Ok(())
}

/// Element present on this rank that uses every node of `nodes`.
fn common_element(mesh: &BulkData, nodes: &BTreeSet<EntityId>) -> Option<EntityId> {
    let mut iter = nodes.iter();
    let mut candidates: BTreeSet<EntityId> = mesh.node_elements(*iter.next()?).into_iter().collect();
    for n in iter {
        let here: BTreeSet<EntityId> = mesh.node_elements(*n).into_iter().collect();
        candidates.retain(|e| here.contains(e));
    }
    candidates.into_iter().next()
}

/// Announce freshly created crossing nodes to the ranks sharing their parents and
/// build the ones this rank is missing. Returns the nodes built here.
pub fn build_parallel_hanging_edge_nodes<C: Communicator>(
    arena: &mut NodeArena,
    mesh: &BulkData,
    comm: &C,
    created: &[NodeIdx],
) -> Result<Vec<NodeIdx>, MeshError> {
    let mut items = Vec::new();
    for &idx in created {
        let NodeVariant::Edge { position, .. } = *arena.get(idx).variant() else {
            continue;
        };
        let ancestry = arena.ancestry(idx);
        let procs = sharing_procs_of(mesh, &ancestry);
        if !procs.is_empty() {
            items.push((ancestry, procs, (position, arena.score(idx)?)));
        }
    }
    let mut built = Vec::new();
    for (ancestry, (position, score)) in scatter_by_ancestry(comm, tags::HANGING_NODES, items)? {
        if let Some(idx) = arena.find_by_ancestry(&ancestry) {
            arena.merge_score(idx, score);
            continue;
        }
        let Some(owner) = common_element(mesh, &ancestry.leaf_mesh_nodes()) else {
            continue;
        };
        if let Some(idx) = arena.build_edge_from_ancestry(&ancestry, owner, position)? {
            arena.set_sign(idx, 0)?;
            arena.merge_score(idx, score);
            built.push(idx);
        }
    }
    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};
    use crate::cdfem::node::NodeKind;
    use crate::mesh::meta::MetaData;
    use crate::topology::cell_topology::CellTopology;
    use crate::topology::entity::EntityKey;
    use nalgebra::Vector3;

    fn id(n: u64) -> EntityId {
        EntityId::new(n).unwrap()
    }

    /// Segment 1-2 on both ranks of a two-rank world, nodes shared.
    fn shared_segment(rank: usize) -> (BulkData, NodeArena) {
        let mut mesh = BulkData::new(MetaData::new(1), rank, 2);
        mesh.modification_begin().unwrap();
        mesh.declare_node(id(1), Vector3::zeros(), &[]).unwrap();
        mesh.declare_node(id(2), Vector3::x(), &[]).unwrap();
        mesh.declare_element(id(1 + rank as u64), CellTopology::Line2, &[id(1), id(2)], &[])
            .unwrap();
        mesh.modification_end().unwrap();
        for n in [1, 2] {
            mesh.add_sharing(EntityKey::node(id(n)), 1 - rank).unwrap();
        }
        let mut arena = NodeArena::new();
        arena.create_mesh_node(id(1), id(1), Vector3::zeros());
        arena.create_mesh_node(id(2), id(1), Vector3::x());
        (mesh, arena)
    }

    #[test]
    fn disagreeing_shared_signs_become_zero() {
        let world = RayonComm::world(2);
        let signs: Vec<(i8, i8)> = std::thread::scope(|s| {
            let handles: Vec<_> = world
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let (mesh, mut arena) = shared_segment(comm.rank());
                        let (a, b) = (NodeIdx(0), NodeIdx(1));
                        arena.set_sign(a, if comm.rank() == 0 { 1 } else { -1 }).unwrap();
                        arena.set_sign(b, 1).unwrap();
                        sync_signs(&mut arena, &mesh, comm, &PeriodicNodeMap::new()).unwrap();
                        (arena.sign(a).unwrap(), arena.sign(b).unwrap())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(signs, vec![(0, 1), (0, 1)]);
    }

    #[test]
    fn hanging_crossing_is_rebuilt_with_minimum_score() {
        let world = RayonComm::world(2);
        let got: Vec<(f64, f64)> = std::thread::scope(|s| {
            let handles: Vec<_> = world
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let (mesh, mut arena) = shared_segment(comm.rank());
                        let mut created = Vec::new();
                        if comm.rank() == 0 {
                            let e = arena.create_edge_node(id(1), NodeIdx(0), NodeIdx(1), 0.25).unwrap();
                            arena.set_sign(e, 0).unwrap();
                            arena.set_score(e, 0.25).unwrap();
                            created.push(e);
                        }
                        build_parallel_hanging_edge_nodes(&mut arena, &mesh, comm, &created).unwrap();
                        let e = arena.common_child(&[NodeIdx(0), NodeIdx(1)], NodeKind::Edge).unwrap();
                        (arena.coordinates(e).x, arena.score(e).unwrap())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(got, vec![(0.25, 0.25), (0.25, 0.25)]);
    }

    #[test]
    fn periodic_partners_merge_locally() {
        let mut mesh = BulkData::new(MetaData::new(1), 0, 1);
        mesh.modification_begin().unwrap();
        mesh.declare_node(id(1), Vector3::zeros(), &[]).unwrap();
        mesh.declare_node(id(11), Vector3::x(), &[]).unwrap();
        mesh.modification_end().unwrap();
        let periodic = PeriodicNodeMap::from_pairs([(id(1), id(11))]);
        let mut arena = NodeArena::new();
        let a = arena.create_mesh_node(id(1), id(1), Vector3::zeros());
        let b = arena.create_mesh_node(id(11), id(1), Vector3::x());
        arena.set_sign(a, -1).unwrap();
        arena.set_sign(b, 1).unwrap();
        sync_signs(&mut arena, &mesh, &NoComm, &periodic).unwrap();
        assert_eq!(arena.sign(a).unwrap(), 0);
        assert_eq!(arena.sign(b).unwrap(), 0);
    }
}
