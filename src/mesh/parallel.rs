//! Collective creation of entities that several ranks may need at once.
//!
//! A rank that wants a new entity identified by a global key (a canonical node
//! ancestry, or the sorted nodes of a side) posts the key to every rank that could
//! also want it. The lowest requesting rank owns the entity, draws its id and sends
//! the id to the other requesters, which then record it as shared.

use crate::algs::communicator::{Communicator, tags};
use crate::algs::sparse_exchange::{all_reduce_max_u64, exchange};
use crate::mesh::bulk::BulkData;
use crate::mesh::meta::PartId;
use crate::mesh_error::MeshError;
use crate::topology::entity::{EntityId, EntityKey, EntityRank};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Draw `count` ids of `rank` that no rank has used. Collective.
pub fn generate_new_ids<C: Communicator>(
    mesh: &BulkData,
    comm: &C,
    rank: EntityRank,
    count: usize,
) -> Result<Vec<EntityId>, MeshError> {
    let base = all_reduce_max_u64(comm, tags::ID_POOL, mesh.max_local_id(rank))?;
    let (me, size) = (comm.rank() as u64, comm.size() as u64);
    (0..count as u64)
        .map(|k| EntityId::new(base + 1 + me + k * size))
        .collect()
}

/// A locally wanted entity, keyed by a rank-independent identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewEntityRequest {
    pub identity: Vec<u64>,
    /// Other ranks that may request the same identity.
    pub candidates: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedEntity {
    pub id: EntityId,
    pub owner: usize,
    /// Other ranks holding the entity, ascending.
    pub sharing: Vec<usize>,
}

/// Agree on ids, owners and sharing for `requests` (identities must be distinct). Collective.
pub fn resolve_new_entities<C: Communicator>(
    mesh: &BulkData,
    comm: &C,
    rank: EntityRank,
    requests: &[NewEntityRequest],
) -> Result<Vec<ResolvedEntity>, MeshError> {
    let me = comm.rank();
    let mut outgoing: BTreeMap<usize, Vec<Vec<u64>>> = BTreeMap::new();
    for r in requests {
        for &p in r.candidates.iter().filter(|&&p| p != me) {
            outgoing.entry(p).or_default().push(r.identity.clone());
        }
    }
    let mut remote: HashMap<Vec<u64>, Vec<usize>> = HashMap::new();
    for (p, identities) in exchange(comm, tags::NEW_ENTITY_REQUESTS, &outgoing)? {
        for identity in identities {
            remote.entry(identity).or_default().push(p);
        }
    }

    let requesters: Vec<Vec<usize>> = requests
        .iter()
        .map(|r| {
            let mut procs: Vec<usize> = remote
                .get(&r.identity)
                .map(|v| v.iter().copied().filter(|p| r.candidates.contains(p)).collect())
                .unwrap_or_default();
            procs.push(me);
            procs.sort_unstable();
            procs.dedup();
            procs
        })
        .collect();

    let n_owned = requesters.iter().filter(|p| p[0] == me).count();
    let mut fresh = generate_new_ids(mesh, comm, rank, n_owned)?.into_iter();
    let mut ids: Vec<Option<EntityId>> = vec![None; requests.len()];
    let mut replies: BTreeMap<usize, Vec<(Vec<u64>, EntityId)>> = BTreeMap::new();
    for ((r, procs), slot) in requests.iter().zip(&requesters).zip(ids.iter_mut()) {
        if procs[0] != me {
            continue;
        }
        *slot = fresh.next();
        if let Some(id) = *slot {
            for &p in &procs[1..] {
                replies.entry(p).or_default().push((r.identity.clone(), id));
            }
        }
    }
    let mut assigned: HashMap<Vec<u64>, EntityId> = exchange(comm, tags::NEW_ENTITY_IDS, &replies)?
        .into_values()
        .flatten()
        .collect();

    requests
        .iter()
        .zip(requesters)
        .zip(ids)
        .map(|((r, procs), id)| {
            let id = match id {
                Some(id) => id,
                None => assigned.remove(&r.identity).ok_or_else(|| {
                    MeshError::comm(procs[0], format!("no id received for identity {:?}", r.identity))
                })?,
            };
            Ok(ResolvedEntity {
                id,
                owner: procs[0],
                sharing: procs.into_iter().filter(|&p| p != me).collect(),
            })
        })
        .collect()
}

/// Record owner and sharing of a freshly declared entity.
pub fn apply_resolution(
    mesh: &mut BulkData,
    key: EntityKey,
    resolved: &ResolvedEntity,
) -> Result<(), MeshError> {
    mesh.set_owner(key, resolved.owner)?;
    for &p in &resolved.sharing {
        mesh.add_sharing(key, p)?;
    }
    Ok(())
}

/// Ask for side `ordinal` of `element` to exist and belong to `parts`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SideRequest {
    pub element: EntityId,
    pub ordinal: usize,
    pub parts: Vec<PartId>,
}

struct SideGroup {
    nodes: Vec<EntityId>,
    parts: BTreeSet<PartId>,
    existing: Option<EntityId>,
}

fn group_side_requests(
    mesh: &BulkData,
    requests: &[SideRequest],
) -> Result<BTreeMap<Vec<EntityId>, SideGroup>, MeshError> {
    let mut groups: BTreeMap<Vec<EntityId>, SideGroup> = BTreeMap::new();
    for req in requests {
        let key = EntityKey::element(req.element);
        let topo = mesh
            .topology(key)
            .ok_or(MeshError::MissingEntity(key))?;
        if req.ordinal >= topo.num_sides() {
            return Err(MeshError::InvalidConnectivity {
                key,
                reason: format!("side ordinal {} out of range", req.ordinal),
            });
        }
        let elem_nodes = mesh.nodes_of(key);
        let nodes: Vec<EntityId> = topo
            .side_nodes(req.ordinal)
            .iter()
            .map(|&i| elem_nodes[i])
            .collect();
        let mut sorted = nodes.clone();
        sorted.sort_unstable();
        let group = groups.entry(sorted).or_insert_with(|| SideGroup {
            existing: mesh.find_side(&nodes),
            nodes,
            parts: BTreeSet::new(),
        });
        group.parts.extend(req.parts.iter().copied());
    }
    Ok(groups)
}

/// Create (or reuse) the requested sides, put them on their parts and connect them to
/// every local element using them. Must run inside a modification cycle. Collective.
///
/// Returns the number of sides declared on this rank.
pub fn batch_create_sides<C: Communicator>(
    mesh: &mut BulkData,
    comm: &C,
    requests: &[SideRequest],
) -> Result<usize, MeshError> {
    let side_rank = EntityRank::side_rank(mesh.spatial_dim())
        .ok_or(MeshError::ModificationState("1D meshes carry no sides"))?;
    // a local failure still takes part in the id exchange
    let (groups, local_err) = match group_side_requests(mesh, requests) {
        Ok(g) => (g, None),
        Err(e) => (BTreeMap::new(), Some(e)),
    };

    let new_keys: Vec<&Vec<EntityId>> = groups
        .iter()
        .filter(|(_, g)| g.existing.is_none())
        .map(|(k, _)| k)
        .collect();
    let new_requests: Vec<NewEntityRequest> = new_keys
        .iter()
        .map(|sorted| NewEntityRequest {
            identity: sorted.iter().map(|n| n.get()).collect(),
            candidates: mesh.shared_procs_intersection(sorted),
        })
        .collect();
    let resolved = resolve_new_entities(mesh, comm, side_rank, &new_requests)?;
    if let Some(e) = local_err {
        return Err(e);
    }

    let mut declared = 0;
    let mut ids: BTreeMap<&Vec<EntityId>, EntityId> = BTreeMap::new();
    for (sorted, res) in new_keys.iter().zip(&resolved) {
        let group = &groups[*sorted];
        let first = EntityKey::element(mesh.node_elements(group.nodes[0]).first().copied().ok_or(
            MeshError::InvalidConnectivity {
                key: EntityKey::node(group.nodes[0]),
                reason: "side node has no element".into(),
            },
        )?);
        let topo = mesh
            .topology(first)
            .and_then(|t| t.side_topology())
            .ok_or(MeshError::ModificationState("element topology has no side topology"))?;
        let key = mesh.declare_side(res.id, topo, &group.nodes, &[])?;
        apply_resolution(mesh, key, res)?;
        ids.insert(*sorted, res.id);
        declared += 1;
    }

    for (sorted, group) in &groups {
        let Some(side) = group.existing.or_else(|| ids.get(sorted).copied()) else {
            continue;
        };
        let parts: Vec<PartId> = group.parts.iter().copied().collect();
        mesh.change_entity_parts(EntityKey::new(side_rank, side), &parts, &[])?;
        connect_side_to_elements(mesh, side, sorted)?;
    }
    Ok(declared)
}

/// Connect `side` (with sorted nodes `sorted`) to every local element having it.
pub fn connect_side_to_elements(
    mesh: &mut BulkData,
    side: EntityId,
    sorted: &[EntityId],
) -> Result<(), MeshError> {
    let Some(&first) = sorted.first() else {
        return Ok(());
    };
    let mut links = Vec::new();
    for elem in mesh.node_elements(first) {
        let key = EntityKey::element(elem);
        let Some(topo) = mesh.topology(key) else {
            continue;
        };
        let elem_nodes = mesh.nodes_of(key);
        for ordinal in 0..topo.num_sides() {
            let mut nodes: Vec<EntityId> = topo
                .side_nodes(ordinal)
                .iter()
                .map(|&i| elem_nodes[i])
                .collect();
            nodes.sort_unstable();
            if nodes == sorted {
                links.push((elem, ordinal));
            }
        }
    }
    for (elem, ordinal) in links {
        mesh.connect_side(elem, ordinal, side)?;
    }
    Ok(())
}

/// Union of the explicit and induced parts each shared node has on any rank. Collective.
pub fn exchange_shared_node_parts<C: Communicator>(
    mesh: &BulkData,
    comm: &C,
) -> Result<BTreeMap<EntityId, BTreeSet<PartId>>, MeshError> {
    let mut outgoing: BTreeMap<usize, Vec<(EntityId, Vec<u32>)>> = BTreeMap::new();
    let mut merged: BTreeMap<EntityId, BTreeSet<PartId>> = BTreeMap::new();
    for key in mesh.comm_list() {
        if key.rank != EntityRank::Node || !mesh.is_shared(key) {
            continue;
        }
        let parts = mesh.parts_of(key);
        let raw: Vec<u32> = parts.iter().map(|p| p.0).collect();
        for p in mesh.sharing_procs(key) {
            outgoing.entry(p).or_default().push((key.id, raw.clone()));
        }
        merged.insert(key.id, parts);
    }
    for (_, items) in exchange(comm, tags::NODE_PARTS, &outgoing)? {
        for (node, parts) in items {
            if let Some(set) = merged.get_mut(&node) {
                set.extend(parts.into_iter().map(PartId));
            }
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};
    use crate::mesh::meta::MetaData;
    use crate::topology::cell_topology::CellTopology;
    use nalgebra::Vector3;

    fn id(n: u64) -> EntityId {
        EntityId::new(n).unwrap()
    }

    #[test]
    fn ids_interleave_above_global_max() {
        let world = RayonComm::world(2);
        let got: Vec<Vec<u64>> = std::thread::scope(|s| {
            let handles: Vec<_> = world
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let mut mesh = BulkData::new(MetaData::new(1), comm.rank(), 2);
                        mesh.modification_begin().unwrap();
                        let top = if comm.rank() == 0 { 4 } else { 7 };
                        mesh.declare_node(id(top), Vector3::zeros(), &[]).unwrap();
                        mesh.modification_end().unwrap();
                        generate_new_ids(&mesh, comm, EntityRank::Node, 2)
                            .unwrap()
                            .into_iter()
                            .map(EntityId::get)
                            .collect()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(got, vec![vec![8, 10], vec![9, 11]]);
    }

    #[test]
    fn shared_request_gets_one_id_owned_by_lowest_rank() {
        let world = RayonComm::world(2);
        let got: Vec<Vec<ResolvedEntity>> = std::thread::scope(|s| {
            let handles: Vec<_> = world
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let me = comm.rank();
                        let mesh = BulkData::new(MetaData::new(2), me, 2);
                        let mut requests = vec![NewEntityRequest {
                            identity: vec![1, 2],
                            candidates: vec![1 - me],
                        }];
                        if me == 1 {
                            requests.push(NewEntityRequest {
                                identity: vec![5, 6],
                                candidates: vec![0],
                            });
                        }
                        resolve_new_entities(&mesh, comm, EntityRank::Node, &requests).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(got[0][0].id, got[1][0].id);
        assert_eq!(got[0][0].owner, 0);
        assert_eq!(got[1][0].sharing, vec![0]);
        // requested only by rank 1: owned there, not shared
        assert_eq!(got[1][1].owner, 1);
        assert!(got[1][1].sharing.is_empty());
        assert_ne!(got[1][1].id, got[1][0].id);
    }

    #[test]
    fn interior_side_is_created_once_and_connected_twice() {
        let mut meta = MetaData::new(2);
        let surf = meta.declare_part("surface_1", Some(EntityRank::Edge));
        let mut mesh = BulkData::new(meta, 0, 1);
        mesh.modification_begin().unwrap();
        for (i, (x, y)) in [(0., 0.), (1., 0.), (1., 1.), (0., 1.)].iter().enumerate() {
            mesh.declare_node(id(i as u64 + 1), Vector3::new(*x, *y, 0.0), &[])
                .unwrap();
        }
        mesh.declare_element(id(1), CellTopology::Triangle3, &[id(1), id(2), id(3)], &[])
            .unwrap();
        mesh.declare_element(id(2), CellTopology::Triangle3, &[id(1), id(3), id(4)], &[])
            .unwrap();
        let requests = [
            SideRequest { element: id(1), ordinal: 2, parts: vec![surf] },
            SideRequest { element: id(2), ordinal: 0, parts: vec![surf] },
        ];
        assert_eq!(batch_create_sides(&mut mesh, &NoComm, &requests).unwrap(), 1);
        mesh.modification_end().unwrap();

        let side = mesh.find_side(&[id(1), id(3)]).unwrap();
        assert_eq!(mesh.side_elements(side), vec![id(1), id(2)]);
        assert!(mesh.has_part(EntityKey::node(id(3)), surf));
        assert!(!mesh.has_part(EntityKey::node(id(2)), surf));
    }
}
