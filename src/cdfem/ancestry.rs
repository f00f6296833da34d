//! Rank-independent node identity.
//!
//! A [`NodeAncestry`] names a node by the background mesh nodes it was derived from and
//! the rules applied on the way, never by arena index or entity id. Two ranks holding
//! the same edge therefore name its crossing node identically before either has an
//! entity for it.

use crate::algs::wire::Packable;
use crate::cdfem::node::{NodeArena, NodeIdx, NodeKind, NodeVariant};
use crate::mesh_error::MeshError;
use crate::topology::entity::EntityId;
use crate::topology::periodic::PeriodicNodeMap;
use bytes::{Bytes, BytesMut};
use itertools::Itertools;
use std::collections::BTreeSet;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeAncestry {
    Mesh(EntityId),
    /// Parents are kept sorted.
    Derived { kind: NodeKind, parents: Vec<NodeAncestry> },
}

impl NodeAncestry {
    pub fn derived(kind: NodeKind, mut parents: Vec<NodeAncestry>) -> Self {
        parents.sort();
        NodeAncestry::Derived { kind, parents }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            NodeAncestry::Mesh(_) => NodeKind::Mesh,
            NodeAncestry::Derived { kind, .. } => *kind,
        }
    }

    pub fn parents(&self) -> &[NodeAncestry] {
        match self {
            NodeAncestry::Mesh(_) => &[],
            NodeAncestry::Derived { parents, .. } => parents,
        }
    }

    fn collect_leaves(&self, out: &mut BTreeSet<EntityId>) {
        match self {
            NodeAncestry::Mesh(id) => {
                out.insert(*id);
            }
            NodeAncestry::Derived { parents, .. } => parents.iter().for_each(|p| p.collect_leaves(out)),
        }
    }

    /// Background mesh nodes this node derives from.
    pub fn leaf_mesh_nodes(&self) -> BTreeSet<EntityId> {
        let mut out = BTreeSet::new();
        self.collect_leaves(&mut out);
        out
    }

    fn push_key(&self, out: &mut Vec<u64>) {
        match self {
            NodeAncestry::Mesh(id) => {
                out.push(0);
                out.push(id.get());
            }
            NodeAncestry::Derived { kind, parents } => {
                out.push(1 + u64::from(kind.as_u8()));
                out.push(parents.len() as u64);
                parents.iter().for_each(|p| p.push_key(out));
            }
        }
    }

    /// Prefix-free flattening used as a global identity for new entities.
    pub fn identity_key(&self) -> Vec<u64> {
        let mut out = Vec::new();
        self.push_key(&mut out);
        out
    }

    /// Same derivation with mesh leaves swapped for their periodic partners.
    pub fn constrained_variants(&self, periodic: &PeriodicNodeMap) -> Vec<NodeAncestry> {
        if periodic.is_empty() {
            return Vec::new();
        }
        let mut out: Vec<NodeAncestry> = self
            .substitutions(periodic)
            .into_iter()
            .filter(|a| a != self)
            .collect();
        out.sort();
        out.dedup();
        out
    }

    fn substitutions(&self, periodic: &PeriodicNodeMap) -> Vec<NodeAncestry> {
        match self {
            NodeAncestry::Mesh(id) => std::iter::once(*id)
                .chain(periodic.partners(*id).iter().copied())
                .map(NodeAncestry::Mesh)
                .collect(),
            NodeAncestry::Derived { kind, parents } => parents
                .iter()
                .map(|p| p.substitutions(periodic))
                .multi_cartesian_product()
                .map(|ps| NodeAncestry::derived(*kind, ps))
                .collect(),
        }
    }
}

impl Packable for NodeAncestry {
    fn pack(&self, buf: &mut BytesMut) {
        match self {
            NodeAncestry::Mesh(id) => {
                NodeKind::Mesh.as_u8().pack(buf);
                id.pack(buf);
            }
            NodeAncestry::Derived { kind, parents } => {
                kind.as_u8().pack(buf);
                (parents.len() as u32).pack(buf);
                parents.iter().for_each(|p| p.pack(buf));
            }
        }
    }

    fn unpack(buf: &mut Bytes) -> Result<Self, MeshError> {
        match NodeKind::from_u8(u8::unpack(buf)?)? {
            NodeKind::Mesh => Ok(NodeAncestry::Mesh(EntityId::unpack(buf)?)),
            kind => {
                let n = u32::unpack(buf)? as usize;
                if n > buf.len() {
                    return Err(MeshError::Wire(format!("ancestry claims {n} parents")));
                }
                let parents = (0..n)
                    .map(|_| NodeAncestry::unpack(buf))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(NodeAncestry::derived(kind, parents))
            }
        }
    }
}

impl NodeArena {
    pub fn ancestry(&self, idx: NodeIdx) -> NodeAncestry {
        let node = self.get(idx);
        match node.variant() {
            NodeVariant::Mesh { entity } => NodeAncestry::Mesh(*entity),
            v => NodeAncestry::derived(
                v.kind(),
                v.parents().iter().map(|p| self.ancestry(*p)).collect(),
            ),
        }
    }

    /// Local node named by `ancestry`, if every step of it exists here.
    pub fn find_by_ancestry(&self, ancestry: &NodeAncestry) -> Option<NodeIdx> {
        match ancestry {
            NodeAncestry::Mesh(id) => self.mesh_node(*id),
            NodeAncestry::Derived { kind, parents } => {
                let parents = parents
                    .iter()
                    .map(|p| self.find_by_ancestry(p))
                    .collect::<Option<Vec<_>>>()?;
                self.common_child(&parents, *kind)
            }
        }
    }

    /// Recreate the edge node named by `ancestry` from its local parents.
    ///
    /// `position` is measured from the first parent in ancestry order. Returns
    /// `Ok(None)` when a parent is not known on this rank.
    pub fn build_edge_from_ancestry(
        &mut self,
        ancestry: &NodeAncestry,
        owner: EntityId,
        position: f64,
    ) -> Result<Option<NodeIdx>, MeshError> {
        let [p0, p1] = ancestry.parents() else {
            return Err(MeshError::Ancestry(format!("edge ancestry needs two parents: {ancestry:?}")));
        };
        if ancestry.kind() != NodeKind::Edge {
            return Err(MeshError::Ancestry(format!("not an edge ancestry: {ancestry:?}")));
        }
        match (self.find_by_ancestry(p0), self.find_by_ancestry(p1)) {
            (Some(a), Some(b)) => self.create_edge_node(owner, a, b, position).map(Some),
            _ => Ok(None),
        }
    }

    /// Ancestries of the nodes periodically constrained to `idx` that exist locally.
    pub fn constrained_nodes(&self, idx: NodeIdx, periodic: &PeriodicNodeMap) -> Vec<NodeIdx> {
        self.ancestry(idx)
            .constrained_variants(periodic)
            .iter()
            .filter_map(|a| self.find_by_ancestry(a))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn id(n: u64) -> EntityId {
        EntityId::new(n).unwrap()
    }

    #[test]
    fn ancestry_survives_the_wire_and_finds_the_node() {
        let mut arena = NodeArena::new();
        let a = arena.create_mesh_node(id(5), id(1), Vector3::zeros());
        let b = arena.create_mesh_node(id(2), id(1), Vector3::x());
        let c = arena.create_mesh_node(id(9), id(1), Vector3::y());
        let e = arena.create_edge_node(id(1), a, b, 0.3).unwrap();
        let m = arena.create_midside_node(id(1), c, e);

        let anc = arena.ancestry(m);
        assert_eq!(anc.leaf_mesh_nodes(), BTreeSet::from([id(2), id(5), id(9)]));
        let mut buf = BytesMut::new();
        anc.pack(&mut buf);
        let back = NodeAncestry::unpack(&mut buf.freeze()).unwrap();
        assert_eq!(back, anc);
        assert_eq!(arena.find_by_ancestry(&back), Some(m));
    }

    #[test]
    fn identity_keys_distinguish_rules() {
        let edge = NodeAncestry::derived(
            NodeKind::Edge,
            vec![NodeAncestry::Mesh(id(2)), NodeAncestry::Mesh(id(1))],
        );
        let mid = NodeAncestry::derived(
            NodeKind::MidSide,
            vec![NodeAncestry::Mesh(id(1)), NodeAncestry::Mesh(id(2))],
        );
        assert_eq!(edge.identity_key(), vec![2, 2, 0, 1, 0, 2]);
        assert_ne!(edge.identity_key(), mid.identity_key());
    }

    #[test]
    fn periodic_variants_swap_leaves() {
        let periodic = PeriodicNodeMap::from_pairs([(id(1), id(11))]);
        let edge = NodeAncestry::derived(
            NodeKind::Edge,
            vec![NodeAncestry::Mesh(id(1)), NodeAncestry::Mesh(id(2))],
        );
        let variants = edge.constrained_variants(&periodic);
        assert_eq!(
            variants,
            vec![NodeAncestry::derived(
                NodeKind::Edge,
                vec![NodeAncestry::Mesh(id(2)), NodeAncestry::Mesh(id(11))],
            )]
        );
        assert!(edge.constrained_variants(&PeriodicNodeMap::new()).is_empty());
    }

    #[test]
    fn hanging_edge_rebuilds_from_local_parents() {
        let mut arena = NodeArena::new();
        arena.create_mesh_node(id(1), id(1), Vector3::zeros());
        arena.create_mesh_node(id(2), id(1), Vector3::x());
        let anc = NodeAncestry::derived(
            NodeKind::Edge,
            vec![NodeAncestry::Mesh(id(1)), NodeAncestry::Mesh(id(2))],
        );
        let e = arena.build_edge_from_ancestry(&anc, id(1), 0.4).unwrap().unwrap();
        assert_eq!(arena.ancestry(e), anc);
        let missing = NodeAncestry::derived(
            NodeKind::Edge,
            vec![NodeAncestry::Mesh(id(1)), NodeAncestry::Mesh(id(3))],
        );
        assert!(arena.build_edge_from_ancestry(&missing, id(1), 0.4).unwrap().is_none());
    }
}
