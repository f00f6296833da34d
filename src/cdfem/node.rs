//! Subelement node arena.
//!
//! Every node of one decomposition snapshot lives in a [`NodeArena`] and is addressed
//! by [`NodeIdx`]. Derived nodes refer to their parents by index, so parents always
//! precede their children and the arena is a DAG in topological order. A derived node
//! is unique per (sorted parents, [`NodeKind`]): asking for the same child twice
//! returns the first one.

use crate::debug_invariants::DebugInvariants;
use crate::geometry::interface::InterfaceId;
use crate::mesh_error::MeshError;
use crate::topology::entity::EntityId;
use nalgebra::Vector3;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdx(pub u32);

impl NodeIdx {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Creation rule of a node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKind {
    /// A vertex (or midside node) of the background mesh.
    Mesh,
    /// Crossing of an interface with the segment between two parents.
    Edge,
    /// Midpoint of a subelement edge of a quadratic element.
    MidSide,
    /// Interior node of a subelement template.
    Steiner,
    /// Generic weighted combination of parents.
    Child,
}

impl NodeKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Result<Self, MeshError> {
        Ok(match raw {
            0 => NodeKind::Mesh,
            1 => NodeKind::Edge,
            2 => NodeKind::MidSide,
            3 => NodeKind::Steiner,
            4 => NodeKind::Child,
            _ => return Err(MeshError::Wire(format!("invalid node kind {raw}"))),
        })
    }
}

pub type ParentList = SmallVec<[NodeIdx; 4]>;
pub type WeightList = SmallVec<[f64; 4]>;

#[derive(Clone, Debug, PartialEq)]
pub enum NodeVariant {
    Mesh { entity: EntityId },
    /// `position` is measured from `parents[0]` towards `parents[1]`.
    Edge { parents: [NodeIdx; 2], position: f64 },
    MidSide { parents: [NodeIdx; 2] },
    Steiner { parents: ParentList, weights: WeightList },
    Child { parents: ParentList, weights: WeightList },
}

impl NodeVariant {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeVariant::Mesh { .. } => NodeKind::Mesh,
            NodeVariant::Edge { .. } => NodeKind::Edge,
            NodeVariant::MidSide { .. } => NodeKind::MidSide,
            NodeVariant::Steiner { .. } => NodeKind::Steiner,
            NodeVariant::Child { .. } => NodeKind::Child,
        }
    }

    pub fn parents(&self) -> &[NodeIdx] {
        match self {
            NodeVariant::Mesh { .. } => &[],
            NodeVariant::Edge { parents, .. } | NodeVariant::MidSide { parents } => parents,
            NodeVariant::Steiner { parents, .. } | NodeVariant::Child { parents, .. } => parents,
        }
    }

    /// Interpolation weights aligned with [`parents`](Self::parents).
    pub fn weights(&self) -> WeightList {
        match self {
            NodeVariant::Mesh { .. } => WeightList::new(),
            NodeVariant::Edge { position, .. } => smallvec::smallvec![1.0 - position, *position],
            NodeVariant::MidSide { .. } => smallvec::smallvec![0.5, 0.5],
            NodeVariant::Steiner { weights, .. } | NodeVariant::Child { weights, .. } => weights.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SubElementNode {
    variant: NodeVariant,
    owner: EntityId,
    coordinates: Vector3<f64>,
    entity: Option<EntityId>,
    sign: Option<i8>,
    score: Option<f64>,
    captured: SmallVec<[InterfaceId; 2]>,
    prolonged: bool,
}

impl SubElementNode {
    pub fn variant(&self) -> &NodeVariant {
        &self.variant
    }
    pub fn kind(&self) -> NodeKind {
        self.variant.kind()
    }
    pub fn parents(&self) -> &[NodeIdx] {
        self.variant.parents()
    }
    /// Element that first created the node.
    pub fn owner(&self) -> EntityId {
        self.owner
    }
    pub fn coordinates(&self) -> &Vector3<f64> {
        &self.coordinates
    }
    /// Mesh entity, once one has been assigned.
    pub fn entity(&self) -> Option<EntityId> {
        self.entity
    }
    pub fn is_prolonged(&self) -> bool {
        self.prolonged
    }
    pub fn sign_is_set(&self) -> bool {
        self.sign.is_some()
    }
    pub fn score_is_set(&self) -> bool {
        self.score.is_some()
    }
    /// Interfaces that pass through this node, in processing order.
    pub fn captured_interfaces(&self) -> &[InterfaceId] {
        &self.captured
    }
}

/// Combine two signs seen for one node: agreement stays, disagreement means "on the interface".
pub fn merge_signs(a: i8, b: i8) -> i8 {
    if a == b { a } else { 0 }
}

#[derive(Clone, Debug, Default)]
pub struct NodeArena {
    nodes: Vec<SubElementNode>,
    mesh_nodes: HashMap<EntityId, NodeIdx>,
    children: HashMap<(ParentList, NodeKind), NodeIdx>,
}

fn child_key(parents: &[NodeIdx], kind: NodeKind) -> (ParentList, NodeKind) {
    let mut sorted: ParentList = parents.iter().copied().collect();
    sorted.sort_unstable();
    (sorted, kind)
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.mesh_nodes.clear();
        self.children.clear();
    }

    pub fn get(&self, idx: NodeIdx) -> &SubElementNode {
        &self.nodes[idx.index()]
    }

    pub fn indices(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        (0..self.nodes.len() as u32).map(NodeIdx)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeIdx, &SubElementNode)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeIdx(i as u32), n))
    }

    pub fn kind(&self, idx: NodeIdx) -> NodeKind {
        self.get(idx).kind()
    }

    pub fn coordinates(&self, idx: NodeIdx) -> &Vector3<f64> {
        &self.get(idx).coordinates
    }

    pub fn mesh_node(&self, entity: EntityId) -> Option<NodeIdx> {
        self.mesh_nodes.get(&entity).copied()
    }

    /// Existing child of `parents` created by rule `kind`.
    pub fn common_child(&self, parents: &[NodeIdx], kind: NodeKind) -> Option<NodeIdx> {
        self.children.get(&child_key(parents, kind)).copied()
    }

    fn push(&mut self, variant: NodeVariant, owner: EntityId, coordinates: Vector3<f64>) -> NodeIdx {
        let idx = NodeIdx(self.nodes.len() as u32);
        let entity = match &variant {
            NodeVariant::Mesh { entity } => Some(*entity),
            _ => None,
        };
        self.nodes.push(SubElementNode {
            variant,
            owner,
            coordinates,
            entity,
            sign: None,
            score: None,
            captured: SmallVec::new(),
            prolonged: false,
        });
        idx
    }

    /// Node for background mesh node `entity` (created on first request).
    pub fn create_mesh_node(&mut self, entity: EntityId, owner: EntityId, coordinates: Vector3<f64>) -> NodeIdx {
        if let Some(idx) = self.mesh_node(entity) {
            return idx;
        }
        let idx = self.push(NodeVariant::Mesh { entity }, owner, coordinates);
        self.mesh_nodes.insert(entity, idx);
        idx
    }

    /// Crossing node between `a` and `b` at `position` (measured from `a`), strictly
    /// inside the segment.
    ///
    /// Parents are stored in ancestry order so every rank derives the same node from
    /// the same inputs; `position` is flipped to match.
    pub fn create_edge_node(
        &mut self,
        owner: EntityId,
        a: NodeIdx,
        b: NodeIdx,
        position: f64,
    ) -> Result<NodeIdx, MeshError> {
        // an end position would duplicate a parent and leave zero-measure leaves
        if a == b || !(position > 0.0 && position < 1.0) {
            return Err(MeshError::InvalidGeometry(format!(
                "edge node needs distinct parents and a position in (0,1), got {position}"
            )));
        }
        if let Some(idx) = self.common_child(&[a, b], NodeKind::Edge) {
            return Ok(idx);
        }
        let (a, b, position) = if self.ancestry(b) < self.ancestry(a) {
            (b, a, 1.0 - position)
        } else {
            (a, b, position)
        };
        let x = self.coordinates(a) * (1.0 - position) + self.coordinates(b) * position;
        let idx = self.push(NodeVariant::Edge { parents: [a, b], position }, owner, x);
        self.children.insert(child_key(&[a, b], NodeKind::Edge), idx);
        Ok(idx)
    }

    /// Midpoint node of the subelement edge `(a, b)`.
    pub fn create_midside_node(&mut self, owner: EntityId, a: NodeIdx, b: NodeIdx) -> NodeIdx {
        if let Some(idx) = self.common_child(&[a, b], NodeKind::MidSide) {
            return idx;
        }
        let (a, b) = if self.ancestry(b) < self.ancestry(a) { (b, a) } else { (a, b) };
        let x = (self.coordinates(a) + self.coordinates(b)) * 0.5;
        let idx = self.push(NodeVariant::MidSide { parents: [a, b] }, owner, x);
        self.children.insert(child_key(&[a, b], NodeKind::MidSide), idx);
        idx
    }

    pub fn create_steiner_node(
        &mut self,
        owner: EntityId,
        parents: &[NodeIdx],
        weights: &[f64],
    ) -> Result<NodeIdx, MeshError> {
        self.create_weighted(NodeKind::Steiner, owner, parents, weights)
    }

    pub fn create_child_node(
        &mut self,
        owner: EntityId,
        parents: &[NodeIdx],
        weights: &[f64],
    ) -> Result<NodeIdx, MeshError> {
        self.create_weighted(NodeKind::Child, owner, parents, weights)
    }

    fn create_weighted(
        &mut self,
        kind: NodeKind,
        owner: EntityId,
        parents: &[NodeIdx],
        weights: &[f64],
    ) -> Result<NodeIdx, MeshError> {
        if parents.is_empty() || parents.len() != weights.len() {
            return Err(MeshError::InvalidGeometry(format!(
                "{kind:?} node needs one weight per parent"
            )));
        }
        let total: f64 = weights.iter().sum();
        if (total - 1.0).abs() > 1e-10 {
            return Err(MeshError::InvalidGeometry(format!(
                "{kind:?} node weights sum to {total}"
            )));
        }
        if let Some(idx) = self.common_child(parents, kind) {
            return Ok(idx);
        }
        // keep parents in ancestry order, weights aligned
        let mut pairs: Vec<(NodeIdx, f64)> = parents.iter().copied().zip(weights.iter().copied()).collect();
        pairs.sort_by_cached_key(|(p, _)| self.ancestry(*p));
        let x = pairs
            .iter()
            .fold(Vector3::zeros(), |acc, (p, w)| acc + self.coordinates(*p) * *w);
        let parents: ParentList = pairs.iter().map(|(p, _)| *p).collect();
        let weights: WeightList = pairs.iter().map(|(_, w)| *w).collect();
        let key = child_key(&parents, kind);
        let variant = match kind {
            NodeKind::Steiner => NodeVariant::Steiner { parents, weights },
            _ => NodeVariant::Child { parents, weights },
        };
        let idx = self.push(variant, owner, x);
        self.children.insert(key, idx);
        Ok(idx)
    }

    /// Accumulate `weight` times the mesh-node stencil of `idx` into `out`.
    pub fn build_stencil(&self, idx: NodeIdx, weight: f64, out: &mut BTreeMap<EntityId, f64>) {
        let node = self.get(idx);
        if let NodeVariant::Mesh { entity } = node.variant {
            *out.entry(entity).or_insert(0.0) += weight;
            return;
        }
        for (p, w) in node.parents().iter().zip(node.variant.weights()) {
            self.build_stencil(*p, weight * w, out);
        }
    }

    /// Mesh nodes and weights whose combination reproduces `idx`.
    pub fn stencil(&self, idx: NodeIdx) -> BTreeMap<EntityId, f64> {
        let mut out = BTreeMap::new();
        self.build_stencil(idx, 1.0, &mut out);
        out
    }

    // ----- per-pass state ------------------------------------------------

    pub fn set_sign(&mut self, idx: NodeIdx, sign: i8) -> Result<(), MeshError> {
        let node = &mut self.nodes[idx.index()];
        match node.sign {
            Some(s) if s != sign => Err(MeshError::NodeState(format!(
                "node {idx:?} sign already set to {s}, refusing {sign}"
            ))),
            _ => {
                node.sign = Some(sign);
                Ok(())
            }
        }
    }

    /// Fold a sign seen elsewhere into the local one.
    pub fn merge_sign(&mut self, idx: NodeIdx, sign: i8) {
        let node = &mut self.nodes[idx.index()];
        node.sign = Some(node.sign.map_or(sign, |s| merge_signs(s, sign)));
    }

    pub fn sign(&self, idx: NodeIdx) -> Result<i8, MeshError> {
        self.get(idx)
            .sign
            .ok_or_else(|| MeshError::NodeState(format!("sign of node {idx:?} read before set")))
    }

    pub fn set_score(&mut self, idx: NodeIdx, score: f64) -> Result<(), MeshError> {
        let node = &mut self.nodes[idx.index()];
        match node.score {
            Some(s) if s != score => Err(MeshError::NodeState(format!(
                "node {idx:?} score already set to {s}, refusing {score}"
            ))),
            _ => {
                node.score = Some(score);
                Ok(())
            }
        }
    }

    /// Fold a score seen elsewhere into the local one (minimum wins).
    pub fn merge_score(&mut self, idx: NodeIdx, score: f64) {
        let node = &mut self.nodes[idx.index()];
        node.score = Some(node.score.map_or(score, |s| s.min(score)));
    }

    pub fn score(&self, idx: NodeIdx) -> Result<f64, MeshError> {
        self.get(idx)
            .score
            .ok_or_else(|| MeshError::NodeState(format!("score of node {idx:?} read before set")))
    }

    /// Put `idx` on the interface, whatever side it was on.
    pub fn snap_to_interface(&mut self, idx: NodeIdx) {
        self.nodes[idx.index()].sign = Some(0);
    }

    /// Record that `interface` passes through `idx`.
    pub fn capture(&mut self, idx: NodeIdx, interface: InterfaceId) {
        let captured = &mut self.nodes[idx.index()].captured;
        if !captured.contains(&interface) {
            captured.push(interface);
        }
    }

    /// Reset signs for the next interface; scores survive across passes.
    pub fn clear_signs(&mut self) {
        for n in &mut self.nodes {
            n.sign = None;
        }
    }

    pub fn set_entity(&mut self, idx: NodeIdx, entity: EntityId) -> Result<(), MeshError> {
        let node = &mut self.nodes[idx.index()];
        match node.entity {
            Some(e) if e != entity => Err(MeshError::NodeState(format!(
                "node {idx:?} already bound to entity {e}"
            ))),
            _ => {
                node.entity = Some(entity);
                Ok(())
            }
        }
    }

    pub fn set_prolonged(&mut self, idx: NodeIdx, prolonged: bool) {
        self.nodes[idx.index()].prolonged = prolonged;
    }
}

impl DebugInvariants for NodeArena {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "NodeArena");
    }

    fn validate_invariants(&self) -> Result<(), MeshError> {
        for (idx, node) in self.iter() {
            if node.parents().iter().any(|p| *p >= idx) {
                return Err(MeshError::InvariantViolation(format!(
                    "node {idx:?} refers to a later parent"
                )));
            }
            let weights = node.variant.weights();
            if !weights.is_empty() && (weights.iter().sum::<f64>() - 1.0).abs() > 1e-10 {
                return Err(MeshError::InvariantViolation(format!(
                    "node {idx:?} weights do not sum to one"
                )));
            }
            let registered = match node.variant {
                NodeVariant::Mesh { entity } => self.mesh_node(entity),
                _ => self.common_child(node.parents(), node.kind()),
            };
            if registered != Some(idx) {
                return Err(MeshError::InvariantViolation(format!(
                    "node {idx:?} missing from the dedup index"
                )));
            }
        }
        Ok(())
    }
}
