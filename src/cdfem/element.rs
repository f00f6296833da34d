//! Background elements and their conformal subelements.
//!
//! Each [`MeshElement`] starts as a single leaf covering the whole element. Every
//! interface pass records node signs, materializes crossing nodes on edges whose end
//! signs strictly differ, then bisects leaves until no leaf has a cut edge. Edges are
//! bisected in descending (score, ancestry) order of their crossing node, a global
//! order, so two elements sharing a face split it the same way.

use crate::cdfem::ancestry::NodeAncestry;
use crate::cdfem::node::{NodeArena, NodeIdx, NodeKind};
use crate::debug_invariants::DebugInvariants;
use crate::geometry::interface::{InterfaceGeometry, InterfaceId, PhaseTag, SurfaceId, sign_of};
use crate::geometry::quality::simplex_measure;
use crate::mesh_error::MeshError;
use crate::topology::cell_topology::CellTopology;
use crate::topology::entity::EntityId;
use nalgebra::Vector3;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

const VOLUME_RTOL: f64 = 1e-8;

/// Progress of one element through a decomposition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ElementStage {
    Uncut,
    Signed,
    EdgeCut,
    Triangulated,
    PhaseAssigned,
}

pub type LeafNodes = SmallVec<[NodeIdx; 10]>;

#[derive(Clone, Debug, PartialEq)]
pub struct SubElement {
    topology: CellTopology,
    nodes: LeafNodes,
    interface_signs: BTreeMap<InterfaceId, i8>,
    phase: PhaseTag,
    entity: Option<EntityId>,
}

impl SubElement {
    fn linear(topology: CellTopology, nodes: LeafNodes) -> Self {
        Self {
            topology,
            nodes,
            interface_signs: BTreeMap::new(),
            phase: PhaseTag::new(),
            entity: None,
        }
    }

    /// Leaf rebuilt from an existing child element.
    pub fn restored(topology: CellTopology, nodes: LeafNodes, phase: PhaseTag, entity: EntityId) -> Self {
        Self {
            topology,
            nodes,
            interface_signs: BTreeMap::new(),
            phase,
            entity: Some(entity),
        }
    }

    pub fn topology(&self) -> CellTopology {
        self.topology
    }

    /// Vertices, then midside nodes for quadratic leaves.
    pub fn nodes(&self) -> &[NodeIdx] {
        &self.nodes
    }

    pub fn vertices(&self) -> &[NodeIdx] {
        &self.nodes[..self.topology.num_vertices()]
    }

    pub fn phase(&self) -> &PhaseTag {
        &self.phase
    }

    pub fn interface_sign(&self, interface: InterfaceId) -> Option<i8> {
        self.interface_signs.get(&interface).copied()
    }

    pub fn entity(&self) -> Option<EntityId> {
        self.entity
    }

    pub fn set_entity(&mut self, entity: EntityId) -> Result<(), MeshError> {
        match self.entity {
            Some(e) if e != entity => Err(MeshError::NodeState(format!(
                "subelement already bound to element {e}"
            ))),
            _ => {
                self.entity = Some(entity);
                Ok(())
            }
        }
    }

    pub fn measure(&self, arena: &NodeArena) -> f64 {
        let x: Vec<Vector3<f64>> = self.vertices().iter().map(|n| *arena.coordinates(*n)).collect();
        simplex_measure(self.topology.dimension(), &x)
    }
}

#[derive(Clone, Debug)]
pub struct MeshElement {
    entity: EntityId,
    topology: CellTopology,
    nodes: Vec<NodeIdx>,
    stage: ElementStage,
    cutting: BTreeSet<InterfaceId>,
    leaves: Vec<SubElement>,
    measure: f64,
}

/// Crossing node on `(a, b)` if the end signs strictly differ.
fn cut_child(arena: &NodeArena, a: NodeIdx, b: NodeIdx) -> Result<Option<NodeIdx>, MeshError> {
    if arena.sign(a)? * arena.sign(b)? >= 0 {
        return Ok(None);
    }
    arena
        .common_child(&[a, b], NodeKind::Edge)
        .map(Some)
        .ok_or_else(|| MeshError::Ancestry(format!("no crossing node on cut edge {a:?}-{b:?}")))
}

fn bisection_order(arena: &NodeArena, x: NodeIdx, y: NodeIdx) -> Result<Ordering, MeshError> {
    Ok(arena
        .score(x)?
        .total_cmp(&arena.score(y)?)
        .then_with(|| arena.ancestry(x).cmp(&arena.ancestry(y))))
}

impl MeshElement {
    /// Wrap background element `entity` whose nodes are already in `arena`.
    pub fn new(
        entity: EntityId,
        topology: CellTopology,
        nodes: Vec<NodeIdx>,
        arena: &NodeArena,
    ) -> Result<Self, MeshError> {
        if !topology.is_supported_for_decomposition() {
            return Err(MeshError::UnsupportedTopology(topology));
        }
        if nodes.len() != topology.num_nodes() {
            return Err(MeshError::InvalidGeometry(format!(
                "element {entity} has {} nodes, {topology:?} needs {}",
                nodes.len(),
                topology.num_nodes()
            )));
        }
        let linear = topology.linear();
        let leaf = SubElement::linear(linear, nodes[..linear.num_vertices()].iter().copied().collect());
        let measure = leaf.measure(arena);
        if measure <= 0.0 {
            return Err(MeshError::InvalidGeometry(format!(
                "element {entity} has non-positive measure {measure}"
            )));
        }
        Ok(Self {
            entity,
            topology,
            nodes,
            stage: ElementStage::Uncut,
            cutting: BTreeSet::new(),
            leaves: vec![leaf],
            measure,
        })
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }
    pub fn topology(&self) -> CellTopology {
        self.topology
    }
    /// Background nodes, vertices first.
    pub fn nodes(&self) -> &[NodeIdx] {
        &self.nodes
    }
    pub fn vertices(&self) -> &[NodeIdx] {
        &self.nodes[..self.topology.num_vertices()]
    }
    pub fn stage(&self) -> ElementStage {
        self.stage
    }
    pub fn measure(&self) -> f64 {
        self.measure
    }
    pub fn cutting_interfaces(&self) -> &BTreeSet<InterfaceId> {
        &self.cutting
    }
    pub fn leaves(&self) -> &[SubElement] {
        &self.leaves
    }
    pub fn leaves_mut(&mut self) -> &mut [SubElement] {
        &mut self.leaves
    }
    /// Whether any interface split the element.
    pub fn is_cut(&self) -> bool {
        self.leaves.len() > 1
    }

    fn advance(&mut self, to: ElementStage) -> Result<(), MeshError> {
        if self.stage == ElementStage::PhaseAssigned {
            return Err(MeshError::NodeState(format!(
                "element {} already has its phases, cannot move to {to:?}",
                self.entity
            )));
        }
        self.stage = to;
        Ok(())
    }

    /// Inspect the current node signs; returns whether `interface` cuts a leaf.
    pub fn record_signs(&mut self, arena: &NodeArena, interface: InterfaceId) -> Result<bool, MeshError> {
        self.advance(ElementStage::Signed)?;
        let mut cut = false;
        for leaf in &self.leaves {
            for e in leaf.topology.edges() {
                let (a, b) = (leaf.nodes[e[0]], leaf.nodes[e[1]]);
                if arena.sign(a)? * arena.sign(b)? < 0 {
                    cut = true;
                }
            }
        }
        if cut {
            self.cutting.insert(interface);
        }
        Ok(cut)
    }

    /// End nodes of cut leaf edges whose crossing lies within `tolerance` of them, as a
    /// fraction of the edge. A crossing that rounds onto an end always counts.
    pub fn snap_candidates<G: InterfaceGeometry + ?Sized>(
        &self,
        arena: &NodeArena,
        geometry: &G,
        interface: InterfaceId,
        tolerance: f64,
    ) -> Result<Vec<NodeIdx>, MeshError> {
        let mut out = Vec::new();
        for leaf in &self.leaves {
            for e in leaf.topology.edges() {
                let (a, b) = (leaf.nodes[e[0]], leaf.nodes[e[1]]);
                if arena.sign(a)? * arena.sign(b)? >= 0 {
                    continue;
                }
                let (first, second) = if arena.ancestry(b) < arena.ancestry(a) { (b, a) } else { (a, b) };
                let Some(position) =
                    geometry.edge_crossing_position(interface, arena.coordinates(first), arena.coordinates(second))
                else {
                    continue;
                };
                if position <= tolerance {
                    out.push(first);
                } else if position >= 1.0 - tolerance {
                    out.push(second);
                }
            }
        }
        Ok(out)
    }

    /// Materialize the crossing node of every cut leaf edge. Returns the nodes created.
    pub fn create_edge_nodes<G: InterfaceGeometry + ?Sized>(
        &mut self,
        arena: &mut NodeArena,
        geometry: &G,
        interface: InterfaceId,
    ) -> Result<Vec<NodeIdx>, MeshError> {
        self.advance(ElementStage::EdgeCut)?;
        let mut created = Vec::new();
        for leaf in &self.leaves {
            for e in leaf.topology.edges() {
                let (a, b) = (leaf.nodes[e[0]], leaf.nodes[e[1]]);
                if arena.sign(a)? * arena.sign(b)? >= 0 || arena.common_child(&[a, b], NodeKind::Edge).is_some() {
                    continue;
                }
                let (first, second) = if arena.ancestry(b) < arena.ancestry(a) { (b, a) } else { (a, b) };
                let position = geometry
                    .edge_crossing_position(interface, arena.coordinates(first), arena.coordinates(second))
                    .ok_or_else(|| {
                        MeshError::InvalidGeometry(format!(
                            "interface {interface} reports no crossing on a sign-changing edge of element {}",
                            self.entity
                        ))
                    })?;
                let node = arena.create_edge_node(self.entity, first, second, position)?;
                arena.set_sign(node, 0)?;
                arena.set_score(node, position.min(1.0 - position))?;
                created.push(node);
            }
        }
        Ok(created)
    }

    /// Bisect every leaf along its cut edges and record the side of `interface` on
    /// each resulting leaf.
    pub fn triangulate<G: InterfaceGeometry + ?Sized>(
        &mut self,
        arena: &NodeArena,
        geometry: &G,
        interface: InterfaceId,
    ) -> Result<(), MeshError> {
        self.advance(ElementStage::Triangulated)?;
        let mut out = Vec::with_capacity(self.leaves.len());
        for leaf in std::mem::take(&mut self.leaves) {
            bisect(arena, leaf, &mut out)?;
        }
        for leaf in &mut out {
            let sign = leaf_sign(arena, geometry, leaf, interface)?;
            leaf.interface_signs.insert(interface, sign);
        }
        self.leaves = out;
        Ok(())
    }

    /// Turn accumulated interface signs into phases and, for quadratic elements, add
    /// midside nodes to every leaf.
    ///
    /// With `closest_surface` set the phase is the surface that is closest among the
    /// listed ones; otherwise it is the combination of all interface signs. An element
    /// no interface split takes `uncut_phase` instead when one is given.
    pub fn assign_phases(
        &mut self,
        arena: &mut NodeArena,
        closest_surface: Option<&[SurfaceId]>,
        uncut_phase: Option<PhaseTag>,
    ) -> Result<(), MeshError> {
        self.advance(ElementStage::PhaseAssigned)?;
        let uncut_phase = uncut_phase.filter(|_| !self.is_cut());
        for leaf in &mut self.leaves {
            leaf.phase = if let Some(phase) = &uncut_phase {
                phase.clone()
            } else if let Some(surfaces) = closest_surface {
                winning_phase(surfaces, &leaf.interface_signs)
            } else {
                leaf.interface_signs
                    .iter()
                    .fold(PhaseTag::new(), |tag, (i, s)| tag.with(i.first, *s))
            };
        }
        if self.topology.is_quadratic() {
            self.build_quadratic_nodes(arena);
        }
        crate::debug_invariants!(self.check_volume(arena), "MeshElement::assign_phases");
        Ok(())
    }

    fn build_quadratic_nodes(&mut self, arena: &mut NodeArena) {
        let linear = self.topology.linear();
        let parent_edges: Vec<([NodeIdx; 2], NodeIdx)> = linear
            .edges()
            .iter()
            .enumerate()
            .filter_map(|(e, [i, j])| {
                let mid = self.topology.edge_midside_node(e)?;
                Some(([self.nodes[*i], self.nodes[*j]], self.nodes[mid]))
            })
            .collect();
        for leaf in &mut self.leaves {
            let mut nodes: LeafNodes = leaf.nodes[..linear.num_vertices()].iter().copied().collect();
            for [i, j] in linear.edges() {
                let (a, b) = (nodes[*i], nodes[*j]);
                let mid = parent_edges
                    .iter()
                    .find(|(ends, _)| (ends[0] == a && ends[1] == b) || (ends[0] == b && ends[1] == a))
                    .map(|(_, m)| *m)
                    .unwrap_or_else(|| arena.create_midside_node(self.entity, a, b));
                nodes.push(mid);
            }
            leaf.nodes = nodes;
            leaf.topology = self.topology;
        }
    }

    /// Install the leaves found in the mesh database. Without child elements the element
    /// is its own single leaf in phase `uncut_phase`.
    pub fn restore(&mut self, children: Vec<SubElement>, uncut_phase: PhaseTag) -> Result<(), MeshError> {
        self.advance(ElementStage::PhaseAssigned)?;
        if children.is_empty() {
            self.leaves = vec![SubElement::restored(
                self.topology,
                self.nodes.iter().copied().collect(),
                uncut_phase,
                self.entity,
            )];
        } else {
            self.leaves = children;
        }
        Ok(())
    }

    /// Parent side containing every node of `nodes`, judged by mesh-node stencils.
    pub fn parent_side_of(&self, arena: &NodeArena, nodes: &[NodeIdx]) -> Option<usize> {
        let linear = self.topology.linear();
        let supports: Vec<BTreeSet<EntityId>> = nodes
            .iter()
            .map(|n| arena.stencil(*n).into_iter().filter(|(_, w)| *w != 0.0).map(|(e, _)| e).collect())
            .collect();
        (0..linear.num_sides()).find(|&s| {
            let side: BTreeSet<EntityId> = linear
                .side_vertices(s)
                .iter()
                .filter_map(|&v| arena.get(self.nodes[v]).entity())
                .collect();
            supports.iter().all(|sup| sup.is_subset(&side))
        })
    }

    /// Leaves must tile the parent exactly.
    pub fn check_volume(&self, arena: &NodeArena) -> Result<(), MeshError> {
        let total: f64 = self.leaves.iter().map(|l| l.measure(arena)).sum();
        if (total - self.measure).abs() > VOLUME_RTOL * self.measure {
            return Err(MeshError::InvalidGeometry(format!(
                "subelements of element {} measure {total}, parent {}",
                self.entity, self.measure
            )));
        }
        Ok(())
    }
}

fn bisect(arena: &NodeArena, leaf: SubElement, out: &mut Vec<SubElement>) -> Result<(), MeshError> {
    let mut best: Option<(usize, usize, NodeIdx)> = None;
    for e in leaf.topology.edges() {
        let Some(child) = cut_child(arena, leaf.nodes[e[0]], leaf.nodes[e[1]])? else {
            continue;
        };
        let better = match best {
            None => true,
            Some((_, _, current)) => bisection_order(arena, child, current)? == Ordering::Greater,
        };
        if better {
            best = Some((e[0], e[1], child));
        }
    }
    let Some((i, j, mid)) = best else {
        out.push(leaf);
        return Ok(());
    };
    let mut first = leaf.clone();
    first.nodes[j] = mid;
    let mut second = leaf;
    second.nodes[i] = mid;
    bisect(arena, first, out)?;
    bisect(arena, second, out)
}

fn leaf_sign<G: InterfaceGeometry + ?Sized>(
    arena: &NodeArena,
    geometry: &G,
    leaf: &SubElement,
    interface: InterfaceId,
) -> Result<i8, MeshError> {
    for n in leaf.vertices() {
        let s = arena.sign(*n)?;
        if s != 0 {
            return Ok(s);
        }
    }
    // every vertex on the interface: fall back to the centroid
    let nv = leaf.vertices().len() as f64;
    let centroid = leaf
        .vertices()
        .iter()
        .fold(Vector3::zeros(), |acc, n| acc + arena.coordinates(*n))
        / nv;
    Ok(match sign_of(geometry.interface_value(interface, &centroid)) {
        0 => 1,
        s => s,
    })
}

/// With one level set per phase the phase is the surface closer than every other.
fn winning_phase(surfaces: &[SurfaceId], signs: &BTreeMap<InterfaceId, i8>) -> PhaseTag {
    let mut iter = surfaces.iter().copied();
    let Some(mut winner) = iter.next() else {
        return PhaseTag::new();
    };
    for s in iter {
        let pair = InterfaceId::new(winner, s);
        // negative means d(first) < d(second): first wins
        let first_wins = signs.get(&pair).copied().unwrap_or(-1) < 0;
        let winner_is_first = pair.first == winner;
        if first_wins != winner_is_first {
            winner = s;
        }
    }
    PhaseTag::new().with(winner, -1)
}

impl DebugInvariants for MeshElement {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "MeshElement");
    }

    fn validate_invariants(&self) -> Result<(), MeshError> {
        if self.leaves.is_empty() {
            return Err(MeshError::InvariantViolation(format!(
                "element {} has no subelements",
                self.entity
            )));
        }
        for leaf in &self.leaves {
            if leaf.nodes.len() != leaf.topology.num_nodes() {
                return Err(MeshError::InvariantViolation(format!(
                    "subelement of {} has {} nodes for {:?}",
                    self.entity,
                    leaf.nodes.len(),
                    leaf.topology
                )));
            }
        }
        Ok(())
    }
}

/// Ancestry of a leaf's vertex set, sorted; identifies a subelement across snapshots.
pub fn leaf_signature(arena: &NodeArena, leaf: &SubElement) -> Vec<NodeAncestry> {
    let mut sig: Vec<NodeAncestry> = leaf.nodes().iter().map(|n| arena.ancestry(*n)).collect();
    sig.sort();
    sig
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::interface::{AnalyticGeometry, LevelSet};
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn id(n: u64) -> EntityId {
        EntityId::new(n).unwrap()
    }

    fn plane(normal: [f64; 3], offset: f64) -> AnalyticGeometry {
        AnalyticGeometry::new(vec![LevelSet::Plane { normal, offset }])
    }

    fn setup(coords: &[[f64; 3]], topology: CellTopology) -> (NodeArena, MeshElement) {
        let mut arena = NodeArena::new();
        let nodes: Vec<NodeIdx> = coords
            .iter()
            .enumerate()
            .map(|(i, x)| arena.create_mesh_node(id(i as u64 + 1), id(1), Vector3::from(*x)))
            .collect();
        let elem = MeshElement::new(id(1), topology, nodes, &arena).unwrap();
        (arena, elem)
    }

    fn run_pass(arena: &mut NodeArena, elem: &mut MeshElement, g: &AnalyticGeometry, i: InterfaceId) {
        arena.clear_signs();
        for n in arena.indices().collect::<Vec<_>>() {
            let s = sign_of(g.interface_value(i, arena.coordinates(n)));
            arena.set_sign(n, s).unwrap();
        }
        if elem.record_signs(arena, i).unwrap() {
            elem.create_edge_nodes(arena, g, i).unwrap();
        }
        elem.triangulate(arena, g, i).unwrap();
    }

    #[test]
    fn line_cut_gives_two_leaves_sharing_the_crossing() {
        let (mut arena, mut elem) = setup(&[[0., 0., 0.], [1., 0., 0.]], CellTopology::Line2);
        let g = plane([1.0, 0.0, 0.0], 0.3);
        let i = InterfaceId::single(SurfaceId(0));
        run_pass(&mut arena, &mut elem, &g, i);
        elem.assign_phases(&mut arena, None, None).unwrap();
        assert_eq!(elem.leaves().len(), 2);
        let crossing = arena.common_child(elem.vertices(), NodeKind::Edge).unwrap();
        assert_relative_eq!(arena.coordinates(crossing).x, 0.3);
        let phases: Vec<String> = elem.leaves().iter().map(|l| l.phase().to_string()).collect();
        assert_eq!(phases, vec!["{0:-}", "{0:+}"]);
        assert!(elem.leaves().iter().all(|l| l.vertices().contains(&crossing)));
        assert_eq!(elem.stage(), ElementStage::PhaseAssigned);
    }

    #[test]
    fn uncut_triangle_keeps_one_leaf() {
        let (mut arena, mut elem) = setup(&[[0., 0., 0.], [1., 0., 0.], [0., 1., 0.]], CellTopology::Triangle3);
        let g = plane([1.0, 0.0, 0.0], 2.0);
        run_pass(&mut arena, &mut elem, &g, InterfaceId::single(SurfaceId(0)));
        elem.assign_phases(&mut arena, None, None).unwrap();
        assert!(!elem.is_cut());
        assert!(elem.cutting_interfaces().is_empty());
        assert_eq!(elem.leaves()[0].phase().sign(SurfaceId(0)), Some(-1));
        assert_eq!(arena.len(), 3);
    }

    /// Geometry whose only surface passes through every point.
    struct Everywhere;

    impl InterfaceGeometry for Everywhere {
        fn surface_identifiers(&self) -> Vec<SurfaceId> {
            vec![SurfaceId(0)]
        }
        fn surface_distance(&self, _surface: SurfaceId, _x: &Vector3<f64>) -> f64 {
            0.0
        }
    }

    #[test]
    fn bulk_phase_overrides_node_signs_of_uncut_elements() {
        let i = InterfaceId::single(SurfaceId(0));
        let inside = PhaseTag::new().with(SurfaceId(0), -1);
        for bulk in [None, Some(inside.clone())] {
            let (mut arena, mut elem) =
                setup(&[[0., 0., 0.], [1., 0., 0.], [0., 1., 0.]], CellTopology::Triangle3);
            for n in arena.indices().collect::<Vec<_>>() {
                arena.set_sign(n, 0).unwrap();
            }
            assert!(!elem.record_signs(&arena, i).unwrap());
            elem.triangulate(&arena, &Everywhere, i).unwrap();
            elem.assign_phases(&mut arena, None, bulk.clone()).unwrap();
            let expected = bulk.unwrap_or_else(|| PhaseTag::new().with(SurfaceId(0), 1));
            assert_eq!(elem.leaves()[0].phase(), &expected);
        }

        // a cut element ignores it
        let (mut arena, mut elem) = setup(&[[0., 0., 0.], [1., 0., 0.], [0., 1., 0.]], CellTopology::Triangle3);
        run_pass(&mut arena, &mut elem, &plane([1.0, 0.0, 0.0], 0.5), i);
        elem.assign_phases(&mut arena, None, Some(inside)).unwrap();
        assert!(elem.is_cut());
        assert!(elem.leaves().iter().any(|l| l.phase().sign(SurfaceId(0)) == Some(1)));
    }

    #[test]
    fn near_vertex_crossings_snap_to_the_vertices() {
        let (mut arena, mut elem) = setup(&[[0., 0., 0.], [1., 0., 0.], [0., 1., 0.]], CellTopology::Triangle3);
        let g = plane([1.0, 0.0, 0.0], 1e-12);
        let i = InterfaceId::single(SurfaceId(0));
        for n in arena.indices().collect::<Vec<_>>() {
            arena.set_sign(n, sign_of(g.interface_value(i, arena.coordinates(n)))).unwrap();
        }
        let v = elem.vertices().to_vec();
        let snapped: BTreeSet<NodeIdx> = elem.snap_candidates(&arena, &g, i, 1e-6).unwrap().into_iter().collect();
        assert_eq!(snapped, BTreeSet::from([v[0], v[2]]));
        assert!(elem.snap_candidates(&arena, &g, i, 1e-13).unwrap().is_empty());
        for n in snapped {
            arena.snap_to_interface(n);
        }
        assert!(!elem.record_signs(&arena, i).unwrap());
    }

    #[test]
    fn cut_triangle_tiles_parent() {
        let (mut arena, mut elem) = setup(&[[0., 0., 0.], [1., 0., 0.], [0., 1., 0.]], CellTopology::Triangle3);
        let g = plane([1.0, 0.0, 0.0], 0.25);
        run_pass(&mut arena, &mut elem, &g, InterfaceId::single(SurfaceId(0)));
        elem.assign_phases(&mut arena, None, None).unwrap();
        assert_eq!(elem.leaves().len(), 3);
        elem.check_volume(&arena).unwrap();
        let plus: f64 = elem
            .leaves()
            .iter()
            .filter(|l| l.phase().sign(SurfaceId(0)) == Some(1))
            .map(|l| l.measure(&arena))
            .sum();
        assert_relative_eq!(plus, 0.5 * 0.75 * 0.75, epsilon = 1e-12);
        assert!(elem.leaves().iter().all(|l| l.measure(&arena) > 0.0));
    }

    #[test]
    fn quadratic_leaves_reuse_parent_midside_nodes() {
        let (mut arena, mut elem) = setup(
            &[[0., 0., 0.], [1., 0., 0.], [0., 1., 0.], [0.5, 0., 0.], [0.5, 0.5, 0.], [0., 0.5, 0.]],
            CellTopology::Triangle6,
        );
        let g = plane([0.0, 1.0, 0.0], 0.75);
        run_pass(&mut arena, &mut elem, &g, InterfaceId::single(SurfaceId(0)));
        elem.assign_phases(&mut arena, None, None).unwrap();
        let parent_mid = elem.nodes()[3];
        assert!(elem.leaves().iter().all(|l| l.topology() == CellTopology::Triangle6));
        assert!(elem.leaves().iter().any(|l| l.nodes().contains(&parent_mid)));
        elem.validate_invariants().unwrap();
    }

    #[test]
    fn levelset_per_phase_picks_closest_surface() {
        let mut signs = BTreeMap::new();
        signs.insert(InterfaceId::new(SurfaceId(0), SurfaceId(1)), 1);
        signs.insert(InterfaceId::new(SurfaceId(0), SurfaceId(2)), 1);
        signs.insert(InterfaceId::new(SurfaceId(1), SurfaceId(2)), -1);
        let surfaces = [SurfaceId(0), SurfaceId(1), SurfaceId(2)];
        assert_eq!(winning_phase(&surfaces, &signs), PhaseTag::new().with(SurfaceId(1), -1));
        assert_eq!(winning_phase(&surfaces[..1], &BTreeMap::new()), PhaseTag::new().with(SurfaceId(0), -1));
    }

    #[test]
    fn parent_side_detection_uses_stencils() {
        let (mut arena, mut elem) = setup(&[[0., 0., 0.], [1., 0., 0.], [0., 1., 0.]], CellTopology::Triangle3);
        let g = plane([1.0, 0.0, 0.0], 0.5);
        run_pass(&mut arena, &mut elem, &g, InterfaceId::single(SurfaceId(0)));
        let v = elem.vertices().to_vec();
        let on_bottom = arena.common_child(&[v[0], v[1]], NodeKind::Edge).unwrap();
        assert_eq!(elem.parent_side_of(&arena, &[v[0], on_bottom]), Some(0));
        let on_hyp = arena.common_child(&[v[1], v[2]], NodeKind::Edge).unwrap();
        assert_eq!(elem.parent_side_of(&arena, &[on_bottom, on_hyp]), None);
    }

    proptest! {
        #[test]
        fn tet_volume_is_conserved(
            nx in -1.0f64..1.0, ny in -1.0f64..1.0, nz in 0.1f64..1.0,
            offset in 0.05f64..0.5,
            ox in -0.5f64..0.5, oy in -0.5f64..0.5, oz in -0.5f64..0.5,
        ) {
            let (mut arena, mut elem) = setup(
                &[[0., 0., 0.], [1., 0., 0.], [0., 1., 0.], [0., 0., 1.]],
                CellTopology::Tetrahedron4,
            );
            let g = AnalyticGeometry::new(vec![
                LevelSet::Plane { normal: [nx, ny, nz], offset },
                LevelSet::Sphere { center: [ox, oy, oz], radius: 0.6 },
            ]);
            for s in 0..2 {
                run_pass(&mut arena, &mut elem, &g, InterfaceId::single(SurfaceId(s)));
            }
            elem.assign_phases(&mut arena, None, None).unwrap();
            prop_assert!(elem.check_volume(&arena).is_ok());
            prop_assert!(elem.leaves().iter().all(|l| l.measure(&arena) > 0.0));
        }
    }
}
