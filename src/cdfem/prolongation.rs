//! Field prolongation from the previous decomposition onto the new one.
//!
//! [`ProlongationStash::capture`] copies the field values of every live node and
//! element of the old mesh, plus its interface facets, before the mesh is modified.
//! Afterwards [`prolongate`] fills every active node of the new snapshot from, in order
//! of preference:
//!
//! 1. its own stashed values, when they cover every field the node now carries;
//! 2. the nearest old facet whose field set covers them, interpolated at the closest
//!    point;
//! 3. the nearest old node whose field set covers them.
//!
//! Old data held by other ranks is shipped in for a padded box around this rank's
//! nodes. In parallel the padding starts at a multiple of the largest element and grows
//! until no node had to skip a facet held elsewhere and no node took values from
//! further away than the padding. The last allowed round no longer skips such facets
//! and takes the nearest node instead.
//!
//! Interpolation fields are the exception: on derived nodes they are the stencil
//! weighted values of the parent mesh nodes, once those have been filled.

use crate::algs::communicator::{Communicator, tags};
use crate::algs::sparse_exchange::{all_gather, all_reduce_max_f64, all_reduce_or, exchange};
use crate::algs::wire::Packable;
use crate::cdfem::cdmesh::{CDMesh, entity_measure};
use crate::cdfem::node::{NodeIdx, NodeKind};
use crate::cdfem::options::CdfemOptions;
use crate::cdfem::phase::PhaseSupport;
use crate::geometry::bounding_box::BoundingBox;
use crate::geometry::facet::{FacetProjection, closest_point};
use crate::mesh::bulk::BulkData;
use crate::mesh::meta::{FieldId, MetaData};
use crate::mesh_error::MeshError;
use crate::topology::entity::{EntityId, EntityKey, EntityRank};
use bytes::{Bytes, BytesMut};
use nalgebra::Vector3;
use rstar::{AABB, PointDistance, RTree, RTreeObject};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};

/// Sorted field ordinals.
pub type FieldSet = Vec<FieldId>;

type FieldValues = BTreeMap<FieldId, Vec<f64>>;

/// Padding used when ranks do not exchange old data.
const EPSILON_PADDING: f64 = 1.0e-10;

#[derive(Clone, Debug, PartialEq)]
pub struct ProlongationNodeData {
    pub id: EntityId,
    pub coordinates: Vector3<f64>,
    pub fields: FieldValues,
}

impl ProlongationNodeData {
    pub fn field_set(&self) -> FieldSet {
        self.fields.keys().copied().collect()
    }

    pub fn covers(&self, required: &[FieldId]) -> bool {
        required.iter().all(|f| self.fields.contains_key(f))
    }
}

impl Packable for ProlongationNodeData {
    fn pack(&self, buf: &mut BytesMut) {
        self.id.pack(buf);
        self.coordinates.pack(buf);
        (self.fields.len() as u32).pack(buf);
        for (field, values) in &self.fields {
            field.0.pack(buf);
            values.pack(buf);
        }
    }

    fn unpack(buf: &mut Bytes) -> Result<Self, MeshError> {
        let id = EntityId::unpack(buf)?;
        let coordinates = Vector3::unpack(buf)?;
        let n = u32::unpack(buf)? as usize;
        if n > buf.len() {
            return Err(MeshError::Wire(format!("node {id} claims {n} fields")));
        }
        let mut fields = BTreeMap::new();
        for _ in 0..n {
            let field = FieldId(u32::unpack(buf)?);
            fields.insert(field, Vec::<f64>::unpack(buf)?);
        }
        Ok(Self { id, coordinates, fields })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProlongationElementData {
    pub fields: FieldValues,
    pub measure: f64,
    /// Element this one was cut from.
    pub parent: Option<EntityId>,
}

/// Interface facet of the old mesh: a side between two conformal parts, or a node in 1D.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProlongationFacet {
    pub nodes: SmallVec<[EntityId; 3]>,
}

/// Field data of the old mesh, taken before it is modified.
#[derive(Clone, Debug, Default)]
pub struct ProlongationStash {
    step_count: i32,
    nodes: BTreeMap<EntityId, ProlongationNodeData>,
    elements: BTreeMap<EntityId, ProlongationElementData>,
    facets: Vec<ProlongationFacet>,
    max_element_size: f64,
}

/// Bookkeeping fields that are never prolonged.
fn excluded_fields(phases: &PhaseSupport) -> [FieldId; 2] {
    [phases.parent_node_ids_field(), phases.parent_element_id_field()]
}

fn stash_fields(mesh: &BulkData, key: EntityKey, excluded: &[FieldId]) -> FieldValues {
    mesh.fields_on(key)
        .into_iter()
        .filter(|f| !excluded.contains(f))
        .filter_map(|f| Some((f, mesh.field_data(f, key)?.to_vec())))
        .collect()
}

fn required_fields(mesh: &BulkData, key: EntityKey, excluded: &[FieldId]) -> FieldSet {
    mesh.fields_on(key)
        .into_iter()
        .filter(|f| !excluded.contains(f))
        .collect()
}

impl ProlongationStash {
    /// Copy every element that is not a cut parent, the nodes they use and the
    /// locally owned interface facets.
    ///
    /// `step_count` is negative when there is no earlier decomposition to prolong from.
    pub fn capture(mesh: &BulkData, phases: &PhaseSupport, step_count: i32) -> Result<Self, MeshError> {
        let excluded = excluded_fields(phases);
        let parent_field = phases.parent_element_id_field();
        let mut stash = ProlongationStash {
            step_count,
            ..Default::default()
        };

        for key in mesh.keys(EntityRank::Element) {
            if mesh.has_part(key, phases.parent_part()) {
                continue;
            }
            let mut bbox = BoundingBox::empty();
            for &n in mesh.nodes_of(key) {
                let coordinates = mesh.coordinates(n)?;
                bbox.accommodate(&coordinates);
                if !stash.nodes.contains_key(&n) {
                    let fields = stash_fields(mesh, EntityKey::node(n), &excluded);
                    stash.nodes.insert(n, ProlongationNodeData { id: n, coordinates, fields });
                }
            }
            stash.max_element_size = stash.max_element_size.max(bbox.diagonal());
            let parent = mesh
                .field_data(parent_field, key)
                .and_then(|v| EntityId::new(v[0] as u64).ok());
            stash.elements.insert(
                key.id,
                ProlongationElementData {
                    fields: stash_fields(mesh, key, &excluded),
                    measure: entity_measure(mesh, key)?,
                    parent,
                },
            );
        }

        let facet_rank = EntityRank::side_rank(mesh.spatial_dim()).unwrap_or(EntityRank::Node);
        for key in mesh.owned_keys(facet_rank) {
            if !mesh.has_part(key, phases.active_part()) {
                continue;
            }
            if phases.conformal_subset(&mesh.parts_of(key)).len() < 2 {
                continue;
            }
            let nodes: SmallVec<[EntityId; 3]> = match facet_rank {
                EntityRank::Node => SmallVec::from_slice(&[key.id]),
                _ => {
                    let vertices = mesh.topology(key).map_or(0, |t| t.num_vertices());
                    mesh.nodes_of(key).iter().take(vertices).copied().collect()
                }
            };
            if !nodes.is_empty() && nodes.iter().all(|n| stash.nodes.contains_key(n)) {
                stash.facets.push(ProlongationFacet { nodes });
            }
        }

        log::debug!(
            "stashed {} nodes, {} elements and {} facets for prolongation",
            stash.nodes.len(),
            stash.elements.len(),
            stash.facets.len()
        );
        Ok(stash)
    }

    pub fn step_count(&self) -> i32 {
        self.step_count
    }
    pub fn nodes(&self) -> &BTreeMap<EntityId, ProlongationNodeData> {
        &self.nodes
    }
    pub fn elements(&self) -> &BTreeMap<EntityId, ProlongationElementData> {
        &self.elements
    }
    pub fn facets(&self) -> &[ProlongationFacet] {
        &self.facets
    }
    /// Largest element bounding-box diagonal on this rank.
    pub fn max_element_size(&self) -> f64 {
        self.max_element_size
    }

    fn facet_box(&self, facet: &ProlongationFacet) -> BoundingBox {
        let mut bbox = BoundingBox::empty();
        for n in &facet.nodes {
            if let Some(data) = self.nodes.get(n) {
                bbox.accommodate(&data.coordinates);
            }
        }
        bbox
    }
}

/// One facet in a search tree.
struct FacetEntry {
    facet: usize,
    vertices: SmallVec<[Vector3<f64>; 3]>,
}

impl RTreeObject for FacetEntry {
    type Envelope = AABB<[f64; 3]>;

    fn envelope(&self) -> Self::Envelope {
        let mut bbox = BoundingBox::empty();
        for v in &self.vertices {
            bbox.accommodate(v);
        }
        AABB::from_corners(
            [bbox.min.x, bbox.min.y, bbox.min.z],
            [bbox.max.x, bbox.max.y, bbox.max.z],
        )
    }
}

impl PointDistance for FacetEntry {
    fn distance_2(&self, point: &[f64; 3]) -> f64 {
        closest_point(&self.vertices, &Vector3::new(point[0], point[1], point[2])).distance_squared
    }
}

/// Where a node's values come from.
enum NodeSource {
    Facet { facet: usize, projection: FacetProjection },
    Node(EntityId),
    /// A facet with the right fields exists, but only on another rank.
    MissingRemote,
    NotFound,
}

/// Old data visible to this rank in one search round.
struct ProlongationSource<'a> {
    stash: &'a ProlongationStash,
    remote_nodes: BTreeMap<EntityId, ProlongationNodeData>,
    facets: Vec<ProlongationFacet>,
    /// `None` marks a field set some other rank has facets for.
    trees: BTreeMap<FieldSet, Option<RTree<FacetEntry>>>,
}

impl<'a> ProlongationSource<'a> {
    fn local(stash: &'a ProlongationStash) -> Self {
        Self {
            stash,
            remote_nodes: BTreeMap::new(),
            facets: stash.facets.clone(),
            trees: BTreeMap::new(),
        }
    }

    /// Send every rank the stashed nodes inside its box and the facets touching it,
    /// and take in what was sent here. Collective.
    fn gather<C: Communicator>(
        stash: &'a ProlongationStash,
        comm: &C,
        boxes: &[BoundingBox],
    ) -> Result<Self, MeshError> {
        let me = comm.rank();
        let facet_boxes: Vec<BoundingBox> = stash.facets.iter().map(|f| stash.facet_box(f)).collect();
        let mut node_out: BTreeMap<usize, Vec<ProlongationNodeData>> = BTreeMap::new();
        let mut facet_out: BTreeMap<usize, Vec<Vec<EntityId>>> = BTreeMap::new();
        for (p, target) in boxes.iter().enumerate().filter(|(p, _)| *p != me) {
            let mut send: BTreeSet<EntityId> = stash
                .nodes
                .values()
                .filter(|n| target.contains(&n.coordinates))
                .map(|n| n.id)
                .collect();
            for (facet, bbox) in stash.facets.iter().zip(&facet_boxes) {
                if bbox.intersects(target) {
                    facet_out.entry(p).or_default().push(facet.nodes.to_vec());
                    send.extend(facet.nodes.iter().copied());
                }
            }
            if !send.is_empty() {
                node_out.insert(p, send.iter().filter_map(|n| stash.nodes.get(n).cloned()).collect());
            }
        }

        let mut source = Self::local(stash);
        for (_, nodes) in exchange(comm, tags::PROLONG_STASH, &node_out)? {
            for node in nodes {
                if !stash.nodes.contains_key(&node.id) {
                    source.remote_nodes.entry(node.id).or_insert(node);
                }
            }
        }
        let mut seen: BTreeSet<Vec<EntityId>> = stash
            .facets
            .iter()
            .map(|f| sorted(f.nodes.to_vec()))
            .collect();
        for (_, facets) in exchange(comm, tags::PROLONG_FACETS, &facet_out)? {
            for nodes in facets {
                if nodes.iter().all(|n| source.node(*n).is_some()) && seen.insert(sorted(nodes.clone())) {
                    source.facets.push(ProlongationFacet { nodes: nodes.into_iter().collect() });
                }
            }
        }
        Ok(source)
    }

    fn node(&self, id: EntityId) -> Option<&ProlongationNodeData> {
        self.stash.nodes.get(&id).or_else(|| self.remote_nodes.get(&id))
    }

    fn nodes(&self) -> impl Iterator<Item = &ProlongationNodeData> + '_ {
        self.stash.nodes.values().chain(self.remote_nodes.values())
    }

    /// One tree per facet field set, plus empty markers for the sets other ranks have.
    /// Collective.
    fn build_trees<C: Communicator>(&mut self, comm: &C) -> Result<(), MeshError> {
        let mut grouped: BTreeMap<FieldSet, Vec<FacetEntry>> = BTreeMap::new();
        for (i, facet) in self.facets.iter().enumerate() {
            let data: Vec<&ProlongationNodeData> = facet.nodes.iter().filter_map(|n| self.node(*n)).collect();
            if data.len() != facet.nodes.len() {
                continue;
            }
            let set: FieldSet = data[0]
                .field_set()
                .into_iter()
                .filter(|f| data[1..].iter().all(|d| d.fields.contains_key(f)))
                .collect();
            grouped.entry(set).or_default().push(FacetEntry {
                facet: i,
                vertices: data.iter().map(|d| d.coordinates).collect(),
            });
        }

        let local: Vec<Vec<u32>> = grouped.keys().map(|s| s.iter().map(|f| f.0).collect()).collect();
        let global = all_gather(comm, tags::PROLONG_FIELD_SETS, &local)?;
        self.trees = grouped
            .into_iter()
            .map(|(set, entries)| (set, Some(RTree::bulk_load(entries))))
            .collect();
        for set in global.into_iter().flatten() {
            self.trees.entry(set.into_iter().map(FieldId).collect()).or_insert(None);
        }
        Ok(())
    }

    /// Best source for a node at `x`. With `last` set a facet only held elsewhere no
    /// longer blocks the nearest node fallback.
    fn find(&self, x: &Vector3<f64>, required: &[FieldId], last: bool) -> NodeSource {
        let point = [x.x, x.y, x.z];
        let mut best: Option<(usize, FacetProjection)> = None;
        let mut matching_empty_tree = false;
        for (set, tree) in &self.trees {
            if !covers(set, required) {
                continue;
            }
            let Some(tree) = tree else {
                matching_empty_tree = true;
                continue;
            };
            let Some(entry) = tree.nearest_neighbor(&point) else {
                continue;
            };
            let projection = closest_point(&entry.vertices, x);
            if best.as_ref().is_none_or(|(_, b)| projection.distance_squared < b.distance_squared) {
                best = Some((entry.facet, projection));
            }
        }
        if let Some((facet, projection)) = best {
            return NodeSource::Facet { facet, projection };
        }
        if matching_empty_tree && !last {
            return NodeSource::MissingRemote;
        }

        let mut closest: Option<(f64, EntityId)> = None;
        for node in self.nodes().filter(|n| n.covers(required)) {
            let d2 = (node.coordinates - x).norm_squared();
            if closest.is_none_or(|(c, _)| d2 < c) {
                closest = Some((d2, node.id));
            }
        }
        closest.map_or(NodeSource::NotFound, |(_, id)| NodeSource::Node(id))
    }

    /// Values of `required` at the source, and the point they were taken at.
    fn values(&self, source: &NodeSource, required: &[FieldId]) -> Option<(FieldValues, Vector3<f64>)> {
        match source {
            NodeSource::Facet { facet, projection } => {
                let data: Vec<&ProlongationNodeData> = self.facets[*facet]
                    .nodes
                    .iter()
                    .map(|n| self.node(*n))
                    .collect::<Option<_>>()?;
                let mut out = FieldValues::new();
                for f in required {
                    let mut sum = vec![0.0; data[0].fields.get(f)?.len()];
                    for (d, w) in data.iter().zip(&projection.weights) {
                        for (s, v) in sum.iter_mut().zip(d.fields.get(f)?) {
                            *s += w * v;
                        }
                    }
                    out.insert(*f, sum);
                }
                Some((out, projection.point))
            }
            NodeSource::Node(id) => {
                let data = self.node(*id)?;
                let out = required
                    .iter()
                    .map(|f| Some((*f, data.fields.get(f)?.clone())))
                    .collect::<Option<FieldValues>>()?;
                Some((out, data.coordinates))
            }
            NodeSource::MissingRemote | NodeSource::NotFound => None,
        }
    }
}

fn sorted(mut v: Vec<EntityId>) -> Vec<EntityId> {
    v.sort_unstable();
    v
}

fn covers(set: &[FieldId], required: &[FieldId]) -> bool {
    required.iter().all(|f| set.binary_search(f).is_ok())
}

fn write_values(mesh: &mut BulkData, key: EntityKey, values: &FieldValues) {
    for (field, v) in values {
        if let Some(slot) = mesh.field_data_mut(*field, key) {
            if slot.len() == v.len() {
                slot.copy_from_slice(v);
            }
        }
    }
}

fn field_names(meta: &MetaData, fields: &[FieldId]) -> String {
    let names: Vec<&str> = fields.iter().map(|f| meta.field(*f).name.as_str()).collect();
    format!("{{ {} }}", names.join(" "))
}

/// What prolongation did on this rank.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProlongationReport {
    pub nodes_copied: usize,
    pub nodes_from_facets: usize,
    pub nodes_from_nodes: usize,
    pub nodes_missing: usize,
    /// Derived nodes whose interpolation fields came from their stencil.
    pub nodes_interpolated: usize,
    pub elements: usize,
    pub rounds: usize,
    pub padding: f64,
}

#[derive(Default)]
struct RoundOutcome {
    copied: usize,
    from_facets: usize,
    from_nodes: usize,
    missing_remote: bool,
    not_found: Vec<(EntityId, FieldSet)>,
    max_displacement: f64,
}

/// Fill node and element fields of the freshly modified mesh from `stash`. Collective.
pub fn prolongate<C: Communicator>(
    cd: &mut CDMesh,
    mesh: &mut BulkData,
    phases: &PhaseSupport,
    stash: &ProlongationStash,
    comm: &C,
    options: &CdfemOptions,
) -> Result<ProlongationReport, MeshError> {
    options.validate()?;
    let excluded = excluded_fields(phases);
    let interpolated = options.interpolation_field_ids(mesh.meta())?;
    let targets: Vec<(NodeIdx, EntityId, Vector3<f64>)> = cd
        .arena()
        .iter()
        .filter_map(|(idx, n)| Some((idx, n.entity()?, *n.coordinates())))
        .filter(|(_, id, _)| mesh.has_part(EntityKey::node(*id), phases.active_part()))
        .collect();

    let mut target_box = BoundingBox::empty();
    for (_, _, x) in &targets {
        target_box.accommodate(x);
    }
    if targets.is_empty() {
        target_box.accommodate(&Vector3::zeros());
    }

    let guess_and_check = stash.step_count() >= 0 && comm.size() > 1;
    let mut padding = if guess_and_check {
        options.padding_multiplier * all_reduce_max_f64(comm, tags::COLLECTIVE, stash.max_element_size())?
    } else {
        EPSILON_PADDING
    };
    target_box.pad(padding);

    let mut report = ProlongationReport::default();
    let outcome = loop {
        report.rounds += 1;
        let boxes = all_gather(comm, tags::PROLONG_BOXES, &target_box)?;
        let mut source = ProlongationSource::gather(stash, comm, &boxes)?;
        source.build_trees(comm)?;

        let last = !guess_and_check || report.rounds >= options.max_padding_rounds;
        let outcome = prolongate_nodes(cd, mesh, &source, &targets, &excluded, &interpolated, last);
        let missing_remote = all_reduce_or(comm, tags::COLLECTIVE, outcome.missing_remote)?;
        let displacement = all_reduce_max_f64(comm, tags::COLLECTIVE, outcome.max_displacement)?;
        let retry = guess_and_check && (missing_remote || displacement > padding);
        if !retry {
            break outcome;
        }
        if last {
            log::warn!(
                "prolongation padding {padding:.3e} still short after {} rounds (displacement {displacement:.3e})",
                report.rounds
            );
            break outcome;
        }
        let grown = options.padding_growth * displacement.max(padding);
        log::debug!("must redo prolongation ghosting, padding {padding:.3e} -> {grown:.3e}");
        target_box.pad(grown - padding);
        padding = grown;
        for (idx, _, _) in &targets {
            cd.arena_mut().set_prolonged(*idx, false);
        }
    };

    for (id, required) in &outcome.not_found {
        let key = EntityKey::node(*id);
        let parts: Vec<&str> = mesh.parts_of(key).iter().map(|p| mesh.meta().part_name(*p)).collect();
        let failed: Vec<String> = stash_tree_sets(stash)
            .iter()
            .filter(|s| !covers(s, required))
            .map(|s| field_names(mesh.meta(), s))
            .collect();
        log::warn!(
            "no prolongation source for node {id} with fields {}; parts {parts:?}, elements {:?}, facet field sets without them {failed:?}",
            field_names(mesh.meta(), required),
            mesh.node_elements(*id),
        );
    }

    report.nodes_copied = outcome.copied;
    report.nodes_from_facets = outcome.from_facets;
    report.nodes_from_nodes = outcome.from_nodes;
    report.nodes_missing = outcome.not_found.len();
    report.nodes_interpolated = interpolate_from_stencils(cd, mesh, &targets, &interpolated);
    report.padding = padding;
    report.elements = prolongate_elements(cd, mesh, stash, &excluded);
    log::debug!("prolongation on rank {}: {report:?}", comm.rank());
    Ok(report)
}

/// Field sets of the local facets, for diagnostics.
fn stash_tree_sets(stash: &ProlongationStash) -> BTreeSet<FieldSet> {
    stash
        .facets
        .iter()
        .filter_map(|f| {
            let data: Vec<&ProlongationNodeData> = f.nodes.iter().filter_map(|n| stash.nodes.get(n)).collect();
            let first = data.first()?;
            Some(
                first
                    .field_set()
                    .into_iter()
                    .filter(|field| data.iter().all(|d| d.fields.contains_key(field)))
                    .collect(),
            )
        })
        .collect()
}

fn prolongate_nodes(
    cd: &mut CDMesh,
    mesh: &mut BulkData,
    source: &ProlongationSource<'_>,
    targets: &[(NodeIdx, EntityId, Vector3<f64>)],
    excluded: &[FieldId],
    interpolated: &[FieldId],
    last: bool,
) -> RoundOutcome {
    let mut outcome = RoundOutcome::default();
    let mut pending = Vec::new();
    for &(idx, id, x) in targets {
        if cd.arena().get(idx).is_prolonged() {
            continue;
        }
        let key = EntityKey::node(id);
        let mut required = required_fields(mesh, key, excluded);
        if cd.arena().kind(idx) != NodeKind::Mesh {
            required.retain(|f| !interpolated.contains(f));
        }
        if required.is_empty() {
            cd.arena_mut().set_prolonged(idx, true);
            continue;
        }

        if let Some(own) = source.node(id).filter(|d| d.covers(&required)) {
            let values: FieldValues = required
                .iter()
                .filter_map(|f| Some((*f, own.fields.get(f)?.clone())))
                .collect();
            outcome.max_displacement = outcome.max_displacement.max((x - own.coordinates).norm());
            write_values(mesh, key, &values);
            outcome.copied += 1;
            cd.arena_mut().set_prolonged(idx, true);
            continue;
        }

        pending.push((idx, id, x, required));
    }

    let found = find_all(source, &pending, last);
    for ((idx, id, x, required), found) in pending.into_iter().zip(found) {
        if matches!(found, NodeSource::MissingRemote) {
            outcome.missing_remote = true;
            continue;
        }
        // a source that cannot produce every field counts as none
        let Some((values, at)) = source.values(&found, &required) else {
            outcome.not_found.push((id, required));
            continue;
        };
        match found {
            NodeSource::Facet { .. } => outcome.from_facets += 1,
            _ => outcome.from_nodes += 1,
        }
        outcome.max_displacement = outcome.max_displacement.max((x - at).norm());
        write_values(mesh, EntityKey::node(id), &values);
        cd.arena_mut().set_prolonged(idx, true);
    }
    outcome
}

/// Interpolation fields of derived nodes, weighted from the parent mesh nodes of their
/// stencil. Returns the number of nodes written.
fn interpolate_from_stencils(
    cd: &CDMesh,
    mesh: &mut BulkData,
    targets: &[(NodeIdx, EntityId, Vector3<f64>)],
    fields: &[FieldId],
) -> usize {
    if fields.is_empty() {
        return 0;
    }
    let mut count = 0;
    for &(idx, id, _) in targets {
        if cd.arena().kind(idx) == NodeKind::Mesh {
            continue;
        }
        let key = EntityKey::node(id);
        let stencil = cd.arena().stencil(idx);
        let mut values = FieldValues::new();
        for &field in fields {
            let Some(len) = mesh.field_data(field, key).map(<[f64]>::len) else {
                continue;
            };
            let mut sum = vec![0.0; len];
            let mut complete = true;
            for (parent, w) in &stencil {
                match mesh.field_data(field, EntityKey::node(*parent)) {
                    Some(v) if v.len() == len => sum.iter_mut().zip(v).for_each(|(s, v)| *s += w * v),
                    _ => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                values.insert(field, sum);
            } else {
                log::warn!(
                    "node {id}: parent nodes lack {}, left unset",
                    mesh.meta().field(field).name
                );
            }
        }
        if !values.is_empty() {
            write_values(mesh, key, &values);
            count += 1;
        }
    }
    count
}

type PendingNode = (NodeIdx, EntityId, Vector3<f64>, FieldSet);

#[cfg(feature = "rayon")]
fn find_all(source: &ProlongationSource<'_>, pending: &[PendingNode], last: bool) -> Vec<NodeSource> {
    use rayon::prelude::*;
    pending.par_iter().map(|(_, _, x, required)| source.find(x, required, last)).collect()
}

#[cfg(not(feature = "rayon"))]
fn find_all(source: &ProlongationSource<'_>, pending: &[PendingNode], last: bool) -> Vec<NodeSource> {
    pending.iter().map(|(_, _, x, required)| source.find(x, required, last)).collect()
}

/// Measure-weighted average of `children`, field by field.
fn weighted_average(children: &[&ProlongationElementData]) -> Option<FieldValues> {
    if children.is_empty() {
        return None;
    }
    let mut sums: BTreeMap<FieldId, (Vec<f64>, f64)> = BTreeMap::new();
    for child in children {
        for (field, values) in &child.fields {
            let (sum, weight) = sums
                .entry(*field)
                .or_insert_with(|| (vec![0.0; values.len()], 0.0));
            if sum.len() != values.len() {
                continue;
            }
            sum.iter_mut().zip(values).for_each(|(s, v)| *s += child.measure * v);
            *weight += child.measure;
        }
    }
    Some(
        sums.into_iter()
            .filter(|(_, (_, w))| *w > 0.0)
            .map(|(f, (sum, w))| (f, sum.into_iter().map(|s| s / w).collect()))
            .collect(),
    )
}

/// Element fields: an element keeps its own stash; a new child takes its parent's
/// values, or the average of the parent's previous children; a parent that is whole
/// again takes the average of its previous children.
fn prolongate_elements(cd: &CDMesh, mesh: &mut BulkData, stash: &ProlongationStash, excluded: &[FieldId]) -> usize {
    let mut old_children: BTreeMap<EntityId, Vec<&ProlongationElementData>> = BTreeMap::new();
    for data in stash.elements.values() {
        if let Some(parent) = data.parent {
            old_children.entry(parent).or_default().push(data);
        }
    }

    let mut count = 0;
    for element in cd.elements() {
        let averaged = old_children.get(&element.entity()).and_then(|c| weighted_average(c));
        for leaf in element.leaves() {
            let Some(id) = leaf.entity() else {
                continue;
            };
            let key = EntityKey::element(id);
            let required = required_fields(mesh, key, excluded);
            if required.is_empty() {
                continue;
            }
            let source = stash
                .elements
                .get(&id)
                .or_else(|| stash.elements.get(&element.entity()))
                .map(|d| &d.fields)
                .or(averaged.as_ref());
            let Some(source) = source else {
                log::debug!("no prolongation source for element {id}");
                continue;
            };
            let values: FieldValues = required
                .iter()
                .filter_map(|f| Some((*f, source.get(f)?.clone())))
                .collect();
            write_values(mesh, key, &values);
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::cdfem::mutation::modify_mesh;
    use crate::cdfem::phase::PhaseSupportConfig;
    use crate::geometry::interface::{AnalyticGeometry, LevelSet, SurfaceId};
    use crate::mesh::meta::MetaData;
    use crate::mesh_generation::{DEFAULT_BLOCK, Partition, triangle_mesh};
    use crate::topology::periodic::PeriodicNodeMap;
    use approx::assert_relative_eq;

    fn id(n: u64) -> EntityId {
        EntityId::new(n).unwrap()
    }

    fn node(n: u64, x: [f64; 3], fields: &[(FieldId, f64)]) -> ProlongationNodeData {
        ProlongationNodeData {
            id: id(n),
            coordinates: Vector3::from(x),
            fields: fields.iter().map(|(f, v)| (*f, vec![*v])).collect(),
        }
    }

    const T: FieldId = FieldId(1);
    const WALL: FieldId = FieldId(2);
    const FLUX: FieldId = FieldId(3);

    /// Facet 2-3 on x = 1 carrying only T; node 1 at the origin also carries WALL.
    fn hand_stash() -> ProlongationStash {
        let mut stash = ProlongationStash::default();
        for n in [
            node(1, [0.0, 0.0, 0.0], &[(T, 5.0), (WALL, 7.0)]),
            node(2, [1.0, 0.0, 0.0], &[(T, 1.0)]),
            node(3, [1.0, 1.0, 0.0], &[(T, 3.0)]),
        ] {
            stash.nodes.insert(n.id, n);
        }
        stash.facets.push(ProlongationFacet { nodes: SmallVec::from_slice(&[id(2), id(3)]) });
        stash
    }

    #[test]
    fn facet_is_preferred_when_it_carries_the_fields() {
        let stash = hand_stash();
        let mut source = ProlongationSource::local(&stash);
        source.build_trees(&NoComm).unwrap();
        let x = Vector3::new(0.9, 0.25, 0.0);
        let found = source.find(&x, &[T], false);
        assert!(matches!(found, NodeSource::Facet { .. }));
        let (values, at) = source.values(&found, &[T]).unwrap();
        assert_relative_eq!(values[&T][0], 1.5, epsilon = 1e-12);
        assert_relative_eq!(at, Vector3::new(1.0, 0.25, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn field_set_mismatch_falls_back_to_nearest_node() {
        let stash = hand_stash();
        let mut source = ProlongationSource::local(&stash);
        source.build_trees(&NoComm).unwrap();
        // right next to the facet, but the facet lacks WALL
        let x = Vector3::new(0.9, 0.25, 0.0);
        let found = source.find(&x, &[T, WALL], false);
        assert!(matches!(found, NodeSource::Node(n) if n == id(1)));
        let (values, _) = source.values(&found, &[T, WALL]).unwrap();
        assert_eq!(values[&WALL], vec![7.0]);
        assert!(matches!(source.find(&x, &[FLUX], false), NodeSource::NotFound));
    }

    #[test]
    fn remote_only_field_set_is_reported_missing() {
        let stash = hand_stash();
        let mut source = ProlongationSource::local(&stash);
        source.build_trees(&NoComm).unwrap();
        source.trees.insert(vec![T, FLUX], None);
        let x = Vector3::new(0.5, 0.5, 0.0);
        assert!(matches!(source.find(&x, &[FLUX], false), NodeSource::MissingRemote));
    }

    #[test]
    fn last_round_falls_back_past_remote_facets() {
        let mut stash = hand_stash();
        let n = node(4, [0.0, 1.0, 0.0], &[(T, 2.0), (FLUX, -1.0)]);
        stash.nodes.insert(n.id, n);
        let mut source = ProlongationSource::local(&stash);
        source.build_trees(&NoComm).unwrap();
        source.trees.insert(vec![T, FLUX], None);
        let x = Vector3::new(0.5, 0.5, 0.0);
        assert!(matches!(source.find(&x, &[FLUX], false), NodeSource::MissingRemote));
        let found = source.find(&x, &[FLUX], true);
        assert!(matches!(found, NodeSource::Node(n) if n == id(4)));
        assert_eq!(source.values(&found, &[FLUX]).unwrap().0[&FLUX], vec![-1.0]);
        // nothing carries WALL and FLUX together
        assert!(matches!(source.find(&x, &[WALL, FLUX], true), NodeSource::NotFound));
    }

    #[test]
    fn sources_without_values_count_as_not_found() {
        let mut stash = hand_stash();
        // a facet naming a node nobody holds
        stash.facets.push(ProlongationFacet { nodes: SmallVec::from_slice(&[id(2), id(9)]) });
        let source = ProlongationSource::local(&stash);
        let dangling = NodeSource::Facet {
            facet: 1,
            projection: closest_point(&[Vector3::zeros(), Vector3::x()], &Vector3::zeros()),
        };
        assert!(source.values(&dangling, &[T]).is_none());
        assert!(source.values(&NodeSource::Node(id(9)), &[T]).is_none());
    }

    #[test]
    fn node_data_round_trips() {
        let data = node(4, [0.5, 0.25, 0.0], &[(T, 2.0), (FLUX, -1.0)]);
        let mut buf = BytesMut::new();
        data.pack(&mut buf);
        assert_eq!(ProlongationNodeData::unpack(&mut buf.freeze()).unwrap(), data);
    }

    #[test]
    fn averages_are_measure_weighted() {
        let a = ProlongationElementData {
            fields: BTreeMap::from([(T, vec![1.0])]),
            measure: 3.0,
            parent: Some(id(1)),
        };
        let b = ProlongationElementData {
            fields: BTreeMap::from([(T, vec![5.0])]),
            measure: 1.0,
            parent: Some(id(1)),
        };
        assert_relative_eq!(weighted_average(&[&a, &b]).unwrap()[&T][0], 2.0);
        assert!(weighted_average(&[]).is_none());
    }

    struct Strip {
        mesh: BulkData,
        phases: PhaseSupport,
        temperature: FieldId,
        heat: FieldId,
    }

    /// 4x2 strip with a nodal field `x + 2y` and an element field equal to the id.
    fn strip() -> Strip {
        let mut mesh = triangle_mesh(MetaData::new(2), 4, 2, 1.0, 0.5, Partition::serial(), Default::default())
            .unwrap()
            .mesh;
        let config = PhaseSupportConfig::two_phase(DEFAULT_BLOCK, SurfaceId(0));
        let phases = PhaseSupport::declare(mesh.meta_mut(), &config).unwrap();
        let temperature = mesh.meta_mut().declare_field("temperature", EntityRank::Node, 1);
        let heat = mesh.meta_mut().declare_field("heat", EntityRank::Element, 1);
        mesh.modification_begin().unwrap();
        mesh.modification_end().unwrap();
        let nodes: Vec<EntityKey> = mesh.keys(EntityRank::Node).collect();
        for k in nodes {
            let x = mesh.coordinates(k.id).unwrap();
            mesh.field_data_mut(temperature, k).unwrap()[0] = x.x + 2.0 * x.y;
        }
        let elements: Vec<EntityKey> = mesh.keys(EntityRank::Element).collect();
        for k in elements {
            mesh.field_data_mut(heat, k).unwrap()[0] = k.id.get() as f64;
        }
        Strip { mesh, phases, temperature, heat }
    }

    fn step(s: &mut Strip, offset: f64, step_count: i32) -> (CDMesh, ProlongationReport) {
        step_with(s, offset, step_count, &CdfemOptions::default())
    }

    fn step_with(s: &mut Strip, offset: f64, step_count: i32, options: &CdfemOptions) -> (CDMesh, ProlongationReport) {
        let geometry = AnalyticGeometry::new(vec![LevelSet::Plane { normal: [1.0, 0.0, 0.0], offset }]);
        let stash = ProlongationStash::capture(&s.mesh, &s.phases, step_count).unwrap();
        let mut cd = CDMesh::new(2, step_count);
        cd.generate_nonconformal_elements(&s.mesh, &s.phases).unwrap();
        cd.decompose(&s.mesh, &geometry, &NoComm, &PeriodicNodeMap::new()).unwrap();
        modify_mesh(&mut cd, &mut s.mesh, &s.phases, &NoComm, options, None).unwrap();
        let report = prolongate(&mut cd, &mut s.mesh, &s.phases, &stash, &NoComm, options).unwrap();
        (cd, report)
    }

    fn crossing_nodes(s: &Strip) -> Vec<EntityKey> {
        s.mesh
            .keys(EntityRank::Node)
            .filter(|k| s.mesh.has_part(*k, s.phases.child_edge_node_part()))
            .collect()
    }

    #[test]
    fn first_cut_takes_nearest_old_nodes() {
        let mut s = strip();
        let (cd, report) = step(&mut s, 0.3, -1);
        assert_eq!(report.rounds, 1);
        assert_eq!(report.nodes_missing, 0);
        assert_eq!(report.nodes_from_facets, 0);
        assert_eq!(report.nodes_from_nodes, crossing_nodes(&s).len());
        assert!(cd.arena().iter().filter(|(_, n)| n.entity().is_some()).all(|(_, n)| n.is_prolonged()));
        for k in crossing_nodes(&s) {
            let x = s.mesh.coordinates(k.id).unwrap();
            let t = s.mesh.field_data(s.temperature, k).unwrap()[0];
            if x.y == 0.0 {
                assert_relative_eq!(t, 0.25);
            }
        }
        let corner = s.mesh.keys(EntityRank::Node).next().unwrap();
        assert_eq!(s.mesh.field_data(s.temperature, corner).unwrap()[0], 0.0);
    }

    #[test]
    fn interpolation_fields_follow_the_stencil() {
        let mut s = strip();
        let options = CdfemOptions { interpolation_fields: vec!["temperature".into()], ..CdfemOptions::default() };
        let (_, report) = step_with(&mut s, 0.3, -1, &options);
        let crossing = crossing_nodes(&s);
        assert_eq!(report.nodes_interpolated, crossing.len());
        assert_eq!(report.nodes_from_nodes, 0);
        assert_eq!(report.nodes_missing, 0);
        for k in crossing {
            let x = s.mesh.coordinates(k.id).unwrap();
            let t = s.mesh.field_data(s.temperature, k).unwrap()[0];
            assert_relative_eq!(t, x.x + 2.0 * x.y, epsilon = 1e-12);
            if x.y == 0.0 {
                assert_relative_eq!(t, 0.3, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn invalid_options_are_refused() {
        let mut s = strip();
        let stash = ProlongationStash::capture(&s.mesh, &s.phases, -1).unwrap();
        let mut cd = CDMesh::new(2, -1);
        let options = CdfemOptions { padding_growth: 1.0, ..CdfemOptions::default() };
        let err = prolongate(&mut cd, &mut s.mesh, &s.phases, &stash, &NoComm, &options).unwrap_err();
        assert!(matches!(err, MeshError::Config(_)));
    }

    #[test]
    fn moved_interface_interpolates_from_old_facets() {
        let mut s = strip();
        step(&mut s, 0.3, -1);
        let (_, report) = step(&mut s, 0.7, 1);
        assert_eq!(report.nodes_missing, 0);
        assert_eq!(report.nodes_from_facets, crossing_nodes(&s).len());
        // the old crossing nodes on x = 0.3 took values between 0.25 and 1.25
        for k in crossing_nodes(&s) {
            let t = s.mesh.field_data(s.temperature, k).unwrap()[0];
            assert!((0.25 - 1e-12..=1.25 + 1e-12).contains(&t), "T = {t}");
        }
    }

    #[test]
    fn element_fields_follow_parents() {
        let mut s = strip();
        let (cd, report) = step(&mut s, 0.3, -1);
        assert_eq!(report.elements, cd.elements().iter().map(|e| e.leaves().len()).sum::<usize>());
        for e in cd.elements().iter().filter(|e| e.is_cut()) {
            for leaf in e.leaves() {
                let key = EntityKey::element(leaf.entity().unwrap());
                assert_eq!(s.mesh.field_data(s.heat, key).unwrap()[0], e.entity().get() as f64);
            }
        }
        let (cd, _) = step(&mut s, 0.7, 1);
        // parents cut at 0.3 are whole again and average their equal-valued children
        for e in cd.elements().iter().filter(|e| !e.is_cut()) {
            let key = EntityKey::element(e.entity());
            assert_relative_eq!(s.mesh.field_data(s.heat, key).unwrap()[0], e.entity().get() as f64);
        }
    }
}
