//! Phase bookkeeping: which blocks are decomposed and the parts that record it.
//!
//! For every decomposed block `B` and every phase `P` configured on it a conformal part
//! `B_P` is declared. Each unordered pair of phases on a block gets an interface part
//! `surface_B_P_Q`. The block part itself doubles as the nonconformal part holding
//! parent elements. Attribute parts mark active, parent and child entities.

use crate::geometry::interface::{PhaseTag, SurfaceId};
use crate::mesh::meta::{FieldId, MetaData, PartId};
use crate::mesh_error::MeshError;
use crate::topology::entity::EntityRank;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const ACTIVE_PART: &str = "cdfem_active";
pub const PARENT_PART: &str = "cdfem_parent";
pub const CHILD_PART: &str = "cdfem_child";
pub const CHILD_EDGE_NODE_PART: &str = "cdfem_child_edge_node";
pub const BLOCK_BOUNDARY_PART: &str = "cdfem_block_boundary";
pub const PARENT_NODE_IDS_FIELD: &str = "cdfem_parent_node_ids";
pub const PARENT_ELEMENT_ID_FIELD: &str = "cdfem_parent_element_id";

/// Components of the parent node id field: both parents and the creation rule.
pub const PARENT_NODE_IDS_COMPONENTS: usize = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    /// `(surface, sign)` pairs a subelement must carry to be in this phase.
    pub signs: Vec<(SurfaceId, i8)>,
}

impl PhaseConfig {
    pub fn tag(&self) -> PhaseTag {
        self.signs
            .iter()
            .fold(PhaseTag::new(), |tag, (s, v)| tag.with(*s, *v))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    pub name: String,
    pub phases: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseSupportConfig {
    pub phases: Vec<PhaseConfig>,
    pub blocks: Vec<BlockConfig>,
}

impl PhaseSupportConfig {
    /// Block `block` split by the sign of `surface` into phases `A` (negative) and `B`.
    pub fn two_phase(block: &str, surface: SurfaceId) -> Self {
        Self {
            phases: vec![
                PhaseConfig { name: "A".into(), signs: vec![(surface, -1)] },
                PhaseConfig { name: "B".into(), signs: vec![(surface, 1)] },
            ],
            blocks: vec![BlockConfig {
                name: block.into(),
                phases: vec!["A".into(), "B".into()],
            }],
        }
    }
}

#[derive(Clone, Debug)]
struct DecomposedBlock {
    name: String,
    /// `(phase index, conformal part)` in configuration order.
    conformal: Vec<(usize, PartId)>,
}

#[derive(Clone, Debug)]
pub struct PhaseSupport {
    phases: Vec<(String, PhaseTag)>,
    blocks: BTreeMap<PartId, DecomposedBlock>,
    conformal: BTreeMap<PartId, (PartId, usize)>,
    interfaces: BTreeMap<(PartId, PartId), PartId>,
    interface_parts: BTreeSet<PartId>,
    active: PartId,
    parent: PartId,
    child: PartId,
    child_edge_node: PartId,
    block_boundary: PartId,
    parent_node_ids: FieldId,
    parent_element_id: FieldId,
}

impl PhaseSupport {
    /// Register every part and field the decomposition needs.
    pub fn declare(meta: &mut MetaData, config: &PhaseSupportConfig) -> Result<Self, MeshError> {
        let phases: Vec<(String, PhaseTag)> = config
            .phases
            .iter()
            .map(|p| (p.name.clone(), p.tag()))
            .collect();
        let side_rank = EntityRank::side_rank(meta.spatial_dim()).unwrap_or(EntityRank::Node);

        let mut blocks = BTreeMap::new();
        let mut conformal = BTreeMap::new();
        let mut interfaces = BTreeMap::new();
        let mut interface_parts = BTreeSet::new();
        for block_cfg in &config.blocks {
            let block = meta.require_part(&block_cfg.name)?;
            if meta.part(block).rank != Some(EntityRank::Element) {
                return Err(MeshError::Config(format!(
                    "block `{}` is not an element part",
                    block_cfg.name
                )));
            }
            let mut parts = Vec::with_capacity(block_cfg.phases.len());
            for phase_name in &block_cfg.phases {
                let idx = phases
                    .iter()
                    .position(|(n, _)| n == phase_name)
                    .ok_or_else(|| MeshError::Config(format!("unknown phase `{phase_name}`")))?;
                let part = meta.declare_part(
                    &format!("{}_{}", block_cfg.name, phase_name),
                    Some(EntityRank::Element),
                );
                conformal.insert(part, (block, idx));
                parts.push((idx, part));
            }
            for (i, &(pa, a)) in parts.iter().enumerate() {
                for &(pb, b) in &parts[i + 1..] {
                    let name = format!("surface_{}_{}_{}", block_cfg.name, phases[pa].0, phases[pb].0);
                    let surface = meta.declare_part(&name, Some(side_rank));
                    interfaces.insert((a, b), surface);
                    interfaces.insert((b, a), surface);
                    interface_parts.insert(surface);
                }
            }
            blocks.insert(
                block,
                DecomposedBlock {
                    name: block_cfg.name.clone(),
                    conformal: parts,
                },
            );
        }

        let active = meta.declare_part(ACTIVE_PART, None);
        let parent = meta.declare_part(PARENT_PART, None);
        let child = meta.declare_part(CHILD_PART, None);
        let child_edge_node = meta.declare_part(CHILD_EDGE_NODE_PART, None);
        let block_boundary = meta.declare_part(BLOCK_BOUNDARY_PART, None);
        let parent_node_ids =
            meta.declare_field(PARENT_NODE_IDS_FIELD, EntityRank::Node, PARENT_NODE_IDS_COMPONENTS);
        meta.put_field_on_part(parent_node_ids, child_edge_node);
        let parent_element_id = meta.declare_field(PARENT_ELEMENT_ID_FIELD, EntityRank::Element, 1);
        meta.put_field_on_part(parent_element_id, child);

        Ok(Self {
            phases,
            blocks,
            conformal,
            interfaces,
            interface_parts,
            active,
            parent,
            child,
            child_edge_node,
            block_boundary,
            parent_node_ids,
            parent_element_id,
        })
    }

    pub fn active_part(&self) -> PartId {
        self.active
    }
    pub fn parent_part(&self) -> PartId {
        self.parent
    }
    pub fn child_part(&self) -> PartId {
        self.child
    }
    pub fn child_edge_node_part(&self) -> PartId {
        self.child_edge_node
    }
    pub fn block_boundary_part(&self) -> PartId {
        self.block_boundary
    }
    pub fn parent_node_ids_field(&self) -> FieldId {
        self.parent_node_ids
    }
    pub fn parent_element_id_field(&self) -> FieldId {
        self.parent_element_id
    }

    pub fn decomposed_blocks(&self) -> impl Iterator<Item = PartId> + '_ {
        self.blocks.keys().copied()
    }

    pub fn is_decomposed(&self, block: PartId) -> bool {
        self.blocks.contains_key(&block)
    }

    pub fn block_name(&self, block: PartId) -> Option<&str> {
        self.blocks.get(&block).map(|b| b.name.as_str())
    }

    /// First decomposed block among `parts`.
    pub fn decomposed_block_of<'a>(&self, parts: impl IntoIterator<Item = &'a PartId>) -> Option<PartId> {
        parts.into_iter().copied().find(|p| self.blocks.contains_key(p))
    }

    /// Conformal part of `block` whose configured phase is contained in `phase`.
    pub fn conformal_part(&self, block: PartId, phase: &PhaseTag) -> Option<PartId> {
        self.blocks.get(&block)?.conformal.iter().find_map(|(idx, part)| {
            self.phases[*idx].1.is_subset_of(phase).then_some(*part)
        })
    }

    pub fn conformal_parts(&self, block: PartId) -> Vec<PartId> {
        self.blocks
            .get(&block)
            .map(|b| b.conformal.iter().map(|(_, p)| *p).collect())
            .unwrap_or_default()
    }

    pub fn is_conformal(&self, part: PartId) -> bool {
        self.conformal.contains_key(&part)
    }

    pub fn block_of_conformal(&self, part: PartId) -> Option<PartId> {
        self.conformal.get(&part).map(|(b, _)| *b)
    }

    pub fn phase_of_conformal(&self, part: PartId) -> Option<&PhaseTag> {
        self.conformal.get(&part).map(|(_, i)| &self.phases[*i].1)
    }

    pub fn phase_name(&self, part: PartId) -> Option<&str> {
        self.conformal.get(&part).map(|(_, i)| self.phases[*i].0.as_str())
    }

    pub fn is_interface(&self, part: PartId) -> bool {
        self.interface_parts.contains(&part)
    }

    pub fn interface_parts(&self) -> &BTreeSet<PartId> {
        &self.interface_parts
    }

    /// Interface part between two conformal parts of one block.
    pub fn interface_part(&self, a: PartId, b: PartId) -> Option<PartId> {
        self.interfaces.get(&(a, b)).copied()
    }

    /// Conformal parts among `parts`.
    pub fn conformal_subset<'a>(&self, parts: impl IntoIterator<Item = &'a PartId>) -> BTreeSet<PartId> {
        parts.into_iter().copied().filter(|p| self.is_conformal(*p)).collect()
    }
}
