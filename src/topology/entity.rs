//! `EntityId`, `EntityRank` and `EntityKey`: global handles for mesh entities.
//!
//! An [`EntityKey`] is the pair (rank, id) that identifies an entity across all
//! processes. Ids are non-zero so `0` can never alias a valid entity on the wire.

use crate::mesh_error::MeshError;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use std::{fmt, num::NonZeroU64};

/// Global identifier of an entity within one rank class (nodes, edges, ...).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EntityId(NonZeroU64);

assert_eq_size!(EntityId, u64);
assert_eq_size!(Option<EntityId>, u64);

impl EntityId {
    /// Creates a new `EntityId`, rejecting zero.
    #[inline]
    pub fn new(raw: u64) -> Result<Self, MeshError> {
        NonZeroU64::new(raw)
            .map(EntityId)
            .ok_or(MeshError::InvalidEntityId)
    }

    /// Raw `u64` value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.get())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Topological rank of an entity.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum EntityRank {
    Node = 0,
    Edge = 1,
    Face = 2,
    Element = 3,
}

impl EntityRank {
    /// Rank of element sides for a mesh of the given spatial dimension.
    ///
    /// One-dimensional meshes carry no side entities.
    pub fn side_rank(spatial_dim: usize) -> Option<EntityRank> {
        match spatial_dim {
            2 => Some(EntityRank::Edge),
            3 => Some(EntityRank::Face),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Result<Self, MeshError> {
        match raw {
            0 => Ok(EntityRank::Node),
            1 => Ok(EntityRank::Edge),
            2 => Ok(EntityRank::Face),
            3 => Ok(EntityRank::Element),
            other => Err(MeshError::Wire(format!("invalid entity rank {other}"))),
        }
    }
}

/// (rank, id) pair; ordered by rank first.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EntityKey {
    pub rank: EntityRank,
    pub id: EntityId,
}

impl EntityKey {
    pub const fn new(rank: EntityRank, id: EntityId) -> Self {
        Self { rank, id }
    }

    pub const fn node(id: EntityId) -> Self {
        Self::new(EntityRank::Node, id)
    }

    pub const fn element(id: EntityId) -> Self {
        Self::new(EntityRank::Element, id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = match self.rank {
            EntityRank::Node => "node",
            EntityRank::Edge => "edge",
            EntityRank::Face => "face",
            EntityRank::Element => "elem",
        };
        write!(f, "{r}[{}]", self.id)
    }
}
