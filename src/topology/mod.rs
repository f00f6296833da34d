//! Entity identities, element topologies and parallel sharing records.
//!
//! - [`entity`]: `EntityId`, `EntityRank`, `EntityKey`
//! - [`cell_topology`]: vertex, edge and side tables of the supported cells
//! - [`entity_comm`]: which ranks share or ghost each entity
//! - [`periodic`]: node identification across periodic boundaries

pub mod cell_topology;
pub mod entity;
pub mod entity_comm;
pub mod periodic;

pub use cell_topology::CellTopology;
pub use entity::{EntityId, EntityKey, EntityRank};
