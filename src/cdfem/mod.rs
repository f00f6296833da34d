//! Conformal decomposition of a background mesh cut by level-set interfaces.
//!
//! One step runs bottom-up through the submodules:
//!
//! - [`node`], [`ancestry`]: the arena of sub-element nodes and their rank-independent
//!   names
//! - [`element`]: cutting one background element into phase-pure subelements
//! - [`sync`]: keeping signs, scores and crossing nodes identical on every rank
//! - [`cdmesh`]: one decomposition snapshot of the whole local mesh
//! - [`mutation`]: writing the snapshot into the mesh database
//! - [`prolongation`]: carrying field values over from the previous snapshot
//! - [`manager`]: the per-step driver the application calls
//! - [`diagnostics`]: element quality and interface CFL after a cut
//!
//! [`phase`] and [`options`] hold the part layout and the tunables.

pub mod ancestry;
pub mod cdmesh;
pub mod diagnostics;
pub mod element;
pub mod manager;
pub mod mutation;
pub mod node;
pub mod options;
pub mod phase;
pub mod prolongation;
pub mod sync;

pub use ancestry::NodeAncestry;
pub use cdmesh::{CDMesh, DEFAULT_SNAP_TOLERANCE, entity_measure};
pub use diagnostics::{CflLengthScale, interface_velocity_cfl, quality_after_cut};
pub use element::{ElementStage, MeshElement, SubElement};
pub use manager::{DecompositionStatus, SnapshotManager};
pub use mutation::{MutationReport, check_element_side_parts, modify_mesh, update_element_side_parts};
pub use node::{NodeArena, NodeIdx, NodeKind, NodeVariant, SubElementNode};
pub use options::CdfemOptions;
pub use phase::{PhaseSupport, PhaseSupportConfig};
pub use prolongation::{ProlongationReport, ProlongationStash, prolongate};
