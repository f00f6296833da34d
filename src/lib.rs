#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-cdfem
//!
//! mesh-cdfem decomposes a distributed simplex mesh conformally along one or more
//! level-set interfaces (CDFEM). Every background element an interface crosses is
//! split into phase-pure subelements whose faces follow the interface, the result is
//! written back into the mesh database as child nodes, child elements and interface
//! sides, and field values are carried over from the previous decomposition.
//!
//! ## Features
//! - Arena of sub-element nodes with deduplicated common children (edge crossings,
//!   midside and interior nodes)
//! - Cutting templates for Line2/3, Triangle3/6 and Tetrahedron4/10 elements
//! - Bit-identical decisions across ranks: signs, crossing scores and crossing nodes are
//!   synchronised by node ancestry, including across periodic boundaries
//! - Two-cycle mesh mutation with entity reuse and interface side-part bookkeeping
//! - Field prolongation through per-field-set facet trees with adaptive ghost padding
//! - Pluggable communication backends (serial, threads as ranks, MPI)
//!
//! ## Determinism
//!
//! Mesh entities are kept in id order and cross-rank merges are commutative (sign
//! disagreement becomes "on interface", scores take the minimum), so the same mesh and
//! geometry produce the same decomposition regardless of message arrival order.
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! mesh-cdfem = "0.3"
//! # features = ["mpi-support"]
//! ```
//!
//! The application owns a [`cdfem::SnapshotManager`] and calls
//! [`decompose_mesh`](cdfem::SnapshotManager::decompose_mesh) once per step; the
//! returned [`cdfem::DecompositionStatus`] says whether coordinates or topology must be
//! re-read.

pub mod algs;
pub mod cdfem;
pub mod debug_invariants;
pub mod geometry;
pub mod mesh;
pub mod mesh_error;
pub mod mesh_generation;
pub mod topology;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, NoComm, RayonComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::cdfem::{
        CDMesh, CdfemOptions, DecompositionStatus, PhaseSupport, PhaseSupportConfig, SnapshotManager,
    };
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::geometry::{AnalyticGeometry, InterfaceGeometry, InterfaceId, LevelSet, PhaseTag, SurfaceId};
    pub use crate::mesh::{BulkData, FieldId, MetaData, PartId};
    pub use crate::mesh_error::MeshError;
    pub use crate::topology::{CellTopology, EntityId, EntityKey, EntityRank};
}
