//! The decomposition driver held by the application.
//!
//! A [`SnapshotManager`] owns the current decomposition. Each call to
//! [`SnapshotManager::decompose_mesh`] builds a fresh snapshot, compares it to the
//! current one and only touches the mesh database when something changed: new
//! topology, or crossing nodes that slid along their edges.

use crate::algs::communicator::Communicator;
use crate::cdfem::cdmesh::CDMesh;
use crate::cdfem::diagnostics::quality_after_cut;
use crate::cdfem::mutation::{MutationReport, modify_mesh};
use crate::cdfem::options::CdfemOptions;
use crate::cdfem::phase::PhaseSupport;
use crate::cdfem::prolongation::{ProlongationReport, ProlongationStash, prolongate};
use crate::geometry::interface::InterfaceGeometry;
use crate::mesh::bulk::BulkData;
use crate::mesh_error::MeshError;
use crate::topology::entity::EntityId;
use crate::topology::periodic::PeriodicNodeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// What a decomposition step did, as seen by downstream consumers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DecompositionStatus(u8);

impl DecompositionStatus {
    pub const COORDINATES_MAY_BE_MODIFIED: Self = Self(1);
    pub const MESH_MODIFIED: Self = Self(2);

    pub const fn empty() -> Self {
        Self(0)
    }
    pub const fn bits(self) -> u8 {
        self.0
    }
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DecompositionStatus {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DecompositionStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for DecompositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::COORDINATES_MAY_BE_MODIFIED) {
            names.push("COORDINATES_MAY_BE_MODIFIED");
        }
        if self.contains(Self::MESH_MODIFIED) {
            names.push("MESH_MODIFIED");
        }
        if names.is_empty() {
            write!(f, "UNCHANGED")
        } else {
            write!(f, "{}", names.join(" | "))
        }
    }
}

#[derive(Debug)]
pub struct SnapshotManager {
    phases: PhaseSupport,
    options: CdfemOptions,
    current: Option<CDMesh>,
    /// Step count of the last decomposition that modified the mesh.
    last_modified_step: Option<i32>,
    last_mutation: Option<MutationReport>,
    last_prolongation: Option<ProlongationReport>,
    last_quality: Option<f64>,
}

impl SnapshotManager {
    pub fn new(phases: PhaseSupport, options: CdfemOptions) -> Result<Self, MeshError> {
        options.validate()?;
        Ok(Self {
            phases,
            options,
            current: None,
            last_modified_step: None,
            last_mutation: None,
            last_prolongation: None,
            last_quality: None,
        })
    }

    pub fn phases(&self) -> &PhaseSupport {
        &self.phases
    }
    pub fn options(&self) -> &CdfemOptions {
        &self.options
    }
    pub fn current(&self) -> Option<&CDMesh> {
        self.current.as_ref()
    }
    pub fn last_mutation(&self) -> Option<&MutationReport> {
        self.last_mutation.as_ref()
    }
    pub fn last_prolongation(&self) -> Option<&ProlongationReport> {
        self.last_prolongation.as_ref()
    }
    /// Worst scaled Jacobian of the active elements after the last rewrite.
    pub fn last_quality(&self) -> Option<f64> {
        self.last_quality
    }

    /// Decompose `mesh` against the current interfaces and, when the result differs
    /// from the current decomposition, rewrite the mesh and prolong fields onto it.
    /// Collective.
    ///
    /// The status always carries [`DecompositionStatus::COORDINATES_MAY_BE_MODIFIED`];
    /// [`DecompositionStatus::MESH_MODIFIED`] is added when entities or their parts
    /// changed.
    pub fn decompose_mesh<G, C>(
        &mut self,
        mesh: &mut BulkData,
        geometry: &mut G,
        comm: &C,
        step_count: i32,
        periodic_pairs: &[(EntityId, EntityId)],
    ) -> Result<DecompositionStatus, MeshError>
    where
        G: InterfaceGeometry + ?Sized,
        C: Communicator,
    {
        geometry.prepare_to_process_elements(step_count);
        let periodic = PeriodicNodeMap::from_pairs(periodic_pairs.iter().copied());

        let mut snapshot = CDMesh::new(mesh.spatial_dim(), step_count);
        snapshot.set_snap_tolerance(self.options.snap_tolerance);
        snapshot.generate_nonconformal_elements(mesh, &self.phases)?;
        snapshot.decompose(mesh, &*geometry, comm, &periodic)?;

        let mut status = DecompositionStatus::COORDINATES_MAY_BE_MODIFIED;
        let topology_changed = snapshot.decomposition_has_changed(self.current.as_ref(), comm)?;
        if topology_changed {
            status |= DecompositionStatus::MESH_MODIFIED;
        } else if !snapshot.coordinates_have_changed(self.current.as_ref(), comm)? {
            log::debug!("step {step_count}: decomposition unchanged");
            return Ok(status);
        }

        let stash_step = if self.current.is_some() { step_count } else { -1 };
        let stash = ProlongationStash::capture(mesh, &self.phases, stash_step)?;
        let mutation = modify_mesh(&mut snapshot, mesh, &self.phases, comm, &self.options, self.current.as_ref())?;
        let prolongation = prolongate(&mut snapshot, mesh, &self.phases, &stash, comm, &self.options)?;
        CDMesh::conformal_volumes_and_surface_areas(mesh, &self.phases, comm)?;
        let quality = quality_after_cut(mesh, &self.phases, comm)?;
        log::debug!(
            "step {step_count}: {status}, {} active interfaces, {mutation:?}",
            snapshot.active_interfaces().len()
        );

        self.current = Some(snapshot);
        self.last_modified_step = Some(step_count);
        self.last_mutation = Some(mutation);
        self.last_prolongation = Some(prolongation);
        self.last_quality = quality;
        Ok(status)
    }

    /// Called when the application repeats `step_count`. If this manager already
    /// decomposed at that step the in-memory snapshot no longer matches the rolled
    /// back mesh, so it is rebuilt from the mesh database. Returns whether it was.
    pub fn handle_possible_failed_time_step(&mut self, mesh: &BulkData, step_count: i32) -> Result<bool, MeshError> {
        if self.last_modified_step != Some(step_count) {
            return Ok(false);
        }
        if !self.options.restore_on_failed_step {
            log::warn!("step {step_count} is repeated but restoring the decomposition is disabled");
            return Ok(false);
        }
        let restored = CDMesh::restore_from_mesh(mesh, &self.phases, step_count)?;
        log::info!(
            "step {step_count} is repeated, restored {} elements from the mesh",
            restored.elements().len()
        );
        self.current = Some(restored);
        self.last_modified_step = None;
        Ok(true)
    }
}
