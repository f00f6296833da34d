//! Tunables of the decomposition driver.

use crate::cdfem::cdmesh::DEFAULT_SNAP_TOLERANCE;
use crate::mesh::meta::{FieldId, MetaData};
use crate::mesh_error::MeshError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOptions")]
pub struct CdfemOptions {
    /// Initial prolongation padding, in units of the largest element size.
    pub padding_multiplier: f64,
    /// Growth applied to the measured displacement when the padding was too small.
    /// Must exceed one so every retry searches further.
    pub padding_growth: f64,
    /// Upper bound on prolongation search rounds.
    pub max_padding_rounds: usize,
    /// Put the previous decomposition back when a time step is repeated.
    pub restore_on_failed_step: bool,
    /// Verify side parts after every modification.
    pub check_side_parts: bool,
    /// Also create sides between same-phase subelements of one parent.
    pub build_internal_sides: bool,
    /// Crossings closer than this (as a fraction of the edge) to an end node are moved
    /// onto that node. Zero disables snapping.
    pub snap_tolerance: f64,
    /// Node fields that derived nodes take from their parent stencil instead of from
    /// the previous mesh.
    pub interpolation_fields: Vec<String>,
}

impl Default for CdfemOptions {
    fn default() -> Self {
        Self {
            padding_multiplier: 3.0,
            padding_growth: 1.5,
            max_padding_rounds: 8,
            restore_on_failed_step: true,
            check_side_parts: cfg!(debug_assertions),
            build_internal_sides: false,
            snap_tolerance: DEFAULT_SNAP_TOLERANCE,
            interpolation_fields: Vec::new(),
        }
    }
}

impl CdfemOptions {
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.padding_multiplier.is_nan() || self.padding_multiplier <= 0.0 {
            return Err(MeshError::Config(format!(
                "padding_multiplier must be positive, got {}",
                self.padding_multiplier
            )));
        }
        if self.padding_growth.is_nan() || self.padding_growth <= 1.0 {
            return Err(MeshError::Config(format!(
                "padding_growth must be greater than 1, got {}",
                self.padding_growth
            )));
        }
        if self.max_padding_rounds == 0 {
            return Err(MeshError::Config("max_padding_rounds must be at least 1".into()));
        }
        if !(0.0..0.5).contains(&self.snap_tolerance) {
            return Err(MeshError::Config(format!(
                "snap_tolerance must lie in [0, 0.5), got {}",
                self.snap_tolerance
            )));
        }
        Ok(())
    }

    /// Ordinals of [`interpolation_fields`](Self::interpolation_fields).
    pub fn interpolation_field_ids(&self, meta: &MetaData) -> Result<Vec<FieldId>, MeshError> {
        let mut ids = self
            .interpolation_fields
            .iter()
            .map(|name| meta.get_field(name).ok_or_else(|| MeshError::UnknownField(name.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// Unchecked mirror of [`CdfemOptions`] that deserialization goes through.
#[derive(Deserialize)]
#[serde(default)]
struct RawOptions {
    padding_multiplier: f64,
    padding_growth: f64,
    max_padding_rounds: usize,
    restore_on_failed_step: bool,
    check_side_parts: bool,
    build_internal_sides: bool,
    snap_tolerance: f64,
    interpolation_fields: Vec<String>,
}

impl Default for RawOptions {
    fn default() -> Self {
        let d = CdfemOptions::default();
        Self {
            padding_multiplier: d.padding_multiplier,
            padding_growth: d.padding_growth,
            max_padding_rounds: d.max_padding_rounds,
            restore_on_failed_step: d.restore_on_failed_step,
            check_side_parts: d.check_side_parts,
            build_internal_sides: d.build_internal_sides,
            snap_tolerance: d.snap_tolerance,
            interpolation_fields: d.interpolation_fields,
        }
    }
}

impl TryFrom<RawOptions> for CdfemOptions {
    type Error = MeshError;

    fn try_from(raw: RawOptions) -> Result<Self, MeshError> {
        let opts = CdfemOptions {
            padding_multiplier: raw.padding_multiplier,
            padding_growth: raw.padding_growth,
            max_padding_rounds: raw.max_padding_rounds,
            restore_on_failed_step: raw.restore_on_failed_step,
            check_side_parts: raw.check_side_parts,
            build_internal_sides: raw.build_internal_sides,
            snap_tolerance: raw.snap_tolerance,
            interpolation_fields: raw.interpolation_fields,
        };
        opts.validate()?;
        Ok(opts)
    }
}
