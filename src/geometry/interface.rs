//! Interface geometry collaborator: level-set surfaces, interface ids, phase tags.
//!
//! A decomposition is driven by an [`InterfaceGeometry`] that evaluates one signed
//! distance per surface. Interfaces are either a single surface `(i, i)` (phases are
//! sign combinations) or, with one level set per phase, the pair `(i, j)` whose value
//! is `d_i - d_j`.

use crate::algs::wire::Packable;
use crate::mesh_error::MeshError;
use crate::topology::entity::EntityId;
use bytes::{Bytes, BytesMut};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SurfaceId(pub u32);

/// Interface between two surfaces (equal for a plain level set).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceId {
    pub first: SurfaceId,
    pub second: SurfaceId,
}

impl InterfaceId {
    pub fn new(a: SurfaceId, b: SurfaceId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self { first, second }
    }

    pub fn single(s: SurfaceId) -> Self {
        Self::new(s, s)
    }

    pub fn is_single(&self) -> bool {
        self.first == self.second
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.first.0, self.second.0)
    }
}

impl Packable for InterfaceId {
    fn pack(&self, buf: &mut BytesMut) {
        self.first.0.pack(buf);
        self.second.0.pack(buf);
    }
    fn unpack(buf: &mut Bytes) -> Result<Self, MeshError> {
        Ok(Self::new(SurfaceId(u32::unpack(buf)?), SurfaceId(u32::unpack(buf)?)))
    }
}

/// Set of (surface, sign) pairs identifying a phase.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhaseTag {
    signs: BTreeMap<SurfaceId, i8>,
}

impl PhaseTag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, surface: SurfaceId, sign: i8) -> Self {
        self.add(surface, sign);
        self
    }

    pub fn add(&mut self, surface: SurfaceId, sign: i8) {
        self.signs.insert(surface, sign);
    }

    pub fn sign(&self, surface: SurfaceId) -> Option<i8> {
        self.signs.get(&surface).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.signs.is_empty()
    }

    /// Whether every entry of `self` also appears in `other`.
    pub fn is_subset_of(&self, other: &PhaseTag) -> bool {
        self.signs.iter().all(|(s, v)| other.signs.get(s) == Some(v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (SurfaceId, i8)> + '_ {
        self.signs.iter().map(|(s, v)| (*s, *v))
    }
}

impl fmt::Display for PhaseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (s, v)) in self.signs.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", s.0, if *v < 0 { '-' } else { '+' })?;
        }
        write!(f, "}}")
    }
}

impl Packable for PhaseTag {
    fn pack(&self, buf: &mut BytesMut) {
        let pairs: Vec<(u32, i8)> = self.signs.iter().map(|(s, v)| (s.0, *v)).collect();
        pairs.pack(buf);
    }
    fn unpack(buf: &mut Bytes) -> Result<Self, MeshError> {
        let pairs = Vec::<(u32, i8)>::unpack(buf)?;
        Ok(Self {
            signs: pairs.into_iter().map(|(s, v)| (SurfaceId(s), v)).collect(),
        })
    }
}

/// Sign of a level-set value; exact zero means "on the interface".
pub fn sign_of(value: f64) -> i8 {
    if value > 0.0 {
        1
    } else if value < 0.0 {
        -1
    } else {
        0
    }
}

/// Geometry collaborator consumed by the decomposition.
pub trait InterfaceGeometry {
    /// Surfaces whose level sets drive the decomposition.
    fn surface_identifiers(&self) -> Vec<SurfaceId>;

    /// Phases are "closest level set wins" instead of sign combinations.
    fn one_levelset_per_phase(&self) -> bool {
        false
    }

    /// Hook invoked once per decomposition step before any element is processed.
    fn prepare_to_process_elements(&mut self, _step_count: i32) {}

    /// Bulk phase of `element` when no interface crosses it. `None` leaves the phase to
    /// the node signs.
    fn phase_for_uncut_element(&self, _element: EntityId) -> Option<PhaseTag> {
        None
    }

    /// Signed distance of `x` to `surface`.
    fn surface_distance(&self, surface: SurfaceId, x: &Vector3<f64>) -> f64;

    /// Value whose zero set is `interface`.
    fn interface_value(&self, interface: InterfaceId, x: &Vector3<f64>) -> f64 {
        if interface.is_single() {
            self.surface_distance(interface.first, x)
        } else {
            self.surface_distance(interface.first, x) - self.surface_distance(interface.second, x)
        }
    }

    /// Parametric crossing along `x0 → x1`, `None` unless the end signs differ strictly.
    fn edge_crossing_position(
        &self,
        interface: InterfaceId,
        x0: &Vector3<f64>,
        x1: &Vector3<f64>,
    ) -> Option<f64> {
        let (f0, f1) = (self.interface_value(interface, x0), self.interface_value(interface, x1));
        if sign_of(f0) * sign_of(f1) >= 0 {
            return None;
        }
        Some((f0 / (f0 - f1)).clamp(0.0, 1.0))
    }
}

/// Analytic level sets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LevelSet {
    /// `n·x - offset`, with `n` normalized on evaluation.
    Plane { normal: [f64; 3], offset: f64 },
    /// `|x - c| - r`.
    Sphere { center: [f64; 3], radius: f64 },
}

impl LevelSet {
    pub fn distance(&self, x: &Vector3<f64>) -> f64 {
        match self {
            LevelSet::Plane { normal, offset } => {
                let n = Vector3::from(*normal);
                let len = n.norm();
                if len == 0.0 { -offset } else { n.dot(x) / len - offset }
            }
            LevelSet::Sphere { center, radius } => (x - Vector3::from(*center)).norm() - radius,
        }
    }
}

/// Geometry made of analytic level sets, surface `i` being `levelsets[i]`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AnalyticGeometry {
    pub levelsets: Vec<LevelSet>,
    #[serde(default)]
    pub one_levelset_per_phase: bool,
    /// Phases the application fixed for elements no interface crosses.
    #[serde(default)]
    pub uncut_phases: BTreeMap<EntityId, PhaseTag>,
}

impl AnalyticGeometry {
    pub fn new(levelsets: Vec<LevelSet>) -> Self {
        Self {
            levelsets,
            one_levelset_per_phase: false,
            uncut_phases: BTreeMap::new(),
        }
    }

    pub fn with_uncut_phase(mut self, element: EntityId, phase: PhaseTag) -> Self {
        self.uncut_phases.insert(element, phase);
        self
    }
}

impl InterfaceGeometry for AnalyticGeometry {
    fn surface_identifiers(&self) -> Vec<SurfaceId> {
        (0..self.levelsets.len() as u32).map(SurfaceId).collect()
    }

    fn one_levelset_per_phase(&self) -> bool {
        self.one_levelset_per_phase
    }

    fn phase_for_uncut_element(&self, element: EntityId) -> Option<PhaseTag> {
        self.uncut_phases.get(&element).cloned()
    }

    fn surface_distance(&self, surface: SurfaceId, x: &Vector3<f64>) -> f64 {
        self.levelsets
            .get(surface.0 as usize)
            .map_or(f64::MAX, |ls| ls.distance(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn plane_crossing_is_linear() {
        let g = AnalyticGeometry::new(vec![LevelSet::Plane {
            normal: [1.0, 0.0, 0.0],
            offset: 0.3,
        }]);
        let i = InterfaceId::single(SurfaceId(0));
        let x0 = Vector3::new(0.0, 0.0, 0.0);
        let x1 = Vector3::new(1.0, 0.0, 0.0);
        assert_relative_eq!(g.edge_crossing_position(i, &x0, &x1).unwrap(), 0.3);
        assert!(g.edge_crossing_position(i, &x1, &Vector3::new(2.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn phase_subset_and_display() {
        let a = PhaseTag::new().with(SurfaceId(0), -1);
        let ab = a.clone().with(SurfaceId(1), 1);
        assert!(a.is_subset_of(&ab));
        assert!(!ab.is_subset_of(&a));
        assert_eq!(ab.to_string(), "{0:-,1:+}");
    }

    #[test]
    fn uncut_phases_are_looked_up_by_element() {
        let e = EntityId::new(7).unwrap();
        let inside = PhaseTag::new().with(SurfaceId(0), -1);
        let g = AnalyticGeometry::new(vec![LevelSet::Sphere { center: [0.0; 3], radius: 1.0 }])
            .with_uncut_phase(e, inside.clone());
        assert_eq!(g.phase_for_uncut_element(e), Some(inside));
        assert_eq!(g.phase_for_uncut_element(EntityId::new(8).unwrap()), None);
    }

    #[test]
    fn interface_ids_are_canonical() {
        let i = InterfaceId::new(SurfaceId(2), SurfaceId(1));
        assert_eq!(i.first, SurfaceId(1));
        assert!(!i.is_single());
    }
}
