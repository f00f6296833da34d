//! Axis-aligned bounding boxes used to decide which old-mesh data each rank needs.

use crate::algs::wire::Packable;
use crate::mesh_error::MeshError;
use bytes::{Bytes, BytesMut};
use nalgebra::Vector3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingBox {
    /// Box containing nothing; accommodating any point makes it valid.
    pub fn empty() -> Self {
        Self {
            min: Vector3::repeat(f64::MAX),
            max: Vector3::repeat(-f64::MAX),
        }
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|i| self.min[i] > self.max[i])
    }

    pub fn accommodate(&mut self, p: &Vector3<f64>) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    pub fn accommodate_box(&mut self, other: &BoundingBox) {
        if !other.is_empty() {
            self.accommodate(&other.min);
            self.accommodate(&other.max);
        }
    }

    /// Grow by `pad` in every direction (no-op on empty boxes).
    pub fn pad(&mut self, pad: f64) {
        if !self.is_empty() {
            self.min -= Vector3::repeat(pad);
            self.max += Vector3::repeat(pad);
        }
    }

    pub fn contains(&self, p: &Vector3<f64>) -> bool {
        (0..3).all(|i| self.min[i] <= p[i] && p[i] <= self.max[i])
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && (0..3).all(|i| self.min[i] <= other.max[i] && other.min[i] <= self.max[i])
    }

    pub fn diagonal(&self) -> f64 {
        if self.is_empty() { 0.0 } else { (self.max - self.min).norm() }
    }
}

impl Packable for BoundingBox {
    fn pack(&self, buf: &mut BytesMut) {
        self.min.pack(buf);
        self.max.pack(buf);
    }
    fn unpack(buf: &mut Bytes) -> Result<Self, MeshError> {
        Ok(Self {
            min: Vector3::unpack(buf)?,
            max: Vector3::unpack(buf)?,
        })
    }
}
