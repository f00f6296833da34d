//! Geometry utilities: simplex measures, bounding boxes, facet projections and the
//! interface (level-set) collaborator.

pub mod bounding_box;
pub mod facet;
pub mod interface;
pub mod quality;

pub use bounding_box::BoundingBox;
pub use interface::{AnalyticGeometry, InterfaceGeometry, InterfaceId, LevelSet, PhaseTag, SurfaceId};
