//! In-memory distributed mesh database.
//!
//! [`MetaData`] holds the part and field registry; [`BulkData`] holds entities,
//! connectivity, field values and sharing for one rank. The [`parallel`] module adds
//! the collective creation of entities that several ranks need at once.

pub mod bulk;
pub mod meta;
pub mod parallel;

pub use bulk::{BulkData, EntityRecord};
pub use meta::{FieldDef, FieldId, MetaData, Part, PartId};
pub use parallel::{NewEntityRequest, ResolvedEntity, SideRequest};
