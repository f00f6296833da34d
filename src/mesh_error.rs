//! MeshError: unified error type for mesh-cdfem public APIs.
//!
//! Every fallible operation in the crate returns `Result<_, MeshError>`. Conditions
//! that indicate a broken invariant inside a collective step are reported through
//! [`MeshError::InvariantViolation`] so the caller can abort all ranks together.

use crate::topology::cell_topology::CellTopology;
use crate::topology::entity::EntityKey;
use thiserror::Error;

/// Unified error type for mesh-cdfem operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Attempted to construct an `EntityId` with a zero value (invalid).
    #[error("EntityId must be non-zero (0 is reserved as invalid/sentinel)")]
    InvalidEntityId,
    /// The entity is not known to the local mesh database.
    #[error("entity {0} not found on this rank")]
    MissingEntity(EntityKey),
    /// An entity with this key already exists.
    #[error("entity {0} already exists")]
    DuplicateEntity(EntityKey),
    /// Lookup of a part by name or ordinal failed.
    #[error("unknown part `{0}`")]
    UnknownPart(String),
    /// Lookup of a field by name or ordinal failed.
    #[error("unknown field `{0}`")]
    UnknownField(String),
    /// Field data was requested on an entity the field is not defined on.
    #[error("field `{field}` is not defined on {key}")]
    FieldNotDefined { field: String, key: EntityKey },
    /// The element topology cannot be decomposed.
    #[error("element topology {0:?} is not supported for decomposition")]
    UnsupportedTopology(CellTopology),
    /// A structural change was attempted outside a modification cycle, or a cycle was
    /// opened twice.
    #[error("mesh modification state violation: {0}")]
    ModificationState(&'static str),
    /// Connectivity passed to the mesh database is inconsistent.
    #[error("invalid connectivity for {key}: {reason}")]
    InvalidConnectivity { key: EntityKey, reason: String },
    /// A node sign or score was read before being set in the current pass.
    #[error("node state violation: {0}")]
    NodeState(String),
    /// A node ancestry could not be resolved or rebuilt locally.
    #[error("cannot resolve node ancestry: {0}")]
    Ancestry(String),
    /// Inconsistent geometry (degenerate or inverted element).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// Configuration error (phase support, options).
    #[error("configuration error: {0}")]
    Config(String),
    /// A point-to-point message failed or was malformed.
    #[error("communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A received buffer could not be decoded.
    #[error("wire decode error: {0}")]
    Wire(String),
    /// A checked invariant did not hold.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl MeshError {
    /// Convenience constructor for communication failures described by a message.
    pub fn comm(neighbor: usize, msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        MeshError::CommError {
            neighbor,
            source: msg.into(),
        }
    }
}
