//! Error taxonomy for the sparse grid engine.

use thiserror::Error;

use super::neighbors::NeighborShape;

/// Largest stencil support radius with an implemented tagging/stencil path.
pub const MAX_SUPPORTED_RADIUS: usize = 2;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("grid resolution must be non-empty and non-zero in every dimension, got {resolution:?}")]
    InvalidResolution { resolution: Vec<usize> },

    #[error("block edge {edge} is invalid for a {dim}D grid (capacity edge^dim must be in 1..=65536)")]
    InvalidBlockEdge { edge: usize, dim: usize },

    #[error("stencil radius {radius} exceeds block edge {edge}")]
    RadiusExceedsBlock { radius: usize, edge: usize },

    #[error("stencil radius {radius} is not supported (supported radii: 0..={max})")]
    UnsupportedRadius { radius: usize, max: usize },

    #[error("block space {block_dims:?} does not fit a 64-bit Z-order key")]
    BlockSpaceOverflow { block_dims: Vec<usize> },

    #[error("coordinate {coord:?} lies outside the domain {resolution:?}")]
    OutOfDomain {
        coord: Vec<i64>,
        resolution: Vec<usize>,
    },

    #[error("schema has no field named `{0}`")]
    UnknownField(String),

    #[error("field index {0} is not part of the schema")]
    UnknownFieldId(usize),

    #[error("field `{name}` stores {actual:?}, requested {requested:?}")]
    FieldType {
        name: String,
        actual: super::layout::FieldKind,
        requested: super::layout::FieldKind,
    },

    #[error("field `{name}` has {components} components, component {component} requested")]
    ComponentOutOfRange {
        name: String,
        components: usize,
        component: usize,
    },

    #[error("schema field `{0}` is declared more than once")]
    DuplicateField(String),

    #[error("schema field `{0}` must have at least one component")]
    EmptyField(String),

    #[error("schema field name `{0}` is reserved for the exported status mask")]
    ReservedField(String),

    #[error("schema must declare at least one field")]
    EmptySchema,

    #[error("neighbor table is missing or stale (built for generation {built:?}, grid is at {current})")]
    StaleNeighbors { built: Option<u64>, current: u64 },

    #[error("boundary tags are missing or stale (tagged at generation {tagged:?}, grid is at {current})")]
    StaleBoundaryTags { tagged: Option<u64>, current: u64 },

    #[error("existing-points index is missing or stale (built for generation {built:?}, grid is at {current})")]
    StaleExistingPoints { built: Option<u64>, current: u64 },

    #[error("neighbor table was built for {built:?} but the grid is configured for {configured:?}")]
    ShapeMismatch {
        built: NeighborShape,
        configured: NeighborShape,
    },

    #[error("failed to allocate {bytes} bytes for {what}")]
    Allocation { what: &'static str, bytes: usize },

    #[error("malformed pack buffer: {0}")]
    PackFormat(String),

    #[error("point-cloud export supports at most 3 dimensions, grid has {0}")]
    ExportDimension(usize),

    #[error("export failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build the grid thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl GridError {
    pub(crate) fn allocation(what: &'static str, bytes: usize) -> Self {
        GridError::Allocation { what, bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_values() {
        let err = GridError::UnsupportedRadius {
            radius: 3,
            max: MAX_SUPPORTED_RADIUS,
        };
        assert_eq!(
            err.to_string(),
            "stencil radius 3 is not supported (supported radii: 0..=2)"
        );

        let err = GridError::OutOfDomain {
            coord: vec![-1, 4],
            resolution: vec![8, 8],
        };
        assert!(err.to_string().contains("[-1, 4]"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: GridError = io.into();
        assert!(matches!(err, GridError::Io(_)));
    }
}
