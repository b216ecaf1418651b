//! Sparse, block-structured grid engine with data-parallel stencil execution.

pub mod sparsegrid;
pub use sparsegrid::{
    GridError, NeighborShape, PackRequest, Schema, SparseGrid, SparseGridConfig, StencilMode,
};
