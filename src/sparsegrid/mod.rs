//! Sparse block-grid engine internals and public API.

mod accounting;
pub mod block;
pub(crate) mod blockmap;
mod boundary;
mod cell;
mod error;
mod export;
mod ghost;
mod grid;
mod insert;
mod layout;
mod linearizer;
mod neighbors;
mod pack;
mod stencil;
mod store;

pub use accounting::{OccupancyMode, OccupancyStats};
pub use block::{BlockSlot, BACKGROUND_SLOT, EXISTS_BIT, PADDING_BIT};
pub use boundary::{ExistingPoint, ExistingPoints, TagOptions, TagReport};
pub use cell::{CellMut, CellRef};
pub use error::{GridError, MAX_SUPPORTED_RADIUS};
pub use export::{PointProperty, PointWriter, VtkPointWriter};
pub use ghost::{skin_len, EnlargedBlock, GhostEntry, GhostMapping, NO_DIRECTION};
pub use grid::{SparseGrid, SparseGridConfig};
pub use insert::{FlushReport, InsertBuffer, StagedEntry};
pub use layout::{
    Field, FieldDesc, FieldId, FieldKind, FieldScalar, Layout, Schema, STATUS_FIELD,
};
pub use linearizer::{
    default_block_edge, BlockOrder, Linearizer, BACKGROUND_KEY, MAX_BLOCK_CAPACITY,
};
pub use neighbors::{NeighborShape, NeighborTable};
pub use pack::{BoxRegion, PackRequest};
pub use stencil::{
    stencil_fn, FnStencil, Stencil, StencilMode, StencilOutput, StencilPoint, NO_SHARED_CHUNK,
};
pub use store::{BlockStore, StoreView};
