//! Existence counts and per-block occupancy statistics.

use rayon::prelude::*;

use super::block;
use super::store::BlockStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OccupancyMode {
    /// Existing cells / capacity.
    #[default]
    Existing,
    /// Existing, non-padding cells / capacity.
    Interior,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OccupancyStats {
    /// One fraction per real block, in slot order.
    pub per_block: Vec<f64>,
    pub mean: f64,
    /// Population standard deviation over blocks.
    pub std_dev: f64,
}

fn real_masks(store: &BlockStore) -> &[u8] {
    &store.masks()[store.block_size()..]
}

pub fn count_existing(store: &BlockStore) -> usize {
    real_masks(store)
        .par_chunks(store.block_size())
        .map(|b| b.iter().filter(|&&m| block::exists(m)).count())
        .sum()
}

/// Existing cells tagged as padding.
pub fn count_boundary(store: &BlockStore) -> usize {
    real_masks(store)
        .par_chunks(store.block_size())
        .map(|b| b.iter().filter(|&&m| block::is_padding(m)).count())
        .sum()
}

pub fn measure_occupancy(store: &BlockStore, mode: OccupancyMode) -> OccupancyStats {
    let capacity = store.block_size() as f64;
    let per_block: Vec<f64> = real_masks(store)
        .par_chunks(store.block_size())
        .map(|b| {
            let n = match mode {
                OccupancyMode::Existing => b.iter().filter(|&&m| block::exists(m)).count(),
                OccupancyMode::Interior => b.iter().filter(|&&m| block::is_interior(m)).count(),
            };
            n as f64 / capacity
        })
        .collect();

    if per_block.is_empty() {
        return OccupancyStats::default();
    }
    let n = per_block.len() as f64;
    let mean = per_block.iter().sum::<f64>() / n;
    let var = per_block.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    OccupancyStats {
        per_block,
        mean,
        std_dev: var.sqrt(),
    }
}
