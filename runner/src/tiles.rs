use crate::config::Size;
use itertools::Itertools;
use std::fmt::{self, Display};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TileError {
    #[error("Overlap {axis} too large for tile ({tile} - 2 * {overlap} <= 0)")]
    OverlapTooLarge {
        axis: &'static str,
        tile: u32,
        overlap: u32,
    },
    #[error("{0} must be larger than 0")]
    ZeroChunk(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 1-indexed position of a tile in the grid
pub struct TileSpec {
    pub column: u32,
    pub row: u32,
}

impl Display for TileSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {},{}", self.column, self.row)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Tile decomposition of images with a fixed tile and overlap size
pub struct TileGrid {
    stride_width: u32,
    stride_height: u32,
    tiles_per_task: usize,
}

fn stride(axis: &'static str, tile: u32, overlap: u32) -> Result<u32, TileError> {
    match overlap.checked_mul(2).and_then(|double| tile.checked_sub(double)) {
        Some(stride) if stride > 0 => Ok(stride),
        _ => Err(TileError::OverlapTooLarge {
            axis,
            tile,
            overlap,
        }),
    }
}

impl TileGrid {
    /// Fails before anything is enumerated if the overlap eats the whole tile
    pub fn new(tile: Size, overlap: Size, tiles_per_task: usize) -> Result<Self, TileError> {
        let stride_width = stride("width", tile.width, overlap.width)?;
        let stride_height = stride("height", tile.height, overlap.height)?;

        if tiles_per_task == 0 {
            return Err(TileError::ZeroChunk("tiles_per_task"));
        }

        Ok(Self {
            stride_width,
            stride_height,
            tiles_per_task,
        })
    }

    /// number of (columns, rows) needed to cover an image completely
    pub fn count(&self, width: u32, height: u32) -> (u32, u32) {
        (
            width.div_ceil(self.stride_width).max(1),
            height.div_ceil(self.stride_height).max(1),
        )
    }

    /// all tiles of an image, column-major
    pub fn tiles(&self, width: u32, height: u32) -> impl Iterator<Item = TileSpec> {
        let (columns, rows) = self.count(width, height);

        (1..=columns).flat_map(move |column| (1..=rows).map(move |row| TileSpec { column, row }))
    }

    /// Tile argument strings for an image, each holding at most `tiles_per_task` tiles
    pub fn tile_args(&self, width: u32, height: u32) -> Vec<String> {
        self.tiles(width, height)
            .chunks(self.tiles_per_task)
            .into_iter()
            .map(|chunk| chunk.map(|tile| tile.to_string()).join(" "))
            .collect()
    }
}
