//! Global tile ids carry mirroring flags in their top three bits.

use crate::TileId;

pub const FLIPPED_HORIZONTALLY: TileId = 0x8000_0000;
pub const FLIPPED_VERTICALLY: TileId = 0x4000_0000;
pub const FLIPPED_DIAGONALLY: TileId = 0x2000_0000;

const FLAG_MASK: TileId = FLIPPED_HORIZONTALLY | FLIPPED_VERTICALLY | FLIPPED_DIAGONALLY;

/// The tile index with every flip flag stripped.
pub fn tile_index(gid: TileId) -> TileId {
    gid & !FLAG_MASK
}

/// Only the flip flags of a gid.
pub fn flip_flags(gid: TileId) -> TileId {
    gid & FLAG_MASK
}
