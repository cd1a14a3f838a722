//! Paste-buffer helpers: copy a region out of the world, stamp it back in,
//! and mirror it.

use crate::gid::{FLIPPED_HORIZONTALLY, FLIPPED_VERTICALLY};
use crate::{Cursor, CursorContent, Layer, LayerId, Rectangle, TileId, ValidationError, World};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorDirection {
    Horizontal,
    Vertical,
}

/// Copy `frame` out of every grid layer, in layer order.
///
/// Cells of the frame that fall outside a layer stay `0` (transparent).
pub fn extract_cursor(world: &World, frame: Rectangle) -> Cursor {
    let contents = world
        .layers
        .iter()
        .filter(|layer| layer.is_grid())
        .map(|layer| {
            let mut data = vec![0; frame.area()];
            if let Some(overlap) = layer.bounds().and_then(|b| b.intersect(&frame)) {
                for (x, y) in overlap.cells() {
                    if let (Some(dst), Some(tile)) = (frame.local_index(x, y), layer.tile_at(x, y)) {
                        data[dst] = tile;
                    }
                }
            }
            CursorContent {
                layer_id: Some(layer.id),
                data,
            }
        })
        .collect();

    Cursor {
        frame,
        initial_frame: frame,
        contents,
    }
}

/// Stamp a cursor onto the world in place.
///
/// Each content lands on its own layer, or on `default_layer_id` when it
/// has none. Zero cells keep the destination tile. Everything is validated
/// before the first tile is written.
pub fn paste_cursor(
    world: &mut World,
    cursor: &Cursor,
    default_layer_id: LayerId,
) -> Result<(), ValidationError> {
    let frame = cursor.frame;
    let needed = frame.area();

    for content in &cursor.contents {
        let layer_id = content.layer_id.unwrap_or(default_layer_id);
        world.grid_layer(layer_id)?;
        if content.data.len() < needed {
            return Err(ValidationError::OutOfBoundsIndex {
                layer_id,
                index: needed - 1,
                len: content.data.len(),
            });
        }
    }

    for content in &cursor.contents {
        let layer_id = content.layer_id.unwrap_or(default_layer_id);
        let layer = world.grid_layer_mut(layer_id)?;
        stamp(layer, frame, &content.data);
    }
    Ok(())
}

fn stamp(layer: &mut Layer, frame: Rectangle, data: &[TileId]) {
    let Some(bounds) = layer.bounds() else {
        return;
    };
    let Some(overlap) = bounds.intersect(&frame) else {
        return;
    };
    let Some(grid) = layer.grid_mut() else {
        return;
    };
    for (x, y) in overlap.cells() {
        let (Some(src), Some(dst)) = (frame.local_index(x, y), bounds.local_index(x, y)) else {
            continue;
        };
        let tile = data[src];
        if tile != 0 {
            if let Some(cell) = grid.data.get_mut(dst) {
                *cell = tile;
            }
        }
    }
}

/// Non-mutating form of [`paste_cursor`]: returns the merged layers.
pub fn merge_cursor_onto_layers(
    layers: &[Layer],
    cursor: &Cursor,
    default_layer_id: LayerId,
) -> Result<Vec<Layer>, ValidationError> {
    let mut scratch = World::from_layers(layers.to_vec(), Vec::new());
    paste_cursor(&mut scratch, cursor, default_layer_id)?;
    Ok(scratch.layers)
}

/// Mirror one content block of a `width × height` frame.
///
/// The matching flip flag is toggled on every cell, empty ones included.
pub fn mirror_content(
    content: &CursorContent,
    direction: MirrorDirection,
    width: u32,
    height: u32,
) -> CursorContent {
    let (w, h) = (width as usize, height as usize);
    let flag = match direction {
        MirrorDirection::Horizontal => FLIPPED_HORIZONTALLY,
        MirrorDirection::Vertical => FLIPPED_VERTICALLY,
    };
    if w == 0 || h == 0 {
        return CursorContent {
            layer_id: content.layer_id,
            data: content.data.iter().map(|&gid| gid ^ flag).collect(),
        };
    }
    let data = (0..content.data.len())
        .map(|i| {
            let (x, y) = (i % w, i / w);
            let src = match direction {
                MirrorDirection::Horizontal => y * w + (w - x - 1),
                MirrorDirection::Vertical => (h.saturating_sub(y + 1)) * w + x,
            };
            content.data.get(src).copied().unwrap_or(0) ^ flag
        })
        .collect();
    CursorContent {
        layer_id: content.layer_id,
        data,
    }
}

pub fn mirror_cursor(cursor: &Cursor, direction: MirrorDirection) -> Cursor {
    Cursor {
        frame: cursor.frame,
        initial_frame: cursor.initial_frame,
        contents: cursor
            .contents
            .iter()
            .map(|c| mirror_content(c, direction, cursor.frame.width, cursor.frame.height))
            .collect(),
    }
}
