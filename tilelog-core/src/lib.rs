//! # tilelog-core — shared document model and reducer
//!
//! Everything in this crate is pure: no I/O, no clocks, no randomness.
//! The server uses [`reduce`] as the gatekeeper for its authoritative log,
//! and every client runs the very same function to apply its own edits
//! optimistically, so the two sides cannot drift apart.
//!
//! ## Modules
//!
//! - [`world`] — tile-grid document (layers, tilesets)
//! - [`action`] — the closed set of edit operations
//! - [`entry`] — log entries and id conventions
//! - [`reducer`] — `State × Action → State`
//! - [`cursor`] — extract / paste / mirror paste buffers
//! - [`gid`] — tile id flip flags

use serde::{Deserialize, Serialize};

pub mod action;
pub mod cursor;
pub mod entry;
pub mod error;
pub mod gid;
pub mod reducer;
pub mod world;

pub use action::{Action, ActionType};
pub use cursor::{extract_cursor, merge_cursor_onto_layers, mirror_cursor, MirrorDirection};
pub use error::ValidationError;
pub use entry::{EntryId, LogEntry};
pub use reducer::reduce;
pub use world::{Layer, LayerKind, TileGrid, Tileset, World};

/// Layer ids are unique inside a world and assigned by whoever authored it.
pub type LayerId = u32;

/// A global tile id, possibly carrying flip flags in its high bits.
pub type TileId = u32;

pub type UserId = String;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq, Hash)]
pub struct Coordinates {
    pub x: i32,
    pub y: i32,
}

impl Coordinates {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle in tile coordinates.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Number of cells covered.
    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        let (x, y) = (x as i64, y as i64);
        x >= self.x as i64 && x < self.right() && y >= self.y as i64 && y < self.bottom()
    }

    fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// Overlap of two rectangles, `None` when they do not overlap.
    pub fn intersect(&self, other: &Rectangle) -> Option<Rectangle> {
        let x0 = (self.x as i64).max(other.x as i64);
        let y0 = (self.y as i64).max(other.y as i64);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rectangle {
            x: x0 as i32,
            y: y0 as i32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }

    /// Row-major walk over every cell. Cells past `i32::MAX` are skipped.
    pub fn cells(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        let (x0, y0) = (self.x as i64, self.y as i64);
        (0..self.height as i64).flat_map(move |dy| {
            (0..self.width as i64).filter_map(move |dx| {
                Some((i32::try_from(x0 + dx).ok()?, i32::try_from(y0 + dy).ok()?))
            })
        })
    }

    /// Row-major index of a cell inside this rectangle.
    pub fn local_index(&self, x: i32, y: i32) -> Option<usize> {
        if !self.contains(x, y) {
            return None;
        }
        let dx = (x as i64 - self.x as i64) as usize;
        let dy = (y as i64 - self.y as i64) as usize;
        Some(dy * self.width as usize + dx)
    }
}

/// One layer's worth of paste-buffer tiles. A `0` cell is transparent.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CursorContent {
    /// `None` pastes onto whatever layer is the default target at paste time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_id: Option<LayerId>,
    pub data: Vec<TileId>,
}

/// Clipboard-like paste buffer attached to a user.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub frame: Rectangle,
    pub initial_frame: Rectangle,
    pub contents: Vec<CursorContent>,
}

/// Ephemeral per-session user record.
///
/// At most one of `selection` / `cursor` is set at any time.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Rectangle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

impl User {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            selection: None,
            cursor: None,
        }
    }
}

/// The full replicated document: world plus connected users.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct State {
    pub world: World,
    #[serde(default)]
    pub users: Vec<User>,
}

impl State {
    pub fn new(world: World) -> Self {
        Self {
            world,
            users: Vec::new(),
        }
    }

    pub fn user(&self, id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn user_mut(&mut self, id: &str) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rectangle_intersect_partial() {
        let a = Rectangle::new(0, 0, 10, 10);
        let b = Rectangle::new(5, -3, 10, 5);
        assert_eq!(a.intersect(&b), Some(Rectangle::new(5, 0, 5, 2)));
    }

    #[test]
    fn test_rectangle_intersect_disjoint() {
        let a = Rectangle::new(0, 0, 4, 4);
        let b = Rectangle::new(4, 0, 4, 4);
        assert_eq!(a.intersect(&b), None);
    }

    #[test]
    fn test_rectangle_cells_row_major() {
        let r = Rectangle::new(2, 3, 2, 2);
        let cells: Vec<_> = r.cells().collect();
        assert_eq!(cells, vec![(2, 3), (3, 3), (2, 4), (3, 4)]);
        assert_eq!(r.local_index(3, 4), Some(3));
        assert_eq!(r.local_index(4, 4), None);
    }

    #[test]
    fn test_rectangle_cells_stop_at_i32_max() {
        let r = Rectangle::new(i32::MAX - 1, 0, 4, 1);
        let cells: Vec<_> = r.cells().collect();
        assert_eq!(cells, vec![(i32::MAX - 1, 0), (i32::MAX, 0)]);
    }

    #[test]
    fn test_user_serializes_without_empty_fields() {
        let json = serde_json::to_value(User::new("u1")).unwrap();
        assert_eq!(json, serde_json::json!({ "id": "u1" }));
    }

    #[test]
    fn test_cursor_uses_camel_case() {
        let cursor = Cursor {
            frame: Rectangle::new(1, 1, 1, 1),
            initial_frame: Rectangle::new(0, 0, 1, 1),
            contents: vec![CursorContent { layer_id: None, data: vec![7] }],
        };
        let json = serde_json::to_value(&cursor).unwrap();
        assert!(json.get("initialFrame").is_some());
        assert!(json["contents"][0].get("layerId").is_none());
    }
}
