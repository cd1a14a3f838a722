//! Tile-grid world document.
//!
//! The JSON layout follows the usual tile-map document shape (`width`,
//! `height`, `tilewidth`, `layers` with a `"type"` of `tilelayer`,
//! `objectgroup` or `imagelayer`, ...). Only grid layers carry data the
//! reducer touches; other layer kinds ride along untouched.

use serde::{Deserialize, Serialize};

use crate::gid::tile_index;
use crate::{Coordinates, LayerId, Rectangle, TileId, ValidationError};

const DEFAULT_TILE_SIZE: u32 = 32;

fn default_tile_size() -> u32 {
    DEFAULT_TILE_SIZE
}

fn default_next_layer_id() -> LayerId {
    1
}

fn default_orientation() -> String {
    "orthogonal".to_string()
}

fn default_visible() -> bool {
    true
}

fn default_opacity() -> f64 {
    1.0
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct World {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_tile_size")]
    pub tilewidth: u32,
    #[serde(default = "default_tile_size")]
    pub tileheight: u32,
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub tilesets: Vec<Tileset>,
    #[serde(default = "default_next_layer_id")]
    pub nextlayerid: LayerId,
    #[serde(default = "default_orientation")]
    pub orientation: String,
    #[serde(default)]
    pub infinite: bool,
}

/// Maps the gid range `firstgid .. firstgid + tilecount` onto one image.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Tileset {
    pub firstgid: TileId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub imagewidth: u32,
    #[serde(default)]
    pub imageheight: u32,
    #[serde(default = "default_tile_size")]
    pub tilewidth: u32,
    #[serde(default = "default_tile_size")]
    pub tileheight: u32,
    #[serde(default)]
    pub tilecount: u32,
    #[serde(default)]
    pub columns: u32,
    #[serde(default)]
    pub margin: u32,
    #[serde(default)]
    pub spacing: u32,
}

impl Tileset {
    pub fn contains_gid(&self, gid: TileId) -> bool {
        let index = tile_index(gid);
        index >= self.firstgid && (index - self.firstgid) < self.tilecount
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Layer {
    pub id: LayerId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(flatten)]
    pub kind: LayerKind,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum LayerKind {
    #[serde(rename = "tilelayer")]
    Tiles(TileGrid),
    /// Free-form objects; opaque to the reducer.
    #[serde(rename = "objectgroup")]
    Objects {
        #[serde(default)]
        objects: Vec<serde_json::Value>,
    },
    #[serde(rename = "imagelayer")]
    Image {
        #[serde(default)]
        image: String,
    },
}

/// Row-major tile data, `width * height` cells.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct TileGrid {
    pub width: u32,
    pub height: u32,
    pub data: Vec<TileId>,
}

impl Layer {
    /// A visible grid layer at offset (0, 0).
    pub fn tiles(
        id: LayerId,
        name: impl Into<String>,
        width: u32,
        height: u32,
        data: Vec<TileId>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            visible: true,
            opacity: 1.0,
            x: 0,
            y: 0,
            kind: LayerKind::Tiles(TileGrid { width, height, data }),
        }
    }

    pub fn objects(id: LayerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            visible: true,
            opacity: 1.0,
            x: 0,
            y: 0,
            kind: LayerKind::Objects { objects: Vec::new() },
        }
    }

    pub fn grid(&self) -> Option<&TileGrid> {
        match &self.kind {
            LayerKind::Tiles(grid) => Some(grid),
            _ => None,
        }
    }

    pub fn grid_mut(&mut self) -> Option<&mut TileGrid> {
        match &mut self.kind {
            LayerKind::Tiles(grid) => Some(grid),
            _ => None,
        }
    }

    /// A grid layer also needs non-zero dimensions to count as regular.
    pub fn is_grid(&self) -> bool {
        self.grid()
            .is_some_and(|g| g.width > 0 && g.height > 0)
    }

    /// Area covered by a grid layer, in world tile coordinates.
    pub fn bounds(&self) -> Option<Rectangle> {
        self.grid()
            .map(|g| Rectangle::new(self.x, self.y, g.width, g.height))
    }

    /// Tile at a world coordinate, `None` outside the layer.
    pub fn tile_at(&self, x: i32, y: i32) -> Option<TileId> {
        let index = self.bounds()?.local_index(x, y)?;
        self.grid()?.data.get(index).copied()
    }
}

impl World {
    /// An orthogonal map without layers.
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tilewidth: DEFAULT_TILE_SIZE,
            tileheight: DEFAULT_TILE_SIZE,
            layers: Vec::new(),
            tilesets: Vec::new(),
            nextlayerid: 1,
            orientation: default_orientation(),
            infinite: false,
        }
    }

    /// Size the map to fit its grid layers.
    pub fn from_layers(layers: Vec<Layer>, tilesets: Vec<Tileset>) -> Self {
        let width = layers.iter().filter_map(Layer::grid).map(|g| g.width).max().unwrap_or(0);
        let height = layers.iter().filter_map(Layer::grid).map(|g| g.height).max().unwrap_or(0);
        let nextlayerid = layers.iter().map(|l| l.id).max().map_or(1, |id| id + 1);
        Self {
            layers,
            tilesets,
            nextlayerid,
            ..Self::empty(width, height)
        }
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.id == id)
    }

    /// Look up a layer that must exist and must be a regular grid layer.
    pub fn grid_layer(&self, id: LayerId) -> Result<&Layer, ValidationError> {
        let layer = self.layer(id).ok_or(ValidationError::UnknownLayer(id))?;
        if !layer.is_grid() {
            return Err(ValidationError::NotAGridLayer(id));
        }
        Ok(layer)
    }

    pub fn grid_layer_mut(&mut self, id: LayerId) -> Result<&mut Layer, ValidationError> {
        let layer = self.layer_mut(id).ok_or(ValidationError::UnknownLayer(id))?;
        if !layer.is_grid() {
            return Err(ValidationError::NotAGridLayer(id));
        }
        Ok(layer)
    }

    /// Flat data index of a world coordinate inside a grid layer.
    pub fn index_of(&self, layer_id: LayerId, at: Coordinates) -> Result<usize, ValidationError> {
        let layer = self.grid_layer(layer_id)?;
        let bounds = layer.bounds().ok_or(ValidationError::NotAGridLayer(layer_id))?;
        bounds
            .local_index(at.x, at.y)
            .ok_or(ValidationError::OutOfBoundsIndex {
                layer_id,
                index: (at.y as i64 - layer.y as i64)
                    .saturating_mul(bounds.width as i64)
                    .saturating_add(at.x as i64 - layer.x as i64)
                    .max(0) as usize,
                len: bounds.area(),
            })
    }

    /// The tileset whose gid range holds `gid`.
    pub fn tileset_for(&self, gid: TileId) -> Option<&Tileset> {
        self.tilesets.iter().find(|t| t.contains_gid(gid))
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
