//! Destructible terrain grid shared by the server simulation and the client replica

use crate::{LAND_HEIGHT, LAND_WIDTH};

/// State of a single terrain cell as seen through [`TerrainMap::get`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    Empty,
    Solid,
    /// Anything outside the grid. Treated as impassable by every caller.
    OutOfBounds,
}

impl Cell {
    /// Wire byte for an in-bounds cell
    pub fn to_byte(self) -> u8 {
        match self {
            Cell::Solid => 1,
            Cell::Empty | Cell::OutOfBounds => 0,
        }
    }

    /// Wire byte to cell. Any non-zero byte is solid.
    pub fn from_byte(byte: u8) -> Self {
        if byte == 0 {
            Cell::Empty
        } else {
            Cell::Solid
        }
    }

    /// True for solid ground and for the out-of-bounds sentinel
    pub fn is_blocking(self) -> bool {
        self != Cell::Empty
    }
}

/// Axis-aligned rectangle of cells, always expressed in grid coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Left column
    pub x: u16,
    /// Top row
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Region {
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Clamps an arbitrary rectangle to a `map_width` × `map_height` grid.
    /// Returns `None` when nothing of it remains.
    pub fn clip(
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        map_width: usize,
        map_height: usize,
    ) -> Option<Region> {
        let x0 = x.max(0);
        let y0 = y.max(0);
        let x1 = x.saturating_add(width).min(map_width as i32);
        let y1 = y.saturating_add(height).min(map_height as i32);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(Region::new(
            x0 as u16,
            y0 as u16,
            (x1 - x0) as u16,
            (y1 - y0) as u16,
        ))
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Raised by [`TerrainMap::write_region`] when a region cannot be applied
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("region {0:?} exceeds the terrain bounds")]
    OutOfBounds(Region),

    #[error("region needs {expected} cells but {actual} were supplied")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Row-major binary grid of solid/empty cells
///
/// Every accessor is total: reads outside the grid return
/// [`Cell::OutOfBounds`] and writes outside the grid are ignored, so callers
/// never need their own boundary checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerrainMap {
    width: usize,
    height: usize,
    cells: Vec<u8>,
}

impl TerrainMap {
    /// Creates an all-empty grid
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            cells: vec![0; width * height],
        }
    }

    /// Standard starting map: upper half empty, lower half solid
    pub fn with_horizon(width: usize, height: usize) -> Self {
        let mut map = Self::new(width, height);
        let horizon = height / 2;
        for row in map.cells.chunks_mut(width).skip(horizon) {
            row.fill(1);
        }
        map
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Region covering the whole grid
    pub fn bounds(&self) -> Region {
        Region::new(0, 0, self.width as u16, self.height as u16)
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(y as usize * self.width + x as usize)
    }

    /// Cell at (`x`, `y`)
    ///
    /// Never panics: coordinates outside the grid, negative ones included,
    /// read as [`Cell::OutOfBounds`]. Bullets and tanks rely on that to treat
    /// the map edge as a wall.
    pub fn get(&self, x: i32, y: i32) -> Cell {
        match self.index(x, y) {
            Some(i) => Cell::from_byte(self.cells[i]),
            None => Cell::OutOfBounds,
        }
    }

    /// Writes one cell
    ///
    /// Out-of-grid coordinates are ignored, and so is [`Cell::OutOfBounds`]
    /// as a value, since it has no stored representation.
    pub fn set(&mut self, x: i32, y: i32, cell: Cell) {
        if cell == Cell::OutOfBounds {
            return;
        }
        if let Some(i) = self.index(x, y) {
            self.cells[i] = cell.to_byte();
        }
    }

    pub fn is_empty_at(&self, x: i32, y: i32) -> bool {
        self.get(x, y) == Cell::Empty
    }

    /// Sets every in-bounds cell strictly inside radius `r` of (`cx`, `cy`)
    /// to `fill` and returns the clipped bounding box that may have changed.
    pub fn carve_circle(&mut self, cx: i32, cy: i32, r: i32, fill: Cell) -> Option<Region> {
        if r <= 0 {
            return None;
        }

        let r_sq = r * r;
        for dy in -r..=r {
            for dx in -r..=r {
                if dx * dx + dy * dy < r_sq {
                    self.set(cx + dx, cy + dy, fill);
                }
            }
        }

        Region::clip(cx - r, cy - r, r * 2, r * 2, self.width, self.height)
    }

    /// Raw row-major cell bytes of `region`. Cells outside the grid read as empty.
    pub fn serialize_region(&self, region: Region) -> Vec<u8> {
        let mut out = Vec::with_capacity(region.area());
        for y in region.y as i32..region.y as i32 + region.height as i32 {
            for x in region.x as i32..region.x as i32 + region.width as i32 {
                out.push(self.get(x, y).to_byte());
            }
        }
        out
    }

    /// Overwrites `region` with row-major `cells`, the inverse of [`Self::serialize_region`]
    pub fn write_region(&mut self, region: Region, cells: &[u8]) -> Result<(), RegionError> {
        if region.x as usize + region.width as usize > self.width
            || region.y as usize + region.height as usize > self.height
        {
            return Err(RegionError::OutOfBounds(region));
        }
        if cells.len() != region.area() {
            return Err(RegionError::LengthMismatch {
                expected: region.area(),
                actual: cells.len(),
            });
        }

        let row_len = region.width as usize;
        if row_len == 0 {
            return Ok(());
        }
        for (row, src) in cells.chunks(row_len).enumerate() {
            let start = (region.y as usize + row) * self.width + region.x as usize;
            for (dst, &byte) in self.cells[start..start + row_len].iter_mut().zip(src) {
                *dst = Cell::from_byte(byte).to_byte();
            }
        }
        Ok(())
    }

    /// Every cell in row-major order, 0 for empty and 1 for solid
    pub fn as_bytes(&self) -> &[u8] {
        &self.cells
    }
}

impl Default for TerrainMap {
    fn default() -> Self {
        Self::with_horizon(LAND_WIDTH, LAND_HEIGHT)
    }
}
