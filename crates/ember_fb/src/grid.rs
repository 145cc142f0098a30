//! Image-space tile grid.
//!
//! Divides the image into fixed-size tile cells that can be rendered
//! independently and in parallel. Cell indices are row-major and stable for
//! the life of the framebuffer; only the *traversal* order changes when
//! workers walk the grid spiral-first.

use crate::tile::TileDesc;

/// Fixed partition of an image into tile cells.
#[derive(Debug, Clone)]
pub struct TileGrid {
    image_width: u32,
    image_height: u32,
    tile_size: u32,
    cols: u32,
    rows: u32,
    cells: Vec<TileDesc>,
}

impl TileGrid {
    /// Partition a `width x height` image into `tile_size` cells, clipping
    /// cells on the right/bottom edge.
    pub fn new(width: u32, height: u32, tile_size: u32) -> Self {
        assert!(width > 0 && height > 0, "image extents must be non-zero");
        assert!(tile_size > 0, "tile size must be non-zero");

        let cols = width.div_ceil(tile_size);
        let rows = height.div_ceil(tile_size);
        let mut cells = Vec::with_capacity((cols * rows) as usize);
        let mut cell = 0;
        let mut y = 0;
        while y < height {
            let mut x = 0;
            while x < width {
                let tw = tile_size.min(width - x);
                let th = tile_size.min(height - y);
                cells.push(TileDesc::new(x, y, tw, th, cell));
                cell += 1;
                x += tile_size;
            }
            y += tile_size;
        }

        Self {
            image_width: width,
            image_height: height,
            tile_size,
            cols,
            rows,
            cells,
        }
    }

    pub fn image_width(&self) -> u32 {
        self.image_width
    }

    pub fn image_height(&self) -> u32 {
        self.image_height
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Number of cell columns.
    pub fn cols(&self) -> u32 {
        self.cols
    }

    /// Number of cell rows.
    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Number of cells in the grid.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[TileDesc] {
        &self.cells
    }

    pub fn cell(&self, index: usize) -> TileDesc {
        self.cells[index]
    }

    /// Cell index containing the given image-space pixel.
    pub fn cell_at(&self, x: u32, y: u32) -> usize {
        debug_assert!(x < self.image_width && y < self.image_height);
        ((y / self.tile_size) * self.cols + x / self.tile_size) as usize
    }

    /// Cells sorted by distance from the image center, nearest first.
    ///
    /// This mimics the rendering pattern of production renderers, where
    /// buckets are rendered from the center outward so the most important
    /// parts of the image converge first.
    pub fn spiral_order(&self) -> Vec<TileDesc> {
        let center_x = self.image_width as f32 / 2.0;
        let center_y = self.image_height as f32 / 2.0;

        let mut order = self.cells.clone();
        order.sort_by(|a, b| {
            let a_dist = (a.x as f32 + a.width as f32 / 2.0 - center_x).powi(2)
                + (a.y as f32 + a.height as f32 / 2.0 - center_y).powi(2);
            let b_dist = (b.x as f32 + b.width as f32 / 2.0 - center_x).powi(2)
                + (b.y as f32 + b.height as f32 / 2.0 - center_y).powi(2);
            a_dist.partial_cmp(&b_dist).unwrap_or(std::cmp::Ordering::Equal)
        });
        order
    }
}
