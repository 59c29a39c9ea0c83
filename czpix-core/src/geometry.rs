//! Detector geometry and readout remapping.
//!
//! The ADC chain emits the samples of one crystal in a multiplexed order:
//! within a physical row, readout pins are visited first and readout bands
//! (groups) second. [`build_pixel_order`] turns that order into logical
//! pixel ids, optionally folding the premerge grid into merged pixels where
//! only one representative sub-pixel per merge group keeps its sample.

use crate::{Error, Result};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Immutable geometry of one crystal and its readout multiplexing.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GeometryConfig {
    /// Rows of the physical (premerge) pixel grid.
    pub n_rows_premerge: usize,
    /// Columns of the physical (premerge) pixel grid.
    pub n_cols_premerge: usize,
    /// Readout pins per band.
    pub n_readout_pixels: usize,
    /// Readout bands (groups).
    pub n_readout_groups: usize,
    /// Premerge pixel count (`n_rows_premerge * n_cols_premerge`).
    pub n_pixels_premerge: usize,
    /// Logical (post-merge) pixel count.
    pub n_pixels: usize,
    /// Row fold factor of the merge.
    pub row_merge_fold: usize,
    /// Column fold factor of the merge.
    pub col_merge_fold: usize,
    /// Row offset of the representative sub-pixel inside a merge group.
    pub row_merge_index: usize,
    /// Column offset of the representative sub-pixel inside a merge group.
    pub col_merge_index: usize,
    /// Logical (post-merge) column count.
    pub n_cols: usize,
}

impl GeometryConfig {
    /// Unmerged geometry where logical pixels are the physical pixels.
    #[must_use]
    pub fn unmerged(
        n_rows: usize,
        n_cols: usize,
        n_readout_pixels: usize,
        n_readout_groups: usize,
    ) -> Self {
        Self {
            n_rows_premerge: n_rows,
            n_cols_premerge: n_cols,
            n_readout_pixels,
            n_readout_groups,
            n_pixels_premerge: n_rows * n_cols,
            n_pixels: n_rows * n_cols,
            row_merge_fold: 1,
            col_merge_fold: 1,
            row_merge_index: 0,
            col_merge_index: 0,
            n_cols,
        }
    }

    /// Sets the merge folds and representative sub-pixel, deriving the
    /// post-merge pixel and column counts.
    #[must_use]
    pub fn with_merge(
        mut self,
        row_fold: usize,
        col_fold: usize,
        row_index: usize,
        col_index: usize,
    ) -> Self {
        self.row_merge_fold = row_fold;
        self.col_merge_fold = col_fold;
        self.row_merge_index = row_index;
        self.col_merge_index = col_index;
        if row_fold > 0 && col_fold > 0 {
            self.n_cols = self.n_cols_premerge / col_fold;
            self.n_pixels = (self.n_rows_premerge / row_fold) * self.n_cols;
        }
        self
    }

    /// Returns true when premerge pixels are folded into fewer logical pixels.
    #[must_use]
    pub fn is_merged(&self) -> bool {
        self.n_pixels != self.n_pixels_premerge
    }

    /// Logical (post-merge) row count.
    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.n_pixels / self.n_cols.max(1)
    }

    /// Adjacency helper for the logical pixel grid.
    #[must_use]
    pub fn grid(&self) -> PixelGrid {
        PixelGrid::new(self.n_cols, self.n_pixels)
    }

    /// Checks the geometry invariants.
    ///
    /// # Errors
    /// Returns [`Error::InvalidGeometry`] describing the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::InvalidGeometry(msg));

        if self.n_rows_premerge == 0 || self.n_cols_premerge == 0 {
            return fail("premerge grid must have at least one row and one column".into());
        }
        if self.n_pixels_premerge != self.n_rows_premerge * self.n_cols_premerge {
            return fail(format!(
                "N_PIXELS_PREMERGE = {} but grid is {}x{}",
                self.n_pixels_premerge, self.n_rows_premerge, self.n_cols_premerge
            ));
        }
        if self.n_readout_pixels * self.n_readout_groups != self.n_cols_premerge {
            return fail(format!(
                "{} readout pins x {} bands does not cover {} premerge columns",
                self.n_readout_pixels, self.n_readout_groups, self.n_cols_premerge
            ));
        }
        if self.n_cols == 0 || self.n_pixels == 0 {
            return fail("post-merge grid must not be empty".into());
        }

        if !self.is_merged() {
            if self.n_cols != self.n_cols_premerge {
                return fail(format!(
                    "merging disabled but N_COLS = {} differs from N_COLS_PREMERGE = {}",
                    self.n_cols, self.n_cols_premerge
                ));
            }
            return Ok(());
        }

        if self.row_merge_fold == 0 || self.col_merge_fold == 0 {
            return fail("merge folds must be at least 1".into());
        }
        if self.row_merge_index >= self.row_merge_fold
            || self.col_merge_index >= self.col_merge_fold
        {
            return fail(format!(
                "merge index ({}, {}) outside fold ({}, {})",
                self.row_merge_index, self.col_merge_index, self.row_merge_fold, self.col_merge_fold
            ));
        }
        if self.n_rows_premerge % self.row_merge_fold != 0
            || self.n_cols_premerge % self.col_merge_fold != 0
        {
            return fail(format!(
                "fold ({}, {}) does not divide the {}x{} premerge grid",
                self.row_merge_fold, self.col_merge_fold, self.n_rows_premerge, self.n_cols_premerge
            ));
        }
        if self.n_cols != self.n_cols_premerge / self.col_merge_fold {
            return fail(format!(
                "N_COLS = {} but premerge columns fold to {}",
                self.n_cols,
                self.n_cols_premerge / self.col_merge_fold
            ));
        }
        let expected = (self.n_rows_premerge / self.row_merge_fold) * self.n_cols;
        if self.n_pixels != expected {
            return fail(format!(
                "N_PIXELS = {} but the merged grid holds {expected} pixels",
                self.n_pixels
            ));
        }
        Ok(())
    }
}

/// Readout-slot to logical-pixel lookup table.
///
/// Entry `k` is the logical pixel fed by the `k`-th sample of a crystal in
/// one frame, or `None` when that premerge pixel is not represented after
/// merging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelOrder {
    slots: Vec<Option<u32>>,
    n_pixels: usize,
}

impl PixelOrder {
    /// Number of readout slots (premerge pixels).
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the table has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Logical pixel count the table maps into.
    #[must_use]
    pub fn n_pixels(&self) -> usize {
        self.n_pixels
    }

    /// Logical pixel for readout slot `slot`.
    #[inline]
    #[must_use]
    pub fn get(&self, slot: usize) -> Option<u32> {
        self.slots.get(slot).copied().flatten()
    }

    /// All slots in readout order.
    #[must_use]
    pub fn as_slice(&self) -> &[Option<u32>] {
        &self.slots
    }

    /// Iterates `(slot, logical_pixel)` for the slots that survive merging.
    pub fn mapped(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, pixel)| pixel.map(|p| (slot, p as usize)))
    }
}

/// Column visiting order of one physical row: pins first, then bands.
fn readout_column_order(geometry: &GeometryConfig) -> Vec<usize> {
    let mut order = Vec::with_capacity(geometry.n_cols_premerge);
    for pin in 0..geometry.n_readout_pixels {
        for band in 0..geometry.n_readout_groups {
            order.push(pin + band * geometry.n_readout_pixels);
        }
    }
    order
}

/// Builds the readout-slot to logical-pixel table for `geometry`.
///
/// The geometry is expected to have passed [`GeometryConfig::validate`].
/// Without merging the result is the premerge visiting order itself.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn build_pixel_order(geometry: &GeometryConfig) -> PixelOrder {
    let col_order = readout_column_order(geometry);
    let premerge = (0..geometry.n_rows_premerge)
        .flat_map(|row| col_order.iter().map(move |&col| (row, col)));

    let slots = if geometry.is_merged() {
        premerge
            .map(|(row, col)| {
                if row % geometry.row_merge_fold != geometry.row_merge_index
                    || col % geometry.col_merge_fold != geometry.col_merge_index
                {
                    return None;
                }
                let row_post = (row - geometry.row_merge_index) / geometry.row_merge_fold;
                let col_post = (col - geometry.col_merge_index) / geometry.col_merge_fold;
                Some((row_post * geometry.n_cols + col_post) as u32)
            })
            .collect()
    } else {
        premerge
            .map(|(row, col)| Some((row * geometry.n_cols_premerge + col) as u32))
            .collect()
    };

    PixelOrder {
        slots,
        n_pixels: geometry.n_pixels,
    }
}

/// Neighbourhood queries on the logical pixel grid.
///
/// Pixels are numbered row-major; neighbours never wrap across a row edge
/// and ids outside `[0, n_pixels)` are dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelGrid {
    n_cols: usize,
    n_pixels: usize,
}

impl PixelGrid {
    /// Creates a grid with `n_cols` columns and `n_pixels` pixels.
    #[must_use]
    pub fn new(n_cols: usize, n_pixels: usize) -> Self {
        Self {
            n_cols: n_cols.max(1),
            n_pixels,
        }
    }

    /// Number of pixels.
    #[must_use]
    pub fn n_pixels(&self) -> usize {
        self.n_pixels
    }

    /// Number of columns.
    #[must_use]
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// Up/down/left/right neighbours of `pixel`.
    #[inline]
    pub fn neighbors4(&self, pixel: usize) -> impl Iterator<Item = usize> {
        self.neighbors(pixel, false)
    }

    /// 4-neighbours plus diagonals of `pixel`.
    #[inline]
    pub fn neighbors8(&self, pixel: usize) -> impl Iterator<Item = usize> {
        self.neighbors(pixel, true)
    }

    fn neighbors(&self, pixel: usize, diagonal: bool) -> impl Iterator<Item = usize> {
        let col = pixel % self.n_cols;
        let has_left = col > 0;
        let has_right = col + 1 < self.n_cols;
        let has_up = pixel >= self.n_cols;
        let has_down = pixel + self.n_cols < self.n_pixels;
        let n_cols = self.n_cols;
        let n_pixels = self.n_pixels;

        let candidates = [
            (has_left, pixel.wrapping_sub(1)),
            (has_right, pixel + 1),
            (has_up, pixel.wrapping_sub(n_cols)),
            (has_down, pixel + n_cols),
            (diagonal && has_up && has_left, pixel.wrapping_sub(n_cols + 1)),
            (diagonal && has_up && has_right, pixel.wrapping_sub(n_cols).wrapping_add(1)),
            (diagonal && has_down && has_left, (pixel + n_cols).wrapping_sub(1)),
            (diagonal && has_down && has_right, pixel + n_cols + 1),
        ];
        candidates
            .into_iter()
            .filter(move |&(ok, id)| ok && id < n_pixels)
            .map(|(_, id)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(order: &PixelOrder) -> Vec<Option<u32>> {
        order.as_slice().to_vec()
    }

    #[test]
    fn test_unmerged_order_interleaves_pins_and_bands() {
        let geometry = GeometryConfig::unmerged(2, 4, 2, 2);
        geometry.validate().unwrap();
        let order = build_pixel_order(&geometry);
        let expected: Vec<Option<u32>> =
            [0, 2, 1, 3, 4, 6, 5, 7].iter().map(|&p| Some(p)).collect();
        assert_eq!(ids(&order), expected);
    }

    #[test]
    fn test_unmerged_order_is_permutation() {
        let geometry = GeometryConfig::unmerged(11, 12, 3, 4);
        geometry.validate().unwrap();
        let order = build_pixel_order(&geometry);
        let mut seen: Vec<u32> = order.as_slice().iter().map(|p| p.unwrap()).collect();
        seen.sort_unstable();
        let expected: Vec<u32> = (0..132).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_merged_order_covers_each_pixel_once() {
        let geometry = GeometryConfig::unmerged(8, 8, 4, 2).with_merge(2, 2, 1, 0);
        geometry.validate().unwrap();
        assert!(geometry.is_merged());
        assert_eq!(geometry.n_pixels, 16);
        assert_eq!(geometry.n_cols, 4);

        let order = build_pixel_order(&geometry);
        assert_eq!(order.len(), 64);
        let mut counts = vec![0usize; geometry.n_pixels];
        for (_, pixel) in order.mapped() {
            counts[pixel] += 1;
        }
        assert!(counts.iter().all(|&c| c == 1));
        assert_eq!(order.as_slice().iter().filter(|p| p.is_none()).count(), 48);
    }

    #[test]
    fn test_merged_representative_subpixel() {
        // 2x2 grid folded to a single pixel whose representative is (1, 1).
        let geometry = GeometryConfig::unmerged(2, 2, 2, 1).with_merge(2, 2, 1, 1);
        geometry.validate().unwrap();
        let order = build_pixel_order(&geometry);
        // Readout order is (0,0) (0,1) (1,0) (1,1).
        assert_eq!(ids(&order), vec![None, None, None, Some(0)]);
    }

    #[test]
    fn test_validate_rejects_bad_readout_cover() {
        let geometry = GeometryConfig::unmerged(2, 4, 3, 2);
        assert!(matches!(
            geometry.validate(),
            Err(Error::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_validate_rejects_non_dividing_fold() {
        let geometry = GeometryConfig::unmerged(3, 4, 2, 2).with_merge(2, 2, 0, 0);
        assert!(geometry.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_merge_index_outside_fold() {
        let geometry = GeometryConfig::unmerged(4, 4, 2, 2).with_merge(2, 2, 2, 0);
        assert!(geometry.validate().is_err());
    }

    #[test]
    fn test_neighbors_do_not_wrap_rows() {
        let grid = PixelGrid::new(4, 16);
        let mut left_edge: Vec<usize> = grid.neighbors4(4).collect();
        left_edge.sort_unstable();
        assert_eq!(left_edge, vec![0, 5, 8]);

        let mut right_edge: Vec<usize> = grid.neighbors4(7).collect();
        right_edge.sort_unstable();
        assert_eq!(right_edge, vec![3, 6, 11]);

        let mut corner: Vec<usize> = grid.neighbors8(0).collect();
        corner.sort_unstable();
        assert_eq!(corner, vec![1, 4, 5]);

        let mut last: Vec<usize> = grid.neighbors8(15).collect();
        last.sort_unstable();
        assert_eq!(last, vec![10, 11, 14]);
    }

    #[test]
    fn test_neighbors8_interior() {
        let grid = PixelGrid::new(4, 16);
        let mut around: Vec<usize> = grid.neighbors8(5).collect();
        around.sort_unstable();
        assert_eq!(around, vec![0, 1, 2, 4, 6, 8, 9, 10]);
    }
}
