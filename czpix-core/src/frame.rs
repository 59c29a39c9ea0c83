//! Reusable per-crystal frame image buffer.
//!
//! Layout is `[crystal][frame_slot][logical_pixel]`, flat. Slot `s` of a
//! chunk starting at global frame `f0` holds frame `f0 + s`.

use crate::config::RunConfig;
use crate::{Error, Result};
use std::ops::Range;

/// Flat frame buffer holding `max_frames` frames of every crystal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameBuffer {
    n_crystals: usize,
    max_frames: usize,
    n_pixels: usize,
    data: Vec<u16>,
}

impl FrameBuffer {
    /// Allocates a zeroed buffer.
    #[must_use]
    pub fn new(n_crystals: usize, max_frames: usize, n_pixels: usize) -> Self {
        Self {
            n_crystals,
            max_frames,
            n_pixels,
            data: vec![0; n_crystals * max_frames * n_pixels],
        }
    }

    /// Allocates a buffer sized for `config`.
    #[must_use]
    pub fn for_config(config: &RunConfig) -> Self {
        Self::new(
            config.n_crystals,
            config.max_frames_size,
            config.geometry.n_pixels,
        )
    }

    /// Number of crystal planes.
    #[must_use]
    pub fn n_crystals(&self) -> usize {
        self.n_crystals
    }

    /// Frame capacity per crystal.
    #[must_use]
    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Logical pixels per frame.
    #[must_use]
    pub fn n_pixels(&self) -> usize {
        self.n_pixels
    }

    fn plane_len(&self) -> usize {
        self.max_frames * self.n_pixels
    }

    /// Image of `crystal` at frame slot `slot`.
    ///
    /// # Panics
    /// Panics if `crystal` or `slot` is out of range.
    #[must_use]
    pub fn frame(&self, crystal: usize, slot: usize) -> &[u16] {
        self.crystal_frames(crystal).frame(slot)
    }

    /// Read-only view of every frame slot of `crystal`.
    ///
    /// # Panics
    /// Panics if `crystal` is out of range.
    #[must_use]
    pub fn crystal_frames(&self, crystal: usize) -> CrystalFrames<'_> {
        assert!(
            crystal < self.n_crystals,
            "crystal {crystal} out of range ({} crystals)",
            self.n_crystals
        );
        let plane = self.plane_len();
        CrystalFrames {
            data: &self.data[crystal * plane..(crystal + 1) * plane],
            n_pixels: self.n_pixels,
        }
    }

    /// Zeroes frame slots `[slot, max_frames)` of every crystal.
    pub fn zero_from(&mut self, slot: usize) {
        let slot = slot.min(self.max_frames);
        let plane = self.plane_len().max(1);
        let start = slot * self.n_pixels;
        for chunk in self.data.chunks_mut(plane) {
            chunk[start..].fill(0);
        }
    }

    /// Zeroes the whole buffer.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Splits the slot ranges `ranges` into disjoint mutable views.
    ///
    /// Each returned [`FramesMut`] owns the frames of its range in every
    /// crystal plane, so the views can be handed to different workers.
    ///
    /// # Errors
    /// Returns [`Error::FrameRange`] if the ranges are not ascending,
    /// overlap, or exceed the buffer capacity.
    pub fn split_for_workers(&mut self, ranges: &[Range<usize>]) -> Result<Vec<FramesMut<'_>>> {
        let mut cursor = 0;
        for range in ranges {
            if range.start < cursor || range.end < range.start || range.end > self.max_frames {
                return Err(Error::FrameRange {
                    start: range.start as u64,
                    end: range.end as u64,
                    capacity: self.max_frames,
                });
            }
            cursor = range.end;
        }

        let n_pixels = self.n_pixels;
        let plane = self.plane_len().max(1);
        let mut parts: Vec<FramesMut<'_>> = ranges
            .iter()
            .map(|range| FramesMut {
                slots: range.clone(),
                n_pixels,
                planes: Vec::with_capacity(self.n_crystals),
            })
            .collect();

        for mut rest in self.data.chunks_mut(plane) {
            let mut cursor = 0;
            for part in &mut parts {
                let skip = (part.slots.start - cursor) * n_pixels;
                let (_, tail) = std::mem::take(&mut rest).split_at_mut(skip);
                let (head, tail) = tail.split_at_mut(part.slots.len() * n_pixels);
                part.planes.push(head);
                rest = tail;
                cursor = part.slots.end;
            }
        }
        Ok(parts)
    }
}

/// Read-only frames of one crystal.
#[derive(Clone, Copy, Debug)]
pub struct CrystalFrames<'a> {
    data: &'a [u16],
    n_pixels: usize,
}

impl<'a> CrystalFrames<'a> {
    /// Wraps a flat `[frame][pixel]` slice.
    ///
    /// # Panics
    /// Panics if `data.len()` is not a multiple of `n_pixels`.
    #[must_use]
    pub fn new(data: &'a [u16], n_pixels: usize) -> Self {
        assert!(
            n_pixels > 0 && data.len() % n_pixels == 0,
            "frame data of {} samples is not a whole number of {n_pixels}-pixel frames",
            data.len()
        );
        Self { data, n_pixels }
    }

    /// Number of frame slots.
    #[must_use]
    pub fn n_frames(&self) -> usize {
        self.data.len() / self.n_pixels
    }

    /// Logical pixels per frame.
    #[must_use]
    pub fn n_pixels(&self) -> usize {
        self.n_pixels
    }

    /// Image at slot `slot`.
    ///
    /// # Panics
    /// Panics if `slot` is out of range.
    #[must_use]
    pub fn frame(&self, slot: usize) -> &'a [u16] {
        &self.data[slot * self.n_pixels..(slot + 1) * self.n_pixels]
    }
}

/// Mutable view over a contiguous slot range of every crystal plane.
#[derive(Debug)]
pub struct FramesMut<'a> {
    slots: Range<usize>,
    n_pixels: usize,
    planes: Vec<&'a mut [u16]>,
}

impl FramesMut<'_> {
    /// Slot range covered by this view.
    #[must_use]
    pub fn slots(&self) -> Range<usize> {
        self.slots.clone()
    }

    /// Mutable image of `crystal` at absolute slot `slot`.
    ///
    /// # Panics
    /// Panics if `slot` is outside [`Self::slots`] or `crystal` is out of range.
    pub fn frame_mut(&mut self, crystal: usize, slot: usize) -> &mut [u16] {
        assert!(
            self.slots.contains(&slot),
            "slot {slot} outside worker range {:?}",
            self.slots
        );
        let local = slot - self.slots.start;
        &mut self.planes[crystal][local * self.n_pixels..(local + 1) * self.n_pixels]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let mut buffer = FrameBuffer::new(2, 3, 4);
        {
            let mut parts = buffer.split_for_workers(&[0..3]).unwrap();
            parts[0].frame_mut(1, 2)[3] = 7;
        }
        assert_eq!(buffer.frame(1, 2), &[0, 0, 0, 7]);
        assert_eq!(buffer.crystal_frames(1).n_frames(), 3);
        assert!(buffer.frame(0, 2).iter().all(|&v| v == 0));
    }

    #[test]
    fn test_split_views_are_disjoint() {
        let mut buffer = FrameBuffer::new(2, 6, 2);
        {
            let mut parts = buffer.split_for_workers(&[0..2, 2..4, 4..5]).unwrap();
            assert_eq!(parts.len(), 3);
            for (i, part) in parts.iter_mut().enumerate() {
                for slot in part.slots() {
                    for crystal in 0..2 {
                        part.frame_mut(crystal, slot).fill(i as u16 + 1);
                    }
                }
            }
        }
        assert_eq!(buffer.frame(0, 1), &[1, 1]);
        assert_eq!(buffer.frame(1, 3), &[2, 2]);
        assert_eq!(buffer.frame(1, 4), &[3, 3]);
        assert_eq!(buffer.frame(0, 5), &[0, 0]);
    }

    #[test]
    fn test_split_rejects_overlap() {
        let mut buffer = FrameBuffer::new(1, 4, 2);
        assert!(buffer.split_for_workers(&[0..3, 2..4]).is_err());
        assert!(buffer.split_for_workers(&[0..5]).is_err());
    }

    #[test]
    fn test_zero_from() {
        let mut buffer = FrameBuffer::new(2, 3, 2);
        {
            let mut parts = buffer.split_for_workers(&[0..3]).unwrap();
            for crystal in 0..2 {
                for slot in 0..3 {
                    parts[0].frame_mut(crystal, slot).fill(9);
                }
            }
        }
        buffer.zero_from(1);
        assert_eq!(buffer.frame(0, 0), &[9, 9]);
        assert_eq!(buffer.frame(1, 0), &[9, 9]);
        assert_eq!(buffer.frame(0, 1), &[0, 0]);
        assert_eq!(buffer.frame(1, 2), &[0, 0]);
    }
}
