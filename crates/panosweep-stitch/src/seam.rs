//! Seam estimation between overlapping warped frames.
//!
//! Pairs are visited in index order. For each pair the overlap rectangle
//! is cut by a minimum-cost 8-connected path found by dynamic
//! programming, where the cost of a pixel is the color difference of the
//! two frames there. Pixels that are not valid in both frames are made
//! very expensive so the cut stays inside the shared region. Each shared
//! pixel then belongs to whichever frame lies on its side of the cut.

use crate::types::GrayImage;
use crate::warp::{Rect, WarpedFrame};

/// Cost of crossing a pixel that only one frame (or none) covers.
const OUTSIDE_COST: f64 = 1e6;

/// Extra cost at the overlap edges, falling linearly to zero at its middle.
/// Breaks ties in flat regions in favour of a centered cut.
const CENTER_BIAS: f64 = 8.0;

/// A cut through an overlap: for each step along the major axis, the
/// first cross-axis offset that belongs to the far frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cut {
    pub vertical: bool,
    pub positions: Vec<usize>,
}

/// Maps `(step, offset)` in cut space to surface coordinates.
#[derive(Debug, Clone, Copy)]
struct CutSpace {
    region: Rect,
    vertical: bool,
}

impl CutSpace {
    const fn steps(&self) -> usize {
        if self.vertical {
            self.region.height as usize
        } else {
            self.region.width as usize
        }
    }

    const fn span(&self) -> usize {
        if self.vertical {
            self.region.width as usize
        } else {
            self.region.height as usize
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    const fn surface(&self, step: usize, offset: usize) -> (i32, i32) {
        if self.vertical {
            (self.region.x + offset as i32, self.region.y + step as i32)
        } else {
            (self.region.x + step as i32, self.region.y + offset as i32)
        }
    }
}

#[allow(clippy::cast_sign_loss)]
fn local(frame: &WarpedFrame, u: i32, v: i32) -> (u32, u32) {
    ((u - frame.corner.0) as u32, (v - frame.corner.1) as u32)
}

fn owned(mask: &GrayImage, frame: &WarpedFrame, u: i32, v: i32) -> bool {
    let (x, y) = local(frame, u, v);
    mask.get_pixel(x, y).0[0] > 0
}

fn color_difference(a: &WarpedFrame, b: &WarpedFrame, u: i32, v: i32) -> f64 {
    let (ax, ay) = local(a, u, v);
    let (bx, by) = local(b, u, v);
    let pa = a.image.get_pixel(ax, ay).0;
    let pb = b.image.get_pixel(bx, by).0;
    pa.iter()
        .zip(pb.iter())
        .map(|(&x, &y)| f64::from(x.abs_diff(y)))
        .sum()
}

/// Minimum-cost cut through a `steps` x `span` cost grid.
///
/// Ties resolve to the smallest offset, which keeps the result
/// deterministic.
#[must_use]
pub fn min_cost_path(cost: &[f64], steps: usize, span: usize) -> Vec<usize> {
    if steps == 0 || span == 0 {
        return Vec::new();
    }
    let mut acc = cost[..span].to_vec();
    let mut back = vec![0usize; steps * span];
    for step in 1..steps {
        let mut next = vec![0.0; span];
        for offset in 0..span {
            let lo = offset.saturating_sub(1);
            let hi = (offset + 1).min(span - 1);
            let mut best = lo;
            for candidate in lo..=hi {
                if acc[candidate] < acc[best] {
                    best = candidate;
                }
            }
            next[offset] = acc[best] + cost[step * span + offset];
            back[step * span + offset] = best;
        }
        acc = next;
    }

    let mut end = 0;
    for offset in 1..span {
        if acc[offset] < acc[end] {
            end = offset;
        }
    }
    let mut path = vec![0; steps];
    path[steps - 1] = end;
    for step in (1..steps).rev() {
        path[step - 1] = back[step * span + path[step]];
    }
    path
}

/// Cut the overlap of `a` and `b` given their current ownership masks,
/// and remove the pixels each frame lost from its mask.
///
/// Returns the cut, or `None` when the frames share no pixels.
pub fn cut_pair(
    a: &WarpedFrame,
    mask_a: &mut GrayImage,
    b: &WarpedFrame,
    mask_b: &mut GrayImage,
) -> Option<Cut> {
    let region = a.rect().intersect(&b.rect())?;
    let (acx, acy) = a.rect().center();
    let (bcx, bcy) = b.rect().center();
    let vertical = (acx - bcx).abs() >= (acy - bcy).abs();
    let a_first = if vertical { acx <= bcx } else { acy <= bcy };
    let space = CutSpace { region, vertical };
    let (steps, span) = (space.steps(), space.span());

    #[allow(clippy::cast_precision_loss)]
    let (half, bias_scale) = (span as f64 / 2.0, CENTER_BIAS / span as f64);
    let mut shared = false;
    let mut cost = vec![OUTSIDE_COST; steps * span];
    for step in 0..steps {
        for offset in 0..span {
            let (u, v) = space.surface(step, offset);
            if owned(mask_a, a, u, v) && owned(mask_b, b, u, v) {
                shared = true;
                #[allow(clippy::cast_precision_loss)]
                let bias = bias_scale * 2.0 * (offset as f64 - half).abs();
                cost[step * span + offset] = 1.0 + bias + color_difference(a, b, u, v);
            }
        }
    }
    if !shared {
        return None;
    }

    let positions = min_cost_path(&cost, steps, span);
    for (step, &cut) in positions.iter().enumerate() {
        for offset in 0..span {
            let (u, v) = space.surface(step, offset);
            if !(owned(mask_a, a, u, v) && owned(mask_b, b, u, v)) {
                continue;
            }
            let first_side = offset < cut;
            let (loser, loser_mask) = if first_side == a_first {
                (b, &mut *mask_b)
            } else {
                (a, &mut *mask_a)
            };
            let (x, y) = local(loser, u, v);
            loser_mask.put_pixel(x, y, image::Luma([0]));
        }
    }

    Some(Cut {
        vertical,
        positions,
    })
}

/// Ownership masks for all frames: each surface pixel covered by any frame
/// is owned by exactly one of them.
#[must_use]
pub fn find_seams(frames: &[WarpedFrame]) -> Vec<GrayImage> {
    let mut masks: Vec<GrayImage> = frames.iter().map(|f| f.mask.clone()).collect();
    for i in 0..frames.len() {
        for j in (i + 1)..frames.len() {
            let (head, tail) = masks.split_at_mut(j);
            cut_pair(&frames[i], &mut head[i], &frames[j], &mut tail[0]);
        }
    }
    masks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RgbImage;

    fn frame(corner: (i32, i32), w: u32, h: u32, color: [u8; 3]) -> WarpedFrame {
        WarpedFrame {
            image: RgbImage::from_pixel(w, h, image::Rgb(color)),
            mask: GrayImage::from_pixel(w, h, image::Luma([255])),
            corner,
        }
    }

    #[test]
    fn path_follows_cheap_column() {
        // 4 steps x 5 offsets; column 3 is free.
        let mut cost = vec![10.0; 20];
        for step in 0..4 {
            cost[step * 5 + 3] = 0.0;
        }
        assert_eq!(min_cost_path(&cost, 4, 5), vec![3, 3, 3, 3]);
    }

    #[test]
    fn path_moves_at_most_one_per_step() {
        let cost: Vec<f64> = (0..30).map(|i| f64::from(i * 7 % 11)).collect();
        let path = min_cost_path(&cost, 6, 5);
        for pair in path.windows(2) {
            assert!(pair[0].abs_diff(pair[1]) <= 1);
        }
    }

    #[test]
    fn every_shared_pixel_gets_one_owner() {
        let frames = vec![
            frame((0, 0), 40, 30, [200, 10, 10]),
            frame((25, 2), 40, 30, [10, 200, 10]),
        ];
        let masks = find_seams(&frames);
        for v in 0..40 {
            for u in -5..80 {
                let covered: Vec<bool> = frames
                    .iter()
                    .zip(&masks)
                    .map(|(f, m)| {
                        f.rect().intersect(&Rect::new(u, v, 1, 1)).is_some() && owned(m, f, u, v)
                    })
                    .collect();
                let any_valid = frames.iter().any(|f| f.covers(u, v));
                let owners = covered.iter().filter(|&&c| c).count();
                assert_eq!(owners, usize::from(any_valid), "pixel ({u}, {v})");
            }
        }
    }

    #[test]
    fn left_frame_keeps_left_part_of_overlap() {
        let frames = vec![
            frame((0, 0), 40, 30, [200, 10, 10]),
            frame((20, 0), 40, 30, [10, 200, 10]),
        ];
        let masks = find_seams(&frames);
        // Leftmost overlap column stays with frame 0 somewhere.
        assert!(owned(&masks[0], &frames[0], 20, 15) || owned(&masks[1], &frames[1], 20, 15));
        // Far side of the overlap never belongs to frame 0 past its edge.
        assert!(owned(&masks[1], &frames[1], 50, 15));
        assert!(owned(&masks[0], &frames[0], 5, 15));
    }

    #[test]
    fn disjoint_frames_keep_their_masks() {
        let frames = vec![
            frame((0, 0), 10, 10, [0, 0, 0]),
            frame((50, 50), 10, 10, [0, 0, 0]),
        ];
        let masks = find_seams(&frames);
        assert_eq!(masks[0], frames[0].mask);
        assert_eq!(masks[1], frames[1].mask);
    }
}
