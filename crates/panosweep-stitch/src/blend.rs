//! Blending: merge warped frames into one canvas.
//!
//! This module defines the [`Blender`] trait and the [`BlenderKind`] enum
//! that picks between the two blending strategies at runtime.
//!
//! # Strategy pattern
//!
//! Both blenders consume the same inputs (warped frames plus the seam
//! ownership masks) and produce the same [`Composite`], so the pipeline's
//! blend stage does not care which one the options selected.
//!
//! - [`FeatherBlender`] dilates each seam mask and weights pixels by their
//!   distance to the mask border, capped at one.
//! - [`MultiBandBlender`] splits every frame into a Laplacian pyramid and
//!   blends each band with a Gaussian-smoothed copy of the seam mask, so
//!   low frequencies mix over a wide region and detail over a narrow one.

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::distance_transform::{Norm, distance_transform};
use imageproc::morphology::dilate;
use rayon::prelude::*;

use crate::pyramid::{self, Plane};
use crate::types::{StitchConfig, StitchError};
use crate::warp::{Rect, WarpedFrame};

/// Upper bound on pyramid depth.
pub const MAX_BANDS: usize = 7;

/// Weight sums at or below this count as uncovered.
const WEIGHT_EPS: f32 = 1e-5;

/// Canvas-sized blend output before cropping.
#[derive(Debug, Clone)]
pub struct Composite {
    pub image: RgbImage,
    /// 255 where at least one frame contributed.
    pub coverage: GrayImage,
    /// Surface position of the canvas's top-left pixel.
    pub origin: (i32, i32),
}

/// Trait for blending strategies.
pub trait Blender {
    /// Blend `frames` into `canvas`. `seams[i]` is frame `i`'s ownership
    /// mask, in the frame's own pixel grid.
    fn blend(&self, frames: &[WarpedFrame], seams: &[GrayImage], canvas: Rect) -> Composite;
}

/// Distance-weighted averaging across dilated seams.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatherBlender {
    /// Weight gained per pixel of distance from the mask border.
    pub sharpness: f32,
}

/// Laplacian pyramid blending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiBandBlender {
    /// Number of band-pass levels; zero degenerates to a hard seam.
    pub bands: usize,
}

/// Selects which blender to use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlenderKind {
    Feather(FeatherBlender),
    MultiBand(MultiBandBlender),
}

impl BlenderKind {
    /// The blender for the `multi_band` toggle, sized for `canvas`.
    #[must_use]
    pub fn for_options(multi_band: bool, canvas: Rect, config: &StitchConfig) -> Self {
        if multi_band {
            Self::MultiBand(MultiBandBlender {
                bands: band_count(canvas, config.blend_strength),
            })
        } else {
            Self::Feather(FeatherBlender {
                sharpness: config.feather_sharpness,
            })
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Feather(_) => "feather",
            Self::MultiBand(_) => "multi_band",
        }
    }
}

impl Blender for BlenderKind {
    fn blend(&self, frames: &[WarpedFrame], seams: &[GrayImage], canvas: Rect) -> Composite {
        match self {
            Self::Feather(b) => b.blend(frames, seams, canvas),
            Self::MultiBand(b) => b.blend(frames, seams, canvas),
        }
    }
}

/// `ceil(log2(sqrt(area) * strength / 100)) - 1`, within `0..=MAX_BANDS`.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn band_count(canvas: Rect, strength: f32) -> usize {
    let width = (canvas.area() as f64).sqrt() * f64::from(strength) / 100.0;
    if width < 1.0 {
        return 0;
    }
    let bands = width.log2().ceil() - 1.0;
    (bands.max(0.0) as usize).min(MAX_BANDS)
}

/// Canvas offset of `frame`'s top-left pixel.
#[allow(clippy::cast_sign_loss)]
const fn offset_in(canvas: Rect, frame: &WarpedFrame) -> (usize, usize) {
    (
        (frame.corner.0 - canvas.x) as usize,
        (frame.corner.1 - canvas.y) as usize,
    )
}

// ───── Feather ─────────────────────────────────────────────────────

impl FeatherBlender {
    /// Seam dilation radius: half the distance over which weights ramp
    /// from zero to one.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn radius(&self) -> u8 {
        (0.5 / self.sharpness).ceil().clamp(1.0, 254.0) as u8
    }

    /// Per-pixel weights in `frame`'s grid; zero outside the dilated seam.
    #[must_use]
    pub fn weights(&self, frame: &WarpedFrame, seam: &GrayImage) -> Vec<f32> {
        let (w, h) = frame.mask.dimensions();
        if !seam.pixels().any(|p| p.0[0] > 0) {
            return vec![0.0; (w * h) as usize];
        }
        let grown = dilate(seam, Norm::LInf, self.radius());

        // Distance to the nearest pixel outside the blend mask, with the
        // frame border counting as outside.
        let mut outside = GrayImage::from_pixel(w + 2, h + 2, Luma([255]));
        for (x, y, m) in frame.mask.enumerate_pixels() {
            if m.0[0] > 0 && grown.get_pixel(x, y).0[0] > 0 {
                outside.put_pixel(x + 1, y + 1, Luma([0]));
            }
        }
        let distance = distance_transform(&outside, Norm::L1);

        let mut weights = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                let d = f32::from(distance.get_pixel(x + 1, y + 1).0[0]);
                weights.push((self.sharpness * d).min(1.0));
            }
        }
        weights
    }
}

impl Blender for FeatherBlender {
    fn blend(&self, frames: &[WarpedFrame], seams: &[GrayImage], canvas: Rect) -> Composite {
        let weights: Vec<Vec<f32>> = frames
            .par_iter()
            .zip(seams.par_iter())
            .map(|(frame, seam)| self.weights(frame, seam))
            .collect();

        let (cw, ch) = (canvas.width as usize, canvas.height as usize);
        let mut sums = vec![0.0f32; cw * ch * 3];
        let mut totals = vec![0.0f32; cw * ch];

        sums.par_chunks_mut(3 * cw.max(1))
            .zip(totals.par_chunks_mut(cw.max(1)))
            .enumerate()
            .for_each(|(row, (sum_row, total_row))| {
                for (frame, frame_weights) in frames.iter().zip(&weights) {
                    let (ox, oy) = offset_in(canvas, frame);
                    let (fw, fh) = frame.image.dimensions();
                    if row < oy || row >= oy + fh as usize {
                        continue;
                    }
                    let ly = row - oy;
                    for lx in 0..fw as usize {
                        let wgt = frame_weights[ly * fw as usize + lx];
                        if wgt <= 0.0 {
                            continue;
                        }
                        #[allow(clippy::cast_possible_truncation)]
                        let px = frame.image.get_pixel(lx as u32, ly as u32).0;
                        let cx = ox + lx;
                        for c in 0..3 {
                            sum_row[3 * cx + c] += wgt * f32::from(px[c]);
                        }
                        total_row[cx] += wgt;
                    }
                }
            });

        let mut image = RgbImage::new(canvas.width, canvas.height);
        let mut coverage = GrayImage::new(canvas.width, canvas.height);
        for (i, (px, cov)) in image.pixels_mut().zip(coverage.pixels_mut()).enumerate() {
            let total = totals[i];
            if total > WEIGHT_EPS {
                *px = Rgb(std::array::from_fn(|c| to_u8(sums[3 * i + c] / total)));
                *cov = Luma([255]);
            }
        }
        Composite {
            image,
            coverage,
            origin: (canvas.x, canvas.y),
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

// ───── Multi-band ──────────────────────────────────────────────────

/// One frame's contribution, positioned on the padded canvas.
struct BandStack {
    x: usize,
    y: usize,
    detail: Vec<Plane>,
    weight: Vec<Plane>,
}

impl MultiBandBlender {
    const fn cell(&self) -> usize {
        1 << self.bands
    }

    /// Region of the padded canvas a frame influences: its rectangle grown
    /// by a margin and snapped outwards to the pyramid cell.
    fn footprint(
        &self,
        canvas: Rect,
        padded: (usize, usize),
        frame: &WarpedFrame,
    ) -> (usize, usize, usize, usize) {
        let cell = self.cell();
        let gap = 3 * cell;
        let (ox, oy) = offset_in(canvas, frame);
        let (fw, fh) = (frame.image.width() as usize, frame.image.height() as usize);
        let x0 = ox.saturating_sub(gap) / cell * cell;
        let y0 = oy.saturating_sub(gap) / cell * cell;
        let x1 = ((ox + fw + gap).div_ceil(cell) * cell).min(padded.0);
        let y1 = ((oy + fh + gap).div_ceil(cell) * cell).min(padded.1);
        (x0, y0, x1 - x0, y1 - y0)
    }

    fn stack(
        &self,
        canvas: Rect,
        padded: (usize, usize),
        frame: &WarpedFrame,
        seam: &GrayImage,
    ) -> BandStack {
        let (x0, y0, w, h) = self.footprint(canvas, padded, frame);
        let (ox, oy) = offset_in(canvas, frame);
        let (fw, fh) = frame.image.dimensions();

        let mut color = Plane::zeros(w, h, 3);
        let mut weight = Plane::zeros(w, h, 1);
        for y in 0..h {
            // Outside the frame, replicate its nearest edge pixel.
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let fy = (y0 + y) as i64 - oy as i64;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let sy = fy.clamp(0, i64::from(fh) - 1) as u32;
            for x in 0..w {
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                let fx = (x0 + x) as i64 - ox as i64;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let sx = fx.clamp(0, i64::from(fw) - 1) as u32;
                let px = frame.image.get_pixel(sx, sy).0;
                for (dst, &v) in color.pixel_mut(x, y).iter_mut().zip(&px) {
                    *dst = f32::from(v);
                }
                let inside = fx == i64::from(sx) && fy == i64::from(sy);
                if inside && seam.get_pixel(sx, sy).0[0] > 0 {
                    weight.pixel_mut(x, y)[0] = 1.0;
                }
            }
        }

        BandStack {
            x: x0,
            y: y0,
            detail: pyramid::laplacian(color, self.bands),
            weight: pyramid::gaussian(weight, self.bands),
        }
    }
}

impl Blender for MultiBandBlender {
    fn blend(&self, frames: &[WarpedFrame], seams: &[GrayImage], canvas: Rect) -> Composite {
        let cell = self.cell();
        let padded = (
            (canvas.width as usize).div_ceil(cell) * cell,
            (canvas.height as usize).div_ceil(cell) * cell,
        );

        let stacks: Vec<BandStack> = frames
            .par_iter()
            .zip(seams.par_iter())
            .map(|(frame, seam)| self.stack(canvas, padded, frame, seam))
            .collect();

        let mut bands: Vec<Plane> = (0..=self.bands)
            .map(|l| Plane::zeros(padded.0 >> l, padded.1 >> l, 3))
            .collect();
        let mut weights: Vec<Plane> = (0..=self.bands)
            .map(|l| Plane::zeros(padded.0 >> l, padded.1 >> l, 1))
            .collect();

        // Frames are added in index order so the sums are reproducible.
        for stack in &stacks {
            for level in 0..=self.bands {
                let (dx, dy) = (stack.x >> level, stack.y >> level);
                let detail = &stack.detail[level];
                let weight = &stack.weight[level];
                for y in 0..detail.height() {
                    for x in 0..detail.width() {
                        let w = weight.pixel(x, y)[0];
                        if w <= 0.0 {
                            continue;
                        }
                        let src = detail.pixel(x, y);
                        for (d, s) in bands[level].pixel_mut(dx + x, dy + y).iter_mut().zip(src) {
                            *d += s * w;
                        }
                        weights[level].pixel_mut(dx + x, dy + y)[0] += w;
                    }
                }
            }
        }

        for (band, weight) in bands.iter_mut().zip(&weights) {
            for y in 0..band.height() {
                for x in 0..band.width() {
                    let total = weight.pixel(x, y)[0] + WEIGHT_EPS;
                    for v in band.pixel_mut(x, y) {
                        *v /= total;
                    }
                }
            }
        }

        let mut image = RgbImage::new(canvas.width, canvas.height);
        let mut coverage = GrayImage::new(canvas.width, canvas.height);
        if let Some(merged) = pyramid::collapse(bands) {
            for (x, y, px) in image.enumerate_pixels_mut() {
                let (ux, uy) = (x as usize, y as usize);
                if weights[0].pixel(ux, uy)[0] <= WEIGHT_EPS {
                    continue;
                }
                let v = merged.pixel(ux, uy);
                *px = Rgb([to_u8(v[0]), to_u8(v[1]), to_u8(v[2])]);
                coverage.put_pixel(x, y, Luma([255]));
            }
        }
        Composite {
            image,
            coverage,
            origin: (canvas.x, canvas.y),
        }
    }
}

// ───── Composition ─────────────────────────────────────────────────

/// Bounding box of covered pixels, in canvas coordinates.
#[must_use]
pub fn coverage_bounds(coverage: &GrayImage) -> Option<(u32, u32, u32, u32)> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, p) in coverage.enumerate_pixels() {
        if p.0[0] == 0 {
            continue;
        }
        bounds = Some(bounds.map_or((x, y, x, y), |(x0, y0, x1, y1)| {
            (x0.min(x), y0.min(y), x1.max(x), y1.max(y))
        }));
    }
    bounds.map(|(x0, y0, x1, y1)| (x0, y0, x1 - x0 + 1, y1 - y0 + 1))
}

/// Crop the composite to its covered region.
///
/// # Errors
///
/// [`StitchError::DegenerateOutput`] when nothing is covered.
pub fn crop_to_coverage(composite: &Composite) -> Result<RgbImage, StitchError> {
    let Some((x, y, width, height)) = coverage_bounds(&composite.coverage) else {
        return Err(StitchError::DegenerateOutput {
            width: 0,
            height: 0,
        });
    };
    Ok(image::imageops::crop_imm(&composite.image, x, y, width, height).to_image())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn flat(corner: (i32, i32), w: u32, h: u32, value: u8) -> WarpedFrame {
        WarpedFrame {
            image: RgbImage::from_pixel(w, h, Rgb([value; 3])),
            mask: GrayImage::from_pixel(w, h, Luma([255])),
            corner,
        }
    }

    /// Two 60x40 frames overlapping by 20 columns, split down the middle.
    fn split_pair(left: u8, right: u8) -> (Vec<WarpedFrame>, Vec<GrayImage>, Rect) {
        let frames = vec![flat((0, 0), 60, 40, left), flat((40, 0), 60, 40, right)];
        let seams = vec![
            GrayImage::from_fn(60, 40, |x, _| Luma([if x < 50 { 255 } else { 0 }])),
            GrayImage::from_fn(60, 40, |x, _| Luma([if x >= 10 { 255 } else { 0 }])),
        ];
        (frames, seams, Rect::new(0, 0, 100, 40))
    }

    fn blenders() -> [BlenderKind; 2] {
        [
            BlenderKind::Feather(FeatherBlender { sharpness: 0.1 }),
            BlenderKind::MultiBand(MultiBandBlender { bands: 3 }),
        ]
    }

    #[test]
    fn band_count_follows_canvas_size() {
        assert_eq!(band_count(Rect::new(0, 0, 10, 10), 5.0), 0);
        // sqrt(1600 * 1600) * 5 / 100 = 80 -> ceil(log2 80) - 1 = 6
        assert_eq!(band_count(Rect::new(0, 0, 1600, 1600), 5.0), 6);
        assert_eq!(band_count(Rect::new(0, 0, 100_000, 100_000), 5.0), MAX_BANDS);
    }

    #[test]
    fn selection_follows_toggle() {
        let config = StitchConfig::default();
        let canvas = Rect::new(0, 0, 800, 400);
        assert_eq!(BlenderKind::for_options(false, canvas, &config).name(), "feather");
        assert_eq!(BlenderKind::for_options(true, canvas, &config).name(), "multi_band");
    }

    #[test]
    fn identical_frames_blend_to_same_color() {
        for blender in blenders() {
            let (frames, seams, canvas) = split_pair(90, 90);
            let out = blender.blend(&frames, &seams, canvas);
            for (x, _, px) in out.image.enumerate_pixels() {
                assert!(px.0[0].abs_diff(90) <= 1, "{} x={x} {:?}", blender.name(), px);
            }
            assert!(out.coverage.pixels().all(|p| p.0[0] == 255));
        }
    }

    #[test]
    fn transition_is_smooth_and_monotonic() {
        for blender in blenders() {
            let (frames, seams, canvas) = split_pair(0, 200);
            let out = blender.blend(&frames, &seams, canvas);
            let row: Vec<u8> = (0..100).map(|x| out.image.get_pixel(x, 20).0[0]).collect();
            assert!(row[0] < 10 && row[99] > 190, "{row:?}");
            for pair in row.windows(2) {
                assert!(pair[1] + 2 >= pair[0], "{} {row:?}", blender.name());
            }
            // No hard step at the seam.
            assert!(row[50].abs_diff(row[49]) < 100, "{row:?}");
        }
    }

    #[test]
    fn uncovered_pixels_stay_uncovered() {
        for blender in blenders() {
            let frames = vec![flat((0, 0), 20, 20, 50)];
            let seams = vec![frames[0].mask.clone()];
            let out = blender.blend(&frames, &seams, Rect::new(0, 0, 30, 20));
            assert_eq!(out.coverage.get_pixel(25, 10).0[0], 0);
            assert_eq!(out.coverage.get_pixel(5, 10).0[0], 255);
            let cropped = crop_to_coverage(&out).unwrap();
            assert_eq!(cropped.dimensions(), (20, 20));
        }
    }

    #[test]
    fn feather_weights_ramp_from_border() {
        let frame = flat((0, 0), 40, 40, 0);
        let weights = FeatherBlender { sharpness: 0.1 }.weights(&frame, &frame.mask);
        assert!((weights[0] - 0.1).abs() < 1e-6);
        assert!((weights[20 * 40 + 20] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_coverage_is_degenerate() {
        let composite = Composite {
            image: RgbImage::new(4, 4),
            coverage: GrayImage::new(4, 4),
            origin: (0, 0),
        };
        assert_eq!(
            crop_to_coverage(&composite),
            Err(StitchError::DegenerateOutput {
                width: 0,
                height: 0
            })
        );
    }
}
