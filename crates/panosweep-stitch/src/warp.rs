//! Projection of frames onto the composite surface.
//!
//! Each frame is inverse-mapped: for every pixel of its bounding box on
//! the surface, the ray through that surface point is rotated into the
//! camera and projected onto the image plane, then sampled bilinearly.
//! Rows are filled in parallel; each row is written by exactly one task.

use nalgebra::Vector3;
use rayon::prelude::*;

use crate::camera::CameraParams;
use crate::types::{GrayImage, RgbImage, StitchError, WarpSurface};

/// Axis-aligned rectangle on the composite surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    #[must_use]
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// One past the last column.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    /// One past the last row.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[must_use]
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Overlap with `other`, if any.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        (right > x && bottom > y).then(|| Self::new(x, y, (right - x) as u32, (bottom - y) as u32))
    }

    /// Smallest rectangle containing both.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn union(&self, other: &Self) -> Self {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Self::new(x, y, (right - x) as u32, (bottom - y) as u32)
    }

    /// Center point, for orientation decisions.
    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        (
            f64::from(self.x) + f64::from(self.width) / 2.0,
            f64::from(self.y) + f64::from(self.height) / 2.0,
        )
    }
}

/// A frame projected onto the surface.
#[derive(Debug, Clone)]
pub struct WarpedFrame {
    pub image: RgbImage,
    /// 255 where `image` holds projected pixels, 0 elsewhere.
    pub mask: GrayImage,
    /// Surface position of the top-left pixel.
    pub corner: (i32, i32),
}

impl WarpedFrame {
    #[must_use]
    pub fn rect(&self) -> Rect {
        Rect::new(
            self.corner.0,
            self.corner.1,
            self.image.width(),
            self.image.height(),
        )
    }

    /// Whether surface pixel `(u, v)` holds valid data.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn covers(&self, u: i32, v: i32) -> bool {
        let (lx, ly) = (u - self.corner.0, v - self.corner.1);
        lx >= 0
            && ly >= 0
            && (lx as u32) < self.mask.width()
            && (ly as u32) < self.mask.height()
            && self.mask.get_pixel(lx as u32, ly as u32).0[0] > 0
    }
}

/// Mapping between one camera's image plane and the surface.
#[derive(Debug, Clone, Copy)]
pub struct Projector {
    surface: WarpSurface,
    scale: f64,
    camera: CameraParams,
    cx: f64,
    cy: f64,
}

impl Projector {
    /// `camera` must be expressed in pixels of an image of `width` x
    /// `height`, with the principal point at its center.
    #[must_use]
    pub fn new(
        surface: WarpSurface,
        scale: f64,
        camera: CameraParams,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            surface,
            scale,
            camera,
            cx: f64::from(width) / 2.0,
            cy: f64::from(height) / 2.0,
        }
    }

    /// Surface coordinates of image pixel `(x, y)`.
    #[must_use]
    pub fn forward(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let d = self.camera.rotation * Vector3::new(x - self.cx, y - self.cy, self.camera.focal);
        let s = self.scale;
        let uv = match self.surface {
            WarpSurface::Spherical => {
                let norm = d.norm();
                (s * d.x.atan2(d.z), s * (d.y / norm).clamp(-1.0, 1.0).asin())
            }
            WarpSurface::Cylindrical => {
                let radial = d.x.hypot(d.z);
                if radial <= f64::EPSILON {
                    return None;
                }
                (s * d.x.atan2(d.z), s * d.y / radial)
            }
            WarpSurface::Plane => {
                if d.z <= f64::EPSILON {
                    return None;
                }
                (s * d.x / d.z, s * d.y / d.z)
            }
        };
        (uv.0.is_finite() && uv.1.is_finite()).then_some(uv)
    }

    /// Image coordinates seen at surface point `(u, v)`.
    #[must_use]
    pub fn backward(&self, u: f64, v: f64) -> Option<(f64, f64)> {
        let s = self.scale;
        let d = match self.surface {
            WarpSurface::Spherical => {
                let (theta, phi) = (u / s, v / s);
                let (sin_p, cos_p) = phi.sin_cos();
                let (sin_t, cos_t) = theta.sin_cos();
                Vector3::new(sin_t * cos_p, sin_p, cos_t * cos_p)
            }
            WarpSurface::Cylindrical => {
                let (sin_t, cos_t) = (u / s).sin_cos();
                Vector3::new(sin_t, v / s, cos_t)
            }
            WarpSurface::Plane => Vector3::new(u / s, v / s, 1.0),
        };
        let local = self.camera.rotation.transpose() * d;
        if local.z <= f64::EPSILON {
            return None;
        }
        let x = self.camera.focal * local.x / local.z + self.cx;
        let y = self.camera.focal * local.y / local.z + self.cy;
        (x.is_finite() && y.is_finite()).then_some((x, y))
    }

    /// Bounding box of the image border on the surface.
    ///
    /// # Errors
    ///
    /// [`StitchError::DegenerateOutput`] when part of the border does not
    /// project (behind a plane surface), or the box exceeds `max_pixels`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn roi(&self, width: u32, height: u32, max_pixels: u64) -> Result<Rect, StitchError> {
        let (w, h) = (f64::from(width), f64::from(height));
        let border = (0..=width)
            .flat_map(|x| [(f64::from(x), 0.0), (f64::from(x), h)])
            .chain((0..=height).flat_map(|y| [(0.0, f64::from(y)), (w, f64::from(y))]));

        let mut min = (f64::INFINITY, f64::INFINITY);
        let mut max = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in border {
            let Some((u, v)) = self.forward(x, y) else {
                return Err(StitchError::DegenerateOutput {
                    width: u64::MAX,
                    height: u64::MAX,
                });
            };
            min = (min.0.min(u), min.1.min(v));
            max = (max.0.max(u), max.1.max(v));
        }

        let x0 = min.0.floor();
        let y0 = min.1.floor();
        let span_w = max.0.ceil() - x0;
        let span_h = max.1.ceil() - y0;
        #[allow(clippy::cast_precision_loss)]
        let limit = max_pixels as f64;
        let within = x0.abs() < f64::from(i32::MAX / 2)
            && y0.abs() < f64::from(i32::MAX / 2)
            && span_w >= 1.0
            && span_h >= 1.0
            && span_w * span_h <= limit;
        if !within {
            return Err(StitchError::DegenerateOutput {
                width: saturating_u64(span_w),
                height: saturating_u64(span_h),
            });
        }

        Ok(Rect::new(
            x0 as i32,
            y0 as i32,
            span_w as u32,
            span_h as u32,
        ))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn saturating_u64(v: f64) -> u64 {
    if v.is_finite() && v > 0.0 {
        v as u64
    } else if v > 0.0 {
        u64::MAX
    } else {
        0
    }
}

/// Bilinear sample of `image` at `(x, y)`; `None` outside the pixel grid.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::similar_names
)]
pub fn sample_bilinear(image: &RgbImage, x: f64, y: f64) -> Option<[u8; 3]> {
    let max_x = f64::from(image.width()) - 1.0;
    let max_y = f64::from(image.height()) - 1.0;
    if !(x >= -0.5 && y >= -0.5 && x <= max_x + 0.5 && y <= max_y + 0.5) {
        return None;
    }
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as u32, y0 as u32);
    let x1 = (x0 + 1).min(image.width() - 1);
    let y1 = (y0 + 1).min(image.height() - 1);

    let p00 = image.get_pixel(x0, y0).0;
    let p10 = image.get_pixel(x1, y0).0;
    let p01 = image.get_pixel(x0, y1).0;
    let p11 = image.get_pixel(x1, y1).0;
    Some(std::array::from_fn(|c| {
        let top = f64::from(p00[c]).mul_add(1.0 - fx, f64::from(p10[c]) * fx);
        let bottom = f64::from(p01[c]).mul_add(1.0 - fx, f64::from(p11[c]) * fx);
        top.mul_add(1.0 - fy, bottom * fy).round().clamp(0.0, 255.0) as u8
    }))
}

/// Project `image` seen by `camera` onto `surface` at `scale`.
///
/// # Errors
///
/// [`StitchError::DegenerateOutput`] when the projected region is invalid
/// or larger than `max_pixels`.
pub fn warp_frame(
    image: &RgbImage,
    camera: CameraParams,
    surface: WarpSurface,
    scale: f64,
    max_pixels: u64,
) -> Result<WarpedFrame, StitchError> {
    let projector = Projector::new(surface, scale, camera, image.width(), image.height());
    let roi = projector.roi(image.width(), image.height(), max_pixels)?;

    let mut warped = RgbImage::new(roi.width, roi.height);
    let mut mask = GrayImage::new(roi.width, roi.height);
    let row_len = roi.width as usize;

    warped
        .par_chunks_mut(3 * row_len)
        .zip(mask.par_chunks_mut(row_len))
        .enumerate()
        .for_each(|(row, (pixels, valid))| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let v = f64::from(roi.y + row as i32);
            for (col, (px, m)) in pixels.chunks_exact_mut(3).zip(valid.iter_mut()).enumerate() {
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                let u = f64::from(roi.x + col as i32);
                let sampled = projector
                    .backward(u, v)
                    .and_then(|(x, y)| sample_bilinear(image, x, y));
                if let Some(rgb) = sampled {
                    px.copy_from_slice(&rgb);
                    *m = 255;
                }
            }
        });

    Ok(WarpedFrame {
        image: warped,
        mask,
        corner: (roi.x, roi.y),
    })
}

/// Bounding rectangle of all warped frames.
#[must_use]
pub fn canvas_rect(frames: &[WarpedFrame]) -> Option<Rect> {
    frames
        .iter()
        .map(WarpedFrame::rect)
        .reduce(|acc, r| acc.union(&r))
}
