//! Floating-point planes and the 5-tap Gaussian pyramid used by the
//! multi-band blender.
//!
//! `reduce` halves a plane after smoothing with the binomial kernel
//! `[1 4 6 4 1] / 16`; `expand` doubles it by zero insertion and the same
//! kernel scaled by two per axis. Borders reflect without repeating the
//! edge sample. Weights that fall outside the plane are dropped and the
//! rest renormalized, so flat planes stay flat up to the edges.

use rayon::prelude::*;

const KERNEL: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

/// Interleaved `f32` raster with a fixed channel count.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<f32>,
}

impl Plane {
    #[must_use]
    pub fn zeros(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
            data: vec![0.0; width * height * channels],
        }
    }

    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    #[must_use]
    pub const fn channels(&self) -> usize {
        self.channels
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Samples of pixel `(x, y)`.
    #[must_use]
    pub fn pixel(&self, x: usize, y: usize) -> &[f32] {
        let start = (y * self.width + x) * self.channels;
        &self.data[start..start + self.channels]
    }

    pub fn pixel_mut(&mut self, x: usize, y: usize) -> &mut [f32] {
        let start = (y * self.width + x) * self.channels;
        &mut self.data[start..start + self.channels]
    }

    /// Element-wise `self - other`. Both planes must have the same shape.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        debug_assert_eq!(self.data.len(), other.data.len());
        Self {
            width: self.width,
            height: self.height,
            channels: self.channels,
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| a - b)
                .collect(),
        }
    }

    /// Element-wise `self += other`.
    pub fn add_assign(&mut self, other: &Self) {
        debug_assert_eq!(self.data.len(), other.data.len());
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }

    fn rows_mut(&mut self) -> rayon::slice::ChunksMut<'_, f32> {
        let stride = (self.width * self.channels).max(1);
        self.data.par_chunks_mut(stride)
    }
}

/// Mirror `i` into `0..len` without repeating the border sample.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
const fn reflect(i: isize, len: usize) -> Option<usize> {
    let n = len as isize;
    if n == 1 {
        return Some(0);
    }
    let r = if i < 0 {
        -i
    } else if i >= n {
        2 * n - 2 - i
    } else {
        i
    };
    if r >= 0 && r < n { Some(r as usize) } else { None }
}

/// Smooth along x and take every second column.
fn reduce_x(src: &Plane) -> Plane {
    let width = src.width.div_ceil(2);
    let mut dst = Plane::zeros(width, src.height, src.channels);
    let c = src.channels;
    dst.rows_mut().enumerate().for_each(|(y, row)| {
        for x in 0..width {
            let mut acc = [0.0f32; 4];
            let mut total = 0.0;
            for (k, w) in KERNEL.iter().enumerate() {
                #[allow(clippy::cast_possible_wrap)]
                let sx = (2 * x) as isize + k as isize - 2;
                if let Some(sx) = reflect(sx, src.width) {
                    total += w;
                    for (a, v) in acc.iter_mut().zip(src.pixel(sx, y)) {
                        *a += w * v;
                    }
                }
            }
            for ch in 0..c {
                row[x * c + ch] = acc[ch] / total;
            }
        }
    });
    dst
}

/// Smooth along y and take every second row.
fn reduce_y(src: &Plane) -> Plane {
    let height = src.height.div_ceil(2);
    let mut dst = Plane::zeros(src.width, height, src.channels);
    let stride = src.width * src.channels;
    dst.rows_mut().enumerate().for_each(|(y, row)| {
        let mut total = 0.0;
        for (k, w) in KERNEL.iter().enumerate() {
            #[allow(clippy::cast_possible_wrap)]
            let sy = (2 * y) as isize + k as isize - 2;
            if let Some(sy) = reflect(sy, src.height) {
                total += w;
                let line = &src.data[sy * stride..(sy + 1) * stride];
                for (d, v) in row.iter_mut().zip(line) {
                    *d += w * v;
                }
            }
        }
        for d in row.iter_mut() {
            *d /= total;
        }
    });
    dst
}

/// Upsample along x to `width` columns.
fn expand_x(src: &Plane, width: usize) -> Plane {
    let mut dst = Plane::zeros(width, src.height, src.channels);
    let c = src.channels;
    dst.rows_mut().enumerate().for_each(|(y, row)| {
        for x in 0..width {
            let mut acc = [0.0f32; 4];
            let mut total = 0.0;
            for (k, w) in KERNEL.iter().enumerate() {
                #[allow(clippy::cast_possible_wrap)]
                let p = x as isize + k as isize - 2;
                let Some(p) = reflect(p, width) else { continue };
                if p % 2 != 0 {
                    continue;
                }
                let sx = (p / 2).min(src.width - 1);
                total += w;
                for (a, v) in acc.iter_mut().zip(src.pixel(sx, y)) {
                    *a += w * v;
                }
            }
            for ch in 0..c {
                row[x * c + ch] = if total > 0.0 { acc[ch] / total } else { 0.0 };
            }
        }
    });
    dst
}

/// Upsample along y to `height` rows.
fn expand_y(src: &Plane, height: usize) -> Plane {
    let mut dst = Plane::zeros(src.width, height, src.channels);
    let stride = src.width * src.channels;
    dst.rows_mut().enumerate().for_each(|(y, row)| {
        let mut total = 0.0;
        for (k, w) in KERNEL.iter().enumerate() {
            #[allow(clippy::cast_possible_wrap)]
            let p = y as isize + k as isize - 2;
            let Some(p) = reflect(p, height) else { continue };
            if p % 2 != 0 {
                continue;
            }
            let sy = (p / 2).min(src.height - 1);
            total += w;
            let line = &src.data[sy * stride..(sy + 1) * stride];
            for (d, v) in row.iter_mut().zip(line) {
                *d += w * v;
            }
        }
        if total > 0.0 {
            for d in row.iter_mut() {
                *d /= total;
            }
        }
    });
    dst
}

/// Half-resolution plane, rounding odd sizes up.
#[must_use]
pub fn reduce(src: &Plane) -> Plane {
    debug_assert!(src.channels <= 4);
    reduce_y(&reduce_x(src))
}

/// Plane of `width` x `height` interpolated from a coarser one.
#[must_use]
pub fn expand(src: &Plane, width: usize, height: usize) -> Plane {
    debug_assert!(src.channels <= 4);
    expand_y(&expand_x(src, width), height)
}

/// `levels + 1` planes, finest first.
#[must_use]
pub fn gaussian(base: Plane, levels: usize) -> Vec<Plane> {
    let mut pyramid = Vec::with_capacity(levels + 1);
    pyramid.push(base);
    for level in 0..levels {
        let next = reduce(&pyramid[level]);
        pyramid.push(next);
    }
    pyramid
}

/// Band-pass decomposition: `levels` detail planes followed by the coarse
/// residual. Summing [`collapse`] over it reproduces `base`.
#[must_use]
pub fn laplacian(base: Plane, levels: usize) -> Vec<Plane> {
    let mut pyramid = gaussian(base, levels);
    for level in 0..levels {
        let (fine, coarse) = pyramid.split_at_mut(level + 1);
        let current = &mut fine[level];
        let up = expand(&coarse[0], current.width, current.height);
        *current = current.difference(&up);
    }
    pyramid
}

/// Inverse of [`laplacian`].
#[must_use]
pub fn collapse(mut pyramid: Vec<Plane>) -> Option<Plane> {
    let mut image = pyramid.pop()?;
    while let Some(mut detail) = pyramid.pop() {
        let up = expand(&image, detail.width, detail.height);
        detail.add_assign(&up);
        image = detail;
    }
    Some(image)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ramp(width: usize, height: usize) -> Plane {
        let mut plane = Plane::zeros(width, height, 3);
        for y in 0..height {
            for x in 0..width {
                #[allow(clippy::cast_precision_loss)]
                let v = (x * 7 + y * 3) as f32;
                plane.pixel_mut(x, y).copy_from_slice(&[v, v * 0.5, 255.0 - v]);
            }
        }
        plane
    }

    #[test]
    fn reflect_mirrors_without_repeating_edges() {
        assert_eq!(reflect(-1, 5), Some(1));
        assert_eq!(reflect(-2, 5), Some(2));
        assert_eq!(reflect(5, 5), Some(3));
        assert_eq!(reflect(6, 5), Some(2));
        assert_eq!(reflect(3, 1), Some(0));
    }

    #[test]
    fn reduce_rounds_sizes_up() {
        let half = reduce(&Plane::zeros(9, 6, 1));
        assert_eq!((half.width(), half.height()), (5, 3));
    }

    #[test]
    fn flat_plane_stays_flat() {
        let mut plane = Plane::zeros(12, 10, 1);
        plane.data.fill(42.0);
        let down = reduce(&plane);
        assert!(down.data().iter().all(|v| (v - 42.0).abs() < 1e-4));
        let up = expand(&down, 12, 10);
        assert!(up.data().iter().all(|v| (v - 42.0).abs() < 1e-4));
    }

    #[test]
    fn laplacian_collapse_reconstructs_input() {
        let base = ramp(33, 21);
        let rebuilt = collapse(laplacian(base.clone(), 3)).unwrap();
        assert_eq!((rebuilt.width(), rebuilt.height()), (33, 21));
        for (a, b) in rebuilt.data().iter().zip(base.data()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn gaussian_has_requested_depth() {
        let pyramid = gaussian(Plane::zeros(64, 32, 2), 4);
        assert_eq!(pyramid.len(), 5);
        assert_eq!((pyramid[4].width(), pyramid[4].height()), (4, 2));
    }
}
