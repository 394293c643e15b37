//! Deterministic synthetic sweeps for tests and benchmarks.
//!
//! A [`Scene`] paints the whole sphere of view directions with a lattice of
//! randomly colored cells plus scattered rectangular blobs, so every view
//! has plenty of corners. A [`SweepSpec`] renders it through a row of
//! cameras rotating about the vertical axis, exactly as a hand-held sweep
//! would see it. Scenes with different seeds use different lattice sizes
//! and offsets, so they never line up with each other.

use nalgebra::{Matrix3, Rotation3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::{Frame, FrameSequence, RgbImage};

const BLOB_COUNT: usize = 120;

#[derive(Debug, Clone, Copy)]
struct Blob {
    lon: (f64, f64),
    lat: (f64, f64),
    color: [u8; 3],
}

/// A procedural scene defined over view directions.
#[derive(Debug, Clone)]
pub struct Scene {
    seed: u64,
    cell: f64,
    offset: (f64, f64),
    blobs: Vec<Blob>,
}

impl Scene {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let cell = rng.random_range(0.05..0.08);
        let offset = (rng.random_range(0.0..cell), rng.random_range(0.0..cell));
        let blobs = (0..BLOB_COUNT)
            .map(|_| {
                let lon = rng.random_range(-std::f64::consts::PI..std::f64::consts::PI);
                let lat = rng.random_range(-0.7..0.7);
                let w = rng.random_range(0.02..0.09);
                let h = rng.random_range(0.02..0.09);
                Blob {
                    lon: (lon, lon + w),
                    lat: (lat, lat + h),
                    color: [rng.random(), rng.random(), rng.random()],
                }
            })
            .collect();
        Self {
            seed,
            cell,
            offset,
            blobs,
        }
    }

    /// Color seen along world direction `d` (need not be normalized).
    #[must_use]
    pub fn color(&self, d: &Vector3<f64>) -> [u8; 3] {
        let norm = d.norm();
        if norm <= f64::EPSILON {
            return [0; 3];
        }
        let lon = d.x.atan2(d.z);
        let lat = (d.y / norm).clamp(-1.0, 1.0).asin();

        if let Some(blob) = self
            .blobs
            .iter()
            .rev()
            .find(|b| lon >= b.lon.0 && lon < b.lon.1 && lat >= b.lat.0 && lat < b.lat.1)
        {
            return blob.color;
        }

        #[allow(clippy::cast_possible_truncation)]
        let (i, j) = (
            ((lon + self.offset.0) / self.cell).floor() as i64,
            ((lat + self.offset.1) / self.cell).floor() as i64,
        );
        #[allow(clippy::cast_sign_loss)]
        let h = mix(self.seed ^ mix(i as u64) ^ mix((j as u64).rotate_left(32)));
        let bytes = h.to_le_bytes();
        [bytes[0], bytes[1], bytes[2]]
    }
}

/// SplitMix64 finalizer.
const fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Camera rig for a horizontal sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSpec {
    pub width: u32,
    pub height: u32,
    pub focal: f64,
    /// Yaw between consecutive frames, in radians.
    pub step: f64,
    pub frames: usize,
    /// Pitch of every camera above the horizontal, in radians. A pitched
    /// sweep bends the horizon into a wave.
    pub tilt: f64,
}

impl Default for SweepSpec {
    fn default() -> Self {
        Self {
            width: 160,
            height: 120,
            focal: 160.0,
            step: 0.35,
            frames: 5,
            tilt: 0.0,
        }
    }
}

impl SweepSpec {
    #[must_use]
    pub const fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    #[must_use]
    pub const fn with_tilt(mut self, tilt: f64) -> Self {
        self.tilt = tilt;
        self
    }

    /// Camera-to-world rotations, centered on the middle frame.
    #[must_use]
    pub fn rotations(&self) -> Vec<Matrix3<f64>> {
        let pitch = Rotation3::from_axis_angle(&Vector3::x_axis(), self.tilt);
        #[allow(clippy::cast_precision_loss)]
        let middle = self.frames.saturating_sub(1) as f64 / 2.0;
        (0..self.frames)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let yaw = (i as f64 - middle) * self.step;
                let r = Rotation3::from_axis_angle(&Vector3::y_axis(), yaw) * pitch;
                *r.matrix()
            })
            .collect()
    }

    /// Render one frame through `rotation` with 2x2 supersampling.
    #[must_use]
    pub fn render_view(&self, scene: &Scene, rotation: &Matrix3<f64>) -> RgbImage {
        let (cx, cy) = (f64::from(self.width) / 2.0, f64::from(self.height) / 2.0);
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let mut sum = [0u32; 3];
            for (sx, sy) in [(0.25, 0.25), (0.75, 0.25), (0.25, 0.75), (0.75, 0.75)] {
                let local = Vector3::new(
                    f64::from(x) + sx - cx,
                    f64::from(y) + sy - cy,
                    self.focal,
                );
                let c = scene.color(&(rotation * local));
                for (s, v) in sum.iter_mut().zip(c) {
                    *s += u32::from(v);
                }
            }
            #[allow(clippy::cast_possible_truncation)]
            image::Rgb(sum.map(|s| ((s + 2) / 4) as u8))
        })
    }

    /// Render the whole sweep in capture order.
    #[must_use]
    pub fn render(&self, scene: &Scene) -> FrameSequence {
        self.rotations()
            .iter()
            .map(|r| Frame::new(self.render_view(scene, r)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendering_is_deterministic() {
        let spec = SweepSpec::default().with_frames(2);
        let a = spec.render(&Scene::new(3));
        let b = spec.render(&Scene::new(3));
        for (fa, fb) in a.iter().zip(&b) {
            assert_eq!(fa.image(), fb.image());
        }
    }

    #[test]
    fn seeds_give_different_scenes() {
        let spec = SweepSpec::default().with_frames(1);
        let a = spec.render(&Scene::new(1));
        let b = spec.render(&Scene::new(2));
        assert_ne!(a.frames()[0].image(), b.frames()[0].image());
    }

    #[test]
    fn rotations_are_centered() {
        let spec = SweepSpec::default().with_frames(3);
        let r = spec.rotations();
        assert!((r[1] - Matrix3::identity()).norm() < 1e-12);
        let expected = Rotation3::from_axis_angle(&Vector3::y_axis(), 0.7);
        assert!((r[0].transpose() * r[2] - *expected.matrix()).norm() < 1e-12);
    }

    #[test]
    fn neighbouring_views_share_content() {
        // A direction seen by both cameras has the same color in both.
        let spec = SweepSpec::default().with_frames(2);
        let scene = Scene::new(9);
        let rotations = spec.rotations();
        let world = rotations[0] * Vector3::new(40.0, 10.0, spec.focal);
        let in_second = rotations[1].transpose() * world;
        assert!(in_second.z > 0.0);
        assert_eq!(scene.color(&world), scene.color(&(rotations[1] * in_second)));
    }
}
