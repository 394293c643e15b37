//! Horizontal wave correction.
//!
//! A hand-held sweep rarely rotates about a perfectly vertical axis, which
//! bends the horizon of the composite into a wave. The correction finds
//! the common "up" direction as the normal of the plane best containing
//! all camera x axes, then rotates the whole rig so that normal becomes
//! the world y axis.

use nalgebra::{Matrix3, Vector3};

use crate::camera::CameraParams;

/// Straighten the rig in place. No-op for fewer than two cameras, or when
/// the camera z axes cancel out so no forward direction can be chosen.
pub fn wave_correct(cameras: &mut [CameraParams]) {
    let rotations: Vec<Matrix3<f64>> = cameras.iter().map(|c| c.rotation).collect();
    if let Some(correction) = horizontal_correction(&rotations) {
        for camera in cameras.iter_mut() {
            camera.rotation = correction * camera.rotation;
        }
    }
}

/// World rotation that levels the given camera-to-world rotations.
#[must_use]
pub fn horizontal_correction(rotations: &[Matrix3<f64>]) -> Option<Matrix3<f64>> {
    if rotations.len() < 2 {
        return None;
    }

    let mut moment = Matrix3::zeros();
    for r in rotations {
        let x_axis = r.column(0);
        moment += x_axis * x_axis.transpose();
    }

    let eigen = moment.symmetric_eigen();
    let (min_idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let up: Vector3<f64> = eigen.eigenvectors.column(min_idx).into_owned();

    let forward_sum: Vector3<f64> = rotations.iter().map(|r| r.column(2).into_owned()).sum();
    let mut right = up.cross(&forward_sum);
    let norm = right.norm();
    if norm <= 1e-5 {
        return None;
    }
    right /= norm;
    let mut up = up;
    let mut forward = right.cross(&up);

    let alignment: f64 = rotations.iter().map(|r| right.dot(&r.column(0))).sum();
    if alignment < 0.0 {
        right = -right;
        up = -up;
        forward = right.cross(&up);
    }

    Some(Matrix3::from_rows(&[
        right.transpose(),
        up.transpose(),
        forward.transpose(),
    ]))
}
