//! Joint refinement of all cameras.
//!
//! A ray-space bundle adjustment: for every inlier correspondence the two
//! back-projected unit rays should coincide, and the residual is their
//! difference scaled by the geometric mean focal length so it reads in
//! pixels. Parameters are every camera's focal length plus a rotation
//! vector for every camera except the reference, which pins the gauge.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn, Matrix3, Rotation3, Vector3};
use tracing::debug;

use crate::camera::CameraParams;
use crate::homography::Pt;
use crate::pairs::PairMatch;
use crate::types::StitchError;

/// Relative step for central-difference derivatives.
const DIFF_STEP: f64 = 1e-6;

/// Outcome of a successful refinement.
#[derive(Debug, Clone, PartialEq)]
pub struct Refinement {
    pub cameras: Vec<CameraParams>,
    /// RMS ray residual per correspondence, in pixels.
    pub rms: f64,
    pub evaluations: usize,
    pub converged: bool,
}

struct Observation {
    a: usize,
    b: usize,
    pa: Pt,
    pb: Pt,
}

struct RayProblem {
    reference: usize,
    camera_count: usize,
    observations: Vec<Observation>,
    params: DVector<f64>,
}

impl RayProblem {
    /// Parameter index of camera `i`'s rotation vector, if it has one.
    fn rotation_offset(&self, i: usize) -> Option<usize> {
        match i.cmp(&self.reference) {
            std::cmp::Ordering::Less => Some(self.camera_count + 3 * i),
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(self.camera_count + 3 * (i - 1)),
        }
    }

    fn encode(cameras: &[CameraParams], reference: usize) -> DVector<f64> {
        let n = cameras.len();
        let mut params = DVector::zeros(n + 3 * n.saturating_sub(1));
        for (i, camera) in cameras.iter().enumerate() {
            params[i] = camera.focal;
        }
        let mut offset = n;
        for (i, camera) in cameras.iter().enumerate() {
            if i == reference {
                continue;
            }
            let axis = Rotation3::from_matrix_unchecked(camera.rotation).scaled_axis();
            params.fixed_rows_mut::<3>(offset).copy_from(&axis);
            offset += 3;
        }
        params
    }

    fn camera(&self, params: &DVector<f64>, i: usize) -> CameraParams {
        let rotation = self.rotation_offset(i).map_or_else(Matrix3::identity, |offset| {
            let axis = Vector3::new(params[offset], params[offset + 1], params[offset + 2]);
            *Rotation3::from_scaled_axis(axis).matrix()
        });
        CameraParams {
            focal: params[i],
            rotation,
        }
    }

    fn decode(&self, params: &DVector<f64>) -> Vec<CameraParams> {
        (0..self.camera_count)
            .map(|i| self.camera(params, i))
            .collect()
    }

    fn residuals_at(&self, params: &DVector<f64>) -> DVector<f64> {
        let cameras = self.decode(params);
        let mut out = DVector::zeros(3 * self.observations.len());
        for (k, obs) in self.observations.iter().enumerate() {
            let ca = &cameras[obs.a];
            let cb = &cameras[obs.b];
            let ra = ray(ca, &obs.pa);
            let rb = ray(cb, &obs.pb);
            let scale = (ca.focal * cb.focal).abs().sqrt();
            out.fixed_rows_mut::<3>(3 * k).copy_from(&((ra - rb) * scale));
        }
        out
    }
}

fn ray(camera: &CameraParams, p: &Pt) -> Vector3<f64> {
    let v = camera.rotation * Vector3::new(p.x / camera.focal, p.y / camera.focal, 1.0);
    let norm = v.norm();
    if norm > 0.0 { v / norm } else { v }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for RayProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_at(&self.params))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let rows = 3 * self.observations.len();
        let cols = self.params.len();
        let mut jacobian = DMatrix::zeros(rows, cols);
        let mut shifted = self.params.clone();
        for c in 0..cols {
            let x = self.params[c];
            let step = DIFF_STEP * x.abs().max(1.0);
            shifted[c] = x + step;
            let plus = self.residuals_at(&shifted);
            shifted[c] = x - step;
            let minus = self.residuals_at(&shifted);
            shifted[c] = x;
            jacobian.set_column(c, &((plus - minus) / (2.0 * step)));
        }
        Some(jacobian)
    }
}

/// Refine `cameras` against the inliers of every accepted pair.
///
/// The reference camera keeps its rotation; afterwards all rotations are
/// re-expressed relative to it, so it ends up as the identity.
///
/// # Errors
///
/// Returns [`StitchError::ConvergenceFailure`] when the solution contains
/// non-finite or non-positive values, or when the solver gives up with a
/// residual above `max_rms`.
pub fn refine(
    cameras: &[CameraParams],
    pairs: &[PairMatch],
    reference: usize,
    max_rms: f64,
    patience: usize,
) -> Result<Refinement, StitchError> {
    let observations: Vec<Observation> = pairs
        .iter()
        .flat_map(|pair| {
            pair.inliers.iter().map(|&(pa, pb)| Observation {
                a: pair.from,
                b: pair.to,
                pa,
                pb,
            })
        })
        .collect();

    if cameras.len() < 2 || observations.is_empty() {
        return Ok(Refinement {
            cameras: cameras.to_vec(),
            rms: 0.0,
            evaluations: 0,
            converged: true,
        });
    }

    let problem = RayProblem {
        reference,
        camera_count: cameras.len(),
        params: RayProblem::encode(cameras, reference),
        observations,
    };

    let (problem, report) = LevenbergMarquardt::new()
        .with_patience(patience.max(1))
        .minimize(problem);

    #[allow(clippy::cast_precision_loss)]
    let rms = (2.0 * report.objective_function / problem.observations.len() as f64).sqrt();
    let converged = report.termination.was_successful();
    debug!(
        evaluations = report.number_of_evaluations,
        rms,
        converged,
        termination = ?report.termination,
        "bundle adjustment finished"
    );

    if !problem.params.iter().all(|v| v.is_finite()) || !rms.is_finite() {
        return Err(StitchError::ConvergenceFailure {
            reason: "non-finite camera parameters".to_owned(),
        });
    }
    if !converged && rms > max_rms {
        return Err(StitchError::ConvergenceFailure {
            reason: format!("{:?} with rms {rms:.3}", report.termination),
        });
    }

    let mut refined = problem.decode(&problem.params);
    if refined.iter().any(|c| c.focal <= 0.0) {
        return Err(StitchError::ConvergenceFailure {
            reason: "non-positive focal length".to_owned(),
        });
    }

    let reference_inv = refined[reference].rotation.transpose();
    for camera in &mut refined {
        camera.rotation = reference_inv * camera.rotation;
    }

    Ok(Refinement {
        cameras: refined,
        rms,
        evaluations: report.number_of_evaluations,
        converged,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn yaw(angle: f64) -> Matrix3<f64> {
        *Rotation3::from_axis_angle(&Vector3::y_axis(), angle).matrix()
    }

    /// Projects world rays seen by both cameras into each camera.
    fn synthetic_pair(from: usize, to: usize, truth: &[CameraParams]) -> PairMatch {
        let mut inliers = Vec::new();
        for i in -4..=4 {
            for j in -3..=3 {
                let pa = Pt::new(f64::from(i) * 18.0, f64::from(j) * 15.0);
                let world =
                    truth[from].rotation * truth[from].k_inv() * Vector3::new(pa.x, pa.y, 1.0);
                let local = truth[to].k() * truth[to].rotation.transpose() * world;
                if local.z <= 0.0 {
                    continue;
                }
                inliers.push((pa, Pt::new(local.x / local.z, local.y / local.z)));
            }
        }
        PairMatch {
            from,
            to,
            h: Matrix3::identity(),
            matches: inliers.len(),
            inlier_count: inliers.len(),
            inliers,
            confidence: 2.0,
        }
    }

    #[test]
    fn perturbed_cameras_converge_to_truth() {
        let truth: Vec<CameraParams> = [-0.35, 0.0, 0.35]
            .iter()
            .map(|&a| CameraParams {
                focal: 300.0,
                rotation: yaw(a),
            })
            .collect();
        let pairs = vec![synthetic_pair(0, 1, &truth), synthetic_pair(1, 2, &truth)];

        let start: Vec<CameraParams> = truth
            .iter()
            .enumerate()
            .map(|(i, c)| CameraParams {
                focal: 280.0,
                rotation: if i == 1 {
                    c.rotation
                } else {
                    c.rotation * yaw(0.02)
                },
            })
            .collect();

        let result = refine(&start, &pairs, 1, 1.0, 100).unwrap();
        assert!(result.rms < 1e-3, "rms {}", result.rms);
        for (got, want) in result.cameras.iter().zip(&truth) {
            assert!((got.focal - want.focal).abs() < 0.5, "focal {}", got.focal);
            assert!((got.rotation - want.rotation).norm() < 1e-3);
        }
        assert!((result.cameras[1].rotation - Matrix3::identity()).norm() < 1e-12);
    }

    #[test]
    fn no_observations_is_a_no_op() {
        let cameras = vec![
            CameraParams {
                focal: 100.0,
                rotation: Matrix3::identity(),
            };
            2
        ];
        let result = refine(&cameras, &[], 0, 1.0, 10).unwrap();
        assert_eq!(result.cameras, cameras);
    }

    #[test]
    fn parameter_layout_skips_reference() {
        let cameras = vec![
            CameraParams {
                focal: 100.0,
                rotation: yaw(0.1),
            },
            CameraParams {
                focal: 110.0,
                rotation: Matrix3::identity(),
            },
            CameraParams {
                focal: 120.0,
                rotation: yaw(-0.1),
            },
        ];
        let params = RayProblem::encode(&cameras, 1);
        assert_eq!(params.len(), 3 + 6);
        let problem = RayProblem {
            reference: 1,
            camera_count: 3,
            observations: Vec::new(),
            params: params.clone(),
        };
        let decoded = problem.decode(&params);
        for (a, b) in decoded.iter().zip(&cameras) {
            assert!((a.focal - b.focal).abs() < 1e-12);
            assert!((a.rotation - b.rotation).norm() < 1e-12);
        }
    }
}
