use std::time::Instant;

use log::debug;
use rayon::prelude::*;

use crate::ba::dense::DenseVector;
use crate::ba::linear_solver::{LinearSolver, SolverOptions};
use crate::ba::sparse::{SparseMatrix, Triplet};
use crate::{Result, SfmError};

const TRUST_REGION_RADIUS_INIT: f64 = 1000.0;
const TRUST_REGION_RADIUS_DECREMENT: f64 = 1.0 / 2.0;

/// Camera with one focal length, two radial distortion coefficients and
/// a row-major rotation matrix.
#[derive(Debug, Clone)]
pub struct Camera {
    pub focal_length: f64,
    pub distortion: [f64; 2],
    pub translation: [f64; 3],
    pub rotation: [f64; 9],
    pub is_constant: bool,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            focal_length: 0.0,
            distortion: [0.0; 2],
            translation: [0.0; 3],
            rotation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            is_constant: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Point3D {
    pub pos: [f64; 3],
    pub is_constant: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub pos: [f64; 2],
    pub camera_id: i32,
    pub point_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleMode {
    CamerasAndPoints,
    CamerasOnly,
    PointsOnly,
}

#[derive(Debug, Clone)]
pub struct BundleOptions {
    pub bundle_mode: BundleMode,
    pub fixed_intrinsics: bool,
    pub lm_max_iterations: usize,
    pub lm_min_iterations: usize,
    pub lm_delta_threshold: f64,
    pub lm_mse_threshold: f64,
    pub cg_max_iterations: usize,
}

impl Default for BundleOptions {
    fn default() -> Self {
        Self {
            bundle_mode: BundleMode::CamerasAndPoints,
            fixed_intrinsics: false,
            lm_max_iterations: 100,
            lm_min_iterations: 0,
            lm_delta_threshold: 1e-8,
            lm_mse_threshold: 1e-16,
            cg_max_iterations: 1000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BundleStatus {
    pub initial_mse: f64,
    pub final_mse: f64,
    pub num_lm_iterations: usize,
    pub num_lm_successful_iterations: usize,
    pub num_lm_unsuccessful_iterations: usize,
    pub num_cg_iterations: usize,
    pub runtime_ms: u128,
}

/// Levenberg-Marquardt bundle adjustment minimizing the reprojection
/// error over camera parameters and 3D points.
pub struct BundleAdjustment {
    opts: BundleOptions,
    status: BundleStatus,
}

impl BundleAdjustment {
    pub fn new(opts: BundleOptions) -> Self {
        Self {
            opts,
            status: BundleStatus::default(),
        }
    }

    fn num_cam_params(&self) -> usize {
        if self.opts.fixed_intrinsics { 6 } else { 9 }
    }

    /// Refines cameras and points in place and returns the status.
    pub fn optimize(
        &mut self,
        cameras: &mut [Camera],
        points: &mut [Point3D],
        observations: &[Observation],
    ) -> Result<BundleStatus> {
        let timer = Instant::now();
        self.sanity_checks(cameras, points, observations)?;
        self.status = BundleStatus::default();
        self.lm_optimize(cameras, points, observations);
        self.status.runtime_ms = timer.elapsed().as_millis();
        Ok(self.status.clone())
    }

    fn sanity_checks(
        &self,
        cameras: &[Camera],
        points: &[Point3D],
        observations: &[Observation],
    ) -> Result<()> {
        for camera in cameras {
            if camera.focal_length <= 0.0 {
                return Err(SfmError::invalid_argument(
                    "camera with invalid focal length",
                ));
            }
        }
        for obs in observations {
            if obs.camera_id < 0 || obs.camera_id as usize >= cameras.len() {
                return Err(SfmError::invalid_argument(
                    "observation with invalid camera id",
                ));
            }
            if obs.point_id < 0 || obs.point_id as usize >= points.len() {
                return Err(SfmError::invalid_argument(
                    "observation with invalid point id",
                ));
            }
        }
        Ok(())
    }

    fn lm_optimize(
        &mut self,
        cameras: &mut [Camera],
        points: &mut [Point3D],
        observations: &[Observation],
    ) {
        let mut trust_region_radius = TRUST_REGION_RADIUS_INIT;

        let mut vector_f =
            self.compute_reprojection_errors(cameras, points, observations, None);
        let mut current_mse = Self::compute_mse(&vector_f);
        self.status.initial_mse = current_mse;
        self.status.final_mse = current_mse;

        for lm_iter in 0.. {
            if lm_iter + 1 > self.opts.lm_min_iterations
                && current_mse < self.opts.lm_mse_threshold
            {
                debug!("BA: satisfied MSE threshold");
                break;
            }

            let (jac_cams, jac_points) = match self.opts.bundle_mode {
                BundleMode::CamerasAndPoints => {
                    let (jc, jp) = self.analytic_jacobian(cameras, points, observations);
                    (Some(jc), Some(jp))
                }
                BundleMode::CamerasOnly => {
                    let (jc, _) = self.analytic_jacobian(cameras, points, observations);
                    (Some(jc), None)
                }
                BundleMode::PointsOnly => {
                    let (_, jp) = self.analytic_jacobian(cameras, points, observations);
                    (None, Some(jp))
                }
            };

            let solver = LinearSolver::new(SolverOptions {
                camera_block_dim: self.num_cam_params(),
                cg_max_iterations: self.opts.cg_max_iterations,
                trust_region_radius,
            });
            let (cg_status, delta_x) =
                solver.solve(jac_cams.as_ref(), jac_points.as_ref(), &vector_f);

            // Evaluate the step before accepting it.
            let mut new_mse = current_mse;
            let mut delta_mse = 0.0;
            let mut delta_mse_ratio = 1.0;
            let mut vector_f_new = DenseVector::zeros(0);
            if cg_status.success {
                vector_f_new = self.compute_reprojection_errors(
                    cameras,
                    points,
                    observations,
                    Some(&delta_x),
                );
                new_mse = Self::compute_mse(&vector_f_new);
                delta_mse = current_mse - new_mse;
                delta_mse_ratio = 1.0 - new_mse / current_mse;
                self.status.num_cg_iterations += cg_status.num_cg_iterations;
            }
            let successful_iteration = delta_mse > 0.0;

            if successful_iteration {
                debug!(
                    "BA: #{:2} success, MSE {:.5e} -> {:.5e}, CG {:3}, TRR {}",
                    lm_iter, current_mse, new_mse, cg_status.num_cg_iterations,
                    trust_region_radius
                );
                self.status.num_lm_iterations += 1;
                self.status.num_lm_successful_iterations += 1;
                self.update_parameters(cameras, points, &delta_x);
                vector_f = vector_f_new;
                current_mse = new_mse;

                // Trust region update from the gain ratio.
                let gain_ratio = delta_mse * (vector_f.len() as f64 / 2.0)
                    / cg_status.predicted_error_decrease;
                let trust_region_update =
                    1.0 / (1.0_f64 / 3.0).max(1.0 - (2.0 * gain_ratio - 1.0).powi(3));
                trust_region_radius *= trust_region_update;
            } else {
                debug!(
                    "BA: #{:2} failure, MSE {:.5e}, CG {:3}, TRR {}",
                    lm_iter, current_mse, cg_status.num_cg_iterations, trust_region_radius
                );
                self.status.num_lm_iterations += 1;
                self.status.num_lm_unsuccessful_iterations += 1;
                trust_region_radius *= TRUST_REGION_RADIUS_DECREMENT;
            }

            if lm_iter + 1 < self.opts.lm_min_iterations {
                continue;
            }
            if lm_iter + 1 >= self.opts.lm_max_iterations {
                debug!(
                    "BA: reached maximum LM iterations of {}",
                    self.opts.lm_max_iterations
                );
                break;
            }
            if successful_iteration && delta_mse_ratio < self.opts.lm_delta_threshold {
                debug!(
                    "BA: satisfied delta mse ratio threshold of {}",
                    self.opts.lm_delta_threshold
                );
                break;
            }
        }

        self.status.final_mse = current_mse;
    }

    fn compute_reprojection_errors(
        &self,
        cameras: &[Camera],
        points: &[Point3D],
        observations: &[Observation],
        delta_x: Option<&DenseVector<f64>>,
    ) -> DenseVector<f64> {
        let num_cam_params = self.num_cam_params();
        let errors: Vec<[f64; 2]> = observations
            .par_iter()
            .map(|obs| {
                let point = points[obs.point_id as usize];
                let camera = &cameras[obs.camera_id as usize];

                let mut updated_camera = None;
                let mut point_pos = point.pos;
                if let Some(delta_x) = delta_x {
                    let cam_offset = obs.camera_id as usize * num_cam_params;
                    let mut point_offset = obs.point_id as usize * 3;

                    if self.opts.bundle_mode != BundleMode::PointsOnly {
                        updated_camera = Some(self.updated_camera(
                            camera,
                            &delta_x.as_slice()[cam_offset..cam_offset + num_cam_params],
                        ));
                        point_offset += cameras.len() * num_cam_params;
                    }

                    if self.opts.bundle_mode != BundleMode::CamerasOnly {
                        point_pos = Self::updated_point(
                            &point,
                            &delta_x.as_slice()[point_offset..point_offset + 3],
                        )
                        .pos;
                    }
                }
                let camera_ref = updated_camera.as_ref().unwrap_or(camera);

                // Project the point onto the image plane.
                let rot = &camera_ref.rotation;
                let trans = &camera_ref.translation;
                let mut rp = [0.0f64; 3];
                for d in 0..3 {
                    rp[0] += rot[d] * point_pos[d];
                    rp[1] += rot[3 + d] * point_pos[d];
                    rp[2] += rot[6 + d] * point_pos[d];
                }
                rp[2] += trans[2];
                rp[0] = (rp[0] + trans[0]) / rp[2];
                rp[1] = (rp[1] + trans[1]) / rp[2];

                let (x, y) = Self::radial_distort(rp[0], rp[1], &camera_ref.distortion);

                [
                    x * camera_ref.focal_length - obs.pos[0],
                    y * camera_ref.focal_length - obs.pos[1],
                ]
            })
            .collect();

        let mut vector_f = DenseVector::zeros(observations.len() * 2);
        for (i, error) in errors.iter().enumerate() {
            vector_f.set(i * 2, error[0]);
            vector_f.set(i * 2 + 1, error[1]);
        }
        vector_f
    }

    fn compute_mse(vector_f: &DenseVector<f64>) -> f64 {
        let mut mse = 0.0;
        for &value in vector_f.as_slice() {
            mse += value * value;
        }
        mse / (vector_f.len() as f64 / 2.0)
    }

    fn radial_distort(x: f64, y: f64, dist: &[f64; 2]) -> (f64, f64) {
        let radius2 = x * x + y * y;
        let factor = 1.0 + radius2 * (dist[0] + dist[1] * radius2);
        (x * factor, y * factor)
    }

    /// Converts a Rodrigues tangent-space vector to a rotation matrix
    /// using the stable closed form with the zero-angle limit.
    fn rodrigues_to_matrix(r: &[f64]) -> [f64; 9] {
        let a = (r[0] * r[0] + r[1] * r[1] + r[2] * r[2]).sqrt();
        let ct = if a == 0.0 { 0.5 } else { (1.0 - a.cos()) / (2.0 * a) };
        let st = if a == 0.0 { 1.0 } else { a.sin() / a };
        [
            1.0 - (r[1] * r[1] + r[2] * r[2]) * ct,
            r[0] * r[1] * ct - r[2] * st,
            r[2] * r[0] * ct + r[1] * st,
            r[0] * r[1] * ct + r[2] * st,
            1.0 - (r[2] * r[2] + r[0] * r[0]) * ct,
            r[1] * r[2] * ct - r[0] * st,
            r[2] * r[0] * ct - r[1] * st,
            r[1] * r[2] * ct + r[0] * st,
            1.0 - (r[0] * r[0] + r[1] * r[1]) * ct,
        ]
    }

    /// Computes the camera and point Jacobians. Per-observation blocks
    /// are assembled independently in parallel into preallocated triplet
    /// slots; the matrices are finalized single-threaded afterwards.
    fn analytic_jacobian(
        &self,
        cameras: &[Camera],
        points: &[Point3D],
        observations: &[Observation],
    ) -> (SparseMatrix<f64>, SparseMatrix<f64>) {
        let num_cam_params = self.num_cam_params();
        let camera_cols = cameras.len() * num_cam_params;
        let point_cols = points.len() * 3;
        let jacobi_rows = observations.len() * 2;

        let mut cam_triplets =
            vec![Triplet::<f64>::default(); observations.len() * 2 * num_cam_params];
        let mut point_triplets = vec![Triplet::<f64>::default(); observations.len() * 3 * 2];

        cam_triplets
            .par_chunks_mut(2 * num_cam_params)
            .zip(point_triplets.par_chunks_mut(6))
            .zip(observations.par_iter().enumerate())
            .for_each(|((cam_slots, point_slots), (i, obs))| {
                let camera = &cameras[obs.camera_id as usize];
                let point = &points[obs.point_id as usize];

                let mut cam_x = [0.0f64; 9];
                let mut cam_y = [0.0f64; 9];
                let mut point_x = [0.0f64; 3];
                let mut point_y = [0.0f64; 3];
                self.jacobian_entries(
                    camera,
                    point,
                    &mut cam_x,
                    &mut cam_y,
                    &mut point_x,
                    &mut point_y,
                );

                if camera.is_constant {
                    cam_x = [0.0; 9];
                    cam_y = [0.0; 9];
                }
                if point.is_constant {
                    point_x = [0.0; 3];
                    point_y = [0.0; 3];
                }

                let row_x = i * 2;
                let row_y = row_x + 1;
                let cam_col = obs.camera_id as usize * num_cam_params;
                let point_col = obs.point_id as usize * 3;

                for j in 0..num_cam_params {
                    cam_slots[j * 2] = Triplet::new(row_x, cam_col + j, cam_x[j]);
                    cam_slots[j * 2 + 1] = Triplet::new(row_y, cam_col + j, cam_y[j]);
                }
                for j in 0..3 {
                    point_slots[j * 2] = Triplet::new(row_x, point_col + j, point_x[j]);
                    point_slots[j * 2 + 1] = Triplet::new(row_y, point_col + j, point_y[j]);
                }
            });

        let mut jac_cams = SparseMatrix::new(jacobi_rows, camera_cols);
        jac_cams.set_from_triplets(&cam_triplets);
        let mut jac_points = SparseMatrix::new(jacobi_rows, point_cols);
        jac_points.set_from_triplets(&point_triplets);
        (jac_cams, jac_points)
    }

    /// Jacobian entries for one camera/point pair.
    ///
    /// The camera block carries the derivatives of focal length,
    /// distortion, translation and the tangent-space rotation update,
    /// in that order; with fixed intrinsics the first three entries are
    /// dropped. The point block carries the derivatives in x, y and z.
    fn jacobian_entries(
        &self,
        camera: &Camera,
        point: &Point3D,
        cam_x_ptr: &mut [f64; 9],
        cam_y_ptr: &mut [f64; 9],
        point_x_ptr: &mut [f64; 3],
        point_y_ptr: &mut [f64; 3],
    ) {
        let r = &camera.rotation;
        let t = &camera.translation;
        let k = &camera.distortion;
        let p3d = &point.pos;

        let rx = r[0] * p3d[0] + r[1] * p3d[1] + r[2] * p3d[2];
        let ry = r[3] * p3d[0] + r[4] * p3d[1] + r[5] * p3d[2];
        let rz = r[6] * p3d[0] + r[7] * p3d[1] + r[8] * p3d[2];
        let px = rx + t[0];
        let py = ry + t[1];
        let pz = rz + t[2];
        let ix = px / pz;
        let iy = py / pz;
        let fz = camera.focal_length / pz;
        let radius2 = ix * ix + iy * iy;
        let rd_factor = 1.0 + (k[0] + k[1] * radius2) * radius2;

        if self.opts.fixed_intrinsics {
            cam_x_ptr[0] = fz * rd_factor;
            cam_x_ptr[1] = 0.0;
            cam_x_ptr[2] = -fz * rd_factor * ix;
            cam_x_ptr[3] = -fz * rd_factor * ry * ix;
            cam_x_ptr[4] = fz * rd_factor * (rz + rx * ix);
            cam_x_ptr[5] = -fz * rd_factor * ry;

            cam_y_ptr[0] = 0.0;
            cam_y_ptr[1] = fz * rd_factor;
            cam_y_ptr[2] = -fz * rd_factor * iy;
            cam_y_ptr[3] = -fz * rd_factor * (rz + ry * iy);
            cam_y_ptr[4] = fz * rd_factor * rx * iy;
            cam_y_ptr[5] = fz * rd_factor * rx;

            point_x_ptr[0] = fz * rd_factor * (r[0] - r[6] * ix);
            point_x_ptr[1] = fz * rd_factor * (r[1] - r[7] * ix);
            point_x_ptr[2] = fz * rd_factor * (r[2] - r[8] * ix);

            point_y_ptr[0] = fz * rd_factor * (r[3] - r[6] * iy);
            point_y_ptr[1] = fz * rd_factor * (r[4] - r[7] * iy);
            point_y_ptr[2] = fz * rd_factor * (r[5] - r[8] * iy);
            return;
        }

        // The intrinsics are exact and easy.
        cam_x_ptr[0] = ix * rd_factor;
        cam_x_ptr[1] = camera.focal_length * ix * radius2;
        cam_x_ptr[2] = camera.focal_length * ix * radius2 * radius2;

        cam_y_ptr[0] = iy * rd_factor;
        cam_y_ptr[1] = camera.focal_length * iy * radius2;
        cam_y_ptr[2] = camera.focal_length * iy * radius2 * radius2;

        // Full Jacobian of the extrinsics and the point through the chain
        // rule over (rd, ix, iy, p).
        let f = camera.focal_length;

        let rd_deriv_rad = k[0] + 2.0 * k[1] * radius2;

        let rad_deriv_px = 2.0 * ix / pz;
        let rad_deriv_py = 2.0 * iy / pz;
        let rad_deriv_pz = -2.0 * radius2 / pz;

        let rd_deriv_px = rd_deriv_rad * rad_deriv_px;
        let rd_deriv_py = rd_deriv_rad * rad_deriv_py;
        let rd_deriv_pz = rd_deriv_rad * rad_deriv_pz;

        let ix_deriv_px = 1.0 / pz;
        let ix_deriv_pz = -ix / pz;

        let iy_deriv_py = 1.0 / pz;
        let iy_deriv_pz = -iy / pz;

        let ix_deriv_r0 = -ix * ry / pz;
        let ix_deriv_r1 = (rz + rx * ix) / pz;
        let ix_deriv_r2 = -ry / pz;

        let iy_deriv_r0 = -(rz + ry * iy) / pz;
        let iy_deriv_r1 = rx * iy / pz;
        let iy_deriv_r2 = rx / pz;

        let rad_deriv_r0 = 2.0 * ix * ix_deriv_r0 + 2.0 * iy * iy_deriv_r0;
        let rad_deriv_r1 = 2.0 * ix * ix_deriv_r1 + 2.0 * iy * iy_deriv_r1;
        let rad_deriv_r2 = 2.0 * ix * ix_deriv_r2 + 2.0 * iy * iy_deriv_r2;

        let rd_deriv_r0 = rd_deriv_rad * rad_deriv_r0;
        let rd_deriv_r1 = rd_deriv_rad * rad_deriv_r1;
        let rd_deriv_r2 = rd_deriv_rad * rad_deriv_r2;

        let ix_deriv_x0 = (r[0] - r[6] * ix) / pz;
        let ix_deriv_x1 = (r[1] - r[7] * ix) / pz;
        let ix_deriv_x2 = (r[2] - r[8] * ix) / pz;

        let iy_deriv_x0 = (r[3] - r[6] * iy) / pz;
        let iy_deriv_x1 = (r[4] - r[7] * iy) / pz;
        let iy_deriv_x2 = (r[5] - r[8] * iy) / pz;

        let rad_deriv_x0 = 2.0 * ix * ix_deriv_x0 + 2.0 * iy * iy_deriv_x0;
        let rad_deriv_x1 = 2.0 * ix * ix_deriv_x1 + 2.0 * iy * iy_deriv_x1;
        let rad_deriv_x2 = 2.0 * ix * ix_deriv_x2 + 2.0 * iy * iy_deriv_x2;

        let rd_deriv_x0 = rd_deriv_rad * rad_deriv_x0;
        let rd_deriv_x1 = rd_deriv_rad * rad_deriv_x1;
        let rd_deriv_x2 = rd_deriv_rad * rad_deriv_x2;

        // Translation derivatives.
        cam_x_ptr[3] = f * (rd_deriv_px * ix + rd_factor * ix_deriv_px);
        cam_x_ptr[4] = f * (rd_deriv_py * ix);
        cam_x_ptr[5] = f * (rd_deriv_pz * ix + rd_factor * ix_deriv_pz);

        cam_y_ptr[3] = f * (rd_deriv_px * iy);
        cam_y_ptr[4] = f * (rd_deriv_py * iy + rd_factor * iy_deriv_py);
        cam_y_ptr[5] = f * (rd_deriv_pz * iy + rd_factor * iy_deriv_pz);

        // Rotation derivatives.
        cam_x_ptr[6] = f * (rd_deriv_r0 * ix + rd_factor * ix_deriv_r0);
        cam_x_ptr[7] = f * (rd_deriv_r1 * ix + rd_factor * ix_deriv_r1);
        cam_x_ptr[8] = f * (rd_deriv_r2 * ix + rd_factor * ix_deriv_r2);

        cam_y_ptr[6] = f * (rd_deriv_r0 * iy + rd_factor * iy_deriv_r0);
        cam_y_ptr[7] = f * (rd_deriv_r1 * iy + rd_factor * iy_deriv_r1);
        cam_y_ptr[8] = f * (rd_deriv_r2 * iy + rd_factor * iy_deriv_r2);

        // Point derivatives in x, y and z.
        point_x_ptr[0] = f * (rd_deriv_x0 * ix + rd_factor * ix_deriv_x0);
        point_x_ptr[1] = f * (rd_deriv_x1 * ix + rd_factor * ix_deriv_x1);
        point_x_ptr[2] = f * (rd_deriv_x2 * ix + rd_factor * ix_deriv_x2);

        point_y_ptr[0] = f * (rd_deriv_x0 * iy + rd_factor * iy_deriv_x0);
        point_y_ptr[1] = f * (rd_deriv_x1 * iy + rd_factor * iy_deriv_x1);
        point_y_ptr[2] = f * (rd_deriv_x2 * iy + rd_factor * iy_deriv_x2);
    }

    fn updated_camera(&self, camera: &Camera, update: &[f64]) -> Camera {
        let mut out = camera.clone();
        let offset = if self.opts.fixed_intrinsics {
            0
        } else {
            out.focal_length = camera.focal_length + update[0];
            out.distortion[0] = camera.distortion[0] + update[1];
            out.distortion[1] = camera.distortion[1] + update[2];
            3
        };

        out.translation[0] = camera.translation[0] + update[offset];
        out.translation[1] = camera.translation[1] + update[offset + 1];
        out.translation[2] = camera.translation[2] + update[offset + 2];

        // Left-multiply the rotation update: R <- rodrigues(dr) * R.
        let rot_update = Self::rodrigues_to_matrix(&update[offset + 3..offset + 6]);
        let mut rotation = [0.0f64; 9];
        for i in 0..3 {
            for j in 0..3 {
                for l in 0..3 {
                    rotation[i * 3 + j] += rot_update[i * 3 + l] * camera.rotation[l * 3 + j];
                }
            }
        }
        out.rotation = rotation;
        out
    }

    fn updated_point(point: &Point3D, update: &[f64]) -> Point3D {
        Point3D {
            pos: [
                point.pos[0] + update[0],
                point.pos[1] + update[1],
                point.pos[2] + update[2],
            ],
            is_constant: point.is_constant,
        }
    }

    fn update_parameters(
        &self,
        cameras: &mut [Camera],
        points: &mut [Point3D],
        delta_x: &DenseVector<f64>,
    ) {
        let num_cam_params = self.num_cam_params();
        let mut total_camera_params = 0;
        if self.opts.bundle_mode != BundleMode::PointsOnly {
            for (i, camera) in cameras.iter_mut().enumerate() {
                let offset = i * num_cam_params;
                *camera = self.updated_camera(
                    camera,
                    &delta_x.as_slice()[offset..offset + num_cam_params],
                );
            }
            total_camera_params = cameras.len() * num_cam_params;
        }

        if self.opts.bundle_mode != BundleMode::CamerasOnly {
            for (i, point) in points.iter_mut().enumerate() {
                let offset = total_camera_params + i * 3;
                *point = Self::updated_point(point, &delta_x.as_slice()[offset..offset + 3]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotation_y(angle: f64) -> [f64; 9] {
        let (s, c) = angle.sin_cos();
        [c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c]
    }

    fn project(camera: &Camera, point: &Point3D) -> [f64; 2] {
        let r = &camera.rotation;
        let p = &point.pos;
        let x = r[0] * p[0] + r[1] * p[1] + r[2] * p[2] + camera.translation[0];
        let y = r[3] * p[0] + r[4] * p[1] + r[5] * p[2] + camera.translation[1];
        let z = r[6] * p[0] + r[7] * p[1] + r[8] * p[2] + camera.translation[2];
        let (ix, iy) = (x / z, y / z);
        let radius2 = ix * ix + iy * iy;
        let rd = 1.0 + radius2 * (camera.distortion[0] + camera.distortion[1] * radius2);
        [camera.focal_length * rd * ix, camera.focal_length * rd * iy]
    }

    fn synthetic_problem() -> (Vec<Camera>, Vec<Point3D>, Vec<Observation>) {
        let cam1 = Camera {
            focal_length: 1.0,
            ..Default::default()
        };
        let cam2 = Camera {
            focal_length: 1.0,
            rotation: rotation_y(0.08),
            translation: [0.2, 0.0, 0.1],
            ..Default::default()
        };

        let points: Vec<Point3D> = [
            [0.0, 0.0, 2.0],
            [0.5, 0.3, 2.5],
            [-0.4, 0.2, 3.0],
            [0.3, -0.4, 2.2],
            [-0.2, -0.3, 2.8],
            [0.1, 0.5, 2.4],
            [0.6, -0.1, 3.1],
            [-0.5, -0.5, 2.6],
        ]
        .iter()
        .map(|&pos| Point3D {
            pos,
            is_constant: false,
        })
        .collect();

        let cameras = vec![cam1, cam2];
        let mut observations = Vec::new();
        for (ci, camera) in cameras.iter().enumerate() {
            for (pi, point) in points.iter().enumerate() {
                observations.push(Observation {
                    pos: project(camera, point),
                    camera_id: ci as i32,
                    point_id: pi as i32,
                });
            }
        }
        (cameras, points, observations)
    }

    #[test]
    fn test_ba_reduces_reprojection_error() {
        let (mut cameras, mut points, observations) = synthetic_problem();

        // Perturb the second camera: identity rotation instead of the
        // true one.
        cameras[1].rotation = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

        let mut ba = BundleAdjustment::new(BundleOptions::default());
        let status = ba
            .optimize(&mut cameras, &mut points, &observations)
            .unwrap();

        assert!(status.initial_mse > 1e-4);
        assert!(
            status.final_mse < 1e-8,
            "final MSE too large: {}",
            status.final_mse
        );
        assert!(status.num_lm_iterations > 0);
    }

    #[test]
    fn test_ba_exact_input_is_stable() {
        let (mut cameras, mut points, observations) = synthetic_problem();
        let mut ba = BundleAdjustment::new(BundleOptions::default());
        let status = ba
            .optimize(&mut cameras, &mut points, &observations)
            .unwrap();
        assert!(status.initial_mse < 1e-20);
        assert!(status.final_mse <= status.initial_mse + 1e-20);
    }

    #[test]
    fn test_ba_rejects_invalid_focal_length() {
        let (mut cameras, mut points, observations) = synthetic_problem();
        cameras[0].focal_length = 0.0;
        let mut ba = BundleAdjustment::new(BundleOptions::default());
        assert!(ba
            .optimize(&mut cameras, &mut points, &observations)
            .is_err());
    }

    #[test]
    fn test_ba_rejects_invalid_observation_ids() {
        let (mut cameras, mut points, mut observations) = synthetic_problem();
        observations[0].point_id = 1000;
        let mut ba = BundleAdjustment::new(BundleOptions::default());
        assert!(ba
            .optimize(&mut cameras, &mut points, &observations)
            .is_err());
    }

    #[test]
    fn test_ba_cameras_only_mode() {
        let (mut cameras, mut points, observations) = synthetic_problem();
        cameras[1].translation[0] += 0.01;
        let points_before = points.clone();

        let mut ba = BundleAdjustment::new(BundleOptions {
            bundle_mode: BundleMode::CamerasOnly,
            fixed_intrinsics: true,
            ..Default::default()
        });
        let status = ba
            .optimize(&mut cameras, &mut points, &observations)
            .unwrap();

        assert!(status.final_mse < status.initial_mse);
        for (before, after) in points_before.iter().zip(points.iter()) {
            assert_eq!(before.pos, after.pos);
        }
    }

    #[test]
    fn test_rodrigues_zero_angle() {
        let rot = BundleAdjustment::rodrigues_to_matrix(&[0.0, 0.0, 0.0]);
        let identity = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        assert_eq!(rot, identity);
    }

    #[test]
    fn test_rodrigues_small_angle() {
        // For small updates the closed form matches the exact rotation.
        let angle = 1e-3;
        let rot = BundleAdjustment::rodrigues_to_matrix(&[0.0, 0.0, angle]);
        let (s, c) = f64::sin_cos(angle);
        let exact = [c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0];
        for i in 0..9 {
            assert!((rot[i] - exact[i]).abs() < 1e-6);
        }
    }
}
