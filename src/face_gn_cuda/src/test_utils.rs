//! Synthetic face models and observations for testing.
//!
//! Provides a small linear blendshape face with known ground truth so the
//! solver can be checked end to end without an external face model or a
//! landmark detector.

use anyhow::Result;
use nalgebra::{DMatrix, Matrix3, Matrix4, Perspective3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

use crate::derivatives::cpu::project_vertex;
use crate::model::{FaceModel, FaceStateMut, FeatureCorrespondence};

/// Per-coefficient vertex displacement scale of the random shape basis.
const SHAPE_BASIS_SCALE: f32 = 0.005;

/// Per-coefficient vertex displacement scale of the random expression basis.
const EXPRESSION_BASIS_SCALE: f32 = 0.01;

/// Default distance of the face from the camera (camera looks down -z).
pub const DEFAULT_FACE_DEPTH: f32 = -0.6;

/// Linear blendshape face: `v = mean + B_shape · diag(σ_s) · α + B_expr · diag(σ_e) · δ`.
///
/// The stored bases are the unit-variance ones, so `basis[:, j]` is
/// `∂v/∂coeff_j / σ_j` as [`FaceModel`] requires.
///
/// Rotation uses XYZ Euler angles composed as `R = Rz · Ry · Rx`.
#[derive(Debug, Clone)]
pub struct SyntheticFace {
    mean: Vec<Vector3<f32>>,
    vertices: Vec<Vector3<f32>>,
    shape_basis: DMatrix<f32>,
    expression_basis: DMatrix<f32>,
    shape: Vec<f32>,
    expression: Vec<f32>,
    shape_std_dev: Vec<f32>,
    expression_std_dev: Vec<f32>,
    rotation: Vector3<f32>,
    translation: Vector3<f32>,
}

impl SyntheticFace {
    /// Create a face with `vertex_count` vertices on a curved patch and
    /// random bases. All coefficients start at zero.
    ///
    /// # Arguments
    /// * `vertex_count` - Number of mesh vertices
    /// * `num_shape` - Shape basis width
    /// * `num_expression` - Expression basis width
    /// * `std_dev` - Standard deviation reported for every coefficient
    /// * `seed` - RNG seed for vertex positions and bases
    pub fn new(
        vertex_count: usize,
        num_shape: usize,
        num_expression: usize,
        std_dev: f32,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let mean: Vec<Vector3<f32>> = (0..vertex_count)
            .map(|_| {
                let x = rng.gen_range(-0.08f32..0.08);
                let y = rng.gen_range(-0.1f32..0.1);
                let z = 0.03 - 1.5 * (x * x + y * y);
                Vector3::new(x, y, z)
            })
            .collect();

        let shape_basis = random_basis(&mut rng, vertex_count, num_shape, SHAPE_BASIS_SCALE);
        let expression_basis = random_basis(
            &mut rng,
            vertex_count,
            num_expression,
            EXPRESSION_BASIS_SCALE,
        );

        Self {
            vertices: mean.clone(),
            mean,
            shape_basis,
            expression_basis,
            shape: vec![0.0; num_shape],
            expression: vec![0.0; num_expression],
            shape_std_dev: vec![std_dev; num_shape],
            expression_std_dev: vec![std_dev; num_expression],
            rotation: Vector3::zeros(),
            translation: Vector3::new(0.0, 0.0, DEFAULT_FACE_DEPTH),
        }
    }

    pub fn rotation(&self) -> Vector3<f32> {
        self.rotation
    }

    pub fn translation(&self) -> Vector3<f32> {
        self.translation
    }

    pub fn set_rotation(&mut self, rotation: Vector3<f32>) {
        self.rotation = rotation;
    }

    pub fn set_translation(&mut self, translation: Vector3<f32>) {
        self.translation = translation;
    }

    /// Set shape coefficients and refresh the vertices.
    pub fn set_shape_coefficients(&mut self, coefficients: &[f32]) {
        self.shape.copy_from_slice(coefficients);
        self.update_vertices();
    }

    /// Set expression coefficients and refresh the vertices.
    pub fn set_expression_coefficients(&mut self, coefficients: &[f32]) {
        self.expression.copy_from_slice(coefficients);
        self.update_vertices();
    }

    /// Add `delta` to pose parameter `index` (0-2 rotation, 3-5 translation).
    pub fn perturb_pose(&mut self, index: usize, delta: f32) {
        if index < 3 {
            self.rotation[index] += delta;
        } else {
            self.translation[index - 3] += delta;
        }
    }

    /// Add `delta` to coefficient `index` (shape first, then expression).
    pub fn perturb_coefficient(&mut self, index: usize, delta: f32) {
        if index < self.shape.len() {
            self.shape[index] += delta;
        } else {
            self.expression[index - self.shape.len()] += delta;
        }
    }

    /// Rotation matrix `Rz · Ry · Rx`.
    pub fn rotation_matrix(&self) -> Matrix3<f32> {
        rot_z(self.rotation.z) * rot_y(self.rotation.y) * rot_x(self.rotation.x)
    }

    fn update_vertices(&mut self) {
        let mean = &self.mean;
        let shape_basis = &self.shape_basis;
        let expression_basis = &self.expression_basis;
        let shape = &self.shape;
        let expression = &self.expression;
        let shape_std_dev = &self.shape_std_dev;
        let expression_std_dev = &self.expression_std_dev;

        self.vertices
            .par_iter_mut()
            .enumerate()
            .for_each(|(v, vertex)| {
                let mut position = mean[v];
                for axis in 0..3 {
                    let row = 3 * v + axis;
                    for (j, c) in shape.iter().enumerate() {
                        position[axis] += shape_basis[(row, j)] * shape_std_dev[j] * c;
                    }
                    for (j, c) in expression.iter().enumerate() {
                        position[axis] += expression_basis[(row, j)] * expression_std_dev[j] * c;
                    }
                }
                *vertex = position;
            });
    }
}

impl FaceModel for SyntheticFace {
    fn vertex_count(&self) -> usize {
        self.mean.len()
    }

    fn recompute_geometry(&mut self) -> Result<()> {
        self.update_vertices();
        Ok(())
    }

    fn vertices(&self) -> &[Vector3<f32>] {
        &self.vertices
    }

    fn model_matrix(&self) -> Matrix4<f32> {
        let mut model = Matrix4::identity();
        model
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        model
            .fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&self.translation);
        model
    }

    fn rotation_derivatives(&self) -> [Matrix3<f32>; 3] {
        let (rx, ry, rz) = (self.rotation.x, self.rotation.y, self.rotation.z);
        [
            rot_z(rz) * rot_y(ry) * d_rot_x(rx),
            rot_z(rz) * d_rot_y(ry) * rot_x(rx),
            d_rot_z(rz) * rot_y(ry) * rot_x(rx),
        ]
    }

    fn shape_basis(&self) -> &DMatrix<f32> {
        &self.shape_basis
    }

    fn expression_basis(&self) -> &DMatrix<f32> {
        &self.expression_basis
    }

    fn shape_coefficients(&self) -> &[f32] {
        &self.shape
    }

    fn expression_coefficients(&self) -> &[f32] {
        &self.expression
    }

    fn shape_std_dev(&self) -> &[f32] {
        &self.shape_std_dev
    }

    fn expression_std_dev(&self) -> &[f32] {
        &self.expression_std_dev
    }

    fn state_mut(&mut self) -> FaceStateMut<'_> {
        FaceStateMut {
            rotation: &mut self.rotation,
            translation: &mut self.translation,
            shape: &mut self.shape,
            expression: &mut self.expression,
            shape_std_dev: &self.shape_std_dev,
            expression_std_dev: &self.expression_std_dev,
        }
    }
}

fn random_basis(rng: &mut StdRng, vertex_count: usize, columns: usize, scale: f32) -> DMatrix<f32> {
    DMatrix::from_fn(3 * vertex_count, columns, |_, _| {
        let sample: f32 = rng.sample(StandardNormal);
        sample * scale
    })
}

fn rot_x(a: f32) -> Matrix3<f32> {
    let (s, c) = a.sin_cos();
    Matrix3::new(1.0, 0.0, 0.0, 0.0, c, -s, 0.0, s, c)
}

fn rot_y(a: f32) -> Matrix3<f32> {
    let (s, c) = a.sin_cos();
    Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c)
}

fn rot_z(a: f32) -> Matrix3<f32> {
    let (s, c) = a.sin_cos();
    Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
}

fn d_rot_x(a: f32) -> Matrix3<f32> {
    let (s, c) = a.sin_cos();
    Matrix3::new(0.0, 0.0, 0.0, 0.0, -s, -c, 0.0, c, -s)
}

fn d_rot_y(a: f32) -> Matrix3<f32> {
    let (s, c) = a.sin_cos();
    Matrix3::new(-s, 0.0, c, 0.0, 0.0, 0.0, -c, 0.0, -s)
}

fn d_rot_z(a: f32) -> Matrix3<f32> {
    let (s, c) = a.sin_cos();
    Matrix3::new(-s, -c, 0.0, c, -s, 0.0, 0.0, 0.0, 0.0)
}

/// OpenGL-style perspective matrix used by the tests (fovy 0.8 rad, square).
pub fn make_projection() -> Matrix4<f32> {
    Perspective3::new(1.0, 0.8, 0.01, 10.0).to_homogeneous()
}

/// Evenly spaced landmark vertex ids.
pub fn landmark_ids(count: usize, vertex_count: usize) -> Vec<u32> {
    let step = (vertex_count / count.max(1)).max(1);
    (0..count)
        .map(|i| ((i * step) % vertex_count) as u32)
        .collect()
}

/// Project the given vertices through the face's current pose and camera.
pub fn render_observations<M: FaceModel>(
    face: &M,
    projection: &Matrix4<f32>,
    vertex_ids: &[u32],
) -> Vec<FeatureCorrespondence> {
    let model = face.model_matrix();
    vertex_ids
        .iter()
        .map(|&id| {
            let projected = project_vertex(&model, projection, &face.vertices()[id as usize]);
            FeatureCorrespondence::new(id, projected.screen)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rotation_derivatives_match_finite_differences() {
        let mut face = SyntheticFace::new(4, 0, 0, 1.0, 1);
        face.set_rotation(Vector3::new(0.3, -0.2, 0.7));
        let analytic = face.rotation_derivatives();

        let h = 1e-3f32;
        for (axis, derivative) in analytic.iter().enumerate() {
            let mut plus = face.clone();
            let mut minus = face.clone();
            plus.perturb_pose(axis, h);
            minus.perturb_pose(axis, -h);
            let numeric = (plus.rotation_matrix() - minus.rotation_matrix()) / (2.0 * h);

            for i in 0..3 {
                for j in 0..3 {
                    assert_relative_eq!(derivative[(i, j)], numeric[(i, j)], epsilon = 1e-3);
                }
            }
        }
    }

    #[test]
    fn test_geometry_follows_coefficients() {
        let mut face = SyntheticFace::new(10, 2, 1, 1.0, 2);
        let before = face.vertices()[3];

        face.set_shape_coefficients(&[1.0, 0.0]);
        let after = face.vertices()[3];

        for axis in 0..3 {
            assert_relative_eq!(
                after[axis] - before[axis],
                face.shape_basis()[(9 + axis, 0)],
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn test_basis_is_derivative_over_std_dev() {
        let sigma = 2.5;
        let mut face = SyntheticFace::new(10, 2, 2, sigma, 4);
        face.set_expression_coefficients(&[0.5, 0.5]);
        let before = face.vertices()[6];

        let h = 0.1;
        face.perturb_coefficient(1, h); // second shape coefficient
        face.perturb_coefficient(3, h); // second expression coefficient
        face.recompute_geometry().unwrap();
        let after = face.vertices()[6];

        for axis in 0..3 {
            let row = 18 + axis;
            let expected =
                sigma * h * (face.shape_basis()[(row, 1)] + face.expression_basis()[(row, 1)]);
            assert_relative_eq!(after[axis] - before[axis], expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_face_is_in_front_of_camera() {
        let face = SyntheticFace::new(50, 0, 0, 1.0, 9);
        let projection = make_projection();
        let ids: Vec<u32> = (0..50).collect();

        for feature in render_observations(&face, &projection, &ids) {
            assert!(feature.observed.x.abs() < 1.0);
            assert!(feature.observed.y.abs() < 1.0);
        }
    }

    #[test]
    fn test_landmark_ids_in_range() {
        let ids = landmark_ids(68, 500);

        assert_eq!(ids.len(), 68);
        assert!(ids.iter().all(|&id| id < 500));
    }
}
