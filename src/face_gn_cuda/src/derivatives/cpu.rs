//! CPU reference implementation of the Jacobian/residual builder.
//!
//! Sequential, nalgebra-based mirror of the device kernels in
//! [`super::kernels`]. Each feature contributes two residual rows
//! (`predicted - observed`) and the matching Jacobian row pair; each
//! regularized coefficient contributes one row with a single diagonal entry.
//!
//! The chain rule for a feature with local vertex `l`:
//!
//! ```text
//! world = M · [l, 1]          (model matrix)
//! clip  = P · [world, 1]      (projection matrix, w = -z)
//! uv    = clip.xy / clip.w
//!
//! ∂uv/∂focal       = Jproj · Jintr
//! ∂uv/∂(rot,trans) = Jproj · Jcam · Jpose
//! ∂uv/∂coeff       = Jproj · Jcam · R · B[3v..3v+3, :]
//! ```

use nalgebra::{DMatrix, Matrix2x3, Matrix3, Matrix4, Vector2, Vector3, Vector4};

use super::types::{
    CameraJacobian, FrameGeometry, IntrinsicsJacobian, LinearSystem, PoseJacobian,
    ProjectionJacobian, SystemLayout, FOCAL_COL, ROTATION_COL,
};
use crate::model::FeatureCorrespondence;

/// Projection of one local vertex through model and camera matrices.
#[derive(Debug, Clone, Copy)]
pub struct ProjectedVertex {
    pub world: Vector3<f32>,
    pub clip: Vector4<f32>,
    pub screen: Vector2<f32>,
}

/// Project a local-space vertex to screen space.
pub fn project_vertex(
    model_matrix: &Matrix4<f32>,
    projection: &Matrix4<f32>,
    local: &Vector3<f32>,
) -> ProjectedVertex {
    let world = (model_matrix * local.push(1.0)).xyz();
    let clip = projection * world.push(1.0);
    let screen = Vector2::new(clip.x, clip.y) / clip.w;

    ProjectedVertex {
        world,
        clip,
        screen,
    }
}

/// Jacobian of the homogeneous divide `(x/w, y/w)` wrt `(x, y, w)`.
pub fn perspective_divide_jacobian(clip: &Vector4<f32>) -> ProjectionJacobian {
    let one_over_w = 1.0 / clip.w;
    let one_over_w2 = one_over_w * one_over_w;

    Matrix2x3::new(
        one_over_w,
        0.0,
        -clip.x * one_over_w2,
        0.0,
        one_over_w,
        -clip.y * one_over_w2,
    )
}

/// Jacobian of `(clip x, clip y, clip w)` wrt world coordinates.
///
/// Assumes a perspective matrix whose x/y rows only scale and whose w row is
/// `(0, 0, -1, 0)`.
pub fn camera_jacobian(projection: &Matrix4<f32>) -> CameraJacobian {
    Matrix3::new(
        projection[(0, 0)],
        0.0,
        0.0,
        0.0,
        projection[(1, 1)],
        0.0,
        0.0,
        0.0,
        -1.0,
    )
}

/// Jacobian of clip coordinates wrt the focal entry `P[0][0]`.
pub fn intrinsics_jacobian(world: &Vector3<f32>) -> IntrinsicsJacobian {
    Vector3::new(world.x, 0.0, 0.0)
}

/// Jacobian of world coordinates wrt rotation (columns 0-2) and translation
/// (columns 3-5, identity).
pub fn pose_jacobian(
    rotation_derivatives: &[Matrix3<f32>; 3],
    local: &Vector3<f32>,
) -> PoseJacobian {
    let mut jacobian = PoseJacobian::zeros();
    for (axis, derivative) in rotation_derivatives.iter().enumerate() {
        jacobian.set_column(axis, &(derivative * local));
    }
    jacobian
        .fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&Matrix3::identity());
    jacobian
}

/// Write the residuals and Jacobian row pair of every feature.
///
/// Rows `2i` and `2i + 1` belong to feature `i`; no other rows are touched.
pub fn build_feature_rows_cpu(
    geometry: &FrameGeometry<'_>,
    features: &[FeatureCorrespondence],
    system: &mut LinearSystem,
) {
    let layout = system.layout;
    let camera = camera_jacobian(&geometry.projection);
    let local_jacobian = geometry.model_matrix.fixed_view::<3, 3>(0, 0).into_owned();

    for (i, feature) in features.iter().enumerate() {
        let vertex_id = feature.vertex_id as usize;
        let local = geometry.vertices[vertex_id];
        let projected = project_vertex(&geometry.model_matrix, &geometry.projection, &local);
        let row = 2 * i;

        let residual = projected.screen - feature.observed;
        system.residuals[row] = residual.x;
        system.residuals[row + 1] = residual.y;

        let proj = perspective_divide_jacobian(&projected.clip);

        // Focal
        system
            .jacobian
            .fixed_view_mut::<2, 1>(row, FOCAL_COL)
            .copy_from(&(proj * intrinsics_jacobian(&projected.world)));

        // Rotation + translation
        let proj_world = proj * camera;
        let pose = pose_jacobian(&geometry.rotation_derivatives, &local);
        system
            .jacobian
            .fixed_view_mut::<2, 6>(row, ROTATION_COL)
            .copy_from(&(proj_world * pose));

        // Shape + expression: the rotation maps local basis offsets to world
        let proj_world_local = proj_world * local_jacobian;
        write_basis_block(
            system,
            &proj_world_local,
            geometry.shape_basis,
            vertex_id,
            row,
            layout.shape_col(),
            layout.num_shape,
        );
        write_basis_block(
            system,
            &proj_world_local,
            geometry.expression_basis,
            vertex_id,
            row,
            layout.expression_col(),
            layout.num_expression,
        );
    }
}

fn write_basis_block(
    system: &mut LinearSystem,
    proj_world_local: &Matrix2x3<f32>,
    basis: &DMatrix<f32>,
    vertex_id: usize,
    row: usize,
    col: usize,
    count: usize,
) {
    if count == 0 {
        return;
    }
    let vertex_rows = basis.fixed_rows::<3>(3 * vertex_id);
    let block = proj_world_local * vertex_rows.columns(0, count);
    system
        .jacobian
        .fixed_rows_mut::<2>(row)
        .columns_mut(col, count)
        .copy_from(&block);
}

/// Write one weighted L2 prior row per regularized coefficient.
///
/// Row `2n + j` gets `√w` in column `7 + j` and residual `√w · coeff_j`,
/// adding `w · coeff_j²` to the objective.
pub fn build_regularizer_rows_cpu(
    geometry: &FrameGeometry<'_>,
    regularization_weight: f32,
    system: &mut LinearSystem,
) {
    let layout = system.layout;
    let sqrt_weight = regularization_weight.sqrt();

    let coefficients = geometry.shape_coefficients[..layout.num_shape]
        .iter()
        .chain(&geometry.expression_coefficients[..layout.num_expression]);

    for (j, &coefficient) in coefficients.enumerate() {
        let row = layout.regularizer_row() + j;
        let col = layout.shape_col() + j;
        system.jacobian[(row, col)] = sqrt_weight;
        system.residuals[row] = sqrt_weight * coefficient;
    }
}

/// Build the full system (feature rows and regularizer rows) on the host.
pub fn build_system_cpu(
    layout: SystemLayout,
    geometry: &FrameGeometry<'_>,
    features: &[FeatureCorrespondence],
    regularization_weight: f32,
) -> LinearSystem {
    let mut system = LinearSystem::zeros(layout);
    build_feature_rows_cpu(geometry, features, &mut system);
    build_regularizer_rows_cpu(geometry, regularization_weight, &mut system);
    system
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FaceModel;
    use crate::test_utils::{make_projection, render_observations, SyntheticFace};
    use approx::assert_relative_eq;

    fn geometry_residuals(
        face: &SyntheticFace,
        projection: &Matrix4<f32>,
        features: &[FeatureCorrespondence],
    ) -> Vec<f32> {
        let geometry = FrameGeometry::capture(face, projection);
        let layout = SystemLayout::new(features.len(), 0, 0);
        let system = build_system_cpu(layout, &geometry, features, 0.0);
        system.residuals.iter().copied().collect()
    }

    #[test]
    fn test_perspective_divide_jacobian() {
        let clip = Vector4::new(2.0, -1.0, 0.5, 4.0);
        let j = perspective_divide_jacobian(&clip);

        assert_relative_eq!(j[(0, 0)], 0.25);
        assert_relative_eq!(j[(0, 1)], 0.0);
        assert_relative_eq!(j[(0, 2)], -2.0 / 16.0);
        assert_relative_eq!(j[(1, 1)], 0.25);
        assert_relative_eq!(j[(1, 2)], 1.0 / 16.0);
    }

    #[test]
    fn test_pose_jacobian_translation_block_is_identity() {
        let derivatives = [Matrix3::zeros(); 3];
        let j = pose_jacobian(&derivatives, &Vector3::new(1.0, 2.0, 3.0));

        assert_eq!(j.fixed_view::<3, 3>(0, 3).into_owned(), Matrix3::identity());
        assert_eq!(j.fixed_view::<3, 3>(0, 0).into_owned(), Matrix3::zeros());
    }

    #[test]
    fn test_system_dimensions() {
        let face = SyntheticFace::new(40, 5, 3, 1.0, 11);
        let projection = make_projection();
        let features = render_observations(&face, &projection, &[0, 5, 9, 21]);
        let geometry = FrameGeometry::capture(&face, &projection);

        for n in 1..=features.len() {
            let layout = SystemLayout::new(n, 5, 3);
            let system = build_system_cpu(layout, &geometry, &features[..n], 1e-3);
            assert_eq!(system.residuals.len(), 2 * n + 5 + 3);
            assert_eq!(system.jacobian.ncols(), 7 + 5 + 3);
            assert_eq!(system.jacobian.nrows(), 2 * n + 5 + 3);
        }
    }

    #[test]
    fn test_exact_observations_give_zero_residual() {
        let face = SyntheticFace::new(40, 4, 2, 1.0, 3);
        let projection = make_projection();
        let features = render_observations(&face, &projection, &[1, 2, 3, 30]);

        let residuals = geometry_residuals(&face, &projection, &features);

        for r in residuals {
            assert_relative_eq!(r, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_regularizer_rows() {
        let mut face = SyntheticFace::new(20, 2, 2, 1.0, 5);
        face.set_shape_coefficients(&[0.5, -1.0]);
        face.set_expression_coefficients(&[0.25, 0.75]);
        let projection = make_projection();
        let features = render_observations(&face, &projection, &[0]);
        let geometry = FrameGeometry::capture(&face, &projection);
        let layout = SystemLayout::new(1, 2, 2);

        let system = build_system_cpu(layout, &geometry, &features, 1e-2);

        let expected = [0.5, -1.0, 0.25, 0.75];
        for (j, &coeff) in expected.iter().enumerate() {
            let row = 2 + j;
            assert_relative_eq!(system.jacobian[(row, 7 + j)], 0.1, epsilon = 1e-6);
            assert_relative_eq!(system.residuals[row], 0.1 * coeff, epsilon = 1e-6);
            // Exactly one non-zero per regularizer row
            let nonzeros = system.jacobian.row(row).iter().filter(|v| **v != 0.0).count();
            assert_eq!(nonzeros, 1);
        }
    }

    #[test]
    fn test_jacobian_matches_finite_differences() {
        let mut face = SyntheticFace::new(30, 3, 2, 1.0, 17);
        face.set_rotation(Vector3::new(0.1, -0.2, 0.05));
        face.set_translation(Vector3::new(0.05, -0.1, -2.5));
        face.set_shape_coefficients(&[0.2, -0.1, 0.3]);
        face.set_expression_coefficients(&[0.4, 0.6]);
        face.recompute_geometry().unwrap();

        let projection = make_projection();
        let features = render_observations(&face, &projection, &[2, 7, 13, 29]);
        let layout = SystemLayout::new(features.len(), 3, 2);
        let geometry = FrameGeometry::capture(&face, &projection);
        let analytic = build_system_cpu(layout, &geometry, &features, 0.0);

        let h = 1e-3f32;
        for col in 0..layout.num_unknowns() {
            let mut plus_face = face.clone();
            let mut minus_face = face.clone();
            let mut plus_proj = projection;
            let mut minus_proj = projection;
            match col {
                0 => {
                    plus_proj[(0, 0)] += h;
                    minus_proj[(0, 0)] -= h;
                }
                1..=6 => {
                    plus_face.perturb_pose(col - 1, h);
                    minus_face.perturb_pose(col - 1, -h);
                }
                _ => {
                    plus_face.perturb_coefficient(col - 7, h);
                    minus_face.perturb_coefficient(col - 7, -h);
                }
            }
            plus_face.recompute_geometry().unwrap();
            minus_face.recompute_geometry().unwrap();

            let plus = geometry_residuals(&plus_face, &plus_proj, &features);
            let minus = geometry_residuals(&minus_face, &minus_proj, &features);

            for row in 0..layout.num_feature_rows() {
                let numeric = (plus[row] - minus[row]) / (2.0 * h);
                assert_relative_eq!(
                    analytic.jacobian[(row, col)],
                    numeric,
                    epsilon = 2e-3,
                    max_relative = 2e-2
                );
            }
        }
    }
}
