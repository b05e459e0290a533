//! Type definitions for the Gauss-Newton system.

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix3, Matrix3x6, Matrix4, Vector3};

use crate::model::FaceModel;

/// Number of pose unknowns: focal (1) + rotation (3) + translation (3).
pub const POSE_UNKNOWNS: usize = 7;

/// Column of the focal unknown.
pub const FOCAL_COL: usize = 0;

/// First column of the rotation unknowns (rx, ry, rz).
pub const ROTATION_COL: usize = 1;

/// First column of the translation unknowns (tx, ty, tz).
pub const TRANSLATION_COL: usize = 4;

/// Perspective-divide Jacobian `∂(x/w, y/w)/∂(x, y, w)`.
pub type ProjectionJacobian = Matrix2x3<f32>;

/// Camera Jacobian `∂(clip x, clip y, clip w)/∂world`.
///
/// Only the focal scale, aspect-scaled focal and depth flip are non-zero.
pub type CameraJacobian = Matrix3<f32>;

/// Pose Jacobian `∂world/∂(rx, ry, rz, tx, ty, tz)`.
pub type PoseJacobian = Matrix3x6<f32>;

/// Intrinsics Jacobian `∂clip/∂focal`.
pub type IntrinsicsJacobian = Vector3<f32>;

/// Dimensions and block offsets of one Gauss-Newton system.
///
/// Unknowns are ordered `[focal, rx, ry, rz, tx, ty, tz, shape.., expression..]`.
/// Residuals are ordered `[x0, y0, .., x(n-1), y(n-1), shape reg.., expression reg..]`.
/// The Jacobian is dense and column-major with leading dimension
/// `num_residuals()`, the layout cuBLAS consumes directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemLayout {
    pub num_features: usize,
    pub num_shape: usize,
    pub num_expression: usize,
}

impl SystemLayout {
    pub fn new(num_features: usize, num_shape: usize, num_expression: usize) -> Self {
        Self {
            num_features,
            num_shape,
            num_expression,
        }
    }

    /// Number of regularized coefficients (`k + m`).
    pub fn num_coefficients(&self) -> usize {
        self.num_shape + self.num_expression
    }

    /// Column count `7 + k + m`.
    pub fn num_unknowns(&self) -> usize {
        POSE_UNKNOWNS + self.num_coefficients()
    }

    /// Row count `2n + k + m`.
    pub fn num_residuals(&self) -> usize {
        2 * self.num_features + self.num_coefficients()
    }

    /// Number of feature rows (`2n`).
    pub fn num_feature_rows(&self) -> usize {
        2 * self.num_features
    }

    pub fn shape_col(&self) -> usize {
        POSE_UNKNOWNS
    }

    pub fn expression_col(&self) -> usize {
        POSE_UNKNOWNS + self.num_shape
    }

    /// First regularization row. Shape rows come first, then expression rows.
    pub fn regularizer_row(&self) -> usize {
        self.num_feature_rows()
    }

    /// Element count of the column-major Jacobian buffer.
    pub fn jacobian_len(&self) -> usize {
        self.num_residuals() * self.num_unknowns()
    }

    /// Flat column-major index of `(row, col)`.
    #[inline]
    pub fn index(&self, row: usize, col: usize) -> usize {
        col * self.num_residuals() + row
    }
}

/// Per-iteration snapshot of everything the builders read.
#[derive(Debug, Clone, Copy)]
pub struct FrameGeometry<'a> {
    /// Local-space vertex positions indexed by vertex id.
    pub vertices: &'a [Vector3<f32>],
    pub model_matrix: Matrix4<f32>,
    pub rotation_derivatives: [Matrix3<f32>; 3],
    pub projection: Matrix4<f32>,
    pub shape_basis: &'a DMatrix<f32>,
    pub expression_basis: &'a DMatrix<f32>,
    pub shape_coefficients: &'a [f32],
    pub expression_coefficients: &'a [f32],
}

impl<'a> FrameGeometry<'a> {
    /// Capture the face's current geometry together with the camera.
    pub fn capture<M: FaceModel + ?Sized>(face: &'a M, projection: &Matrix4<f32>) -> Self {
        Self {
            vertices: face.vertices(),
            model_matrix: face.model_matrix(),
            rotation_derivatives: face.rotation_derivatives(),
            projection: *projection,
            shape_basis: face.shape_basis(),
            expression_basis: face.expression_basis(),
            shape_coefficients: face.shape_coefficients(),
            expression_coefficients: face.expression_coefficients(),
        }
    }
}

/// Host copy of a built system: dense Jacobian and residual vector.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    pub layout: SystemLayout,
    pub jacobian: DMatrix<f32>,
    pub residuals: DVector<f32>,
}

impl LinearSystem {
    /// Zero-filled system for `layout`.
    pub fn zeros(layout: SystemLayout) -> Self {
        Self {
            layout,
            jacobian: DMatrix::zeros(layout.num_residuals(), layout.num_unknowns()),
            residuals: DVector::zeros(layout.num_residuals()),
        }
    }

    /// Wrap column-major buffers read back from the device.
    pub fn from_column_major(layout: SystemLayout, jacobian: &[f32], residuals: &[f32]) -> Self {
        Self {
            layout,
            jacobian: DMatrix::from_column_slice(
                layout.num_residuals(),
                layout.num_unknowns(),
                jacobian,
            ),
            residuals: DVector::from_column_slice(residuals),
        }
    }

    /// Sum of squared feature residuals.
    pub fn reprojection_loss(&self) -> f64 {
        residual_losses(self.residuals.as_slice(), self.layout.num_feature_rows()).0
    }

    /// Sum of squared residuals including regularization rows.
    pub fn total_loss(&self) -> f64 {
        residual_losses(self.residuals.as_slice(), self.layout.num_feature_rows()).1
    }
}

/// `(reprojection, total)` squared losses of a residual vector whose first
/// `num_feature_rows` entries are feature residuals.
pub fn residual_losses(residuals: &[f32], num_feature_rows: usize) -> (f64, f64) {
    let squared = |r: &f32| (*r as f64) * (*r as f64);
    let feature_rows = num_feature_rows.min(residuals.len());
    let reprojection: f64 = residuals[..feature_rows].iter().map(squared).sum();
    let regularization: f64 = residuals[feature_rows..].iter().map(squared).sum();
    (reprojection, reprojection + regularization)
}
