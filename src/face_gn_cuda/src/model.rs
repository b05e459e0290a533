//! Face model collaborator and sparse feature correspondences.
//!
//! The solver does not own the face geometry. It drives any type implementing
//! [`FaceModel`]: the model regenerates its vertices from the current
//! coefficients, reports its pose and rotation derivatives, and exposes its
//! coefficients for in-place updates.
//!
//! Basis matrices are `(3 · vertex_count) × num_coefficients`; row `3·v + a`
//! holds axis `a` of vertex `v`. Only the leading `k`/`m` columns configured in
//! [`SolverConfig`](crate::SolverConfig) take part in the fit.

use anyhow::{ensure, Result};
use nalgebra::{DMatrix, Matrix3, Matrix4, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Mutable view of the optimizable face state.
///
/// Returned by [`FaceModel::state_mut`] so that implementors can hand out
/// disjoint borrows of their fields in one call.
pub struct FaceStateMut<'a> {
    /// Euler rotation coefficients (rx, ry, rz).
    pub rotation: &'a mut Vector3<f32>,
    /// Translation coefficients (tx, ty, tz).
    pub translation: &'a mut Vector3<f32>,
    /// Shape coefficients (unconstrained).
    pub shape: &'a mut [f32],
    /// Expression coefficients, kept in `[0, 1]`.
    pub expression: &'a mut [f32],
    /// Per-coefficient shape standard deviation.
    pub shape_std_dev: &'a [f32],
    /// Per-coefficient expression standard deviation.
    pub expression_std_dev: &'a [f32],
}

/// Parametric face model driven by the Gauss-Newton solver.
pub trait FaceModel {
    /// Number of mesh vertices.
    fn vertex_count(&self) -> usize;

    /// Regenerate vertex positions for the current coefficients.
    fn recompute_geometry(&mut self) -> Result<()>;

    /// Current local-space vertex positions, indexed by vertex id.
    fn vertices(&self) -> &[Vector3<f32>];

    /// Model (pose) matrix built from rotation and translation coefficients.
    fn model_matrix(&self) -> Matrix4<f32>;

    /// `∂R/∂rx`, `∂R/∂ry`, `∂R/∂rz` for the current rotation coefficients.
    fn rotation_derivatives(&self) -> [Matrix3<f32>; 3];

    /// Shape basis scaled by the inverse standard deviation: column `j` is
    /// `∂v/∂shape_j / shape_std_dev[j]`.
    ///
    /// The solver uses these columns as Jacobian blocks and applies
    /// `shape_j -= x_j / shape_std_dev[j]`, so the step is only a Gauss-Newton
    /// step under this scaling. A model that deforms with
    /// `v = mean + Σ σ_j · B_j · c_j` returns the unit basis `B` here.
    fn shape_basis(&self) -> &DMatrix<f32>;

    /// Expression basis with the same scaling as [`Self::shape_basis`].
    fn expression_basis(&self) -> &DMatrix<f32>;

    fn shape_coefficients(&self) -> &[f32];

    fn expression_coefficients(&self) -> &[f32];

    fn shape_std_dev(&self) -> &[f32];

    fn expression_std_dev(&self) -> &[f32];

    /// Borrow the optimizable state for an update.
    fn state_mut(&mut self) -> FaceStateMut<'_>;
}

/// A tracked landmark: model vertex id and its observed 2D screen position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureCorrespondence {
    pub vertex_id: u32,
    pub observed: Vector2<f32>,
}

impl FeatureCorrespondence {
    pub fn new(vertex_id: u32, observed: Vector2<f32>) -> Self {
        Self {
            vertex_id,
            observed,
        }
    }
}

/// Session-fixed list of landmark vertex ids.
///
/// Landmark detectors report points in a fixed order; the prior maps the i-th
/// detected point to the i-th vertex id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturePrior {
    vertex_ids: Vec<u32>,
}

impl FeaturePrior {
    pub fn new(vertex_ids: Vec<u32>) -> Self {
        Self { vertex_ids }
    }

    pub fn vertex_ids(&self) -> &[u32] {
        &self.vertex_ids
    }

    pub fn len(&self) -> usize {
        self.vertex_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertex_ids.is_empty()
    }

    /// Pair detected points with the prior's vertex ids.
    ///
    /// An empty observation list is valid (nothing is tracked this frame) and
    /// yields an empty correspondence set.
    pub fn pair(&self, observed: &[Vector2<f32>]) -> Result<Vec<FeatureCorrespondence>> {
        if observed.is_empty() {
            return Ok(Vec::new());
        }
        ensure!(
            observed.len() == self.vertex_ids.len(),
            "Observation count {} does not match feature prior size {}",
            observed.len(),
            self.vertex_ids.len()
        );

        Ok(self
            .vertex_ids
            .iter()
            .zip(observed)
            .map(|(&vertex_id, &point)| FeatureCorrespondence::new(vertex_id, point))
            .collect())
    }
}
