//! Parameter update from a linear solution.
//!
//! Every unknown is updated by subtraction (`θ -= x`). Shape and expression
//! steps are divided by the coefficient's standard deviation, and expression
//! coefficients are clamped to `[0, 1]`.

use anyhow::{bail, ensure, Result};
use nalgebra::{DVector, Matrix4};

use crate::derivatives::{SystemLayout, FOCAL_COL, ROTATION_COL, TRANSLATION_COL};
use crate::model::FaceModel;

/// Apply `solution` to the projection focal entry and the face state.
///
/// Rejects a non-finite solution before anything is written. Returns the
/// number of expression coefficients that were clamped.
pub fn apply_update<M: FaceModel + ?Sized>(
    solution: &DVector<f32>,
    layout: &SystemLayout,
    face: &mut M,
    projection: &mut Matrix4<f32>,
) -> Result<usize> {
    ensure!(
        solution.len() == layout.num_unknowns(),
        "Solution has {} entries, expected {}",
        solution.len(),
        layout.num_unknowns()
    );
    if let Some(index) = solution.iter().position(|v| !v.is_finite()) {
        bail!("Non-finite update at unknown {index}");
    }

    projection[(0, 0)] -= solution[FOCAL_COL];

    let state = face.state_mut();
    for axis in 0..3 {
        state.rotation[axis] -= solution[ROTATION_COL + axis];
        state.translation[axis] -= solution[TRANSLATION_COL + axis];
    }

    let shape_step = solution.rows(layout.shape_col(), layout.num_shape);
    for ((coeff, step), sigma) in state
        .shape
        .iter_mut()
        .zip(shape_step.iter())
        .zip(state.shape_std_dev)
    {
        *coeff -= step / sigma;
    }

    let mut clamped = 0;
    let expression_step = solution.rows(layout.expression_col(), layout.num_expression);
    for ((coeff, step), sigma) in state
        .expression
        .iter_mut()
        .zip(expression_step.iter())
        .zip(state.expression_std_dev)
    {
        let value = *coeff - step / sigma;
        let bounded = value.clamp(0.0, 1.0);
        if bounded != value {
            clamped += 1;
        }
        *coeff = bounded;
    }

    Ok(clamped)
}
