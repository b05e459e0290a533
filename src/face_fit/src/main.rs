//! Fit a synthetic face scene with the Gauss-Newton solver.
//!
//! Builds a ground-truth face, renders its landmarks, perturbs the initial
//! guess and runs `face_gn_cuda::GaussNewtonSolver` on it, logging the
//! reprojection loss of every iteration.

mod params;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use face_gn_cuda::test_utils::{landmark_ids, make_projection, render_observations, SyntheticFace};
use face_gn_cuda::{
    FaceModel, FeatureCorrespondence, FeaturePrior, GaussNewtonSolver, LinearSolverKind,
    SystemBuilderKind,
};
use nalgebra::{Matrix4, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;
use tracing::{info, warn, Level};

use params::FitParams;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SolverArg {
    Pcg,
    Cg,
    Direct,
}

impl From<SolverArg> for LinearSolverKind {
    fn from(arg: SolverArg) -> Self {
        match arg {
            SolverArg::Pcg => LinearSolverKind::Pcg,
            SolverArg::Cg => LinearSolverKind::Cg,
            SolverArg::Direct => LinearSolverKind::DirectInverse,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "face_fit")]
#[command(about = "Gauss-Newton face fitting on a synthetic landmark scene")]
struct Args {
    /// JSON run parameters (solver, scene, perturbation); defaults if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the scene seed
    #[arg(short, long)]
    seed: Option<u64>,

    /// Override the number of Gauss-Newton iterations
    #[arg(short = 'n', long)]
    iterations: Option<usize>,

    /// Override the linear solver
    #[arg(long, value_enum)]
    solver: Option<SolverArg>,

    /// Build the system with the sequential host builder
    #[arg(long)]
    reference: bool,

    /// Run entirely on the host
    #[arg(long)]
    cpu: bool,

    /// Write the solve report as JSON
    #[arg(short, long)]
    report: Option<PathBuf>,
}

fn init_logger() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .with_target(true)
        .init();
}

fn load_params(args: &Args) -> Result<FitParams> {
    let mut params = match &args.config {
        Some(path) => FitParams::load(path)?,
        None => FitParams::default(),
    };

    if let Some(seed) = args.seed {
        params.scene.seed = seed;
    }
    if let Some(iterations) = args.iterations {
        params.solver.num_gn_iterations = iterations;
    }
    if let Some(solver) = args.solver {
        params.solver.linear_solver = solver.into();
    }
    if args.reference {
        params.solver.builder = SystemBuilderKind::Reference;
    }
    if args.cpu {
        params.solver.use_gpu = false;
    }

    params.validate()?;
    Ok(params)
}

/// Ground-truth face with random coefficients at the configured pose.
fn build_truth(params: &FitParams, rng: &mut StdRng) -> Result<SyntheticFace> {
    let scene = &params.scene;
    let num_shape = params.solver.num_shape_coefficients;
    let num_expression = params.solver.num_expression_coefficients;

    let mut face = SyntheticFace::new(
        scene.vertex_count,
        num_shape,
        num_expression,
        scene.coefficient_std_dev,
        scene.seed,
    );

    let shape_dist = Normal::new(0.0f32, 0.5)?;
    let shape: Vec<f32> = (0..num_shape).map(|_| rng.sample(shape_dist)).collect();
    let expression: Vec<f32> = (0..num_expression)
        .map(|_| rng.gen_range(0.1f32..0.9))
        .collect();

    face.set_shape_coefficients(&shape);
    face.set_expression_coefficients(&expression);
    face.set_rotation(Vector3::from(scene.rotation));
    face.set_translation(Vector3::from(scene.translation));
    Ok(face)
}

/// Perturb a copy of the truth into the initial guess.
fn build_initial_guess(
    params: &FitParams,
    truth: &SyntheticFace,
    projection: &mut Matrix4<f32>,
    rng: &mut StdRng,
) -> Result<SyntheticFace> {
    let perturbation = &params.perturbation;
    let mut face = truth.clone();

    let rotation_noise = Normal::new(0.0f32, perturbation.rotation_sigma)?;
    let translation_noise = Normal::new(0.0f32, perturbation.translation_sigma)?;
    for axis in 0..3 {
        face.perturb_pose(axis, rng.sample(rotation_noise));
        face.perturb_pose(3 + axis, rng.sample(translation_noise));
    }

    let focal_noise = Normal::new(0.0f32, perturbation.focal_sigma)?;
    projection[(0, 0)] += rng.sample(focal_noise);

    if perturbation.reset_coefficients {
        face.set_shape_coefficients(&vec![0.0; truth.shape_coefficients().len()]);
        face.set_expression_coefficients(&vec![0.0; truth.expression_coefficients().len()]);
    }
    Ok(face)
}

fn reprojection_loss(
    face: &SyntheticFace,
    projection: &Matrix4<f32>,
    features: &[FeatureCorrespondence],
) -> f64 {
    let ids: Vec<u32> = features.iter().map(|f| f.vertex_id).collect();
    render_observations(face, projection, &ids)
        .iter()
        .zip(features)
        .map(|(predicted, observed)| (predicted.observed - observed.observed).norm_squared() as f64)
        .sum()
}

fn main() -> Result<()> {
    init_logger();
    let args = Args::parse();
    let params = load_params(&args)?;
    let mut rng = StdRng::seed_from_u64(params.scene.seed);

    let truth = build_truth(&params, &mut rng)?;
    let true_projection = make_projection();

    let prior = FeaturePrior::new(landmark_ids(
        params.scene.num_landmarks,
        params.scene.vertex_count,
    ));
    let observed: Vec<Vector2<f32>> = render_observations(&truth, &true_projection, prior.vertex_ids())
        .into_iter()
        .map(|feature| feature.observed)
        .collect();
    let features = prior.pair(&observed)?;

    let mut projection = true_projection;
    let mut face = build_initial_guess(&params, &truth, &mut projection, &mut rng)?;
    info!(
        "Scene: {} vertices, {} landmarks, {} shape + {} expression coefficients",
        params.scene.vertex_count,
        features.len(),
        params.solver.num_shape_coefficients,
        params.solver.num_expression_coefficients
    );

    let mut solver = GaussNewtonSolver::new(params.solver.clone())?;
    info!("Solver backend: {:?}", solver.backend());

    let start = Instant::now();
    let report = solver.solve(&features, &mut face, &mut projection)?;
    let elapsed = start.elapsed();

    if report.skipped {
        warn!("No landmarks to fit");
        return Ok(());
    }

    for (i, (loss, stats)) in report
        .reprojection_losses
        .iter()
        .zip(&report.linear_stats)
        .enumerate()
    {
        info!(
            "iter {i}: reprojection loss {loss:.6e}, linear iterations {}, zTr {:.3e}",
            stats.iterations, stats.final_zr
        );
    }
    for record in &report.debug {
        info!("{}", record.to_log_line());
    }

    face.recompute_geometry()?;
    let final_loss = reprojection_loss(&face, &projection, &features);
    info!(
        "Fitted in {:.2} ms: loss {:.6e} -> {:.6e}",
        elapsed.as_secs_f64() * 1000.0,
        report.initial_reprojection_loss().unwrap_or_default(),
        final_loss
    );
    info!(
        "Pose error: rotation {:.3e}, translation {:.3e}, focal {:.3e}",
        (face.rotation() - truth.rotation()).norm(),
        (face.translation() - truth.translation()).norm(),
        (projection[(0, 0)] - true_projection[(0, 0)]).abs()
    );
    if let Some(timing) = &report.timing {
        info!("Timing: {timing:?}");
    }

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    Ok(())
}
