use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// Reconstruction term used for grayscale (binary) views.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossFn {
    Bce,
    L1,
    L2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PointDistribution {
    Uniform,
    Normal,
}

#[derive(Clone, Debug, Parser, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TrainConfig {
    /// Total number of iterations to train for.
    #[arg(long, help_heading = "Training options", default_value = "30000")]
    pub iterations: u32,

    /// Start learning rate of the positions, relative to the scene extent.
    #[arg(long, help_heading = "Training options", default_value = "0.00016")]
    pub position_lr_init: f64,

    /// Final learning rate of the positions, relative to the scene extent.
    #[arg(long, help_heading = "Training options", default_value = "0.0000016")]
    pub position_lr_final: f64,

    #[arg(long, help_heading = "Training options", default_value = "0.01")]
    pub position_lr_delay_mult: f64,

    #[arg(long, help_heading = "Training options", default_value = "0")]
    pub position_lr_delay_steps: u32,

    /// Steps over which the position learning rate decays.
    #[arg(long, help_heading = "Training options", default_value = "30000")]
    pub position_lr_max_steps: u32,

    /// Learning rate of the base colour. Higher SH bands use a twentieth of it.
    #[arg(long, help_heading = "Training options", default_value = "0.0025")]
    pub feature_lr: f64,

    #[arg(long, help_heading = "Training options", default_value = "0.05")]
    pub opacity_lr: f64,

    #[arg(long, help_heading = "Training options", default_value = "0.005")]
    pub scaling_lr: f64,

    #[arg(long, help_heading = "Training options", default_value = "0.001")]
    pub rotation_lr: f64,

    /// Weight of the SSIM term in the colour loss.
    #[arg(long, help_heading = "Training options", default_value = "0.2")]
    pub lambda_dssim: f32,

    /// Reconstruction loss for grayscale views.
    #[arg(long, help_heading = "Training options", value_enum, default_value = "bce")]
    pub loss_fn: LossFn,

    /// Colour views drawn before this iteration are skipped.
    #[arg(long, help_heading = "Training options", default_value = "55000")]
    pub color_warmup_iter: u32,

    /// Colour views put back into the pool per refill.
    #[arg(long, help_heading = "Training options", default_value = "100")]
    pub color_requeue_cap: u32,

    /// Grayscale views get the pose perturbation loss after this iteration.
    #[arg(long, help_heading = "Training options", default_value = "15000")]
    pub perturb_start_iter: u32,

    /// Number of perturbed renders averaged per iteration.
    #[arg(long, help_heading = "Training options", default_value = "3")]
    pub perturb_trials: u32,

    /// Spread of the camera translation offsets. Used as the standard deviation.
    #[arg(long, help_heading = "Training options", default_value = "0.0005")]
    pub perturb_variance: f32,

    /// Raise the active SH degree every this many iterations.
    #[arg(long, help_heading = "Training options", default_value = "1000")]
    pub sh_increase_every: u32,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self::parse_from([""])
    }
}

#[derive(Clone, Debug, Parser, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DensifyConfig {
    #[arg(long, help_heading = "Refine options", default_value = "500")]
    pub densify_from_iter: u32,

    /// Densification and its bookkeeping stop at this iteration.
    #[arg(long, help_heading = "Refine options", default_value = "15000")]
    pub densify_until_iter: u32,

    #[arg(long, help_heading = "Refine options", default_value = "100")]
    pub densification_interval: u32,

    /// Mean screen-space gradient above which points are cloned or split.
    #[arg(long, help_heading = "Refine options", default_value = "0.0002")]
    pub densify_grad_threshold: f32,

    /// Points with a lower opacity are pruned.
    #[arg(long, help_heading = "Refine options", default_value = "0.005")]
    pub densify_prune_threshold: f32,

    /// Fraction of the scene extent separating small (cloned) from large (split) points.
    #[arg(long, help_heading = "Refine options", default_value = "0.01")]
    pub percent_dense: f32,

    /// Scale the densification gradient by the distance to the scene centre.
    #[arg(long, help_heading = "Refine options", default_value = "false")]
    pub densify_with_depth: bool,

    /// Points whose largest axis is below this fraction of the extent are pruned.
    #[arg(long, help_heading = "Refine options", default_value = "0.0")]
    pub prune_range_min: f32,

    /// Points whose largest axis is above this fraction of the extent are pruned.
    #[arg(long, help_heading = "Refine options", default_value = "1000.0")]
    pub prune_range_max: f32,

    /// Iteration at which new points are injected into the scene.
    #[arg(long, help_heading = "Refine options")]
    pub pts_iter: Option<u32>,

    /// Point spacing used to derive the number of new points from the scene volume.
    /// Zero or less uses `pts-n-pts` instead.
    #[arg(long, help_heading = "Refine options", default_value = "0.0")]
    pub pts_rate: f32,

    #[arg(long, help_heading = "Refine options", default_value = "10000")]
    pub pts_n_pts: usize,

    #[arg(long, help_heading = "Refine options", value_enum, default_value = "uniform")]
    pub pts_dist: PointDistribution,

    /// Number of neighbours new points interpolate their attributes from.
    #[arg(long, help_heading = "Refine options", default_value = "3")]
    pub pts_n_intpl: usize,

    /// How far past the initial bounds new points may be placed.
    #[arg(long, help_heading = "Refine options", default_value = "1.0")]
    pub pts_add_bound: f32,
}

impl Default for DensifyConfig {
    fn default() -> Self {
        Self::parse_from([""])
    }
}

#[derive(Clone, Debug, Parser, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RenderConfig {
    /// Apply the point-spread correction to the photon image.
    #[arg(
        long,
        help_heading = "Render options",
        default_value = "true",
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    pub deblur: bool,

    #[arg(long, help_heading = "Render options", default_value = "false")]
    pub use_pos: bool,

    /// Width of the point-spread function in pixels.
    #[arg(long, help_heading = "Render options", default_value = "0.0")]
    pub lambda_s: f32,

    /// Photon gain.
    #[arg(long, help_heading = "Render options", default_value = "4.0")]
    pub lambda_p: f32,

    #[arg(long, help_heading = "Render options", default_value = "0.999")]
    pub max_clamp: f32,

    /// Turn on renderer debugging from this iteration. Negative never does.
    #[arg(long, help_heading = "Render options", default_value = "-1", allow_negative_numbers = true)]
    pub debug_from: i64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self::parse_from([""])
    }
}

#[derive(Clone, Debug, Parser, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProcessConfig {
    /// Random seed.
    #[arg(long, help_heading = "Process options", default_value = "42")]
    pub seed: u64,

    /// Output folder. Defaults to `./outputs/<expname>`.
    #[arg(long, help_heading = "Process options")]
    pub model_path: Option<PathBuf>,

    /// Name of the output folder when no model path is given.
    #[arg(long, help_heading = "Process options")]
    pub expname: Option<String>,

    /// Iterations at which the test report runs.
    #[arg(
        long,
        help_heading = "Process options",
        value_delimiter = ',',
        default_value = "10000,20000,50000"
    )]
    pub test_iterations: Vec<u32>,

    /// Iterations at which the scene is saved. The final iteration is always saved.
    #[arg(
        long,
        help_heading = "Process options",
        value_delimiter = ',',
        default_value = "10000,20000,50000"
    )]
    pub save_iterations: Vec<u32>,

    #[arg(
        long,
        help_heading = "Process options",
        value_delimiter = ',',
        default_value = "20000"
    )]
    pub checkpoint_iterations: Vec<u32>,

    /// Resume from this checkpoint.
    #[arg(long, help_heading = "Process options")]
    pub start_checkpoint: Option<PathBuf>,

    /// VGG LPIPS weights (`.mpk.gz`). Evaluation reports LPIPS only when given.
    #[arg(long, help_heading = "Process options")]
    pub lpips_weights: Option<PathBuf>,

    /// Only log warnings and errors.
    #[arg(long, help_heading = "Process options", default_value = "false")]
    pub quiet: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self::parse_from([""])
    }
}

#[derive(Clone, Debug, Parser, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ViewerConfig {
    /// Listen for a network viewer while training.
    #[arg(long, help_heading = "Viewer options", default_value = "false")]
    pub viewer: bool,

    #[arg(long, help_heading = "Viewer options", default_value = "127.0.0.1")]
    pub ip: String,

    #[arg(long, help_heading = "Viewer options", default_value = "6009")]
    pub port: u16,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self::parse_from([""])
    }
}
