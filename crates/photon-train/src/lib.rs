#![recursion_limit = "256"]

use std::path::PathBuf;

pub mod adam;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod density_control;
pub mod eval;
pub mod loss;
pub mod lpips;
pub mod lr_schedule;
pub mod msg;
pub mod perturb;
pub mod splat_init;
pub mod ssim;
pub mod train;
pub mod view_sampler;
pub mod viewer;

mod quat_vec;

#[cfg(test)]
mod integration_tests;

use view_sampler::ViewPoolError;

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error(
        "Visibility does not match the scene: {points} points, mask of {mask}, radii of {radii}, {visible} visible"
    )]
    VisibilityShape {
        points: usize,
        mask: usize,
        radii: usize,
        visible: usize,
    },
    #[error("Failed to {action} checkpoint {path:?}: {reason}")]
    Checkpoint {
        action: &'static str,
        path: PathBuf,
        reason: String,
    },
    #[error("Failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write image {path:?}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("Failed to load LPIPS weights {path:?}: {reason}")]
    LpipsWeights { path: PathBuf, reason: String },
    #[error(transparent)]
    ViewPool(#[from] ViewPoolError),
    #[error("Invalid perturbation spread: {0}")]
    Perturbation(#[from] rand_distr::NormalError),
}
