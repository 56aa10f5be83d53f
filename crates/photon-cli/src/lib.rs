pub mod args_file;
pub mod telemetry;
pub mod ui;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use photon_dataset::config::{LoadDatasetConfig, ModelConfig};
use photon_train::config::{DensifyConfig, ProcessConfig, RenderConfig, TrainConfig, ViewerConfig};
use photon_train::train::LoopConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::telemetry::RerunConfig;

/// Length of the random output folder name.
const RUN_ID_LEN: usize = 10;

/// Every option of a run, grouped by concern.
#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunConfig {
    #[clap(flatten)]
    #[serde(flatten)]
    pub train: TrainConfig,
    #[clap(flatten)]
    #[serde(flatten)]
    pub densify: DensifyConfig,
    #[clap(flatten)]
    #[serde(flatten)]
    pub render: RenderConfig,
    #[clap(flatten)]
    #[serde(flatten)]
    pub model: ModelConfig,
    #[clap(flatten)]
    #[serde(flatten)]
    pub load: LoadDatasetConfig,
    #[clap(flatten)]
    #[serde(flatten)]
    pub process: ProcessConfig,
    #[clap(flatten)]
    #[serde(flatten)]
    pub viewer: ViewerConfig,
    #[clap(flatten)]
    #[serde(flatten)]
    pub rerun: RerunConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::parse_from([""])
    }
}

impl RunConfig {
    pub fn loop_config(&self, model_path: PathBuf, source: &Path) -> LoopConfig {
        LoopConfig {
            train: self.train.clone(),
            densify: self.densify.clone(),
            render: self.render.clone(),
            process: self.process.clone(),
            viewer: self.viewer.clone(),
            model: self.model.clone(),
            background: self.load.background(),
            model_path,
            source_path: source.display().to_string(),
        }
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    arg_required_else_help = true,
    about = "Photon - gaussian splatting from single-photon captures"
)]
pub struct Cli {
    /// Dataset folder with `transforms_train.json`.
    #[arg(value_name = "SOURCE")]
    pub source: PathBuf,

    /// Arguments file to start from. Options on the command line take precedence.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[clap(flatten)]
    pub run: RunConfig,
}

impl Cli {
    /// The options of this run with the `--config` file merged in.
    pub fn resolve(&self) -> anyhow::Result<RunConfig> {
        match &self.config {
            Some(path) => args_file::merge_configs(&args_file::load_args_file(path)?, &self.run),
            None => Ok(self.run.clone()),
        }
    }
}

fn random_run_id(rng: &mut impl Rng) -> String {
    (0..RUN_ID_LEN)
        .map(|_| format!("{:x}", rng.random_range(0..16u32)))
        .collect()
}

/// `--model-path`, else `./outputs/<expname>`, else `./outputs/<random id>`.
pub fn output_folder(process: &ProcessConfig, rng: &mut impl Rng) -> PathBuf {
    if let Some(path) = &process.model_path {
        return path.clone();
    }
    let name = process
        .expname
        .clone()
        .unwrap_or_else(|| random_run_id(rng));
    Path::new("./outputs").join(name)
}

/// Creates the output folder with its `TEST` and `TRAIN` render folders and records the
/// options of the run in `cfg_args`.
pub fn prepare_output_folder(model_path: &Path, config: &RunConfig) -> anyhow::Result<()> {
    for sub in ["TEST", "TRAIN"] {
        let dir = model_path.join(sub);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let cfg_path = model_path.join("cfg_args");
    std::fs::write(&cfg_path, args_file::config_to_args(config).join("\n"))
        .with_context(|| format!("Failed to write {}", cfg_path.display()))
}
