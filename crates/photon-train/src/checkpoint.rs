use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder};
use burn::tensor::backend::AutodiffBackend;
use photon_render::gaussian_scene::{GaussianScene, GaussianSceneRecord};
use tracing::trace_span;

use crate::TrainError;
use crate::adam::{AdamScaledConfig, SceneOptimizer, SceneOptimizerRecord};

#[derive(Record)]
pub struct CheckpointRecord<B: AutodiffBackend> {
    pub iteration: u32,
    pub active_sh_degree: u32,
    pub scene: GaussianSceneRecord<B>,
    pub optimizer: SceneOptimizerRecord<B>,
}

/// Everything needed to resume training.
pub struct Checkpoint<AB: AutodiffBackend> {
    pub iteration: u32,
    pub active_sh_degree: u32,
    pub scene: GaussianScene<AB>,
    pub optimizer: SceneOptimizer<AB>,
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

pub fn checkpoint_path(model_path: &Path, iteration: u32) -> PathBuf {
    model_path.join(format!("chkpnt{iteration}.mpk"))
}

/// Writes `<model_path>/chkpnt<iteration>.mpk`.
pub fn save_checkpoint<AB: AutodiffBackend>(
    model_path: &Path,
    iteration: u32,
    active_sh_degree: u32,
    scene: &GaussianScene<AB>,
    optimizer: &SceneOptimizer<AB>,
) -> Result<PathBuf, TrainError> {
    let _span = trace_span!("save_checkpoint").entered();

    let path = checkpoint_path(model_path, iteration);
    let record = CheckpointRecord {
        iteration,
        active_sh_degree,
        scene: scene.clone().into_record(),
        optimizer: optimizer.to_record(),
    };
    Recorder::<AB>::record(&recorder(), record, path.clone()).map_err(|e| TrainError::Checkpoint {
        action: "save",
        path: path.clone(),
        reason: format!("{e:?}"),
    })?;
    Ok(path)
}

/// Restores a checkpoint. Scene parameters keep their stored ids so the optimizer
/// state lines up with them again.
pub fn load_checkpoint<AB: AutodiffBackend>(
    path: &Path,
    adam_config: AdamScaledConfig,
    device: &AB::Device,
) -> Result<Checkpoint<AB>, TrainError> {
    let _span = trace_span!("load_checkpoint").entered();

    let record: CheckpointRecord<AB> = recorder()
        .load(path.to_path_buf(), device)
        .map_err(|e| TrainError::Checkpoint {
            action: "load",
            path: path.to_path_buf(),
            reason: format!("{e:?}"),
        })?;

    let scene = GaussianScene {
        means: record.scene.means,
        rotations: record.scene.rotations,
        log_scales: record.scene.log_scales,
        sh_coeffs: record.scene.sh_coeffs,
        raw_opacities: record.scene.raw_opacities,
    };
    let optimizer = SceneOptimizer::from_record(record.optimizer, adam_config);
    let rows = optimizer.moment_rows(scene.means.id);
    if let Some(rows) = rows.filter(|&rows| rows != scene.num_points()) {
        return Err(TrainError::Checkpoint {
            action: "load",
            path: path.to_path_buf(),
            reason: format!(
                "optimizer state has {rows} points, scene has {}",
                scene.num_points()
            ),
        });
    }

    Ok(Checkpoint {
        iteration: record.iteration,
        active_sh_degree: record.active_sh_degree,
        scene,
        optimizer,
    })
}
