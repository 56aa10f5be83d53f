use std::path::Path;

use crate::config::LoadDatasetConfig;
use crate::point_cloud::PointCloud;
use crate::{Dataset, DatasetError};

pub mod blender;

const INIT_PLY: &str = "points3d.ply";

pub fn load_dataset(root: &Path, config: &LoadDatasetConfig) -> Result<Dataset, DatasetError> {
    let Some(mut train) = blender::read_split(root, "transforms_train.json", config)? else {
        return Err(DatasetError::UnknownFormat(root.to_path_buf()));
    };
    let test = blender::read_split(root, "transforms_test.json", config)?.unwrap_or_default();

    let eval = if config.eval {
        test
    } else {
        train.extend(test);
        vec![]
    };

    if train.is_empty() {
        return Err(DatasetError::NoViews(root.to_path_buf()));
    }

    let init_path = root.join(INIT_PLY);
    let init = if init_path.exists() {
        Some(PointCloud::load(&init_path)?)
    } else {
        None
    };

    Ok(Dataset::from_views(train, eval, init))
}
