//! NeRF-synthetic style datasets: `transforms_train.json` / `transforms_test.json`
//! next to the image folders.

use std::path::{Path, PathBuf};

use glam::{Mat3, Mat4};
use photon_render::camera::{Camera, focal_to_fov, fov_to_focal};
use rayon::prelude::*;
use serde::Deserialize;

use crate::config::LoadDatasetConfig;
use crate::scene::{View, ViewImage};
use crate::{DatasetError, clamp_img_to_max_size};

#[derive(Deserialize)]
struct Transforms {
    camera_angle_x: f64,
    #[serde(default)]
    camera_angle_y: Option<f64>,
    frames: Vec<Frame>,
}

#[derive(Deserialize)]
struct Frame {
    file_path: String,
    transform_matrix: [[f32; 4]; 4],
}

/// Converts an OpenGL camera-to-world matrix into a camera-to-world rotation and
/// world-to-camera translation with `+y` down and `+z` forward.
pub(crate) fn camera_pose(transform_matrix: [[f32; 4]; 4]) -> (Mat3, glam::Vec3) {
    let mut c2w = Mat4::from_cols_array_2d(&transform_matrix).transpose();
    c2w.y_axis = -c2w.y_axis;
    c2w.z_axis = -c2w.z_axis;

    let w2c = c2w.inverse();
    (Mat3::from_mat4(w2c).transpose(), w2c.w_axis.truncate())
}

fn image_path(root: &Path, file_path: &str) -> PathBuf {
    let path = root.join(file_path);
    if path.extension().is_some() {
        path
    } else {
        path.with_extension("png")
    }
}

fn load_frame(
    root: &Path,
    transforms: &Transforms,
    frame: &Frame,
    config: &LoadDatasetConfig,
) -> Result<View, DatasetError> {
    let path = image_path(root, &frame.file_path);
    let image = image::open(&path).map_err(|source| DatasetError::Image {
        path: path.clone(),
        source,
    })?;
    let image = clamp_img_to_max_size(image, config.resolution);
    let (width, height) = (image.width(), image.height());

    let fov_x = transforms.camera_angle_x;
    let fov_y = transforms
        .camera_angle_y
        .unwrap_or_else(|| focal_to_fov(fov_to_focal(fov_x, width), height));

    let (rotation, translation) = camera_pose(frame.transform_matrix);
    let camera = Camera::new(
        rotation,
        translation,
        fov_x as f32,
        fov_y as f32,
        width,
        height,
    );

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(View {
        name,
        camera,
        image: ViewImage::from_dynamic(image, config.background()),
    })
}

/// Reads one transforms file. Returns `Ok(None)` if it does not exist.
pub(crate) fn read_split(
    root: &Path,
    file_name: &str,
    config: &LoadDatasetConfig,
) -> Result<Option<Vec<View>>, DatasetError> {
    let path = root.join(file_name);
    if !path.exists() {
        return Ok(None);
    }

    let _span = tracing::trace_span!("read_split", file_name).entered();

    let text = std::fs::read_to_string(&path).map_err(|source| DatasetError::Io {
        path: path.clone(),
        source,
    })?;
    let transforms: Transforms =
        serde_json::from_str(&text).map_err(|source| DatasetError::Json {
            path: path.clone(),
            source,
        })?;

    let frames = match config.max_frames {
        Some(max) => &transforms.frames[..max.min(transforms.frames.len())],
        None => &transforms.frames[..],
    };

    log::info!("Loading {} frames from {path:?}", frames.len());

    let views = frames
        .par_iter()
        .map(|frame| load_frame(root, &transforms, frame, config))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(views))
}
