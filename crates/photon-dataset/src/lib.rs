pub mod config;
mod formats;
pub mod point_cloud;
pub mod scene;
pub mod splat_export;

use std::path::PathBuf;

pub use formats::load_dataset;

use image::DynamicImage;
use point_cloud::PointCloud;
use scene::{Scene, View};

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path:?}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to decode image {path:?}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("Failed to parse point cloud: {0}")]
    Ply(#[from] serde_ply::DeserializeError),
    #[error("No transforms_train.json found in {0:?}")]
    UnknownFormat(PathBuf),
    #[error("Dataset at {0:?} has no training views")]
    NoViews(PathBuf),
}

#[derive(Clone, Debug)]
pub struct Dataset {
    pub train: Scene,
    pub eval: Option<Scene>,
    /// Initial points shipped with the dataset, if any.
    pub init: Option<PointCloud>,
}

impl Dataset {
    pub fn from_views(train: Vec<View>, eval: Vec<View>, init: Option<PointCloud>) -> Self {
        Self {
            train: Scene::new(train),
            eval: if eval.is_empty() {
                None
            } else {
                Some(Scene::new(eval))
            },
            init,
        }
    }
}

pub(crate) fn clamp_img_to_max_size(image: DynamicImage, max_size: u32) -> DynamicImage {
    if image.width() <= max_size && image.height() <= max_size {
        return image;
    }

    let aspect_ratio = image.width() as f32 / image.height() as f32;
    let (new_width, new_height) = if image.width() > image.height() {
        (max_size, (max_size as f32 / aspect_ratio) as u32)
    } else {
        ((max_size as f32 * aspect_ratio) as u32, max_size)
    };
    image.resize_exact(new_width, new_height, image::imageops::FilterType::Lanczos3)
}
