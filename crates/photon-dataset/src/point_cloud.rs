use std::io::BufReader;
use std::path::Path;

use glam::Vec3;
use serde::Deserialize;

use crate::DatasetError;

fn mid_gray() -> u8 {
    128
}

#[derive(Deserialize)]
struct PlyPoint {
    x: f32,
    y: f32,
    z: f32,
    #[serde(default = "mid_gray")]
    red: u8,
    #[serde(default = "mid_gray")]
    green: u8,
    #[serde(default = "mid_gray")]
    blue: u8,
}

#[derive(Deserialize)]
struct PlyPoints {
    vertex: Vec<PlyPoint>,
}

/// Coloured points used to seed the scene.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointCloud {
    pub positions: Vec<Vec3>,
    /// Linear colours in `[0, 1]`.
    pub colors: Vec<Vec3>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn from_ply_reader(reader: impl std::io::BufRead) -> Result<Self, DatasetError> {
        let ply: PlyPoints = serde_ply::from_reader(reader)?;
        let (positions, colors) = ply
            .vertex
            .into_iter()
            .map(|p| {
                (
                    Vec3::new(p.x, p.y, p.z),
                    Vec3::new(p.red as f32, p.green as f32, p.blue as f32) / 255.0,
                )
            })
            .unzip();
        Ok(Self { positions, colors })
    }

    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let file = std::fs::File::open(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cloud = Self::from_ply_reader(BufReader::new(file))?;
        log::info!("Loaded {} initial points from {path:?}", cloud.len());
        Ok(cloud)
    }
}
