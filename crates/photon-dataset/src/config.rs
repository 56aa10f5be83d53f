use clap::Args;
use serde::{Deserialize, Serialize};

fn parse_max_resolution(s: &str) -> Result<u32, String> {
    if s.eq_ignore_ascii_case("max") {
        Ok(u32::MAX)
    } else {
        s.parse::<u32>()
            .map_err(|e| format!("Invalid max resolution '{s}': {e}"))
    }
}

#[derive(Clone, Debug, Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelConfig {
    /// Maximum SH degree of the scene.
    #[arg(long, help_heading = "Model Options", default_value = "3")]
    pub sh_degree: u32,
    /// Number of random points to start from when the dataset has no `points3d.ply`.
    #[arg(long, help_heading = "Model Options", default_value = "100000")]
    pub init_points: usize,
}

#[derive(Clone, Debug, Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoadDatasetConfig {
    /// Max nr. of frames of dataset to load
    #[arg(long, help_heading = "Dataset Options")]
    pub max_frames: Option<usize>,
    /// Max resolution of images to load.
    ///
    /// Pass `max` to keep the source image resolution.
    #[arg(
        long,
        help_heading = "Dataset Options",
        default_value = "max",
        value_parser = parse_max_resolution
    )]
    pub resolution: u32,
    /// Keep the test split for evaluation instead of training on it.
    #[arg(long, help_heading = "Dataset Options", default_value = "false")]
    pub eval: bool,
    /// Composite transparent images onto white instead of black.
    #[arg(long, help_heading = "Dataset Options", default_value = "false")]
    pub white_background: bool,
}

impl LoadDatasetConfig {
    pub fn background(&self) -> glam::Vec3 {
        if self.white_background {
            glam::Vec3::ONE
        } else {
            glam::Vec3::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_max_resolution;

    #[test]
    fn parse_max_resolution_allows_max() {
        assert_eq!(parse_max_resolution("max").unwrap(), u32::MAX);
        assert_eq!(parse_max_resolution("MAX").unwrap(), u32::MAX);
    }

    #[test]
    fn parse_max_resolution_allows_numbers() {
        assert_eq!(parse_max_resolution("800").unwrap(), 800);
    }

    #[test]
    fn parse_max_resolution_rejects_invalid() {
        assert!(parse_max_resolution("nope").is_err());
    }
}
