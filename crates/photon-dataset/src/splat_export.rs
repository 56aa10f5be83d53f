use std::path::Path;

use burn::prelude::Backend;
use photon_render::gaussian_scene::GaussianScene;
use photon_render::read_f32;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_ply::{SerializeError, SerializeOptions};

const REST_NAMES: [&str; 45] = [
    "f_rest_0", "f_rest_1", "f_rest_2", "f_rest_3", "f_rest_4", "f_rest_5", "f_rest_6",
    "f_rest_7", "f_rest_8", "f_rest_9", "f_rest_10", "f_rest_11", "f_rest_12", "f_rest_13",
    "f_rest_14", "f_rest_15", "f_rest_16", "f_rest_17", "f_rest_18", "f_rest_19", "f_rest_20",
    "f_rest_21", "f_rest_22", "f_rest_23", "f_rest_24", "f_rest_25", "f_rest_26", "f_rest_27",
    "f_rest_28", "f_rest_29", "f_rest_30", "f_rest_31", "f_rest_32", "f_rest_33", "f_rest_34",
    "f_rest_35", "f_rest_36", "f_rest_37", "f_rest_38", "f_rest_39", "f_rest_40", "f_rest_41",
    "f_rest_42", "f_rest_43", "f_rest_44",
];

struct PlySplat {
    mean: [f32; 3],
    log_scale: [f32; 3],
    opacity: f32,
    rotation: [f32; 4],
    sh_dc: [f32; 3],
    sh_rest: Vec<f32>,
}

impl Serialize for PlySplat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("PlySplat", 14 + self.sh_rest.len())?;
        state.serialize_field("x", &self.mean[0])?;
        state.serialize_field("y", &self.mean[1])?;
        state.serialize_field("z", &self.mean[2])?;
        state.serialize_field("scale_0", &self.log_scale[0])?;
        state.serialize_field("scale_1", &self.log_scale[1])?;
        state.serialize_field("scale_2", &self.log_scale[2])?;
        state.serialize_field("opacity", &self.opacity)?;
        state.serialize_field("rot_0", &self.rotation[0])?;
        state.serialize_field("rot_1", &self.rotation[1])?;
        state.serialize_field("rot_2", &self.rotation[2])?;
        state.serialize_field("rot_3", &self.rotation[3])?;
        state.serialize_field("f_dc_0", &self.sh_dc[0])?;
        state.serialize_field("f_dc_1", &self.sh_dc[1])?;
        state.serialize_field("f_dc_2", &self.sh_dc[2])?;
        for (name, val) in REST_NAMES.iter().zip(&self.sh_rest) {
            state.serialize_field(name, val)?;
        }
        state.end()
    }
}

#[derive(Serialize)]
struct Ply {
    vertex: Vec<PlySplat>,
}

fn read_scene<B: Backend>(scene: &GaussianScene<B>) -> Ply {
    let _span = tracing::trace_span!("read_scene").entered();

    let means = read_f32(scene.means.val());
    let log_scales = read_f32(scene.log_scales.val());
    let rotations = read_f32(scene.rotations_normed());
    let opacities = read_f32(scene.raw_opacities.val());
    // Channel-major per point, as other splat tools expect.
    let sh_coeffs = read_f32(scene.sh_coeffs.val().permute([0, 2, 1]));
    let num_coeffs = scene.sh_coeffs.dims()[1];

    let vertex = (0..scene.num_points())
        .map(|i| {
            let sh = &sh_coeffs[i * num_coeffs * 3..(i + 1) * num_coeffs * 3];
            let channels = [
                &sh[0..num_coeffs],
                &sh[num_coeffs..num_coeffs * 2],
                &sh[num_coeffs * 2..],
            ];
            PlySplat {
                mean: [means[i * 3], means[i * 3 + 1], means[i * 3 + 2]],
                log_scale: [log_scales[i * 3], log_scales[i * 3 + 1], log_scales[i * 3 + 2]],
                opacity: opacities[i],
                rotation: [
                    rotations[i * 4],
                    rotations[i * 4 + 1],
                    rotations[i * 4 + 2],
                    rotations[i * 4 + 3],
                ],
                sh_dc: [channels[0][0], channels[1][0], channels[2][0]],
                sh_rest: channels.iter().flat_map(|c| c[1..].iter().copied()).collect(),
            }
        })
        .collect();
    Ply { vertex }
}

pub fn scene_to_ply<B: Backend>(scene: &GaussianScene<B>) -> Result<Vec<u8>, SerializeError> {
    let ply = read_scene(scene);
    let comments = vec![
        "Exported from photon".to_owned(),
        format!("SH degree: {}", scene.max_sh_degree()),
    ];
    serde_ply::to_bytes(&ply, SerializeOptions::binary_le().with_comments(comments))
}

/// Writes `<model_path>/point_cloud/iteration_<iter>/point_cloud.ply`.
pub fn save_scene<B: Backend>(
    scene: &GaussianScene<B>,
    model_path: &Path,
    iter: u32,
) -> anyhow::Result<std::path::PathBuf> {
    let dir = model_path
        .join("point_cloud")
        .join(format!("iteration_{iter}"));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("point_cloud.ply");
    std::fs::write(&path, scene_to_ply(scene)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct ReadSplat {
        x: f32,
        opacity: f32,
        f_dc_2: f32,
        f_rest_0: f32,
    }

    #[derive(Deserialize)]
    struct ReadPly {
        vertex: Vec<ReadSplat>,
    }

    fn scene() -> GaussianScene<NdArray> {
        GaussianScene::from_raw(
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            vec![2.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
            vec![0.0; 6],
            (0..24).map(|i| i as f32).collect(),
            vec![0.25, -0.5],
            &Default::default(),
        )
    }

    #[test]
    fn exported_ply_reads_back() {
        let bytes = scene_to_ply(&scene()).expect("serializes");
        let ply: ReadPly =
            serde_ply::from_reader(std::io::Cursor::new(bytes)).expect("deserializes");
        assert_eq!(ply.vertex.len(), 2);
        assert_eq!(ply.vertex[1].x, 4.0);
        assert_eq!(ply.vertex[1].opacity, -0.5);
        // Point 0 holds coefficient k of channel c at 3k + c.
        assert_eq!(ply.vertex[0].f_dc_2, 2.0);
        assert_eq!(ply.vertex[0].f_rest_0, 3.0);
    }

    #[test]
    fn save_scene_uses_iteration_folder() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = save_scene(&scene(), dir.path(), 7).expect("writes");
        assert!(path.ends_with("point_cloud/iteration_7/point_cloud.ply"));
        assert!(path.exists());
    }
}
