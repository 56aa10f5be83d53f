use burn::prelude::Backend;
use burn::tensor::Tensor;
use glam::Vec3;
use photon_render::camera::Camera;
use photon_render::gaussian_scene::GaussianScene;
use photon_render::{RenderOptions, Renderer};
use rand::Rng;
use rand_distr::{Distribution, Normal, NormalError};
use tracing::trace_span;

use crate::loss::l1_loss;

/// Penalises renders that change under small camera translation noise.
#[derive(Debug, Clone)]
pub struct PerturbationRegularizer {
    trials: u32,
    offsets: Normal<f32>,
}

impl PerturbationRegularizer {
    pub fn new(trials: u32, std_dev: f32) -> Result<Self, NormalError> {
        Ok(Self {
            trials,
            offsets: Normal::new(0.0, std_dev)?,
        })
    }

    /// One scalar offset per trial, added to all three translation components.
    pub fn sample_offsets(&self, rng: &mut impl Rng) -> Vec<f32> {
        (0..self.trials).map(|_| self.offsets.sample(rng)).collect()
    }

    /// Cameras offset from `camera`. Every offset is applied to the baseline translation,
    /// so trials never compound.
    pub fn perturbed_cameras(&self, camera: &Camera, offsets: &[f32]) -> Vec<Camera> {
        let baseline = camera.translation();
        offsets
            .iter()
            .map(|&offset| camera.with_translation(baseline + Vec3::splat(offset)))
            .collect()
    }

    /// `L1(image, mean perturbed image) + L1(image_color, mean perturbed colour)`.
    pub fn loss<B: Backend, R: Renderer<B>>(
        &self,
        renderer: &R,
        camera: &Camera,
        scene: &GaussianScene<B>,
        options: &RenderOptions,
        image: Tensor<B, 3>,
        image_color: Tensor<B, 3>,
        rng: &mut impl Rng,
    ) -> Tensor<B, 1> {
        let _span = trace_span!("PerturbationRegularizer::loss").entered();

        let offsets = self.sample_offsets(rng);
        // Unmoved cameras reproduce the base render, so the loss is exactly zero.
        if offsets.is_empty() || offsets.iter().all(|&o| o == 0.0) {
            return Tensor::zeros([1], &image.device());
        }

        let weight = 1.0 / offsets.len() as f32;
        let mut image_avg = image.zeros_like();
        let mut color_avg = image_color.zeros_like();
        for perturbed in self.perturbed_cameras(camera, &offsets) {
            let out = renderer.render(&perturbed, scene, options);
            image_avg = image_avg + out.image * weight;
            color_avg = color_avg + out.image_color * weight;
        }

        l1_loss(image, image_avg) + l1_loss(image_color, color_avg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use glam::Mat3;
    use photon_render::dense::DenseRenderer;
    use photon_render::gaussian_scene::inverse_sigmoid;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn camera() -> Camera {
        Camera::new(Mat3::IDENTITY, Vec3::new(0.0, 0.0, 4.0), 0.8, 0.8, 12, 12)
    }

    fn scene() -> GaussianScene<NdArray> {
        GaussianScene::from_raw(
            vec![0.0, 0.0, 0.0, 0.3, -0.2, 0.1],
            vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
            vec![-1.5; 6],
            vec![0.8; 6],
            vec![inverse_sigmoid(0.8); 2],
            &Default::default(),
        )
    }

    #[test]
    fn zero_spread_gives_zero_offsets_and_loss() {
        let reg = PerturbationRegularizer::new(3, 0.0).expect("valid spread");
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(reg.sample_offsets(&mut rng), vec![0.0; 3]);

        let renderer = DenseRenderer::default();
        let options = RenderOptions::default();
        let scene = scene();
        let out = renderer.render(&camera(), &scene, &options);
        let loss = reg.loss(
            &renderer,
            &camera(),
            &scene,
            &options,
            out.image,
            out.image_color,
            &mut rng,
        );
        assert_eq!(loss.into_scalar(), 0.0);
    }

    #[test]
    fn offsets_are_relative_to_the_baseline() {
        let reg = PerturbationRegularizer::new(3, 0.1).expect("valid spread");
        let cam = camera();
        let cams = reg.perturbed_cameras(&cam, &[0.5, -0.25, 0.5]);
        assert_eq!(cams[0].translation(), Vec3::new(0.5, 0.5, 4.5));
        assert_eq!(cams[1].translation(), Vec3::new(-0.25, -0.25, 3.75));
        // The third trial repeats the first offset and lands on the same pose.
        assert_eq!(cams[2].translation(), cams[0].translation());
        assert_eq!(cam.translation(), Vec3::new(0.0, 0.0, 4.0));
    }

    #[test]
    fn perturbed_views_give_a_positive_loss() {
        let reg = PerturbationRegularizer::new(3, 0.2).expect("valid spread");
        let renderer = DenseRenderer::default();
        let options = RenderOptions {
            lambda_p: 4.0,
            ..Default::default()
        };
        let scene = scene();
        let out = renderer.render(&camera(), &scene, &options);
        let loss = reg
            .loss(
                &renderer,
                &camera(),
                &scene,
                &options,
                out.image,
                out.image_color,
                &mut StdRng::seed_from_u64(7),
            )
            .into_scalar();
        assert!(loss.is_finite() && loss > 0.0, "loss {loss}");
    }

    #[test]
    fn negative_spread_is_rejected() {
        assert!(PerturbationRegularizer::new(3, -1.0).is_err());
    }
}
