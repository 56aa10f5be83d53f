//! A dense, fully differentiable reference renderer.
//!
//! Every point is splatted as an isotropic screen-space Gaussian and composited
//! order-independently over the full pixel grid. The cost is `O(points * pixels)`, so
//! this is meant for small scenes and tests. Production runs plug a tiled rasterizer
//! in through [`Renderer`].

use burn::prelude::Backend;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{Tensor, TensorData};
use glam::Mat3;
use tracing::trace_span;

use crate::camera::Camera;
use crate::gaussian_scene::{GaussianScene, norm_vec};
use crate::sh::eval_sh;
use crate::{PassLayout, RenderOptions, RenderOutput, RenderPass, Renderer};

const LUMA: [f32; 3] = [0.299, 0.587, 0.114];

/// Screen-space variance added to every footprint so tiny points stay visible.
const MIN_VARIANCE_PX: f32 = 0.3;

#[derive(Debug, Clone)]
pub struct DenseRenderer {
    /// Upper bound on `points * pixels` evaluated at once.
    pub max_pairs_per_chunk: usize,
}

impl Default for DenseRenderer {
    fn default() -> Self {
        Self {
            max_pairs_per_chunk: 1 << 22,
        }
    }
}

/// Normalised 1D Gaussian taps, `2 * ceil(3 sigma) + 1` long.
pub fn gaussian_taps(sigma: f32) -> Vec<f32> {
    let half = (3.0 * sigma).ceil().max(1.0) as i32;
    let taps: Vec<f32> = (-half..=half)
        .map(|x| (-(x * x) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = taps.iter().sum();
    taps.into_iter().map(|t| t / sum).collect()
}

/// Blurs a single channel image `[H, W]` with a Gaussian point-spread function.
fn blur<B: Backend>(image: Tensor<B, 2>, sigma: f32) -> Tensor<B, 2> {
    let [h, w] = image.dims();
    let device = image.device();
    let taps = gaussian_taps(sigma);
    let size = taps.len();

    let kernel: Vec<f32> = taps
        .iter()
        .flat_map(|a| taps.iter().map(move |b| a * b))
        .collect();
    let kernel = Tensor::<B, 4>::from_data(TensorData::new(kernel, [1, 1, size, size]), &device);

    let out = conv2d(
        image.reshape([1, 1, h, w]),
        kernel,
        None,
        ConvOptions::new([1, 1], [size / 2, size / 2], [1, 1], 1),
    );
    out.reshape([h, w])
}

impl<B: Backend> Renderer<B> for DenseRenderer {
    fn render(
        &self,
        camera: &Camera,
        scene: &GaussianScene<B>,
        options: &RenderOptions,
    ) -> RenderOutput<B> {
        let _span = trace_span!("DenseRenderer::render").entered();

        let device = scene.device();
        let n = scene.num_points();
        let (width, height) = (camera.width as usize, camera.height as usize);
        let num_pixels = width * height;

        let background = Tensor::<B, 2>::from_data(
            TensorData::new(options.background.to_array().to_vec(), [1, 3]),
            &device,
        );

        let viewspace_points = Tensor::<B, 2>::zeros([n, 2], &device).require_grad();

        if n == 0 {
            let image_color = background.repeat_dim(0, num_pixels).reshape([height, width, 3]);
            return RenderOutput {
                image: Tensor::zeros([height, width, 3], &device),
                image_color,
                viewspace_points,
                passes: PassLayout::SinglePass(RenderPass {
                    visible: Tensor::<B, 1>::zeros([0], &device).greater_elem(0.5),
                    radii: Tensor::zeros([0], &device),
                }),
            };
        }

        // Project means into the image.
        let world_view = camera.world_view_transform();
        let rot_t = Tensor::<B, 2>::from_data(
            TensorData::new(Mat3::from_mat4(world_view).to_cols_array().to_vec(), [3, 3]),
            &device,
        );
        let translation = Tensor::<B, 1>::from_data(
            TensorData::new(world_view.w_axis.truncate().to_array().to_vec(), [3]),
            &device,
        );
        let means = scene.means.val();
        let cam_points = means.clone().matmul(rot_t) + translation.unsqueeze_dim(0);

        let depth = cam_points.clone().slice([0..n, 2..3]);
        let in_front = depth.clone().greater_elem(camera.znear).float();
        let depth = depth.clamp_min(camera.znear);

        let focal = camera.focal();
        let principal = camera.principal_point();
        let u = cam_points.clone().slice([0..n, 0..1]) / depth.clone() * focal.x + principal.x;
        let v = cam_points.slice([0..n, 1..2]) / depth.clone() * focal.y + principal.y;
        let uv = Tensor::cat(vec![u, v], 1) + viewspace_points.clone();
        let u = uv.clone().slice([0..n, 0..1]);
        let v = uv.slice([0..n, 1..2]);

        let world_scale = scene.scales().mean_dim(1) * options.scaling_modifier;
        let sigma_px = world_scale * focal.x / depth;
        let variance = sigma_px.powi_scalar(2) + MIN_VARIANCE_PX;
        let radius = variance.clone().sqrt().detach() * 3.0;

        // A point is visible if it sits in front of the camera and its footprint
        // touches the image.
        let (u_d, v_d) = (u.clone().detach(), v.clone().detach());
        let visible_f = in_front
            * (u_d.clone() + radius.clone()).greater_elem(0.0).float()
            * (u_d - radius.clone()).lower_elem(width as f32).float()
            * (v_d.clone() + radius.clone()).greater_elem(0.0).float()
            * (v_d - radius.clone()).lower_elem(height as f32).float();
        let radii = (radius * visible_f.clone()).reshape([n]);
        let visible = visible_f.clone().reshape([n]).greater_elem(0.5);

        if options.debug {
            let count = visible_f.clone().sum().into_scalar();
            log::debug!("Rendering {n} points, visible sum {count:?}");
        }

        let opacity = scene.opacities().reshape([n, 1]) * visible_f;

        let dirs = norm_vec(
            means
                - Tensor::<B, 1>::from_data(
                    TensorData::new(camera.camera_center().to_array().to_vec(), [3]),
                    &device,
                )
                .unsqueeze_dim(0),
        );
        let degree = if options.color_pass { options.sh_degree } else { 0 };
        let colors = eval_sh(degree, scene.sh_coeffs.val(), dirs);

        let rows_per_chunk = (self.max_pairs_per_chunk / (width * n).max(1)).clamp(1, height.max(1));

        let mut composites = vec![];
        let mut row = 0;
        while row < height {
            let end = (row + rows_per_chunk).min(height);
            let count = (end - row) * width;

            let xs: Vec<f32> = (row..end)
                .flat_map(|_| (0..width).map(|x| x as f32 + 0.5))
                .collect();
            let ys: Vec<f32> = (row..end)
                .flat_map(|y| std::iter::repeat_n(y as f32 + 0.5, width))
                .collect();
            let px = Tensor::<B, 2>::from_data(TensorData::new(xs, [1, count]), &device);
            let py = Tensor::<B, 2>::from_data(TensorData::new(ys, [1, count]), &device);

            let dist2 = (px - u.clone()).powi_scalar(2) + (py - v.clone()).powi_scalar(2);
            let weights = (dist2 / variance.clone() * -0.5).exp() * opacity.clone();

            let density = weights.clone().sum_dim(0).transpose();
            let radiance = weights.transpose().matmul(colors.clone()) / (density.clone() + 1e-8);
            let alpha = (density.neg().exp() * -1.0) + 1.0;
            composites.push(radiance * alpha.clone() + background.clone() * (alpha.neg() + 1.0));

            row = end;
        }

        let composite = Tensor::cat(composites, 0);
        let luma = Tensor::<B, 2>::from_data(TensorData::new(LUMA.to_vec(), [3, 1]), &device);
        let mut flux = (composite.clone().matmul(luma) * options.lambda_p).reshape([height, width]);

        if options.deblur && options.lambda_s > 0.0 {
            flux = blur(flux, options.lambda_s);
        }

        let image = ((flux.neg().exp() * -1.0) + 1.0)
            .clamp(0.0, options.max_clamp)
            .reshape([height, width, 1])
            .repeat_dim(2, 3);

        RenderOutput {
            image,
            image_color: composite.reshape([height, width, 3]),
            viewspace_points,
            passes: PassLayout::SinglePass(RenderPass { visible, radii }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussian_scene::inverse_sigmoid;
    use crate::sh::rgb_to_sh;
    use assert_approx_eq::assert_approx_eq;
    use burn::backend::{Autodiff, NdArray};
    use glam::Vec3;

    fn camera() -> Camera {
        Camera::new(Mat3::IDENTITY, Vec3::new(0.0, 0.0, 4.0), 0.8, 0.8, 16, 16)
    }

    fn point_scene<B: Backend>(positions: &[Vec3], log_scale: f32) -> GaussianScene<B> {
        let n = positions.len();
        let dc = rgb_to_sh(Vec3::ONE);
        GaussianScene::from_raw(
            positions.iter().flat_map(|p| p.to_array()).collect(),
            (0..n).flat_map(|_| [1.0, 0.0, 0.0, 0.0]).collect(),
            vec![log_scale; n * 3],
            (0..n).flat_map(|_| dc.to_array()).collect(),
            vec![inverse_sigmoid(0.9); n],
            &Default::default(),
        )
    }

    fn pixel(image: &[f32], width: usize, x: usize, y: usize) -> f32 {
        image[(y * width + x) * 3]
    }

    #[test]
    fn centered_point_is_brightest_in_the_middle() {
        let scene = point_scene::<NdArray>(&[Vec3::ZERO], -2.0);
        let out = DenseRenderer::default().render(
            &camera(),
            &scene,
            &RenderOptions {
                lambda_p: 4.0,
                ..Default::default()
            },
        );
        assert_eq!(out.image.dims(), [16, 16, 3]);
        assert_eq!(out.image_color.dims(), [16, 16, 3]);

        let image = out.image.into_data().to_vec::<f32>().expect("f32 data");
        assert!(pixel(&image, 16, 8, 8) > pixel(&image, 16, 0, 0));

        let PassLayout::SinglePass(pass) = out.passes else {
            panic!("Dense renderer renders a single pass");
        };
        let radii = pass.radii.into_data().to_vec::<f32>().expect("f32 data");
        assert!(radii[0] > 0.0);
        assert_eq!(pass.visible.dims(), [1]);
    }

    #[test]
    fn points_behind_camera_are_invisible() {
        let scene = point_scene::<NdArray>(&[Vec3::new(0.0, 0.0, -10.0)], -2.0);
        let out = DenseRenderer::default().render(&camera(), &scene, &RenderOptions::default());
        let PassLayout::SinglePass(pass) = out.passes else {
            panic!("Dense renderer renders a single pass");
        };
        assert_eq!(pass.radii.into_scalar(), 0.0);
        assert_eq!(out.image.max().into_scalar(), 0.0);
    }

    #[test]
    fn primary_image_respects_max_clamp() {
        let scene = point_scene::<NdArray>(&[Vec3::ZERO], -0.5);
        let out = DenseRenderer::default().render(
            &camera(),
            &scene,
            &RenderOptions {
                lambda_p: 50.0,
                max_clamp: 0.7,
                ..Default::default()
            },
        );
        assert!(out.image.max().into_scalar() <= 0.7 + 1e-6);
    }

    #[test]
    fn deblur_spreads_energy() {
        let scene = point_scene::<NdArray>(&[Vec3::ZERO], -4.0);
        let options = RenderOptions {
            lambda_p: 4.0,
            ..Default::default()
        };
        let sharp = DenseRenderer::default().render(&camera(), &scene, &options);
        let blurred = DenseRenderer::default().render(
            &camera(),
            &scene,
            &RenderOptions {
                deblur: true,
                lambda_s: 2.0,
                ..options
            },
        );
        let sharp = sharp.image.into_data().to_vec::<f32>().expect("f32 data");
        let blurred = blurred.image.into_data().to_vec::<f32>().expect("f32 data");
        assert!(pixel(&blurred, 16, 12, 8) > pixel(&sharp, 16, 12, 8));
    }

    #[test]
    fn chunked_rendering_matches_single_chunk() {
        let scene = point_scene::<NdArray>(&[Vec3::ZERO, Vec3::new(0.3, -0.2, 0.5)], -1.5);
        let options = RenderOptions::default();
        let whole = DenseRenderer::default().render(&camera(), &scene, &options);
        let chunked = DenseRenderer {
            max_pairs_per_chunk: 1,
        }
        .render(&camera(), &scene, &options);
        let diff = (whole.image_color - chunked.image_color).abs().max().into_scalar();
        assert_approx_eq!(diff, 0.0, 1e-6);
    }

    #[test]
    fn gradients_reach_viewspace_points_and_means() {
        type Ad = Autodiff<NdArray>;
        let scene = point_scene::<Ad>(&[Vec3::new(0.2, 0.1, 0.0)], -2.0);
        let out = DenseRenderer::default().render(
            &camera(),
            &scene,
            &RenderOptions {
                lambda_p: 4.0,
                ..Default::default()
            },
        );
        let grads = out.image.sum().backward();
        let xy_grad = out.viewspace_points.grad(&grads).expect("viewspace gradient");
        assert_eq!(xy_grad.dims(), [1, 2]);
        assert!(scene.means.grad(&grads).is_some());
        assert!(scene.raw_opacities.grad(&grads).is_some());
    }

    #[test]
    fn taps_are_normalized() {
        let taps = gaussian_taps(1.5);
        assert_eq!(taps.len(), 11);
        assert_approx_eq!(taps.iter().sum::<f32>(), 1.0, 1e-5);
    }
}
