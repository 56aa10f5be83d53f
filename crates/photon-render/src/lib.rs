#![recursion_limit = "256"]

use burn::prelude::Backend;
use burn::tensor::{Bool, Tensor};
use glam::Vec3;

use crate::camera::Camera;
use crate::gaussian_scene::GaussianScene;

pub mod bounding_box;
pub mod camera;
pub mod dense;
pub mod gaussian_scene;
pub mod sh;

#[cfg(feature = "wgpu")]
pub type MainBackend = burn::backend::Wgpu;
#[cfg(not(feature = "wgpu"))]
pub type MainBackend = burn::backend::NdArray;

pub type TrainBackend = burn::backend::Autodiff<MainBackend>;

/// Reads a float tensor back to the host.
pub fn read_f32<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor
        .into_data()
        .convert::<f32>()
        .into_vec()
        .expect("Unreachable")
}

/// Knobs forwarded to a [`Renderer`] for a single call.
///
/// `deblur`, `lambda_s`, `lambda_p` and `max_clamp` drive the photon response of the
/// primary image. `color_pass` is set when the ground truth of the current view is a
/// colour photograph and the renderer should use its colour compositing path.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    pub background: Vec3,
    pub scaling_modifier: f32,
    pub deblur: bool,
    /// Only meaningful for renderers with a learned position-dependent response.
    pub use_pos: bool,
    pub lambda_s: f32,
    pub lambda_p: f32,
    pub max_clamp: f32,
    pub color_pass: bool,
    pub sh_degree: u32,
    pub debug: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            background: Vec3::ZERO,
            scaling_modifier: 1.0,
            deblur: false,
            use_pos: false,
            lambda_s: 0.0,
            lambda_p: 1.0,
            max_clamp: 1.0,
            color_pass: false,
            sh_degree: 0,
            debug: false,
        }
    }
}

/// Visibility and screen radius of every point for one render pass.
#[derive(Debug, Clone)]
pub struct RenderPass<B: Backend> {
    pub visible: Tensor<B, 1, Bool>,
    pub radii: Tensor<B, 1>,
}

/// How many passes a renderer used to produce its output.
#[derive(Debug, Clone)]
pub enum PassLayout<B: Backend> {
    SinglePass(RenderPass<B>),
    MultiPass(Vec<RenderPass<B>>),
}

impl<B: Backend> PassLayout<B> {
    pub fn num_passes(&self) -> usize {
        match self {
            Self::SinglePass(_) => 1,
            Self::MultiPass(passes) => passes.len(),
        }
    }

    /// Weight a pass contributes to the per-point gradient statistics.
    pub fn pass_weight(&self) -> f32 {
        1.0 / self.num_passes().max(1) as f32
    }

    pub fn passes(&self) -> &[RenderPass<B>] {
        match self {
            Self::SinglePass(pass) => std::slice::from_ref(pass),
            Self::MultiPass(passes) => passes,
        }
    }

    /// The pass whose radii feed the running max-radius bookkeeping.
    ///
    /// Multi-pass renders only ever contribute their first pass here.
    pub fn radius_pass(&self) -> Option<&RenderPass<B>> {
        self.passes().first()
    }
}

pub struct RenderOutput<B: Backend> {
    /// Primary (photon response) image, `[H, W, 3]`.
    pub image: Tensor<B, 3>,
    /// Colour composite, `[H, W, 3]`.
    pub image_color: Tensor<B, 3>,
    /// Screen-space position proxy, `[N, 2]`. Its gradient is the per-point
    /// screen-space gradient after backward.
    pub viewspace_points: Tensor<B, 2>,
    pub passes: PassLayout<B>,
}

pub trait Renderer<B: Backend> {
    fn render(
        &self,
        camera: &Camera,
        scene: &GaussianScene<B>,
        options: &RenderOptions,
    ) -> RenderOutput<B>;
}
