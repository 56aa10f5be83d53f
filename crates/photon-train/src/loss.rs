use burn::prelude::Backend;
use burn::tensor::Tensor;

use crate::classify::ImageClass;
use crate::config::LossFn;
use crate::ssim::Ssim;

const BCE_EPS: f32 = 1e-6;

pub fn l1_loss<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> Tensor<B, 1> {
    (a - b).abs().mean()
}

pub fn l2_loss<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> Tensor<B, 1> {
    (a - b).powi_scalar(2).mean()
}

/// Mean binary cross entropy of predictions in `[0, 1]` against targets in `[0, 1]`.
///
/// Predictions are clamped away from 0 and 1 so both log terms and their gradients stay
/// finite.
pub fn bce_loss<B: Backend, const D: usize>(pred: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, 1> {
    let pred = pred.clamp(BCE_EPS, 1.0 - BCE_EPS);
    let log_p = pred.clone().log();
    let log_1mp = (pred.neg() + 1.0).log();
    let loss = target.clone() * log_p + (target.neg() + 1.0) * log_1mp;
    loss.neg().mean()
}

pub fn psnr_from_mse(mse: f32) -> f32 {
    -10.0 * mse.log10()
}

/// `(1 - w) * L1 + w * (1 - SSIM)` on the colour render.
pub fn photometric_loss<B: Backend>(
    image_color: Tensor<B, 3>,
    gt: Tensor<B, 3>,
    ssim: &Ssim<B>,
    lambda_dssim: f32,
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let l1 = l1_loss(image_color.clone(), gt.clone());
    let ssim_value = ssim.ssim(image_color, gt).mean();
    let loss = l1.clone() * (1.0 - lambda_dssim) + (ssim_value.neg() + 1.0) * lambda_dssim;
    (l1, loss)
}

impl LossFn {
    /// Reconstruction term of the primary render against a grayscale target.
    pub fn grayscale_loss<B: Backend>(self, image: Tensor<B, 3>, gt: Tensor<B, 3>) -> Tensor<B, 1> {
        match self {
            Self::Bce => bce_loss(image, gt),
            Self::L1 => l1_loss(image, gt),
            Self::L2 => l2_loss(image, gt),
        }
    }
}

/// What to do with a freshly drawn view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDecision {
    /// Drop the view without rendering or stepping.
    Skip,
    Train { requeue: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossPath {
    /// L1 + D-SSIM on the colour render.
    Photometric,
    /// Grayscale term on the primary render, optionally with the perturbation loss.
    Binary { perturb: bool },
}

/// Decides per iteration how a view is used, based on the iteration and its class.
#[derive(Debug, Clone)]
pub struct LossSelector {
    color_warmup_iter: u32,
    color_requeue_cap: u32,
    perturb_start_iter: u32,
    color_count: u32,
}

impl LossSelector {
    pub fn new(color_warmup_iter: u32, color_requeue_cap: u32, perturb_start_iter: u32) -> Self {
        Self {
            color_warmup_iter,
            color_requeue_cap,
            perturb_start_iter,
            color_count: 0,
        }
    }

    /// Colour views seen since the last pool refill that were put back.
    pub fn color_count(&self) -> u32 {
        self.color_count
    }

    /// Called whenever the view pool is refilled.
    pub fn reset(&mut self) {
        self.color_count = 0;
    }

    pub fn decide(&mut self, iteration: u32, class: ImageClass) -> ViewDecision {
        match class {
            ImageClass::Grayscale => ViewDecision::Train { requeue: false },
            ImageClass::Color if iteration < self.color_warmup_iter => ViewDecision::Skip,
            ImageClass::Color => {
                let requeue = self.color_count < self.color_requeue_cap;
                if requeue {
                    self.color_count += 1;
                }
                ViewDecision::Train { requeue }
            }
        }
    }

    pub fn loss_path(&self, iteration: u32, class: ImageClass) -> LossPath {
        match class {
            ImageClass::Color => LossPath::Photometric,
            ImageClass::Grayscale => LossPath::Binary {
                perturb: iteration > self.perturb_start_iter,
            },
        }
    }
}
