use burn::{
    module::{Module, Param, ParamId},
    prelude::Backend,
    tensor::{Int, Tensor, TensorData, activation::sigmoid},
};
use tracing::trace_span;

use crate::sh::sh_degree_from_coeffs;

/// The trainable point set.
///
/// Every tensor is indexed by point along its first dimension and all of them always
/// share that length.
#[derive(Module, Debug)]
pub struct GaussianScene<B: Backend> {
    pub means: Param<Tensor<B, 2>>,
    /// Quaternions stored as `[w, x, y, z]`.
    pub rotations: Param<Tensor<B, 2>>,
    pub log_scales: Param<Tensor<B, 2>>,
    pub sh_coeffs: Param<Tensor<B, 3>>,
    pub raw_opacities: Param<Tensor<B, 1>>,
}

pub fn inverse_sigmoid(x: f32) -> f32 {
    (x / (1.0 - x)).ln()
}

pub(crate) fn norm_vec<B: Backend>(vec: Tensor<B, 2>) -> Tensor<B, 2> {
    let magnitudes = vec.clone().powi_scalar(2).sum_dim(1).sqrt().clamp_min(1e-32);
    vec / magnitudes
}

impl<B: Backend> GaussianScene<B> {
    pub fn from_raw(
        means: Vec<f32>,
        rotations: Vec<f32>,
        log_scales: Vec<f32>,
        sh_coeffs: Vec<f32>,
        raw_opacities: Vec<f32>,
        device: &B::Device,
    ) -> Self {
        let _span = trace_span!("GaussianScene::from_raw").entered();

        let n = means.len() / 3;
        let n_coeffs = if n == 0 { 1 } else { sh_coeffs.len() / (n * 3) };

        Self::from_tensors(
            Tensor::from_data(TensorData::new(means, [n, 3]), device),
            Tensor::from_data(TensorData::new(rotations, [n, 4]), device),
            Tensor::from_data(TensorData::new(log_scales, [n, 3]), device),
            Tensor::from_data(TensorData::new(sh_coeffs, [n, n_coeffs, 3]), device),
            Tensor::from_data(TensorData::new(raw_opacities, [n]), device),
        )
    }

    pub fn from_tensors(
        means: Tensor<B, 2>,
        rotations: Tensor<B, 2>,
        log_scales: Tensor<B, 2>,
        sh_coeffs: Tensor<B, 3>,
        raw_opacities: Tensor<B, 1>,
    ) -> Self {
        assert_eq!(means.dims()[1], 3, "Means must be 3D");
        assert_eq!(rotations.dims()[1], 4, "Rotations must be quaternions");
        assert_eq!(log_scales.dims()[1], 3, "Scales must be 3D");

        let n = means.dims()[0];
        assert!(
            rotations.dims()[0] == n
                && log_scales.dims()[0] == n
                && sh_coeffs.dims()[0] == n
                && raw_opacities.dims()[0] == n,
            "All per-point tensors must have {n} rows"
        );

        Self {
            means: Param::initialized(ParamId::new(), means.detach().require_grad()),
            rotations: Param::initialized(ParamId::new(), rotations.detach().require_grad()),
            log_scales: Param::initialized(ParamId::new(), log_scales.detach().require_grad()),
            sh_coeffs: Param::initialized(ParamId::new(), sh_coeffs.detach().require_grad()),
            raw_opacities: Param::initialized(
                ParamId::new(),
                raw_opacities.detach().require_grad(),
            ),
        }
    }

    pub fn num_points(&self) -> usize {
        self.means.dims()[0]
    }

    pub fn opacities(&self) -> Tensor<B, 1> {
        sigmoid(self.raw_opacities.val())
    }

    pub fn scales(&self) -> Tensor<B, 2> {
        self.log_scales.val().exp()
    }

    /// Largest world-space axis of every point, `[N]`.
    pub fn max_scales(&self) -> Tensor<B, 1> {
        let n = self.num_points();
        self.scales().max_dim(1).reshape([n])
    }

    pub fn rotations_normed(&self) -> Tensor<B, 2> {
        norm_vec(self.rotations.val())
    }

    pub fn max_sh_degree(&self) -> u32 {
        sh_degree_from_coeffs(self.sh_coeffs.dims()[1] as u32)
    }

    pub fn device(&self) -> B::Device {
        self.means.device()
    }

    /// A new scene holding the points at `indices`, in that order.
    pub fn select_points(&self, indices: Tensor<B, 1, Int>) -> Self {
        Self::from_tensors(
            self.means.val().select(0, indices.clone()),
            self.rotations.val().select(0, indices.clone()),
            self.log_scales.val().select(0, indices.clone()),
            self.sh_coeffs.val().select(0, indices.clone()),
            self.raw_opacities.val().select(0, indices),
        )
    }
}
