use burn::LearningRate;
use burn::config::Config;
use burn::module::{Param, ParamId};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::record::AdaptorRecord;
use burn::optim::{AdaptiveMomentumState, GradientsParams, Optimizer, SimpleOptimizer};
use burn::prelude::Backend;
use burn::record::Record;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Int, Tensor};
use photon_render::gaussian_scene::GaussianScene;
use tracing::trace_span;

/// Higher SH bands learn this many times slower than the DC band.
pub const SH_REST_DIVISOR: f32 = 20.0;

/// Learning rates of the individual scene parameters for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRates {
    pub means: f64,
    pub rotations: f64,
    pub log_scales: f64,
    /// Rate of the SH DC band.
    pub sh_coeffs: f64,
    pub raw_opacities: f64,
}

#[derive(Config, Debug)]
pub struct AdamScaledConfig {
    #[config(default = 0.9)]
    pub beta_1: f32,
    #[config(default = 0.999)]
    pub beta_2: f32,
    #[config(default = 1e-15)]
    pub epsilon: f32,
}

/// Adam with an optional per-element learning rate scale kept in the state.
#[derive(Clone, Debug)]
pub struct AdamScaled {
    beta_1: f32,
    beta_2: f32,
    epsilon: f32,
}

#[derive(Record, Clone)]
pub struct AdamState<B: Backend, const D: usize> {
    pub momentum: Option<AdaptiveMomentumState<B, D>>,
    /// Multiplies the step, broadcast against the parameter.
    pub scaling: Option<Tensor<B, D>>,
}

impl AdamScaled {
    fn momentum<B: Backend, const D: usize>(
        &self,
        grad: Tensor<B, D>,
        state: Option<AdaptiveMomentumState<B, D>>,
    ) -> (Tensor<B, D>, AdaptiveMomentumState<B, D>) {
        let state = match state {
            Some(mut state) => {
                state.moment_1 =
                    state.moment_1 * self.beta_1 + grad.clone() * (1.0 - self.beta_1);
                state.moment_2 =
                    state.moment_2 * self.beta_2 + grad.powi_scalar(2) * (1.0 - self.beta_2);
                state.time += 1;
                state
            }
            None => AdaptiveMomentumState::new(
                1,
                grad.clone() * (1.0 - self.beta_1),
                grad.powi_scalar(2) * (1.0 - self.beta_2),
            ),
        };

        let time = state.time as i32;
        let m1 = state.moment_1.clone() / (1.0 - self.beta_1.powi(time));
        let m2 = state.moment_2.clone() / (1.0 - self.beta_2.powi(time));
        (m1 / (m2.sqrt() + self.epsilon), state)
    }
}

impl<B: Backend> SimpleOptimizer<B> for AdamScaled {
    type State<const D: usize> = AdamState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let (momentum, scaling) = state.map_or((None, None), |s| (s.momentum, s.scaling));
        let (direction, momentum) = self.momentum(grad, momentum);

        let mut delta = direction * lr as f32;
        if let Some(scale) = &scaling {
            delta = delta * scale.clone();
        }

        let state = AdamState {
            momentum: Some(momentum),
            scaling,
        };
        (tensor - delta, Some(state))
    }

    fn to_device<const D: usize>(mut state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        state.momentum = state.momentum.map(|m| m.to_device(device));
        state.scaling = state.scaling.map(|s| s.to_device(device));
        state
    }
}

impl AdamScaledConfig {
    pub fn init<AB: AutodiffBackend>(&self) -> OptimizerAdaptor<AdamScaled, GaussianScene<AB>, AB> {
        OptimizerAdaptor::from(AdamScaled {
            beta_1: self.beta_1,
            beta_2: self.beta_2,
            epsilon: self.epsilon,
        })
    }
}

type SceneAdaptor<AB> = OptimizerAdaptor<AdamScaled, GaussianScene<AB>, AB>;

/// Optimizer state of every scene parameter, keyed by parameter id.
pub type SceneOptimizerRecord<AB> = <SceneAdaptor<AB> as Optimizer<GaussianScene<AB>, AB>>::Record;

/// Adam over the scene parameters, each stepped with its own learning rate.
///
/// State is keyed by parameter id, so structural edits go through [`Self::replace_points`]
/// which keeps the ids and reindexes the moments.
pub struct SceneOptimizer<AB: AutodiffBackend> {
    config: AdamScaledConfig,
    optim: SceneAdaptor<AB>,
}

fn sh_band_scale<B: Backend>(num_coeffs: usize, device: &B::Device) -> Tensor<B, 3> {
    let scales: Vec<f32> = (0..num_coeffs)
        .map(|band| if band == 0 { 1.0 } else { 1.0 / SH_REST_DIVISOR })
        .collect();
    Tensor::<B, 1>::from_floats(scales.as_slice(), device).reshape([1, num_coeffs, 1])
}

pub(crate) fn append_zero_rows<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    rows: usize,
) -> Tensor<B, D> {
    if rows == 0 {
        return tensor;
    }
    let mut dims = tensor.dims();
    dims[0] = rows;
    let zeros = Tensor::zeros(dims, &tensor.device());
    Tensor::cat(vec![tensor, zeros], 0)
}

/// Gives `param` the value `value` under the same id and reindexes its moments.
fn replace_param<AB: AutodiffBackend, const D: usize>(
    param: Param<Tensor<AB, D>>,
    value: Tensor<AB::InnerBackend, D>,
    record: &mut SceneOptimizerRecord<AB>,
    appended: usize,
    keep: &Tensor<AB::InnerBackend, 1, Int>,
) -> Param<Tensor<AB, D>> {
    if let Some(entry) = record.remove(&param.id) {
        let mut state: AdamState<AB::InnerBackend, D> = entry.into_state();
        state.momentum = state.momentum.map(|mut m| {
            m.moment_1 = append_zero_rows(m.moment_1, appended).select(0, keep.clone());
            m.moment_2 = append_zero_rows(m.moment_2, appended).select(0, keep.clone());
            m
        });
        record.insert(param.id, AdaptorRecord::from_state(state));
    }
    param.map(|_| Tensor::from_inner(value).require_grad())
}

impl<AB: AutodiffBackend> SceneOptimizer<AB> {
    pub fn new(scene: &GaussianScene<AB>, config: AdamScaledConfig) -> Self {
        let [_, num_coeffs, _] = scene.sh_coeffs.dims();
        let mut record: SceneOptimizerRecord<AB> = Default::default();
        record.insert(
            scene.sh_coeffs.id,
            AdaptorRecord::from_state(AdamState::<AB::InnerBackend, 3> {
                momentum: None,
                scaling: Some(sh_band_scale(num_coeffs, &scene.device())),
            }),
        );
        let optim = config.init().load_record(record);
        Self { config, optim }
    }

    pub fn from_record(record: SceneOptimizerRecord<AB>, config: AdamScaledConfig) -> Self {
        let optim = config.init().load_record(record);
        Self { config, optim }
    }

    pub fn to_record(&self) -> SceneOptimizerRecord<AB> {
        self.optim.to_record()
    }

    /// Adam steps taken by the rank 2 parameter `id`.
    pub fn steps(&self, id: ParamId) -> usize {
        self.moment_state::<2>(id).map_or(0, |m| m.time)
    }

    /// Rows of the moments of the rank 2 parameter `id`, once it has been stepped.
    pub fn moment_rows(&self, id: ParamId) -> Option<usize> {
        self.moment_state::<2>(id).map(|m| m.moment_1.dims()[0])
    }

    fn moment_state<const D: usize>(
        &self,
        id: ParamId,
    ) -> Option<AdaptiveMomentumState<AB::InnerBackend, D>> {
        let mut record = self.optim.to_record();
        let state: AdamState<AB::InnerBackend, D> = record.remove(&id)?.into_state();
        state.momentum
    }

    /// Applies one Adam step to every scene parameter that has a gradient.
    ///
    /// Parameters without a gradient, including ones recreated by a structural edit
    /// after the backward pass, keep their value and state.
    pub fn step(
        &mut self,
        mut scene: GaussianScene<AB>,
        grads: &mut AB::Gradients,
        lrs: &LearningRates,
    ) -> GaussianScene<AB> {
        let _span = trace_span!("SceneOptimizer::step").entered();

        let params = [
            (scene.sh_coeffs.id, lrs.sh_coeffs),
            (scene.rotations.id, lrs.rotations),
            (scene.log_scales.id, lrs.log_scales),
            (scene.means.id, lrs.means),
            (scene.raw_opacities.id, lrs.raw_opacities),
        ];
        for (id, lr) in params {
            let grads = GradientsParams::from_params(grads, &scene, &[id]);
            scene = self.optim.step(lr, scene, grads);
        }
        scene
    }

    /// Swaps the values of `scene` for `points` under the same parameter ids.
    ///
    /// `points` must be the current points with `appended` new ones at the end, reduced
    /// to the rows in `keep`. The moments go through the same edit with zeroed rows for
    /// the new points.
    pub fn replace_points(
        &mut self,
        scene: GaussianScene<AB>,
        points: GaussianScene<AB::InnerBackend>,
        appended: usize,
        keep: &Tensor<AB::InnerBackend, 1, Int>,
    ) -> GaussianScene<AB> {
        let _span = trace_span!("SceneOptimizer::replace_points").entered();

        let mut record = self.optim.to_record();
        let scene = GaussianScene {
            means: replace_param(scene.means, points.means.val(), &mut record, appended, keep),
            rotations: replace_param(
                scene.rotations,
                points.rotations.val(),
                &mut record,
                appended,
                keep,
            ),
            log_scales: replace_param(
                scene.log_scales,
                points.log_scales.val(),
                &mut record,
                appended,
                keep,
            ),
            sh_coeffs: replace_param(
                scene.sh_coeffs,
                points.sh_coeffs.val(),
                &mut record,
                appended,
                keep,
            ),
            raw_opacities: replace_param(
                scene.raw_opacities,
                points.raw_opacities.val(),
                &mut record,
                appended,
                keep,
            ),
        };
        self.optim = self.config.init().load_record(record);
        scene
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::AutodiffModule;
    use photon_render::read_f32;

    type Inner = NdArray;
    type Ad = Autodiff<NdArray>;

    fn scene(n: usize) -> GaussianScene<Ad> {
        GaussianScene::from_raw(
            vec![1.0; n * 3],
            (0..n).flat_map(|_| [1.0, 0.0, 0.0, 0.0]).collect(),
            vec![0.0; n * 3],
            vec![0.5; n * 4 * 3],
            vec![0.0; n],
            &Default::default(),
        )
    }

    fn lrs() -> LearningRates {
        LearningRates {
            means: 0.1,
            rotations: 0.1,
            log_scales: 0.1,
            sh_coeffs: 0.1,
            raw_opacities: 0.1,
        }
    }

    #[test]
    fn first_step_moves_by_learning_rate() {
        let scene = scene(2);
        let mut adam = SceneOptimizer::new(&scene, AdamScaledConfig::new());

        let loss = scene.means.val().powi_scalar(2).sum() + scene.sh_coeffs.val().sum();
        let mut grads = loss.backward();
        let scene = adam.step(scene, &mut grads, &lrs());

        for m in read_f32(scene.means.val()) {
            assert_approx_eq!(m, 0.9, 1e-5);
        }

        let sh = read_f32(scene.sh_coeffs.val());
        // DC band at full rate, higher bands at a twentieth.
        assert_approx_eq!(sh[0], 0.4, 1e-5);
        assert_approx_eq!(sh[3], 0.5 - 0.1 / SH_REST_DIVISOR, 1e-5);
    }

    #[test]
    fn parameters_without_gradients_are_untouched() {
        let scene = scene(3);
        let mut adam = SceneOptimizer::new(&scene, AdamScaledConfig::new());

        let mut grads = scene.means.val().sum().backward();
        let scene = adam.step(scene, &mut grads, &lrs());

        assert_eq!(adam.steps(scene.means.id), 1);
        assert_eq!(adam.steps(scene.rotations.id), 0);
        assert!(read_f32(scene.raw_opacities.val()).iter().all(|&o| o == 0.0));
    }

    #[test]
    fn ids_survive_steps() {
        let scene = scene(2);
        let ids = (scene.means.id, scene.sh_coeffs.id);
        let mut adam = SceneOptimizer::new(&scene, AdamScaledConfig::new());
        let mut grads = scene.means.val().sum().backward();
        let scene = adam.step(scene, &mut grads, &lrs());
        assert_eq!((scene.means.id, scene.sh_coeffs.id), ids);
    }

    #[test]
    fn replaced_points_keep_state_and_zero_new_rows() {
        let scene = scene(2);
        let mut adam = SceneOptimizer::new(&scene, AdamScaledConfig::new());
        let mut grads = scene.means.val().sum().backward();
        let scene = adam.step(scene, &mut grads, &lrs());

        let grown = GaussianScene::<Inner>::from_raw(
            vec![2.0; 4 * 3],
            [1.0, 0.0, 0.0, 0.0].repeat(4),
            vec![0.0; 4 * 3],
            vec![0.5; 4 * 4 * 3],
            vec![0.0; 4],
            &Default::default(),
        );
        let keep = Tensor::<Inner, 1, Int>::from_ints([1, 3], &Default::default());
        let points = grown.select_points(keep.clone());
        let means_id = scene.means.id;
        let scene = adam.replace_points(scene, points, 2, &keep);

        assert_eq!(scene.means.id, means_id);
        assert_eq!(scene.num_points(), 2);
        assert_eq!(adam.moment_rows(means_id), Some(2));
        assert_eq!(adam.steps(means_id), 1);

        let state = adam.moment_state::<2>(means_id).expect("stepped");
        let m1 = read_f32(state.moment_1);
        assert!(m1[..3].iter().all(|&m| m > 0.0), "kept row carries its moment");
        assert!(m1[3..].iter().all(|&m| m == 0.0), "new row starts from zero");

        // The new leaves have no gradient from the old graph, so nothing moves.
        let before = read_f32(scene.means.val());
        let scene = adam.step(scene, &mut grads, &lrs());
        assert_eq!(read_f32(scene.valid().means.val()), before);
    }
}
