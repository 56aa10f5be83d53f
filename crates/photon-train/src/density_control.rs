//! Adaptive density control: gradient statistics, clone, split, prune and point injection.

use burn::module::AutodiffModule;
use burn::prelude::Backend;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Int, Tensor, TensorData};
use glam::{Vec3, Vec3A};
use photon_render::bounding_box::BoundingBox;
use photon_render::gaussian_scene::GaussianScene;
use photon_render::{PassLayout, read_f32};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use tracing::trace_span;

use crate::TrainError;
use crate::adam::SceneOptimizer;
use crate::config::{DensifyConfig, PointDistribution};
use crate::quat_vec::quaternion_vec_multiply;
use crate::splat_init::{BallPoint, index_tree};

/// Children created per split point.
const SPLIT_CHILDREN: usize = 2;
/// Children are this much smaller than their parent.
const SPLIT_SCALE_DIVISOR: f32 = 0.8 * SPLIT_CHILDREN as f32;
/// Upper bound on the number of points a single injection adds.
pub const MAX_ADDED_POINTS: usize = 200_000;

fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i32> = indices.iter().map(|&i| i as i32).collect();
    Tensor::from_data(TensorData::new(data, [indices.len()]), device)
}

fn concat_scenes<B: Backend>(scenes: Vec<GaussianScene<B>>) -> GaussianScene<B> {
    let cat2 = |f: fn(&GaussianScene<B>) -> Tensor<B, 2>| Tensor::cat(scenes.iter().map(f).collect(), 0);
    GaussianScene::from_tensors(
        cat2(|s| s.means.val()),
        cat2(|s| s.rotations.val()),
        cat2(|s| s.log_scales.val()),
        Tensor::cat(scenes.iter().map(|s| s.sh_coeffs.val()).collect(), 0),
        Tensor::cat(scenes.iter().map(|s| s.raw_opacities.val()).collect(), 0),
    )
}

/// Per-point running statistics gathered between refinements.
#[derive(Debug, Clone)]
pub struct DensityStats<B: Backend> {
    /// Largest screen radius seen while visible.
    pub max_radii: Tensor<B, 1>,
    grad_accum: Tensor<B, 1>,
    denom: Tensor<B, 1>,
}

impl<B: Backend> DensityStats<B> {
    pub fn new(num_points: usize, device: &B::Device) -> Self {
        Self {
            max_radii: Tensor::zeros([num_points], device),
            grad_accum: Tensor::zeros([num_points], device),
            denom: Tensor::zeros([num_points], device),
        }
    }

    pub fn num_points(&self) -> usize {
        self.max_radii.dims()[0]
    }

    /// Folds the visibility of one render and its screen-space gradient `[N, 2]` in.
    ///
    /// Every pass adds its visibility to the gradient statistics with the layout's pass
    /// weight. Only the first pass updates the max radii.
    pub fn update(&mut self, passes: &PassLayout<B>, xy_grad: Tensor<B, 2>) -> Result<(), TrainError> {
        let _span = trace_span!("DensityStats::update").entered();

        let n = self.num_points();
        for pass in passes.passes() {
            let [mask] = pass.visible.dims();
            let [radii] = pass.radii.dims();
            if mask != n || radii != n {
                let visible = read_f32(pass.visible.clone().float().sum())[0] as usize;
                return Err(TrainError::VisibilityShape {
                    points: n,
                    mask,
                    radii,
                    visible,
                });
            }
        }

        if let Some(first) = passes.radius_pass() {
            let visible = first.visible.clone().float();
            self.max_radii = self.max_radii.clone().max_pair(first.radii.clone() * visible);
        }

        let weight = passes.pass_weight();
        let grad_norm = xy_grad.powi_scalar(2).sum_dim(1).sqrt().reshape([n]);
        for pass in passes.passes() {
            let visible = pass.visible.clone().float() * weight;
            self.grad_accum = self.grad_accum.clone() + grad_norm.clone() * visible.clone();
            self.denom = self.denom.clone() + visible;
        }
        Ok(())
    }

    /// Mean screen-space gradient of every point. Points never seen get zero.
    pub fn mean_grads(&self) -> Tensor<B, 1> {
        self.grad_accum.clone() / self.denom.clone().clamp_min(1e-12)
    }
}

/// Counts of a single refinement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefineStats {
    pub cloned: usize,
    pub split: usize,
    pub pruned: usize,
}

pub struct DensificationController<B: Backend> {
    config: DensifyConfig,
    stats: DensityStats<B>,
    center: Vec3,
    extent: f32,
    init_bounds: BoundingBox,
    rng: StdRng,
}

impl<B: Backend> DensificationController<B> {
    /// `center` and `extent` describe the camera sphere, `init_bounds` the initial points.
    pub fn new(
        config: DensifyConfig,
        num_points: usize,
        center: Vec3,
        extent: f32,
        init_bounds: BoundingBox,
        seed: u64,
        device: &B::Device,
    ) -> Self {
        Self {
            config,
            stats: DensityStats::new(num_points, device),
            center,
            extent,
            init_bounds,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn stats(&self) -> &DensityStats<B> {
        &self.stats
    }

    pub fn extent(&self) -> f32 {
        self.extent
    }

    pub fn should_update(&self, iter: u32) -> bool {
        iter < self.config.densify_until_iter
    }

    pub fn should_densify(&self, iter: u32) -> bool {
        self.should_update(iter)
            && iter > self.config.densify_from_iter
            && self.config.densification_interval > 0
            && iter % self.config.densification_interval == 0
    }

    pub fn should_add_points(&self, iter: u32) -> bool {
        self.should_update(iter) && self.config.pts_iter == Some(iter)
    }

    pub fn update_stats(&mut self, passes: &PassLayout<B>, xy_grad: Tensor<B, 2>) -> Result<(), TrainError> {
        self.stats.update(passes, xy_grad)
    }

    /// Number of points an injection adds: the initial volume at the configured spacing,
    /// or the configured count when no spacing is set.
    pub fn target_point_count(&self) -> usize {
        if self.config.pts_rate > 0.0 {
            let count = self.init_bounds.volume() / self.config.pts_rate.powi(3);
            (count as usize).min(MAX_ADDED_POINTS)
        } else {
            self.config.pts_n_pts
        }
    }

    fn reset_stats(&mut self, num_points: usize, device: &B::Device) {
        self.stats = DensityStats::new(num_points, device);
    }

    /// Clones small and splits large points with a high mean gradient, then prunes
    /// transparent and out-of-range points. Optimizer state is reindexed alongside.
    pub fn densify_and_prune<AB: AutodiffBackend<InnerBackend = B>>(
        &mut self,
        scene: GaussianScene<AB>,
        optimizer: &mut SceneOptimizer<AB>,
        size_threshold: Option<f32>,
    ) -> (GaussianScene<AB>, RefineStats) {
        let _span = trace_span!("densify_and_prune").entered();

        let current = scene.valid();
        let device = current.device();
        let n = current.num_points();
        assert_eq!(self.stats.num_points(), n, "Density stats must match the scene");

        let mut grads = self.stats.mean_grads();
        if self.config.densify_with_depth && n > 0 {
            let center = Tensor::<B, 1>::from_data(
                TensorData::new(self.center.to_array().to_vec(), [3]),
                &device,
            );
            let dist = (current.means.val() - center.unsqueeze_dim(0))
                .powi_scalar(2)
                .sum_dim(1)
                .sqrt()
                .reshape([n]);
            grads = grads * (dist / self.extent).clamp_min(1.0);
        }

        let grads = read_f32(grads);
        let max_scales = read_f32(current.max_scales());
        let dense_limit = self.config.percent_dense * self.extent;

        let (mut clone_idx, mut split_idx) = (vec![], vec![]);
        for (i, (&grad, &scale)) in grads.iter().zip(&max_scales).enumerate() {
            if grad >= self.config.densify_grad_threshold {
                if scale <= dense_limit {
                    clone_idx.push(i);
                } else {
                    split_idx.push(i);
                }
            }
        }

        let clones = (!clone_idx.is_empty())
            .then(|| current.select_points(index_tensor(&clone_idx, &device)));
        let children = (!split_idx.is_empty()).then(|| self.split_children(&current, &split_idx));
        let full = if clones.is_none() && children.is_none() {
            current
        } else {
            concat_scenes([Some(current), clones, children].into_iter().flatten().collect())
        };
        let n_full = full.num_points();
        let appended = n_full - n;

        let opacities = read_f32(full.opacities());
        let full_scales = read_f32(full.max_scales());
        let radii = read_f32(self.stats.max_radii.clone());
        let (min_scale, max_scale) = (
            self.config.prune_range_min * self.extent,
            self.config.prune_range_max * self.extent,
        );

        let mut removed = vec![false; n_full];
        for &i in &split_idx {
            removed[i] = true;
        }
        let mut pruned = 0;
        for i in 0..n_full {
            // New points have not been rendered yet and count as radius zero.
            let radius = radii.get(i).copied().unwrap_or(0.0);
            let prune = opacities[i] < self.config.densify_prune_threshold
                || full_scales[i] < min_scale
                || full_scales[i] > max_scale
                || size_threshold.is_some_and(|t| radius > t);
            if prune && !removed[i] {
                pruned += 1;
            }
            removed[i] |= prune;
        }

        let keep: Vec<usize> = (0..n_full).filter(|&i| !removed[i]).collect();
        let keep = index_tensor::<B>(&keep, &device);
        let refined = full.select_points(keep.clone());
        let num_points = refined.num_points();
        let scene = optimizer.replace_points(scene, refined, appended, &keep);
        self.reset_stats(num_points, &device);

        let stats = RefineStats {
            cloned: clone_idx.len(),
            split: split_idx.len(),
            pruned,
        };
        log::debug!(
            "Refine: {} cloned, {} split, {} pruned, {} points",
            stats.cloned,
            stats.split,
            stats.pruned,
            num_points
        );
        (scene, stats)
    }

    /// Children of the points at `parents`, sampled from their Gaussians.
    fn split_children(&mut self, scene: &GaussianScene<B>, parents: &[usize]) -> GaussianScene<B> {
        let device = scene.device();
        let repeated: Vec<usize> = (0..SPLIT_CHILDREN).flat_map(|_| parents.iter().copied()).collect();
        let count = repeated.len();
        let source = scene.select_points(index_tensor(&repeated, &device));

        let samples: Vec<f32> = (0..count * 3)
            .map(|_| StandardNormal.sample(&mut self.rng))
            .collect();
        let samples = Tensor::<B, 2>::from_data(TensorData::new(samples, [count, 3]), &device);
        let offsets = quaternion_vec_multiply(source.rotations_normed(), samples * source.scales());

        GaussianScene::from_tensors(
            source.means.val() + offsets,
            source.rotations.val(),
            source.log_scales.val() - SPLIT_SCALE_DIVISOR.ln(),
            source.sh_coeffs.val(),
            source.raw_opacities.val(),
        )
    }

    /// Injects `count` points inside the initial bounds grown by the configured margin.
    ///
    /// Every new point interpolates scale, colour and opacity from its nearest existing
    /// points weighted by inverse distance, and takes the rotation of the closest one.
    pub fn add_points<AB: AutodiffBackend<InnerBackend = B>>(
        &mut self,
        scene: GaussianScene<AB>,
        optimizer: &mut SceneOptimizer<AB>,
        count: usize,
    ) -> GaussianScene<AB> {
        let _span = trace_span!("add_points").entered();

        log::info!("Allocate {count} points");

        let current = scene.valid();
        let device = current.device();
        let n = current.num_points();
        if n == 0 || count == 0 {
            return scene;
        }

        let positions = self.sample_positions(count);

        let [_, n_coeffs, _] = current.sh_coeffs.dims();
        let means: Vec<Vec3> = read_f32(current.means.val())
            .chunks_exact(3)
            .map(Vec3::from_slice)
            .collect();
        let rotations = read_f32(current.rotations.val());
        let log_scales = read_f32(current.log_scales.val());
        let sh_coeffs = read_f32(current.sh_coeffs.val());
        let raw_opacities = read_f32(current.raw_opacities.val());

        let neighbours = self.config.pts_n_intpl.max(1);
        let tree = index_tree(&means);
        let attributes: Vec<(usize, Vec<(usize, f32)>)> = positions
            .par_iter()
            .map_with(tree.query(), |query, p| {
                let nearest: Vec<(usize, f32)> = query
                    .nn(&BallPoint(Vec3A::from(*p)))
                    .take(neighbours)
                    .map(|(_, dist, &idx)| (idx, 1.0 / (dist as f32 + 1e-8)))
                    .collect();
                let total: f32 = nearest.iter().map(|(_, w)| w).sum();
                let weights = nearest.iter().map(|&(idx, w)| (idx, w / total)).collect();
                (nearest[0].0, weights)
            })
            .collect();

        let blend = |values: &[f32], width: usize, weights: &[(usize, f32)]| {
            let mut out = vec![0.0; width];
            for &(idx, w) in weights {
                for (o, v) in out.iter_mut().zip(&values[idx * width..(idx + 1) * width]) {
                    *o += w * v;
                }
            }
            out
        };

        let mut new_rotations = Vec::with_capacity(count * 4);
        let mut new_scales = Vec::with_capacity(count * 3);
        let mut new_sh = Vec::with_capacity(count * n_coeffs * 3);
        let mut new_opacities = Vec::with_capacity(count);
        for (closest, weights) in &attributes {
            new_rotations.extend_from_slice(&rotations[closest * 4..closest * 4 + 4]);
            new_scales.extend(blend(&log_scales, 3, weights));
            new_sh.extend(blend(&sh_coeffs, n_coeffs * 3, weights));
            new_opacities.extend(blend(&raw_opacities, 1, weights));
        }

        let added = GaussianScene::<B>::from_tensors(
            Tensor::from_data(
                TensorData::new(positions.iter().flat_map(|p| p.to_array()).collect(), [count, 3]),
                &device,
            ),
            Tensor::from_data(TensorData::new(new_rotations, [count, 4]), &device),
            Tensor::from_data(TensorData::new(new_scales, [count, 3]), &device),
            Tensor::from_data(TensorData::new(new_sh, [count, n_coeffs, 3]), &device),
            Tensor::from_data(TensorData::new(new_opacities, [count]), &device),
        );

        let grown = concat_scenes(vec![current, added]);
        let keep: Vec<usize> = (0..n + count).collect();
        self.reset_stats(grown.num_points(), &device);
        optimizer.replace_points(scene, grown, count, &index_tensor(&keep, &device))
    }

    fn sample_positions(&mut self, count: usize) -> Vec<Vec3> {
        let bounds = BoundingBox {
            center: self.init_bounds.center,
            extent: self.init_bounds.extent + Vec3::splat(self.config.pts_add_bound),
        };
        let (min, max) = (bounds.min(), bounds.max());

        match self.config.pts_dist {
            PointDistribution::Uniform => (0..count)
                .map(|_| {
                    let t = Vec3::new(self.rng.random(), self.rng.random(), self.rng.random());
                    min + (max - min) * t
                })
                .collect(),
            // Half the extent as standard deviation, clamped to the box.
            PointDistribution::Normal => (0..count)
                .map(|_| {
                    let t: [f32; 3] = std::array::from_fn(|_| StandardNormal.sample(&mut self.rng));
                    (bounds.center + bounds.extent * Vec3::from(t) * 0.5).clamp(min, max)
                })
                .collect(),
        }
    }
}
