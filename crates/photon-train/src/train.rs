use std::path::PathBuf;

use anyhow::Context;
use burn::lr_scheduler::LrScheduler;
use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use glam::Vec3;
use photon_dataset::Dataset;
use photon_dataset::config::ModelConfig;
use photon_dataset::scene::View;
use photon_dataset::splat_export::save_scene;
use photon_render::bounding_box::BoundingBox;
use photon_render::gaussian_scene::GaussianScene;
use photon_render::sh::MAX_SH_DEGREE;
use photon_render::{PassLayout, RenderOptions, RenderPass, Renderer, read_f32};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::trace_span;
use web_time::Instant;

use crate::TrainError;
use crate::adam::{AdamScaledConfig, LearningRates, SceneOptimizer};
use crate::checkpoint::{load_checkpoint, save_checkpoint};
use crate::classify::{ImageClass, classify_image};
use crate::config::{DensifyConfig, ProcessConfig, RenderConfig, TrainConfig, ViewerConfig};
use crate::density_control::DensificationController;
use crate::eval::{EvalSplit, Evaluator, train_eval_views};
use crate::lpips::load_lpips;
use crate::loss::{LossPath, LossSelector, ViewDecision, l1_loss, l2_loss, photometric_loss, psnr_from_mse};
use crate::lr_schedule::ExponentialLr;
use crate::msg::TrainMessage;
use crate::perturb::PerturbationRegularizer;
use crate::splat_init::{create_scene_from_points, random_point_cloud};
use crate::ssim::Ssim;
use crate::view_sampler::ViewSampler;
use crate::viewer::ViewerChannel;

/// Iterations between progress samples.
const PROGRESS_EVERY: u32 = 100;
const EMA_WEIGHT: f32 = 0.4;

/// Everything a training run is configured with.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    pub train: TrainConfig,
    pub densify: DensifyConfig,
    pub render: RenderConfig,
    pub process: ProcessConfig,
    pub viewer: ViewerConfig,
    pub model: ModelConfig,
    pub background: Vec3,
    pub model_path: PathBuf,
    /// Dataset location, echoed to viewers.
    pub source_path: String,
}

/// What happened in a single iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IterationOutcome {
    /// A colour view was drawn during warm-up and dropped.
    Skipped,
    Trained { loss: f32, l1: f32 },
}

pub struct TrainingLoop<AB: AutodiffBackend, R> {
    config: LoopConfig,
    renderer: R,
    device: AB::Device,

    train_views: Vec<View>,
    eval_views: Vec<View>,
    classes: Vec<ImageClass>,

    scene: GaussianScene<AB>,
    optimizer: SceneOptimizer<AB>,
    position_lr: ExponentialLr,

    sampler: ViewSampler<View>,
    selector: LossSelector,
    perturb: PerturbationRegularizer,
    density: DensificationController<AB::InnerBackend>,
    ssim: Ssim<AB>,
    evaluator: Evaluator<AB::InnerBackend>,
    viewer: Option<ViewerChannel>,
    rng: StdRng,

    first_iter: u32,
    active_sh_degree: u32,
    ema_loss: f32,
    debug: bool,
}

fn inner_passes<AB: AutodiffBackend>(passes: &PassLayout<AB>) -> PassLayout<AB::InnerBackend> {
    let inner = |pass: &RenderPass<AB>| RenderPass {
        visible: pass.visible.clone().inner(),
        radii: pass.radii.clone().inner(),
    };
    match passes {
        PassLayout::SinglePass(pass) => PassLayout::SinglePass(inner(pass)),
        PassLayout::MultiPass(passes) => PassLayout::MultiPass(passes.iter().map(inner).collect()),
    }
}

fn to_rgb8(pixels: &[f32]) -> Vec<u8> {
    pixels
        .iter()
        .map(|p| (p.clamp(0.0, 1.0) * 255.0) as u8)
        .collect()
}

impl<AB, R> TrainingLoop<AB, R>
where
    AB: AutodiffBackend,
    R: Renderer<AB> + Renderer<AB::InnerBackend>,
{
    pub fn new(
        mut config: LoopConfig,
        dataset: &Dataset,
        renderer: R,
        device: &AB::Device,
    ) -> Result<Self, TrainError> {
        let _span = trace_span!("TrainingLoop::new").entered();

        let seed = config.process.seed;
        let mut rng = StdRng::seed_from_u64(seed);
        let iterations = config.train.iterations;
        if !config.process.save_iterations.contains(&iterations) {
            config.process.save_iterations.push(iterations);
        }

        let train_views = dataset.train.views.as_ref().clone();
        let eval_views = dataset
            .eval
            .as_ref()
            .map(|s| s.views.as_ref().clone())
            .unwrap_or_default();
        let classes: Vec<ImageClass> = train_views.iter().map(|v| classify_image(&v.image)).collect();
        let num_color = classes.iter().filter(|&&c| c == ImageClass::Color).count();
        log::info!(
            "{} training views, {num_color} colour, {} grayscale",
            classes.len(),
            classes.len() - num_color
        );

        let cloud = match &dataset.init {
            Some(cloud) if !cloud.is_empty() => cloud.clone(),
            _ => {
                log::info!("Starting from {} random points", config.model.init_points);
                random_point_cloud(config.model.init_points, &mut rng)
            }
        };
        let init_bounds = BoundingBox::from_points(cloud.positions.iter().copied())
            .unwrap_or_else(|| BoundingBox::from_min_max(Vec3::splat(-1.0), Vec3::ONE));

        let mut scene = create_scene_from_points::<AB>(&cloud, config.model.sh_degree, device);
        let mut optimizer = SceneOptimizer::new(&scene, AdamScaledConfig::new());
        let mut first_iter = 0;
        let mut active_sh_degree = 0;

        if let Some(path) = &config.process.start_checkpoint {
            let checkpoint = load_checkpoint::<AB>(path, AdamScaledConfig::new(), device)?;
            log::info!("Resuming from {path:?} at iteration {}", checkpoint.iteration);
            scene = checkpoint.scene;
            optimizer = checkpoint.optimizer;
            active_sh_degree = checkpoint.active_sh_degree;
            first_iter = checkpoint.iteration;
            if first_iter == iterations {
                first_iter = first_iter.saturating_sub(1);
            }
        }

        let norm = dataset.train.norm();
        let train = &config.train;
        let position_lr = ExponentialLr {
            lr_init: train.position_lr_init * norm.radius as f64,
            lr_final: train.position_lr_final * norm.radius as f64,
            delay_steps: train.position_lr_delay_steps,
            delay_mult: train.position_lr_delay_mult,
            max_steps: train.position_lr_max_steps,
            step: 0,
        }
        .load_record::<AB>(first_iter as usize);

        let mut evaluator = Evaluator::new(config.model_path.clone(), device);
        if let Some(path) = &config.process.lpips_weights {
            evaluator = evaluator.with_lpips(load_lpips::<AB::InnerBackend>(path, device)?);
            log::info!("Loaded LPIPS weights from {path:?}");
        }

        let viewer = if config.viewer.viewer {
            match ViewerChannel::bind(&config.viewer.ip, config.viewer.port, config.source_path.clone()) {
                Ok(channel) => Some(channel),
                Err(e) => {
                    log::warn!("Training without viewer: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            sampler: ViewSampler::new(&train_views, seed),
            selector: LossSelector::new(
                train.color_warmup_iter,
                train.color_requeue_cap,
                train.perturb_start_iter,
            ),
            perturb: PerturbationRegularizer::new(train.perturb_trials, train.perturb_variance)?,
            density: DensificationController::new(
                config.densify.clone(),
                scene.num_points(),
                norm.center,
                norm.radius,
                init_bounds,
                seed.wrapping_add(1),
                device,
            ),
            ssim: Ssim::new(11, 3, device),
            evaluator,
            position_lr,
            viewer,
            rng,
            first_iter,
            active_sh_degree,
            ema_loss: 0.0,
            debug: false,
            train_views,
            eval_views,
            classes,
            scene,
            optimizer,
            renderer,
            device: device.clone(),
            config,
        })
    }

    pub fn scene(&self) -> &GaussianScene<AB> {
        &self.scene
    }

    pub fn optimizer(&self) -> &SceneOptimizer<AB> {
        &self.optimizer
    }

    pub fn density(&self) -> &DensificationController<AB::InnerBackend> {
        &self.density
    }

    pub fn ema_loss(&self) -> f32 {
        self.ema_loss
    }

    pub fn first_iter(&self) -> u32 {
        self.first_iter
    }

    pub fn active_sh_degree(&self) -> u32 {
        self.active_sh_degree
    }

    /// Views left in the pool before the next refill.
    pub fn pool_len(&self) -> usize {
        self.sampler.len()
    }

    pub fn color_count(&self) -> u32 {
        self.selector.color_count()
    }

    /// Advances the position schedule by one iteration.
    fn learning_rates(&mut self) -> LearningRates {
        let means = self.position_lr.step();
        let train = &self.config.train;
        LearningRates {
            means,
            rotations: train.rotation_lr,
            log_scales: train.scaling_lr,
            sh_coeffs: train.feature_lr,
            raw_opacities: train.opacity_lr,
        }
    }

    fn render_options(&self, color_pass: bool) -> RenderOptions {
        let render = &self.config.render;
        RenderOptions {
            background: self.config.background,
            scaling_modifier: 1.0,
            deblur: render.deblur,
            use_pos: render.use_pos,
            lambda_s: render.lambda_s,
            lambda_p: render.lambda_p,
            max_clamp: render.max_clamp,
            color_pass,
            sh_degree: self.active_sh_degree,
            debug: self.debug,
        }
    }

    /// Runs every remaining iteration, reporting progress through `emit`.
    pub fn run(&mut self, emit: &mut impl FnMut(TrainMessage)) -> anyhow::Result<()> {
        let total = self.config.train.iterations;
        let start = Instant::now();

        for iter in self.first_iter + 1..=total {
            self.serve_viewer(iter);

            let iter_start = Instant::now();
            let IterationOutcome::Trained { loss, l1 } = self.iteration(iter, emit)? else {
                continue;
            };
            emit(TrainMessage::TrainStep {
                iter,
                total_iters: total,
                loss,
                l1,
                ema_loss: self.ema_loss,
                iter_time: iter_start.elapsed(),
                total_elapsed: start.elapsed(),
            });
        }

        emit(TrainMessage::DoneTraining);
        Ok(())
    }

    /// Answers viewer requests until it lets training continue.
    fn serve_viewer(&mut self, iter: u32) {
        let options = self.render_options(false);
        let Some(viewer) = self.viewer.as_mut() else {
            return;
        };
        let training_done = iter >= self.config.train.iterations;
        let scene = self.scene.valid();
        let renderer = &self.renderer;
        viewer.serve(training_done, |request, camera| {
            let options = RenderOptions {
                scaling_modifier: request.scaling_modifier,
                ..options.clone()
            };
            let out = Renderer::<AB::InnerBackend>::render(renderer, camera, &scene, &options);
            to_rgb8(&read_f32(out.image))
        });
    }

    /// One training iteration. Colour views drawn during warm-up are dropped before
    /// rendering and leave the loss average and optimizer untouched.
    pub fn iteration(
        &mut self,
        iter: u32,
        emit: &mut impl FnMut(TrainMessage),
    ) -> anyhow::Result<IterationOutcome> {
        let _span = trace_span!("iteration", iter).entered();

        let lrs = self.learning_rates();
        let train = &self.config.train;
        if train.sh_increase_every > 0 && iter % train.sh_increase_every == 0 {
            self.active_sh_degree = (self.active_sh_degree + 1)
                .min(self.scene.max_sh_degree())
                .min(MAX_SH_DEGREE);
        }

        if self.sampler.is_empty() {
            self.sampler.refill(&self.train_views);
            self.selector.reset();
        }
        let (view, index) = self.sampler.pop_random()?;

        let debug_from = self.config.render.debug_from;
        if debug_from >= 0 && i64::from(iter) - 1 == debug_from {
            self.debug = true;
        }

        let class = self.classes[index];
        match self.selector.decide(iter, class) {
            ViewDecision::Skip => {
                log::debug!("Skip Color Image");
                return Ok(IterationOutcome::Skipped);
            }
            ViewDecision::Train { requeue: true } => self.sampler.requeue(view.clone(), index),
            ViewDecision::Train { requeue: false } => {}
        }

        let options = self.render_options(class == ImageClass::Color);
        let out = trace_span!("render").in_scope(|| {
            Renderer::<AB>::render(&self.renderer, &view.camera, &self.scene, &options)
        });
        let gt = Tensor::<AB, 3>::from_data(view.image.to_tensor_data(), &self.device);

        let train = &self.config.train;
        let (l1, loss) = match self.selector.loss_path(iter, class) {
            LossPath::Photometric => {
                let (l1, loss) =
                    photometric_loss(out.image_color.clone(), gt.clone(), &self.ssim, train.lambda_dssim);
                (l1, loss)
            }
            LossPath::Binary { perturb } => {
                let l1 = l1_loss(out.image.clone(), gt.clone());
                let mut loss = train.loss_fn.grayscale_loss(out.image.clone(), gt.clone());
                if perturb {
                    loss = loss
                        + self.perturb.loss(
                            &self.renderer,
                            &view.camera,
                            &self.scene,
                            &options,
                            out.image.clone(),
                            out.image_color.clone(),
                            &mut self.rng,
                        );
                }
                (l1, loss)
            }
        };

        let mut grads = trace_span!("backward").in_scope(|| loss.backward());
        let loss: f32 = loss.into_scalar().elem();
        let l1: f32 = l1.into_scalar().elem();

        self.ema_loss = EMA_WEIGHT * loss + (1.0 - EMA_WEIGHT) * self.ema_loss;
        if iter % PROGRESS_EVERY == 0 {
            // Sampled on the primary render for colour views too.
            let psnr = psnr_from_mse(l2_loss(out.image.clone().detach(), gt).into_scalar().elem());
            emit(TrainMessage::Progress {
                iter,
                ema_loss: self.ema_loss,
                psnr,
                num_points: self.scene.num_points(),
            });
        }

        if self.config.process.test_iterations.contains(&iter) {
            self.training_report(iter, emit)?;
        }

        if self.config.process.save_iterations.contains(&iter) {
            log::info!("[ITER {iter}] Saving Gaussians");
            save_scene(&self.scene.valid(), &self.config.model_path, iter)
                .with_context(|| format!("Failed to save the scene at iteration {iter}"))?;
        }

        if self.density.should_update(iter) {
            let _span = trace_span!("refine").entered();

            let n = self.scene.num_points();
            let xy_grad = out
                .viewspace_points
                .grad(&grads)
                .unwrap_or_else(|| Tensor::zeros([n, 2], &self.device));
            self.density.update_stats(&inner_passes(&out.passes), xy_grad)?;

            if self.density.should_densify(iter) {
                let (scene, _) =
                    self.density
                        .densify_and_prune(self.scene.clone(), &mut self.optimizer, None);
                self.scene = scene;
                emit(TrainMessage::RefineStep {
                    iter,
                    num_points: self.scene.num_points(),
                });
            }

            if self.density.should_add_points(iter) {
                let count = self.density.target_point_count();
                self.scene = self
                    .density
                    .add_points(self.scene.clone(), &mut self.optimizer, count);
                emit(TrainMessage::RefineStep {
                    iter,
                    num_points: self.scene.num_points(),
                });
            }
        }

        if iter < self.config.train.iterations {
            let _span = trace_span!("optimizer_step").entered();
            self.scene = self.optimizer.step(self.scene.clone(), &mut grads, &lrs);
        }

        if self.config.process.checkpoint_iterations.contains(&iter) {
            log::info!("[ITER {iter}] Saving Checkpoint");
            save_checkpoint(
                &self.config.model_path,
                iter,
                self.active_sh_degree,
                &self.scene,
                &self.optimizer,
            )?;
        }

        Ok(IterationOutcome::Trained { loss, l1 })
    }

    /// Scores the test split and a few training views, writing renders and `psnr.txt`.
    pub fn training_report(
        &self,
        iter: u32,
        emit: &mut impl FnMut(TrainMessage),
    ) -> Result<(), TrainError> {
        let _span = trace_span!("training_report", iter).entered();

        let scene = self.scene.valid();
        let options = self.render_options(false);
        let write_gt = self.config.process.test_iterations.first() == Some(&iter);
        let train_views = train_eval_views(&self.train_views);

        for (split, views) in [
            (EvalSplit::Test, self.eval_views.as_slice()),
            (EvalSplit::Train, train_views.as_slice()),
        ] {
            let report =
                self.evaluator
                    .evaluate(iter, split, views, &scene, &self.renderer, &options, write_gt)?;
            if let Some(report) = report {
                emit(TrainMessage::EvalResult {
                    iter,
                    split: split.name().to_owned(),
                    l1: report.l1,
                    psnr: report.psnr,
                    ssim: report.ssim,
                    lpips: report.lpips,
                });
            }
        }

        emit(TrainMessage::SceneStats {
            iter,
            num_points: scene.num_points(),
            opacities: read_f32(scene.opacities()),
        });
        Ok(())
    }
}
