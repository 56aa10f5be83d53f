use std::path::Path;

use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use glam::{Mat3, Vec3};
use photon_dataset::Dataset;
use photon_dataset::config::ModelConfig;
use photon_dataset::point_cloud::PointCloud;
use photon_dataset::scene::{View, ViewImage};
use photon_render::camera::Camera;
use photon_render::dense::DenseRenderer;
use photon_render::gaussian_scene::GaussianScene;
use photon_render::{PassLayout, RenderOptions, RenderOutput, RenderPass, Renderer, read_f32};

use crate::TrainError;
use crate::config::{DensifyConfig, ProcessConfig, RenderConfig, TrainConfig, ViewerConfig};
use crate::loss::psnr_from_mse;
use crate::msg::TrainMessage;
use crate::train::{IterationOutcome, LoopConfig, TrainingLoop};

type Inner = NdArray;
type DiffBackend = Autodiff<Inner>;

const IMG_SIZE: u32 = 8;

fn camera() -> Camera {
    Camera::new(Mat3::IDENTITY, Vec3::new(0.0, 0.0, 3.0), 0.9, 0.9, IMG_SIZE, IMG_SIZE)
}

/// A bright blob in the middle of a dark frame, identical in every channel.
fn gray_view(i: usize) -> View {
    let pixels = (0..IMG_SIZE * IMG_SIZE)
        .flat_map(|p| {
            let (x, y) = ((p % IMG_SIZE) as f32 - 3.5, (p / IMG_SIZE) as f32 - 3.5);
            let v = if x * x + y * y < 6.0 { 0.9 } else { 0.05 };
            [v, v, v]
        })
        .collect();
    View {
        name: format!("gray_{i}"),
        camera: camera(),
        image: ViewImage::new(IMG_SIZE, IMG_SIZE, pixels),
    }
}

fn color_view(i: usize) -> View {
    let pixels = (0..IMG_SIZE * IMG_SIZE)
        .flat_map(|p| {
            let t = p as f32 / (IMG_SIZE * IMG_SIZE) as f32;
            [t, 0.5, 1.0 - t]
        })
        .collect();
    View {
        name: format!("color_{i}"),
        camera: camera(),
        image: ViewImage::new(IMG_SIZE, IMG_SIZE, pixels),
    }
}

fn grid_cloud(count: usize) -> PointCloud {
    let side = (count as f32).cbrt().ceil() as usize;
    let positions = (0..count)
        .map(|i| {
            let (x, y, z) = (i % side, (i / side) % side, i / (side * side));
            (Vec3::new(x as f32, y as f32, z as f32) / side as f32 - 0.5) * 0.8
        })
        .collect();
    PointCloud {
        positions,
        colors: vec![Vec3::splat(0.6); count],
    }
}

fn config(model_path: &Path, iterations: u32) -> LoopConfig {
    LoopConfig {
        train: TrainConfig {
            iterations,
            ..Default::default()
        },
        densify: DensifyConfig {
            densify_until_iter: 0,
            ..Default::default()
        },
        render: RenderConfig::default(),
        process: ProcessConfig {
            test_iterations: vec![],
            save_iterations: vec![],
            checkpoint_iterations: vec![],
            ..Default::default()
        },
        viewer: ViewerConfig::default(),
        model: ModelConfig {
            sh_degree: 0,
            init_points: 0,
        },
        background: Vec3::ZERO,
        model_path: model_path.to_path_buf(),
        source_path: "memory".to_owned(),
    }
}

fn training_loop<R>(
    config: LoopConfig,
    dataset: &Dataset,
    renderer: R,
) -> TrainingLoop<DiffBackend, R>
where
    R: Renderer<DiffBackend> + Renderer<Inner>,
{
    TrainingLoop::new(config, dataset, renderer, &Default::default()).expect("loop to start")
}

/// Renders densely, then reports a second pass where every point is visible and huge.
#[derive(Clone, Default)]
struct TwoPassRenderer {
    dense: DenseRenderer,
}

impl<B: Backend> Renderer<B> for TwoPassRenderer {
    fn render(&self, camera: &Camera, scene: &GaussianScene<B>, options: &RenderOptions) -> RenderOutput<B> {
        let out = self.dense.render(camera, scene, options);
        let first = out
            .passes
            .radius_pass()
            .cloned()
            .expect("dense renders have a pass");
        let n = scene.num_points();
        let device = scene.device();
        let second = RenderPass {
            visible: Tensor::<B, 1>::ones([n], &device).greater_elem(0.5),
            radii: Tensor::ones([n], &device) * 1000.0,
        };
        RenderOutput {
            passes: PassLayout::MultiPass(vec![first, second]),
            ..out
        }
    }
}

/// Primary image at a flat 0.5, colour composite black.
#[derive(Clone, Default)]
struct SplitImageRenderer {
    dense: DenseRenderer,
}

impl<B: Backend> Renderer<B> for SplitImageRenderer {
    fn render(&self, camera: &Camera, scene: &GaussianScene<B>, options: &RenderOptions) -> RenderOutput<B> {
        let out = self.dense.render(camera, scene, options);
        RenderOutput {
            image: out.image * 0.0 + 0.5,
            image_color: out.image_color * 0.0,
            ..out
        }
    }
}

/// Reports one visibility entry too few.
#[derive(Clone, Default)]
struct ShortMaskRenderer {
    dense: DenseRenderer,
}

impl<B: Backend> Renderer<B> for ShortMaskRenderer {
    fn render(&self, camera: &Camera, scene: &GaussianScene<B>, options: &RenderOptions) -> RenderOutput<B> {
        let out = self.dense.render(camera, scene, options);
        let n = scene.num_points();
        let device = scene.device();
        RenderOutput {
            passes: PassLayout::SinglePass(RenderPass {
                visible: Tensor::<B, 1>::ones([n - 1], &device).greater_elem(0.5),
                radii: Tensor::ones([n], &device),
            }),
            ..out
        }
    }
}

#[test]
fn densifies_on_schedule_end_to_end() {
    let dir = tempfile::tempdir().expect("temp dir");
    let dataset = Dataset::from_views((0..4).map(gray_view).collect(), vec![], Some(grid_cloud(100)));

    let mut config = config(dir.path(), 100);
    config.densify = DensifyConfig {
        densify_from_iter: 10,
        densify_until_iter: 50,
        densification_interval: 10,
        ..Default::default()
    };
    let mut train = training_loop(config, &dataset, DenseRenderer::default());
    assert_eq!(train.scene().num_points(), 100);

    let mut refines = vec![];
    let mut steps = 0;
    train
        .run(&mut |msg| match msg {
            TrainMessage::RefineStep { iter, .. } => refines.push(iter),
            TrainMessage::TrainStep { .. } => steps += 1,
            _ => {}
        })
        .expect("training to finish");

    assert_eq!(refines, vec![20, 30, 40]);
    assert_eq!(steps, 100);
    let means_id = train.scene().means.id;
    assert_eq!(train.optimizer().moment_rows(means_id), Some(train.scene().num_points()));
    assert!(train.ema_loss().is_finite() && train.ema_loss() > 0.0);

    // The final iteration is always saved.
    assert!(dir.path().join("point_cloud/iteration_100/point_cloud.ply").exists());
}

#[test]
fn color_views_during_warmup_change_nothing() {
    let dir = tempfile::tempdir().expect("temp dir");
    let dataset = Dataset::from_views(vec![color_view(0)], vec![], Some(grid_cloud(20)));
    let mut train = training_loop(config(dir.path(), 100), &dataset, DenseRenderer::default());

    let means_before = read_f32(train.scene().means.val());
    let outcome = train
        .iteration(10, &mut |_| panic!("a skipped iteration reports nothing"))
        .expect("iteration");

    assert_eq!(outcome, IterationOutcome::Skipped);
    assert_eq!(train.optimizer().steps(train.scene().means.id), 0);
    assert_eq!(train.ema_loss(), 0.0);
    assert_eq!(read_f32(train.scene().means.val()), means_before);
    // The drawn view is dropped rather than put back.
    assert_eq!(train.pool_len(), 0);
}

#[test]
fn color_requeue_is_bounded_per_refill() {
    let dir = tempfile::tempdir().expect("temp dir");
    let dataset = Dataset::from_views((0..60).map(color_view).collect(), vec![], Some(grid_cloud(8)));

    let mut config = config(dir.path(), 1000);
    config.train.color_warmup_iter = 0;
    let mut train = training_loop(config, &dataset, DenseRenderer::default());

    for iter in 1..=100 {
        let outcome = train.iteration(iter, &mut |_| {}).expect("iteration");
        assert!(matches!(outcome, IterationOutcome::Trained { .. }), "colour views train");
        assert_eq!(train.pool_len(), 60, "requeued views keep the pool full");
    }
    assert_eq!(train.color_count(), 100);

    for iter in 101..=150 {
        train.iteration(iter, &mut |_| {}).expect("iteration");
    }
    assert_eq!(train.pool_len(), 10);
}

#[test]
fn zero_spread_perturbation_leaves_the_loss_unchanged() {
    let dataset = Dataset::from_views(vec![gray_view(0)], vec![], Some(grid_cloud(20)));

    let first_loss = |perturb_start_iter: u32| {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = config(dir.path(), 10);
        config.train.perturb_start_iter = perturb_start_iter;
        config.train.perturb_variance = 0.0;
        let mut train = training_loop(config, &dataset, DenseRenderer::default());
        match train.iteration(1, &mut |_| {}).expect("iteration") {
            IterationOutcome::Trained { loss, .. } => loss,
            IterationOutcome::Skipped => panic!("grayscale views are never skipped"),
        }
    };

    assert_eq!(first_loss(0), first_loss(1000));
}

#[test]
fn perturbation_raises_the_loss_once_started() {
    let dataset = Dataset::from_views(vec![gray_view(0)], vec![], Some(grid_cloud(20)));

    let first_loss = |perturb_start_iter: u32| {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = config(dir.path(), 10);
        config.train.perturb_start_iter = perturb_start_iter;
        config.train.perturb_variance = 0.5;
        let mut train = training_loop(config, &dataset, DenseRenderer::default());
        match train.iteration(1, &mut |_| {}).expect("iteration") {
            IterationOutcome::Trained { loss, .. } => loss,
            IterationOutcome::Skipped => panic!("grayscale views are never skipped"),
        }
    };

    let plain = first_loss(1000);
    let perturbed = first_loss(0);
    assert!(perturbed.is_finite(), "perturbed loss {perturbed}");
    assert!(perturbed > plain, "{perturbed} should exceed {plain}");
}

#[test]
fn progress_psnr_uses_the_primary_render_for_color_views() {
    let dir = tempfile::tempdir().expect("temp dir");
    let view = color_view(0);
    let gt = view.image.pixels().to_vec();
    let dataset = Dataset::from_views(vec![view], vec![], Some(grid_cloud(8)));
    let mut config = config(dir.path(), 1000);
    config.train.color_warmup_iter = 0;
    let mut train = training_loop(config, &dataset, SplitImageRenderer::default());

    let mut psnrs = vec![];
    train
        .iteration(100, &mut |msg| {
            if let TrainMessage::Progress { psnr, .. } = msg {
                psnrs.push(psnr);
            }
        })
        .expect("iteration");

    let mse = |render: f32| gt.iter().map(|g| (render - g).powi(2)).sum::<f32>() / gt.len() as f32;
    let (primary, composite) = (psnr_from_mse(mse(0.5)), psnr_from_mse(mse(0.0)));
    assert!((primary - composite).abs() > 0.5, "renders must be told apart");
    assert_eq!(psnrs.len(), 1, "one progress sample at iteration 100");
    assert!((psnrs[0] - primary).abs() < 1e-3, "{} vs {primary}", psnrs[0]);
}

#[test]
fn multi_pass_radii_come_from_the_first_pass() {
    let dir = tempfile::tempdir().expect("temp dir");
    let dataset = Dataset::from_views(vec![gray_view(0)], vec![], Some(grid_cloud(20)));
    let mut config = config(dir.path(), 10);
    config.densify.densify_until_iter = 10;
    config.densify.densify_from_iter = 100;
    let mut train = training_loop(config, &dataset, TwoPassRenderer::default());

    let scene = train.scene().valid();
    let expected = DenseRenderer::default().render(&camera(), &scene, &RenderOptions::default());
    let first = expected.passes.radius_pass().expect("pass");
    let expected = read_f32(first.radii.clone() * first.visible.clone().float());

    train.iteration(1, &mut |_| {}).expect("iteration");
    let max_radii = read_f32(train.density().stats().max_radii.clone());
    assert_eq!(max_radii.len(), 20);
    assert!(max_radii.iter().all(|&r| r < 1000.0), "second pass radii are ignored");
    for (r, e) in max_radii.iter().zip(&expected) {
        assert!((r - e).abs() < 1e-4, "radius {r} vs {e}");
    }
}

#[test]
fn visibility_mismatch_stops_training() {
    let dir = tempfile::tempdir().expect("temp dir");
    let dataset = Dataset::from_views(vec![gray_view(0)], vec![], Some(grid_cloud(10)));
    let mut config = config(dir.path(), 10);
    config.densify.densify_until_iter = 10;
    let mut train = training_loop(config, &dataset, ShortMaskRenderer::default());

    let err = train.iteration(1, &mut |_| {}).expect_err("mask is short");
    match err.downcast_ref::<TrainError>() {
        Some(TrainError::VisibilityShape { points, mask, radii, .. }) => {
            assert_eq!((*points, *mask, *radii), (10, 9, 10));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn checkpoint_resumes_one_before_the_end() {
    let dir = tempfile::tempdir().expect("temp dir");
    let dataset = Dataset::from_views(vec![gray_view(0)], vec![], Some(grid_cloud(10)));

    let mut first = config(dir.path(), 5);
    first.process.checkpoint_iterations = vec![5];
    let mut train = training_loop(first.clone(), &dataset, DenseRenderer::default());
    train.run(&mut |_| {}).expect("training to finish");
    let checkpoint = dir.path().join("chkpnt5.mpk");
    assert!(checkpoint.exists());

    let mut resumed = first;
    resumed.process.start_checkpoint = Some(checkpoint);
    let train = training_loop(resumed, &dataset, DenseRenderer::default());
    assert_eq!(train.first_iter(), 4);
    assert_eq!(train.scene().num_points(), 10);
}

#[test]
fn test_iterations_write_the_report() {
    let dir = tempfile::tempdir().expect("temp dir");
    let dataset = Dataset::from_views(
        (0..3).map(gray_view).collect(),
        vec![gray_view(10)],
        Some(grid_cloud(10)),
    );
    let mut config = config(dir.path(), 3);
    config.process.test_iterations = vec![2, 3];
    let mut train = training_loop(config, &dataset, DenseRenderer::default());

    let mut evals = vec![];
    let mut opacity_counts = vec![];
    train
        .run(&mut |msg| match msg {
            TrainMessage::EvalResult { iter, split, .. } => evals.push((iter, split)),
            TrainMessage::SceneStats { opacities, .. } => opacity_counts.push(opacities.len()),
            _ => {}
        })
        .expect("training to finish");

    assert_eq!(evals.len(), 4);
    assert_eq!(evals[0], (2, "test".to_owned()));
    assert_eq!(evals[1], (2, "train".to_owned()));
    assert_eq!(opacity_counts, vec![10, 10]);

    let log = std::fs::read_to_string(dir.path().join("psnr.txt")).expect("psnr log");
    assert_eq!(log.matches("NUM GAUSSIAN").count(), 2);
    assert!(dir.path().join("TEST/GT_000.png").exists());
    assert!(dir.path().join("TEST/img_3_000.png").exists());
    assert!(dir.path().join("TRAIN/img_2_004.png").exists());
}
