use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Once;

use burn::prelude::Backend;
use burn::tensor::{ElementConversion, Tensor};
use photon_dataset::scene::View;
use photon_render::gaussian_scene::GaussianScene;
use photon_render::{RenderOptions, Renderer, read_f32};
use tracing::trace_span;

use crate::TrainError;
use crate::loss::{l1_loss, l2_loss, psnr_from_mse};
use crate::lpips::{LPIPS_MIN_SIZE, LpipsModel};
use crate::ssim::Ssim;

/// Training views scored alongside the test split, modulo the number of views.
pub const TRAIN_EVAL_INDICES: [usize; 5] = [5, 10, 15, 20, 25];

/// Which views a report covers and where their renders go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalSplit {
    Test,
    Train,
}

impl EvalSplit {
    pub fn name(self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Train => "train",
        }
    }

    pub fn folder(self) -> &'static str {
        match self {
            Self::Test => "TEST",
            Self::Train => "TRAIN",
        }
    }
}

/// Averaged metrics of one split.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    pub split: EvalSplit,
    pub num_views: usize,
    pub l1: f32,
    pub psnr: f32,
    pub ssim: f32,
    /// Averaged over the views large enough to measure. `None` without weights.
    pub lpips: Option<f32>,
}

/// The training views scored at every test iteration.
pub fn train_eval_views(train: &[View]) -> Vec<View> {
    if train.is_empty() {
        return vec![];
    }
    TRAIN_EVAL_INDICES
        .iter()
        .map(|idx| train[idx % train.len()].clone())
        .collect()
}

fn save_png(path: &Path, width: u32, height: u32, pixels: &[f32]) -> Result<(), TrainError> {
    let bytes: Vec<u8> = pixels
        .iter()
        .map(|p| (p.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();
    let img = image::RgbImage::from_raw(width, height, bytes).ok_or_else(|| TrainError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::other("image buffer does not match its size"),
    })?;
    img.save(path).map_err(|source| TrainError::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Renders held out views, writes them next to the model and appends scores to `psnr.txt`.
pub struct Evaluator<B: Backend> {
    model_path: PathBuf,
    ssim: Ssim<B>,
    lpips: Option<LpipsModel<B>>,
    lpips_missing: Once,
}

impl<B: Backend> Evaluator<B> {
    pub fn new(model_path: PathBuf, device: &B::Device) -> Self {
        Self {
            model_path,
            ssim: Ssim::new(11, 3, device),
            lpips: None,
            lpips_missing: Once::new(),
        }
    }

    pub fn with_lpips(mut self, model: LpipsModel<B>) -> Self {
        self.lpips = Some(model);
        self
    }

    pub fn log_path(&self) -> PathBuf {
        self.model_path.join("psnr.txt")
    }

    fn append_log(&self, line: &str) -> Result<(), TrainError> {
        let path = self.log_path();
        let io_err = |source| TrainError::Io {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        writeln!(file, "{line}").map_err(io_err)
    }

    /// Scores `views` and returns `None` when there is nothing to score.
    ///
    /// `write_gt` also stores the ground truth images, which only needs to happen once.
    pub fn evaluate<R: Renderer<B>>(
        &self,
        iter: u32,
        split: EvalSplit,
        views: &[View],
        scene: &GaussianScene<B>,
        renderer: &R,
        options: &RenderOptions,
        write_gt: bool,
    ) -> Result<Option<EvalReport>, TrainError> {
        let _span = trace_span!("Evaluator::evaluate", split = split.name()).entered();

        if views.is_empty() {
            return Ok(None);
        }

        let device = scene.device();
        let folder = self.model_path.join(split.folder());
        std::fs::create_dir_all(&folder).map_err(|source| TrainError::Io {
            path: folder.clone(),
            source,
        })?;

        if split == EvalSplit::Test {
            self.append_log(&format!(
                "[ITER {iter}] NUM GAUSSIAN: {}",
                scene.num_points()
            ))?;
        }

        if self.lpips.is_none() {
            self.lpips_missing
                .call_once(|| log::info!("No LPIPS weights given, evaluating without LPIPS"));
        }

        let (mut l1_sum, mut psnr_sum, mut ssim_sum) = (0.0, 0.0, 0.0);
        let (mut lpips_sum, mut lpips_count) = (0.0, 0usize);
        for (idx, view) in views.iter().enumerate() {
            let out = renderer.render(&view.camera, scene, options);
            let image = out.image.clamp(0.0, 1.0);
            let gt = Tensor::<B, 3>::from_data(view.image.to_tensor_data(), &device).clamp(0.0, 1.0);

            l1_sum += l1_loss(image.clone(), gt.clone()).into_scalar().elem::<f32>();
            psnr_sum += psnr_from_mse(l2_loss(image.clone(), gt.clone()).into_scalar().elem::<f32>());
            ssim_sum += self.ssim.ssim(image.clone(), gt.clone()).mean().into_scalar().elem::<f32>();

            let (w, h) = (view.camera.width, view.camera.height);
            if let Some(model) = &self.lpips {
                if w.min(h) >= LPIPS_MIN_SIZE {
                    lpips_sum += model.lpips_hwc(image.clone(), gt).into_scalar().elem::<f32>();
                    lpips_count += 1;
                } else {
                    log::warn!("{} is {w}x{h}, too small for LPIPS", view.name);
                }
            }
            save_png(
                &folder.join(format!("img_{iter}_{idx:03}.png")),
                w,
                h,
                &read_f32(image),
            )?;
            if write_gt {
                save_png(&folder.join(format!("GT_{idx:03}.png")), w, h, view.image.pixels())?;
            }
        }

        let count = views.len() as f32;
        let report = EvalReport {
            split,
            num_views: views.len(),
            l1: l1_sum / count,
            psnr: psnr_sum / count,
            ssim: ssim_sum / count,
            lpips: (lpips_count > 0).then(|| lpips_sum / lpips_count as f32),
        };

        let name = split.name();
        let scores = format!(
            "[ITER {iter}] Evaluating {name}: L1 {} PSNR {}",
            report.l1, report.psnr
        );
        log::info!("{scores}");
        self.append_log(&scores)?;
        let ssim = report.ssim;
        let perceptual = match report.lpips {
            Some(lpips) => format!("[ITER {iter}] Evaluating {name}: SSIM {ssim:.4} LPIPS {lpips:.4}"),
            None => format!("[ITER {iter}] Evaluating {name}: SSIM {ssim:.4}"),
        };
        self.append_log(&perceptual)?;

        Ok(Some(report))
    }
}
