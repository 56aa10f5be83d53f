use clap::Args;
use photon_train::msg::TrainMessage;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RerunConfig {
    /// Whether to enable rerun.io logging for this run.
    #[arg(long, help_heading = "Rerun options", default_value = "false")]
    pub rerun_enabled: bool,
    /// How often to log the training losses.
    #[arg(long, help_heading = "Rerun options", default_value = "50")]
    pub rerun_log_train_stats_every: u32,
}

/// Number of buckets of the opacity histogram.
pub const OPACITY_BINS: usize = 20;

/// Counts opacities in `bins` equal buckets over `[0, 1]`.
pub fn opacity_histogram(opacities: &[f32], bins: usize) -> Vec<u64> {
    let mut counts = vec![0; bins];
    if bins == 0 {
        return counts;
    }
    for &o in opacities {
        let bin = ((o.clamp(0.0, 1.0) * bins as f32) as usize).min(bins - 1);
        counts[bin] += 1;
    }
    counts
}

/// Forwards training messages to a rerun recording.
pub struct MetricsSink {
    #[cfg(feature = "rerun")]
    rec: rerun::RecordingStream,
    #[cfg(feature = "rerun")]
    log_every: u32,
}

impl MetricsSink {
    pub fn new(config: &RerunConfig) -> anyhow::Result<Self> {
        #[cfg(feature = "rerun")]
        {
            let rec = if config.rerun_enabled {
                rerun::RecordingStreamBuilder::new("photon").spawn()?
            } else {
                rerun::RecordingStream::disabled()
            };
            Ok(Self {
                rec,
                log_every: config.rerun_log_train_stats_every.max(1),
            })
        }

        #[cfg(not(feature = "rerun"))]
        {
            if config.rerun_enabled {
                log::warn!("Built without rerun support, metrics stay on the console");
            }
            Ok(Self {})
        }
    }

    pub fn record(&self, msg: &TrainMessage) -> anyhow::Result<()> {
        #[cfg(feature = "rerun")]
        self.record_rerun(msg)?;
        #[cfg(not(feature = "rerun"))]
        let _ = msg;
        Ok(())
    }

    #[cfg(feature = "rerun")]
    fn record_rerun(&self, msg: &TrainMessage) -> anyhow::Result<()> {
        if !self.rec.is_enabled() {
            return Ok(());
        }

        let scalar = |path: &str, value: f32| {
            self.rec
                .log(path, &rerun::Scalars::new(vec![f64::from(value)]))
        };

        match msg {
            TrainMessage::TrainStep {
                iter,
                loss,
                l1,
                iter_time,
                ..
            } => {
                if iter % self.log_every == 0 {
                    self.rec.set_time_sequence("iterations", *iter);
                    scalar("train_loss_patches/l1_loss", *l1)?;
                    scalar("train_loss_patches/total_loss", *loss)?;
                    scalar("iter_time", iter_time.as_secs_f32() * 1000.0)?;
                }
            }
            TrainMessage::Progress { iter, psnr, .. } => {
                self.rec.set_time_sequence("iterations", *iter);
                scalar("train/psnr", *psnr)?;
            }
            TrainMessage::RefineStep { iter, num_points } => {
                self.rec.set_time_sequence("iterations", *iter);
                scalar("total_points", *num_points as f32)?;
            }
            TrainMessage::EvalResult {
                iter,
                split,
                l1,
                psnr,
                ssim,
                lpips,
            } => {
                self.rec.set_time_sequence("iterations", *iter);
                scalar(&format!("{split}/loss_viewpoint/l1_loss"), *l1)?;
                scalar(&format!("{split}/loss_viewpoint/psnr"), *psnr)?;
                scalar(&format!("{split}/loss_viewpoint/ssim"), *ssim)?;
                if let Some(lpips) = lpips {
                    scalar(&format!("{split}/loss_viewpoint/lpips"), *lpips)?;
                }
            }
            TrainMessage::SceneStats {
                iter,
                num_points,
                opacities,
            } => {
                self.rec.set_time_sequence("iterations", *iter);
                scalar("total_points", *num_points as f32)?;
                let counts = opacity_histogram(opacities, OPACITY_BINS);
                self.rec.log(
                    "scene/opacity_histogram",
                    &rerun::BarChart::new(counts.as_slice()),
                )?;
            }
            TrainMessage::DoneTraining => {}
        }
        Ok(())
    }
}
