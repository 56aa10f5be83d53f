use std::time::Duration;

use env_logger::{Env, Target};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use photon_train::msg::TrainMessage;

/// Iterations between updates of the loss shown next to the bar.
const POSTFIX_EVERY: u32 = 10;

/// Routes `log` through `env_logger` on stdout without tearing the progress bars.
pub fn init_logging(multi: &MultiProgress, quiet: bool) -> anyhow::Result<()> {
    let filter = if quiet { "warn" } else { "info" };
    let logger = env_logger::Builder::from_env(Env::default().default_filter_or(filter))
        .target(Target::Stdout)
        .build();
    let level = logger.filter();
    LogWrapper::new(multi.clone(), logger).try_init()?;
    log::set_max_level(level);
    Ok(())
}

/// Console view of a training run.
pub struct ProgressReporter {
    multi: MultiProgress,
    bar: ProgressBar,
    num_points: usize,
    elapsed: Duration,
}

impl ProgressReporter {
    pub fn new(multi: &MultiProgress, total_iters: u32, first_iter: u32, num_points: usize) -> Self {
        let bar = ProgressBar::new(u64::from(total_iters))
            .with_style(
                ProgressStyle::with_template(
                    "[{elapsed}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg} ({per_sec}, {eta} remaining)",
                )
                .expect("Invalid indicatif config")
                .progress_chars("◍○○"),
            )
            .with_message("Training progress")
            .with_position(u64::from(first_iter));
        Self {
            bar: multi.add(bar),
            multi: multi.clone(),
            num_points,
            elapsed: Duration::ZERO,
        }
    }

    /// Total training time seen so far.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Updates the bar and prints evaluation results above it.
    pub fn handle(&mut self, msg: &TrainMessage) -> std::io::Result<()> {
        match msg {
            TrainMessage::TrainStep {
                iter,
                ema_loss,
                total_elapsed,
                ..
            } => {
                self.elapsed = *total_elapsed;
                if iter % POSTFIX_EVERY == 0 {
                    self.bar.set_message(format!(
                        "Loss {ema_loss:.7} Num Points {}",
                        self.num_points
                    ));
                }
                self.bar.set_position(u64::from(*iter));
            }
            TrainMessage::Progress { num_points, .. }
            | TrainMessage::RefineStep { num_points, .. }
            | TrainMessage::SceneStats { num_points, .. } => {
                self.num_points = *num_points;
            }
            TrainMessage::EvalResult {
                iter,
                split,
                l1,
                psnr,
                ssim,
                lpips,
            } => {
                let mut line = format!("[ITER {iter}] {split}: L1 {l1:.5} PSNR {psnr:.3} SSIM {ssim:.4}");
                if let Some(lpips) = lpips {
                    line.push_str(&format!(" LPIPS {lpips:.4}"));
                }
                self.multi.println(line)?;
            }
            TrainMessage::DoneTraining => {
                self.bar.finish_with_message(format!("Done, {} points", self.num_points));
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        let elapsed = Duration::from_secs(self.elapsed.as_secs());
        format!("Training took {}", humantime::format_duration(elapsed))
    }

    pub fn print_summary(&self) -> std::io::Result<()> {
        self.multi.println(self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indicatif::ProgressDrawTarget;

    fn reporter() -> ProgressReporter {
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::hidden());
        ProgressReporter::new(&multi, 100, 0, 4)
    }

    fn step(iter: u32, secs: u64) -> TrainMessage {
        TrainMessage::TrainStep {
            iter,
            total_iters: 100,
            loss: 0.5,
            l1: 0.4,
            ema_loss: 0.5,
            iter_time: Duration::from_millis(10),
            total_elapsed: Duration::from_secs(secs),
        }
    }

    #[test]
    fn evaluation_lines_are_printed() {
        let mut progress = reporter();
        for lpips in [None, Some(0.25)] {
            progress
                .handle(&TrainMessage::EvalResult {
                    iter: 10,
                    split: "test".to_owned(),
                    l1: 0.1,
                    psnr: 20.0,
                    ssim: 0.9,
                    lpips,
                })
                .expect("print eval result");
        }
    }

    #[test]
    fn summary_reports_whole_seconds() {
        let mut progress = reporter();
        progress.handle(&step(10, 65)).expect("train step");
        progress
            .handle(&TrainMessage::RefineStep {
                iter: 10,
                num_points: 9,
            })
            .expect("refine step");
        progress.handle(&TrainMessage::DoneTraining).expect("done");

        assert_eq!(progress.elapsed(), Duration::from_secs(65));
        assert_eq!(progress.summary(), "Training took 1m 5s");
        progress.print_summary().expect("print summary");
    }
}
