use web_time::Duration;

/// Events the training loop reports to its caller.
#[derive(Debug, Clone)]
pub enum TrainMessage {
    /// An iteration finished its optimizer step.
    TrainStep {
        iter: u32,
        total_iters: u32,
        loss: f32,
        l1: f32,
        ema_loss: f32,
        iter_time: Duration,
        total_elapsed: Duration,
    },
    /// Periodic progress sample for display.
    Progress {
        iter: u32,
        ema_loss: f32,
        psnr: f32,
        num_points: usize,
    },
    /// Points were densified, pruned or injected.
    RefineStep { iter: u32, num_points: usize },
    /// Averaged metrics of one evaluation split.
    EvalResult {
        iter: u32,
        split: String,
        l1: f32,
        psnr: f32,
        ssim: f32,
        /// Only measured when LPIPS weights were given.
        lpips: Option<f32>,
    },
    /// Scene summary sent alongside the test report.
    SceneStats {
        iter: u32,
        num_points: usize,
        opacities: Vec<f32>,
    },
    DoneTraining,
}
