use std::f64::consts::FRAC_PI_2;

use burn::LearningRate;
use burn::lr_scheduler::LrScheduler;
use burn::prelude::Backend;

/// Log-linear decay from `lr_init` to `lr_final` over `max_steps`, held at `lr_final`
/// afterwards.
///
/// With `delay_steps > 0` the rate is additionally eased in from `delay_mult * lr` along
/// a quarter sine wave.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialLr {
    pub lr_init: f64,
    pub lr_final: f64,
    pub delay_steps: u32,
    pub delay_mult: f64,
    pub max_steps: u32,
    /// Steps taken so far.
    pub step: usize,
}

impl ExponentialLr {
    pub fn at(&self, step: usize) -> LearningRate {
        if self.lr_init == 0.0 && self.lr_final == 0.0 {
            return 0.0;
        }

        let delay_rate = if self.delay_steps > 0 {
            let t = (step as f64 / f64::from(self.delay_steps)).clamp(0.0, 1.0);
            self.delay_mult + (1.0 - self.delay_mult) * (FRAC_PI_2 * t).sin()
        } else {
            1.0
        };

        let t = (step as f64 / f64::from(self.max_steps.max(1))).clamp(0.0, 1.0);
        let log_lerp = (self.lr_init.ln() * (1.0 - t) + self.lr_final.ln() * t).exp();
        delay_rate * log_lerp
    }
}

impl LrScheduler for ExponentialLr {
    type Record<B: Backend> = usize;

    /// The rate of the next step. The first call returns the rate of step 1.
    fn step(&mut self) -> LearningRate {
        self.step += 1;
        self.at(self.step)
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.step
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.step = record;
        self
    }
}
