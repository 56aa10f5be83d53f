use std::f64::consts::SQRT_2;
use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Initializer, PaddingConfig2d, Relu};
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Recorder};
use burn::tensor::{Device, Tensor};
use tracing::trace_span;

use crate::TrainError;

/// Smallest side an image needs to survive the five pooling stages.
pub const LPIPS_MIN_SIZE: u32 = 32;

#[derive(Module, Debug)]
struct ConvRelu<B: Backend> {
    conv: Conv2d<B>,
    relu: Relu,
}

impl<B: Backend> ConvRelu<B> {
    fn new(in_channels: usize, out_channels: usize, device: &Device<B>) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .with_initializer(Initializer::KaimingNormal {
                gain: SQRT_2,
                fan_out_only: true,
            })
            .init(device);
        Self {
            conv,
            relu: Relu::new(),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.relu.forward(self.conv.forward(input))
    }
}

#[derive(Config, Debug)]
struct VggBlockConfig {
    num_convs: usize,
    in_channels: usize,
    out_channels: usize,
}

impl VggBlockConfig {
    fn init<B: Backend>(&self, device: &Device<B>) -> VggBlock<B> {
        let convs = (0..self.num_convs)
            .map(|i| {
                let in_channels = if i == 0 {
                    self.in_channels
                } else {
                    self.out_channels
                };
                ConvRelu::new(in_channels, self.out_channels, device)
            })
            .collect();

        VggBlock {
            convs,
            max_pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }
}

/// Convolutions at one resolution, then a 2x downsample.
#[derive(Module, Debug)]
struct VggBlock<B: Backend> {
    convs: Vec<ConvRelu<B>>,
    max_pool: MaxPool2d,
}

impl<B: Backend> VggBlock<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let cur = self
            .convs
            .iter()
            .fold(input, |cur, conv| conv.forward(cur));
        self.max_pool.forward(cur)
    }
}

#[derive(Config, Debug)]
pub struct LpipsModelConfig {}

impl LpipsModelConfig {
    /// The VGG16 feature stack with freshly initialised weights.
    pub fn init<B: Backend>(&self, device: &B::Device) -> LpipsModel<B> {
        let blocks = [(2, 3, 64), (2, 64, 128), (3, 128, 256), (3, 256, 512), (3, 512, 512)]
            .into_iter()
            .map(|(num_convs, in_channels, out_channels)| {
                VggBlockConfig::new(num_convs, in_channels, out_channels).init(device)
            })
            .collect();
        LpipsModel { blocks }
    }
}

/// Perceptual distance from VGG feature activations.
#[derive(Module, Debug)]
pub struct LpipsModel<B: Backend> {
    blocks: Vec<VggBlock<B>>,
}

impl<B: Backend> LpipsModel<B> {
    /// Output of every block, shallowest first.
    pub fn forward(&self, imgs: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut cur = imgs;
        let mut features = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            cur = block.forward(cur);
            features.push(cur.clone());
        }
        features
    }

    /// Distance between two NCHW batches with values in `[0, 1]`.
    pub fn lpips(&self, imgs_a: Tensor<B, 4>, imgs_b: Tensor<B, 4>) -> Tensor<B, 1> {
        let features_a = self.forward(imgs_a * 2.0 - 1.0);
        let features_b = self.forward(imgs_b * 2.0 - 1.0);

        let per_block = features_a
            .into_iter()
            .zip(features_b)
            .map(|(a, b)| (a - b).powi_scalar(2).mean())
            .collect();
        Tensor::cat(per_block, 0).sum()
    }

    /// Distance between two `[H, W, 3]` images.
    pub fn lpips_hwc(&self, img_a: Tensor<B, 3>, img_b: Tensor<B, 3>) -> Tensor<B, 1> {
        let to_nchw = |img: Tensor<B, 3>| img.permute([2, 0, 1]).unsqueeze::<4>();
        self.lpips(to_nchw(img_a), to_nchw(img_b))
    }
}

// The recorder appends its own `.mpk.gz` after replacing the last extension.
fn recorder_path(path: &Path) -> PathBuf {
    path.to_str()
        .and_then(|p| p.strip_suffix(".gz"))
        .map_or_else(|| path.to_path_buf(), PathBuf::from)
}

/// Loads VGG weights stored as a named msgpack record, e.g. `vgg_lpips.mpk.gz`.
pub fn load_lpips<B: Backend>(path: &Path, device: &B::Device) -> Result<LpipsModel<B>, TrainError> {
    let _span = trace_span!("load_lpips").entered();

    let record = NamedMpkGzFileRecorder::<FullPrecisionSettings>::new()
        .load(recorder_path(path), device)
        .map_err(|e| TrainError::LpipsWeights {
            path: path.to_path_buf(),
            reason: format!("{e:?}"),
        })?;
    Ok(LpipsModelConfig::new().init::<B>(device).load_record(record))
}
