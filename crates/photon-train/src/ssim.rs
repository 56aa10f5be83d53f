use burn::prelude::Backend;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{Tensor, TensorData};

const C1: f32 = 0.01 * 0.01;
const C2: f32 = 0.03 * 0.03;

/// Structural similarity with a separable Gaussian window.
#[derive(Debug, Clone)]
pub struct Ssim<B: Backend> {
    weights_h: Tensor<B, 4>,
    weights_v: Tensor<B, 4>,
    channels: usize,
    window_size: usize,
}

fn gaussian_window(size: usize, sigma: f32) -> Vec<f32> {
    let center = (size / 2) as f32;
    let taps: Vec<f32> = (0..size)
        .map(|x| (-(x as f32 - center).powi(2) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = taps.iter().sum();
    taps.into_iter().map(|t| t / sum).collect()
}

impl<B: Backend> Ssim<B> {
    pub fn new(window_size: usize, channels: usize, device: &B::Device) -> Self {
        let window = gaussian_window(window_size, 1.5);
        let data: Vec<f32> = (0..channels).flat_map(|_| window.iter().copied()).collect();

        let weights_h = Tensor::from_data(
            TensorData::new(data.clone(), [channels, 1, 1, window_size]),
            device,
        );
        let weights_v = Tensor::from_data(
            TensorData::new(data, [channels, 1, window_size, 1]),
            device,
        );

        Self {
            weights_h,
            weights_v,
            channels,
            window_size,
        }
    }

    fn filter(&self, img: Tensor<B, 4>) -> Tensor<B, 4> {
        let pad = self.window_size / 2;
        let img = conv2d(
            img,
            self.weights_h.clone(),
            None,
            ConvOptions::new([1, 1], [0, pad], [1, 1], self.channels),
        );
        conv2d(
            img,
            self.weights_v.clone(),
            None,
            ConvOptions::new([1, 1], [pad, 0], [1, 1], self.channels),
        )
    }

    /// Per-pixel SSIM map of two `[H, W, C]` images.
    pub fn ssim(&self, img1: Tensor<B, 3>, img2: Tensor<B, 3>) -> Tensor<B, 3> {
        let [h, w, c] = img1.dims();
        let img1: Tensor<B, 4> = img1.permute([2, 0, 1]).reshape([1, c, h, w]);
        let img2: Tensor<B, 4> = img2.permute([2, 0, 1]).reshape([1, c, h, w]);

        let mu_x = self.filter(img1.clone());
        let mu_y = self.filter(img2.clone());
        let mu_xx = mu_x.clone() * mu_x.clone();
        let mu_yy = mu_y.clone() * mu_y.clone();
        let mu_xy = mu_x * mu_y;

        let sigma_xx = self.filter(img1.clone() * img1.clone()) - mu_xx.clone();
        let sigma_yy = self.filter(img2.clone() * img2.clone()) - mu_yy.clone();
        let sigma_xy = self.filter(img1 * img2) - mu_xy.clone();

        let numerator = (mu_xy * 2.0 + C1) * (sigma_xy * 2.0 + C2);
        let denominator = (mu_xx + mu_yy + C1) * (sigma_xx + sigma_yy + C2);

        (numerator / denominator)
            .reshape([c, h, w])
            .permute([1, 2, 0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use burn::backend::NdArray;

    type B = NdArray;

    fn image(h: usize, w: usize, f: impl Fn(usize, usize, usize) -> f32) -> Tensor<B, 3> {
        let data: Vec<f32> = (0..h)
            .flat_map(|y| (0..w).flat_map(move |x| (0..3).map(move |c| (y, x, c))))
            .map(|(y, x, c)| f(y, x, c))
            .collect();
        Tensor::from_data(TensorData::new(data, [h, w, 3]), &Default::default())
    }

    #[test]
    fn identical_images_score_one() {
        let ssim = Ssim::<B>::new(11, 3, &Default::default());
        let img = image(16, 16, |y, x, c| ((x * 7 + y * 3 + c) % 11) as f32 / 10.0);
        let score = ssim.ssim(img.clone(), img).mean().into_scalar();
        assert_approx_eq!(score, 1.0, 1e-4);
    }

    #[test]
    fn different_images_score_lower() {
        let ssim = Ssim::<B>::new(11, 3, &Default::default());
        let a = image(16, 16, |y, x, _| ((x + y) % 2) as f32);
        let b = image(16, 16, |y, x, _| ((x + y + 1) % 2) as f32);
        let score = ssim.ssim(a, b).mean().into_scalar();
        assert!(score < 0.5, "score {score}");
    }

    #[test]
    fn map_keeps_image_shape() {
        let ssim = Ssim::<B>::new(11, 3, &Default::default());
        let img = image(9, 13, |_, _, _| 0.5);
        assert_eq!(ssim.ssim(img.clone(), img).dims(), [9, 13, 3]);
    }

    #[test]
    fn window_is_normalized() {
        let window = gaussian_window(11, 1.5);
        assert_approx_eq!(window.iter().sum::<f32>(), 1.0, 1e-6);
        assert_approx_eq!(window[0], window[10], 1e-9);
    }
}
