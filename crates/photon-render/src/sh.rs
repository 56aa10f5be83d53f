use burn::prelude::Backend;
use burn::tensor::Tensor;
use glam::Vec3;

pub const SH_C0: f32 = 0.282_094_8;
const SH_C1: f32 = 0.488_602_5;
const SH_C2: [f32; 5] = [
    1.092_548_4,
    -1.092_548_4,
    0.315_391_57,
    -1.092_548_4,
    0.546_274_2,
];
const SH_C3: [f32; 7] = [
    -0.590_043_6,
    2.890_611_4,
    -0.457_045_8,
    0.373_176_33,
    -0.457_045_8,
    1.445_305_7,
    -0.590_043_6,
];

pub const MAX_SH_DEGREE: u32 = 3;

pub const fn sh_coeffs_for_degree(degree: u32) -> u32 {
    (degree + 1).pow(2)
}

pub fn sh_degree_from_coeffs(coeffs_per_channel: u32) -> u32 {
    match coeffs_per_channel {
        1 => 0,
        4 => 1,
        9 => 2,
        _ => 3,
    }
}

pub fn channel_to_sh(rgb: f32) -> f32 {
    (rgb - 0.5) / SH_C0
}

pub fn rgb_to_sh(rgb: Vec3) -> Vec3 {
    glam::vec3(
        channel_to_sh(rgb.x),
        channel_to_sh(rgb.y),
        channel_to_sh(rgb.z),
    )
}

pub fn sh_to_rgb(sh_dc: Vec3) -> Vec3 {
    sh_dc * SH_C0 + Vec3::splat(0.5)
}

/// Evaluates view-dependent colour for every point.
///
/// `coeffs` is `[N, K, 3]`, `dirs` are unit view directions `[N, 3]`. Only the first
/// `(degree + 1)^2` coefficients are used. Returns `[N, 3]` clamped at zero.
pub fn eval_sh<B: Backend>(degree: u32, coeffs: Tensor<B, 3>, dirs: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, k_total, _] = coeffs.dims();
    let degree = degree.min(sh_degree_from_coeffs(k_total as u32));

    let col = |i: usize| dirs.clone().slice([0..n, i..i + 1]);
    let (x, y, z) = (col(0), col(1), col(2));
    let device = dirs.device();

    let mut basis = vec![Tensor::<B, 2>::ones([n, 1], &device) * SH_C0];

    if degree >= 1 {
        basis.push(y.clone() * -SH_C1);
        basis.push(z.clone() * SH_C1);
        basis.push(x.clone() * -SH_C1);
    }

    if degree >= 2 {
        let (xx, yy, zz) = (
            x.clone().powi_scalar(2),
            y.clone().powi_scalar(2),
            z.clone().powi_scalar(2),
        );
        let (xy, yz, xz) = (x.clone() * y.clone(), y.clone() * z.clone(), x.clone() * z.clone());

        basis.push(xy.clone() * SH_C2[0]);
        basis.push(yz.clone() * SH_C2[1]);
        basis.push((zz.clone() * 2.0 - xx.clone() - yy.clone()) * SH_C2[2]);
        basis.push(xz.clone() * SH_C2[3]);
        basis.push((xx.clone() - yy.clone()) * SH_C2[4]);

        if degree >= 3 {
            basis.push(y.clone() * (xx.clone() * 3.0 - yy.clone()) * SH_C3[0]);
            basis.push(xy.clone() * z.clone() * SH_C3[1]);
            basis.push(y.clone() * (zz.clone() * 4.0 - xx.clone() - yy.clone()) * SH_C3[2]);
            basis.push(
                z.clone() * (zz.clone() * 2.0 - xx.clone() * 3.0 - yy.clone() * 3.0) * SH_C3[3],
            );
            basis.push(x.clone() * (zz.clone() * 4.0 - xx.clone() - yy.clone()) * SH_C3[4]);
            basis.push(z.clone() * (xx.clone() - yy.clone()) * SH_C3[5]);
            basis.push(x * (xx - yy * 3.0) * SH_C3[6]);
        }
    }

    let k = basis.len();
    let basis = Tensor::cat(basis, 1).unsqueeze_dim::<3>(2);
    let coeffs = coeffs.slice([0..n, 0..k, 0..3]);
    let rgb = (basis * coeffs).sum_dim(1).reshape([n, 3]);
    (rgb + 0.5).clamp_min(0.0)
}
