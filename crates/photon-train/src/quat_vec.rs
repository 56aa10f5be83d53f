use burn::prelude::Backend;
use burn::tensor::Tensor;

/// Rotates `vectors [N, 3]` by the unit quaternions `quaternions [N, 4]` (`w, x, y, z`).
pub(crate) fn quaternion_vec_multiply<B: Backend>(
    quaternions: Tensor<B, 2>,
    vectors: Tensor<B, 2>,
) -> Tensor<B, 2> {
    let n = quaternions.dims()[0];

    let qw = quaternions.clone().slice([0..n, 0..1]);
    let qx = quaternions.clone().slice([0..n, 1..2]);
    let qy = quaternions.clone().slice([0..n, 2..3]);
    let qz = quaternions.slice([0..n, 3..4]);

    let vx = vectors.clone().slice([0..n, 0..1]);
    let vy = vectors.clone().slice([0..n, 1..2]);
    let vz = vectors.slice([0..n, 2..3]);

    let qw2 = qw.clone().powi_scalar(2);
    let qx2 = qx.clone().powi_scalar(2);
    let qy2 = qy.clone().powi_scalar(2);
    let qz2 = qz.clone().powi_scalar(2);

    let xy = qx.clone() * qy.clone();
    let xz = qx.clone() * qz.clone();
    let yz = qy.clone() * qz.clone();
    let wx = qw.clone() * qx;
    let wy = qw.clone() * qy;
    let wz = qw * qz;

    let x = (qw2.clone() + qx2.clone() - qy2.clone() - qz2.clone()) * vx.clone()
        + (xy.clone() * vy.clone() + xz.clone() * vz.clone() + wy.clone() * vz.clone()
            - wz.clone() * vy.clone())
            * 2.0;
    let y = (qw2.clone() - qx2.clone() + qy2.clone() - qz2.clone()) * vy.clone()
        + (xy * vx.clone() + yz.clone() * vz.clone() + wz * vx.clone() - wx.clone() * vz.clone())
            * 2.0;
    let z = (qw2 - qx2 - qy2 + qz2) * vz
        + (xz * vx.clone() + yz * vy.clone() + wx * vy - wy * vx) * 2.0;

    Tensor::cat(vec![x, y, z], 1)
}
