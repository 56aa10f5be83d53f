use ball_tree::BallTree;
use burn::prelude::Backend;
use glam::{Vec3, Vec3A};
use photon_dataset::point_cloud::PointCloud;
use photon_render::gaussian_scene::{GaussianScene, inverse_sigmoid};
use photon_render::sh::{rgb_to_sh, sh_coeffs_for_degree};
use rand::Rng;
use rayon::prelude::*;
use tracing::trace_span;

/// Half width of the cube random initial points are drawn from.
pub const RANDOM_INIT_RADIUS: f32 = 1.3;

const INIT_OPACITY: f32 = 0.1;
const KNN_NEIGHBOURS: usize = 3;

#[derive(PartialEq, Clone, Copy, Debug)]
pub(crate) struct BallPoint(pub Vec3A);

impl ball_tree::Point for BallPoint {
    fn distance(&self, other: &Self) -> f64 {
        self.0.distance(other.0) as f64
    }

    fn move_towards(&self, other: &Self, d: f64) -> Self {
        Self(self.0.lerp(other.0, d as f32 / self.0.distance(other.0)))
    }

    fn midpoint(a: &Self, b: &Self) -> Self {
        Self((a.0 + b.0) / 2.0)
    }
}

/// A ball tree over `positions` whose values are the point indices.
pub(crate) fn index_tree(positions: &[Vec3]) -> BallTree<BallPoint, usize> {
    let points = positions.iter().map(|p| BallPoint(Vec3A::from(*p))).collect();
    BallTree::new(points, (0..positions.len()).collect())
}

/// Random points in a cube around the origin with random colours.
pub fn random_point_cloud(count: usize, rng: &mut impl Rng) -> PointCloud {
    let mut coord = || rng.random_range(-RANDOM_INIT_RADIUS..RANDOM_INIT_RADIUS);
    let positions = (0..count)
        .map(|_| Vec3::new(coord(), coord(), coord()))
        .collect();
    let colors = (0..count)
        .map(|_| Vec3::new(rng.random(), rng.random(), rng.random()))
        .collect();
    PointCloud { positions, colors }
}

/// Log scale of every point from the mean squared distance to its nearest neighbours.
pub fn knn_log_scales(positions: &[Vec3]) -> Vec<f32> {
    let _span = trace_span!("knn_log_scales").entered();

    if positions.len() < 2 {
        return vec![0.01f32.ln(); positions.len()];
    }

    let tree = index_tree(positions);
    positions
        .par_iter()
        .map_with(tree.query(), |query, p| {
            let dists: Vec<f64> = query
                .nn(&BallPoint(Vec3A::from(*p)))
                .skip(1)
                .take(KNN_NEIGHBOURS)
                .map(|(_, dist, _)| dist)
                .collect();
            let mean_sq = dists.iter().map(|d| d * d).sum::<f64>() / dists.len() as f64;
            (mean_sq.max(1e-7) as f32).sqrt().ln()
        })
        .collect()
}

/// Isotropic, slightly transparent points at the cloud positions, coloured by its DC band.
pub fn create_scene_from_points<B: Backend>(
    cloud: &PointCloud,
    sh_degree: u32,
    device: &B::Device,
) -> GaussianScene<B> {
    let _span = trace_span!("create_scene_from_points").entered();

    let n = cloud.len();
    let n_coeffs = sh_coeffs_for_degree(sh_degree) as usize;

    let means = cloud.positions.iter().flat_map(|p| p.to_array()).collect();
    let log_scales = knn_log_scales(&cloud.positions)
        .into_iter()
        .flat_map(|s| [s; 3])
        .collect();
    let rotations = [1.0, 0.0, 0.0, 0.0].repeat(n);

    let mut sh_coeffs = vec![0.0; n * n_coeffs * 3];
    for (i, color) in cloud.colors.iter().enumerate() {
        let dc = rgb_to_sh(*color);
        sh_coeffs[i * n_coeffs * 3..i * n_coeffs * 3 + 3].copy_from_slice(&dc.to_array());
    }

    GaussianScene::from_raw(
        means,
        rotations,
        log_scales,
        sh_coeffs,
        vec![inverse_sigmoid(INIT_OPACITY); n],
        device,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use burn::backend::NdArray;
    use photon_render::read_f32;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn random_cloud_stays_in_cube() {
        let cloud = random_point_cloud(500, &mut StdRng::seed_from_u64(3));
        assert_eq!(cloud.len(), 500);
        assert!(
            cloud
                .positions
                .iter()
                .all(|p| p.abs().max_element() <= RANDOM_INIT_RADIUS)
        );
        assert!(cloud.colors.iter().all(|c| c.min_element() >= 0.0 && c.max_element() <= 1.0));
    }

    #[test]
    fn knn_scale_of_a_regular_grid() {
        let positions: Vec<Vec3> = (0..4)
            .flat_map(|x| (0..4).flat_map(move |y| (0..4).map(move |z| Vec3::new(x as f32, y as f32, z as f32))))
            .map(|p| p * 0.5)
            .collect();
        let scales = knn_log_scales(&positions);
        // Every grid point has at least three neighbours at the grid spacing.
        for s in scales {
            assert_approx_eq!(s, 0.5f32.ln(), 1e-5);
        }
    }

    #[test]
    fn scene_from_points_has_expected_layout() {
        let cloud = PointCloud {
            positions: vec![Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::Z],
            colors: vec![Vec3::splat(0.5), Vec3::X, Vec3::Y, Vec3::Z],
        };
        let scene = create_scene_from_points::<NdArray>(&cloud, 1, &Default::default());
        assert_eq!(scene.num_points(), 4);
        assert_eq!(scene.sh_coeffs.dims(), [4, 4, 3]);

        let sh = read_f32(scene.sh_coeffs.val());
        // Mid gray has a zero DC band and all higher bands start at zero.
        assert!(sh[..12].iter().all(|&c| c.abs() < 1e-6));
        assert!(sh[15..24].iter().all(|&c| c == 0.0));

        for o in read_f32(scene.opacities()) {
            assert_approx_eq!(o, INIT_OPACITY, 1e-6);
        }
    }
}
