use glam::Vec3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub center: Vec3,
    pub extent: Vec3,
}

impl BoundingBox {
    pub fn from_min_max(min: Vec3, max: Vec3) -> Self {
        Self {
            center: (max + min) / 2.0,
            extent: (max - min) / 2.0,
        }
    }

    /// Smallest box around a set of points. `None` if there are no points.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let (min, max, count) = points.into_iter().fold(
            (Vec3::splat(f32::INFINITY), Vec3::splat(f32::NEG_INFINITY), 0usize),
            |(min, max, count), p| (min.min(p), max.max(p), count + 1),
        );
        (count > 0).then(|| Self::from_min_max(min, max))
    }

    pub fn min(&self) -> Vec3 {
        self.center - self.extent
    }

    pub fn max(&self) -> Vec3 {
        self.center + self.extent
    }

    pub fn size(&self) -> Vec3 {
        self.extent * 2.0
    }

    pub fn volume(&self) -> f32 {
        let size = self.size();
        size.x * size.y * size.z
    }

    /// The same box with its half-extent multiplied by `factor`.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            center: self.center,
            extent: self.extent * factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_of_unit_cube() {
        let bb = BoundingBox::from_min_max(Vec3::ZERO, Vec3::ONE);
        assert_eq!(bb.volume(), 1.0);
        assert_eq!(bb.center, Vec3::splat(0.5));
    }

    #[test]
    fn from_points_covers_all_points() {
        let bb = BoundingBox::from_points([
            Vec3::new(-1.0, 0.0, 2.0),
            Vec3::new(3.0, -2.0, 0.0),
            Vec3::new(0.0, 1.0, 1.0),
        ])
        .expect("non empty");
        assert_eq!(bb.min(), Vec3::new(-1.0, -2.0, 0.0));
        assert_eq!(bb.max(), Vec3::new(3.0, 1.0, 2.0));
        assert!(BoundingBox::from_points([]).is_none());
    }

    #[test]
    fn scaled_keeps_center() {
        let bb = BoundingBox::from_min_max(Vec3::splat(-1.0), Vec3::splat(1.0)).scaled(2.0);
        assert_eq!(bb.min(), Vec3::splat(-2.0));
        assert_eq!(bb.center, Vec3::ZERO);
    }
}
