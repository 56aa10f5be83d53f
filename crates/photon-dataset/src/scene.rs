use std::sync::Arc;

use burn::tensor::TensorData;
use glam::Vec3;
use image::DynamicImage;
use photon_render::camera::Camera;

/// A decoded ground-truth image: `height * width * 3` floats in `[0, 1]`, row major.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewImage {
    pub width: u32,
    pub height: u32,
    pixels: Arc<Vec<f32>>,
}

impl ViewImage {
    pub fn new(width: u32, height: u32, pixels: Vec<f32>) -> Self {
        assert_eq!(
            pixels.len(),
            (width * height * 3) as usize,
            "Image data must be RGB"
        );
        Self {
            width,
            height,
            pixels: Arc::new(pixels),
        }
    }

    /// Converts an image to RGB floats, compositing any alpha channel onto `background`.
    pub fn from_dynamic(image: DynamicImage, background: Vec3) -> Self {
        let _span = tracing::trace_span!("ViewImage::from_dynamic").entered();

        let (width, height) = (image.width(), image.height());
        let pixels = if image.color().has_alpha() {
            image
                .into_rgba32f()
                .into_vec()
                .chunks_exact(4)
                .flat_map(|p| {
                    let a = p[3];
                    [
                        p[0] * a + background.x * (1.0 - a),
                        p[1] * a + background.y * (1.0 - a),
                        p[2] * a + background.z * (1.0 - a),
                    ]
                })
                .collect()
        } else {
            image.into_rgb32f().into_vec()
        };
        Self::new(width, height, pixels)
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    pub fn to_tensor_data(&self) -> TensorData {
        TensorData::new(
            self.pixels.as_ref().clone(),
            [self.height as usize, self.width as usize, 3],
        )
    }
}

#[derive(Clone, Debug)]
pub struct View {
    pub name: String,
    pub camera: Camera,
    pub image: ViewImage,
}

/// Centre and radius of the sphere around all camera centres, grown by 10%.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneNorm {
    pub center: Vec3,
    pub radius: f32,
}

#[derive(Clone, Debug)]
pub struct Scene {
    pub views: Arc<Vec<View>>,
}

impl Scene {
    pub fn new(views: Vec<View>) -> Self {
        Self {
            views: Arc::new(views),
        }
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn norm(&self) -> SceneNorm {
        if self.views.is_empty() {
            return SceneNorm {
                center: Vec3::ZERO,
                radius: 1.0,
            };
        }

        let centers: Vec<Vec3> = self
            .views
            .iter()
            .map(|v| v.camera.camera_center())
            .collect();
        let center = centers.iter().copied().sum::<Vec3>() / centers.len() as f32;
        let diagonal = centers
            .iter()
            .map(|c| c.distance(center))
            .fold(0.0f32, f32::max);
        // A single camera still needs a usable extent.
        let radius = if diagonal > 0.0 { diagonal * 1.1 } else { 1.0 };

        SceneNorm { center, radius }
    }
}
