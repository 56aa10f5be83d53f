use photon_dataset::scene::ViewImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageClass {
    Color,
    Grayscale,
}

/// Classifies interleaved RGB pixels. An image is grayscale only if all three channels
/// agree exactly at every pixel.
pub fn classify(rgb: &[f32]) -> ImageClass {
    let grayscale = rgb
        .chunks_exact(3)
        .all(|p| p[0] == p[1] && p[1] == p[2]);
    if grayscale {
        ImageClass::Grayscale
    } else {
        ImageClass::Color
    }
}

pub fn classify_image(image: &ViewImage) -> ImageClass {
    classify(image.pixels())
}
