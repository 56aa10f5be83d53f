use glam::{Mat3, Mat4, Vec2, Vec3, Vec4};

pub fn focal_to_fov(focal: f64, pixels: u32) -> f64 {
    2.0 * f64::atan(pixels as f64 / (2.0 * focal))
}

pub fn fov_to_focal(fov_rad: f64, pixels: u32) -> f64 {
    0.5 * (pixels as f64) / f64::tan(fov_rad * 0.5)
}

/// Builds the world-to-view matrix from a camera-to-world rotation `rotation` and a
/// world-to-camera translation `translation`. The camera centre is then shifted by
/// `trans` and scaled by `scale`.
pub fn world_to_view(rotation: Mat3, translation: Vec3, trans: Vec3, scale: f32) -> Mat4 {
    let mut w2c = Mat4::from_mat3(rotation.transpose());
    w2c.w_axis = translation.extend(1.0);

    let mut c2w = w2c.inverse();
    let center = (c2w.w_axis.truncate() + trans) * scale;
    c2w.w_axis = center.extend(1.0);
    c2w.inverse()
}

/// Perspective projection mapping view space to clip space, with `+z` looking forward.
pub fn projection_matrix(znear: f32, zfar: f32, fov_x: f32, fov_y: f32) -> Mat4 {
    let tan_half_y = (fov_y / 2.0).tan();
    let tan_half_x = (fov_x / 2.0).tan();

    let top = tan_half_y * znear;
    let bottom = -top;
    let right = tan_half_x * znear;
    let left = -right;

    Mat4::from_cols(
        Vec4::new(2.0 * znear / (right - left), 0.0, 0.0, 0.0),
        Vec4::new(0.0, 2.0 * znear / (top - bottom), 0.0, 0.0),
        Vec4::new(
            (right + left) / (right - left),
            (top + bottom) / (top - bottom),
            zfar / (zfar - znear),
            1.0,
        ),
        Vec4::new(0.0, 0.0, -(zfar * znear) / (zfar - znear), 0.0),
    )
}

/// A pinhole camera.
///
/// The pose is stored as a camera-to-world `rotation` and a world-to-camera
/// `translation`. The view, projection and camera centre are derived from those and
/// kept in sync by the setters.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    rotation: Mat3,
    translation: Vec3,
    pub fov_x: f32,
    pub fov_y: f32,
    pub width: u32,
    pub height: u32,
    pub znear: f32,
    pub zfar: f32,
    trans: Vec3,
    scale: f32,
    world_view: Mat4,
    projection: Mat4,
    full_proj: Mat4,
    center: Vec3,
}

impl Camera {
    pub const ZNEAR: f32 = 0.01;
    pub const ZFAR: f32 = 100.0;

    pub fn new(
        rotation: Mat3,
        translation: Vec3,
        fov_x: f32,
        fov_y: f32,
        width: u32,
        height: u32,
    ) -> Self {
        let mut cam = Self {
            rotation,
            translation,
            fov_x,
            fov_y,
            width,
            height,
            znear: Self::ZNEAR,
            zfar: Self::ZFAR,
            trans: Vec3::ZERO,
            scale: 1.0,
            world_view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            full_proj: Mat4::IDENTITY,
            center: Vec3::ZERO,
        };
        cam.update_transforms();
        cam
    }

    /// Camera from an explicit world-to-view matrix, as sent by interactive viewers.
    pub fn from_world_view(
        world_view: Mat4,
        fov_x: f32,
        fov_y: f32,
        width: u32,
        height: u32,
        znear: f32,
        zfar: f32,
    ) -> Self {
        let rotation = Mat3::from_mat4(world_view).transpose();
        let translation = world_view.w_axis.truncate();
        let mut cam = Self::new(rotation, translation, fov_x, fov_y, width, height);
        cam.znear = znear;
        cam.zfar = zfar;
        cam.update_transforms();
        cam
    }

    pub fn rotation(&self) -> Mat3 {
        self.rotation
    }

    pub fn translation(&self) -> Vec3 {
        self.translation
    }

    /// Moves the camera and recomputes every derived transform.
    pub fn set_translation(&mut self, translation: Vec3) {
        self.translation = translation;
        self.update_transforms();
    }

    pub fn with_translation(&self, translation: Vec3) -> Self {
        let mut cam = self.clone();
        cam.set_translation(translation);
        cam
    }

    pub fn world_view_transform(&self) -> Mat4 {
        self.world_view
    }

    pub fn projection_matrix(&self) -> Mat4 {
        self.projection
    }

    pub fn full_proj_transform(&self) -> Mat4 {
        self.full_proj
    }

    pub fn camera_center(&self) -> Vec3 {
        self.center
    }

    pub fn focal(&self) -> Vec2 {
        Vec2::new(
            fov_to_focal(self.fov_x as f64, self.width) as f32,
            fov_to_focal(self.fov_y as f64, self.height) as f32,
        )
    }

    pub fn principal_point(&self) -> Vec2 {
        Vec2::new(self.width as f32 / 2.0, self.height as f32 / 2.0)
    }

    fn update_transforms(&mut self) {
        self.world_view = world_to_view(self.rotation, self.translation, self.trans, self.scale);
        self.projection = projection_matrix(self.znear, self.zfar, self.fov_x, self.fov_y);
        self.full_proj = self.projection * self.world_view;
        self.center = self.world_view.inverse().w_axis.truncate();
    }
}
