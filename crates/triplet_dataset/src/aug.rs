//! Per-role image augmentation.
//!
//! Queries (sketches) get flip/shift/rotation/brightness/blur; positives and negatives
//! (product photos) get rotation and an optional perspective distortion. Every pipeline
//! resizes to the network input size first so batches share one shape.

use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::{rotate_about_center, warp, Interpolation, Projection};
use rand::Rng;

use crate::types::Role;

/// Background used for pixels uncovered by geometric transforms.
pub const WHITE: [u8; 3] = [255, 255, 255];

#[derive(Debug, Clone, PartialEq)]
pub struct RoleTransform {
    /// Resize every image to this (width, height).
    pub target_size: (u32, u32),
    /// Probability of a horizontal flip.
    pub flip_horizontal_prob: f32,
    /// Max horizontal shift as a fraction of the width.
    pub translate_x: f32,
    /// Max vertical shift as a fraction of the height.
    pub translate_y: f32,
    /// Rotation angle is drawn uniformly from [-deg, deg].
    pub rotation_degrees: f32,
    /// Brightness factor range; None disables jitter.
    pub brightness: Option<(f32, f32)>,
    /// Gaussian blur sigma range; None disables blur.
    pub blur_sigma: Option<(f32, f32)>,
    /// Probability of a perspective distortion.
    pub perspective_prob: f32,
    /// Corner displacement strength (0..1) for perspective distortion.
    pub perspective_distortion: f32,
    pub fill: [u8; 3],
}

impl RoleTransform {
    /// Resize only.
    pub fn plain(target_size: (u32, u32)) -> Self {
        Self {
            target_size,
            flip_horizontal_prob: 0.0,
            translate_x: 0.0,
            translate_y: 0.0,
            rotation_degrees: 0.0,
            brightness: None,
            blur_sigma: None,
            perspective_prob: 0.0,
            perspective_distortion: 0.0,
            fill: WHITE,
        }
    }

    pub fn is_plain(&self) -> bool {
        self.flip_horizontal_prob <= 0.0
            && self.translate_x <= 0.0
            && self.translate_y <= 0.0
            && self.rotation_degrees <= 0.0
            && self.brightness.is_none()
            && self.blur_sigma.is_none()
            && self.perspective_prob <= 0.0
    }

    pub fn describe(&self) -> String {
        let (w, h) = self.target_size;
        format!(
            "size={}x{} flip_p={:.2} translate=({:.2},{:.2}) rot=±{:.0}° brightness={:?} blur={:?} perspective_p={:.2} distortion={:.2}",
            w,
            h,
            self.flip_horizontal_prob,
            self.translate_x,
            self.translate_y,
            self.rotation_degrees,
            self.brightness,
            self.blur_sigma,
            self.perspective_prob,
            self.perspective_distortion,
        )
    }

    pub fn apply(&self, img: RgbImage, rng: &mut dyn rand::RngCore) -> RgbImage {
        let (w, h) = self.target_size;
        let mut img = if img.dimensions() == (w, h) {
            img
        } else {
            image::imageops::resize(&img, w, h, FilterType::Triangle)
        };
        let fill = Rgb(self.fill);

        maybe_hflip(&mut img, self.flip_horizontal_prob, rng);
        maybe_translate(&mut img, self.translate_x, self.translate_y, fill, rng);
        maybe_rotate(&mut img, self.rotation_degrees, fill, rng);
        maybe_perspective(
            &mut img,
            self.perspective_prob,
            self.perspective_distortion,
            fill,
            rng,
        );
        if let Some((lo, hi)) = self.brightness {
            brightness_jitter(&mut img, lo, hi, rng);
        }
        if let Some((lo, hi)) = self.blur_sigma {
            random_blur(&mut img, lo, hi, rng);
        }
        img
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoleTransforms {
    pub query: RoleTransform,
    pub positive: RoleTransform,
    pub negative: RoleTransform,
}

impl RoleTransforms {
    /// Sketch/product defaults: the query is flipped, shifted up to half the width, rotated
    /// up to ±90°, darkened to 30–100% brightness and blurred (σ 0.5–3); positives and
    /// negatives are rotated up to ±90° and perspective-distorted (0.5) half of the time.
    pub fn sketch_default(target_size: (u32, u32)) -> Self {
        let query = RoleTransformBuilder::new(target_size)
            .flip_horizontal_prob(0.5)
            .translate(0.5, 0.0)
            .rotation(90.0)
            .brightness(0.3, 1.0)
            .blur(0.5, 3.0)
            .build();
        let photo = RoleTransformBuilder::new(target_size)
            .rotation(90.0)
            .perspective(0.5, 0.5)
            .build();
        Self {
            query,
            positive: photo.clone(),
            negative: photo,
        }
    }

    pub fn plain(target_size: (u32, u32)) -> Self {
        Self {
            query: RoleTransform::plain(target_size),
            positive: RoleTransform::plain(target_size),
            negative: RoleTransform::plain(target_size),
        }
    }

    pub fn for_role(&self, role: Role) -> &RoleTransform {
        match role {
            Role::Query => &self.query,
            Role::Positive => &self.positive,
            Role::Negative => &self.negative,
        }
    }

    pub fn target_size(&self) -> (u32, u32) {
        self.query.target_size
    }
}

#[derive(Debug, Clone)]
pub struct RoleTransformBuilder {
    inner: RoleTransform,
}

impl RoleTransformBuilder {
    pub fn new(target_size: (u32, u32)) -> Self {
        Self {
            inner: RoleTransform::plain(target_size),
        }
    }
    pub fn flip_horizontal_prob(mut self, p: f32) -> Self {
        self.inner.flip_horizontal_prob = p;
        self
    }
    pub fn translate(mut self, x: f32, y: f32) -> Self {
        self.inner.translate_x = x;
        self.inner.translate_y = y;
        self
    }
    pub fn rotation(mut self, degrees: f32) -> Self {
        self.inner.rotation_degrees = degrees.abs();
        self
    }
    pub fn brightness(mut self, lo: f32, hi: f32) -> Self {
        self.inner.brightness = Some((lo.min(hi), lo.max(hi)));
        self
    }
    pub fn blur(mut self, sigma_lo: f32, sigma_hi: f32) -> Self {
        self.inner.blur_sigma = Some((sigma_lo.min(sigma_hi), sigma_lo.max(sigma_hi)));
        self
    }
    pub fn perspective(mut self, distortion: f32, prob: f32) -> Self {
        self.inner.perspective_distortion = distortion.clamp(0.0, 1.0);
        self.inner.perspective_prob = prob;
        self
    }
    pub fn fill(mut self, fill: [u8; 3]) -> Self {
        self.inner.fill = fill;
        self
    }
    pub fn build(self) -> RoleTransform {
        self.inner
    }
}

/// Uniform sample from [lo, hi]; returns `lo` on an empty range.
fn uniform(rng: &mut dyn rand::RngCore, lo: f32, hi: f32) -> f32 {
    if hi > lo {
        rng.random_range(lo..=hi)
    } else {
        lo
    }
}

pub(crate) fn maybe_hflip(img: &mut RgbImage, prob: f32, rng: &mut dyn rand::RngCore) {
    if prob <= 0.0 {
        return;
    }
    if rng.random_range(0.0..1.0) < prob {
        image::imageops::flip_horizontal_in_place(img);
    }
}

pub(crate) fn maybe_translate(
    img: &mut RgbImage,
    max_x: f32,
    max_y: f32,
    fill: Rgb<u8>,
    rng: &mut dyn rand::RngCore,
) {
    if max_x <= 0.0 && max_y <= 0.0 {
        return;
    }
    let (w, h) = img.dimensions();
    let dx_max = max_x * w as f32;
    let dy_max = max_y * h as f32;
    let dx = uniform(rng, -dx_max, dx_max).round();
    let dy = uniform(rng, -dy_max, dy_max).round();
    if dx == 0.0 && dy == 0.0 {
        return;
    }
    *img = warp(img, &Projection::translate(dx, dy), Interpolation::Nearest, fill);
}

pub(crate) fn maybe_rotate(
    img: &mut RgbImage,
    max_degrees: f32,
    fill: Rgb<u8>,
    rng: &mut dyn rand::RngCore,
) {
    if max_degrees <= 0.0 {
        return;
    }
    let degrees = uniform(rng, -max_degrees, max_degrees);
    *img = rotate_about_center(img, degrees.to_radians(), Interpolation::Bilinear, fill);
}

/// Move each corner inward by up to `distortion * half-size` and warp onto the new quad.
pub(crate) fn maybe_perspective(
    img: &mut RgbImage,
    prob: f32,
    distortion: f32,
    fill: Rgb<u8>,
    rng: &mut dyn rand::RngCore,
) {
    if prob <= 0.0 || distortion <= 0.0 {
        return;
    }
    if rng.random_range(0.0..1.0) >= prob {
        return;
    }
    let (w, h) = img.dimensions();
    if w < 2 || h < 2 {
        return;
    }
    let (wf, hf) = ((w - 1) as f32, (h - 1) as f32);
    let dx = (distortion * wf / 2.0).floor();
    let dy = (distortion * hf / 2.0).floor();
    let from = [(0.0, 0.0), (wf, 0.0), (wf, hf), (0.0, hf)];
    let to = [
        (uniform(rng, 0.0, dx), uniform(rng, 0.0, dy)),
        (uniform(rng, wf - dx, wf), uniform(rng, 0.0, dy)),
        (uniform(rng, wf - dx, wf), uniform(rng, hf - dy, hf)),
        (uniform(rng, 0.0, dx), uniform(rng, hf - dy, hf)),
    ];
    if let Some(projection) = Projection::from_control_points(from, to) {
        *img = warp(img, &projection, Interpolation::Bilinear, fill);
    }
}

pub(crate) fn brightness_jitter(
    img: &mut RgbImage,
    lo: f32,
    hi: f32,
    rng: &mut dyn rand::RngCore,
) {
    let factor = uniform(rng, lo.max(0.0), hi.max(0.0));
    for pixel in img.pixels_mut() {
        for c in 0..3 {
            let v = pixel[c] as f32 * factor;
            pixel[c] = v.clamp(0.0, 255.0) as u8;
        }
    }
}

pub(crate) fn random_blur(img: &mut RgbImage, lo: f32, hi: f32, rng: &mut dyn rand::RngCore) {
    let sigma = uniform(rng, lo, hi);
    if sigma <= 0.0 {
        return;
    }
    *img = gaussian_blur_f32(img, sigma);
}

/// RGB image → CHW floats in [0, 1].
pub fn to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;
    let mut chw = vec![0.0f32; plane * 3];
    for (x, y, pixel) in img.enumerate_pixels() {
        let base = (y * width + x) as usize;
        chw[base] = pixel[0] as f32 / 255.0;
        chw[plane + base] = pixel[1] as f32 / 255.0;
        chw[2 * plane + base] = pixel[2] as f32 / 255.0;
    }
    chw
}
