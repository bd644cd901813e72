//! Detection masks. Non-zero pixels are open for detection.
//!
//! Exclusion disks are measured in pixels of the image the keypoints live in.

use image::{GrayImage, Luma};
use imageproc::drawing::draw_filled_circle_mut;

use crate::Keypoint;

pub const OPEN: Luma<u8> = Luma([255]);
pub const BLOCKED: Luma<u8> = Luma([0]);

/// Mask with every pixel open.
pub fn open_mask(width: u32, height: u32) -> GrayImage {
    GrayImage::from_pixel(width, height, OPEN)
}

/// Copies `base` and blocks a disk of `radius_px` around every keypoint.
pub fn exclusion_mask(base: &GrayImage, keypoints: &[Keypoint], radius_px: f64) -> GrayImage {
    let mut mask = base.clone();
    let radius = radius_px.max(0.0).round() as i32;
    for kp in keypoints.iter().filter(|kp| kp.is_finite()) {
        let center = (kp.x.round() as i32, kp.y.round() as i32);
        draw_filled_circle_mut(&mut mask, center, radius, BLOCKED);
    }
    mask
}

/// True when the pixel containing `keypoint` is inside `mask` and open.
pub fn is_open(mask: &GrayImage, keypoint: &Keypoint) -> bool {
    if !keypoint.is_finite() || keypoint.x < 0.0 || keypoint.y < 0.0 {
        return false;
    }
    let (x, y) = (keypoint.x as u32, keypoint.y as u32);
    x < mask.width() && y < mask.height() && mask.get_pixel(x, y)[0] != 0
}
