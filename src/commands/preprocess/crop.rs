use image::DynamicImage;
use image::imageops::FilterType;

/// Pixel box in `(left, upper, right, lower)` order, right/lower exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub left: u32,
    pub upper: u32,
    pub right: u32,
    pub lower: u32,
}

impl CropBox {
    pub const fn new(left: u32, upper: u32, right: u32, lower: u32) -> Self {
        Self {
            left,
            upper,
            right,
            lower,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.lower.saturating_sub(self.upper)
    }
}

/// Two squares of side `min(width, height)`: one anchored at the origin and
/// one at the far end of the long axis. Portrait images are cut top/bottom,
/// everything else left/right.
pub fn crop_boxes(width: u32, height: u32) -> [CropBox; 2] {
    let side = width.min(height);
    if height > width {
        [
            CropBox::new(0, 0, side, side),
            CropBox::new(0, height - side, side, height),
        ]
    } else {
        [
            CropBox::new(0, 0, side, side),
            CropBox::new(width - side, 0, width, height),
        ]
    }
}

/// Cuts `crop` out of `image`, resizes it exactly to `width`x`height` and
/// turns it a quarter clockwise when `rotate` is set.
pub fn render_crop(
    image: &DynamicImage,
    crop: CropBox,
    width: u32,
    height: u32,
    rotate: bool,
) -> DynamicImage {
    let resized = image
        .crop_imm(crop.left, crop.upper, crop.width(), crop.height())
        .resize_exact(width, height, FilterType::CatmullRom);
    if rotate { resized.rotate90() } else { resized }
}
