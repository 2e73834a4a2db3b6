//! Image encoding: rendered page → baseline JPEG.
//!
//! JPEG is what makes the rebuilt document small enough to upload: a
//! rasterised page at scale 1.5 is a few hundred kilobytes instead of
//! several megabytes of raw RGB. The alpha channel is dropped; pages are
//! rendered onto an opaque background anyway.

use image::DynamicImage;
use tracing::debug;

/// One encoded page ready to be embedded in the output document.
#[derive(Debug, Clone)]
pub struct EncodedPage {
    pub jpeg: Vec<u8>,
    pub width_px: u32,
    pub height_px: u32,
}

/// Map a 0–1 quality to the encoder's 1–100 scale.
pub fn quality_percent(quality: f32) -> u8 {
    (quality * 100.0).round().clamp(1.0, 100.0) as u8
}

/// Encode a rasterised page as JPEG at `quality` (0–1).
pub fn encode_jpeg(img: &DynamicImage, quality: f32) -> Result<EncodedPage, image::ImageError> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality_percent(quality));
    rgb.write_with_encoder(encoder)?;

    debug!("Encoded {}x{} page → {} bytes JPEG", rgb.width(), rgb.height(), buf.len());

    Ok(EncodedPage {
        jpeg: buf,
        width_px: rgb.width(),
        height_px: rgb.height(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn test_quality_maps_to_percent() {
        assert_eq!(quality_percent(0.85), 85);
        assert_eq!(quality_percent(1.0), 100);
        assert_eq!(quality_percent(0.001), 1);
    }

    #[test]
    fn test_encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(12, 8, Rgba([255, 0, 0, 255])));
        let page = encode_jpeg(&img, 0.9).expect("encode should succeed");
        assert_eq!((page.width_px, page.height_px), (12, 8));
        // SOI marker.
        assert_eq!(&page.jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&page.jpeg).unwrap().to_rgb8();
        let px = decoded.get_pixel(6, 4);
        assert!(px[0] > 200 && px[1] < 60 && px[2] < 60, "got {px:?}");
    }
}
