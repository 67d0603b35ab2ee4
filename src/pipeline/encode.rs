//! Image encoding: `DynamicImage` → base64 JPEG wrapped in [`EncodedImage`].
//!
//! Rendered pages may carry an alpha channel (transparent PDF backgrounds
//! render as `(0,0,0,0)`), and vision models read transparent pixels as
//! black. Every page is therefore composited onto opaque white before
//! encoding. The source image is never modified; compositing works on a
//! fresh RGB buffer.
//!
//! Supporting images are uploaded by users already in a raster format and
//! are forwarded untouched with their own media type.

use crate::document::SupportingImage;
use crate::output::EncodedImage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, RgbImage};
use std::io::Cursor;
use tracing::debug;

pub const PAGE_MEDIA_TYPE: &str = "image/jpeg";

/// Flatten a rendered page onto white and encode it as base64 JPEG.
pub fn encode_page(img: &DynamicImage) -> Result<EncodedImage, image::ImageError> {
    let flattened = flatten_on_white(img);

    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(flattened).write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Jpeg)?;

    let data = STANDARD.encode(&buf);
    debug!("Encoded image → {} bytes base64", data.len());

    Ok(EncodedImage {
        data,
        media_type: PAGE_MEDIA_TYPE.to_string(),
    })
}

/// Base64 the raw upload bytes, keeping the upload's own media type.
pub fn encode_upload(upload: &SupportingImage) -> EncodedImage {
    EncodedImage {
        data: STANDARD.encode(&upload.bytes),
        media_type: upload.media_type().to_string(),
    }
}

fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (dst, src) in out.pixels_mut().zip(rgba.pixels()) {
        let alpha = src[3] as u32;
        for c in 0..3 {
            // src·α + 255·(1−α), rounded
            dst[c] = ((src[c] as u32 * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let data = encode_page(&img).expect("encode should succeed");
        assert_eq!(data.media_type, "image/jpeg");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        // JPEG SOI marker
        assert_eq!(&decoded[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn transparent_pixels_become_white() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0])));
        let flat = flatten_on_white(&img);
        assert!(flat.pixels().all(|p| p.0 == [255, 255, 255]));

        // and survive the JPEG round trip as (near) white
        let encoded = encode_page(&img).unwrap();
        let bytes = STANDARD.decode(&encoded.data).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        let px = decoded.get_pixel(1, 1);
        assert!(px[0] > 250 && px[1] > 250 && px[2] > 250, "got {px:?}");
    }

    #[test]
    fn half_transparent_black_is_mid_grey() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 128])));
        let flat = flatten_on_white(&img);
        let v = flat.get_pixel(0, 0)[0];
        assert!((126..=128).contains(&v), "got {v}");
    }

    #[test]
    fn source_image_is_untouched() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 0])));
        let _ = encode_page(&img).unwrap();
        assert_eq!(img.to_rgba8().get_pixel(0, 0).0, [10, 20, 30, 0]);
    }

    #[test]
    fn upload_keeps_media_type() {
        let upload = SupportingImage::new("license.png", vec![1, 2, 3]);
        let encoded = encode_upload(&upload);
        assert_eq!(encoded.media_type, "image/png");
        assert_eq!(STANDARD.decode(&encoded.data).unwrap(), vec![1, 2, 3]);
    }
}
