//! Letterboxing into a square canvas and the inverse crop.
//!
//! Both directions derive the content rectangle from `content_rect`, so the
//! integer truncation is identical on the way out and on the way back.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};

use crate::codec::{ImageAsset, ImageError};

/// Where the original picture sits inside a `target x target` canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

pub fn content_rect(width: u32, height: u32, target: u32) -> Result<ContentRect, ImageError> {
    if width == 0 || height == 0 {
        return Err(ImageError::InvalidDimensions { width, height });
    }
    if target == 0 {
        return Err(ImageError::InvalidDimensions {
            width: target,
            height: target,
        });
    }
    let (w, h, t) = (u64::from(width), u64::from(height), u64::from(target));
    let (content_width, content_height) = if w > h {
        (t, (t * h / w).max(1))
    } else {
        ((t * w / h).max(1), t)
    };
    // Both values are bounded by `target`, so the narrowing is lossless.
    let content_width = content_width as u32;
    let content_height = content_height as u32;
    Ok(ContentRect {
        x: (target - content_width) / 2,
        y: (target - content_height) / 2,
        width: content_width,
        height: content_height,
    })
}

/// Scales `image` to fit a `target x target` black canvas, centred, and
/// re-encodes it as JPEG.
pub fn pad_to_square(image: &ImageAsset, target: u32, quality: u8) -> Result<ImageAsset, ImageError> {
    let canvas = letterbox(&decode(image)?, target)?;

    Ok(ImageAsset {
        bytes: encode_jpeg(canvas, quality)?,
        mime_type: "image/jpeg".to_string(),
        width: target,
        height: target,
        name: image.name.clone(),
    })
}

/// Undoes `pad_to_square`, dropping the letterbox bars. A square output of
/// another size is rescaled to `target`; a non-square output is letterboxed
/// into `target x target` first, so it is never stretched.
pub fn crop_to_original_aspect(
    square: &ImageAsset,
    original_width: u32,
    original_height: u32,
    target: u32,
    quality: u8,
) -> Result<ImageAsset, ImageError> {
    let rect = content_rect(original_width, original_height, target)?;
    let decoded = decode(square)?;
    let canvas = if decoded.width() == target && decoded.height() == target {
        decoded.to_rgb8()
    } else {
        letterbox(&decoded, target)?
    };
    let cropped = image::imageops::crop_imm(&canvas, rect.x, rect.y, rect.width, rect.height).to_image();

    Ok(ImageAsset {
        bytes: encode_jpeg(cropped, quality)?,
        mime_type: "image/jpeg".to_string(),
        width: rect.width,
        height: rect.height,
        name: square.name.clone(),
    })
}

fn letterbox(decoded: &DynamicImage, target: u32) -> Result<RgbImage, ImageError> {
    let rect = content_rect(decoded.width(), decoded.height(), target)?;
    let scaled = decoded
        .resize_exact(rect.width, rect.height, FilterType::Triangle)
        .to_rgb8();
    let mut canvas = RgbImage::from_pixel(target, target, Rgb([0, 0, 0]));
    image::imageops::overlay(&mut canvas, &scaled, i64::from(rect.x), i64::from(rect.y));
    Ok(canvas)
}

fn decode(asset: &ImageAsset) -> Result<DynamicImage, ImageError> {
    let decoded =
        image::load_from_memory(&asset.bytes).map_err(|err| ImageError::Decode(err.to_string()))?;
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(ImageError::InvalidDimensions {
            width: decoded.width(),
            height: decoded.height(),
        });
    }
    Ok(decoded)
}

fn encode_jpeg(image: RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
    encoder
        .encode_image(&DynamicImage::ImageRgb8(image))
        .map_err(|err| ImageError::Encode(err.to_string()))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgb, RgbImage};

    use super::*;

    fn asset(width: u32, height: u32) -> anyhow::Result<ImageAsset> {
        let image = RgbImage::from_pixel(width, height, Rgb([200, 180, 160]));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png)?;
        Ok(ImageAsset::from_bytes(out.into_inner(), Some("image/png"), None)?)
    }

    #[test]
    fn portrait_example_is_centred_horizontally() -> anyhow::Result<()> {
        let rect = content_rect(1200, 1600, 1024)?;
        assert_eq!(
            rect,
            ContentRect {
                x: 128,
                y: 0,
                width: 768,
                height: 1024
            }
        );
        Ok(())
    }

    #[test]
    fn landscape_and_square_rects() -> anyhow::Result<()> {
        assert_eq!(
            content_rect(1600, 900, 1024)?,
            ContentRect {
                x: 0,
                y: 224,
                width: 1024,
                height: 576
            }
        );
        assert_eq!(
            content_rect(500, 500, 1024)?,
            ContentRect {
                x: 0,
                y: 0,
                width: 1024,
                height: 1024
            }
        );
        // Extreme strips keep at least one pixel of content.
        assert_eq!(content_rect(10_000, 1, 64)?.height, 1);
        Ok(())
    }

    #[test]
    fn zero_area_is_rejected() {
        assert!(matches!(
            content_rect(0, 10, 1024),
            Err(ImageError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            content_rect(10, 10, 0),
            Err(ImageError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn pad_produces_black_letterbox() -> anyhow::Result<()> {
        let padded = pad_to_square(&asset(120, 160)?, 64, 85)?;
        assert_eq!((padded.width, padded.height), (64, 64));
        assert_eq!(padded.mime_type, "image/jpeg");

        let decoded = image::load_from_memory(&padded.bytes)?.to_rgb8();
        assert_eq!(decoded.dimensions(), (64, 64));
        // 48x64 content at x=8: the outer columns are bars, the centre is content.
        let bar = decoded.get_pixel(1, 32);
        let content = decoded.get_pixel(32, 32);
        assert!(bar.0.iter().all(|channel| *channel < 20));
        assert!(content.0[0] > 150);
        Ok(())
    }

    #[test]
    fn round_trip_restores_aspect_within_a_pixel() -> anyhow::Result<()> {
        for (width, height, target) in [
            (1200, 1600, 256),
            (1600, 900, 256),
            (333, 777, 200),
            (1000, 999, 128),
            (64, 64, 100),
            (3, 1000, 96),
        ] {
            let padded = pad_to_square(&asset(width, height)?, target, 85)?;
            let restored = crop_to_original_aspect(&padded, width, height, target, 95)?;
            let expected_width = f64::from(target) * f64::from(width) / f64::from(height);
            let expected_height = f64::from(target) * f64::from(height) / f64::from(width);
            if width > height {
                assert_eq!(restored.width, target);
                assert!((f64::from(restored.height) - expected_height).abs() < 1.0);
            } else {
                assert_eq!(restored.height, target);
                assert!((f64::from(restored.width) - expected_width).abs() < 1.0);
            }
            let decoded = image::load_from_memory(&restored.bytes)?;
            assert_eq!(decoded.width(), restored.width);
            assert_eq!(decoded.height(), restored.height);
        }
        Ok(())
    }

    #[test]
    fn crop_rescales_off_size_outputs() -> anyhow::Result<()> {
        let provider_output = asset(512, 512)?;
        let restored = crop_to_original_aspect(&provider_output, 1200, 1600, 1024, 95)?;
        assert_eq!((restored.width, restored.height), (768, 1024));
        Ok(())
    }

    #[test]
    fn non_square_outputs_are_fitted_not_stretched() -> anyhow::Result<()> {
        // 200x100 lands as 128x64 at y=32; the portrait crop keeps x=32..96.
        let provider_output = asset(200, 100)?;
        let restored = crop_to_original_aspect(&provider_output, 100, 200, 128, 95)?;
        assert_eq!((restored.width, restored.height), (64, 128));

        let decoded = image::load_from_memory(&restored.bytes)?.to_rgb8();
        assert!(decoded.get_pixel(32, 4).0.iter().all(|channel| *channel < 20));
        assert!(decoded.get_pixel(32, 64).0[0] > 150);
        Ok(())
    }

    #[test]
    fn undecodable_bytes_fail_cleanly() {
        let broken = ImageAsset {
            bytes: b"nope".to_vec(),
            mime_type: "image/png".to_string(),
            width: 10,
            height: 10,
            name: None,
        };
        assert!(matches!(pad_to_square(&broken, 64, 85), Err(ImageError::Decode(_))));
        assert!(matches!(
            crop_to_original_aspect(&broken, 10, 10, 64, 95),
            Err(ImageError::Decode(_))
        ));
    }
}
