//! JPEG encoding and decoding for frames and stills.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat, RgbImage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),

    #[error("Encoding task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Encodes an RGB raster as JPEG. `quality` is clamped to 1-100.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let mut buffer = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut buffer);

    let mut encoder = JpegEncoder::new_with_quality(&mut cursor, quality.clamp(1, 100));
    encoder.encode(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)?;

    Ok(buffer)
}

/// [`encode_jpeg`] on the blocking pool, for use from async tasks.
pub async fn encode_jpeg_blocking(image: RgbImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    tokio::task::spawn_blocking(move || encode_jpeg(&image, quality)).await?
}

/// Decodes a JPEG buffer into an RGB raster.
pub fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn checker(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                Rgb([240, 240, 240])
            } else {
                Rgb([20, 40, 60])
            }
        })
    }

    #[test]
    fn produces_decodable_jpeg_with_same_dimensions() {
        let jpeg = encode_jpeg(&checker(64, 48), 70).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = decode_jpeg(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (64, 48));
    }

    #[test]
    fn lower_quality_is_smaller_and_zero_is_accepted() {
        let image = checker(128, 128);
        let high = encode_jpeg(&image, 95).unwrap();
        let low = encode_jpeg(&image, 10).unwrap();
        assert!(low.len() < high.len());
        assert!(!encode_jpeg(&image, 0).unwrap().is_empty());
    }
}
