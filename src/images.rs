use crate::s3::S3Service;
use crate::{Result, WorkerError};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{imageops::FilterType, DynamicImage, ImageOutputFormat};
use std::io::Cursor;
use tracing::{debug, error};

const THUMBNAIL_SIZE: (u32, u32) = (128, 128);
const JPEG_QUALITY: u8 = 85;

/// Turns a stored image into an encoded thumbnail payload. Failures stay
/// behind this boundary; callers only ever see an absent result.
#[async_trait]
pub trait ThumbnailPipeline: Send + Sync {
    async fn process_image(&self, exercise_id: &str, key: &str) -> Option<String>;
}

pub struct ImageProcessor {
    s3: S3Service,
}

impl ImageProcessor {
    pub fn new(s3: S3Service) -> ImageProcessor {
        ImageProcessor { s3 }
    }
}

#[async_trait]
impl ThumbnailPipeline for ImageProcessor {
    async fn process_image(&self, exercise_id: &str, key: &str) -> Option<String> {
        let data = self.s3.get_image(key).await?;

        let encoded =
            tokio::task::spawn_blocking(move || encode_thumbnail(&data, THUMBNAIL_SIZE)).await;

        match encoded {
            Ok(Ok(thumbnail)) => {
                debug!(
                    "Generated {} byte thumbnail for {}",
                    thumbnail.len(),
                    exercise_id
                );
                Some(to_data_uri(&thumbnail))
            }
            Ok(Err(err)) => {
                error!("Image processing error for {}: {}", exercise_id, err);
                None
            }
            Err(err) => {
                error!("Image processing task failed for {}: {}", exercise_id, err);
                None
            }
        }
    }
}

fn encode_thumbnail(data: &[u8], (max_width, max_height): (u32, u32)) -> Result<Vec<u8>> {
    let img = image::load_from_memory(data).map_err(|err| WorkerError::Image(err.to_string()))?;

    // flatten palette and alpha modes before JPEG encoding
    let img = DynamicImage::ImageRgb8(img.to_rgb8());

    // fit within the bounding box, keeping the aspect ratio; images already
    // inside it are re-encoded as-is rather than upscaled
    let thumbnail = if img.width() <= max_width && img.height() <= max_height {
        img
    } else {
        img.resize(max_width, max_height, FilterType::Lanczos3)
    };

    let mut buffer = Cursor::new(Vec::new());
    thumbnail
        .write_to(&mut buffer, ImageOutputFormat::Jpeg(JPEG_QUALITY))
        .map_err(|err| WorkerError::Image(err.to_string()))?;

    Ok(buffer.into_inner())
}

fn to_data_uri(jpeg: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 40, 40, 128]));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buffer, ImageOutputFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_encode_thumbnail_fits_bounding_box() {
        let thumbnail = encode_thumbnail(&png_bytes(512, 256), (128, 128)).unwrap();

        assert_eq!(
            image::guess_format(&thumbnail).unwrap(),
            image::ImageFormat::Jpeg
        );

        let decoded = image::load_from_memory(&thumbnail).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (128, 64));
    }

    #[test]
    fn test_encode_thumbnail_does_not_upscale() {
        let thumbnail = encode_thumbnail(&png_bytes(64, 32), (128, 128)).unwrap();

        let decoded = image::load_from_memory(&thumbnail).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 32));
    }

    #[test]
    fn test_encode_thumbnail_rejects_invalid_data() {
        assert!(encode_thumbnail(b"definitely not an image", (128, 128)).is_err());
    }

    #[test]
    fn test_to_data_uri() {
        let uri = to_data_uri(b"jpeg bytes");

        let payload = uri.strip_prefix("data:image/jpeg;base64,").unwrap();
        assert_eq!(STANDARD.decode(payload).unwrap(), b"jpeg bytes");
    }
}
