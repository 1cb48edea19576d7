//! Image intake checks and compression.
//!
//! Phone photos of labels are often several megabytes. We shrink them before
//! sending them to the model, but a failed shrink is never an error: we just
//! send the original.

use clap::Args;
use image::{DynamicImage, codecs::jpeg::JpegEncoder, imageops::FilterType};

use crate::{
    async_utils::spawn_blocking_propagating_panics, cpu_limit::with_cpu_semaphore,
    prelude::*,
};

/// The image types we accept.
pub const ACCEPTED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png"];

/// Image preprocessing options.
#[derive(Args, Clone, Debug)]
pub struct PreprocessOpts {
    /// Downscale images so their longest side is at most this many pixels.
    #[clap(long, default_value = "1920")]
    pub max_dimension: u32,

    /// JPEG quality used when re-encoding images (1 to 100).
    #[clap(long, default_value = "80", value_parser = clap::value_parser!(u8).range(1..=100))]
    pub jpeg_quality: u8,

    /// Reject images larger than this many bytes.
    #[clap(long, default_value = "52428800")]
    pub max_upload_bytes: u64,
}

impl Default for PreprocessOpts {
    fn default() -> Self {
        Self {
            max_dimension: 1920,
            jpeg_quality: 80,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Why we refused an image.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum IntakeError {
    #[error("unsupported image type {0:?} (expected JPEG or PNG)")]
    UnsupportedType(String),
    #[error("could not determine image type")]
    UnknownType,
    #[error("image is {size} bytes, which is over the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
}

/// Work out an image's MIME type. The bytes themselves win, then a declared
/// type, then the file extension.
pub fn detect_mime_type(declared: Option<&str>, bytes: &[u8], path: &Path) -> Option<String> {
    infer::get(bytes)
        .map(|t| t.mime_type().to_owned())
        .or_else(|| {
            declared
                .map(|m| m.trim().to_ascii_lowercase())
                .filter(|m| !m.is_empty())
        })
        .or_else(|| mime_guess::from_path(path).first_raw().map(str::to_owned))
}

/// Check an image's size. Callers can do this before reading the file.
pub fn check_size(size: u64, opts: &PreprocessOpts) -> Result<(), IntakeError> {
    if size > opts.max_upload_bytes {
        return Err(IntakeError::TooLarge {
            size,
            limit: opts.max_upload_bytes,
        });
    }
    Ok(())
}

/// Check that an image is one we're willing to process.
pub fn check_intake(
    mime_type: Option<&str>,
    size: u64,
    opts: &PreprocessOpts,
) -> Result<(), IntakeError> {
    let mime_type = mime_type.ok_or(IntakeError::UnknownType)?;
    if !ACCEPTED_MIME_TYPES.contains(&mime_type) {
        return Err(IntakeError::UnsupportedType(mime_type.to_owned()));
    }
    check_size(size, opts)
}

/// An image ready to send to the model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// Did we replace the original bytes?
    pub compressed: bool,
}

impl PreparedImage {
    fn original(bytes: &[u8], mime_type: &str) -> Self {
        Self {
            bytes: bytes.to_vec(),
            mime_type: mime_type.to_owned(),
            compressed: false,
        }
    }
}

/// Downscale and re-encode as JPEG, or return the original if that fails or
/// doesn't help.
pub fn compress_image(bytes: &[u8], mime_type: &str, opts: &PreprocessOpts) -> PreparedImage {
    match try_compress(bytes, opts) {
        Ok(compressed) if compressed.len() < bytes.len() => {
            debug!(
                before = bytes.len(),
                after = compressed.len(),
                "Compressed image"
            );
            PreparedImage {
                bytes: compressed,
                mime_type: "image/jpeg".to_owned(),
                compressed: true,
            }
        }
        Ok(_) => {
            debug!("Compression did not shrink image, keeping original");
            PreparedImage::original(bytes, mime_type)
        }
        Err(err) => {
            warn!("Could not compress image, keeping original: {err:#}");
            PreparedImage::original(bytes, mime_type)
        }
    }
}

fn try_compress(bytes: &[u8], opts: &PreprocessOpts) -> Result<Vec<u8>> {
    let image = image::load_from_memory(bytes).context("could not decode image")?;
    let max = opts.max_dimension.max(1);
    let image = if image.width() > max || image.height() > max {
        image.resize(max, max, FilterType::Triangle)
    } else {
        image
    };
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());

    let mut out = vec![];
    let encoder = JpegEncoder::new_with_quality(&mut out, opts.jpeg_quality.clamp(1, 100));
    rgb.write_with_encoder(encoder)
        .context("could not encode JPEG")?;
    Ok(out)
}

/// [`compress_image`] on the blocking pool, limited to one image per CPU.
#[instrument(level = "debug", skip_all, fields(size = bytes.len()))]
pub async fn preprocess_image(
    bytes: Vec<u8>,
    mime_type: String,
    opts: PreprocessOpts,
) -> Result<PreparedImage> {
    with_cpu_semaphore(|| async move {
        Ok(spawn_blocking_propagating_panics(move || {
            compress_image(&bytes, &mime_type, &opts)
        })
        .await)
    })
    .await
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use image::{ImageFormat, Rgb, RgbImage};

    use super::*;

    /// A noisy PNG, which JPEG will shrink.
    pub(crate) fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_fn(width, height, |x, y| {
            let v = (x.wrapping_mul(31) ^ y.wrapping_mul(17)) as u8;
            Rgb([v, v.wrapping_add(80), v.wrapping_mul(3)])
        });
        let mut out = Cursor::new(vec![]);
        DynamicImage::ImageRgb8(image)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn detects_types() {
        let png = noisy_png(4, 4);
        assert_eq!(
            detect_mime_type(None, &png, Path::new("x.bin")).as_deref(),
            Some("image/png")
        );
        assert_eq!(
            detect_mime_type(Some("IMAGE/JPEG"), &png, Path::new("x.png")).as_deref(),
            Some("image/png")
        );
        assert_eq!(
            detect_mime_type(Some("IMAGE/JPEG"), b"????", Path::new("x.png")).as_deref(),
            Some("image/jpeg")
        );
        assert_eq!(
            detect_mime_type(None, b"????", Path::new("label.jpg")).as_deref(),
            Some("image/jpeg")
        );
    }

    #[test]
    fn sniffed_bytes_beat_declared_type() {
        let pdf = b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n1 0 obj\n<<>>\nendobj\n";
        let mime_type = detect_mime_type(Some("image/jpeg"), pdf, Path::new("label.jpg"));
        assert_eq!(mime_type.as_deref(), Some("application/pdf"));
        assert_eq!(
            check_intake(mime_type.as_deref(), pdf.len() as u64, &PreprocessOpts::default()),
            Err(IntakeError::UnsupportedType("application/pdf".to_owned()))
        );
    }

    #[test]
    fn intake_rules() {
        let opts = PreprocessOpts::default();
        assert_eq!(check_intake(Some("image/png"), 10, &opts), Ok(()));
        assert_eq!(
            check_intake(Some("application/pdf"), 10, &opts),
            Err(IntakeError::UnsupportedType("application/pdf".to_owned()))
        );
        assert_eq!(check_intake(None, 10, &opts), Err(IntakeError::UnknownType));
        assert!(matches!(
            check_intake(Some("image/jpeg"), 50 * 1024 * 1024 + 1, &opts),
            Err(IntakeError::TooLarge { .. })
        ));
        let small = PreprocessOpts {
            max_upload_bytes: 100,
            ..PreprocessOpts::default()
        };
        assert_eq!(check_size(100, &small), Ok(()));
        assert_eq!(
            check_size(101, &small),
            Err(IntakeError::TooLarge { size: 101, limit: 100 })
        );
    }

    #[test]
    fn downscales_large_images() {
        let png = noisy_png(400, 200);
        let opts = PreprocessOpts {
            max_dimension: 100,
            ..PreprocessOpts::default()
        };
        let prepared = compress_image(&png, "image/png", &opts);
        assert!(prepared.compressed);
        assert_eq!(prepared.mime_type, "image/jpeg");
        let decoded = image::load_from_memory(&prepared.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 50));
    }

    #[test]
    fn keeps_original_on_garbage() {
        let prepared = compress_image(b"not an image", "image/png", &PreprocessOpts::default());
        assert!(!prepared.compressed);
        assert_eq!(prepared.bytes, b"not an image");
        assert_eq!(prepared.mime_type, "image/png");
    }

    #[tokio::test]
    async fn preprocesses_on_blocking_pool() {
        let png = noisy_png(64, 64);
        let prepared = preprocess_image(png, "image/png".to_owned(), PreprocessOpts::default())
            .await
            .unwrap();
        assert!(!prepared.bytes.is_empty());
    }
}
