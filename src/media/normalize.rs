//! Content normalization
//!
//! Images larger than the configured bounding box are scaled down with
//! "embed" semantics: the picture is fitted inside `max_width x max_height`
//! preserving its aspect ratio and centred on a canvas of exactly that size,
//! padded rather than cropped. Images already inside the box are returned
//! byte-for-byte so they never lose quality to a re-encode.
//!
//! Audio and video go through an explicit pass-through. That is the hook for
//! a future transcoding step; nothing is re-encoded today.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader, Limits, RgbaImage};
use thiserror::Error;

use super::classify::{MediaClassification, MediaKind};

/// Default bounding box (pixels)
pub const DEFAULT_MAX_WIDTH: u32 = 2048;
pub const DEFAULT_MAX_HEIGHT: u32 = 2048;

/// Default ceiling on memory a single decode may allocate (512MB)
pub const DEFAULT_MAX_DECODE_ALLOC: u64 = 512 * 1024 * 1024;

/// Largest source dimension the decoder will accept
pub const MAX_DECODE_DIMENSION: u32 = 32_768;

const JPEG_QUALITY: u8 = 90;

/// Errors raised while normalizing a payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("cannot decode {mime_type}: {reason}")]
    Decode { mime_type: String, reason: String },

    #[error("cannot re-encode {mime_type}: {reason}")]
    Encode { mime_type: String, reason: String },

    #[error("cannot resize {mime_type} ({width}x{height}): no codec for this format")]
    ResizeUnsupported {
        mime_type: String,
        width: u32,
        height: u32,
    },

    #[error("invalid bounding box {width}x{height}")]
    InvalidBounds { width: u32, height: u32 },

    #[error("normalization task failed: {0}")]
    Task(String),
}

/// Bytes after format-specific normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedMedia {
    pub bytes: Vec<u8>,

    /// Whether the payload was re-encoded
    pub transformed: bool,

    /// Output dimensions, for images
    pub dimensions: Option<(u32, u32)>,
}

impl NormalizedMedia {
    fn unchanged(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            transformed: false,
            dimensions: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Normalizer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub max_decode_alloc: u64,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_MAX_WIDTH,
            max_height: DEFAULT_MAX_HEIGHT,
            max_decode_alloc: DEFAULT_MAX_DECODE_ALLOC,
        }
    }
}

impl NormalizeConfig {
    pub fn with_bounds(mut self, max_width: u32, max_height: u32) -> Self {
        self.max_width = max_width;
        self.max_height = max_height;
        self
    }

    pub fn with_max_decode_alloc(mut self, max_decode_alloc: u64) -> Self {
        self.max_decode_alloc = max_decode_alloc;
        self
    }
}

/// Dispatches payloads to a per-family normalizer
#[derive(Debug, Clone, Default)]
pub struct ContentNormalizer {
    config: NormalizeConfig,
}

impl ContentNormalizer {
    pub fn new(config: NormalizeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizeConfig {
        &self.config
    }

    /// Normalize `bytes` according to their classification.
    pub fn normalize(
        &self,
        bytes: Vec<u8>,
        classification: &MediaClassification,
    ) -> Result<NormalizedMedia, ProcessingError> {
        match classification.kind {
            MediaKind::Image => self.normalize_image(bytes, &classification.mime_type),
            MediaKind::Audio => Ok(self.normalize_audio(bytes)),
            MediaKind::Video => Ok(self.normalize_video(bytes)),
            MediaKind::Other => Ok(NormalizedMedia::unchanged(bytes)),
        }
    }

    /// Audio pass-through. Transcoding would be added here.
    fn normalize_audio(&self, bytes: Vec<u8>) -> NormalizedMedia {
        tracing::trace!(size = bytes.len(), "audio passed through unchanged");
        NormalizedMedia::unchanged(bytes)
    }

    /// Video pass-through. Transcoding would be added here.
    fn normalize_video(&self, bytes: Vec<u8>) -> NormalizedMedia {
        tracing::trace!(size = bytes.len(), "video passed through unchanged");
        NormalizedMedia::unchanged(bytes)
    }

    fn normalize_image(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<NormalizedMedia, ProcessingError> {
        let NormalizeConfig {
            max_width,
            max_height,
            ..
        } = self.config;
        if max_width == 0 || max_height == 0 {
            return Err(ProcessingError::InvalidBounds {
                width: max_width,
                height: max_height,
            });
        }

        let Some(format) = codec_for(mime_type) else {
            return self.keep_without_codec(bytes, mime_type);
        };

        let image = self.decode(&bytes, format, mime_type)?;
        let (width, height) = image.dimensions();

        if width <= max_width && height <= max_height {
            tracing::debug!(width, height, "image within bounds, keeping original bytes");
            return Ok(NormalizedMedia {
                bytes,
                transformed: false,
                dimensions: Some((width, height)),
            });
        }

        let embedded = embed(&image, max_width, max_height);
        let encoded = encode(embedded, format, mime_type)?;

        tracing::debug!(
            from_width = width,
            from_height = height,
            to_width = max_width,
            to_height = max_height,
            size = encoded.len(),
            "image resized"
        );

        Ok(NormalizedMedia {
            bytes: encoded,
            transformed: true,
            dimensions: Some((max_width, max_height)),
        })
    }

    /// Formats this build cannot decode (HEIF, AVIF, PSD, ...) are kept
    /// as-is when their header dimensions already fit the box.
    fn keep_without_codec(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<NormalizedMedia, ProcessingError> {
        let size = imagesize::blob_size(&bytes).map_err(|e| ProcessingError::Decode {
            mime_type: mime_type.to_string(),
            reason: e.to_string(),
        })?;
        let width = u32::try_from(size.width).unwrap_or(u32::MAX);
        let height = u32::try_from(size.height).unwrap_or(u32::MAX);

        if width > self.config.max_width || height > self.config.max_height {
            return Err(ProcessingError::ResizeUnsupported {
                mime_type: mime_type.to_string(),
                width,
                height,
            });
        }

        tracing::debug!(width, height, mime_type, "no codec for image, keeping original bytes");
        Ok(NormalizedMedia {
            bytes,
            transformed: false,
            dimensions: Some((width, height)),
        })
    }

    fn decode(
        &self,
        bytes: &[u8],
        format: ImageFormat,
        mime_type: &str,
    ) -> Result<DynamicImage, ProcessingError> {
        let mut limits = Limits::default();
        limits.max_image_width = Some(MAX_DECODE_DIMENSION);
        limits.max_image_height = Some(MAX_DECODE_DIMENSION);
        limits.max_alloc = Some(self.config.max_decode_alloc);

        let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
        reader.limits(limits);
        reader.decode().map_err(|e| ProcessingError::Decode {
            mime_type: mime_type.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Image formats this build can both decode and re-encode
fn codec_for(mime_type: &str) -> Option<ImageFormat> {
    match mime_type {
        "image/png" => Some(ImageFormat::Png),
        "image/jpeg" => Some(ImageFormat::Jpeg),
        "image/gif" => Some(ImageFormat::Gif),
        "image/webp" => Some(ImageFormat::WebP),
        "image/bmp" => Some(ImageFormat::Bmp),
        "image/tiff" => Some(ImageFormat::Tiff),
        "image/x-icon" | "image/vnd.microsoft.icon" => Some(ImageFormat::Ico),
        _ => None,
    }
}

/// Fit `image` inside `max_width x max_height` and pad to exactly that size.
fn embed(image: &DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let scale = f64::min(
        f64::from(max_width) / f64::from(width),
        f64::from(max_height) / f64::from(height),
    );

    let scaled_width = ((f64::from(width) * scale).round() as u32).clamp(1, max_width);
    let scaled_height = ((f64::from(height) * scale).round() as u32).clamp(1, max_height);
    let scaled = image.resize_exact(scaled_width, scaled_height, FilterType::Lanczos3);

    let mut canvas = RgbaImage::new(max_width, max_height);
    let x = (max_width - scaled_width) / 2;
    let y = (max_height - scaled_height) / 2;
    imageops::overlay(&mut canvas, &scaled.to_rgba8(), i64::from(x), i64::from(y));

    DynamicImage::ImageRgba8(canvas)
}

fn encode(
    image: DynamicImage,
    format: ImageFormat,
    mime_type: &str,
) -> Result<Vec<u8>, ProcessingError> {
    let encode_err = |e: image::ImageError| ProcessingError::Encode {
        mime_type: mime_type.to_string(),
        reason: e.to_string(),
    };

    let mut out = Cursor::new(Vec::new());
    match format {
        // JPEG has no alpha channel: transparent padding becomes black.
        ImageFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY))
                .map_err(encode_err)?;
        }
        _ => image.write_to(&mut out, format).map_err(encode_err)?,
    }
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 40, 40]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([10, 120, 200]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    fn dimensions_of(bytes: &[u8]) -> (u32, u32) {
        image::load_from_memory(bytes).unwrap().dimensions()
    }

    fn normalizer(max_width: u32, max_height: u32) -> ContentNormalizer {
        ContentNormalizer::new(NormalizeConfig::default().with_bounds(max_width, max_height))
    }

    #[test]
    fn test_image_at_bounds_is_unchanged() {
        let bytes = png(80, 60);
        let classification = MediaClassification::sniff(&bytes);
        let out = normalizer(80, 60)
            .normalize(bytes.clone(), &classification)
            .unwrap();
        assert!(!out.transformed);
        assert_eq!(out.bytes, bytes);
        assert_eq!(out.dimensions, Some((80, 60)));
    }

    #[test]
    fn test_image_one_pixel_too_wide_is_resized() {
        let bytes = png(81, 60);
        let classification = MediaClassification::sniff(&bytes);
        let out = normalizer(80, 60).normalize(bytes, &classification).unwrap();
        assert!(out.transformed);

        let (width, height) = dimensions_of(&out.bytes);
        assert_eq!(width.max(height), 80);
        assert!(width <= 80 && height <= 60);
    }

    #[test]
    fn test_embed_pads_to_full_box() {
        // Matches the original behaviour: 1200x900 into 800x600 is 800x600.
        let bytes = jpeg(120, 90);
        let classification = MediaClassification::sniff(&bytes);
        let out = normalizer(80, 60).normalize(bytes, &classification).unwrap();
        assert_eq!(dimensions_of(&out.bytes), (80, 60));
        assert_eq!(MediaClassification::sniff(&out.bytes).mime_type, "image/jpeg");
    }

    #[test]
    fn test_embed_preserves_aspect_ratio_with_padding() {
        // 400x100 into 100x100: content is 100x25, centred vertically.
        let bytes = png(400, 100);
        let classification = MediaClassification::sniff(&bytes);
        let out = normalizer(100, 100).normalize(bytes, &classification).unwrap();

        let img = image::load_from_memory(&out.bytes).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (100, 100));
        // Top-left corner is padding, centre is content.
        assert_eq!(img.get_pixel(0, 0)[3], 0);
        assert_eq!(img.get_pixel(50, 50)[3], 255);
    }

    #[test]
    fn test_small_image_untouched() {
        let bytes = png(40, 30);
        let classification = MediaClassification::sniff(&bytes);
        let out = normalizer(800, 600)
            .normalize(bytes.clone(), &classification)
            .unwrap();
        assert_eq!(out.bytes, bytes);
    }

    #[test]
    fn test_corrupt_image_fails() {
        let mut bytes = png(50, 50);
        bytes.truncate(40);
        let classification = MediaClassification::sniff(&bytes);
        assert_eq!(classification.mime_type, "image/png");

        let err = normalizer(80, 60)
            .normalize(bytes, &classification)
            .unwrap_err();
        assert!(matches!(err, ProcessingError::Decode { .. }));
    }

    #[test]
    fn test_decode_limit_enforced() {
        let bytes = png(200, 200);
        let classification = MediaClassification::sniff(&bytes);
        let normalizer = ContentNormalizer::new(
            NormalizeConfig::default()
                .with_bounds(10, 10)
                .with_max_decode_alloc(1024),
        );
        assert!(matches!(
            normalizer.normalize(bytes, &classification),
            Err(ProcessingError::Decode { .. })
        ));
    }

    #[test]
    fn test_audio_passes_through() {
        let mut bytes = b"ID3".to_vec();
        bytes.resize(256, 0);
        let classification = MediaClassification::sniff(&bytes);
        assert_eq!(classification.kind, MediaKind::Audio);

        let out = normalizer(1, 1)
            .normalize(bytes.clone(), &classification)
            .unwrap();
        assert_eq!(out.bytes, bytes);
        assert!(!out.transformed);
        assert!(out.dimensions.is_none());
    }

    fn ico(size: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(size, size, image::Rgba([0, 90, 160, 255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Ico)
            .unwrap();
        out.into_inner()
    }

    /// Photoshop header declaring `width x height`; no pixel data.
    fn psd_header(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = b"8BPS".to_vec();
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(&[0; 6]);
        bytes.extend_from_slice(&3u16.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&8u16.to_be_bytes());
        bytes.extend_from_slice(&3u16.to_be_bytes());
        bytes.resize(64, 0);
        bytes
    }

    #[test]
    fn test_favicon_within_bounds_is_unchanged() {
        let bytes = ico(16);
        let classification = MediaClassification::sniff(&bytes);
        assert!(matches!(
            classification.mime_type.as_str(),
            "image/x-icon" | "image/vnd.microsoft.icon"
        ));
        assert_eq!(classification.kind, MediaKind::Image);

        let out = normalizer(64, 64)
            .normalize(bytes.clone(), &classification)
            .unwrap();
        assert!(!out.transformed);
        assert_eq!(out.bytes, bytes);
        assert_eq!(out.dimensions, Some((16, 16)));
    }

    #[test]
    fn test_oversized_favicon_is_resized() {
        let bytes = ico(64);
        let classification = MediaClassification::sniff(&bytes);
        let out = normalizer(32, 32).normalize(bytes, &classification).unwrap();
        assert!(out.transformed);
        let decoded = image::load_from_memory_with_format(&out.bytes, ImageFormat::Ico).unwrap();
        assert_eq!(decoded.dimensions(), (32, 32));
    }

    #[test]
    fn test_codecless_image_within_bounds_passes_through() {
        let bytes = psd_header(10, 20);
        let classification = MediaClassification::sniff(&bytes);
        assert_eq!(classification.kind, MediaKind::Image);

        let out = normalizer(64, 64)
            .normalize(bytes.clone(), &classification)
            .unwrap();
        assert!(!out.transformed);
        assert_eq!(out.bytes, bytes);
        assert_eq!(out.dimensions, Some((10, 20)));
    }

    #[test]
    fn test_codecless_image_too_large_cannot_be_resized() {
        let bytes = psd_header(5000, 10);
        let classification = MediaClassification::sniff(&bytes);
        assert_eq!(
            normalizer(64, 64).normalize(bytes, &classification),
            Err(ProcessingError::ResizeUnsupported {
                mime_type: classification.mime_type.clone(),
                width: 5000,
                height: 10,
            })
        );
    }

    #[test]
    fn test_codecless_image_with_unreadable_header() {
        let classification = MediaClassification {
            mime_type: "image/heif".into(),
            kind: MediaKind::Image,
            extension: Some("heif".into()),
        };
        assert!(matches!(
            normalizer(10, 10).normalize(vec![0xAB; 16], &classification),
            Err(ProcessingError::Decode { .. })
        ));
    }

    #[test]
    fn test_zero_bounds_rejected() {
        let bytes = png(4, 4);
        let classification = MediaClassification::sniff(&bytes);
        assert!(matches!(
            normalizer(0, 10).normalize(bytes, &classification),
            Err(ProcessingError::InvalidBounds { .. })
        ));
    }
}
