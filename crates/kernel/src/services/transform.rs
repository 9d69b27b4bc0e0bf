//! Pixel transformation capability.
//!
//! The coordinator treats transformation as a black box behind
//! [`Transformer`]. [`ImageTransformer`] is the default implementation,
//! built on the `image` crate: decode, optionally resize (fit or fill), and
//! re-encode in the requested format.

use std::io::Cursor;

use anyhow::{Context, Result};
use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use tracing::debug;

use crate::request::{AspectMode, MAX_DIMENSION, OutputFormat, OutputSpec};

/// JPEG quality used when the request does not name one.
const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Turns source bytes into output bytes.
///
/// Implementations are CPU-bound and synchronous; the coordinator runs them on
/// a blocking thread.
pub trait Transformer: Send + Sync {
    fn transform(&self, source: &[u8], spec: &OutputSpec) -> Result<Vec<u8>>;
}

/// Image transformer backed by the `image` crate.
#[derive(Debug, Clone)]
pub struct ImageTransformer {
    /// Inputs larger than this are refused before decoding.
    max_input_bytes: usize,
}

impl ImageTransformer {
    pub fn new(max_input_bytes: usize) -> Self {
        Self { max_input_bytes }
    }
}

impl Transformer for ImageTransformer {
    fn transform(&self, source: &[u8], spec: &OutputSpec) -> Result<Vec<u8>> {
        // Guard against very large input files that could exhaust memory
        if source.len() > self.max_input_bytes {
            anyhow::bail!(
                "image too large: {} bytes exceeds {} byte limit",
                source.len(),
                self.max_input_bytes
            );
        }

        let img = image::load_from_memory(source).context("failed to decode source image")?;
        let (src_w, src_h) = (img.width(), img.height());
        let img = resize(img, spec);

        debug!(
            from = %format_args!("{src_w}x{src_h}"),
            to = %format_args!("{}x{}", img.width(), img.height()),
            format = %spec.format,
            "transformed image"
        );

        encode(img, spec)
    }
}

/// Clamp a dimension to MAX_DIMENSION.
fn clamp_dim(v: u32) -> u32 {
    v.clamp(1, MAX_DIMENSION)
}

fn resize(img: DynamicImage, spec: &OutputSpec) -> DynamicImage {
    let Some(size) = spec.size else {
        return img;
    };
    let (w, h) = (clamp_dim(size.width), clamp_dim(size.height));
    match spec.aspect_mode {
        AspectMode::Fit => img.resize(w, h, FilterType::Lanczos3),
        AspectMode::Fill => img.resize_to_fill(w, h, FilterType::Lanczos3),
    }
}

/// Map a 0–1 quality onto the JPEG encoder's 1–100 scale.
fn jpeg_quality(quality: Option<f64>) -> u8 {
    match quality {
        Some(q) => (q * 100.0).round().clamp(1.0, 100.0) as u8,
        None => DEFAULT_JPEG_QUALITY,
    }
}

fn encode(img: DynamicImage, spec: &OutputSpec) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    match spec.format {
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut buf, jpeg_quality(spec.quality));
            rgb.write_with_encoder(encoder)
                .context("failed to encode JPEG")?;
        }
        OutputFormat::Png => {
            img.write_to(&mut buf, image::ImageFormat::Png)
                .context("failed to encode PNG")?;
        }
        OutputFormat::WebP => {
            // The bundled WebP encoder is lossless and only takes 8-bit RGB(A).
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_to(&mut buf, image::ImageFormat::WebP)
                .context("failed to encode WebP")?;
        }
    }
    Ok(buf.into_inner())
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use image::{GenericImageView, ImageFormat, Rgba, RgbaImage};

    use super::*;
    use crate::request::OutputSize;

    fn sample_png(w: u32, h: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(w, h, |x, y| {
            Rgba([(x * 7 % 256) as u8, (y * 13 % 256) as u8, 128, 255])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn spec(format: OutputFormat, size: Option<(u32, u32)>, aspect_mode: AspectMode) -> OutputSpec {
        OutputSpec {
            format,
            size: size.map(|(width, height)| OutputSize { width, height }),
            aspect_mode,
            quality: None,
        }
    }

    fn transformer() -> ImageTransformer {
        ImageTransformer::new(50 * 1024 * 1024)
    }

    #[test]
    fn keeps_original_size_without_size() {
        let out = transformer()
            .transform(&sample_png(40, 20), &spec(OutputFormat::Png, None, AspectMode::Fit))
            .unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Png);
        assert_eq!(image::load_from_memory(&out).unwrap().dimensions(), (40, 20));
    }

    #[test]
    fn fit_preserves_aspect_ratio() {
        let out = transformer()
            .transform(
                &sample_png(40, 20),
                &spec(OutputFormat::Jpeg, Some((10, 10)), AspectMode::Fit),
            )
            .unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Jpeg);
        assert_eq!(image::load_from_memory(&out).unwrap().dimensions(), (10, 5));
    }

    #[test]
    fn fill_crops_to_exact_box() {
        let out = transformer()
            .transform(
                &sample_png(40, 20),
                &spec(OutputFormat::Png, Some((10, 10)), AspectMode::Fill),
            )
            .unwrap();
        assert_eq!(image::load_from_memory(&out).unwrap().dimensions(), (10, 10));
    }

    #[test]
    fn encodes_webp() {
        let out = transformer()
            .transform(&sample_png(8, 8), &spec(OutputFormat::WebP, None, AspectMode::Fit))
            .unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::WebP);
    }

    #[test]
    fn quality_changes_jpeg_output() {
        let src = sample_png(64, 64);
        let mut low = spec(OutputFormat::Jpeg, None, AspectMode::Fit);
        low.quality = Some(0.1);
        let mut high = low.clone();
        high.quality = Some(0.95);
        let t = transformer();
        assert_ne!(t.transform(&src, &low).unwrap(), t.transform(&src, &high).unwrap());
    }

    #[test]
    fn rejects_garbage_and_oversized_input() {
        let t = transformer();
        assert!(
            t.transform(b"not an image", &spec(OutputFormat::Png, None, AspectMode::Fit))
                .is_err()
        );

        let tiny = ImageTransformer::new(16);
        assert!(
            tiny.transform(&sample_png(8, 8), &spec(OutputFormat::Png, None, AspectMode::Fit))
                .is_err()
        );
    }

    #[test]
    fn jpeg_quality_mapping() {
        assert_eq!(jpeg_quality(None), DEFAULT_JPEG_QUALITY);
        assert_eq!(jpeg_quality(Some(0.0)), 1);
        assert_eq!(jpeg_quality(Some(0.8)), 80);
        assert_eq!(jpeg_quality(Some(1.0)), 100);
    }

    #[test]
    fn dimension_clamped_to_max() {
        assert_eq!(clamp_dim(100), 100);
        assert_eq!(clamp_dim(4096), 4096);
        assert_eq!(clamp_dim(10000), MAX_DIMENSION);
        assert_eq!(clamp_dim(0), 1);
    }
}
