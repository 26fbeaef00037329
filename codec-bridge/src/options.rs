//! Codec job options and processed output.
//!
//! Options travel to the worker inside a `job` message; the worker's codec
//! interprets them. The bridge only validates them before dispatch.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Quality used for plain format conversion (no compression intent).
pub const CONVERT_QUALITY: f32 = 0.95;

/// Default quality for HEIC decoding into JPEG/PNG.
pub const HEIC_QUALITY: f32 = 0.92;

/// Quality used when rendering PDF pages and re-encoding resized images.
pub const RENDER_QUALITY: f32 = 0.92;

/// Ghostscript `-dPDFSETTINGS` presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdfQualityProfile {
    /// 72 dpi images, smallest output.
    Screen,
    /// 150 dpi images.
    #[default]
    Ebook,
    /// 300 dpi images.
    Printer,
    /// 300 dpi, colour preserving.
    Prepress,
    Default,
}

impl PdfQualityProfile {
    pub fn pdf_settings(&self) -> &'static str {
        match self {
            Self::Screen => "/screen",
            Self::Ebook => "/ebook",
            Self::Printer => "/printer",
            Self::Prepress => "/prepress",
            Self::Default => "/default",
        }
    }
}

/// Raster formats the image codecs can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageMime {
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/webp")]
    Webp,
}

impl ImageMime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn supports_alpha(&self) -> bool {
        !matches!(self, Self::Jpeg)
    }
}

/// Named compression presets offered to users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageQuality {
    LowCompression,
    #[default]
    Balanced,
    HighCompression,
}

impl ImageQuality {
    pub fn value(&self) -> f32 {
        match self {
            Self::LowCompression => 0.85,
            Self::Balanced => 0.65,
            Self::HighCompression => 0.4,
        }
    }
}

/// The operation a worker should perform on one input buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "kebab-case")]
pub enum CodecOptions {
    /// Rewrite a PDF with downsampled images.
    PdfCompress {
        #[serde(default)]
        quality_profile: PdfQualityProfile,
    },
    /// Lossy re-encode of a JPEG/PNG/WebP image.
    Image { target_mime: ImageMime, quality: f32 },
    /// Change raster format at near-lossless quality.
    ImageConvert { target_mime: ImageMime },
    /// Decode HEIC/HEIF into JPEG or PNG.
    HeicConvert {
        target_mime: ImageMime,
        #[serde(default = "default_heic_quality")]
        quality: f32,
    },
    /// Scale an image, then re-encode it.
    ///
    /// An explicit `width` or `height` wins over the `percent`-scaled one.
    Resize {
        target_mime: ImageMime,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<u32>,
        #[serde(default = "default_percent")]
        percent: u8,
    },
    /// Render one page of a PDF to a JPEG or PNG.
    PdfToImage {
        target_mime: ImageMime,
        #[serde(default = "default_render_quality")]
        quality: f32,
        /// 1-based page number.
        #[serde(default = "default_page")]
        page: u32,
    },
}

fn default_heic_quality() -> f32 {
    HEIC_QUALITY
}

fn default_render_quality() -> f32 {
    RENDER_QUALITY
}

fn default_percent() -> u8 {
    100
}

fn default_page() -> u32 {
    1
}

impl CodecOptions {
    pub fn pdf_compress(quality_profile: PdfQualityProfile) -> Self {
        Self::PdfCompress { quality_profile }
    }

    pub fn image(target_mime: ImageMime, quality: f32) -> Self {
        Self::Image {
            target_mime,
            quality,
        }
    }

    pub fn image_preset(target_mime: ImageMime, preset: ImageQuality) -> Self {
        Self::image(target_mime, preset.value())
    }

    pub fn image_convert(target_mime: ImageMime) -> Self {
        Self::ImageConvert { target_mime }
    }

    pub fn heic_convert(target_mime: ImageMime) -> Self {
        Self::HeicConvert {
            target_mime,
            quality: HEIC_QUALITY,
        }
    }

    pub fn resize_percent(target_mime: ImageMime, percent: u8) -> Self {
        Self::Resize {
            target_mime,
            width: None,
            height: None,
            percent,
        }
    }

    pub fn resize_to(target_mime: ImageMime, width: Option<u32>, height: Option<u32>) -> Self {
        Self::Resize {
            target_mime,
            width,
            height,
            percent: 100,
        }
    }

    pub fn pdf_to_image(target_mime: ImageMime, page: u32) -> Self {
        Self::PdfToImage {
            target_mime,
            quality: RENDER_QUALITY,
            page,
        }
    }

    /// Tag value as it appears on the wire.
    pub fn format_name(&self) -> &'static str {
        match self {
            Self::PdfCompress { .. } => "pdf-compress",
            Self::Image { .. } => "image",
            Self::ImageConvert { .. } => "image-convert",
            Self::HeicConvert { .. } => "heic-convert",
            Self::Resize { .. } => "resize",
            Self::PdfToImage { .. } => "pdf-to-image",
        }
    }

    /// Reject options no codec can honour.
    pub fn validate(&self) -> Result<(), BridgeError> {
        match self {
            Self::PdfCompress { .. } | Self::ImageConvert { .. } => Ok(()),
            Self::Image { quality, .. } => validate_quality(*quality),
            Self::HeicConvert {
                target_mime,
                quality,
            } => {
                if *target_mime == ImageMime::Webp {
                    return Err(BridgeError::InvalidOptions(
                        "HEIC can only be converted to image/jpeg or image/png".to_string(),
                    ));
                }
                validate_quality(*quality)
            }
            Self::Resize {
                width,
                height,
                percent,
                ..
            } => {
                if *width == Some(0) || *height == Some(0) {
                    return Err(BridgeError::InvalidOptions(
                        "resize dimensions must be non-zero".to_string(),
                    ));
                }
                if !(1..=100).contains(percent) {
                    return Err(BridgeError::InvalidOptions(format!(
                        "resize percent must be in 1..=100, got {percent}"
                    )));
                }
                Ok(())
            }
            Self::PdfToImage {
                target_mime,
                quality,
                page,
            } => {
                if *target_mime == ImageMime::Webp {
                    return Err(BridgeError::InvalidOptions(
                        "PDF pages can only be rendered to image/jpeg or image/png".to_string(),
                    ));
                }
                if *page == 0 {
                    return Err(BridgeError::InvalidOptions(
                        "page numbers start at 1".to_string(),
                    ));
                }
                validate_quality(*quality)
            }
        }
    }

    /// MIME type of a successful result.
    pub fn output_content_type(&self) -> &'static str {
        match self {
            Self::PdfCompress { .. } => "application/pdf",
            Self::Image { target_mime, .. }
            | Self::ImageConvert { target_mime }
            | Self::HeicConvert { target_mime, .. }
            | Self::Resize { target_mime, .. }
            | Self::PdfToImage { target_mime, .. } => target_mime.as_str(),
        }
    }

    /// Encoder quality in (0, 1], if the operation is a raster encode.
    pub fn effective_quality(&self) -> Option<f32> {
        match self {
            Self::PdfCompress { .. } => None,
            Self::Image { quality, .. }
            | Self::HeicConvert { quality, .. }
            | Self::PdfToImage { quality, .. } => Some(*quality),
            Self::ImageConvert { .. } => Some(CONVERT_QUALITY),
            Self::Resize { .. } => Some(RENDER_QUALITY),
        }
    }

    /// Output dimensions of a resize from a `source_width` x `source_height` image.
    pub fn resize_dimensions(&self, source_width: u32, source_height: u32) -> Option<(u32, u32)> {
        let Self::Resize {
            width,
            height,
            percent,
            ..
        } = self
        else {
            return None;
        };
        let scale = |side: u32| {
            let scaled = (f64::from(side) * f64::from(*percent) / 100.0).round() as u32;
            scaled.max(1)
        };
        Some((
            width.unwrap_or_else(|| scale(source_width)),
            height.unwrap_or_else(|| scale(source_height)),
        ))
    }

    /// Palette size for lossy PNG quantisation; `None` unless re-encoding to PNG.
    pub fn png_palette_size(&self) -> Option<u16> {
        let Self::Image {
            target_mime: ImageMime::Png,
            quality,
        } = self
        else {
            return None;
        };
        let colors = if *quality >= 0.9 {
            256
        } else if *quality >= 0.7 {
            128
        } else if *quality >= 0.5 {
            64
        } else if *quality >= 0.3 {
            32
        } else {
            16
        };
        Some(colors)
    }

    /// Whether transparent pixels must be painted white before encoding.
    pub fn flattens_alpha_from(&self, source: ImageMime) -> bool {
        matches!(
            self,
            Self::ImageConvert {
                target_mime: ImageMime::Jpeg
            }
        ) && source.supports_alpha()
    }

    /// Compression jobs get a `_compressed` suffix on their output file name.
    pub fn is_compression(&self) -> bool {
        matches!(self, Self::PdfCompress { .. } | Self::Image { .. })
    }
}

fn validate_quality(quality: f32) -> Result<(), BridgeError> {
    if quality.is_finite() && quality > 0.0 && quality <= 1.0 {
        Ok(())
    } else {
        Err(BridgeError::InvalidOptions(format!(
            "quality must be in (0, 1], got {quality}"
        )))
    }
}

/// Output of a successful job. Owned by the caller once returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedBytes {
    pub bytes: Bytes,
    pub content_type: String,
}

impl ProcessedBytes {
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Download name for this output, derived from the uploaded file name.
    ///
    /// `report.pdf` compressed becomes `report_compressed.pdf`;
    /// `IMG_0001.HEIC` converted to JPEG becomes `IMG_0001.jpg`;
    /// page 3 of `report.pdf` rendered to PNG becomes `report-page-3.png`.
    pub fn output_file_name(&self, original: &str, options: &CodecOptions) -> String {
        let stem = strip_extension(original);
        let extension = extension_for(&self.content_type);
        match options {
            CodecOptions::Resize { .. } => format!("{stem}_resized.{extension}"),
            CodecOptions::PdfToImage { page, .. } => format!("{stem}-page-{page}.{extension}"),
            _ if options.is_compression() => format!("{stem}_compressed.{extension}"),
            _ => format!("{stem}.{extension}"),
        }
    }
}

fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(dot) if dot + 1 < name.len() && !name[dot + 1..].contains('/') => &name[..dot],
        _ => name,
    }
}

fn extension_for(content_type: &str) -> &str {
    let subtype = content_type
        .split_once('/')
        .map(|(_, sub)| sub)
        .unwrap_or(content_type);
    match subtype {
        "jpeg" => "jpg",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_compress_defaults_to_ebook() {
        let opts: CodecOptions = serde_json::from_str(r#"{"format":"pdf-compress"}"#).unwrap();
        assert_eq!(opts, CodecOptions::pdf_compress(PdfQualityProfile::Ebook));
        assert_eq!(PdfQualityProfile::default().pdf_settings(), "/ebook");
    }

    #[test]
    fn image_options_serialize() {
        let opts = CodecOptions::image(ImageMime::Webp, 0.5);
        insta::assert_json_snapshot!(opts, @r#"
        {
          "format": "image",
          "target_mime": "image/webp",
          "quality": 0.5
        }
        "#);
    }

    #[test]
    fn heic_quality_defaults() {
        let opts: CodecOptions =
            serde_json::from_str(r#"{"format":"heic-convert","target_mime":"image/png"}"#)
                .unwrap();
        assert_eq!(opts.effective_quality(), Some(HEIC_QUALITY));
        assert_eq!(opts.output_content_type(), "image/png");
    }

    #[test]
    fn validate_rejects_bad_quality() {
        for quality in [0.0, -0.1, 1.5, f32::NAN] {
            let err = CodecOptions::image(ImageMime::Jpeg, quality)
                .validate()
                .unwrap_err();
            assert!(matches!(err, BridgeError::InvalidOptions(_)));
        }
        assert!(CodecOptions::image(ImageMime::Jpeg, 1.0).validate().is_ok());
    }

    #[test]
    fn validate_rejects_heic_to_webp() {
        let opts = CodecOptions::HeicConvert {
            target_mime: ImageMime::Webp,
            quality: 0.9,
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn resize_options_serialize() {
        let opts = CodecOptions::resize_to(ImageMime::Webp, Some(640), None);
        insta::assert_json_snapshot!(opts, @r#"
        {
          "format": "resize",
          "target_mime": "image/webp",
          "width": 640,
          "percent": 100
        }
        "#);

        let parsed: CodecOptions =
            serde_json::from_str(r#"{"format":"resize","target_mime":"image/png","percent":50}"#)
                .unwrap();
        assert_eq!(parsed, CodecOptions::resize_percent(ImageMime::Png, 50));
        assert_eq!(parsed.output_content_type(), "image/png");
        assert!(!parsed.is_compression());
    }

    #[test]
    fn validate_resize() {
        assert!(CodecOptions::resize_percent(ImageMime::Jpeg, 1).validate().is_ok());
        assert!(CodecOptions::resize_percent(ImageMime::Jpeg, 100).validate().is_ok());
        for bad in [
            CodecOptions::resize_percent(ImageMime::Jpeg, 0),
            CodecOptions::resize_percent(ImageMime::Jpeg, 101),
            CodecOptions::resize_to(ImageMime::Png, Some(0), Some(10)),
            CodecOptions::resize_to(ImageMime::Png, None, Some(0)),
        ] {
            let err = bad.validate().unwrap_err();
            assert!(matches!(err, BridgeError::InvalidOptions(_)), "{bad:?}");
        }
    }

    #[test]
    fn resize_dimensions_prefer_explicit_sides() {
        let half = CodecOptions::resize_percent(ImageMime::Png, 50);
        assert_eq!(half.resize_dimensions(801, 600), Some((401, 300)));
        assert_eq!(half.resize_dimensions(1, 1), Some((1, 1)));

        let fixed_width = CodecOptions::Resize {
            target_mime: ImageMime::Png,
            width: Some(100),
            height: None,
            percent: 25,
        };
        assert_eq!(fixed_width.resize_dimensions(800, 600), Some((100, 150)));
        assert_eq!(
            CodecOptions::image_convert(ImageMime::Png).resize_dimensions(800, 600),
            None
        );
    }

    #[test]
    fn pdf_to_image_defaults() {
        let opts: CodecOptions =
            serde_json::from_str(r#"{"format":"pdf-to-image","target_mime":"image/jpeg"}"#)
                .unwrap();
        assert_eq!(opts, CodecOptions::pdf_to_image(ImageMime::Jpeg, 1));
        assert_eq!(opts.effective_quality(), Some(RENDER_QUALITY));
        assert_eq!(opts.output_content_type(), "image/jpeg");
        assert_eq!(opts.format_name(), "pdf-to-image");
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn validate_pdf_to_image() {
        assert!(CodecOptions::pdf_to_image(ImageMime::Webp, 1).validate().is_err());
        assert!(CodecOptions::pdf_to_image(ImageMime::Png, 0).validate().is_err());
        let bad_quality = CodecOptions::PdfToImage {
            target_mime: ImageMime::Png,
            quality: 1.2,
            page: 1,
        };
        assert!(bad_quality.validate().is_err());
    }

    #[test]
    fn presets() {
        let opts = CodecOptions::image_preset(ImageMime::Jpeg, ImageQuality::HighCompression);
        assert_eq!(opts.effective_quality(), Some(0.4));
        assert_eq!(ImageQuality::default().value(), 0.65);
    }

    #[test]
    fn png_palette_tracks_quality() {
        let palette = |q| CodecOptions::image(ImageMime::Png, q).png_palette_size();
        assert_eq!(palette(0.95), Some(256));
        assert_eq!(palette(0.85), Some(128));
        assert_eq!(palette(0.65), Some(64));
        assert_eq!(palette(0.4), Some(32));
        assert_eq!(palette(0.1), Some(16));
        assert_eq!(
            CodecOptions::image(ImageMime::Jpeg, 0.9).png_palette_size(),
            None
        );
    }

    #[test]
    fn alpha_flattening_only_for_jpeg_conversion() {
        let to_jpeg = CodecOptions::image_convert(ImageMime::Jpeg);
        assert!(to_jpeg.flattens_alpha_from(ImageMime::Png));
        assert!(to_jpeg.flattens_alpha_from(ImageMime::Webp));
        assert!(!to_jpeg.flattens_alpha_from(ImageMime::Jpeg));
        assert!(!CodecOptions::image_convert(ImageMime::Png).flattens_alpha_from(ImageMime::Webp));
    }

    #[test]
    fn mime_parsing() {
        assert_eq!(ImageMime::from_mime("image/JPG"), Some(ImageMime::Jpeg));
        assert_eq!(ImageMime::from_mime("image/gif"), None);
    }

    #[test]
    fn output_file_names() {
        let pdf = ProcessedBytes::new(Bytes::from_static(b"%PDF"), "application/pdf");
        assert_eq!(
            pdf.output_file_name("report.pdf", &CodecOptions::pdf_compress(PdfQualityProfile::Ebook)),
            "report_compressed.pdf"
        );

        let jpg = ProcessedBytes::new(Bytes::from_static(b"\xff\xd8"), "image/jpeg");
        assert_eq!(
            jpg.output_file_name("IMG_0001.HEIC", &CodecOptions::heic_convert(ImageMime::Jpeg)),
            "IMG_0001.jpg"
        );
        assert_eq!(
            jpg.output_file_name("photo.v2.png", &CodecOptions::image(ImageMime::Jpeg, 0.6)),
            "photo.v2_compressed.jpg"
        );
        assert_eq!(
            jpg.output_file_name("noext", &CodecOptions::image_convert(ImageMime::Jpeg)),
            "noext.jpg"
        );

        let png = ProcessedBytes::new(Bytes::from_static(b"\x89PNG"), "image/png");
        assert_eq!(
            png.output_file_name("report.pdf", &CodecOptions::pdf_to_image(ImageMime::Png, 3)),
            "report-page-3.png"
        );
        assert_eq!(
            png.output_file_name("cat.webp", &CodecOptions::resize_percent(ImageMime::Png, 50)),
            "cat_resized.png"
        );
    }
}
