//! Transformation requests: parsing, validation, and fingerprinting.
//!
//! Everything here is pure. A request that fails validation is rejected
//! before any cache or network I/O happens.

use std::fmt;

use serde::Deserialize;
use url::Url;

use crate::error::{ProxyError, ProxyResult};
use crate::fingerprint::{Fingerprint, canonical_float};

/// Maximum allowed output dimension (width or height).
/// Prevents CPU-DoS from requests asking for e.g. 100000x100000 output.
pub const MAX_DIMENSION: u32 = 4096;

/// Extension used for input entries when no type hint is given.
const DEFAULT_INPUT_EXTENSION: &str = "bin";

/// Prefix marking an explicit local reference.
const FILE_SCHEME: &str = "file://";

/// Maximum length of a free-form type hint used as a file extension.
const MAX_HINT_LEN: usize = 16;

/// Raw query parameters as they arrive on `GET /image`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageParams {
    #[serde(rename = "input.source")]
    pub source: Option<String>,
    #[serde(rename = "input.typeHint")]
    pub type_hint: Option<String>,
    #[serde(rename = "output.typeToken")]
    pub type_token: Option<String>,
    #[serde(rename = "output.width")]
    pub width: Option<String>,
    #[serde(rename = "output.height")]
    pub height: Option<String>,
    #[serde(rename = "output.aspectMode")]
    pub aspect_mode: Option<String>,
    #[serde(rename = "output.quality")]
    pub quality: Option<String>,
}

/// Supported output encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Jpeg,
    Png,
    WebP,
}

impl OutputFormat {
    /// Parse a type token (short name, UTI, or MIME type), case-insensitively.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" | "public.jpeg" | "image/jpeg" => Some(Self::Jpeg),
            "png" | "public.png" | "image/png" => Some(Self::Png),
            "webp" | "org.webmproject.webp" | "image/webp" => Some(Self::WebP),
            _ => None,
        }
    }

    /// Canonical token, used in fingerprints.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::WebP => "webp",
        }
    }

    /// File extension of cache entries in this format.
    pub fn extension(self) -> &'static str {
        self.as_str()
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
        }
    }

    pub fn image_format(self) -> image::ImageFormat {
        match self {
            Self::Jpeg => image::ImageFormat::Jpeg,
            Self::Png => image::ImageFormat::Png,
            Self::WebP => image::ImageFormat::WebP,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the source is mapped onto a requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AspectMode {
    /// Scale to fit inside the box, preserving aspect ratio.
    #[default]
    Fit,
    /// Scale to cover the box, then crop the overflow.
    Fill,
}

impl AspectMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fit" => Some(Self::Fit),
            "fill" => Some(Self::Fill),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fit => "fit",
            Self::Fill => "fill",
        }
    }
}

/// Requested output box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputSize {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for OutputSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Where a source lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    /// `http://` or `https://` URL.
    Remote(Url),
    /// Path relative to the configured local root. Not yet checked for
    /// traversal; the acquirer does that against the real root.
    Local(String),
}

impl SourceRef {
    /// Classify a source identifier by shape.
    pub fn parse(identifier: &str) -> ProxyResult<Self> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(ProxyError::Validation("input.source is empty".to_string()));
        }

        let lower = identifier.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let url = Url::parse(identifier)
                .map_err(|e| ProxyError::Validation(format!("invalid source URL: {e}")))?;
            return Ok(Self::Remote(url));
        }

        if lower.starts_with(FILE_SCHEME) {
            let path = identifier.get(FILE_SCHEME.len()..).unwrap_or_default();
            return Ok(Self::Local(path.to_string()));
        }

        if let Some((scheme, _)) = identifier.split_once("://") {
            return Err(ProxyError::Validation(format!(
                "unsupported source scheme: {scheme}"
            )));
        }

        Ok(Self::Local(identifier.to_string()))
    }
}

/// Output parameters of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub format: OutputFormat,
    pub size: Option<OutputSize>,
    pub aspect_mode: AspectMode,
    pub quality: Option<f64>,
}

impl OutputSpec {
    /// Fingerprint over the output fields only.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_fields(&[
            ("format", Some(self.format.as_str().to_string())),
            ("size", self.size.map(|s| s.to_string())),
            ("aspect", Some(self.aspect_mode.as_str().to_string())),
            ("quality", self.quality.map(canonical_float)),
        ])
    }
}

/// A validated, immutable transformation request.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformRequest {
    /// Identifier exactly as the client sent it (trimmed).
    pub source: String,
    pub source_ref: SourceRef,
    pub source_type_hint: Option<String>,
    pub output: OutputSpec,
}

impl TransformRequest {
    /// Validate raw query parameters.
    pub fn from_params(params: &ImageParams) -> ProxyResult<Self> {
        let source = params
            .source
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let source_ref = SourceRef::parse(&source)?;

        let source_type_hint = match params.type_hint.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(hint) => Some(normalize_type_hint(hint)?),
        };

        let token = params
            .type_token
            .as_deref()
            .ok_or_else(|| ProxyError::Validation("output.typeToken is required".to_string()))?;
        let format = OutputFormat::from_token(token).ok_or_else(|| {
            ProxyError::Validation(format!("output type {token:?} is not supported"))
        })?;

        let size = match (params.width.as_deref(), params.height.as_deref()) {
            (None, None) => None,
            (Some(w), Some(h)) => Some(OutputSize {
                width: parse_dimension("output.width", w)?,
                height: parse_dimension("output.height", h)?,
            }),
            _ => {
                return Err(ProxyError::Validation(
                    "output.width and output.height must be given together".to_string(),
                ));
            }
        };

        let aspect_mode = match params.aspect_mode.as_deref() {
            None => AspectMode::default(),
            Some(mode) => AspectMode::parse(mode).ok_or_else(|| {
                ProxyError::Validation(format!("output.aspectMode {mode:?} must be fit or fill"))
            })?,
        };

        let quality = params.quality.as_deref().map(parse_quality).transpose()?;

        Ok(Self {
            source,
            source_ref,
            source_type_hint,
            output: OutputSpec {
                format,
                size,
                aspect_mode,
                quality,
            },
        })
    }

    /// Fingerprint over the source identifier and its type hint.
    pub fn source_fingerprint(&self) -> Fingerprint {
        Fingerprint::of_fields(&[
            ("source", Some(self.source.clone())),
            ("type", self.source_type_hint.clone()),
        ])
    }

    pub fn output_fingerprint(&self) -> Fingerprint {
        self.output.fingerprint()
    }

    /// Fingerprint of the whole request; the output cache key.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::combine(&self.source_fingerprint(), &self.output_fingerprint())
    }

    /// Extension for the input cache entry.
    pub fn input_extension(&self) -> &str {
        self.source_type_hint
            .as_deref()
            .unwrap_or(DEFAULT_INPUT_EXTENSION)
    }
}

/// Turn a type hint into a safe file extension.
fn normalize_type_hint(hint: &str) -> ProxyResult<String> {
    if let Some(format) = OutputFormat::from_token(hint) {
        return Ok(format.extension().to_string());
    }
    let lower = hint.to_ascii_lowercase();
    match lower.as_str() {
        "gif" | "public.gif" | "image/gif" => return Ok("gif".to_string()),
        "tiff" | "tif" | "public.tiff" | "image/tiff" => return Ok("tiff".to_string()),
        "bmp" | "com.microsoft.bmp" | "image/bmp" => return Ok("bmp".to_string()),
        _ => {}
    }
    if lower.is_empty()
        || lower.len() > MAX_HINT_LEN
        || !lower.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(ProxyError::Validation(format!(
            "input.typeHint {hint:?} is not a valid type token"
        )));
    }
    Ok(lower)
}

fn parse_dimension(name: &str, value: &str) -> ProxyResult<u32> {
    let parsed: u32 = value
        .trim()
        .parse()
        .map_err(|_| ProxyError::Validation(format!("{name} must be a positive integer")))?;
    if parsed == 0 || parsed > MAX_DIMENSION {
        return Err(ProxyError::Validation(format!(
            "{name} must be between 1 and {MAX_DIMENSION}"
        )));
    }
    Ok(parsed)
}

fn parse_quality(value: &str) -> ProxyResult<f64> {
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|_| ProxyError::Validation("output.quality must be a number".to_string()))?;
    if !parsed.is_finite() || !(0.0..=1.0).contains(&parsed) {
        return Err(ProxyError::Validation(
            "output.quality must be between 0 and 1".to_string(),
        ));
    }
    Ok(parsed)
}
