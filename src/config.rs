//! Configuration types for ZPL rendering.
//!
//! All service behaviour is controlled through [`ServiceConfig`], built via
//! its [`ServiceConfigBuilder`]. One struct holds every knob so the same
//! config can be shared between the dispatcher, the single-document pipeline
//! and the batch orchestrator, and logged as a whole.

use crate::error::Zpl2PdfError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default renderer endpoint (Labelary public API).
pub const DEFAULT_RENDERER_URL: &str = "http://api.labelary.com/v1";

/// Labels the renderer accepts in one request.
pub const DEFAULT_LABEL_CAP: usize = 50;

/// Configuration for the rendering service.
///
/// Built via [`ServiceConfig::builder()`] or using
/// [`ServiceConfig::default()`].
///
/// # Example
/// ```rust
/// use zpl2pdf::{LabelSize, ServiceConfig};
///
/// let config = ServiceConfig::builder()
///     .label_cap(50)
///     .max_in_flight(1)
///     .label_size(LabelSize::new(4.0, 6.0)?)
///     .build()?;
/// # Ok::<(), zpl2pdf::Zpl2PdfError>(())
/// ```
#[derive(Clone)]
pub struct ServiceConfig {
    /// Base URL of the renderer API. Default: [`DEFAULT_RENDERER_URL`].
    pub renderer_url: String,

    /// Hard per-call label limit of the renderer. Default: 50.
    ///
    /// The chunk planner never produces a window larger than this and the
    /// dispatcher re-checks every payload against it.
    pub label_cap: usize,

    /// Renderer calls allowed in flight at once. Default: 1.
    ///
    /// The public Labelary API tolerates very little parallelism from a
    /// single client; raise this only for a self-hosted renderer.
    pub max_in_flight: usize,

    /// Minimum spacing between the start of two renderer calls, in
    /// milliseconds. Default: 350 (just under 3 requests per second).
    pub min_call_interval_ms: u64,

    /// Per-request timeout for renderer calls in seconds. Default: 30.
    pub request_timeout_secs: u64,

    /// Print density in dots per millimetre (6, 8, 12 or 24). Default: 8.
    pub dpmm: u8,

    /// Physical label size. Default: 4×6 inches.
    pub label_size: LabelSize,

    /// Output format of single-document conversions. Default: PDF.
    pub output_format: OutputFormat,

    /// JPEG quality (1–100) when exporting JPEG images. Default: 85.
    pub jpeg_quality: u8,

    /// Target raster width in pixels for image export. Default: 1200.
    pub raster_width_px: u32,

    /// Ceiling on expanded labels per document (Σ copies). Default: 10 000.
    ///
    /// A single `^PQ` directive can multiply one block into millions of
    /// output pages; this keeps the expansion sequence bounded.
    pub max_labels: usize,

    /// Files of a batch processed at the same time. Default: 1.
    pub batch_concurrency: usize,

    /// Root directory for per-file batch artifacts. Default: system temp.
    pub temp_dir: Option<PathBuf>,

    /// Lifetime of signed download URLs in seconds. Default: 3600.
    pub signed_url_ttl_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            renderer_url: DEFAULT_RENDERER_URL.to_string(),
            label_cap: DEFAULT_LABEL_CAP,
            max_in_flight: 1,
            min_call_interval_ms: 350,
            request_timeout_secs: 30,
            dpmm: 8,
            label_size: LabelSize::default(),
            output_format: OutputFormat::default(),
            jpeg_quality: 85,
            raster_width_px: 1200,
            max_labels: 10_000,
            batch_concurrency: 1,
            temp_dir: None,
            signed_url_ttl_secs: 3600,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("renderer_url", &self.renderer_url)
            .field("label_cap", &self.label_cap)
            .field("max_in_flight", &self.max_in_flight)
            .field("min_call_interval_ms", &self.min_call_interval_ms)
            .field("dpmm", &self.dpmm)
            .field("label_size", &self.label_size.to_string())
            .field("output_format", &self.output_format)
            .field("max_labels", &self.max_labels)
            .field("batch_concurrency", &self.batch_concurrency)
            .finish()
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn renderer_url(mut self, url: impl Into<String>) -> Self {
        self.config.renderer_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn label_cap(mut self, cap: usize) -> Self {
        self.config.label_cap = cap;
        self
    }

    pub fn max_in_flight(mut self, n: usize) -> Self {
        self.config.max_in_flight = n.max(1);
        self
    }

    pub fn min_call_interval_ms(mut self, ms: u64) -> Self {
        self.config.min_call_interval_ms = ms;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn dpmm(mut self, dpmm: u8) -> Self {
        self.config.dpmm = dpmm;
        self
    }

    pub fn label_size(mut self, size: LabelSize) -> Self {
        self.config.label_size = size;
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.config.output_format = format;
        self
    }

    pub fn jpeg_quality(mut self, q: u8) -> Self {
        self.config.jpeg_quality = q.clamp(1, 100);
        self
    }

    pub fn raster_width_px(mut self, px: u32) -> Self {
        self.config.raster_width_px = px.max(100);
        self
    }

    pub fn max_labels(mut self, n: usize) -> Self {
        self.config.max_labels = n;
        self
    }

    pub fn batch_concurrency(mut self, n: usize) -> Self {
        self.config.batch_concurrency = n.max(1);
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = Some(dir.into());
        self
    }

    pub fn signed_url_ttl_secs(mut self, secs: u64) -> Self {
        self.config.signed_url_ttl_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, Zpl2PdfError> {
        let c = &self.config;
        if c.label_cap == 0 {
            return Err(Zpl2PdfError::InvalidConfig(
                "Label cap must be ≥ 1".into(),
            ));
        }
        if ![6, 8, 12, 24].contains(&c.dpmm) {
            return Err(Zpl2PdfError::InvalidConfig(format!(
                "dpmm must be one of 6, 8, 12, 24, got {}",
                c.dpmm
            )));
        }
        if c.max_labels == 0 {
            return Err(Zpl2PdfError::InvalidConfig(
                "Max labels must be ≥ 1".into(),
            ));
        }
        if !c.renderer_url.starts_with("http://") && !c.renderer_url.starts_with("https://") {
            return Err(Zpl2PdfError::InvalidConfig(format!(
                "Renderer URL must be http(s), got '{}'",
                c.renderer_url
            )));
        }
        Ok(self.config)
    }
}

// ── Value types ──────────────────────────────────────────────────────────

/// Labelary refuses anything above 15 inches on either edge.
const MAX_LABEL_EDGE_IN: f32 = 15.0;

/// Physical label dimensions in inches. Both edges are finite and in
/// `(0, 15]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLabelSize")]
pub struct LabelSize {
    width_in: f32,
    height_in: f32,
}

#[derive(Deserialize)]
struct RawLabelSize {
    width_in: f32,
    height_in: f32,
}

impl TryFrom<RawLabelSize> for LabelSize {
    type Error = Zpl2PdfError;

    fn try_from(raw: RawLabelSize) -> Result<Self, Self::Error> {
        LabelSize::new(raw.width_in, raw.height_in)
    }
}

impl LabelSize {
    /// # Errors
    /// [`Zpl2PdfError::InvalidLabelSize`] unless both edges are in `(0, 15]`.
    pub fn new(width_in: f32, height_in: f32) -> Result<Self, Zpl2PdfError> {
        let edge_ok = |e: f32| e > 0.0 && e <= MAX_LABEL_EDGE_IN;
        if !(edge_ok(width_in) && edge_ok(height_in)) {
            return Err(Zpl2PdfError::InvalidLabelSize {
                input: format!("{width_in}x{height_in}"),
            });
        }
        Ok(Self {
            width_in,
            height_in,
        })
    }

    pub fn width_in(&self) -> f32 {
        self.width_in
    }

    pub fn height_in(&self) -> f32 {
        self.height_in
    }
}

impl Default for LabelSize {
    fn default() -> Self {
        Self {
            width_in: 4.0,
            height_in: 6.0,
        }
    }
}

impl fmt::Display for LabelSize {
    /// Renders as the renderer's path segment, e.g. `4x6` or `2.25x1.25`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width_in, self.height_in)
    }
}

impl FromStr for LabelSize {
    type Err = Zpl2PdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Zpl2PdfError::InvalidLabelSize {
            input: s.to_string(),
        };
        let (w, h) = s
            .trim()
            .to_lowercase()
            .split_once('x')
            .map(|(w, h)| (w.trim().to_string(), h.trim().to_string()))
            .ok_or_else(invalid)?;
        let width: f32 = w.parse().map_err(|_| invalid())?;
        let height: f32 = h.parse().map_err(|_| invalid())?;
        Self::new(width, height).map_err(|_| invalid())
    }
}

/// Output produced for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One multi-page PDF, one page per label. (default)
    #[default]
    Pdf,
    /// A `.tar.gz` of lossless PNG images, one per label.
    Png,
    /// A `.tar.gz` of JPEG images, one per label.
    Jpeg,
}

impl OutputFormat {
    /// File extension of a single-document artifact in this format.
    pub fn artifact_extension(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Png | OutputFormat::Jpeg => "tar.gz",
        }
    }

    /// MIME type of a single-document artifact in this format.
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "application/pdf",
            OutputFormat::Png | OutputFormat::Jpeg => "application/gzip",
        }
    }

    /// Extension used for individual images inside an image archive.
    pub fn image_extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            _ => "png",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Pdf => write!(f, "pdf"),
            OutputFormat::Png => write!(f, "png"),
            OutputFormat::Jpeg => write!(f, "jpeg"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        let config = ServiceConfig::builder().build().expect("defaults are valid");
        assert_eq!(config.label_cap, 50);
        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.dpmm, 8);
        assert_eq!(config.output_format, OutputFormat::Pdf);
    }

    #[test]
    fn zero_label_cap_rejected() {
        let err = ServiceConfig::builder().label_cap(0).build().unwrap_err();
        assert!(matches!(err, Zpl2PdfError::InvalidConfig(_)));
    }

    #[test]
    fn unsupported_dpmm_rejected() {
        let err = ServiceConfig::builder().dpmm(10).build().unwrap_err();
        assert!(err.to_string().contains("dpmm"));
    }

    #[test]
    fn renderer_url_trailing_slash_trimmed() {
        let config = ServiceConfig::builder()
            .renderer_url("http://localhost:8080/v1/")
            .build()
            .unwrap();
        assert_eq!(config.renderer_url, "http://localhost:8080/v1");
    }

    #[test]
    fn label_size_parses_and_displays() {
        let size: LabelSize = "4x6".parse().unwrap();
        assert_eq!(size, LabelSize::new(4.0, 6.0).unwrap());
        assert_eq!(size.to_string(), "4x6");

        let size: LabelSize = " 2.25 X 1.25 ".parse().unwrap();
        assert_eq!(size.to_string(), "2.25x1.25");
    }

    #[test]
    fn label_size_rejects_garbage() {
        assert!("4by6".parse::<LabelSize>().is_err());
        assert!("0x6".parse::<LabelSize>().is_err());
        assert!("4x".parse::<LabelSize>().is_err());
        assert!("16x6".parse::<LabelSize>().is_err());
    }

    #[test]
    fn label_size_constructor_enforces_range() {
        assert!(LabelSize::new(0.0, f32::NAN).is_err());
        assert!(LabelSize::new(f32::NAN, 6.0).is_err());
        assert!(LabelSize::new(4.0, 0.0).is_err());
        assert!(LabelSize::new(-1.0, 6.0).is_err());
        assert!(LabelSize::new(4.0, f32::INFINITY).is_err());
        assert!(LabelSize::new(15.5, 6.0).is_err());

        let size = LabelSize::new(15.0, 0.5).unwrap();
        assert_eq!((size.width_in(), size.height_in()), (15.0, 0.5));
        assert!(matches!(
            LabelSize::new(0.0, 6.0),
            Err(Zpl2PdfError::InvalidLabelSize { ref input }) if input == "0x6"
        ));
    }

    #[test]
    fn label_size_deserialisation_is_validated() {
        let size: LabelSize =
            serde_json::from_str(r#"{"width_in":2.25,"height_in":1.25}"#).unwrap();
        assert_eq!(size.to_string(), "2.25x1.25");
        assert!(serde_json::from_str::<LabelSize>(r#"{"width_in":0,"height_in":6}"#).is_err());
    }

    #[test]
    fn output_format_extensions() {
        assert_eq!(OutputFormat::Pdf.artifact_extension(), "pdf");
        assert_eq!(OutputFormat::Png.artifact_extension(), "tar.gz");
        assert_eq!(OutputFormat::Jpeg.image_extension(), "jpg");
        assert_eq!(OutputFormat::Png.image_extension(), "png");
    }
}
