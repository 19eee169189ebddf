//! Configuration types for batch OCR conversion.
//!
//! All engine behaviour is controlled through [`BatchConfig`], built via its
//! [`BatchConfigBuilder`]. Keeping every knob in one struct makes it trivial to
//! share one config across the page source, OCR client, rate limiter and
//! checkpoint store, and to log it at the start of a run.

use crate::error::OcrBatchError;
use crate::rate_limit::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a batch conversion run.
///
/// # Example
/// ```rust
/// use edgequake_ocrbatch::{BatchConfig, ImageFormat};
///
/// let config = BatchConfig::builder()
///     .dpi(200)
///     .image_format(ImageFormat::Png)
///     .output_dir("out")
///     .build()
///     .unwrap();
/// assert_eq!(config.effective_chunk_size(), 5);
/// ```
#[derive(Clone)]
pub struct BatchConfig {
    /// Pages rasterised per render batch. Default: 5.
    ///
    /// Bounds peak memory: the page source never holds more than this many
    /// rendered pages at once. Ignored (treated as 1) in `single_page_mode`.
    pub chunk_size: usize,

    /// Render and submit exactly one page at a time. Default: false.
    pub single_page_mode: bool,

    /// Image encoding sent to the OCR service. Default: [`ImageFormat::Jpeg`].
    pub image_format: ImageFormat,

    /// JPEG quality, 1–100. Ignored for PNG. Default: 85.
    pub image_quality: u8,

    /// Rendering DPI used when rasterising each page. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Cap on either rendered dimension in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Retry attempts after the first on a transient failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds. Doubles per attempt. Default: 1000.
    pub retry_backoff_ms: u64,

    /// Upper bound on a single retry delay in milliseconds. Default: 30000.
    pub max_backoff_ms: u64,

    /// Per-call timeout in seconds. Default: 300.
    pub api_timeout_secs: u64,

    /// Request budget: calls per minute at the nominal rate. Default: 60.
    pub requests_per_minute: u32,

    /// Ceiling for the throttled per-request interval, in seconds. Default: 60.
    pub max_throttle_interval_secs: u64,

    /// Quiet time after which a widened interval halves, in seconds. Default: 30.
    pub throttle_quiet_period_secs: u64,

    /// Lifetime of an unreleased rate-limit permit, in seconds. Default: 600.
    pub permit_lease_secs: u64,

    /// Which remote OCR service to call. Default: [`BackendKind::Mistral`].
    pub backend: BackendKind,

    /// Model identifier. `None` uses the backend default.
    pub model: Option<String>,

    /// Vision-LLM provider name (e.g. "openai"); only for [`BackendKind::Vision`].
    pub provider_name: Option<String>,

    /// Base URL of the OCR service. Default: `https://api.mistral.ai`.
    pub api_base_url: String,

    /// Separator placed between pages in the assembled document.
    pub page_separator: PageSeparator,

    /// Directory receiving one `<stem>.md` per input. Default: `.`.
    pub output_dir: PathBuf,

    /// Root of the per-document checkpoint directories.
    /// Default: `<output_dir>/.ocrbatch-checkpoints`.
    pub checkpoint_dir: Option<PathBuf>,

    /// Keep checkpoint records after a clean assembly. Default: false.
    pub keep_checkpoints: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5,
            single_page_mode: false,
            image_format: ImageFormat::default(),
            image_quality: 85,
            dpi: 150,
            max_rendered_pixels: 2000,
            password: None,
            max_retries: 3,
            retry_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            api_timeout_secs: 300,
            requests_per_minute: 60,
            max_throttle_interval_secs: 60,
            throttle_quiet_period_secs: 30,
            permit_lease_secs: 600,
            backend: BackendKind::default(),
            model: None,
            provider_name: None,
            api_base_url: "https://api.mistral.ai".to_string(),
            page_separator: PageSeparator::default(),
            output_dir: PathBuf::from("."),
            checkpoint_dir: None,
            keep_checkpoints: false,
        }
    }
}

impl fmt::Debug for BatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConfig")
            .field("chunk_size", &self.chunk_size)
            .field("single_page_mode", &self.single_page_mode)
            .field("image_format", &self.image_format)
            .field("image_quality", &self.image_quality)
            .field("dpi", &self.dpi)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("max_retries", &self.max_retries)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("backend", &self.backend)
            .field("model", &self.model)
            .field("page_separator", &self.page_separator)
            .field("output_dir", &self.output_dir)
            .field("checkpoint_dir", &self.checkpoint_root())
            .finish()
    }
}

impl BatchConfig {
    /// Create a new builder for `BatchConfig`.
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder {
            config: Self::default(),
        }
    }

    /// Pages per render batch after applying `single_page_mode`.
    pub fn effective_chunk_size(&self) -> usize {
        if self.single_page_mode {
            1
        } else {
            self.chunk_size.max(1)
        }
    }

    /// Root directory for checkpoint records.
    pub fn checkpoint_root(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join(".ocrbatch-checkpoints"))
    }

    /// Rate limiter settings derived from this config.
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.requests_per_minute.max(1),
            per: Duration::from_secs(60),
            max_interval: Duration::from_secs(self.max_throttle_interval_secs),
            quiet_period: Duration::from_secs(self.throttle_quiet_period_secs),
            lease_timeout: Duration::from_secs(self.permit_lease_secs),
        }
    }

    /// Model identifier sent to the backend.
    pub fn model_or_default(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.backend.default_model())
    }
}

/// Builder for [`BatchConfig`].
#[derive(Debug)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    pub fn chunk_size(mut self, n: usize) -> Self {
        self.config.chunk_size = n.max(1);
        self
    }

    pub fn single_page_mode(mut self, v: bool) -> Self {
        self.config.single_page_mode = v;
        self
    }

    pub fn image_format(mut self, format: ImageFormat) -> Self {
        self.config.image_format = format;
        self
    }

    pub fn image_quality(mut self, q: u8) -> Self {
        self.config.image_quality = q.clamp(1, 100);
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn requests_per_minute(mut self, n: u32) -> Self {
        self.config.requests_per_minute = n.max(1);
        self
    }

    pub fn max_throttle_interval_secs(mut self, secs: u64) -> Self {
        self.config.max_throttle_interval_secs = secs;
        self
    }

    pub fn throttle_quiet_period_secs(mut self, secs: u64) -> Self {
        self.config.throttle_quiet_period_secs = secs;
        self
    }

    pub fn permit_lease_secs(mut self, secs: u64) -> Self {
        self.config.permit_lease_secs = secs.max(1);
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn keep_checkpoints(mut self, v: bool) -> Self {
        self.config.keep_checkpoints = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<BatchConfig, OcrBatchError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(OcrBatchError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if !(1..=100).contains(&c.image_quality) {
            return Err(OcrBatchError::InvalidConfig(format!(
                "Image quality must be 1–100, got {}",
                c.image_quality
            )));
        }
        if c.chunk_size == 0 {
            return Err(OcrBatchError::InvalidConfig(
                "Chunk size must be ≥ 1".into(),
            ));
        }
        if c.max_backoff_ms < c.retry_backoff_ms {
            return Err(OcrBatchError::InvalidConfig(format!(
                "max_backoff_ms ({}) must be ≥ retry_backoff_ms ({})",
                c.max_backoff_ms, c.retry_backoff_ms
            )));
        }
        if c.backend == BackendKind::Mistral && c.api_base_url.is_empty() {
            return Err(OcrBatchError::InvalidConfig(
                "api_base_url must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Image encoding for page payloads.
///
/// JPEG keeps payloads small enough for per-request upload limits on
/// text-heavy scans; PNG is lossless and preferable for fine print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
}

impl ImageFormat {
    /// MIME type used in data URIs and multimodal requests.
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }

    /// File extension used when naming the page for the service.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

/// Which remote service performs OCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Mistral's dedicated OCR endpoint (`/v1/ocr`).
    #[default]
    Mistral,
    /// A vision LLM via edgequake-llm (OpenAI, Anthropic, Gemini, Ollama…).
    Vision,
}

impl BackendKind {
    /// Model used when none is configured.
    pub fn default_model(&self) -> &'static str {
        match self {
            BackendKind::Mistral => "mistral-ocr-latest",
            BackendKind::Vision => "gpt-4.1-nano",
        }
    }
}

/// How to separate pages in the assembled Markdown output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSeparator {
    /// No visible separator; pages joined with "\n\n". (default)
    #[default]
    None,
    /// Horizontal rule: "\n\n---\n\n"
    HorizontalRule,
    /// HTML comment with page number: "<!-- page N -->"
    Comment,
    /// Custom string inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator placed before the given page (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n\n<!-- page {} -->\n\n", page_num),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}
