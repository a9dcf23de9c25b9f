//! Typed configuration structs, one per subsystem, following the same shape the upstream
//! driver uses for its `ClientOptions`: environment-derived defaults, explicit overrides,
//! validated once at construction.

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// Thresholds used by the freshness policy (C1).
#[derive(Clone, Debug, TypedBuilder)]
pub struct FreshnessOptions {
    #[builder(default = Duration::from_secs(24 * 3600))]
    pub t_lms: Duration,
    #[builder(default = Duration::from_secs(30 * 24 * 3600))]
    pub t_exam: Duration,
}

impl Default for FreshnessOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Options governing the parallel dispatcher (C5).
#[derive(Clone, Debug, TypedBuilder)]
pub struct DispatchOptions {
    #[builder(default = 4)]
    pub parallel_workers: usize,
    #[builder(default = Duration::from_secs(5))]
    pub page_timeout: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub download_timeout: Duration,
    #[builder(default = Duration::from_millis(500))]
    pub exam_poll_interval: Duration,
}

impl DispatchOptions {
    pub fn validate(&self) -> Result<()> {
        if self.parallel_workers == 0 {
            return Err(Error::config("parallel_workers must be >= 1"));
        }
        Ok(())
    }
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Bounds consumed by the structure-aware chunker (C6 stage 3).
#[derive(Clone, Copy, Debug, TypedBuilder)]
pub struct ChunkerOptions {
    #[builder(default = 400)]
    pub target_tokens: usize,
    #[builder(default = 600)]
    pub max_tokens: usize,
    #[builder(default = 50)]
    pub min_tokens: usize,
    #[builder(default = 40)]
    pub overlap_tokens: usize,
    #[builder(default = 4.0)]
    pub token_chars_ratio: f64,
}

impl ChunkerOptions {
    pub fn target_chars(&self) -> usize {
        (self.target_tokens as f64 * self.token_chars_ratio) as usize
    }

    pub fn max_chars(&self) -> usize {
        (self.max_tokens as f64 * self.token_chars_ratio) as usize
    }

    pub fn min_chars(&self) -> usize {
        (self.min_tokens as f64 * self.token_chars_ratio) as usize
    }

    pub fn overlap_chars(&self) -> usize {
        (self.overlap_tokens as f64 * self.token_chars_ratio) as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_tokens > self.target_tokens || self.target_tokens > self.max_tokens {
            return Err(Error::config(
                "chunker bounds must satisfy min_tokens <= target_tokens <= max_tokens",
            ));
        }
        if self.overlap_tokens >= self.max_tokens {
            return Err(Error::config("overlap_tokens must be smaller than max_tokens"));
        }
        Ok(())
    }
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Which wire shape the configured embedding endpoint speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingApiType {
    Batch,
    OneByOne,
}

/// Options for the embedding HTTP client (C6 stage 5).
#[derive(Clone, Debug, TypedBuilder)]
pub struct EmbeddingOptions {
    pub api_url: String,
    #[builder(default, setter(strip_option))]
    pub api_key: Option<String>,
    #[builder(default = "text-embedding-v4".to_string())]
    pub model: String,
    #[builder(default = EmbeddingApiType::Batch)]
    pub api_type: EmbeddingApiType,
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,
    #[builder(default = 64)]
    pub batch_size: usize,
    #[builder(default = 4000)]
    pub max_chars: usize,
}

impl EmbeddingOptions {
    /// The batch size actually used per request: the configured size capped by the
    /// upstream's documented hard limit.
    pub fn effective_batch_size(&self) -> usize {
        match self.api_type {
            EmbeddingApiType::Batch => self.batch_size.min(10),
            EmbeddingApiType::OneByOne => 1,
        }
    }
}

/// Filesystem + static-file-serving configuration (feeds C3/C4 downloads and C6 chunk URLs).
#[derive(Clone, Debug, TypedBuilder)]
pub struct StorageOptions {
    pub root: std::path::PathBuf,
    pub knowledge_base_url: String,
    #[builder(default = std::path::PathBuf::from("index"))]
    pub index_dir: std::path::PathBuf,
}

/// Course-title pattern that redirects a course away from the LMS to a static public URL,
/// generalizing the single hard-coded "Natural language processing" special case upstream.
#[derive(Clone, Debug)]
pub struct CourseRedirect {
    pub title_pattern: regex::Regex,
    pub alternate_root_url: String,
}

/// Reachability configuration for the two upstreams (A2, feeding C2/C3/C4's wiring in the
/// Orchestrator). The login mechanics themselves are a best-effort generic form POST
/// ([`crate::broker::FormLoginFlow`]) — the IdPs' real behavior is an external collaborator
/// this spec does not pin down beyond "interactive cookie-based login".
#[derive(Clone, Debug, TypedBuilder)]
pub struct UpstreamOptions {
    pub lms_base_url: String,
    pub lms_login_url: String,
    pub exam_search_url: String,
    pub exam_login_url: String,
    #[builder(default = "invalid".to_string())]
    pub login_failure_marker: String,
    #[builder(default = true)]
    pub headless: bool,
}

#[derive(Clone, Debug, TypedBuilder)]
pub struct UpdateOptions {
    #[builder(default)]
    pub freshness: FreshnessOptions,
    #[builder(default)]
    pub dispatch: DispatchOptions,
    #[builder(default)]
    pub chunker: ChunkerOptions,
    pub embedding: EmbeddingOptions,
    pub storage: StorageOptions,
    pub upstream: UpstreamOptions,
    #[builder(default)]
    pub course_redirects: Vec<CourseRedirect>,
}

impl UpdateOptions {
    pub fn validate(&self) -> Result<()> {
        self.dispatch.validate()?;
        self.chunker.validate()?;
        Ok(())
    }
}
