use std::time::Duration;

use async_trait::async_trait;

use crate::models::item::ImageAsset;

/// What the generation call is asked to do with the input image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationTask {
    /// Replace the background, matching the reference image when present.
    ReplaceBackground,
    /// Targeted edit of an already generated image.
    Retouch { instruction: String },
    /// Higher-fidelity single-shot render.
    Hero,
}

impl GenerationTask {
    pub fn name(&self) -> &'static str {
        match self {
            GenerationTask::ReplaceBackground => "background",
            GenerationTask::Retouch { .. } => "retouch",
            GenerationTask::Hero => "hero",
        }
    }
}

/// One request to the external image service.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub task: GenerationTask,
    pub image: ImageAsset,
    pub reference: Option<ImageAsset>,
}

/// Classified result of a generation call.
///
/// Adapters translate whatever the wire reports into one of these; the
/// processor never inspects raw diagnostics.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Success {
        image: ImageAsset,
        label: Option<String>,
    },
    /// Content rejected by the service's safety filters.
    SafetyBlocked,
    /// The call finished normally but returned no image.
    NoImage,
    /// Generation stopped for a non-safety reason.
    Stopped { reason: String },
    /// Quota or rate limit exhausted. The hint comes from the service.
    RateLimited { retry_after: Option<Duration> },
    /// API key missing, invalid, expired or not permitted.
    InvalidCredential,
    Other(String),
}

impl GenerationOutcome {
    /// Short tag for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationOutcome::Success { .. } => "success",
            GenerationOutcome::SafetyBlocked => "safety_blocked",
            GenerationOutcome::NoImage => "no_image",
            GenerationOutcome::Stopped { .. } => "stopped",
            GenerationOutcome::RateLimited { .. } => "rate_limited",
            GenerationOutcome::InvalidCredential => "invalid_credential",
            GenerationOutcome::Other(_) => "other",
        }
    }
}

/// External generative image service.
#[async_trait]
pub trait ImageService: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> GenerationOutcome;

    /// Lightweight analysis call returning a short descriptive name.
    async fn describe(&self, image: &ImageAsset) -> Result<String, ServiceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to parse service response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Service returned no text")]
    EmptyResponse,
}
