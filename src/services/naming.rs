use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::models::item::ImageAsset;
use crate::services::generator::ImageService;

/// Label used whenever the analysis call cannot produce one.
pub const DEFAULT_LABEL: &str = "Vehicle Photo";

/// Time budget for the analysis call.
pub const LABEL_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_LABEL_CHARS: usize = 60;

/// Ask the service for a short descriptive name. Fails soft: a timeout, an
/// error or an empty answer yields [`DEFAULT_LABEL`].
pub async fn describe_with_timeout(
    service: &dyn ImageService,
    image: &ImageAsset,
    limit: Duration,
) -> String {
    match timeout(limit, service.describe(image)).await {
        Ok(Ok(text)) => match clean_label(&text) {
            Some(label) => label,
            None => {
                debug!("Analysis returned an empty label, using default");
                DEFAULT_LABEL.to_string()
            }
        },
        Ok(Err(e)) => {
            warn!(error = %e, "Analysis call failed, using default label");
            DEFAULT_LABEL.to_string()
        }
        Err(_) => {
            warn!(timeout_ms = limit.as_millis() as u64, "Analysis call timed out, using default label");
            DEFAULT_LABEL.to_string()
        }
    }
}

/// First line, without quotes or trailing punctuation, capped in length.
pub(crate) fn clean_label(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let trimmed = line
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '`')
        .trim_end_matches(['.', ':'])
        .trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_LABEL_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::item::ImageMime;
    use crate::services::generator::{GenerationOutcome, GenerationRequest, ServiceError};
    use async_trait::async_trait;

    enum Behaviour {
        Answer(&'static str),
        Fail,
        Hang,
    }

    struct Analyst(Behaviour);

    #[async_trait]
    impl ImageService for Analyst {
        async fn generate(&self, _request: GenerationRequest) -> GenerationOutcome {
            GenerationOutcome::NoImage
        }

        async fn describe(&self, _image: &ImageAsset) -> Result<String, ServiceError> {
            match self.0 {
                Behaviour::Answer(text) => Ok(text.to_string()),
                Behaviour::Fail => Err(ServiceError::EmptyResponse),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("too late".to_string())
                }
            }
        }
    }

    fn image() -> ImageAsset {
        ImageAsset::new(vec![0u8; 8], ImageMime::Jpeg)
    }

    #[tokio::test]
    async fn test_uses_cleaned_answer() {
        let label = describe_with_timeout(
            &Analyst(Behaviour::Answer("\"Front Three-Quarter View.\"\nextra")),
            &image(),
            LABEL_TIMEOUT,
        )
        .await;
        assert_eq!(label, "Front Three-Quarter View");
    }

    #[tokio::test]
    async fn test_error_falls_back_to_default() {
        let label =
            describe_with_timeout(&Analyst(Behaviour::Fail), &image(), LABEL_TIMEOUT).await;
        assert_eq!(label, DEFAULT_LABEL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back_to_default() {
        let start = tokio::time::Instant::now();
        let label =
            describe_with_timeout(&Analyst(Behaviour::Hang), &image(), LABEL_TIMEOUT).await;
        assert_eq!(label, DEFAULT_LABEL);
        assert_eq!(start.elapsed(), LABEL_TIMEOUT);
    }

    #[test]
    fn test_clean_label_rejects_blank() {
        assert_eq!(clean_label("  \n  "), None);
        assert_eq!(clean_label("\"\""), None);
        assert_eq!(clean_label(&"x".repeat(200)).map(|l| l.len()), Some(MAX_LABEL_CHARS));
    }
}
