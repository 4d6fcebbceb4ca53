use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::item::{ImageAsset, ImageMime};
use crate::services::generator::{
    GenerationOutcome, GenerationRequest, GenerationTask, ImageService, ServiceError,
};
use crate::services::naming;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Finish reasons that mean the content itself was refused.
const SAFETY_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "IMAGE_SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "RECITATION",
    "IMAGE_PROHIBITED_CONTENT",
];

const DESCRIBE_PROMPT: &str = concat!(
    "Name the shot shown in this vehicle photo in two to five words, ",
    "for example 'Front Three-Quarter', 'Driver Side Profile' or 'Interior Dashboard'. ",
    "Reply with the name only."
);

/// Client for the Gemini `generateContent` API.
pub struct GeminiClient {
    http: Client,
    api_key: String,
    image_model: String,
    text_model: String,
    api_base: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    Image { inline_data: InlineImage },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct InlineImage {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<ResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    #[serde(alias = "inline_data")]
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(alias = "mime_type")]
    mime_type: Option<String>,
    #[serde(default)]
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    reason: Option<String>,
    retry_delay: Option<String>,
}

impl GeminiClient {
    pub fn new(
        api_key: String,
        image_model: String,
        text_model: String,
        api_base: Option<String>,
    ) -> Self {
        let api_base = api_base
            .map(|base| base.trim().trim_end_matches('/').to_string())
            .filter(|base| !base.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self {
            http: Client::new(),
            api_key,
            image_model,
            text_model,
            api_base,
        }
    }

    fn endpoint(&self, model: &str) -> String {
        let model = model.trim();
        if model.starts_with("models/") {
            format!("{}/{}:generateContent", self.api_base, model)
        } else {
            format!("{}/models/{}:generateContent", self.api_base, model)
        }
    }

    async fn post(
        &self,
        model: &str,
        body: &GenerateRequest<'_>,
    ) -> Result<(u16, Option<Duration>, String), reqwest::Error> {
        let response = self
            .http
            .post(self.endpoint(model))
            .query(&[("key", self.api_key.as_str())])
            .json(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await?;
        Ok((status, retry_after, text))
    }
}

#[async_trait]
impl ImageService for GeminiClient {
    async fn generate(&self, request: GenerationRequest) -> GenerationOutcome {
        let prompt = task_prompt(&request.task, request.reference.is_some());

        let mut parts = vec![image_part(&request.image)];
        if let Some(reference) = &request.reference {
            parts.push(image_part(reference));
        }
        parts.push(RequestPart::Text { text: &prompt });

        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts,
            }],
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["TEXT", "IMAGE"],
            }),
        };

        debug!(task = request.task.name(), model = %self.image_model, "Calling Gemini generateContent");
        match self.post(&self.image_model, &body).await {
            Ok((status, retry_after, text)) => classify_response(status, retry_after, &text),
            Err(e) => GenerationOutcome::Other(format!("request failed: {e}")),
        }
    }

    async fn describe(&self, image: &ImageAsset) -> Result<String, ServiceError> {
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![image_part(image), RequestPart::Text { text: DESCRIBE_PROMPT }],
            }],
            generation_config: None,
        };

        let (status, _, text) = self.post(&self.text_model, &body).await?;
        if !(200..300).contains(&status) {
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(ServiceError::Status { status, message });
        }

        let parsed: GenerateResponse = serde_json::from_str(&text)?;
        parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.text.filter(|t| !t.trim().is_empty()))
            .ok_or(ServiceError::EmptyResponse)
    }
}

fn image_part(image: &ImageAsset) -> RequestPart<'static> {
    RequestPart::Image {
        inline_data: InlineImage {
            mime_type: image.mime().to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(image.bytes()),
        },
    }
}

fn task_prompt(task: &GenerationTask, has_reference: bool) -> String {
    match task {
        GenerationTask::ReplaceBackground if has_reference => concat!(
            "Replace the background of the first image with the environment shown in the second image. ",
            "Keep the vehicle exactly as photographed: body shape, paint, wheels, badges and perspective. ",
            "Match lighting, reflections and ground shadows to the new background. Return the edited photo."
        )
        .to_string(),
        GenerationTask::ReplaceBackground => concat!(
            "Replace the background of this vehicle photo with a clean, evenly lit studio backdrop. ",
            "Keep the vehicle exactly as photographed: body shape, paint, wheels, badges and perspective. ",
            "Add a soft, realistic ground shadow. Return the edited photo."
        )
        .to_string(),
        GenerationTask::Retouch { instruction } => format!(
            "Edit this vehicle photo as follows: {instruction}. Change nothing else. Return the edited photo."
        ),
        GenerationTask::Hero => concat!(
            "Produce a high-fidelity hero render of this vehicle for a listing cover image. ",
            "Preserve the exact vehicle, use the reference image as the setting when one is provided, ",
            "and apply dramatic but natural lighting. Return the rendered photo."
        )
        .to_string(),
    }
}

/// Map an HTTP status and body from `generateContent` to an outcome.
pub fn classify_response(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> GenerationOutcome {
    if !(200..300).contains(&status) {
        return classify_error(status, retry_after, body);
    }

    let parsed: GenerateResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) => return GenerationOutcome::Other(format!("unparseable response: {e}")),
    };

    if parsed
        .prompt_feedback
        .as_ref()
        .and_then(|f| f.block_reason.as_ref())
        .is_some()
    {
        return GenerationOutcome::SafetyBlocked;
    }

    let mut label = None;
    let mut finish_reason = None;
    for candidate in parsed.candidates {
        if finish_reason.is_none() {
            finish_reason = candidate.finish_reason;
        }
        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
        for part in parts {
            if let Some(inline) = part.inline_data.filter(|d| !d.data.is_empty()) {
                let bytes = match base64::engine::general_purpose::STANDARD.decode(inline.data.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(e) => return GenerationOutcome::Other(format!("image payload was not base64: {e}")),
                };
                let mime = inline
                    .mime_type
                    .as_deref()
                    .and_then(|m| m.parse::<ImageMime>().ok())
                    .or_else(|| image::guess_format(&bytes).ok().and_then(ImageMime::from_format))
                    .unwrap_or(ImageMime::Png);
                return GenerationOutcome::Success {
                    image: ImageAsset::new(bytes, mime),
                    label,
                };
            }
            if label.is_none() {
                label = part.text.as_deref().and_then(naming::clean_label);
            }
        }
    }

    match finish_reason.as_deref() {
        Some(reason) if SAFETY_FINISH_REASONS.contains(&reason) => GenerationOutcome::SafetyBlocked,
        None | Some("STOP") | Some("FINISH_REASON_UNSPECIFIED") => GenerationOutcome::NoImage,
        Some(reason) => GenerationOutcome::Stopped {
            reason: reason.to_string(),
        },
    }
}

fn classify_error(status: u16, retry_after: Option<Duration>, body: &str) -> GenerationOutcome {
    let error = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);
    let (message, api_status, details) = match error {
        Some(e) => (e.message, e.status, e.details),
        None => (body.trim().to_string(), String::new(), Vec::new()),
    };

    let credential_reason = details.iter().any(|d| {
        matches!(
            d.reason.as_deref(),
            Some("API_KEY_INVALID") | Some("API_KEY_EXPIRED") | Some("API_KEY_SERVICE_BLOCKED")
        )
    });
    if status == 401
        || status == 403
        || credential_reason
        || api_status == "UNAUTHENTICATED"
        || api_status == "PERMISSION_DENIED"
        || message.contains("API key not valid")
        || message.contains("API key expired")
    {
        return GenerationOutcome::InvalidCredential;
    }

    if status == 429 || api_status == "RESOURCE_EXHAUSTED" {
        let hinted = details
            .iter()
            .find_map(|d| d.retry_delay.as_deref().and_then(parse_retry_delay));
        return GenerationOutcome::RateLimited {
            retry_after: retry_after.or(hinted),
        };
    }

    let message = if message.is_empty() {
        "empty error body".to_string()
    } else {
        message
    };
    GenerationOutcome::Other(format!("HTTP {status}: {message}"))
}

/// Parse a protobuf duration string such as `"37s"` or `"1.5s"`.
fn parse_retry_delay(raw: &str) -> Option<Duration> {
    let seconds: f64 = raw.trim().strip_suffix('s')?.parse().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_b64() -> String {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.resize(32, 0);
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_image_part_is_success_with_label() {
        let body = format!(
            r#"{{"candidates":[{{"content":{{"parts":[
                {{"text":"Front Three-Quarter"}},
                {{"inlineData":{{"mimeType":"image/png","data":"{}"}}}}
            ]}},"finishReason":"STOP"}}]}}"#,
            png_b64()
        );
        match classify_response(200, None, &body) {
            GenerationOutcome::Success { image, label } => {
                assert_eq!(image.mime(), ImageMime::Png);
                assert_eq!(image.len(), 32);
                assert_eq!(label.as_deref(), Some("Front Three-Quarter"));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn test_snake_case_inline_data_and_sniffed_mime() {
        let body = format!(
            r#"{{"candidates":[{{"content":{{"parts":[{{"inline_data":{{"data":"{}"}}}}]}}}}]}}"#,
            png_b64()
        );
        assert!(matches!(
            classify_response(200, None, &body),
            GenerationOutcome::Success { .. }
        ));
    }

    #[test]
    fn test_text_only_stop_is_no_image() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"I cannot"}]},"finishReason":"STOP"}]}"#;
        assert!(matches!(
            classify_response(200, None, body),
            GenerationOutcome::NoImage
        ));
        assert!(matches!(
            classify_response(200, None, r#"{"candidates":[]}"#),
            GenerationOutcome::NoImage
        ));
    }

    #[test]
    fn test_safety_signals() {
        let blocked = r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#;
        assert!(matches!(
            classify_response(200, None, blocked),
            GenerationOutcome::SafetyBlocked
        ));
        let finish = r#"{"candidates":[{"finishReason":"IMAGE_SAFETY"}]}"#;
        assert!(matches!(
            classify_response(200, None, finish),
            GenerationOutcome::SafetyBlocked
        ));
    }

    #[test]
    fn test_other_finish_reason_is_stopped() {
        let body = r#"{"candidates":[{"finishReason":"MAX_TOKENS"}]}"#;
        match classify_response(200, None, body) {
            GenerationOutcome::Stopped { reason } => assert_eq!(reason, "MAX_TOKENS"),
            other => panic!("expected stopped, got {other:?}"),
        }
    }

    #[test]
    fn test_quota_error_with_retry_info() {
        let body = r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED",
            "details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"37s"}]}}"#;
        match classify_response(429, None, body) {
            GenerationOutcome::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(37)))
            }
            other => panic!("expected rate limited, got {other:?}"),
        }

        match classify_response(429, Some(Duration::from_secs(5)), body) {
            GenerationOutcome::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(5)))
            }
            other => panic!("expected rate limited, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_key_is_credential_error() {
        let body = r#"{"error":{"code":400,"message":"API key not valid. Please pass a valid API key.",
            "status":"INVALID_ARGUMENT","details":[{"reason":"API_KEY_INVALID"}]}}"#;
        assert!(matches!(
            classify_response(400, None, body),
            GenerationOutcome::InvalidCredential
        ));
        assert!(matches!(
            classify_response(403, None, "forbidden"),
            GenerationOutcome::InvalidCredential
        ));
    }

    #[test]
    fn test_server_error_is_other() {
        match classify_response(503, None, r#"{"error":{"message":"overloaded","status":"UNAVAILABLE"}}"#) {
            GenerationOutcome::Other(message) => assert_eq!(message, "HTTP 503: overloaded"),
            other => panic!("expected other, got {other:?}"),
        }
        assert!(matches!(
            classify_response(200, None, "not json"),
            GenerationOutcome::Other(_)
        ));
    }

    #[test]
    fn test_parse_retry_delay() {
        assert_eq!(parse_retry_delay("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_delay("12"), None);
        assert_eq!(parse_retry_delay("-3s"), None);
    }

    #[test]
    fn test_endpoint_and_request_shape() {
        let client = GeminiClient::new(
            "k".into(),
            "gemini-2.5-flash-image".into(),
            "gemini-2.5-flash".into(),
            Some("https://example.test/v1beta/".into()),
        );
        assert_eq!(
            client.endpoint("gemini-2.5-flash-image"),
            "https://example.test/v1beta/models/gemini-2.5-flash-image:generateContent"
        );
        assert_eq!(
            client.endpoint("models/custom"),
            "https://example.test/v1beta/models/custom:generateContent"
        );

        let image = ImageAsset::new(vec![1u8, 2, 3], ImageMime::Jpeg);
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![image_part(&image), RequestPart::Text { text: "hi" }],
            }],
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["TEXT", "IMAGE"],
            }),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["inline_data"]["mime_type"], "image/jpeg");
        assert_eq!(json["contents"][0]["parts"][0]["inline_data"]["data"], "AQID");
        assert_eq!(json["contents"][0]["parts"][1]["text"], "hi");
        assert_eq!(json["generationConfig"]["responseModalities"][1], "IMAGE");
    }

    #[tokio::test]
    #[ignore] // Requires GEMINI_API_KEY; run with: cargo test -- --ignored
    async fn test_live_describe() {
        let key = std::env::var("GEMINI_API_KEY").expect("GEMINI_API_KEY not set");
        let client = GeminiClient::new(key, "gemini-2.5-flash-image".into(), "gemini-2.5-flash".into(), None);
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.resize(64, 0);
        let result = client.describe(&ImageAsset::new(bytes, ImageMime::Png)).await;
        println!("describe result: {result:?}");
    }
}
