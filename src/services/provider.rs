use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};

use crate::config::AppConfig;
use crate::models::job::GenerationOptions;

/// Which external generation API a worker dispatches to. Resolved once at
/// worker startup, not per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ProviderKind {
    /// Synchronous: the call blocks until the artifact is ready.
    Gemini,
    /// Asynchronous: the call returns a task handle; completion arrives via
    /// webhook.
    Kling,
}

/// Inputs handed to a provider adapter.
#[derive(Debug)]
pub struct GenerationInputs<'a> {
    pub prompt: &'a str,
    pub primary: &'a [u8],
    pub secondary: Option<&'a [u8]>,
    pub options: &'a GenerationOptions,
}

/// A finished image returned by a synchronous provider.
#[derive(Debug)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// What a dispatch produced: a finished artifact (sync) or a provider-side
/// task handle to be reconciled by the webhook handler (async).
#[derive(Debug)]
pub enum Dispatch {
    Completed(GeneratedImage),
    Submitted(String),
}

/// Provider adapter dispatched through a single capability surface.
pub enum ProviderAdapter {
    Gemini(GeminiImageClient),
    Kling(KlingImageClient),
}

impl ProviderAdapter {
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let kind: ProviderKind = config
            .provider
            .parse()
            .map_err(|_| ProviderError::Config(format!("unknown provider '{}'", config.provider)))?;

        match kind {
            ProviderKind::Gemini => Ok(Self::Gemini(GeminiImageClient::new(
                &config.gemini_base_url,
                &config.gemini_api_key,
                &config.gemini_model,
                Duration::from_secs(config.gemini_timeout_secs),
            )?)),
            ProviderKind::Kling => Ok(Self::Kling(KlingImageClient::new(
                &config.kling_base_url,
                &config.kling_api_key,
                &config.public_base_url,
            ))),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Gemini(_) => ProviderKind::Gemini,
            Self::Kling(_) => ProviderKind::Kling,
        }
    }

    pub async fn dispatch(&self, inputs: GenerationInputs<'_>) -> Result<Dispatch, ProviderError> {
        match self {
            Self::Gemini(client) => client.generate(inputs).await.map(Dispatch::Completed),
            Self::Kling(client) => client.submit(inputs).await.map(Dispatch::Submitted),
        }
    }
}

// ---------------------------------------------------------------------------
// Gemini (synchronous)
// ---------------------------------------------------------------------------

/// Client for the Gemini image generation API.
///
/// The call blocks until the provider returns the composed image; a hard
/// request timeout bounds how long a worker slot can be held.
pub struct GeminiImageClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiRequestPart>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum GeminiRequestPart {
    Text(String),
    #[serde(rename_all = "camelCase")]
    InlineData { mime_type: String, data: String },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

/// Finish reasons that indicate a safety rejection rather than a transient
/// fault.
const SAFETY_FINISH_REASONS: &[&str] =
    &["SAFETY", "IMAGE_SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII"];

impl GeminiImageClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProviderError::Http)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    /// Run a blocking composition call and select the image payload from the
    /// response parts.
    pub async fn generate(
        &self,
        inputs: GenerationInputs<'_>,
    ) -> Result<GeneratedImage, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );

        let mut parts = vec![GeminiRequestPart::Text(build_prompt(
            inputs.prompt,
            inputs.options,
        ))];
        parts.push(GeminiRequestPart::InlineData {
            mime_type: sniff_mime(inputs.primary).to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(inputs.primary),
        });
        if let Some(secondary) = inputs.secondary {
            parts.push(GeminiRequestPart::InlineData {
                mime_type: sniff_mime(secondary).to_string(),
                data: base64::engine::general_purpose::STANDARD.encode(secondary),
            });
        }

        let request = GeminiRequest {
            contents: vec![GeminiContent { parts }],
            generation_config: GeminiGenerationConfig {
                response_modalities: vec!["TEXT".to_string(), "IMAGE".to_string()],
                temperature: inputs.options.strength,
                seed: inputs.options.seed,
            },
        };

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(ProviderError::Http)?;

        let status = response.status();
        let body = response.text().await.map_err(ProviderError::Http)?;

        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GeminiResponse = serde_json::from_str(&body).map_err(|e| {
            // Providers evolve their response format; keep the raw shape
            // around for diagnosis.
            tracing::error!(error = %e, raw = %body, "unparseable provider response");
            ProviderError::Malformed(format!("invalid response JSON: {e}"))
        })?;

        match select_image_part(&parsed) {
            Ok((mime_type, data)) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .map_err(|e| ProviderError::Malformed(format!("invalid image base64: {e}")))?;
                Ok(GeneratedImage { bytes, mime_type })
            }
            Err(e) => {
                if matches!(e, ProviderError::Malformed(_)) {
                    tracing::error!(raw = %body, "no image payload in provider response");
                }
                Err(e)
            }
        }
    }
}

/// Select exactly one output payload from a multi-part response: the first
/// image part wins, text commentary parts are ignored.
pub(crate) fn select_image_part(
    response: &GeminiResponse,
) -> Result<(String, String), ProviderError> {
    if let Some(feedback) = &response.prompt_feedback {
        if let Some(reason) = &feedback.block_reason {
            return Err(ProviderError::ContentPolicy(reason.clone()));
        }
    }

    let Some(candidate) = response.candidates.first() else {
        return Err(ProviderError::Malformed("response has no candidates".into()));
    };

    if let Some(reason) = &candidate.finish_reason {
        if SAFETY_FINISH_REASONS.contains(&reason.as_str()) {
            return Err(ProviderError::ContentPolicy(reason.clone()));
        }
    }

    let parts = candidate
        .content
        .as_ref()
        .map(|c| c.parts.as_slice())
        .unwrap_or_default();

    for part in parts {
        if let Some(inline) = &part.inline_data {
            if inline.mime_type.starts_with("image/") {
                return Ok((inline.mime_type.clone(), inline.data.clone()));
            }
        }
    }

    Err(ProviderError::Malformed(format!(
        "no image part among {} returned parts",
        parts.len()
    )))
}

fn build_prompt(prompt: &str, options: &GenerationOptions) -> String {
    match &options.style {
        Some(style) => format!("{prompt}\n\nStyle: {style}"),
        None => prompt.to_string(),
    }
}

fn sniff_mime(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(image::ImageFormat::WebP) => "image/webp",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------------
// Kling (asynchronous, webhook completion)
// ---------------------------------------------------------------------------

/// Client for the Kling task-based image API.
///
/// `submit` only confirms the provider accepted the task; the generated
/// artifact arrives later through the webhook completion handler.
pub struct KlingImageClient {
    http: Client,
    base_url: String,
    api_key: String,
    callback_url: String,
}

#[derive(Serialize)]
struct KlingSubmitRequest {
    prompt: String,
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_fidelity: Option<f64>,
    callback_url: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct KlingSubmitResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<KlingTaskData>,
}

#[derive(Debug, Deserialize)]
struct KlingTaskData {
    task_id: String,
}

/// Provider-side risk control codes: the request was declined on content
/// safety grounds and must not be retried.
const KLING_RISK_CODES: &[i64] = &[1301, 1302, 1303, 1304];

impl KlingImageClient {
    pub fn new(base_url: &str, api_key: &str, public_base_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            callback_url: format!(
                "{}/api/v1/webhooks/generation",
                public_base_url.trim_end_matches('/')
            ),
        }
    }

    /// Submit a composition task; returns the provider's task handle.
    pub async fn submit(&self, inputs: GenerationInputs<'_>) -> Result<String, ProviderError> {
        let url = format!("{}/v1/images/generations", self.base_url);

        let request = KlingSubmitRequest {
            prompt: build_prompt(inputs.prompt, inputs.options),
            image: base64::engine::general_purpose::STANDARD.encode(inputs.primary),
            image_reference: inputs
                .secondary
                .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes)),
            image_fidelity: inputs.options.strength,
            callback_url: self.callback_url.clone(),
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(ProviderError::Http)?;

        let status = response.status();
        let body = response.text().await.map_err(ProviderError::Http)?;

        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: KlingSubmitResponse = serde_json::from_str(&body).map_err(|e| {
            tracing::error!(error = %e, raw = %body, "unparseable provider response");
            ProviderError::Malformed(format!("invalid response JSON: {e}"))
        })?;

        parse_submit_response(parsed)
    }
}

pub(crate) fn parse_submit_response(response: KlingSubmitResponse) -> Result<String, ProviderError> {
    if response.code != 0 {
        if KLING_RISK_CODES.contains(&response.code) {
            return Err(ProviderError::ContentPolicy(response.message));
        }
        return Err(ProviderError::Api {
            code: response.code,
            message: response.message,
        });
    }

    match response.data {
        Some(data) => Ok(data.task_id),
        None => Err(ProviderError::Malformed(
            "accepted submission carried no task id".into(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned status {status}")]
    Status { status: u16, body: String },

    /// The provider declined on safety grounds. Terminal; surfaced verbatim
    /// to the job's error field.
    #[error("generation rejected by provider safety filters: {0}")]
    ContentPolicy(String),

    /// The response did not contain the expected payload shape.
    #[error("unexpected provider response shape: {0}")]
    Malformed(String),

    #[error("provider API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("provider configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Whether the failure may heal on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::ContentPolicy(_) => false,
            Self::Malformed(_) => true,
            Self::Api { .. } => true,
            Self::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response_from(value: serde_json::Value) -> GeminiResponse {
        serde_json::from_value(value).expect("test fixture should deserialize")
    }

    #[test]
    fn first_image_part_wins_over_text() {
        let response = response_from(json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "Here is your composed image:"},
                        {"inlineData": {"mimeType": "image/png", "data": "aGVsbG8="}},
                        {"inlineData": {"mimeType": "image/png", "data": "d29ybGQ="}}
                    ]
                },
                "finishReason": "STOP"
            }]
        }));

        let (mime, data) = select_image_part(&response).expect("image part expected");
        assert_eq!(mime, "image/png");
        assert_eq!(data, "aGVsbG8=");
    }

    #[test]
    fn text_only_response_is_malformed() {
        let response = response_from(json!({
            "candidates": [{
                "content": {"parts": [{"text": "I cannot draw that."}]},
                "finishReason": "STOP"
            }]
        }));

        assert!(matches!(
            select_image_part(&response),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn block_reason_is_content_policy() {
        let response = response_from(json!({
            "candidates": [],
            "promptFeedback": {"blockReason": "SAFETY"}
        }));

        match select_image_part(&response) {
            Err(ProviderError::ContentPolicy(reason)) => assert_eq!(reason, "SAFETY"),
            other => panic!("expected content policy rejection, got {other:?}"),
        }
    }

    #[test]
    fn safety_finish_reason_is_content_policy() {
        let response = response_from(json!({
            "candidates": [{
                "content": {"parts": []},
                "finishReason": "IMAGE_SAFETY"
            }]
        }));

        assert!(matches!(
            select_image_part(&response),
            Err(ProviderError::ContentPolicy(_))
        ));
    }

    #[test]
    fn empty_response_is_malformed() {
        let response = response_from(json!({}));
        assert!(matches!(
            select_image_part(&response),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn retryability_classification() {
        assert!(ProviderError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(ProviderError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!ProviderError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!ProviderError::ContentPolicy("SAFETY".into()).is_retryable());
        assert!(ProviderError::Malformed("no parts".into()).is_retryable());
    }

    #[test]
    fn kling_submission_yields_task_id() {
        let response: KlingSubmitResponse = serde_json::from_value(json!({
            "code": 0,
            "message": "SUCCEED",
            "data": {"task_id": "task-123"}
        }))
        .unwrap();

        assert_eq!(parse_submit_response(response).unwrap(), "task-123");
    }

    #[test]
    fn kling_risk_control_is_content_policy() {
        let response: KlingSubmitResponse = serde_json::from_value(json!({
            "code": 1301,
            "message": "risk control: prompt rejected"
        }))
        .unwrap();

        assert!(matches!(
            parse_submit_response(response),
            Err(ProviderError::ContentPolicy(_))
        ));
    }

    #[test]
    fn kling_missing_task_id_is_malformed() {
        let response: KlingSubmitResponse =
            serde_json::from_value(json!({"code": 0, "message": "SUCCEED"})).unwrap();

        assert!(matches!(
            parse_submit_response(response),
            Err(ProviderError::Malformed(_))
        ));
    }
}
