//! Vision-language model backend over the Ollama `/api/generate` API.
//!
//! One non-streaming request per page:
//!
//! ```json
//! { "model": "...", "prompt": "...", "images": ["<base64 jpeg>"],
//!   "stream": false, "options": { "temperature": 0.1 } }
//! ```
//!
//! HTTP 200 with a non-blank `response` string is accepted. Everything else
//! (non-200, refused connection, timeout, unreadable body, blank reply) is a
//! [`BackendError`] turned into a not-accepted attempt. The request is never
//! retried.

use super::{BackendKind, RawOutput, RecognitionAttempt, RecognitionBackend};
use crate::config::ExtractionConfig;
use crate::error::{BackendError, ExtractError};
use crate::pipeline::encode::encode_jpeg_base64;
use crate::pipeline::enhance::{EnhancedImage, EnhancementProfile};
use crate::pipeline::layout::LayoutHint;
use crate::prompts::extraction_prompt;
use crate::schema::FieldSchema;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
}

/// Calls a vision model through an Ollama-compatible endpoint.
pub struct VisionBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
    jpeg_quality: u8,
    timeout_secs: u64,
    enabled: bool,
    schema: FieldSchema,
}

impl VisionBackend {
    pub fn new(config: &ExtractionConfig) -> Result<Self, ExtractError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.vision_timeout_secs))
            .build()
            .map_err(|e| ExtractError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/api/generate",
                config.inference_base_url.trim_end_matches('/')
            ),
            model: config.model.clone(),
            temperature: config.temperature,
            jpeg_quality: config.jpeg_quality,
            timeout_secs: config.vision_timeout_secs,
            enabled: config.vision_enabled,
            schema: config.schema.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn generate(
        &self,
        image: &EnhancedImage,
        hints: &LayoutHint,
    ) -> Result<String, BackendError> {
        let pixels = image.image.clone();
        let quality = self.jpeg_quality;
        let b64 = tokio::task::spawn_blocking(move || encode_jpeg_base64(&pixels, quality))
            .await
            .map_err(|e| BackendError::MalformedResponse(format!("JPEG encode task failed: {e}")))?
            .map_err(|e| BackendError::MalformedResponse(format!("JPEG encode failed: {e}")))?;
        let prompt = extraction_prompt(&self.schema, hints);

        let body = GenerateRequest {
            model: &self.model,
            prompt: &prompt,
            images: vec![b64],
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        info!("Sending page to '{}' at {}", self.model, self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(BackendError::Http {
                url: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }

        let text = response.text().await.map_err(|e| self.transport_error(e))?;
        debug!("Vision reply body: {} bytes", text.len());

        let parsed: GenerateResponse = serde_json::from_str(&text)
            .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
        match parsed.response {
            Some(reply) if !reply.trim().is_empty() => Ok(reply),
            _ => Err(BackendError::EmptyResponse {
                model: self.model.clone(),
            }),
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout {
                url: self.endpoint.clone(),
                secs: self.timeout_secs,
            }
        } else {
            BackendError::Connection {
                url: self.endpoint.clone(),
                detail: e.to_string(),
            }
        }
    }
}

impl RecognitionBackend for VisionBackend {
    fn name(&self) -> &str {
        "vision"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Vision
    }

    fn profile(&self) -> EnhancementProfile {
        EnhancementProfile::Vision
    }

    fn is_available(&self) -> bool {
        self.enabled
    }

    fn attempt<'a>(
        &'a self,
        image: &'a EnhancedImage,
        hints: &'a LayoutHint,
    ) -> BoxFuture<'a, RecognitionAttempt> {
        Box::pin(async move {
            match self.generate(image, hints).await {
                Ok(reply) => {
                    debug!("Vision reply: {} chars", reply.chars().count());
                    RecognitionAttempt::accepted(self, RawOutput::Text(reply), None)
                }
                Err(e) => RecognitionAttempt::not_accepted(self, RawOutput::Empty, e.to_string()),
            }
        })
    }
}
