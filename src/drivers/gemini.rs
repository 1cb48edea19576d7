//! Google Gemini driver, using the REST `generateContent` endpoint.

use std::{env, fmt};

use base64::{Engine as _, prelude::BASE64_STANDARD};
use leaky_bucket::RateLimiter;
use reqwest::{Client, StatusCode};

use super::{DriverOpts, DriverType, VisionDriver, VisionError, VisionRequest};
use crate::prelude::*;

/// The public Gemini API.
const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Generous enough for a label with a long contents list.
const MAX_OUTPUT_TOKENS: u32 = 8192;

/// Our Gemini driver.
pub struct GeminiDriver {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    opts: DriverOpts,
    rate_limiter: Option<RateLimiter>,
}

impl GeminiDriver {
    /// Create a new Gemini driver from `GEMINI_API_KEY` and, optionally,
    /// `GEMINI_API_BASE`.
    pub fn new(opts: &DriverOpts) -> Result<Self> {
        let api_key = env::var("GEMINI_API_KEY")
            .context("GEMINI_API_KEY environment variable is not set")?;
        let api_base = env::var("GEMINI_API_BASE")
            .unwrap_or_else(|_| DEFAULT_API_BASE.to_owned())
            .trim_end_matches('/')
            .to_owned();
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            api_base,
            api_key,
            model: opts.model.clone(),
            opts: opts.clone(),
            rate_limiter: opts.rate_limit.as_ref().map(|r| r.to_rate_limiter()),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }

    async fn generate_inner(&self, request: &VisionRequest<'_>) -> Result<String, VisionError> {
        let body = GenerateContentRequest::new(request);
        let resp = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(VisionError::RateLimited);
        } else if !status.is_success() {
            return Err(VisionError::Status { status, body: text });
        }
        trace!(%text, "Gemini response");

        let response = serde_json::from_str::<GenerateContentResponse>(&text)
            .map_err(|err| VisionError::Structure(format!("invalid JSON: {err}")))?;
        response.into_text()
    }
}

impl fmt::Debug for GeminiDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiDriver")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl VisionDriver for GeminiDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::Gemini
    }

    #[instrument(level = "debug", skip_all, fields(model = %self.model))]
    async fn generate(&self, request: &VisionRequest<'_>) -> Result<String, VisionError> {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }
        self.opts.apply_timeout(self.generate_inner(request)).await
    }
}

/// Request body for `generateContent`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

impl GenerateContentRequest {
    fn new(request: &VisionRequest<'_>) -> Self {
        Self {
            contents: vec![Content {
                parts: vec![
                    Part::Text {
                        text: request.prompt.to_owned(),
                    },
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: request.mime_type.to_owned(),
                            data: BASE64_STANDARD.encode(request.image),
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                max_output_tokens: MAX_OUTPUT_TOKENS,
                response_mime_type: "application/json",
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    InlineData {
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    response_mime_type: &'static str,
}

/// The parts of a `generateContent` response we care about.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenerateContentResponse {
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    /// Older API versions put the text directly on the candidate.
    text: Option<String>,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CandidateContent {
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateContentResponse {
    /// Get the text of the first part of the first candidate.
    fn into_text(self) -> Result<String, VisionError> {
        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| VisionError::Structure("no candidates".to_owned()))?;
        if let Some(reason) = &candidate.finish_reason {
            debug!(%reason, "Gemini finish reason");
        }
        let first_part = candidate
            .content
            .and_then(|content| content.parts.into_iter().next());
        match (first_part, candidate.text) {
            // A part without text is an empty reply, not a broken one.
            (Some(part), _) => Ok(part
                .text
                .filter(|text| !text.is_empty())
                .unwrap_or_else(|| "{}".to_owned())),
            (None, Some(text)) if !text.is_empty() => Ok(text),
            (None, _) => Err(VisionError::Structure(
                "no text in first candidate".to_owned(),
            )),
        }
    }
}
