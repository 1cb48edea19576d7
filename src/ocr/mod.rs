//! Turning one label image into an [`ExtractedFields`].
//!
//! [`OcrClient::extract`] sends the image to a vision model with a fixed
//! extraction prompt, classifies the reply, and retries on rate limits, bad
//! responses and low confidence, up to a visible retry budget. When the budget
//! runs out we degrade rather than fail wherever we can: low-confidence
//! results are accepted with a warning, and unparseable replies go through the
//! heuristic [`fallback`] parser.

use std::{sync::Arc, time::Duration};

use clap::Args;
use schemars::JsonSchema;

use crate::{
    drivers::{DriverType, VisionDriver, VisionError, VisionRequest},
    prelude::*,
    retry::{IsKnownTransient, RetryBudget},
};

use self::{fields::ExtractedFields, reply::ModelReply};

pub mod fallback;
pub mod fields;
pub mod reply;

/// The prompt we send with every image.
pub static EXTRACTION_PROMPT: &str = include_str!("extraction_prompt.md");

/// Options controlling OCR retries.
#[derive(Args, Clone, Debug)]
pub struct OcrOpts {
    /// How many times to retry each image after the first attempt.
    #[clap(long, default_value = "3")]
    pub retries: u32,

    /// Retry when the overall confidence is below this value.
    #[clap(long, default_value = "0.9")]
    pub confidence_threshold: f64,

    /// How long to wait before each retry, in milliseconds.
    #[clap(long, default_value = "2000")]
    pub retry_backoff_ms: u64,

    /// Fail instead of falling back to heuristic text parsing when the model's
    /// reply cannot be parsed.
    #[clap(long)]
    pub no_fallback: bool,
}

impl Default for OcrOpts {
    fn default() -> Self {
        Self {
            retries: 3,
            confidence_threshold: 0.9,
            retry_backoff_ms: 2000,
            no_fallback: false,
        }
    }
}

impl OcrOpts {
    /// Our retry budget.
    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget {
            retries: self.retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

/// An image ready to be sent for OCR.
#[derive(Clone, Debug)]
pub struct OcrImage {
    /// The original file name, used to match results to inputs.
    pub file_name: String,
    /// Encoded image bytes.
    pub bytes: Vec<u8>,
    /// MIME type of `bytes`.
    pub mime_type: String,
}

/// Where did our fields come from?
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrSource {
    /// Parsed from a Gemini reply.
    Gemini,
    /// Parsed from the offline driver's canned reply.
    Offline,
    /// Extracted heuristically from the reply text.
    Fallback,
}

impl From<DriverType> for OcrSource {
    fn from(driver_type: DriverType) -> Self {
        match driver_type {
            DriverType::Gemini => OcrSource::Gemini,
            DriverType::Offline => OcrSource::Offline,
        }
    }
}

/// The result of OCRing one image.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrResult {
    /// The file name of the image.
    pub file_name: String,

    /// Where the fields came from.
    pub source: OcrSource,

    /// Mean of the positive per-field confidence scores.
    pub overall_confidence: f64,

    /// How many model calls we made.
    pub attempts: u32,

    /// Non-fatal problems, such as accepting a low-confidence result.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    /// The extracted fields.
    pub fields: ExtractedFields,
}

/// Why we could not OCR an image at all.
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    /// We could not get a reply from the model.
    #[error("vision request failed after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: VisionError,
    },

    /// The model's response did not contain any reply text.
    #[error("unexpected vision response after {attempts} attempt(s): {message}")]
    Structure { attempts: u32, message: String },

    /// The model's reply looked like JSON but could not be parsed.
    #[error("could not parse model reply after {attempts} attempt(s): {message}")]
    Parse {
        attempts: u32,
        message: String,
        raw_text: String,
    },
}

impl OcrError {
    fn from_vision_error(attempts: u32, err: VisionError) -> Self {
        match err {
            VisionError::Structure(message) => OcrError::Structure { attempts, message },
            source => OcrError::Transport { attempts, source },
        }
    }
}

/// A candidate result we may fall back to once the budget is exhausted.
struct Candidate {
    fields: ExtractedFields,
    confidence: f64,
}

/// Sends images to a vision model and interprets the replies.
#[derive(Clone, Debug)]
pub struct OcrClient {
    driver: Arc<dyn VisionDriver>,
    opts: OcrOpts,
}

impl OcrClient {
    /// Create a new client.
    pub fn new(driver: Arc<dyn VisionDriver>, opts: OcrOpts) -> Self {
        Self { driver, opts }
    }

    /// Extract fields from one image.
    #[instrument(level = "debug", skip_all, fields(file_name = %image.file_name))]
    pub async fn extract(&self, image: &OcrImage) -> Result<OcrResult, OcrError> {
        let budget = self.opts.retry_budget();
        let request = VisionRequest {
            prompt: EXTRACTION_PROMPT,
            image: &image.bytes,
            mime_type: &image.mime_type,
        };
        let model_source = OcrSource::from(self.driver.driver_type());

        let mut best: Option<Candidate> = None;
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(attempt, "Requesting extraction");

            let text = match self.driver.generate(&request).await {
                Ok(text) => text,
                Err(err) if err.is_known_transient() && budget.can_retry_after(attempt) => {
                    budget.wait_before_retry(attempt, &err.to_string()).await;
                    continue;
                }
                Err(err) => {
                    if let Some(best) = best {
                        let warning = format!("Using an earlier low-confidence result: {err}");
                        return Ok(self.finish(image, model_source, best, attempt, vec![warning]));
                    }
                    return Err(OcrError::from_vision_error(attempt, err));
                }
            };

            let mut fields = match ModelReply::classify(&text) {
                ModelReply::Parsed(fields) | ModelReply::Unstructured(fields) => fields,
                ModelReply::Malformed { raw_text, error } => {
                    if budget.can_retry_after(attempt) {
                        budget
                            .wait_before_retry(attempt, &format!("malformed reply: {error}"))
                            .await;
                        continue;
                    }
                    if let Some(best) = best {
                        let warning = format!("Using an earlier low-confidence result: {error}");
                        return Ok(self.finish(image, model_source, best, attempt, vec![warning]));
                    }
                    if self.opts.no_fallback {
                        return Err(OcrError::Parse {
                            attempts: attempt,
                            message: error,
                            raw_text,
                        });
                    }
                    warn!(%error, "Falling back to heuristic text parsing");
                    let fields = fallback::parse_label_text(&raw_text);
                    let confidence = fields.confidence_scores.overall();
                    let warning =
                        format!("Model reply could not be parsed ({error}); used text fallback");
                    return Ok(self.finish(
                        image,
                        OcrSource::Fallback,
                        Candidate { fields, confidence },
                        attempt,
                        vec![warning],
                    ));
                }
            };

            fields.normalize_shipping_date();
            let confidence = fields.confidence_scores.overall();
            let candidate = Candidate { fields, confidence };
            if confidence >= self.opts.confidence_threshold {
                return Ok(self.finish(image, model_source, candidate, attempt, vec![]));
            }

            // Keep the most confident result so far. Ties go to the earlier one.
            let best_so_far = match best.take() {
                Some(previous) if previous.confidence >= confidence => previous,
                _ => candidate,
            };
            if budget.can_retry_after(attempt) {
                best = Some(best_so_far);
                budget
                    .wait_before_retry(attempt, &format!("low confidence {confidence:.2}"))
                    .await;
                continue;
            }

            let best = best_so_far;
            let warning = format!(
                "Low confidence ({:.2}) after {} attempt(s); please review",
                best.confidence, attempt
            );
            return Ok(self.finish(image, model_source, best, attempt, vec![warning]));
        }
    }

    fn finish(
        &self,
        image: &OcrImage,
        source: OcrSource,
        candidate: Candidate,
        attempts: u32,
        warnings: Vec<String>,
    ) -> OcrResult {
        for warning in &warnings {
            warn!(file_name = %image.file_name, "{}", warning);
        }
        OcrResult {
            file_name: image.file_name.clone(),
            source,
            overall_confidence: candidate.confidence,
            attempts,
            warnings,
            fields: candidate.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::{fields::UNKNOWN, *};
    use crate::drivers::scripted::ScriptedDriver;

    fn client(driver: &Arc<ScriptedDriver>, retries: u32) -> OcrClient {
        let opts = OcrOpts {
            retries,
            retry_backoff_ms: 0,
            ..OcrOpts::default()
        };
        OcrClient::new(driver.clone(), opts)
    }

    fn image() -> OcrImage {
        OcrImage {
            file_name: "label.jpg".to_owned(),
            bytes: vec![0xff, 0xd8, 0xff],
            mime_type: "image/jpeg".to_owned(),
        }
    }

    fn reply(barcode: &str, score: f64) -> String {
        json!({
            "barcodeNumber": barcode,
            "shippingDate": "25-08-08",
            "confidenceScores": { "barcodeNumber": score, "shippingDate": score },
            "rawText": "label text",
        })
        .to_string()
    }

    #[tokio::test]
    async fn retries_after_rate_limit() {
        let driver = Arc::new(ScriptedDriver::new([
            Err(VisionError::RateLimited),
            Ok(reply("111122223333", 0.95)),
        ]));
        let result = client(&driver, 3).extract(&image()).await.unwrap();
        assert_eq!(driver.calls(), 2);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.source, OcrSource::Gemini);
        assert_eq!(result.fields.barcode_number, "111122223333");
        assert_eq!(result.fields.shipping_date, "2008-08-25");
        assert!((result.overall_confidence - 0.95).abs() < 1e-9);
        assert!(result.warnings.is_empty());
        assert_eq!(result.file_name, "label.jpg");
    }

    #[tokio::test]
    async fn accepts_best_low_confidence_result_when_exhausted() {
        let first = reply("A", 0.5);
        let second = reply("B", 0.7);
        let third = reply("C", 0.6);
        let driver = Arc::new(ScriptedDriver::replies([
            first.as_str(),
            second.as_str(),
            third.as_str(),
        ]));
        let result = client(&driver, 2).extract(&image()).await.unwrap();
        assert_eq!(driver.calls(), 3);
        assert_eq!(result.fields.barcode_number, "B");
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("Low confidence"));
    }

    #[tokio::test]
    async fn reply_without_json_is_unknown_not_an_error() {
        let text = "I cannot read this image.";
        let driver = Arc::new(ScriptedDriver::replies([text]));
        let result = client(&driver, 0).extract(&image()).await.unwrap();
        assert_eq!(result.source, OcrSource::Gemini);
        assert_eq!(result.fields.raw_text, text);
        assert_eq!(result.fields.barcode_number, UNKNOWN);
        assert_eq!(result.overall_confidence, 0.85);
        assert_eq!(result.warnings.len(), 1);
    }

    #[tokio::test]
    async fn malformed_reply_falls_back_to_text_parsing() {
        let text = "Tracking Number: 123456789012\n{this is not json}";
        let driver = Arc::new(ScriptedDriver::replies([text, text]));
        let result = client(&driver, 1).extract(&image()).await.unwrap();
        assert_eq!(driver.calls(), 2);
        assert_eq!(result.source, OcrSource::Fallback);
        assert_eq!(result.fields.barcode_number, "123456789012");
        assert_eq!(result.fields.raw_text, text);
        assert!(result.warnings[0].contains("fallback"));
    }

    #[tokio::test]
    async fn malformed_reply_can_be_an_error() {
        let driver = Arc::new(ScriptedDriver::replies(["{oops}"]));
        let opts = OcrOpts {
            retries: 0,
            no_fallback: true,
            ..OcrOpts::default()
        };
        let client = OcrClient::new(driver.clone(), opts);
        assert!(matches!(
            client.extract(&image()).await,
            Err(OcrError::Parse { attempts: 1, .. })
        ));
    }

    #[tokio::test]
    async fn fatal_status_is_not_retried() {
        let driver = Arc::new(ScriptedDriver::new([Err(VisionError::Status {
            status: StatusCode::FORBIDDEN,
            body: "bad key".to_owned(),
        })]));
        let err = client(&driver, 3).extract(&image()).await.unwrap_err();
        assert_eq!(driver.calls(), 1);
        assert!(matches!(err, OcrError::Transport { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn structure_errors_exhaust_the_budget() {
        let driver = Arc::new(ScriptedDriver::new(Vec::new()));
        let err = client(&driver, 2).extract(&image()).await.unwrap_err();
        assert_eq!(driver.calls(), 3);
        assert!(matches!(err, OcrError::Structure { attempts: 3, .. }));
    }
}
