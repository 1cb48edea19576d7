//! Vision model drivers.
//!
//! A driver takes one image plus a prompt and returns the model's text reply.
//! It knows nothing about shipping labels. Classifying and retrying replies
//! is the job of [`crate::ocr::OcrClient`].

use std::{fmt, pin::Pin, sync::Arc, time::Duration};

use clap::{Args, ValueEnum};
use futures::FutureExt as _;
use reqwest::StatusCode;
use tokio::time;

use crate::{prelude::*, rate_limit::RateLimit, retry::IsKnownTransient};

pub mod gemini;
pub mod offline;
#[cfg(test)]
pub mod scripted;

/// The model we use unless told otherwise.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Our different driver types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum DriverType {
    /// Google Gemini's `generateContent` API.
    #[default]
    Gemini,

    /// No network access. Replies with the contents of `--offline-reply`, or
    /// with unstructured text if none is given.
    Offline,
}

impl DriverType {
    /// Instantiate an appropriate driver.
    pub async fn create_driver(&self, opts: &DriverOpts) -> Result<Arc<dyn VisionDriver>> {
        match self {
            DriverType::Gemini => Ok(Arc::new(gemini::GeminiDriver::new(opts)?)),
            DriverType::Offline => {
                Ok(Arc::new(offline::OfflineDriver::new(opts).await?))
            }
        }
    }
}

/// Options for talking to the vision model.
#[derive(Args, Clone, Debug)]
pub struct DriverOpts {
    /// The driver to use.
    #[clap(long, value_enum, default_value_t = DriverType::default())]
    pub driver: DriverType,

    /// The model to ask.
    #[clap(long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// A timeout, in seconds, for the model to return a complete response.
    #[clap(long)]
    pub timeout: Option<u64>,

    /// A rate limit for model requests, of the form "10/s", "15/m" or
    /// "1000/h". This is applied separately from `--jobs`.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,

    /// For `--driver offline`, a file whose contents are returned as the
    /// model's reply to every request.
    #[clap(long)]
    pub offline_reply: Option<PathBuf>,
}

impl DriverOpts {
    /// Apply our timeout, if any, to a driver future.
    pub fn apply_timeout<'fut, T>(
        &self,
        future: impl Future<Output = Result<T, VisionError>> + Send + 'fut,
    ) -> Pin<Box<dyn Future<Output = Result<T, VisionError>> + Send + 'fut>>
    where
        T: Send + 'static,
    {
        if let Some(timeout) = self.timeout {
            time::timeout(Duration::from_secs(timeout), future)
                .map(|result| match result {
                    Ok(inner) => inner,
                    Err(_) => Err(VisionError::Timeout),
                })
                .boxed()
        } else {
            future.boxed()
        }
    }
}

/// A single image extraction request.
#[derive(Clone, Copy)]
pub struct VisionRequest<'a> {
    /// The instructions for the model.
    pub prompt: &'a str,
    /// The encoded image.
    pub image: &'a [u8],
    /// The MIME type of `image`.
    pub mime_type: &'a str,
}

impl fmt::Debug for VisionRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisionRequest")
            .field("prompt_len", &self.prompt.len())
            .field("image_len", &self.image.len())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// Interface trait for vision model drivers.
#[async_trait]
pub trait VisionDriver: fmt::Debug + Send + Sync + 'static {
    /// Which kind of driver is this?
    fn driver_type(&self) -> DriverType;

    /// Send an image and a prompt, and return the text of the reply.
    async fn generate(&self, request: &VisionRequest<'_>) -> Result<String, VisionError>;
}

/// An error which occurred while calling a vision model.
#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    /// The API told us to slow down.
    #[error("rate limited by vision API (HTTP 429)")]
    RateLimited,

    /// Some other unsuccessful HTTP status.
    #[error("vision API returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// We could not talk to the API at all.
    #[error("could not reach vision API: {0}")]
    Transport(#[from] reqwest::Error),

    /// The request took longer than `--timeout`.
    #[error("vision API request timed out")]
    Timeout,

    /// The response did not have the shape we expected.
    #[error("unexpected vision API response structure: {0}")]
    Structure(String),
}

impl IsKnownTransient for VisionError {
    fn is_known_transient(&self) -> bool {
        match self {
            VisionError::RateLimited => true,
            VisionError::Status { status, .. } => status.is_known_transient(),
            VisionError::Transport(err) => err.is_known_transient(),
            VisionError::Timeout => true,
            // A missing content path is retried, too.
            VisionError::Structure(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        assert!(VisionError::RateLimited.is_known_transient());
        assert!(VisionError::Timeout.is_known_transient());
        assert!(VisionError::Structure("no candidates".to_owned()).is_known_transient());
        assert!(
            VisionError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                body: String::new(),
            }
            .is_known_transient()
        );
        assert!(
            !VisionError::Status {
                status: StatusCode::FORBIDDEN,
                body: "API key not valid".to_owned(),
            }
            .is_known_transient()
        );
    }

    #[tokio::test]
    async fn timeouts_become_vision_errors() {
        let opts = DriverOpts {
            driver: DriverType::Offline,
            model: DEFAULT_MODEL.to_owned(),
            timeout: Some(0),
            rate_limit: None,
            offline_reply: None,
        };
        let slow = async {
            time::sleep(Duration::from_secs(5)).await;
            Ok::<_, VisionError>(())
        };
        assert!(matches!(
            opts.apply_timeout(slow).await,
            Err(VisionError::Timeout)
        ));
    }
}
