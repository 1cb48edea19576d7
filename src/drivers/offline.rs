//! A driver that never touches the network.
//!
//! Handy for trying out the rest of the pipeline, and for CLI tests.

use super::{DriverOpts, DriverType, VisionDriver, VisionError, VisionRequest};
use crate::prelude::*;

/// What we say when no canned reply was supplied. Deliberately contains no
/// JSON, so every field comes back `UNKNOWN`.
const PLACEHOLDER_REPLY: &str = "Offline mode: no text was read from this image.";

/// Replies with the same text to every request.
#[derive(Debug)]
pub struct OfflineDriver {
    reply: String,
}

impl OfflineDriver {
    /// Create a new offline driver, loading `--offline-reply` if given.
    pub async fn new(opts: &DriverOpts) -> Result<Self> {
        let reply = match &opts.offline_reply {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read offline reply from {:?}", path))?,
            None => PLACEHOLDER_REPLY.to_owned(),
        };
        Ok(Self { reply })
    }
}

#[async_trait]
impl VisionDriver for OfflineDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::Offline
    }

    async fn generate(&self, request: &VisionRequest<'_>) -> Result<String, VisionError> {
        debug!(?request, "Offline driver returning canned reply");
        Ok(self.reply.clone())
    }
}
