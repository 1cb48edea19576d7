//! A driver which plays back a fixed script of replies, for tests.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use super::{DriverType, VisionDriver, VisionError, VisionRequest};
use crate::prelude::*;

/// Returns each scripted result in turn, then fails with a structure error.
#[derive(Debug)]
pub struct ScriptedDriver {
    script: Mutex<VecDeque<Result<String, VisionError>>>,
    calls: AtomicUsize,
}

impl ScriptedDriver {
    pub fn new(script: impl IntoIterator<Item = Result<String, VisionError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Shorthand for a script of successful text replies.
    pub fn replies<'a>(replies: impl IntoIterator<Item = &'a str>) -> Self {
        Self::new(replies.into_iter().map(|r| Ok(r.to_owned())))
    }

    /// How many times were we called?
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionDriver for ScriptedDriver {
    fn driver_type(&self) -> DriverType {
        DriverType::Gemini
    }

    async fn generate(&self, _request: &VisionRequest<'_>) -> Result<String, VisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(VisionError::Structure("script exhausted".to_owned())))
    }
}
