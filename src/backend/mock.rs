use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::debug;

use crate::backend::{BackendError, BackendReply, InferenceBackend, ReplyMetadata};
use crate::models::AssistRequest;

/// Deterministic in-process backend for dry runs and tests.
#[derive(Debug, Clone)]
pub struct MockBackend {
    id: String,
    delay: Duration,
    behavior: MockBehavior,
    script: Arc<Mutex<VecDeque<Result<String, BackendError>>>>,
    calls: Arc<AtomicUsize>,
}

#[derive(Debug, Clone)]
enum MockBehavior {
    Guidance,
    Reply(String),
    Fail(BackendError),
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            id: "mock-backend".to_owned(),
            delay: Duration::ZERO,
            behavior: MockBehavior::Guidance,
            script: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockBackend {
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn replying(mut self, text: impl Into<String>) -> Self {
        self.behavior = MockBehavior::Reply(text.into());
        self
    }

    pub fn failing(mut self, error: BackendError) -> Self {
        self.behavior = MockBehavior::Fail(error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queued results are served first, in order, before the standing behavior applies.
    pub fn scripted<I>(self, results: I) -> Self
    where
        I: IntoIterator<Item = Result<String, BackendError>>,
    {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(results);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, request: &AssistRequest) -> Result<BackendReply, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let result = match scripted {
            Some(result) => result,
            None => match &self.behavior {
                MockBehavior::Guidance => Ok(render_guidance(request)),
                MockBehavior::Reply(text) => Ok(text.clone()),
                MockBehavior::Fail(error) => Err(error.clone()),
            },
        };

        debug!(backend = %self.id, ok = result.is_ok(), "mock reply prepared");
        result.map(|text| {
            let completion_tokens = rough_token_estimate(&text);
            BackendReply {
                text,
                metadata: ReplyMetadata {
                    model: Some("mock".to_owned()),
                    prompt_tokens: Some(rough_token_estimate(request.text())),
                    completion_tokens: Some(completion_tokens),
                },
            }
        })
    }
}

fn render_guidance(request: &AssistRequest) -> String {
    format!(
        "Regarding \"{}\": isolate the equipment and apply lockout/tagout before touching it. \
         Inspect the affected components for wear, leaks or loose connections, review the \
         asset maintenance history for recurring faults, then repair or replace the failed \
         parts. Record the findings and parts used on the work order before returning the \
         asset to service.",
        request.text().trim()
    )
}

fn rough_token_estimate(text: &str) -> u32 {
    if text.trim().is_empty() {
        return 0;
    }
    text.split_whitespace().count() as u32
}
