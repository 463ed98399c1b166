//! Scripted transport for unit tests

use super::{RawResponse, RequestOptions, Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Status(u16, String),
    Fail(String),
    Hang,
}

impl Reply {
    pub(crate) fn status(status: u16, body: &str) -> Self {
        Reply::Status(status, body.to_string())
    }

    pub(crate) fn fail(message: &str) -> Self {
        Reply::Fail(message.to_string())
    }
}

#[derive(Debug, Clone)]
struct Step {
    delay: Duration,
    reply: Reply,
}

/// Replays queued replies in order, then falls back to a fixed reply
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    requests: Mutex<Vec<(String, RequestOptions)>>,
}

impl ScriptedTransport {
    pub(crate) fn always(delay: Duration, reply: Reply) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Step { delay, reply },
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a one-shot reply ahead of the fallback
    pub(crate) fn then(self, delay: Duration, reply: Reply) -> Self {
        self.script.lock().unwrap().push_back(Step { delay, reply });
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn requests(&self) -> Vec<(String, RequestOptions)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<RawResponse, TransportError> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), options.clone()));

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        tokio::time::sleep(step.delay).await;

        match step.reply {
            Reply::Status(status, body) => Ok(RawResponse {
                status,
                body,
                elapsed: step.delay,
            }),
            Reply::Fail(message) => Err(TransportError::Connection(message)),
            Reply::Hang => std::future::pending().await,
        }
    }
}
