//! Analysis request pipeline
//!
//! A submission moves the pipeline from `Idle` to `Running`. Each dispatch
//! gets a new generation number; starting a new submission cancels the
//! previous one, and a completion whose generation is no longer current is
//! discarded without touching the result or the ledger.

use crate::executor::{AbortReason, CancelHandle, ExecutorError, RawResponse, RequestOptions, TimedExecutor};
use crate::ledger::AuditLedger;
use crate::ClientConfig;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failure of one analysis request
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Request aborted: {0}")]
    Aborted(AbortReason),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("HTTP {status}: {body_excerpt}")]
    HttpError { status: u16, body_excerpt: String },

    #[error("Unexpected response: {0}")]
    ParseFailure(String),
}

impl From<ExecutorError> for AnalysisError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Aborted(reason) => AnalysisError::Aborted(reason),
            ExecutorError::NetworkFailure(msg) => AnalysisError::NetworkFailure(msg),
        }
    }
}

impl AnalysisError {
    /// Message shown in place of the humanized text
    pub fn user_message(&self) -> String {
        match self {
            AnalysisError::Aborted(AbortReason::Timeout) => {
                "The analysis request timed out before the server responded. Please try again."
                    .to_string()
            }
            AnalysisError::Aborted(AbortReason::Cancelled) => {
                "The analysis request was cancelled. Please submit again.".to_string()
            }
            AnalysisError::NetworkFailure(_) => {
                "Could not connect to the analysis server. Check that the backend is running and reachable, then try again."
                    .to_string()
            }
            AnalysisError::HttpError {
                status,
                body_excerpt,
            } => format!("Analysis failed (HTTP {status}): {body_excerpt}"),
            AnalysisError::ParseFailure(detail) => format!("Analysis failed: {detail}"),
        }
    }
}

/// A `.txt` file chosen by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub name: String,
    pub content: String,
}

/// Everything the user has entered for one submission
#[derive(Debug, Clone, Default)]
pub struct AnalysisInput {
    pub typed_text: String,
    pub uploaded: Option<UploadedFile>,
    pub question: Option<String>,
}

impl AnalysisInput {
    pub fn typed(text: impl Into<String>) -> Self {
        Self {
            typed_text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_upload(mut self, file: UploadedFile) -> Self {
        self.uploaded = Some(file);
        self
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = Some(question.into());
        self
    }

    /// Uploaded content wins over typed text; `None` if both are empty
    pub fn resolve(&self) -> Option<AnalysisRequest> {
        let text = match &self.uploaded {
            Some(file) if !file.content.is_empty() => file.content.clone(),
            _ if !self.typed_text.trim().is_empty() => self.typed_text.clone(),
            _ => return None,
        };

        Some(AnalysisRequest {
            text,
            question: self.question.clone().unwrap_or_default(),
        })
    }

    /// File name of the upload that supplied the text, if any
    pub fn source_file_name(&self) -> Option<&str> {
        self.uploaded
            .as_ref()
            .filter(|f| !f.content.is_empty())
            .map(|f| f.name.as_str())
    }
}

/// Body of `POST /api/analyze`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub text: String,
    /// Empty when the user asked nothing
    #[serde(default)]
    pub question: String,
}

/// Success body of `POST /api/analyze`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub display_data: DisplayData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayData {
    pub humanized_text: String,
    #[serde(rename = "technicalData", default, skip_serializing_if = "Option::is_none")]
    pub technical_data: Option<serde_json::Value>,
}

/// What the presentation layer renders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Real content or a user-facing error message
    pub humanized_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical_data: Option<serde_json::Value>,
    /// Present only when the result was recorded in the ledger
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_code: Option<String>,
}

impl AnalysisResult {
    fn from_error(err: &AnalysisError) -> Self {
        Self {
            humanized_text: err.user_message(),
            technical_data: None,
            verification_code: None,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verification_code.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Neither uploaded content nor typed text had anything to send
    EmptyInput,
}

/// How a call to [`AnalysisPipeline::submit`] ended
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The result was committed
    Completed(AnalysisResult),
    /// A newer submission took over; this completion was discarded
    Superseded,
    /// Nothing was sent
    Rejected(RejectReason),
}

#[derive(Debug)]
struct Inner {
    generation: u64,
    state: PipelineState,
    in_flight: Option<CancelHandle>,
    result: Option<AnalysisResult>,
}

/// Orchestrates submissions against the analysis endpoint
pub struct AnalysisPipeline {
    executor: Arc<TimedExecutor>,
    ledger: Arc<AuditLedger>,
    analyze_url: String,
    timeout: Duration,
    excerpt_chars: usize,
    inner: Mutex<Inner>,
}

impl AnalysisPipeline {
    pub fn new(executor: Arc<TimedExecutor>, ledger: Arc<AuditLedger>, config: &ClientConfig) -> Self {
        Self {
            executor,
            ledger,
            analyze_url: config.analyze_url(),
            timeout: config.timeouts.analyze(),
            excerpt_chars: config.error_excerpt_chars,
            inner: Mutex::new(Inner {
                generation: 0,
                state: PipelineState::Idle,
                in_flight: None,
                result: None,
            }),
        }
    }

    /// Submit the user's input for analysis
    pub async fn submit(&self, input: &AnalysisInput) -> SubmitOutcome {
        let Some(request) = input.resolve() else {
            debug!("Ignoring submission with empty input");
            return SubmitOutcome::Rejected(RejectReason::EmptyInput);
        };
        let file_name = input.source_file_name();

        let (generation, pending) = {
            let mut inner = self.lock();
            inner.generation += 1;
            if let Some(previous) = inner.in_flight.take() {
                info!(generation = inner.generation - 1, "Cancelling previous analysis");
                previous.cancel();
            }
            inner.result = None;
            inner.state = PipelineState::Running;

            let pending = RequestOptions::post_json(&request)
                .map(|options| {
                    let (pending, handle) =
                        self.executor.dispatch(&self.analyze_url, options, self.timeout);
                    inner.in_flight = Some(handle);
                    pending
                })
                .map_err(|e| AnalysisError::ParseFailure(e.to_string()));

            (inner.generation, pending)
        };
        let mut run = RunGuard {
            inner: &self.inner,
            generation,
            armed: true,
        };

        info!(
            generation,
            chars = request.text.chars().count(),
            file_name = ?file_name,
            has_question = !request.question.is_empty(),
            "Submitting analysis"
        );

        let outcome = match pending {
            Ok(pending) => self.interpret(pending.wait().await),
            Err(e) => Err(e),
        };

        run.armed = false;
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!(generation, current = inner.generation, "Discarding stale analysis completion");
            return SubmitOutcome::Superseded;
        }

        let result = match outcome {
            Ok(display) => {
                let code = self
                    .ledger
                    .record(&request.text, &display.humanized_text, file_name);
                AnalysisResult {
                    humanized_text: display.humanized_text,
                    technical_data: display.technical_data,
                    verification_code: Some(code),
                }
            }
            Err(e) => {
                warn!(generation, error = %e, "Analysis failed");
                AnalysisResult::from_error(&e)
            }
        };

        inner.result = Some(result.clone());
        inner.state = PipelineState::Idle;
        inner.in_flight = None;
        SubmitOutcome::Completed(result)
    }

    /// Cancel the in-flight submission, if any
    pub fn cancel(&self) {
        if let Some(handle) = &self.lock().in_flight {
            handle.cancel();
        }
    }

    /// The last committed result
    pub fn result(&self) -> Option<AnalysisResult> {
        self.lock().result.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    fn interpret(
        &self,
        response: Result<RawResponse, ExecutorError>,
    ) -> Result<DisplayData, AnalysisError> {
        let response = response?;

        if !response.is_success() {
            return Err(AnalysisError::HttpError {
                status: response.status,
                body_excerpt: excerpt(response.text(), self.excerpt_chars),
            });
        }

        let body: AnalyzeResponse = serde_json::from_str(response.text())
            .map_err(|e| AnalysisError::ParseFailure(e.to_string()))?;
        Ok(body.display_data)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns the pipeline to `Idle` if a submission is dropped before it
/// completes and no newer submission has taken over
struct RunGuard<'a> {
    inner: &'a Mutex<Inner>,
    generation: u64,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.generation == self.generation {
            debug!(generation = self.generation, "Analysis abandoned before completion");
            inner.state = PipelineState::Idle;
            if let Some(handle) = inner.in_flight.take() {
                handle.cancel();
            }
        }
    }
}

/// First `max_chars` characters of `body`
fn excerpt(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}
