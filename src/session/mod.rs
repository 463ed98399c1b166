//! One client session: shared executor, prober, pipeline and ledger

use crate::executor::{HttpTransport, RequestOptions, TimedExecutor, Transport, TransportError};
use crate::ledger::AuditLedger;
use crate::pipeline::AnalysisPipeline;
use crate::probe::HealthProber;
use crate::ClientConfig;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Deserialize)]
struct ReadmeResponse {
    #[serde(default)]
    readme_content: Option<String>,
}

/// Everything one user session needs. State is lost when it is dropped.
pub struct AnalysisSession {
    config: ClientConfig,
    executor: Arc<TimedExecutor>,
    ledger: Arc<AuditLedger>,
    prober: Arc<HealthProber>,
    pipeline: Arc<AnalysisPipeline>,
}

impl AnalysisSession {
    /// Session talking HTTP to `config.base_url`
    pub fn new(config: ClientConfig) -> Result<Self, TransportError> {
        let transport = HttpTransport::new()?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Session over any transport
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let executor = Arc::new(TimedExecutor::new(transport));
        let ledger = Arc::new(AuditLedger::new());
        let prober = Arc::new(HealthProber::new(Arc::clone(&executor), &config));
        let pipeline = Arc::new(AnalysisPipeline::new(
            Arc::clone(&executor),
            Arc::clone(&ledger),
            &config,
        ));

        Self {
            config,
            executor,
            ledger,
            prober,
            pipeline,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<TimedExecutor> {
        &self.executor
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    pub fn prober(&self) -> &Arc<HealthProber> {
        &self.prober
    }

    pub fn pipeline(&self) -> &Arc<AnalysisPipeline> {
        &self.pipeline
    }

    /// Readme text for the about screen, or the configured fallback
    pub async fn fetch_readme(&self) -> String {
        let response = self
            .executor
            .execute(
                self.config.readme_url(),
                RequestOptions::get(),
                self.config.timeouts.default_timeout(),
            )
            .await;

        let content = match response {
            Ok(response) if response.is_success() => {
                match serde_json::from_str::<ReadmeResponse>(response.text()) {
                    Ok(body) => body.readme_content,
                    Err(e) => {
                        warn!(error = %e, "Readme response was not understood");
                        None
                    }
                }
            }
            Ok(response) => {
                debug!(status = response.status, "Readme not available");
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch readme");
                None
            }
        };

        content
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| self.config.readme_fallback.clone())
    }
}
