//! Backend reachability
//!
//! Two independent paths:
//! - the keep-alive loop, which pings `/health` on a timer and only flips the
//!   `keep_alive_active` flag (failures are logged, never surfaced)
//! - the on-demand connection test, which drives [`ConnectionStatus`] and
//!   always produces a [`ConnectionReport`] for the user

use crate::executor::{RequestOptions, TimedExecutor};
use crate::pipeline::AnalysisRequest;
use crate::{ClientConfig, KeepAliveConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Text sent by the connection test
const CONNECTION_TEST_TEXT: &str = "Connection test.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Unknown,
    Testing,
    Online,
    Offline,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Unknown => write!(f, "unknown"),
            ConnectionState::Testing => write!(f, "testing"),
            ConnectionState::Online => write!(f, "online"),
            ConnectionState::Offline => write!(f, "offline"),
        }
    }
}

/// Result of the last connection test
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    #[serde(rename = "status")]
    pub state: ConnectionState,
    pub last_checked: Option<DateTime<Utc>>,
    /// Milliseconds, set only when online
    #[serde(rename = "responseTime")]
    pub response_time_ms: Option<u64>,
}

/// What the user is told after a connection test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionReport {
    pub state: ConnectionState,
    pub status_code: Option<u16>,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

impl std::fmt::Display for ConnectionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state {
            ConnectionState::Online => write!(
                f,
                "Connection OK - HTTP {} in {} ms",
                self.status_code.unwrap_or_default(),
                self.elapsed_ms
            ),
            _ => {
                write!(f, "Connection failed after {} ms", self.elapsed_ms)?;
                if let Some(code) = self.status_code {
                    write!(f, " - HTTP {code}")?;
                }
                if let Some(error) = &self.error {
                    write!(f, " - {error}")?;
                }
                Ok(())
            }
        }
    }
}

/// Owns the connection status and spawns the keep-alive loop
pub struct HealthProber {
    executor: Arc<TimedExecutor>,
    health_url: String,
    analyze_url: String,
    health_timeout: Duration,
    test_timeout: Duration,
    keep_alive: KeepAliveConfig,
    status: Mutex<ConnectionStatus>,
    keep_alive_active: Arc<AtomicBool>,
}

impl HealthProber {
    pub fn new(executor: Arc<TimedExecutor>, config: &ClientConfig) -> Self {
        Self {
            executor,
            health_url: config.health_url(),
            analyze_url: config.analyze_url(),
            health_timeout: config.timeouts.health(),
            test_timeout: config.timeouts.connection_test(),
            keep_alive: config.keep_alive.clone(),
            status: Mutex::new(ConnectionStatus::default()),
            keep_alive_active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().clone()
    }

    /// Whether the last keep-alive ping succeeded
    pub fn keep_alive_active(&self) -> bool {
        self.keep_alive_active.load(Ordering::SeqCst)
    }

    /// Run a user-requested connection test.
    ///
    /// Returns `None` without sending anything if a test is already running.
    pub async fn test_connection(&self) -> Option<ConnectionReport> {
        let previous = {
            let mut status = self.lock();
            if status.state == ConnectionState::Testing {
                debug!("Connection test already running, ignoring");
                return None;
            }
            std::mem::replace(&mut status.state, ConnectionState::Testing)
        };
        let mut testing = TestingGuard {
            status: &self.status,
            previous,
            armed: true,
        };

        let probe = AnalysisRequest {
            text: CONNECTION_TEST_TEXT.to_string(),
            question: String::new(),
        };

        let start = Instant::now();
        let outcome = match RequestOptions::post_json(&probe) {
            Ok(options) => self
                .executor
                .execute(&self.analyze_url, options, self.test_timeout)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let report = match outcome {
            Ok(response) if response.is_success() => ConnectionReport {
                state: ConnectionState::Online,
                status_code: Some(response.status),
                elapsed_ms,
                error: None,
            },
            Ok(response) => ConnectionReport {
                state: ConnectionState::Offline,
                status_code: Some(response.status),
                elapsed_ms,
                error: Some(format!("HTTP {}", response.status)),
            },
            Err(error) => ConnectionReport {
                state: ConnectionState::Offline,
                status_code: None,
                elapsed_ms,
                error: Some(error),
            },
        };

        testing.armed = false;
        {
            let mut status = self.lock();
            status.state = report.state;
            status.last_checked = Some(Utc::now());
            status.response_time_ms = match report.state {
                ConnectionState::Online => Some(elapsed_ms),
                _ => None,
            };
        }

        match report.state {
            ConnectionState::Online => info!(elapsed_ms, "Connection test passed"),
            _ => warn!(elapsed_ms, error = ?report.error, "Connection test failed"),
        }

        Some(report)
    }

    /// Spawn the keep-alive loop. It runs until the handle is shut down or
    /// dropped.
    pub fn start_keep_alive(&self) -> KeepAliveHandle {
        let token = CancellationToken::new();
        let activity = Arc::new(Notify::new());

        let task = KeepAliveTask {
            executor: Arc::clone(&self.executor),
            health_url: self.health_url.clone(),
            timeout: self.health_timeout,
            config: self.keep_alive.clone(),
            active: Arc::clone(&self.keep_alive_active),
        };

        info!(
            settle_ms = self.keep_alive.settle_ms,
            interval_ms = self.keep_alive.interval_ms,
            "Starting keep-alive loop"
        );

        let task = tokio::spawn(task.run(token.clone(), Arc::clone(&activity)));

        KeepAliveHandle {
            token,
            activity,
            task: Some(task),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Restores the state held before a connection test if the test is
/// abandoned before it completes
struct TestingGuard<'a> {
    status: &'a Mutex<ConnectionStatus>,
    previous: ConnectionState,
    armed: bool,
}

impl Drop for TestingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            status.state = self.previous;
        }
    }
}

/// Owner of a running keep-alive loop
pub struct KeepAliveHandle {
    token: CancellationToken,
    activity: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl KeepAliveHandle {
    /// Report user activity; a ping follows once activity goes quiet
    pub fn touch(&self) {
        self.activity.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and wait for it to release its timers
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Keep-alive task failed to join");
            }
        }
    }
}

impl Drop for KeepAliveHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct KeepAliveTask {
    executor: Arc<TimedExecutor>,
    health_url: String,
    timeout: Duration,
    config: KeepAliveConfig,
    active: Arc<AtomicBool>,
}

impl KeepAliveTask {
    async fn run(self, token: CancellationToken, activity: Arc<Notify>) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(self.config.settle()) => {}
        }
        self.ping_unless_cancelled(&token).await;

        let period = self.config.interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut debounce: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.ping_unless_cancelled(&token).await;
                }
                _ = activity.notified() => {
                    debounce = Some(Box::pin(tokio::time::sleep(self.config.debounce())));
                }
                _ = debounce_elapsed(&mut debounce) => {
                    debounce = None;
                    self.ping_unless_cancelled(&token).await;
                }
            }
        }

        self.active.store(false, Ordering::SeqCst);
        debug!("Keep-alive loop stopped");
    }

    async fn ping_unless_cancelled(&self, token: &CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = self.ping() => {}
        }
    }

    async fn ping(&self) {
        match self
            .executor
            .execute(&self.health_url, RequestOptions::get(), self.timeout)
            .await
        {
            Ok(response) if response.is_success() => {
                self.active.store(true, Ordering::SeqCst);
                debug!(latency_ms = response.elapsed.as_millis() as u64, "Keep-alive ping passed");
            }
            Ok(response) => {
                self.active.store(false, Ordering::SeqCst);
                warn!(status = response.status, "Keep-alive ping rejected");
            }
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                warn!(error = %e, "Keep-alive ping failed");
            }
        }
    }
}

async fn debounce_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{Reply, ScriptedTransport};

    fn prober(transport: ScriptedTransport) -> (Arc<HealthProber>, Arc<ScriptedTransport>, Arc<TimedExecutor>) {
        let transport = Arc::new(transport);
        let executor = Arc::new(TimedExecutor::new(transport.clone()));
        let config = ClientConfig::default().with_base_url("http://backend");
        let prober = Arc::new(HealthProber::new(Arc::clone(&executor), &config));
        (prober, transport, executor)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_online_with_response_time() {
        let (prober, transport, _) =
            prober(ScriptedTransport::always(ms(150), Reply::status(200, "{}")));
        assert_eq!(prober.status().state, ConnectionState::Unknown);

        let report = prober.test_connection().await.unwrap();

        assert_eq!(report.state, ConnectionState::Online);
        assert_eq!(report.status_code, Some(200));
        let status = prober.status();
        assert_eq!(status.state, ConnectionState::Online);
        assert_eq!(status.response_time_ms, Some(150));
        assert!(status.last_checked.is_some());

        let requests = transport.requests();
        let (url, options) = &requests[0];
        assert_eq!(url, "http://backend/api/analyze");
        assert!(options.body.as_deref().unwrap().contains("Connection test."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_http_error_is_offline() {
        let (prober, _, _) = prober(ScriptedTransport::always(ms(20), Reply::status(500, "boom")));

        let report = prober.test_connection().await.unwrap();

        assert_eq!(report.state, ConnectionState::Offline);
        assert_eq!(report.status_code, Some(500));
        assert!(report.to_string().contains("HTTP 500"));
        assert_eq!(prober.status().response_time_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_timeout_is_offline() {
        let (prober, _, executor) = prober(ScriptedTransport::always(Duration::ZERO, Reply::Hang));

        let report = prober.test_connection().await.unwrap();

        assert_eq!(report.state, ConnectionState::Offline);
        assert!(report.elapsed_ms >= 10_000);
        assert!(report.error.unwrap().contains("timed out"));
        assert_eq!(executor.active_deadlines(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_network_failure_is_offline() {
        let (prober, _, _) = prober(ScriptedTransport::always(Duration::ZERO, Reply::fail("refused")));

        let report = prober.test_connection().await.unwrap();

        assert_eq!(report.state, ConnectionState::Offline);
        assert_eq!(report.status_code, None);
        assert!(report.to_string().contains("refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_tests_are_ignored() {
        let (prober, transport, _) =
            prober(ScriptedTransport::always(ms(150), Reply::status(200, "{}")));

        let first = {
            let prober = Arc::clone(&prober);
            tokio::spawn(async move { prober.test_connection().await })
        };
        tokio::time::sleep(ms(10)).await;

        assert_eq!(prober.status().state, ConnectionState::Testing);
        assert!(prober.test_connection().await.is_none());

        assert!(first.await.unwrap().is_some());
        assert_eq!(transport.calls(), 1);

        // Repeatable once the previous test finished
        assert!(prober.test_connection().await.is_some());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_settles_then_repeats() {
        let (prober, transport, _) =
            prober(ScriptedTransport::always(Duration::ZERO, Reply::status(200, "ok")));

        let handle = prober.start_keep_alive();

        tokio::time::sleep(ms(1_900)).await;
        assert_eq!(transport.calls(), 0);
        assert!(!prober.keep_alive_active());

        tokio::time::sleep(ms(200)).await;
        assert_eq!(transport.calls(), 1);
        assert!(prober.keep_alive_active());
        assert_eq!(transport.requests()[0].0, "http://backend/health");

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.calls(), 2);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.calls(), 3);

        // The connection status is owned by the on-demand test only
        assert_eq!(prober.status().state, ConnectionState::Unknown);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_failure_only_clears_flag() {
        let (prober, transport, _) = prober(
            ScriptedTransport::always(Duration::ZERO, Reply::fail("down"))
                .then(Duration::ZERO, Reply::status(200, "ok")),
        );

        let handle = prober.start_keep_alive();
        tokio::time::sleep(ms(2_100)).await;
        assert!(prober.keep_alive_active());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.calls(), 2);
        assert!(!prober.keep_alive_active());
        assert_eq!(prober.status().state, ConnectionState::Unknown);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_is_debounced() {
        let (prober, transport, _) =
            prober(ScriptedTransport::always(Duration::ZERO, Reply::status(200, "ok")));

        let handle = prober.start_keep_alive();
        tokio::time::sleep(ms(2_100)).await;
        assert_eq!(transport.calls(), 1);

        handle.touch();
        tokio::time::sleep(ms(1_000)).await;
        handle.touch();
        tokio::time::sleep(ms(1_000)).await;
        assert_eq!(transport.calls(), 1);

        tokio::time::sleep(ms(600)).await;
        assert_eq!(transport.calls(), 2);

        tokio::time::sleep(ms(5_000)).await;
        assert_eq!(transport.calls(), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_timers() {
        let (prober, transport, executor) =
            prober(ScriptedTransport::always(Duration::ZERO, Reply::Hang));

        let handle = prober.start_keep_alive();
        tokio::time::sleep(ms(2_100)).await;
        assert_eq!(executor.active_deadlines(), 1);

        handle.touch();
        tokio::time::sleep(ms(10)).await;
        handle.shutdown().await;

        assert_eq!(executor.active_deadlines(), 0);
        assert!(!prober.keep_alive_active());

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_loop() {
        let (prober, transport, _) =
            prober(ScriptedTransport::always(Duration::ZERO, Reply::status(200, "ok")));

        let handle = prober.start_keep_alive();
        assert!(handle.is_running());
        drop(handle);

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_test_does_not_stick_in_testing() {
        let (prober, _, executor) = prober(ScriptedTransport::always(Duration::ZERO, Reply::Hang));

        let result = tokio::time::timeout(ms(100), prober.test_connection()).await;

        assert!(result.is_err());
        assert_eq!(prober.status().state, ConnectionState::Unknown);
        assert_eq!(executor.active_deadlines(), 0);
        assert!(prober.test_connection().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_test_keeps_previous_result() {
        let (prober, _, _) = prober(
            ScriptedTransport::always(Duration::ZERO, Reply::Hang)
                .then(Duration::ZERO, Reply::status(200, "{}")),
        );

        let report = prober.test_connection().await.unwrap();
        assert_eq!(report.state, ConnectionState::Online);

        let abandoned = tokio::time::timeout(ms(100), prober.test_connection()).await;

        assert!(abandoned.is_err());
        let status = prober.status();
        assert_eq!(status.state, ConnectionState::Online);
        assert!(status.response_time_ms.is_some());
    }

    #[test]
    fn test_status_serializes_like_the_ui_expects() {
        let status = ConnectionStatus {
            state: ConnectionState::Online,
            last_checked: None,
            response_time_ms: Some(150),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "online");
        assert_eq!(json["responseTime"], 150);
    }
}
