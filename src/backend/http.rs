//! HTTP client for the automation backend.
//!
//! Each dispatch is a `POST {tunnel}{dispatch_path}` with a JSON [`DispatchCommand`].
//! The request runs on a spawned task so the consuming worker never waits on the
//! remote side; the response body is only logged.

use async_trait::async_trait;
use reqwest::{Client, Url};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{AutomationBackend, BackendError, DispatchCommand, DispatchFailureSink};
use crate::config::BackendConfig;

pub struct HttpAutomationBackend {
    client: Client,
    dispatch_path: String,
    failure_sink: Arc<dyn DispatchFailureSink>,
}

impl std::fmt::Debug for HttpAutomationBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAutomationBackend")
            .field("dispatch_path", &self.dispatch_path)
            .finish()
    }
}

impl HttpAutomationBackend {
    pub fn new(
        config: &BackendConfig,
        failure_sink: Arc<dyn DispatchFailureSink>,
    ) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| BackendError::unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            dispatch_path: config.dispatch_path.clone(),
            failure_sink,
        })
    }

    /// Full dispatch URL for a tunnel endpoint
    pub fn endpoint(&self, tunnel: &str) -> Result<Url, BackendError> {
        let base = tunnel.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(BackendError::invalid_endpoint(tunnel, "empty endpoint"));
        }

        let path = self.dispatch_path.trim_start_matches('/');
        let url = Url::parse(&format!("{base}/{path}"))
            .map_err(|e| BackendError::invalid_endpoint(tunnel, e.to_string()))?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(BackendError::invalid_endpoint(
                tunnel,
                format!("unsupported scheme {other}"),
            )),
        }
    }
}

#[async_trait]
impl AutomationBackend for HttpAutomationBackend {
    async fn dispatch(&self, tunnel: &str, command: DispatchCommand) -> Result<(), BackendError> {
        let url = self.endpoint(tunnel)?;
        let client = self.client.clone();
        let sink = self.failure_sink.clone();

        debug!(
            execution_id = %command.execution_id,
            step_id = %command.step_id,
            url = %url,
            "🌐 BACKEND: Dispatching step"
        );

        tokio::spawn(async move {
            match client.post(url.clone()).json(&command).send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if status.is_success() {
                        info!(
                            execution_id = %command.execution_id,
                            step_id = %command.step_id,
                            status = status.as_u16(),
                            body = %body,
                            "✅ BACKEND: Step accepted"
                        );
                    } else {
                        warn!(
                            execution_id = %command.execution_id,
                            step_id = %command.step_id,
                            status = status.as_u16(),
                            body = %body,
                            "⚠️ BACKEND: Non-success response, awaiting completion signal"
                        );
                    }
                }
                Err(e) => {
                    let reason = if e.is_timeout() {
                        format!("request to {url} timed out")
                    } else {
                        format!("request to {url} failed: {e}")
                    };
                    warn!(
                        execution_id = %command.execution_id,
                        step_id = %command.step_id,
                        reason = %reason,
                        "❌ BACKEND: Dispatch failed after hand-off"
                    );
                    sink.report_dispatch_failure(command.execution_id, &command.step_id, &reason)
                        .await;
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct NoopSink;

    #[async_trait]
    impl DispatchFailureSink for NoopSink {
        async fn report_dispatch_failure(&self, _: Uuid, _: &str, _: &str) {}
    }

    fn backend() -> HttpAutomationBackend {
        HttpAutomationBackend::new(&BackendConfig::default(), Arc::new(NoopSink)).unwrap()
    }

    #[test]
    fn test_endpoint_joins_tunnel_and_path() {
        let backend = backend();
        let url = backend.endpoint("https://m1.tunnel.example.com/").unwrap();
        assert_eq!(
            url.as_str(),
            "https://m1.tunnel.example.com/api/automation/run"
        );
    }

    #[test]
    fn test_endpoint_rejects_bad_tunnels() {
        let backend = backend();
        assert!(matches!(
            backend.endpoint("   "),
            Err(BackendError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            backend.endpoint("not a url"),
            Err(BackendError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            backend.endpoint("ftp://m1.example.com"),
            Err(BackendError::InvalidEndpoint { .. })
        ));
    }
}
