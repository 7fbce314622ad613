use super::state::MonitorEvent;
use crate::classify;
use crate::remote::{BoxFuture, RemoteErrorKind};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy { latency: Duration },
    ResourceExhausted,
    Failed { reason: String },
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }

    pub(crate) fn event(&self) -> MonitorEvent {
        match self {
            Self::Healthy { .. } => MonitorEvent::ProbeSucceeded,
            Self::ResourceExhausted => MonitorEvent::ProbeResourceExhausted,
            Self::Failed { .. } => MonitorEvent::ProbeFailed,
        }
    }
}

/// Lightweight backend health check.
pub trait HealthProbe: Send + Sync {
    fn check(&self) -> BoxFuture<'_, ProbeOutcome>;
}

#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

impl HealthProbe for HttpHealthProbe {
    fn check(&self) -> BoxFuture<'_, ProbeOutcome> {
        Box::pin(async move {
            let started = Instant::now();
            let response = match self.client.get(&self.url).send().await {
                Ok(response) => response,
                Err(error) => {
                    return ProbeOutcome::Failed {
                        reason: error.to_string(),
                    }
                }
            };
            let status = response.status();
            if status.is_success() {
                return ProbeOutcome::Healthy {
                    latency: started.elapsed(),
                };
            }
            match classify::classify_status(status.as_u16()) {
                RemoteErrorKind::ResourceExhausted => ProbeOutcome::ResourceExhausted,
                _ => ProbeOutcome::Failed {
                    reason: format!("health check returned HTTP {}", status.as_u16()),
                },
            }
        })
    }
}
