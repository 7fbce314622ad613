use crate::bus::{Notification, NotificationBus};
use crate::config::MAX_REMOTE_TIMEOUT_MS;
use crate::models::RetryPolicy;
use crate::remote::{ErrorClass, RemoteError, RemoteErrorKind, RemoteResult};
use std::future::Future;
use std::time::Duration;

/// Bounded retries with exponential backoff around a remote call.
///
/// `Ok(Some(value))` on success, `Ok(None)` when the call could not complete
/// (retries exhausted or no network), `Err` only for fatal errors, unchanged.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    bus: NotificationBus,
    default_timeout: Duration,
}

impl RetryExecutor {
    pub fn new(bus: NotificationBus, default_timeout: Duration) -> Self {
        Self {
            bus,
            default_timeout: default_timeout.min(Duration::from_millis(MAX_REMOTE_TIMEOUT_MS)),
        }
    }

    fn attempt_timeout(&self, policy: &RetryPolicy) -> Duration {
        policy
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
            .min(Duration::from_millis(MAX_REMOTE_TIMEOUT_MS))
    }

    pub async fn execute<T, F, Fut>(&self, label: &str, policy: RetryPolicy, mut operation: F) -> RemoteResult<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let timeout = self.attempt_timeout(&policy);
        let mut last_error: Option<RemoteError> = None;

        for attempt in 0..max_attempts {
            let result = match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::timed_out(timeout)),
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(operation = %label, attempt = attempt + 1, "remote call succeeded after retry");
                    }
                    return Ok(Some(value));
                }
                Err(error) => error,
            };

            match error.class() {
                ErrorClass::Unavailable => {
                    tracing::info!(operation = %label, "network unavailable, deferring");
                    return Ok(None);
                }
                ErrorClass::Fatal => {
                    tracing::warn!(operation = %label, error = %error, "remote call rejected");
                    return Err(error);
                }
                ErrorClass::Transient => {}
            }

            if error.kind == RemoteErrorKind::ResourceExhausted {
                self.bus.publish(Notification::ResourceError);
            }

            if attempt + 1 < max_attempts {
                let delay = policy.backoff_delay(attempt);
                tracing::warn!(
                    operation = %label,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            last_error = Some(error);
        }

        let (title, message) = match &last_error {
            Some(error) if error.kind == RemoteErrorKind::ResourceExhausted => ("Server Overloaded", error.message.clone()),
            Some(error) => ("Connection Error", error.message.clone()),
            None => ("Connection Error", "operation could not be completed".to_string()),
        };
        tracing::error!(operation = %label, attempts = max_attempts, title, "retries exhausted");
        self.bus.publish(Notification::OperationFailed {
            title: title.to_string(),
            message,
        });
        Ok(None)
    }
}
