use crate::classify;
use crate::models::{Collection, Entity, Operation};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    NetworkUnavailable,
    ResourceExhausted,
    ConnectionError,
    RemoteRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected to clear on retry.
    Transient,
    /// Will recur identically on retry.
    Fatal,
    /// No network at all; defer instead of retrying.
    Unavailable,
}

impl RemoteErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkUnavailable => "network-unavailable",
            Self::ResourceExhausted => "resource-exhausted",
            Self::ConnectionError => "connection-error",
            Self::RemoteRejected => "remote-rejected",
        }
    }

    pub fn class(self) -> ErrorClass {
        match self {
            Self::NetworkUnavailable => ErrorClass::Unavailable,
            Self::ResourceExhausted | Self::ConnectionError => ErrorClass::Transient,
            Self::RemoteRejected => ErrorClass::Fatal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Builds an error from whatever signals the failure carried.
    pub fn from_signals(status: Option<u16>, code: Option<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = classify::classify(status, code.as_deref(), &message);
        Self {
            kind,
            status,
            code,
            message,
        }
    }

    pub fn network_unavailable() -> Self {
        Self::new(RemoteErrorKind::NetworkUnavailable, "no network connectivity")
    }

    pub fn timed_out(after: Duration) -> Self {
        Self::new(
            RemoteErrorKind::ConnectionError,
            format!("remote call timed out after {}ms", after.as_millis()),
        )
        .with_code("deadline-exceeded")
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {}): {}", self.kind.as_str(), status, self.message),
            None => write!(f, "{}: {}", self.kind.as_str(), self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Read/write capability of the remote backend.
pub trait RemoteBackend: Send + Sync {
    fn read_collection(&self, collection: Collection) -> BoxFuture<'_, RemoteResult<Vec<serde_json::Value>>>;

    fn write_record(
        &self,
        operation: Operation,
        entity: Entity,
        payload: serde_json::Value,
    ) -> BoxFuture<'_, RemoteResult<serde_json::Value>>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default, alias = "error")]
    message: Option<String>,
}

/// REST backend: `GET /{collection}`, `POST /{collection}`,
/// `PATCH /{collection}/{id}`, `DELETE /{collection}/{id}`.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| RemoteError::new(RemoteErrorKind::ConnectionError, error.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn collection_url(&self, collection: Collection) -> String {
        format!("{}/{}", self.base_url, collection.as_str())
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> RemoteResult<serde_json::Value> {
        let response = self.authorize(request).send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            if status == reqwest::StatusCode::NO_CONTENT {
                return Ok(serde_json::Value::Null);
            }
            return response
                .json::<serde_json::Value>()
                .await
                .map_err(|error| RemoteError::new(RemoteErrorKind::ConnectionError, format!("invalid response body: {}", error)));
        }

        let raw = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<ErrorBody>(&raw).ok();
        let code = body.as_ref().and_then(|body| body.code.clone());
        let message = body
            .and_then(|body| body.message)
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
        Err(RemoteError::from_signals(Some(status.as_u16()), code, message))
    }
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        return RemoteError::new(RemoteErrorKind::ConnectionError, error.to_string()).with_code("deadline-exceeded");
    }
    if error.is_connect() || error.is_request() {
        return RemoteError::new(RemoteErrorKind::ConnectionError, error.to_string()).with_code("unavailable");
    }
    match error.status() {
        Some(status) => RemoteError::from_signals(Some(status.as_u16()), None, error.to_string()),
        None => RemoteError::from_signals(None, None, error.to_string()),
    }
}

fn record_id(payload: &serde_json::Value) -> RemoteResult<String> {
    match payload.get("id") {
        Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(serde_json::Value::Number(id)) => Ok(id.to_string()),
        _ => Err(RemoteError::new(RemoteErrorKind::RemoteRejected, "payload has no record id").with_code("invalid-argument")),
    }
}

impl RemoteBackend for HttpBackend {
    fn read_collection(&self, collection: Collection) -> BoxFuture<'_, RemoteResult<Vec<serde_json::Value>>> {
        Box::pin(async move {
            let value = self.send(self.client.get(self.collection_url(collection))).await?;
            match value {
                serde_json::Value::Array(items) => Ok(items),
                serde_json::Value::Null => Ok(Vec::new()),
                other => match other.get("data").and_then(|data| data.as_array()) {
                    Some(items) => Ok(items.clone()),
                    None => Err(RemoteError::new(
                        RemoteErrorKind::RemoteRejected,
                        format!("expected an array for {}", collection.as_str()),
                    )),
                },
            }
        })
    }

    fn write_record(
        &self,
        operation: Operation,
        entity: Entity,
        payload: serde_json::Value,
    ) -> BoxFuture<'_, RemoteResult<serde_json::Value>> {
        Box::pin(async move {
            let url = self.collection_url(entity.collection());
            let request = match operation {
                Operation::Create => self.client.post(url).json(&payload),
                Operation::Update => {
                    let id = record_id(&payload)?;
                    self.client.patch(format!("{}/{}", url, id)).json(&payload)
                }
                Operation::Delete => {
                    let id = record_id(&payload)?;
                    self.client.delete(format!("{}/{}", url, id))
                }
            };
            self.send(request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{record_id, ErrorClass, RemoteError, RemoteErrorKind};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn classes_are_exhaustive() {
        assert_eq!(RemoteErrorKind::ResourceExhausted.class(), ErrorClass::Transient);
        assert_eq!(RemoteErrorKind::ConnectionError.class(), ErrorClass::Transient);
        assert_eq!(RemoteErrorKind::RemoteRejected.class(), ErrorClass::Fatal);
        assert_eq!(RemoteErrorKind::NetworkUnavailable.class(), ErrorClass::Unavailable);
    }

    #[test]
    fn signals_are_classified_structurally() {
        let error = RemoteError::from_signals(Some(429), None, "slow down");
        assert_eq!(error.kind, RemoteErrorKind::ResourceExhausted);
        assert!(error.is_transient());
        let error = RemoteError::from_signals(Some(422), Some("invalid-argument".to_string()), "bad pin");
        assert!(error.is_fatal());
    }

    #[test]
    fn timeouts_are_transient() {
        let error = RemoteError::timed_out(Duration::from_secs(10));
        assert!(error.is_transient());
        assert_eq!(error.code.as_deref(), Some("deadline-exceeded"));
    }

    #[test]
    fn update_requires_record_id() {
        assert_eq!(record_id(&json!({ "id": "dev-1" })).expect("id"), "dev-1");
        assert_eq!(record_id(&json!({ "id": 7 })).expect("id"), "7");
        assert!(record_id(&json!({ "name": "x" })).expect_err("missing").is_fatal());
    }
}
