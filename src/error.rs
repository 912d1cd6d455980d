//! Typed failure kinds surfaced by the engine.
//!
//! Backend crates report failures as `anyhow::Error`; every component
//! boundary (slot manager, dispatcher, scorer) converts them into one of
//! these kinds with the original message preserved verbatim.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Engine-level error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Malformed or missing model path/identifier, unsupported format, or
    /// missing optional runtime. Leaves the slot Empty.
    #[error("{0}")]
    Configuration(String),
    /// The classifier has not finished loading, or failed to load.
    #[error("{0}")]
    Unavailable(String),
    /// No backend matched the query's selectors.
    #[error("{0}")]
    Dispatch(String),
    /// The selected backend raised during generation or classification.
    #[error("{0}")]
    Inference(String),
}

impl EngineError {
    /// Wrap a backend failure, keeping the whole cause chain in the message.
    pub fn configuration(err: &anyhow::Error) -> Self {
        Self::Configuration(format!("{err:#}"))
    }

    pub fn inference(err: &anyhow::Error) -> Self {
        Self::Inference(format!("{err:#}"))
    }

    /// Short machine-readable kind, used in logs and response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Unavailable(_) => "unavailable",
            Self::Dispatch(_) => "dispatch",
            Self::Inference(_) => "inference",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration(_) | Self::Dispatch(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "kind": self.kind(),
            "detail": self.to_string(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn status_codes_follow_kind() {
        assert_eq!(
            EngineError::Configuration("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::Dispatch("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::Unavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            EngineError::Inference("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn inference_keeps_cause_chain() {
        let err = anyhow::anyhow!("connection refused").context("daemon unreachable");
        let wrapped = EngineError::inference(&err);
        assert_eq!(
            wrapped.to_string(),
            "daemon unreachable: connection refused"
        );
    }

    #[tokio::test]
    async fn response_body_carries_detail() {
        let resp = EngineError::Unavailable("classifier is not ready".into()).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["detail"], "classifier is not ready");
        assert_eq!(body["kind"], "unavailable");
    }
}
