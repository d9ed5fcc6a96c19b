//! OCR provider implementations.
//!
//! - **[`DisabledProvider`]** fails every call; used when `ocr.provider = "disabled"`.
//! - **[`HttpOcrProvider`]** posts the chunk PDF to a document-AI endpoint.
//!
//! The HTTP provider makes exactly one request per call and maps failures
//! onto [`ChunkOcrError`] so the scheduler can decide whether to retry:
//!
//! - HTTP 429 → rate limited (retryable)
//! - HTTP 5xx → server error (retryable)
//! - other HTTP 4xx → malformed input (terminal)
//! - connect/timeout/network errors → transport (retryable)
//! - undecodable 2xx body → invalid response (terminal)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::StatusCode;

use casechunk_core::error::ChunkOcrError;
use casechunk_core::models::ChunkResult;
use casechunk_core::ocr::OcrProvider;

use crate::config::OcrConfig;

pub fn create_provider(config: &OcrConfig) -> Result<Arc<dyn OcrProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "http" => Ok(Arc::new(HttpOcrProvider::new(config)?)),
        other => Err(anyhow!("Unknown OCR provider: {}", other)),
    }
}

pub struct DisabledProvider;

#[async_trait]
impl OcrProvider for DisabledProvider {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn process_pages(&self, _pdf: &[u8]) -> Result<ChunkResult, ChunkOcrError> {
        Err(ChunkOcrError::Disabled)
    }
}

pub struct HttpOcrProvider {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpOcrProvider {
    pub fn new(config: &OcrConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow!("ocr.endpoint required for the http provider"))?;

        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .map_err(|_| anyhow!("{} environment variable not set", var))?,
            ),
            None => None,
        };

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            endpoint,
            api_key,
            client,
        })
    }
}

/// Map a non-success HTTP status to an OCR error.
pub fn classify_status(status: StatusCode, body: &str) -> ChunkOcrError {
    let message: String = body.chars().take(500).collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        ChunkOcrError::RateLimited(message)
    } else if status.is_server_error() {
        ChunkOcrError::Server {
            status: status.as_u16(),
            message,
        }
    } else {
        ChunkOcrError::MalformedInput(format!("HTTP {}: {}", status.as_u16(), message))
    }
}

#[async_trait]
impl OcrProvider for HttpOcrProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn process_pages(&self, pdf: &[u8]) -> Result<ChunkResult, ChunkOcrError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/pdf")
            .header("Accept", "application/json")
            .body(pdf.to_vec());
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| ChunkOcrError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ChunkOcrError::Transport(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| ChunkOcrError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::Router;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            ChunkOcrError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            ChunkOcrError::Server { status: 502, .. }
        ));
        let err = classify_status(StatusCode::UNPROCESSABLE_ENTITY, "not a pdf");
        assert!(matches!(err, ChunkOcrError::MalformedInput(_)));
        assert!(!err.is_retryable());
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/process", addr)
    }

    fn provider(endpoint: String) -> HttpOcrProvider {
        HttpOcrProvider::new(&OcrConfig {
            provider: "http".into(),
            endpoint: Some(endpoint),
            ..OcrConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn decodes_successful_response() {
        let app = Router::new().route(
            "/process",
            post(|| async {
                r#"{"pages":[{"page":1,"text":"IN THE SUPERIOR COURT","confidence":0.98}],
                    "boxes":[{"page":1,"x":0.1,"y":0.05,"width":0.8,"height":0.04,
                              "text":"IN THE SUPERIOR COURT","confidence":0.98,"reading_order":0}]}"#
            }),
        );
        let result = provider(spawn(app).await)
            .process_pages(b"%PDF-1.5")
            .await
            .unwrap();
        assert_eq!(result.pages.len(), 1);
        assert_eq!(result.boxes[0].text, "IN THE SUPERIOR COURT");
    }

    #[tokio::test]
    async fn rate_limit_is_retryable() {
        let app = Router::new().route(
            "/process",
            post(|| async { (AxumStatus::TOO_MANY_REQUESTS, "quota exceeded") }),
        );
        let err = provider(spawn(app).await)
            .process_pages(b"%PDF-1.5")
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkOcrError::RateLimited(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn garbage_body_is_invalid_response() {
        let app = Router::new().route("/process", post(|| async { "<html>oops</html>" }));
        let err = provider(spawn(app).await)
            .process_pages(b"%PDF-1.5")
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkOcrError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn disabled_provider_always_fails() {
        let err = DisabledProvider.process_pages(b"").await.unwrap_err();
        assert_eq!(err, ChunkOcrError::Disabled);
    }
}
