use axum::{Json, extract::State};
use serde_json::json;
use tokio::time::{Duration, timeout};

use crate::SharedState;
use crate::error::ApiError;

const READINESS_TIMEOUT: Duration = Duration::from_secs(1);

pub async fn livez() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn readyz(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.readiness.load(std::sync::atomic::Ordering::SeqCst) {
        return Err(ApiError::ServiceUnavailable("shutting_down".into()));
    }

    let embedder = state.pipeline.embedder();
    timeout(READINESS_TIMEOUT, embedder.ready())
        .await
        .map_err(|_| ApiError::ServiceUnavailable("embedder_ready_timeout".into()))
        .and_then(|result| {
            result.map_err(|err| ApiError::ServiceUnavailable(format!("embedder not ready: {err}")))
        })?;

    Ok(Json(json!({
        "status": "ok",
        "embedder": embedder.name(),
        "model": embedder.model(),
        "application": env!("CARGO_PKG_NAME"),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use axum::async_trait;
    use tm_common::embedding::{Embedding, EmbeddingError, TextEmbedder};
    use tm_common::matching::{MatchingPipeline, PipelineConfig};
    use tm_common::profile::ProfileText;

    use crate::test_state_with_pipeline;

    struct Unready;

    #[async_trait]
    impl TextEmbedder for Unready {
        fn name(&self) -> &'static str {
            "unready"
        }

        fn model(&self) -> &str {
            "none"
        }

        async fn embed(&self, _text: &ProfileText) -> Result<Embedding, EmbeddingError> {
            Err(EmbeddingError::Config("unused".into()))
        }

        async fn ready(&self) -> Result<(), EmbeddingError> {
            Err(EmbeddingError::Config("no token".into()))
        }
    }

    #[tokio::test]
    async fn readyz_rejects_when_readiness_disabled() {
        let state = crate::test_state("test-key");
        state.readiness.store(false, Ordering::SeqCst);

        let result = readyz(State(state)).await;

        match result {
            Err(ApiError::ServiceUnavailable(code)) => {
                assert!(code.contains("shutting_down"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn readyz_reports_embedder_without_credentials() {
        let pipeline = MatchingPipeline::new(Arc::new(Unready), PipelineConfig::default());
        let state = test_state_with_pipeline("test-key", pipeline);

        let result = readyz(State(state)).await;

        assert!(matches!(result, Err(ApiError::ServiceUnavailable(_))));
    }

    #[tokio::test]
    async fn readyz_reports_embedder_name() {
        let state = crate::test_state("test-key");

        let Json(body) = readyz(State(state)).await.unwrap();

        assert_eq!(body["embedder"], "hash");
    }
}
