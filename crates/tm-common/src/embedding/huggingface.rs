//! Hugging Face feature-extraction embedding client.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::{EmbeddingConfig, RequestFormat};
use super::{Embedding, EmbeddingError, TextEmbedder, validate_vector};
use crate::credentials::Credentials;
use crate::profile::ProfileText;

/// エラーボディはログと例外メッセージ用に切り詰める
const MAX_ERROR_BODY: usize = 512;

/// Async client for a feature-extraction endpoint that returns one vector per input.
#[derive(Clone)]
pub struct HuggingFaceEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    request_format: RequestFormat,
    expected_dimension: Option<usize>,
    credentials: Arc<Credentials>,
}

#[derive(Serialize)]
struct InputsRequest<'a> {
    inputs: &'a str,
}

/// sentence-transformers は `[f32]`、一部のモデル/経路は `[[f32]]` を返す
#[derive(Deserialize)]
#[serde(untagged)]
enum FeatureExtractionResponse {
    Flat(Vec<f32>),
    Nested(Vec<Vec<f32>>),
}

impl HuggingFaceEmbedder {
    pub fn new(
        config: &EmbeddingConfig,
        credentials: Arc<Credentials>,
    ) -> Result<Self, EmbeddingError> {
        if config.endpoint.trim().is_empty() {
            return Err(EmbeddingError::Config("missing embedding endpoint".into()));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| EmbeddingError::Config(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim().to_string(),
            model: config.model.clone(),
            request_format: config.request_format,
            expected_dimension: config.dimension,
            credentials,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, text: &ProfileText) -> Result<Embedding, EmbeddingError> {
        let token = self.credentials.bearer().await?;

        let request = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {token}"));

        let request = match self.request_format {
            RequestFormat::Raw => request
                .header(CONTENT_TYPE, "application/json")
                .body(text.as_str().to_string()),
            RequestFormat::Inputs => request.json(&InputsRequest {
                inputs: text.as_str(),
            }),
        };

        let response = request
            .send()
            .await
            .map_err(|err| EmbeddingError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            truncate_on_char_boundary(&mut body, MAX_ERROR_BODY);
            return Err(EmbeddingError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| EmbeddingError::Request(err.to_string()))?;

        let vector = parse_feature_extraction(&bytes)?;
        validate_vector(&vector, self.expected_dimension)?;

        debug!(
            model = %self.model,
            dimension = vector.len(),
            text_len = text.len(),
            "embedding received"
        );

        Ok(Embedding::new(vector))
    }
}

/// レスポンスボディを 1 本のベクトルに変換する。想定外の形は Malformed。
pub fn parse_feature_extraction(body: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
    let parsed: FeatureExtractionResponse = serde_json::from_slice(body)
        .map_err(|err| EmbeddingError::Malformed(format!("unexpected response shape: {err}")))?;

    match parsed {
        FeatureExtractionResponse::Flat(vector) => Ok(vector),
        FeatureExtractionResponse::Nested(mut rows) if rows.len() == 1 => Ok(rows.remove(0)),
        FeatureExtractionResponse::Nested(rows) => Err(EmbeddingError::Malformed(format!(
            "expected a single embedding row, got {}",
            rows.len()
        ))),
    }
}

fn truncate_on_char_boundary(value: &mut String, max_len: usize) {
    if value.len() <= max_len {
        return;
    }
    let mut cut = max_len;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    value.truncate(cut);
}

#[async_trait]
impl TextEmbedder for HuggingFaceEmbedder {
    fn name(&self) -> &'static str {
        "huggingface"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &ProfileText) -> Result<Embedding, EmbeddingError> {
        match self.send(text).await {
            Err(err) if err.is_unauthorized() => {
                // トークン失効の可能性: 一度だけ取り直して再送する
                warn!(
                    credential_source = self.credentials.source_name(),
                    "embedding service rejected token; refreshing credential"
                );
                self.credentials.invalidate().await;
                self.send(text).await
            }
            other => other,
        }
    }

    async fn ready(&self) -> Result<(), EmbeddingError> {
        self.credentials.bearer().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_vector() {
        let vector = parse_feature_extraction(b"[0.1, -0.2, 0.3]").unwrap();

        assert_eq!(vector, vec![0.1, -0.2, 0.3]);
    }

    #[test]
    fn parses_single_nested_row() {
        let vector = parse_feature_extraction(b"[[0.5, 0.25]]").unwrap();

        assert_eq!(vector, vec![0.5, 0.25]);
    }

    #[test]
    fn rejects_multi_row_response() {
        let err = parse_feature_extraction(b"[[0.5, 0.25], [0.1, 0.2]]").unwrap_err();

        assert!(matches!(err, EmbeddingError::Malformed(_)));
    }

    #[test]
    fn rejects_non_numeric_entries() {
        let err = parse_feature_extraction(br#"[0.5, "x"]"#).unwrap_err();

        assert!(matches!(err, EmbeddingError::Malformed(_)));
    }

    #[test]
    fn rejects_error_object() {
        let err = parse_feature_extraction(br#"{"error": "Model is loading"}"#).unwrap_err();

        assert!(matches!(err, EmbeddingError::Malformed(_)));
    }

    #[test]
    fn truncates_multibyte_body_safely() {
        let mut body = "é".repeat(10);

        truncate_on_char_boundary(&mut body, 5);

        assert_eq!(body, "éé");
    }
}
