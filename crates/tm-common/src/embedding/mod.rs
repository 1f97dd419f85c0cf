pub mod config;
pub mod hash;
pub mod huggingface;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::credentials::{CredentialError, Credentials, OAuthClientCredentials};
use crate::profile::ProfileText;
pub use config::{CredentialMode, EmbeddingConfig, RequestFormat, load_config_from_env};
pub use hash::HashEmbedder;
pub use huggingface::HuggingFaceEmbedder;

#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Embedding {
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// 埋め込みサービス呼び出しの失敗（EmbeddingServiceError）
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Request(String),
    #[error("embedding service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("embedding call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("embedding service returned malformed data: {0}")]
    Malformed(String),
    #[error("embedding credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("invalid embedder configuration: {0}")]
    Config(String),
}

impl EmbeddingError {
    /// リトライする価値のある一時的な失敗か
    pub fn is_transient(&self) -> bool {
        match self {
            EmbeddingError::Request(_) | EmbeddingError::Timeout(_) => true,
            EmbeddingError::Status { status, .. } => *status == 429 || *status >= 500,
            EmbeddingError::Malformed(_)
            | EmbeddingError::Credential(_)
            | EmbeddingError::Config(_) => false,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, EmbeddingError::Status { status: 401, .. })
    }
}

/// テキスト埋め込みの抽象インターフェース
///
/// 実装:
/// - HuggingFaceEmbedder: 外部 feature-extraction エンドポイント
/// - HashEmbedder: Feature Hashing（決定論的、オフライン）
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// 実装名（"huggingface", "hash"）
    fn name(&self) -> &'static str;

    /// モデル名（レスポンスとログに載せる）
    fn model(&self) -> &str;

    /// 1 テキスト = 1 呼び出し
    async fn embed(&self, text: &ProfileText) -> Result<Embedding, EmbeddingError>;

    /// readiness 用。外部依存がなければ常に Ok
    async fn ready(&self) -> Result<(), EmbeddingError> {
        Ok(())
    }
}

/// 返ってきたベクトルが使えるかを検証する
pub(crate) fn validate_vector(
    vector: &[f32],
    expected_dimension: Option<usize>,
) -> Result<(), EmbeddingError> {
    if vector.is_empty() {
        return Err(EmbeddingError::Malformed("empty vector".into()));
    }

    if let Some(position) = vector.iter().position(|value| !value.is_finite()) {
        return Err(EmbeddingError::Malformed(format!(
            "non-finite value at index {position}"
        )));
    }

    if let Some(expected) = expected_dimension {
        if vector.len() != expected {
            return Err(EmbeddingError::Malformed(format!(
                "expected {expected} dimensions, got {}",
                vector.len()
            )));
        }
    }

    Ok(())
}

/// Embedder 実装のファクトリ
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn TextEmbedder>, EmbeddingError> {
    match config.embedder.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dimension.unwrap_or(hash::DEFAULT_DIMENSION),
        ))),
        "huggingface" | "hf" => {
            let credentials = build_credentials(config)?;
            let embedder = HuggingFaceEmbedder::new(config, Arc::new(credentials))?;
            Ok(Arc::new(embedder))
        }
        other => Err(EmbeddingError::Config(format!("unknown embedder: {other}"))),
    }
}

fn build_credentials(config: &EmbeddingConfig) -> Result<Credentials, EmbeddingError> {
    let credentials = match config.credential_mode {
        CredentialMode::Static => {
            let token = config.api_token.clone().ok_or_else(|| {
                CredentialError::Missing("HF_API_TOKEN is required for static credentials".into())
            })?;
            Credentials::from_static(token)?
        }
        CredentialMode::OAuth => {
            let (Some(token_url), Some(client_id), Some(client_secret)) = (
                config.oauth_token_url.clone(),
                config.oauth_client_id.clone(),
                config.oauth_client_secret.clone(),
            ) else {
                return Err(CredentialError::Missing(
                    "EMBEDDING_OAUTH_TOKEN_URL, _CLIENT_ID and _CLIENT_SECRET are required".into(),
                )
                .into());
            };
            let source = OAuthClientCredentials::new(
                token_url,
                client_id,
                client_secret,
                config.request_timeout,
            )?;
            Credentials::new(Arc::new(source))
        }
    };

    Ok(credentials)
}
