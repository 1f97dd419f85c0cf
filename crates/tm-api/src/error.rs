use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{borrow::Cow, future::Future};
use thiserror::Error;
use tracing::error;

use tm_common::embedding::EmbeddingError;
use tm_common::matching::{MatchError, PipelineConfigError, RankingError};

tokio::task_local! {
    static REQUEST_ID: String;
}

fn sanitize_message(message: &str) -> String {
    const MAX_LEN: usize = 240;

    let mut cleaned = message
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .replace(['\n', '\r'], " ");

    cleaned = cleaned
        .split_whitespace()
        .map(|token| {
            if token.contains("://") {
                "[redacted-url]".to_string()
            } else if let Some((base, _)) = token.split_once('?') {
                if base.is_empty() {
                    "[redacted-query]".to_string()
                } else {
                    format!("{base}?[redacted]")
                }
            } else if token.starts_with('/') || token.contains('\\') {
                "[redacted-path]".to_string()
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if cleaned.len() > MAX_LEN {
        let mut cut = MAX_LEN;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
        cleaned.push_str("...");
    }

    if cleaned.trim().is_empty() {
        "unexpected error".to_string()
    } else {
        cleaned
    }
}

pub async fn with_request_id<Fut, T>(request_id: Option<String>, fut: Fut) -> T
where
    Fut: Future<Output = T>,
{
    if let Some(request_id) = request_id {
        REQUEST_ID.scope(request_id, fut).await
    } else {
        fut.await
    }
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|value| value.clone()).ok()
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("too many requests: {0}")]
    TooManyRequests(String),
    /// 埋め込みプロバイダ起因の失敗
    #[error("upstream error ({code}): {message}")]
    BadGateway { code: &'static str, message: String },
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal server error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
    request_id: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let code = self.code();
        let request_id = current_request_id();

        error!(
            code,
            status = %status,
            request_id = request_id.as_deref().unwrap_or(""),
            error = %self,
            "api_error"
        );

        let body = Json(ErrorResponse {
            code,
            message: self.public_message().into_owned(),
            request_id,
        });

        (status, body).into_response()
    }
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::TooManyRequests(_) => "too_many_requests",
            ApiError::BadGateway { code, .. } => *code,
            ApiError::ServiceUnavailable(_) => "service_unavailable",
            ApiError::Config(_) | ApiError::Internal(_) => "internal_error",
        }
    }

    fn public_message(&self) -> Cow<'static, str> {
        match self {
            ApiError::BadRequest(msg) => Cow::Owned(sanitize_message(msg)),
            ApiError::Unauthorized(_) => Cow::Borrowed("unauthorized"),
            ApiError::TooManyRequests(_) => Cow::Borrowed("too many requests"),
            ApiError::BadGateway { message, .. } => Cow::Owned(sanitize_message(message)),
            ApiError::ServiceUnavailable(_) => Cow::Borrowed("service unavailable"),
            ApiError::Config(_) | ApiError::Internal(_) => Cow::Borrowed("internal server error"),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Config(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MatchError> for ApiError {
    fn from(value: MatchError) -> Self {
        match value {
            MatchError::InvalidReference(err) => ApiError::BadRequest(format!("student: {err}")),
            MatchError::InvalidCandidate { index, source } => {
                ApiError::BadRequest(format!("tutors[{index}]: {source}"))
            }
            MatchError::TooManyCandidates { count, max } => {
                ApiError::BadRequest(format!("too many tutors: {count} (max {max})"))
            }
            MatchError::Embedding(err) => ApiError::from(err),
            MatchError::Ranking(err @ RankingError::DimensionMismatch { .. }) => {
                ApiError::BadGateway {
                    code: "dimension_mismatch",
                    message: err.to_string(),
                }
            }
            MatchError::Ranking(err @ RankingError::ZeroReference) => ApiError::BadGateway {
                code: "undefined_similarity",
                message: err.to_string(),
            },
        }
    }
}

impl From<EmbeddingError> for ApiError {
    fn from(value: EmbeddingError) -> Self {
        // プロバイダのエラーボディは返さない
        let message = match &value {
            EmbeddingError::Status { status, .. } => {
                format!("embedding service returned status {status}")
            }
            EmbeddingError::Timeout(_) => "embedding service timed out".to_string(),
            EmbeddingError::Request(_) => "embedding service unreachable".to_string(),
            EmbeddingError::Malformed(_) => "embedding service returned malformed data".to_string(),
            EmbeddingError::Credential(_) | EmbeddingError::Config(_) => {
                "embedding service credentials unavailable".to_string()
            }
        };
        tracing::warn!(error = %value, "embedding service error");
        ApiError::BadGateway {
            code: "embedding_service_error",
            message,
        }
    }
}

impl From<PipelineConfigError> for ApiError {
    fn from(value: PipelineConfigError) -> Self {
        ApiError::Config(value.to_string())
    }
}
