//! Bearer-token credentials for outbound provider calls.
//!
//! A [`Credentials`] value is built once at startup and handed to the
//! embedder. It owns a [`TokenSource`] and caches the last [`AccessToken`];
//! [`Credentials::bearer`] refreshes the cache when the token is missing or
//! about to expire. There is no process-global token state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// 期限切れ判定の余裕（期限直前のトークンは使わない）
const EXPIRY_SKEW_SECS: i64 = 30;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential is not configured: {0}")]
    Missing(String),
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token endpoint returned {status}")]
    Status { status: u16 },
    #[error("token endpoint returned malformed response: {0}")]
    Malformed(String),
}

#[derive(Clone)]
pub struct AccessToken {
    secret: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + chrono::Duration::seconds(EXPIRY_SKEW_SECS) >= expires_at,
            None => false,
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// トークンの取得元
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// ログ用の名前（"static", "oauth"）
    fn name(&self) -> &'static str;

    async fn fetch_token(&self) -> Result<AccessToken, CredentialError>;
}

/// 期限なしの固定トークン（Hugging Face の API トークンなど）
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Result<Self, CredentialError> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(CredentialError::Missing("empty bearer token".into()));
        }
        Ok(Self { token })
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn fetch_token(&self) -> Result<AccessToken, CredentialError> {
        Ok(AccessToken::new(self.token.clone(), None))
    }
}

/// OAuth2 client-credentials grant（Basic 認証でトークンを交換する）
pub struct OAuthClientCredentials {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl OAuthClientCredentials {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CredentialError> {
        let token_url = token_url.into();
        let client_id = client_id.into();
        let client_secret = client_secret.into();

        if token_url.trim().is_empty() {
            return Err(CredentialError::Missing("token url".into()));
        }
        if client_id.trim().is_empty() || client_secret.trim().is_empty() {
            return Err(CredentialError::Missing("client id / secret".into()));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            token_url,
            client_id,
            client_secret,
        })
    }
}

#[async_trait]
impl TokenSource for OAuthClientCredentials {
    fn name(&self) -> &'static str {
        "oauth"
    }

    async fn fetch_token(&self) -> Result<AccessToken, CredentialError> {
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CredentialError::Status {
                status: status.as_u16(),
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| CredentialError::Malformed(err.to_string()))?;

        if body.access_token.trim().is_empty() {
            return Err(CredentialError::Malformed("empty access_token".into()));
        }

        let expires_at = body
            .expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        Ok(AccessToken::new(body.access_token, expires_at))
    }
}

/// Embedder が保持する認証情報
///
/// 同時に複数のリクエストが期限切れを検知しても、リフレッシュは 1 回だけ走る。
pub struct Credentials {
    source: Arc<dyn TokenSource>,
    cached: Mutex<Option<AccessToken>>,
}

impl Credentials {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    pub fn from_static(token: impl Into<String>) -> Result<Self, CredentialError> {
        Ok(Self::new(Arc::new(StaticToken::new(token)?)))
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// 有効なトークンを返す。キャッシュが無いか期限切れなら取り直す。
    pub async fn bearer(&self) -> Result<String, CredentialError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if !token.is_expired_at(Utc::now()) {
                return Ok(token.secret().to_string());
            }
            debug!(source = self.source.name(), "cached token expired; refreshing");
        }

        let token = self.source.fetch_token().await?;
        info!(
            source = self.source.name(),
            expires_at = ?token.expires_at(),
            "obtained provider token"
        );
        let secret = token.secret().to_string();
        *cached = Some(token);
        Ok(secret)
    }

    /// 401 を受けたときなど、次回の bearer() で必ず取り直させる
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("source", &self.source.name())
            .finish_non_exhaustive()
    }
}
