use std::time::Duration;

pub const DEFAULT_HF_ENDPOINT: &str =
    "https://api-inference.huggingface.co/pipeline/feature-extraction/sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// リクエストボディの形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFormat {
    /// 合成テキストをそのままボディに載せる
    Raw,
    /// `{"inputs": "<text>"}`
    Inputs,
}

impl RequestFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "raw" => Some(Self::Raw),
            "inputs" | "json" => Some(Self::Inputs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    /// 固定の bearer トークン
    Static,
    /// client-credentials でトークンを交換
    OAuth,
}

impl CredentialMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "static" | "token" => Some(Self::Static),
            "oauth" => Some(Self::OAuth),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct EmbeddingConfig {
    /// "huggingface" | "hash"
    pub embedder: String,
    pub endpoint: String,
    pub model: String,
    pub request_format: RequestFormat,
    /// 期待する次元数（None ならプロバイダ任せ。hash の場合は次元数そのもの）
    pub dimension: Option<usize>,
    /// HTTP クライアント自体のタイムアウト（呼び出し単位のタイムアウトは PipelineConfig 側）
    pub request_timeout: Duration,
    pub credential_mode: CredentialMode,
    pub api_token: Option<String>,
    pub oauth_token_url: Option<String>,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            embedder: "huggingface".into(),
            endpoint: DEFAULT_HF_ENDPOINT.into(),
            model: DEFAULT_MODEL.into(),
            request_format: RequestFormat::Raw,
            dimension: None,
            request_timeout: Duration::from_secs(30),
            credential_mode: CredentialMode::Static,
            api_token: None,
            oauth_token_url: None,
            oauth_client_id: None,
            oauth_client_secret: None,
        }
    }
}

impl std::fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("embedder", &self.embedder)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("request_format", &self.request_format)
            .field("dimension", &self.dimension)
            .field("request_timeout", &self.request_timeout)
            .field("credential_mode", &self.credential_mode)
            .field("api_token", &self.api_token.as_ref().map(|_| "[redacted]"))
            .field("oauth_token_url", &self.oauth_token_url)
            .field("oauth_client_id", &self.oauth_client_id)
            .finish_non_exhaustive()
    }
}

fn env_string(keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| std::env::var(key).ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// 環境変数から Embedder 設定を読み込み
pub fn load_config_from_env() -> EmbeddingConfig {
    let defaults = EmbeddingConfig::default();

    EmbeddingConfig {
        embedder: env_string(&["EMBEDDER"])
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or(defaults.embedder),
        endpoint: env_string(&["EMBEDDING_ENDPOINT"]).unwrap_or(defaults.endpoint),
        model: env_string(&["EMBEDDING_MODEL"]).unwrap_or(defaults.model),
        request_format: env_string(&["EMBEDDING_REQUEST_FORMAT"])
            .and_then(|s| RequestFormat::parse(&s))
            .unwrap_or(defaults.request_format),
        dimension: env_string(&["EMBEDDING_DIMENSION"])
            .and_then(|s| s.parse().ok())
            .filter(|dim: &usize| *dim > 0),
        request_timeout: env_string(&["EMBEDDING_REQUEST_TIMEOUT_MS"])
            .and_then(|s| s.parse().ok())
            .filter(|ms: &u64| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.request_timeout),
        credential_mode: env_string(&["EMBEDDING_AUTH"])
            .and_then(|s| CredentialMode::parse(&s))
            .unwrap_or(defaults.credential_mode),
        api_token: env_string(&["HF_API_TOKEN", "HUGGINGFACE_API_KEY", "HF_TOKEN"]),
        oauth_token_url: env_string(&["EMBEDDING_OAUTH_TOKEN_URL"]),
        oauth_client_id: env_string(&["EMBEDDING_OAUTH_CLIENT_ID"]),
        oauth_client_secret: env_string(&["EMBEDDING_OAUTH_CLIENT_SECRET"]),
    }
}
