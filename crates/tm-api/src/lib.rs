use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    Router,
    body::Body,
    extract::DefaultBodyLimit,
    http::Method,
    http::Request,
    http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue},
    middleware,
    middleware::Next,
    response::Response,
    routing::{get, post},
};
use clap::Parser;
use dotenvy::dotenv;
use tm_common::embedding::{HashEmbedder, create_embedder, load_config_from_env};
use tm_common::matching::{MatchingPipeline, PipelineConfig};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;

pub mod auth;
pub mod error;
pub mod handlers;
pub mod rate_limit;

use auth::{AuthConfig, AuthMode, JwtAlgorithm};
use error::ApiError;
use handlers::{health, matches};
use rate_limit::{RateLimitConfig, RateLimits};
use tm_common::logging::{init_tracing_subscriber, install_tracing_panic_hook};

const SHUTDOWN_DRAIN_GRACE: std::time::Duration = std::time::Duration::from_millis(200);

#[derive(Debug, Clone, Parser)]
#[command(name = "tm-api", about = "HTTP API for tutor matching")]
struct Cli {
    /// Server port
    #[arg(long, env = "PORT", default_value_t = 3007)]
    port: u16,

    /// API key for X-API-Key authentication
    #[arg(long, env = "TM_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Authentication mode: api_key | jwt | none
    #[arg(long, env = "AUTH_MODE", default_value = "api_key", value_enum)]
    auth_mode: AuthMode,

    /// JWT secret for AUTH_MODE=jwt
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// JWT algorithm (HMAC family only)
    #[arg(long, env = "JWT_ALGORITHM", default_value = "hs256", value_enum)]
    jwt_algorithm: JwtAlgorithm,

    /// Comma separated list of allowed CORS origins
    #[arg(long, env = "TM_CORS_ORIGINS", default_value = "http://localhost:8080")]
    cors_origins: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub auth: AuthConfig,
}

impl AppConfig {
    fn from_cli(cli: Cli) -> Result<Self, ApiError> {
        let cors_origins = cli
            .cors_origins
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect::<Vec<_>>();

        if cors_origins.iter().any(|origin| origin == "*") {
            return Err(ApiError::Config(
                "TM_CORS_ORIGINS must list explicit origins when credentials are enabled".into(),
            ));
        }

        let auth = AuthConfig {
            mode: cli.auth_mode,
            api_key: cli.api_key,
            jwt_secret: cli.jwt_secret,
            jwt_algorithm: cli.jwt_algorithm,
        };
        auth.validate()?;

        Ok(Self {
            port: cli.port,
            cors_origins,
            auth,
        })
    }

    pub fn for_tests(auth: AuthConfig) -> Self {
        Self {
            port: 3007,
            cors_origins: vec!["http://localhost:8080".into()],
            auth,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<MatchingPipeline>,
    pub config: AppConfig,
    pub(crate) rate_limits: RateLimits,
    /// シャットダウン開始で false（/readyz が 503 を返す）
    pub readiness: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(pipeline: MatchingPipeline, config: AppConfig, limits: &RateLimitConfig) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            config,
            rate_limits: RateLimits::new(limits),
            readiness: Arc::new(AtomicBool::new(true)),
        }
    }
}

pub type SharedState = Arc<AppState>;

impl axum::extract::FromRef<SharedState> for AuthConfig {
    fn from_ref(input: &SharedState) -> AuthConfig {
        input.config.auth.clone()
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed = origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static("x-api-key"),
        ])
        .allow_credentials(true)
}

async fn attach_request_id_context(req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());

    Ok(error::with_request_id(request_id, next.run(req)).await)
}

pub fn create_router(state: SharedState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    let request_id_header = HeaderName::from_static("x-request-id");
    let trace_header = request_id_header.clone();

    let trace = TraceLayer::new_for_http().make_span_with(move |request: &Request<Body>| {
        let request_id = request
            .headers()
            .get(&trace_header)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");

        tracing::info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
            status = tracing::field::Empty,
        )
    });

    let api_routes = Router::new().route(
        "/match-tutors",
        post(matches::match_tutors).route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::matching,
        )),
    );

    Router::new()
        .route("/health", get(health::readyz))
        .route("/livez", get(health::livez))
        .route("/readyz", get(health::readyz))
        .nest("/api", api_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::global,
        ))
        .layer(middleware::from_fn(attach_request_id_context))
        .layer(DefaultBodyLimit::max(256 * 1024))
        .layer(trace)
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(
            request_id_header,
            MakeRequestUuid::default(),
        ))
        .layer(cors)
        .with_state(state)
}

/// オフラインの HashEmbedder で組んだテスト用 state（レート制限は既定値）
pub fn test_state(api_key: &str) -> SharedState {
    let embedder = Arc::new(HashEmbedder::new(1024));
    test_state_with_pipeline(
        api_key,
        MatchingPipeline::new(embedder, PipelineConfig::default()),
    )
}

pub fn test_state_with_pipeline(api_key: &str, pipeline: MatchingPipeline) -> SharedState {
    let config = AppConfig::for_tests(AuthConfig::api_key(api_key));
    Arc::new(AppState::new(pipeline, config, &RateLimitConfig::default()))
}


pub async fn run() -> Result<(), ApiError> {
    dotenv().ok();
    init_tracing_subscriber(env!("CARGO_PKG_NAME"));
    install_tracing_panic_hook(env!("CARGO_PKG_NAME"));

    let cli = Cli::parse();
    let config = AppConfig::from_cli(cli)?;

    let pipeline_config = PipelineConfig::from_env();
    pipeline_config.validate()?;
    let embedding_config = load_config_from_env();
    let embedder = create_embedder(&embedding_config)
        .map_err(|err| ApiError::Config(format!("failed to create embedder: {err}")))?;

    info!(
        embedder = embedder.name(),
        model = embedder.model(),
        top_k = pipeline_config.top_k,
        max_concurrency = pipeline_config.max_concurrency,
        "embedder configured"
    );

    let state = Arc::new(AppState::new(
        MatchingPipeline::new(embedder, pipeline_config),
        config.clone(),
        &RateLimitConfig::from_env(),
    ));

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let app = create_router(state.clone());

    info!(%addr, auth_mode = ?config.auth.mode, "tm-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    Ok(())
}

async fn shutdown_signal(state: SharedState) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            let _ = sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    state.readiness.store(false, Ordering::SeqCst);

    // ロードバランサが /readyz の 503 を観測できるよう少し待つ
    tokio::time::sleep(SHUTDOWN_DRAIN_GRACE).await;
}
