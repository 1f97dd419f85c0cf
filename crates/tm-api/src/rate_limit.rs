use std::env;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{State, connect_info::ConnectInfo},
    http::Request,
    middleware::Next,
    response::Response,
};
use governor::{
    Quota, RateLimiter, clock::DefaultClock, middleware::NoOpMiddleware,
    state::keyed::DashMapStateStore,
};

use crate::SharedState;
use crate::error::ApiError;

type IpRateLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock, NoOpMiddleware>;

/// クライアント IP ごとのトークンバケット設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    pub per_sec: u64,
    pub burst: u32,
}

impl Rate {
    /// `{prefix}_PER_SEC` / `{prefix}_BURST` で上書き。0 や不正値は既定値のまま。
    fn from_env(prefix: &str, default: Rate) -> Self {
        fn positive<T: std::str::FromStr + PartialOrd + Default>(key: &str) -> Option<T> {
            env::var(key)
                .ok()
                .and_then(|value| value.trim().parse::<T>().ok())
                .filter(|value| *value > T::default())
        }

        Self {
            per_sec: positive(&format!("{prefix}_PER_SEC")).unwrap_or(default.per_sec),
            burst: positive(&format!("{prefix}_BURST")).unwrap_or(default.burst),
        }
    }

    fn limiter(self) -> Arc<IpRateLimiter> {
        let period = Duration::from_nanos((1_000_000_000 / self.per_sec.max(1)).max(1));
        let burst = NonZeroU32::new(self.burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);

        Arc::new(RateLimiter::keyed(quota))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// 全ルート共通
    pub global: Rate,
    /// /api/match-tutors（1 リクエストが tutors 件数分の埋め込み呼び出しになる）
    pub matching: Rate,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: Rate {
                per_sec: 20,
                burst: 40,
            },
            matching: Rate {
                per_sec: 2,
                burst: 5,
            },
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            global: Rate::from_env("TM_RATE_LIMIT_GLOBAL", defaults.global),
            matching: Rate::from_env("TM_RATE_LIMIT_MATCH", defaults.matching),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Global,
    Matching,
}

#[derive(Clone)]
pub struct RateLimits {
    global: Arc<IpRateLimiter>,
    matching: Arc<IpRateLimiter>,
}

impl RateLimits {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            global: config.global.limiter(),
            matching: config.matching.limiter(),
        }
    }

    /// ConnectInfo が無い（テストの oneshot など）場合は制限しない
    pub fn check(&self, scope: LimitScope, ip: Option<IpAddr>) -> Result<(), ApiError> {
        let Some(ip) = ip else {
            return Ok(());
        };
        let limiter = match scope {
            LimitScope::Global => &self.global,
            LimitScope::Matching => &self.matching,
        };

        limiter
            .check_key(&ip)
            .map_err(|_| ApiError::TooManyRequests(format!("{scope:?} rate limit exceeded")))
    }
}

fn request_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

pub(crate) async fn global(
    State(state): State<SharedState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    state
        .rate_limits
        .check(LimitScope::Global, request_ip(&req))?;
    Ok(next.run(req).await)
}

pub(crate) async fn matching(
    State(state): State<SharedState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    state
        .rate_limits
        .check(LimitScope::Matching, request_ip(&req))?;
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn match_scope_is_limited_independently() {
        let limits = RateLimits::new(&RateLimitConfig {
            global: Rate {
                per_sec: 1,
                burst: 10,
            },
            matching: Rate {
                per_sec: 1,
                burst: 2,
            },
        });
        let ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));

        assert!(limits.check(LimitScope::Matching, ip).is_ok());
        assert!(limits.check(LimitScope::Matching, ip).is_ok());
        assert!(matches!(
            limits.check(LimitScope::Matching, ip),
            Err(ApiError::TooManyRequests(_))
        ));
        assert!(limits.check(LimitScope::Global, ip).is_ok());
    }

    #[test]
    fn requests_without_peer_address_are_not_limited() {
        let limits = RateLimits::new(&RateLimitConfig {
            matching: Rate {
                per_sec: 1,
                burst: 1,
            },
            ..RateLimitConfig::default()
        });

        for _ in 0..5 {
            assert!(limits.check(LimitScope::Matching, None).is_ok());
        }
    }
}
