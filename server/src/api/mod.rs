use axum::{
    extract::{DefaultBodyLimit, Request, State as AxumState},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::App;

mod http;

pub struct Api {
    app: Arc<App>,
}

#[derive(Clone)]
struct OriginConfig {
    allowed_origins: Arc<HashSet<String>>,
    allow_any_origin: bool,
}

impl Api {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    pub fn router(&self) -> Router {
        let allowed_origins = parse_allowed_origins("ALLOWED_HTTP_ORIGINS");
        let allow_any_origin = allowed_origins.is_empty() || allowed_origins.contains("*");
        let cors_origins = allowed_origins
            .iter()
            .filter(|origin| *origin != "*")
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Invalid origin in ALLOWED_HTTP_ORIGINS: {}", origin);
                    None
                }
            })
            .collect::<Vec<_>>();
        let origin_config = OriginConfig {
            allowed_origins: Arc::new(allowed_origins),
            allow_any_origin,
        };

        let cors = if allow_any_origin {
            CorsLayer::new().allow_origin(AllowOrigin::any())
        } else {
            CorsLayer::new().allow_origin(AllowOrigin::list(cors_origins))
        }
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([header::HeaderName::from_static("x-request-id")]);

        // Environment variables override config.
        let rate_per_second = parse_env_u64("RATE_LIMIT_HTTP_PER_SEC")
            .or(self.app.config.http_rate_limit_per_second);
        let rate_burst =
            parse_env_u32("RATE_LIMIT_HTTP_BURST").or(self.app.config.http_rate_limit_burst);

        let governor_conf = match (rate_per_second, rate_burst) {
            (Some(rate_per_second), Some(burst_size)) if rate_per_second > 0 && burst_size > 0 => {
                let nanos_per_request = (1_000_000_000u64 / rate_per_second).max(1);
                let period = Duration::from_nanos(nanos_per_request);
                GovernorConfigBuilder::default()
                    .period(period)
                    .burst_size(burst_size)
                    .key_extractor(SmartIpKeyExtractor)
                    .finish()
                    .map(Arc::new)
            }
            _ => None,
        };

        let routes = Router::new()
            .route("/health", get(http::health))
            .route("/game/multiplier-config", get(http::multiplier_config))
            .route("/game/crash-multiplier", get(http::crash_multiplier))
            .route("/game/countdown", get(http::countdown))
            .route(
                "/game/countdown/config",
                get(http::countdown_config).put(http::update_countdown_config),
            )
            .route("/game/ai-settings", post(http::set_override))
            .route(
                "/game/ai-crash-multiplier/:user_id/:bet_amount",
                get(http::consume_override),
            )
            .route("/game/stats", get(http::game_stats))
            .route("/game/history", get(http::game_history))
            .route("/game/cache-status", get(http::cache_status))
            .route("/game/config", get(http::app_config))
            .route("/user/leaderboard", get(http::user_leaderboard))
            .route(
                "/user/:user_id",
                get(http::get_user).delete(http::delete_user),
            )
            .route("/user/:user_id/record", post(http::record_session))
            .route("/user/:user_id/settings", put(http::update_user_settings))
            .route("/user/:user_id/history", get(http::user_history))
            .route("/race/current", get(http::current_race))
            .route("/race/history", get(http::race_history))
            .route("/race/stats", get(http::race_stats))
            .route("/race/:race_id/leaderboard", get(http::race_leaderboard))
            .route(
                "/race/:race_id/raceuser/:user_id",
                get(http::race_user_data),
            )
            .route("/race/prizes/user/:user_id", get(http::user_pending_prizes))
            .route(
                "/race/prizes/user/:user_id/history",
                get(http::user_prize_history),
            )
            .route("/race/prizes/:prize_id/claim", post(http::claim_prize))
            .route("/race/prizes/race/:race_id", get(http::prizes_by_race));

        let router = Router::new().nest("/api", routes);

        let router = match governor_conf {
            Some(config) => router.layer(GovernorLayer { config }),
            None => router,
        };

        let router = router.layer(cors);
        let router = router.layer(middleware::from_fn(move |req, next| {
            let origin_config = origin_config.clone();
            async move { enforce_origin(origin_config, req, next).await }
        }));
        let router = match self.app.config.http_body_limit_bytes {
            Some(limit) if limit > 0 => router.layer(DefaultBodyLimit::max(limit)),
            _ => router,
        };
        let router = router.layer(middleware::from_fn_with_state(
            Arc::clone(&self.app),
            request_id_middleware,
        ));
        let router = router.layer(TraceLayer::new_for_http());

        router.with_state(Arc::clone(&self.app))
    }
}

fn parse_allowed_origins(var: &str) -> HashSet<String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn parse_env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

fn parse_env_u32(var: &str) -> Option<u32> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

/// Browser requests from unlisted origins are rejected; requests without an
/// Origin header (polling clients, curl) pass through.
async fn enforce_origin(config: OriginConfig, req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if let Some(origin) = origin {
        if !config.allow_any_origin && !config.allowed_origins.contains(origin) {
            return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
        }
    }
    next.run(req).await
}

async fn request_id_middleware(
    AxumState(app): AxumState<Arc<App>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get(header::HeaderName::from_static("x-request-id"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    match response.status() {
        StatusCode::FORBIDDEN => app.http_metrics().inc_reject_origin(),
        StatusCode::PAYLOAD_TOO_LARGE => app.http_metrics().inc_reject_body_limit(),
        StatusCode::TOO_MANY_REQUESTS => app.http_metrics().inc_reject_rate_limit(),
        _ => {}
    }
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(
            header::HeaderName::from_static("x-request-id"),
            header_value,
        );
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}
