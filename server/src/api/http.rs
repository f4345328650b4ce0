use axum::{
    extract::{Path, Query, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

use updraft_types::{validate_bet_amount, validate_user_id, SessionInput, ValidationError};

use crate::now_ms;
use crate::rounds::ConfigPatch;
use crate::store::StoreError;
use crate::App;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const DEFAULT_LEADERBOARD_LIMIT: usize = 100;
const MAX_QUERY_LIMIT: usize = 500;

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Success envelope: `success`, `timestamp`, plus the handler's fields.
fn ok(payload: Value) -> Response {
    let mut body = serde_json::Map::new();
    body.insert("success".to_string(), Value::Bool(true));
    body.insert("timestamp".to_string(), Value::String(timestamp()));
    if let Value::Object(map) = payload {
        body.extend(map);
    }
    Json(Value::Object(body)).into_response()
}

#[derive(Debug)]
pub(super) enum ApiError {
    Validation(ValidationError),
    NotFound(&'static str),
    AlreadyClaimed,
    Forbidden,
    Storage(StoreError),
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::Validation(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("resource"),
            StoreError::AlreadyClaimed => ApiError::AlreadyClaimed,
            StoreError::Forbidden => ApiError::Forbidden,
            other => ApiError::Storage(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            ApiError::Validation(err) => (
                StatusCode::BAD_REQUEST,
                err.to_string(),
                Some(json!({"field": err.field, "message": err.message})),
            ),
            ApiError::NotFound(what) => {
                (StatusCode::NOT_FOUND, format!("{what} not found"), None)
            }
            ApiError::AlreadyClaimed => (
                StatusCode::BAD_REQUEST,
                "prize already claimed".to_string(),
                None,
            ),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden".to_string(), None),
            ApiError::Storage(err) => {
                // Internal details go to the log, not the client.
                tracing::error!("Storage error surfaced to client: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage unavailable".to_string(),
                    None,
                )
            }
        };
        let mut body = serde_json::Map::new();
        body.insert("success".to_string(), Value::Bool(false));
        body.insert("error".to_string(), Value::String(error));
        body.insert("timestamp".to_string(), Value::String(timestamp()));
        if let Some(details) = details {
            body.insert("details".to_string(), details);
        }
        (status, Json(Value::Object(body))).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

#[derive(Deserialize)]
pub(super) struct LimitQuery {
    limit: Option<usize>,
}

fn clamp_limit(limit: Option<usize>, default: usize) -> usize {
    limit.unwrap_or(default).clamp(1, MAX_QUERY_LIMIT)
}

pub(super) async fn health(AxumState(app): AxumState<Arc<App>>) -> Response {
    ok(json!({ "uptimeMs": app.uptime_ms() }))
}

pub(super) async fn multiplier_config(AxumState(app): AxumState<Arc<App>>) -> Response {
    ok(json!({ "config": app.generator().config() }))
}

pub(super) async fn crash_multiplier(AxumState(app): AxumState<Arc<App>>) -> Response {
    ok(json!({ "crashMultiplier": app.generator().draw() }))
}

pub(super) async fn countdown(AxumState(app): AxumState<Arc<App>>) -> Response {
    let start = Instant::now();
    let snapshot = app.rounds().snapshot();
    let config = app.rounds().config_snapshot();
    let response = ok(json!({
        "countdown": snapshot,
        "bettingCountdown": config.betting_countdown_ms,
        "gameCountdown": config.game_countdown_ms,
        "fixedCrashMultiplier": config.fixed_crash_multiplier,
        "autoStart": config.auto_start,
    }));
    app.http_metrics().record_countdown(start.elapsed());
    response
}

pub(super) async fn countdown_config(AxumState(app): AxumState<Arc<App>>) -> Response {
    ok(json!({ "config": app.rounds().config_snapshot() }))
}

pub(super) async fn update_countdown_config(
    AxumState(app): AxumState<Arc<App>>,
    Json(patch): Json<ConfigPatch>,
) -> ApiResult {
    let updated = app.rounds().update_config(patch)?;
    Ok(ok(json!({ "config": updated })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct OverrideBody {
    user_id: String,
    bet_amount: Option<u64>,
    multiplier: Option<f64>,
}

pub(super) async fn set_override(
    AxumState(app): AxumState<Arc<App>>,
    Json(body): Json<OverrideBody>,
) -> ApiResult {
    validate_user_id(&body.user_id)?;
    let record = app
        .overrides()
        .set(&body.user_id, body.bet_amount, body.multiplier, now_ms());
    Ok(ok(json!({ "override": record })))
}

pub(super) async fn consume_override(
    AxumState(app): AxumState<Arc<App>>,
    Path((user_id, bet_amount)): Path<(String, u64)>,
) -> ApiResult {
    validate_user_id(&user_id)?;
    validate_bet_amount(bet_amount)?;
    match app.overrides().consume_if_match(&user_id, bet_amount) {
        Some(multiplier) => {
            app.core_metrics().inc_override_consumed();
            tracing::info!(user_id = %user_id, bet_amount, multiplier, "Override consumed");
            Ok(ok(json!({
                "crashMultiplier": multiplier,
                "isUserCustom": true,
            })))
        }
        None => Ok(ok(json!({
            "crashMultiplier": app.generator().draw(),
            "isUserCustom": false,
        }))),
    }
}

pub(super) async fn game_stats(AxumState(app): AxumState<Arc<App>>) -> Response {
    ok(json!({
        "global": app.cache().get_global_stats(),
        "core": app.core_metrics_snapshot(),
        "http": app.http_metrics().snapshot(),
        "process": app.process_usage(),
    }))
}

pub(super) async fn game_history(
    AxumState(app): AxumState<Arc<App>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = clamp_limit(query.limit, DEFAULT_HISTORY_LIMIT);
    ok(json!({ "crashes": app.cache().get_recent_crashes(limit) }))
}

pub(super) async fn cache_status(AxumState(app): AxumState<Arc<App>>) -> Response {
    ok(json!({ "cache": app.cache().cache_status() }))
}

pub(super) async fn app_config(AxumState(app): AxumState<Arc<App>>) -> Response {
    ok(json!({
        "config": app.config,
        "countdown": app.rounds().config_snapshot(),
        "multiplierBands": app.generator().config().bands.len(),
    }))
}

pub(super) async fn get_user(
    AxumState(app): AxumState<Arc<App>>,
    Path(user_id): Path<String>,
) -> ApiResult {
    validate_user_id(&user_id)?;
    let user = app.store().find_or_create_user(&user_id, now_ms()).await?;
    Ok(ok(json!({ "user": user })))
}

pub(super) async fn delete_user(
    AxumState(app): AxumState<Arc<App>>,
    Path(user_id): Path<String>,
) -> ApiResult {
    validate_user_id(&user_id)?;
    match app.store().soft_delete_user(&user_id, now_ms()).await {
        Ok(()) => Ok(ok(json!({ "deleted": true }))),
        Err(StoreError::NotFound) => Err(ApiError::NotFound("user")),
        Err(err) => Err(err.into()),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RecordSessionBody {
    bet_amount: u64,
    crash_multiplier: f64,
    cash_out_multiplier: f64,
    win_amount: f64,
    game_start_time: Option<u64>,
    game_end_time: Option<u64>,
    #[serde(default)]
    is_free_mode: bool,
}

pub(super) async fn record_session(
    AxumState(app): AxumState<Arc<App>>,
    Path(user_id): Path<String>,
    Json(body): Json<RecordSessionBody>,
) -> ApiResult {
    let start = Instant::now();
    let now = now_ms();
    let input = SessionInput {
        user_id,
        bet_amount: body.bet_amount,
        crash_multiplier: body.crash_multiplier,
        cash_out_multiplier: body.cash_out_multiplier,
        win_amount: body.win_amount,
        game_start_time: body.game_start_time.unwrap_or(now),
        game_end_time: body.game_end_time.unwrap_or(now),
        is_free_mode: body.is_free_mode,
    };
    input.validate()?;

    let mut user = app.store().find_or_create_user(&input.user_id, now).await?;
    user.record_flight(
        input.is_win(),
        input.bet_amount,
        input.win_amount,
        input.cash_out_multiplier,
    );
    if !input.is_free_mode {
        user.debit_saturating(input.bet_amount);
        user.credit(input.win_amount.floor() as u64);
    }
    user.updated_at = now;
    app.store().upsert_user(user.clone()).await?;

    let session = app.cache().add_session(input);
    if session.is_none() {
        tracing::warn!(user_id = %user.user_id, "Session recorded outside any race");
    }

    let response = ok(json!({
        "user": user,
        "session": session,
        "raceActive": app.cache().current_race_id().is_some(),
    }));
    app.http_metrics().record_session(start.elapsed());
    Ok(response)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UserSettingsBody {
    auto_cash_out: Option<Value>,
}

pub(super) async fn update_user_settings(
    AxumState(app): AxumState<Arc<App>>,
    Path(user_id): Path<String>,
    Json(body): Json<UserSettingsBody>,
) -> ApiResult {
    validate_user_id(&user_id)?;
    let now = now_ms();
    let mut user = app.store().find_or_create_user(&user_id, now).await?;
    if let Some(auto_cash_out) = body.auto_cash_out {
        // Opaque preference blob; stored verbatim.
        user.auto_cash_out = auto_cash_out;
    }
    user.updated_at = now;
    app.store().upsert_user(user.clone()).await?;
    Ok(ok(json!({ "user": user })))
}

pub(super) async fn user_history(
    AxumState(app): AxumState<Arc<App>>,
    Path(user_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    validate_user_id(&user_id)?;
    let limit = clamp_limit(query.limit, DEFAULT_HISTORY_LIMIT);
    let sessions = app.cache().get_user_sessions(&user_id, None, limit);
    Ok(ok(json!({ "sessions": sessions })))
}

pub(super) async fn user_leaderboard(
    AxumState(app): AxumState<Arc<App>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let limit = clamp_limit(query.limit, DEFAULT_LEADERBOARD_LIMIT);
    let users = app.store().find_top_users(limit).await?;
    Ok(ok(json!({ "users": users })))
}

pub(super) async fn current_race(AxumState(app): AxumState<Arc<App>>) -> Response {
    match app.races().current_race() {
        Some(race) => {
            let pool = app.cache().prize_pool(&race.race_id);
            ok(json!({ "race": race, "prizePool": pool }))
        }
        None => ok(json!({ "race": Value::Null, "prizePool": Value::Null })),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LeaderboardQuery {
    limit: Option<usize>,
    user_id: Option<String>,
}

pub(super) async fn race_leaderboard(
    AxumState(app): AxumState<Arc<App>>,
    Path(race_id): Path<String>,
    Query(query): Query<LeaderboardQuery>,
) -> ApiResult {
    let start = Instant::now();
    let limit = clamp_limit(query.limit, DEFAULT_LEADERBOARD_LIMIT);

    let response = if let Some(user_id) = query.user_id {
        validate_user_id(&user_id)?;
        match app
            .cache()
            .get_race_leaderboard_with_user(&race_id, &user_id, limit)
        {
            Some(view) => ok(json!({
                "raceId": race_id,
                "leaderboard": view.top,
                "user": view.user,
                "userRank": view.user_rank,
                "displayRank": view.display_rank,
            })),
            None => return Err(ApiError::NotFound("race")),
        }
    } else {
        match app.cache().get_race_leaderboard(&race_id, limit) {
            Some(leaderboard) => ok(json!({ "raceId": race_id, "leaderboard": leaderboard })),
            None => {
                // Evicted from cache; serve the persisted projection.
                let mut rows = app.store().find_participants(&race_id).await?;
                if rows.is_empty() {
                    return Err(ApiError::NotFound("race"));
                }
                for (idx, row) in rows.iter_mut().enumerate() {
                    row.rank = idx as u32 + 1;
                }
                rows.truncate(limit);
                ok(json!({ "raceId": race_id, "leaderboard": rows }))
            }
        }
    };
    app.http_metrics().record_leaderboard(start.elapsed());
    Ok(response)
}

pub(super) async fn race_user_data(
    AxumState(app): AxumState<Arc<App>>,
    Path((race_id, user_id)): Path<(String, String)>,
) -> ApiResult {
    validate_user_id(&user_id)?;
    match app.cache().get_user_race_data(&race_id, &user_id) {
        Some(data) => Ok(ok(json!({
            "raceId": race_id,
            "user": data.participant,
            "rank": data.rank,
        }))),
        None => Err(ApiError::NotFound("race participant")),
    }
}

pub(super) async fn race_history(
    AxumState(app): AxumState<Arc<App>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    let limit = clamp_limit(query.limit, 20);
    let races = app.store().find_race_history(limit).await?;
    Ok(ok(json!({ "races": races })))
}

pub(super) async fn race_stats(AxumState(app): AxumState<Arc<App>>) -> ApiResult {
    let stats = app.store().race_stats().await?;
    let current = app.races().current_race();
    let pool = current
        .as_ref()
        .and_then(|race| app.cache().prize_pool(&race.race_id));
    Ok(ok(json!({
        "stats": stats,
        "currentRace": current,
        "currentPool": pool,
    })))
}

pub(super) async fn user_pending_prizes(
    AxumState(app): AxumState<Arc<App>>,
    Path(user_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    validate_user_id(&user_id)?;
    let limit = clamp_limit(query.limit, DEFAULT_HISTORY_LIMIT);
    let prizes = app.store().find_user_pending_prizes(&user_id, limit).await?;
    Ok(ok(json!({ "prizes": prizes })))
}

pub(super) async fn user_prize_history(
    AxumState(app): AxumState<Arc<App>>,
    Path(user_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult {
    validate_user_id(&user_id)?;
    let limit = clamp_limit(query.limit, DEFAULT_LEADERBOARD_LIMIT);
    let prizes = app.store().find_user_prize_history(&user_id, limit).await?;
    Ok(ok(json!({ "prizes": prizes })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ClaimBody {
    user_id: String,
}

pub(super) async fn claim_prize(
    AxumState(app): AxumState<Arc<App>>,
    Path(prize_id): Path<String>,
    Json(body): Json<ClaimBody>,
) -> ApiResult {
    let start = Instant::now();
    validate_user_id(&body.user_id)?;
    let prize = match app
        .store()
        .claim_prize(&prize_id, &body.user_id, now_ms())
        .await
    {
        Ok(prize) => prize,
        Err(StoreError::NotFound) => return Err(ApiError::NotFound("prize")),
        Err(err) => return Err(err.into()),
    };
    app.core_metrics().inc_prize_claimed();
    let response = ok(json!({ "prize": prize }));
    app.http_metrics().record_claim(start.elapsed());
    Ok(response)
}

pub(super) async fn prizes_by_race(
    AxumState(app): AxumState<Arc<App>>,
    Path(race_id): Path<String>,
) -> ApiResult {
    let prizes = app.store().find_prizes_by_race(&race_id).await?;
    Ok(ok(json!({ "prizes": prizes })))
}
