use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiError;
use crate::models::{Channel, EpgEvent, Recording, Timer};
use crate::vdr::{SearchOptions, TimerStatus};
use crate::AppState;

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// GET /api/channels
pub async fn channels(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Channel>>, ApiError> {
    Ok(Json(state.vdr.channels().await?))
}

#[derive(Serialize)]
pub struct CurrentChannelResponse {
    pub channel: String,
}

/// GET /api/channels/current
pub async fn current_channel(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CurrentChannelResponse>, ApiError> {
    let channel = state.vdr.current_channel().await?;
    Ok(Json(CurrentChannelResponse { channel }))
}

#[derive(Deserialize)]
pub struct SetChannelRequest {
    pub channel: String,
}

/// POST /api/channels/current
pub async fn set_channel(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetChannelRequest>,
) -> Result<Json<CurrentChannelResponse>, ApiError> {
    let channel = state.vdr.set_channel(&request.channel).await?;
    Ok(Json(CurrentChannelResponse { channel }))
}

// ---------------------------------------------------------------------------
// EPG
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct EpgQuery {
    #[serde(default)]
    pub channel: Option<String>,
    /// Unix seconds; zero or absent means the whole schedule.
    #[serde(default)]
    pub at: Option<i64>,
}

/// GET /api/epg
pub async fn epg(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EpgQuery>,
) -> Result<Json<Vec<EpgEvent>>, ApiError> {
    let events = state.vdr.epg(query.channel.as_deref(), query.at).await?;
    Ok(Json(events))
}

/// GET /api/epg/now
pub async fn epg_now(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<EpgEvent>>, ApiError> {
    Ok(Json(state.vdr.current_programs().await?))
}

/// POST /api/epg/search
pub async fn epg_search(
    State(state): State<Arc<AppState>>,
    Json(options): Json<SearchOptions>,
) -> Result<Json<Vec<EpgEvent>>, ApiError> {
    Ok(Json(state.vdr.search(&options).await?))
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// GET /api/timers — every timer, annotated with its overlap class.
pub async fn timers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TimerStatus>>, ApiError> {
    Ok(Json(state.vdr.timers_with_overlap().await?))
}

/// POST /api/timers
pub async fn create_timer(
    State(state): State<Arc<AppState>>,
    Json(timer): Json<Timer>,
) -> Result<Json<Timer>, ApiError> {
    timer.validate().map_err(ApiError::bad_request)?;
    state.vdr.create_timer(&timer).await?;
    Ok(Json(timer))
}

/// PUT /api/timers/:id
pub async fn update_timer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
    Json(mut timer): Json<Timer>,
) -> Result<Json<Timer>, ApiError> {
    timer.id = id;
    timer.validate().map_err(ApiError::bad_request)?;
    state.vdr.update_timer(&timer).await?;
    Ok(Json(timer))
}

#[derive(Serialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

/// DELETE /api/timers/:id
pub async fn delete_timer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> Result<Json<DeletedResponse>, ApiError> {
    state.vdr.delete_timer(id).await?;
    Ok(Json(DeletedResponse { deleted: true }))
}

#[derive(Serialize)]
pub struct ToggleResponse {
    pub active: bool,
}

/// POST /api/timers/:id/toggle
pub async fn toggle_timer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> Result<Json<ToggleResponse>, ApiError> {
    let active = state.vdr.toggle_timer(id).await?;
    Ok(Json(ToggleResponse { active }))
}

#[derive(Deserialize)]
pub struct TimerFromEventRequest {
    pub event: u32,
    #[serde(default)]
    pub channel: Option<String>,
}

/// POST /api/timers/from-event — create a timer for an EPG event with
/// the configured recording margins applied.
pub async fn timer_from_event(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TimerFromEventRequest>,
) -> Result<Json<Timer>, ApiError> {
    let timer = state
        .vdr
        .create_timer_from_event(request.event, request.channel.as_deref())
        .await?;
    Ok(Json(timer))
}

// ---------------------------------------------------------------------------
// Recordings
// ---------------------------------------------------------------------------

/// GET /api/recordings
pub async fn recordings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Recording>>, ApiError> {
    Ok(Json(state.vdr.recordings().await?))
}

/// DELETE /api/recordings/:id
pub async fn delete_recording(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u32>,
) -> Result<Json<DeletedResponse>, ApiError> {
    state.vdr.delete_recording(id).await?;
    Ok(Json(DeletedResponse { deleted: true }))
}

// ---------------------------------------------------------------------------
// Remote control & cache
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct SentResponse {
    pub sent: bool,
}

/// POST /api/remote/:key
pub async fn remote_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<SentResponse>, ApiError> {
    state.vdr.send_key(&key).await?;
    Ok(Json(SentResponse { sent: true }))
}

#[derive(Serialize)]
pub struct InvalidatedResponse {
    pub invalidated: bool,
}

/// POST /api/cache/invalidate — the UI's refresh button.
pub async fn invalidate_cache(State(state): State<Arc<AppState>>) -> Json<InvalidatedResponse> {
    state.vdr.invalidate_caches();
    Json(InvalidatedResponse { invalidated: true })
}
