// handlers.rs
use std::net::SocketAddr;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        ConnectInfo, FromRequestParts, Path, State,
    },
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult, VoteError};
use crate::models::{NewPoll, PollDetail, PollResults, VoteReceipt, VoteRequest, VoterId};
use crate::state::AppState;

/// Client address: first hop of `X-Forwarded-For`, else the TCP peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    match forwarded {
        Some(ip) => Some(ip.to_string()),
        None => peer.map(|addr| addr.ip().to_string()),
    }
}

impl<S> FromRequestParts<S> for VoterId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        client_ip(&parts.headers, peer)
            .map(VoterId::new)
            .ok_or_else(|| AppError::BadRequest("Unable to determine client address".to_string()))
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn list_polls(State(state): State<AppState>) -> AppResult<Json<Vec<PollDetail>>> {
    Ok(Json(state.polls.list_polls().await?))
}

pub async fn create_poll(
    State(state): State<AppState>,
    creator: VoterId,
    payload: Result<Json<NewPoll>, JsonRejection>,
) -> AppResult<(StatusCode, Json<PollDetail>)> {
    let Json(payload) = payload?;
    let detail = state.polls.create_poll(&creator, payload).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn get_poll(
    State(state): State<AppState>,
    poll_id: Result<Path<Uuid>, PathRejection>,
) -> AppResult<Json<PollDetail>> {
    let Path(poll_id) = poll_id?;
    Ok(Json(state.polls.get_poll(poll_id).await?))
}

pub async fn delete_poll(
    State(state): State<AppState>,
    poll_id: Result<Path<Uuid>, PathRejection>,
    requester: VoterId,
) -> AppResult<StatusCode> {
    let Path(poll_id) = poll_id?;
    state.polls.delete_poll(&requester, poll_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Vote on a poll option
pub async fn vote(
    State(state): State<AppState>,
    poll_id: Result<Path<Uuid>, PathRejection>,
    voter: VoterId,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> AppResult<Json<VoteReceipt>> {
    let Path(poll_id) = poll_id?;
    let Json(payload) = payload?;

    let receipt = state
        .engine
        .cast_vote(poll_id, payload.option_id, &voter)
        .await?;

    Ok(Json(receipt))
}

pub async fn get_results(
    State(state): State<AppState>,
    poll_id: Result<Path<Uuid>, PathRejection>,
) -> AppResult<Json<PollResults>> {
    let Path(poll_id) = poll_id?;
    match state.results.get_results(poll_id).await {
        Ok(results) => Ok(Json(results)),
        Err(VoteError::PollUnavailable) => Err(AppError::PollNotFound),
        Err(e) => Err(e.into()),
    }
}

pub async fn check_vote(
    State(state): State<AppState>,
    poll_id: Result<Path<Uuid>, PathRejection>,
    voter: VoterId,
) -> AppResult<Json<Value>> {
    let Path(poll_id) = poll_id?;
    let voted = state.polls.has_voted(poll_id, &voter).await?;
    Ok(Json(json!({ "voted": voted })))
}
