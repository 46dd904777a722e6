use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    engine::{VoteOutcome, VoteRequest},
    error::AppError,
    models::{Feature, FeatureId, NewFeature, VoteEvent},
    state::AppState,
    utils::{IDEMPOTENCY_KEY_HEADER, VOTER_KEY_HEADER, parse_json, required_header},
};

#[derive(Deserialize, Default)]
pub struct CreateFeature {
    title: String,
    description: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct Page {
    offset: Option<usize>,
    limit: Option<usize>,
}

#[derive(Deserialize, Default)]
pub struct AddVotes {
    delta: Option<i64>,
    actor: Option<String>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Duplicate,
}

#[derive(Serialize)]
pub struct VoteResponse {
    votes: u64,
    outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    has_voted: Option<bool>,
}

impl From<VoteOutcome> for VoteResponse {
    fn from(outcome: VoteOutcome) -> Self {
        match outcome {
            VoteOutcome::Applied { votes, event_id } => Self {
                votes,
                outcome: Outcome::Applied,
                event_id: Some(event_id),
                has_voted: None,
            },
            VoteOutcome::Duplicate { votes } => Self {
                votes,
                outcome: Outcome::Duplicate,
                event_id: None,
                has_voted: None,
            },
        }
    }
}

#[derive(Serialize)]
pub struct VoterStatus {
    has_voted: bool,
}

#[derive(Serialize)]
pub struct RecountResponse {
    previous: u64,
    recounted: u64,
    drifted: bool,
}

pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<Feature>>, AppError> {
    let features: Vec<Feature> = state
        .engine
        .store()
        .list()
        .skip(page.offset.unwrap_or(0))
        .take(page.limit.unwrap_or(usize::MAX))
        .try_collect()
        .await?;

    Ok(Json(features))
}

pub async fn create_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let payload: CreateFeature = parse_json(&body)?;
    let feature = NewFeature::new(&payload.title, payload.description.as_deref())?;

    let feature = state.engine.store().create(feature).await?;

    info!("Created feature {} ({})", feature.id, feature.title);

    Ok((StatusCode::CREATED, Json(feature)))
}

pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<FeatureId>,
) -> Result<Json<Feature>, AppError> {
    Ok(Json(state.engine.store().get(id).await?))
}

pub async fn upvote_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<FeatureId>,
    headers: HeaderMap,
) -> Result<Json<VoteResponse>, AppError> {
    let voter_key = required_header(&headers, VOTER_KEY_HEADER)?;

    #[cfg(feature = "verbose")]
    info!("Upvote on {id} from {voter_key}");

    let outcome = state
        .engine
        .cast_vote(id, VoteRequest::Upvote { voter_key })
        .await?;

    let mut response = VoteResponse::from(outcome);
    response.has_voted = Some(true);

    Ok(Json(response))
}

pub async fn voter_handler(
    State(state): State<Arc<AppState>>,
    Path((id, voter_key)): Path<(FeatureId, String)>,
) -> Result<Json<VoterStatus>, AppError> {
    let has_voted = state.engine.has_voted(id, &voter_key).await?;

    Ok(Json(VoterStatus { has_voted }))
}

pub async fn add_votes_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<FeatureId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<VoteResponse>, AppError> {
    let idempotency_key = required_header(&headers, IDEMPOTENCY_KEY_HEADER)?;
    let payload: AddVotes = parse_json(&body)?;

    let request = VoteRequest::Adjustment {
        actor: payload.actor,
        delta: payload.delta.unwrap_or(1),
        idempotency_key: Some(idempotency_key),
    };

    let outcome = state.engine.cast_vote(id, request).await?;
    info!("Admin adjustment on {id}: {outcome:?}");

    Ok(Json(outcome.into()))
}

pub async fn recount_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<FeatureId>,
) -> Result<Json<RecountResponse>, AppError> {
    let recount = state.engine.recount(id).await?;

    Ok(Json(RecountResponse {
        previous: recount.previous,
        recounted: recount.recounted,
        drifted: recount.drifted(),
    }))
}

pub async fn events_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<FeatureId>,
) -> Result<Json<Vec<VoteEvent>>, AppError> {
    Ok(Json(state.engine.history(id).await?))
}
