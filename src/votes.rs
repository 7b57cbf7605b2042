use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_sessions::Session;
use tracing::debug;
use uuid::Uuid;

use crate::counter::ensure_vote_table;
use crate::db::Permission;
use crate::error::ApiError;
use crate::events::VoteEvent;
use crate::startup::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitVoteRequest {
    pub poll_id: Uuid,
    pub option_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct VoteCountResponse {
    pub option_id: Uuid,
    pub count: i64,
}

// Session issuance is someone else's job; we only read the user id it left
// behind.
pub(crate) async fn get_user_id_from_session(session: &Session) -> Result<Uuid, ApiError> {
    session
        .get::<Uuid>("user_id")
        .await
        .map_err(|_| ApiError::Unauthorized)?
        .ok_or(ApiError::Unauthorized)
}

/// Accept a vote and hand it to the event log. Counting happens
/// asynchronously in the vote processor, so a 201 here only means the vote
/// was durably recorded for processing.
pub async fn submit_vote(
    Extension(app_state): Extension<AppState>,
    session: Session,
    Json(payload): Json<SubmitVoteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = get_user_id_from_session(&session).await?;
    let received_at = Utc::now();

    let allowed = app_state
        .store
        .authorize(Some(user_id), payload.poll_id, Permission::Vote, received_at)
        .await?;
    if !allowed {
        return Err(ApiError::Forbidden);
    }

    let valid_option = app_state
        .store
        .option_belongs_to_poll(payload.poll_id, payload.option_id)
        .await?;
    if !valid_option {
        return Err(ApiError::OptionNotFound);
    }

    let event = VoteEvent {
        poll_id: payload.poll_id,
        user_id,
        option_id: payload.option_id,
        received_at,
    };
    app_state.producer.send(&event).await?;

    debug!(poll_id = %payload.poll_id, %user_id, "vote accepted");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Vote accepted"
        })),
    ))
}

/// Materialized vote counts for a poll, straight from the counter cache.
pub async fn get_vote_counts(
    Extension(app_state): Extension<AppState>,
    Path(poll_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let visible = app_state
        .store
        .authorize(None, poll_id, Permission::View, Utc::now())
        .await?;
    if !visible {
        return Err(ApiError::PollNotFound);
    }

    ensure_vote_table(poll_id, app_state.store.as_ref(), app_state.cache.as_ref()).await?;
    let counts = app_state.cache.read_counts(poll_id).await?;

    let response: Vec<VoteCountResponse> = counts
        .into_iter()
        .map(|(option_id, count)| VoteCountResponse { option_id, count })
        .collect();

    Ok((StatusCode::OK, Json(response)))
}
