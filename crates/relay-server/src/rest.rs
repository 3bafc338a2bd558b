//! REST endpoints for history, edits and deletes.
//!
//! Every route requires `Authorization: Bearer <token>` and is rate limited
//! per user.

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use relay_core::{HistoryQuery, Message, MessageId, StoreError, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error};

use crate::auth::bearer_token;
use crate::handlers::AppState;
use crate::metrics;

/// REST errors, mapped to status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid credentials")]
    Unauthorized,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("{0}")]
    BadRequest(String),

    #[error("not allowed")]
    Forbidden,

    #[error("message not found")]
    NotFound,

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ApiError::NotFound,
            StoreError::Forbidden(_) => ApiError::Forbidden,
            StoreError::Backend(reason) => ApiError::Internal(reason),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(reason) = &self {
            error!(error = %reason, "Request failed");
            metrics::record_error("store");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

/// A message as returned by the REST API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: MessageId,
    pub from: UserId,
    pub to: UserId,
    pub content: String,
    /// Creation time in unix seconds.
    pub timestamp: i64,
    /// Last edit time in unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<i64>,
    pub deleted: bool,
}

impl From<Message> for MessageResponse {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            from: message.sender,
            to: message.receiver,
            timestamp: message.timestamp(),
            edited_at: message.edited_at.map(|t| t.timestamp()),
            content: message.content,
            deleted: message.deleted,
        }
    }
}

/// The authenticated caller of a REST route.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token)
            .ok_or(ApiError::Unauthorized)?;

        let user = state.auth.verify(token).map_err(|e| {
            debug!(error = %e, "Rejected REST credential");
            metrics::record_error("auth");
            ApiError::Unauthorized
        })?;

        if !state.rest_limiter.allow(&user.to_string()) {
            return Err(ApiError::RateLimited);
        }

        Ok(AuthUser(user))
    }
}

/// History query string. Unparsable values fall back to defaults.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    limit: Option<String>,
    before: Option<String>,
}

/// Body of an edit request.
#[derive(Debug, Deserialize)]
pub struct EditRequest {
    content: String,
}

/// REST routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chats/:user_id", get(history_handler))
        .route(
            "/messages/:message_id",
            put(edit_handler).delete(delete_handler),
        )
}

fn respond<T: IntoResponse>(
    route: &'static str,
    start: Instant,
    result: Result<T, ApiError>,
) -> Response {
    let response = result.into_response();
    metrics::record_rest_request(
        route,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

fn parse_message_id(raw: &str) -> Result<MessageId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest("invalid message id".into()))
}

async fn history_handler(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(peer): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let start = Instant::now();
    respond("history", start, history(&state, user, &peer, &params).await)
}

async fn history(
    state: &AppState,
    user: UserId,
    peer: &str,
    params: &HistoryParams,
) -> Result<Json<Vec<MessageResponse>>, ApiError> {
    let peer: UserId = peer
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid user id".into()))?;

    let query = HistoryQuery::new()
        .with_limit(params.limit.as_deref().and_then(|l| l.parse().ok()))
        .before_unix(params.before.as_deref().and_then(|b| b.parse().ok()));

    let messages = state.hub.store().history(user, peer, &query).await?;
    Ok(Json(messages.into_iter().map(MessageResponse::from).collect()))
}

async fn edit_handler(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
    body: Result<Json<EditRequest>, JsonRejection>,
) -> Response {
    let start = Instant::now();
    respond("edit", start, edit(&state, user, &message_id, body).await)
}

async fn edit(
    state: &AppState,
    user: UserId,
    message_id: &str,
    body: Result<Json<EditRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let id = parse_message_id(message_id)?;
    let Json(body) = body.map_err(|_| ApiError::BadRequest("invalid body".into()))?;
    if body.content.is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".into()));
    }
    if body.content.len() > state.config.limits.max_content_length {
        return Err(ApiError::BadRequest("content too long".into()));
    }

    let message = state.hub.edit_message(id, user, &body.content).await?;
    Ok(Json(message.into()))
}

async fn delete_handler(
    AuthUser(user): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
) -> Response {
    let start = Instant::now();
    let result = match parse_message_id(&message_id) {
        Ok(id) => state
            .hub
            .delete_message(id, user)
            .await
            .map(|message| Json(MessageResponse::from(message)))
            .map_err(ApiError::from),
        Err(e) => Err(e),
    };
    respond("delete", start, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_error_status_codes() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ApiError::from(StoreError::Forbidden(MessageId::generate())).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(StoreError::NotFound(MessageId::generate())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StoreError::Backend("locked".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_message_response_shape() {
        let mut message = Message::new(UserId::random(), UserId::random(), "hi");
        message.created_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let value = serde_json::to_value(MessageResponse::from(message.clone())).unwrap();
        assert_eq!(value["from"], message.sender.to_string());
        assert_eq!(value["to"], message.receiver.to_string());
        assert_eq!(value["timestamp"], 1_700_000_000);
        assert_eq!(value["deleted"], false);
        assert!(value.get("edited_at").is_none());

        message.edited_at = Some(Utc.timestamp_opt(1_700_000_100, 0).unwrap());
        let value = serde_json::to_value(MessageResponse::from(message)).unwrap();
        assert_eq!(value["edited_at"], 1_700_000_100);
    }
}
