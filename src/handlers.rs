use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::error::{Result, ThrottlerError};
use crate::health::HealthChecker;
use crate::policy::ThrottlePolicy;
use crate::response::{ClearResponse, DecisionResponse};
use crate::validation::RequestValidator;

/// Shared application state
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub policy: Arc<ThrottlePolicy>,
}

impl AppState {
    pub fn new(policy: Arc<ThrottlePolicy>) -> SharedState {
        Arc::new(Self { policy })
    }
}

/// Runs a policy call on the blocking pool; store round-trips are synchronous.
async fn blocking<T, F>(state: &SharedState, f: F) -> Result<T>
where
    F: FnOnce(&ThrottlePolicy) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let policy = state.policy.clone();
    tokio::task::spawn_blocking(move || f(policy.as_ref()))
        .await
        .map_err(|e| ThrottlerError::Internal(format!("Blocking task failed: {}", e)))?
}

fn decision(state: &SharedState, entity: &str, allowed: bool) -> impl IntoResponse {
    let status = if allowed { StatusCode::OK } else { StatusCode::TOO_MANY_REQUESTS };
    (status, Json(DecisionResponse::new(allowed, state.policy.rule_id(), entity)))
}

/// Current counters and limits for an entity
pub async fn get_quota(
    State(state): State<SharedState>,
    Path(entity): Path<String>,
) -> Result<impl IntoResponse> {
    let id = RequestValidator::validate_entity(&entity)?;
    let status = blocking(&state, move |policy| policy.status(&id)).await?;
    Ok(Json(status))
}

/// Lock the entity and check its budget; the lock stays held on success
pub async fn approve(
    State(state): State<SharedState>,
    Path(entity): Path<String>,
) -> Result<impl IntoResponse> {
    let id = RequestValidator::validate_entity(&entity)?;
    let allowed = blocking(&state, move |policy| policy.approve(&id)).await?;
    Ok(decision(&state, &entity, allowed))
}

/// Commit an approved reservation
pub async fn use_quota(
    State(state): State<SharedState>,
    Path(entity): Path<String>,
) -> Result<impl IntoResponse> {
    let id = RequestValidator::validate_entity(&entity)?;
    blocking(&state, move |policy| policy.use_quota(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Drop an approval without consuming quota
pub async fn release(
    State(state): State<SharedState>,
    Path(entity): Path<String>,
) -> Result<impl IntoResponse> {
    let id = RequestValidator::validate_entity(&entity)?;
    blocking(&state, move |policy| policy.release(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Approve and commit in one request
pub async fn reserve(
    State(state): State<SharedState>,
    Path(entity): Path<String>,
) -> Result<impl IntoResponse> {
    let id = RequestValidator::validate_entity(&entity)?;
    let allowed = blocking(&state, move |policy| policy.approve_and_use(&id)).await?;
    Ok(decision(&state, &entity, allowed))
}

/// Reset an entity's counters
pub async fn clear_quota(
    State(state): State<SharedState>,
    Path(entity): Path<String>,
) -> Result<impl IntoResponse> {
    let id = RequestValidator::validate_entity(&entity)?;
    blocking(&state, move |policy| policy.clear(&id)).await?;
    Ok(Json(ClearResponse::cleared(&entity)))
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> Result<impl IntoResponse> {
    let checker = HealthChecker::new(state.policy.clone());
    let health = tokio::task::spawn_blocking(move || checker.check_health())
        .await
        .map_err(|e| ThrottlerError::Internal(format!("Blocking task failed: {}", e)))?;

    let status = if health.store.error.is_none() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Ok((status, Json(health)))
}
