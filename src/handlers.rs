use crate::accounts::AccountPool;
use crate::app::AppState;
use crate::dispatch::{DispatchError, dispatch};
use crate::error::{AppError, AppResult, GatewayError};
use crate::normalize::{self, GenerationRequest};
use crate::response::{assemble_success, exhausted_message};
use axum::Json;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::{Value, json};

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let pool = AccountPool::from_config(&state.runtime);
    Json(json!({
        "status": "ok",
        "model": state.runtime.model,
        "accounts_configured": pool.len(),
        "auth_enabled": state.auth.enabled(),
    }))
}

pub async fn not_found() -> AppError {
    AppError::not_found()
}

pub async fn method_not_allowed() -> AppError {
    AppError::new(
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
        "Method Not Allowed",
    )
}

pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    state.auth.authorize(&headers)?;
    let data = json!([{
        "id": state.runtime.model,
        "object": "model",
        "created": now_ts(),
        "owned_by": "cloudflare"
    }]);
    Ok(Json(json!({ "object": "list", "data": data })).into_response())
}

pub async fn create_image_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> AppResult<Response> {
    state.auth.authorize(&headers)?;
    let generation = read_generation_request(&state, &headers, request).await?;

    let pool = AccountPool::from_config(&state.runtime);
    if pool.is_empty() {
        record_generation("failed");
        return Err(GatewayError::NoAccounts.into());
    }
    tracing::debug!(
        accounts = pool.len(),
        steps = generation.steps(),
        width = generation.width(),
        height = generation.height(),
        seed = ?generation.seed(),
        reference_images = generation.reference_images().len(),
        "dispatching image generation"
    );

    match dispatch(state.upstream.as_ref(), &pool, &generation).await {
        Ok(dispatched) => {
            record_generation("success");
            let body = assemble_success(dispatched, generation.prompt(), &state.runtime.model);
            Ok(Json(body).into_response())
        }
        Err(DispatchError::Exhausted {
            attempted,
            last_error,
        }) => {
            record_generation("exhausted");
            Err(GatewayError::Exhausted(exhausted_message(&attempted, last_error.as_ref())).into())
        }
        Err(DispatchError::Fatal {
            account, failure, ..
        }) => {
            record_generation("failed");
            Err(GatewayError::Upstream { account, failure }.into())
        }
    }
}

async fn read_generation_request(
    state: &AppState,
    headers: &HeaderMap,
    request: Request,
) -> AppResult<GenerationRequest> {
    let defaults = state.runtime.defaults;
    if is_multipart(headers) {
        let multipart = Multipart::from_request(request, state)
            .await
            .map_err(|rej| AppError::new(rej.status(), "invalid_body", rej.body_text()))?;
        let form = normalize::read_multipart(multipart).await?;
        return Ok(normalize::normalize_form(form, defaults)?);
    }

    let body = Bytes::from_request(request, state)
        .await
        .map_err(|rej| AppError::new(rej.status(), "invalid_body", rej.body_text()))?;
    let value: Value = serde_json::from_slice(&body)
        .map_err(|err| GatewayError::InvalidBody(format!("invalid JSON body: {err}")))?;
    Ok(normalize::normalize_json(&value, defaults)?)
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<mime::Mime>().ok())
        .is_some_and(|m| m.type_() == mime::MULTIPART && m.subtype() == mime::FORM_DATA)
}

fn record_generation(status: &'static str) {
    metrics::counter!("fluxgate_generations_total", "status" => status).increment(1);
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
