use crate::auth::AuthState;
use crate::config::RuntimeConfig;
use crate::error::{AppError, AppResult};
use crate::upstream::{ImageUpstream, WorkersAiClient};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, Method, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::any::Any;
use std::sync::{Arc, Once, OnceLock};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub auth: AuthState,
    pub upstream: Arc<dyn ImageUpstream>,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env())
}

pub fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("fluxgate/0.1")
        .build()
        .map_err(|err| AppError::internal(format!("http client init failed: {err}")))?;
    let upstream = WorkersAiClient::from_config(http, &runtime);
    load_state_with_upstream(runtime, Arc::new(upstream))
}

/// Same as [`load_state_with_runtime`] but with a caller-supplied upstream.
pub fn load_state_with_upstream(
    runtime: RuntimeConfig,
    upstream: Arc<dyn ImageUpstream>,
) -> AppResult<AppState> {
    let metrics = init_metrics()?;
    let auth = AuthState::new(runtime.api_master_key.clone());
    if !auth.enabled() {
        tracing::warn!("API_MASTER_KEY not set; generation endpoint accepts unauthenticated requests");
    }
    Ok(AppState {
        runtime: Arc::new(runtime),
        auth,
        upstream,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::internal(format!(
                    "metrics init failed: {err}"
                )));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| AppError::internal("metrics recorder not available"))
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let body_limit = state.runtime.max_body_bytes;
    Router::<AppState>::new()
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/images/generations",
            post(crate::handlers::create_image_generation),
        )
        .route("/health", get(crate::handlers::health))
        .route(&metrics_path, get(crate::handlers::metrics))
        .fallback(crate::handlers::not_found)
        .method_not_allowed_fallback(crate::handlers::method_not_allowed)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors_layer())
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            REQUEST_ID_HEADER,
        )))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static(REQUEST_ID_HEADER),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "handler panicked");
    AppError::internal(format!("Internal error: {detail}")).into_response()
}
