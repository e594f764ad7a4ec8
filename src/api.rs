//! Local HTTP boundary between the browser-side request hook and the engine.
//!
//! The hook posts each matching request's URL and headers to
//! `/v1/intercept` while the request is held, and sends back whatever header
//! set comes out.

use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    controller::{Engine, EngineStatus},
    inject::{Header, InterceptedRequest},
};

#[derive(Clone)]
struct ApiState {
    engine: Engine,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InterceptResponse {
    request_headers: Vec<Header>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(engine: Engine, api_key: Option<String>) -> axum::Router {
    use axum::{middleware, routing, Router};

    let state = ApiState {
        engine,
        api_key: api_key
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
    };

    let protected = Router::new()
        .route("/v1/status", routing::get(api_status))
        .route("/v1/accounts", routing::get(api_accounts))
        .route("/v1/intercept", routing::post(api_intercept))
        .route("/v1/toggle", routing::post(api_toggle))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_auth_middleware,
        ));

    Router::new()
        .route("/health", routing::get(api_health))
        .merge(protected)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

async fn api_health() -> axum::Json<Value> {
    axum::Json(json!({
        "status": "ok",
        "service": "entra-sso-bridge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn api_status(
    axum::extract::State(state): axum::extract::State<ApiState>,
) -> axum::Json<EngineStatus> {
    axum::Json(state.engine.status())
}

async fn api_accounts(
    axum::extract::State(state): axum::extract::State<ApiState>,
) -> axum::Json<Value> {
    axum::Json(json!({
        "accounts": state.engine.accounts(),
        "active": state.engine.active_account(),
    }))
}

async fn api_intercept(
    axum::extract::State(state): axum::extract::State<ApiState>,
    axum::Json(request): axum::Json<InterceptedRequest>,
) -> axum::Json<InterceptResponse> {
    let request_headers = state.engine.intercept(request).await;
    axum::Json(InterceptResponse { request_headers })
}

async fn api_toggle(
    axum::extract::State(state): axum::extract::State<ApiState>,
) -> axum::Json<EngineStatus> {
    axum::Json(state.engine.toggle())
}

fn unauthorized_error_envelope() -> Value {
    json!({
        "error": {
            "code": "unauthorized",
            "message": "Missing or invalid API key",
            "statusCode": 401,
        }
    })
}

async fn api_auth_middleware(
    axum::extract::State(state): axum::extract::State<ApiState>,
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<axum::response::Response, (axum::http::StatusCode, axum::Json<Value>)> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| {
            request
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::trim)
                .filter(|value| !value.is_empty())
        });

    if provided != Some(expected) {
        return Err((
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(unauthorized_error_envelope()),
        ));
    }

    Ok(next.run(request).await)
}
