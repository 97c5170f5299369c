//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! Binds the HTTP API and the websocket endpoint under a single Axum router.
//! Browser clients authenticate over `/api/auth`, manage documents over
//! `/api/documents`, and carry all realtime traffic over `/api/ws`.

pub mod auth;
pub mod documents;
pub mod ws;

use axum::Router;
use axum::http::{HeaderValue, StatusCode};
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

fn cors_layer() -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match std::env::var("ALLOWED_ORIGINS") {
        Ok(origins) => {
            let origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            layer.allow_origin(origins)
        }
        Err(_) => layer.allow_origin(Any),
    }
}

/// Full application router: auth, documents, websocket, health.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me))
        .route("/api/documents", get(documents::list).post(documents::create))
        .route(
            "/api/documents/{id}",
            get(documents::get_one)
                .patch(documents::rename)
                .delete(documents::delete),
        )
        .route("/api/ws", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
