//! Admin HTTP API for managing stubs and schemas.

use crate::server::MockServer;
use crate::stub::{Query, Stub, StubError};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

pub fn router(server: Arc<MockServer>) -> Router {
    Router::new()
        .route("/", get(list))
        .route("/add", post(add))
        .route("/find", post(find))
        .route("/clear", get(clear))
        .route("/reset", post(reset))
        .route("/reload", post(reload))
        .route("/services", get(services))
        .route("/alive", get(alive))
        .with_state(server)
}

async fn list(State(server): State<Arc<MockServer>>) -> Response {
    Json(server.store().all()).into_response()
}

/// Accepts one stub object or an array of them.
async fn add(State(server): State<Arc<MockServer>>, Json(body): Json<Value>) -> Response {
    let stubs = match body {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value::<Stub>)
            .collect::<Result<Vec<_>, _>>(),
        other => serde_json::from_value::<Stub>(other).map(|stub| vec![stub]),
    };
    let stubs = match stubs {
        Ok(stubs) => stubs,
        Err(e) => return bad_request(e.to_string()),
    };

    match server.store().add_many(stubs) {
        Ok(count) => {
            info!(count, "Added stubs");
            (StatusCode::OK, "Success add stub").into_response()
        }
        Err(e) => bad_request(e.to_string()),
    }
}

async fn find(State(server): State<Arc<MockServer>>, Json(query): Json<Query>) -> Response {
    match server.store().find(&query) {
        Ok(output) => Json(output).into_response(),
        Err(e @ StubError::NotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        Err(e) => bad_request(e.to_string()),
    }
}

async fn clear(State(server): State<Arc<MockServer>>) -> Response {
    server.store().clear();
    info!("Cleared stubs");
    (StatusCode::OK, "OK").into_response()
}

async fn reset(State(server): State<Arc<MockServer>>) -> Response {
    match server.reset_stubs() {
        Ok(loaded) => Json(json!({ "loaded": loaded })).into_response(),
        Err(e) => internal(format!("{e:#}")),
    }
}

async fn reload(State(server): State<Arc<MockServer>>) -> Response {
    match server.reload().await {
        Ok(methods) => Json(json!({ "methods": methods })).into_response(),
        Err(e) => internal(format!("{e:#}")),
    }
}

async fn services(State(server): State<Arc<MockServer>>) -> Response {
    Json(server.dispatcher().methods()).into_response()
}

async fn alive() -> String {
    format!("grpcmock {} alive", env!("CARGO_PKG_VERSION"))
}

fn bad_request(message: String) -> Response {
    warn!(error = %message, "Rejected admin request");
    (StatusCode::BAD_REQUEST, message).into_response()
}

fn internal(message: String) -> Response {
    warn!(error = %message, "Admin request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
}
