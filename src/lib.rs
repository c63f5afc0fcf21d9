pub mod admin;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod rooms;
pub mod session;

use std::sync::Arc;

use axum::{extract::FromRef, http::StatusCode, response::{IntoResponse, Response}, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    db::Store,
    error::ChatError,
    rooms::{ConnectionRegistry, RoomPipeline},
    session::SessionCodec,
};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Store,
    pub codec: SessionCodec,
    pub registry: Arc<ConnectionRegistry>,
    pub pipeline: RoomPipeline,
}

impl AppState {
    pub fn new(store: Store, codec: SessionCodec, send_queue_capacity: usize) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(send_queue_capacity));
        Self {
            pipeline: RoomPipeline::new(store.clone(), registry.clone()),
            store,
            codec,
            registry,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(rooms::router())
        .merge(admin::router())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(err) = self.0.downcast_ref::<ChatError>() {
            if err.status().is_server_error() {
                tracing::error!(error = %err, "request failed");
            }
            return (err.status(), err.client_message()).into_response();
        }

        tracing::error!(error = %self.0, backtrace = %self.0.backtrace(), "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
