pub mod membership;
pub mod msg;
pub mod pipeline;
pub mod registry;
mod ws;

use axum::{routing::get, Router};

use crate::AppState;

pub use pipeline::RoomPipeline;
pub use registry::ConnectionRegistry;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::room_ws))
}
