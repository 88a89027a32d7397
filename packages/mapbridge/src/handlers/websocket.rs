use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

use crate::AppState;
use crate::auth::AuthUser;
use crate::registry::Side;
use crate::relay;

/// `GET /ws/plugin`: the desktop plugin's end of the relay.
pub async fn plugin_ws_handler(
    State(state): State<AppState>,
    user: AuthUser,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, user, ws, Side::Plugin)
}

/// `GET /ws/app`: the browser application's end of the relay.
pub async fn app_ws_handler(
    State(state): State<AppState>,
    user: AuthUser,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, user, ws, Side::App)
}

fn upgrade(state: AppState, user: AuthUser, ws: WebSocketUpgrade, side: Side) -> Response {
    let registry = state.registry.clone();
    let metrics = state.metrics.clone();
    ws.on_upgrade(move |socket| relay::run_relay(socket, user.username, side, registry, metrics))
}
