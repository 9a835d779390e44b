//! HTTP surface and per-connection websocket sessions.
//!
//! The routes are thin glue over the driver and the hub; the session loop at
//! `GET /play` is where client bytes meet the core.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::hub::Hub;
use crate::storage::SeedStore;

/// Upper bound on websocket message size, both directions. A full snapshot
/// of a dense 1024-torus runs to several megabytes.
const MAX_FRAME_BYTES: usize = 32 << 20;

const INDEX_HTML: &str = include_str!("server/index.html");

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub hub: Arc<Hub>,
    pub store: Arc<dyn SeedStore>,
    pub world_size: u32,
    pub cancel: CancellationToken,
}

#[derive(Serialize)]
struct Globals {
    #[serde(rename = "WorldSize")]
    world_size: u32,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/game", get(game))
        .route("/globals", get(globals))
        .route("/play", get(play))
        .route("/save", post(save))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Game fragment reflecting the live driver state, so a freshly loaded page
/// renders the right controls before the first snapshot arrives.
async fn game(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<section id=\"game\" data-speed=\"{}\" data-playing=\"{}\"></section>",
        state.engine.speed(),
        state.engine.playing(),
    ))
}

async fn globals(State(state): State<AppState>) -> Json<Globals> {
    Json(Globals {
        world_size: state.world_size,
    })
}

async fn play(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| session(socket, state))
}

async fn save(State(state): State<AppState>) -> Response {
    let Some(snapshot) = state.hub.last_snapshot() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "no snapshot to save").into_response();
    };
    match state.store.store_seed(&snapshot) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            error!("could not save seed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "could not save seed").into_response()
        }
    }
}

/// One client session: forward hub frames to the peer, feed peer frames to
/// the driver. Client-triggered errors are logged and the session continues;
/// peer I/O errors or cancellation end it. The hub subscription deregisters
/// itself on drop.
async fn session(socket: WebSocket, state: AppState) {
    let mut subscription = state.hub.subscribe();
    let (mut sink, mut stream) = socket.split();
    info!("session opened");

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = subscription.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(Message::Binary(frame)).await {
                        debug!("could not write to peer: {e}");
                        break;
                    }
                }
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = state.engine.submit(&data) {
                        warn!("client message rejected: {e}");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Pings are answered by the websocket layer; text has no
                // meaning in this protocol.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("could not read from peer: {e}");
                    break;
                }
            },
        }
    }

    info!("session closed");
}
