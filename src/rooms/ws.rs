use std::time::Duration;

use axum::{
    debug_handler,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use tokio::{
    sync::mpsc,
    time::{Instant, interval, sleep_until},
};

use crate::{
    AppState,
    auth::bearer_token,
    error::ChatError,
    session::{Rejection, SessionCodec},
};

use super::{
    RoomPipeline,
    msg::{ClientEvent, ServerEvent},
    registry::{ConnectionId, Outbound, Registration},
};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Client frames read ahead of the one being handled.
const INBOUND_CAPACITY: usize = 32;

const CLOSE_TOKEN_EXPIRED: u16 = 4001;
const CLOSE_TOKEN_INVALID: u16 = 4002;

#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// `GET /ws?token=JWT`, or with an `Authorization: Bearer` header.
///
/// The token is checked right after the upgrade; a refused connection gets an
/// `error` event and a close frame before it can send anything.
#[debug_handler(state = AppState)]
pub async fn room_ws(
    State(codec): State<SessionCodec>,
    State(pipeline): State<RoomPipeline>,
    Query(WsAuthQuery { token }): Query<WsAuthQuery>,
    headers: HeaderMap,

    ws: WebSocketUpgrade,
) -> Response {
    let token = token.or_else(|| bearer_token(&headers).map(str::to_owned));

    ws.on_upgrade(move |socket| async move {
        let registration = match token {
            Some(token) => pipeline.registry().authenticate(&codec, &token),
            None => Err(Rejection::Invalid),
        };

        match registration {
            Ok(registration) => run_connection(socket, pipeline, registration).await,
            Err(rejection) => refuse(socket, rejection).await,
        }
    })
}

async fn refuse(mut socket: WebSocket, rejection: Rejection) {
    let (code, reason) = match rejection {
        Rejection::Expired => (CLOSE_TOKEN_EXPIRED, "token expired"),
        Rejection::Invalid => (CLOSE_TOKEN_INVALID, "token invalid"),
    };
    tracing::warn!(close_code = code, reason, "websocket auth failed");

    let error = ServerEvent::Error(ChatError::Unauthorized.client_message());
    if let Ok(frame) = serde_json::to_string(&error) {
        let _ = socket.send(Message::Text(frame.into())).await;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn run_connection(socket: WebSocket, pipeline: RoomPipeline, registration: Registration) {
    let Registration { id, claim, outbound } = registration;
    let (sink, mut stream) = socket.split();
    let (pong_tx, pong_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

    let mut writer = tokio::spawn(writer_task(sink, outbound, pong_rx));
    // events are handled in arrival order off the read loop, so pongs are
    // still read while a submission waits on the store
    let dispatcher = tokio::spawn(dispatch(pipeline.clone(), id, inbound_rx));

    tracing::info!(connection_id = %id, user_id = claim.id, email = %claim.email, "connection opened");

    loop {
        tokio::select! {
            // queue dropped by the registry (evicted) or socket gone
            _ = &mut writer => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if inbound_tx.send(text.as_str().to_owned()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => report(
                    &pipeline,
                    id,
                    ChatError::Validation("binary frames are not supported".to_owned()),
                ),
                Some(Ok(Message::Pong(_))) => {
                    let _ = pong_tx.send(());
                }
                // tungstenite answers pings itself
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(connection_id = %id, reason = ?frame, "client closed");
                    break;
                }
                Some(Err(err)) => {
                    tracing::warn!(connection_id = %id, error = %err, "websocket receive error");
                    break;
                }
                None => break,
            },
        }
    }

    // a commit already handed to the store runs on its own task and still lands
    dispatcher.abort();
    pipeline.handle_disconnect(id);
    writer.abort();

    tracing::info!(connection_id = %id, user_id = claim.id, "connection closed");
}

async fn dispatch(pipeline: RoomPipeline, id: ConnectionId, mut inbound: mpsc::Receiver<String>) {
    while let Some(frame) = inbound.recv().await {
        handle_frame(&pipeline, id, &frame).await;
    }
}

async fn handle_frame(pipeline: &RoomPipeline, id: ConnectionId, frame: &str) {
    let result = match ClientEvent::parse(frame) {
        Ok(ClientEvent::Join { group_id }) => pipeline.handle_join(id, group_id).await,
        Ok(ClientEvent::Leave { group_id }) => pipeline.handle_leave(id, group_id).await,
        Ok(ClientEvent::Message(submit)) => pipeline.handle_submit(id, submit).await.map(drop),
        Err(err) => Err(err),
    };

    if let Err(err) = result {
        report(pipeline, id, err);
    }
}

/// Sends `err` to the connection that caused it, and nobody else.
fn report(pipeline: &RoomPipeline, id: ConnectionId, err: ChatError) {
    tracing::debug!(connection_id = %id, error = %err, "rejected client event");
    pipeline.registry().send_to(id, ServerEvent::Error(err.client_message()));
}

/// Owns the socket's write half: drains the connection's queue and keeps it
/// alive with pings.
async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    mut pongs: mpsc::UnboundedReceiver<()>,
) {
    let mut ping = interval(PING_INTERVAL);
    ping.tick().await;
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let frame = match serde_json::to_string(&*event) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping unserializable event");
                        continue;
                    }
                };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(vec![1, 2, 3, 4].into())).await.is_err() {
                    break;
                }
                pong_deadline.get_or_insert(Instant::now() + PONG_TIMEOUT);
            }
            Some(()) = pongs.recv() => pong_deadline = None,
            _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                tracing::warn!("pong timeout, closing connection");
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "pong timeout".into(),
                    })))
                    .await;
                break;
            }
        }
    }
}
