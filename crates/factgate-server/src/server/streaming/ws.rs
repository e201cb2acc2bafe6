//! WebSocket transport.
//!
//! A session carries any number of streams, one per inbound message. Every
//! frame sent back is a JSON object tagged with `event`: `start`, `chunk`,
//! `end` or `error`.
//!
//! Checks, in order:
//!
//! 1. An API key is required to open a session (close `4401`).
//! 2. Parallel sessions per key are capped (close `4429`).
//! 3. Each message must fit the session's window; a violation is reported
//!    and closes the session (`4429`).
//! 4. Each message is admitted like an HTTP request; a rejection is reported
//!    and the session stays open.
//!
//! The inbound half is read while a stream runs: a close stops the stream at
//! once, and requests sent meanwhile wait their turn.

use crate::server::{
    service::handler::{AppState, ClientIp, header_value},
    streaming::{clamp_chunk_size, delay_or_default, session::SessionWindow},
    telemetry::{
        increment_chunks_sent, increment_rejections, increment_requests, increment_stream_errors,
        increment_ws_disconnects,
    },
};
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message},
    },
    http::HeaderMap,
    response::Response,
};
use factgate::{Error, FactStreamer, Identity};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{Map, Value, json};
use std::collections::VecDeque;

pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
pub const CLOSE_TOO_MANY: u16 = 4429;

/// Requests held back while a stream runs; later ones are dropped.
const MAX_QUEUED_REQUESTS: usize = 16;

/// What an inbound frame means to the session.
enum Inbound {
    Request(String),
    Ignore,
    Closed,
}

impl Inbound {
    fn from_frame<E>(frame: Option<Result<Message, E>>) -> Self {
        match frame {
            Some(Ok(Message::Text(text))) => Self::Request(text.as_str().to_owned()),
            Some(Ok(Message::Binary(bytes))) => {
                Self::Request(String::from_utf8_lossy(&bytes).into_owned())
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => Self::Ignore,
            Some(Ok(Message::Close(_)) | Err(_)) | None => Self::Closed,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    MissingKey,
    TooManyConnections,
    RateLimited,
    ClientClosed,
    SendFailed,
    Shutdown,
}

impl Disconnect {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MissingKey => "missing_key",
            Self::TooManyConnections => "too_many_connections",
            Self::RateLimited => "rate_limited",
            Self::ClientClosed => "client_closed",
            Self::SendFailed => "send_failed",
            Self::Shutdown => "shutdown",
        }
    }
}

pub async fn ws_stream(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let api_key = header_value(&headers, &state.config.api_key_header).map(str::to_owned);
    let identity = state.identity(&headers, &ip);
    ws.on_upgrade(move |socket| async move {
        let (tx, rx) = socket.split();
        serve_session(state, api_key, identity, tx, rx).await;
    })
}

/// One inbound message, decoded leniently.
#[derive(Debug, Clone, PartialEq)]
pub struct WsRequest {
    pub text: String,
    pub cursor: usize,
    pub chunk_size: Option<usize>,
    /// Inter-chunk delay override in seconds.
    pub delay: Option<f64>,
}

impl WsRequest {
    /// Decodes a message. Anything that is not a JSON object is taken as the
    /// query text itself.
    pub fn parse(raw: &str) -> Self {
        let payload = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => text_only(display(&other)),
            Err(_) => text_only(raw.to_owned()),
        };

        Self {
            text: payload.get("text").map(display).unwrap_or_default(),
            cursor: payload
                .get("cursor")
                .and_then(as_integer)
                .map_or(0, |cursor| cursor.max(0) as usize),
            chunk_size: payload
                .get("chunk_size")
                .and_then(as_integer)
                .map(|size| size.max(1) as usize),
            delay: payload.get("delay").and_then(as_float),
        }
    }
}

fn text_only(text: String) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("text".to_owned(), Value::String(text));
    map
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Runs a session to completion over a split socket.
pub async fn serve_session<Tx, Rx, E>(
    state: AppState,
    api_key: Option<String>,
    identity: Identity,
    mut tx: Tx,
    mut rx: Rx,
) -> Disconnect
where
    Tx: Sink<Message> + Unpin,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
{
    let Some(api_key) = api_key else {
        close(&mut tx, CLOSE_UNAUTHORIZED, "Missing API key").await;
        increment_ws_disconnects(Disconnect::MissingKey.as_str());
        return Disconnect::MissingKey;
    };

    let max_sessions = state.config.session.max_sessions_per_key;
    let _permit = match state.connections.acquire(&api_key, max_sessions) {
        Ok(permit) => permit,
        Err(_active) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                client = %identity.ip,
                org = %identity.org,
                active = _active,
                limit = max_sessions,
                "too many parallel websocket sessions"
            );
            close(&mut tx, CLOSE_TOO_MANY, "Too many parallel connections").await;
            increment_ws_disconnects(Disconnect::TooManyConnections.as_str());
            return Disconnect::TooManyConnections;
        }
    };

    #[cfg(feature = "tracing")]
    tracing::info!(client = %identity.ip, org = %identity.org, "websocket session opened");

    let session = &state.config.session;
    let mut window = SessionWindow::new(session.message_limit, session.window);
    let reason = run(&state, &identity, &mut window, &mut tx, &mut rx).await;
    window.reset();

    #[cfg(feature = "tracing")]
    tracing::info!(
        client = %identity.ip,
        org = %identity.org,
        reason = reason.as_str(),
        "websocket session closed"
    );
    increment_ws_disconnects(reason.as_str());
    reason
}

async fn run<Tx, Rx, E>(
    state: &AppState,
    identity: &Identity,
    window: &mut SessionWindow,
    tx: &mut Tx,
    rx: &mut Rx,
) -> Disconnect
where
    Tx: Sink<Message> + Unpin,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
{
    let shutdown = state.registry.cancelled();
    tokio::pin!(shutdown);
    let mut queued: VecDeque<String> = VecDeque::new();

    loop {
        let raw = if let Some(raw) = queued.pop_front() {
            raw
        } else {
            let frame = tokio::select! {
                () = &mut shutdown => {
                    close(tx, CLOSE_GOING_AWAY, "Server shutting down").await;
                    return Disconnect::Shutdown;
                }
                frame = rx.next() => frame,
            };
            match Inbound::from_frame(frame) {
                Inbound::Request(raw) => raw,
                Inbound::Ignore => continue,
                Inbound::Closed => return Disconnect::ClientClosed,
            }
        };

        let request = WsRequest::parse(&raw);
        if request.text.trim().is_empty() {
            let frame = json!({ "event": "error", "message": "Query must not be empty", "replay": false });
            if !send(tx, &frame).await {
                return Disconnect::SendFailed;
            }
            continue;
        }

        let (allowed, _) = window.allow();
        if !allowed {
            let retry_after = window.retry_after();
            #[cfg(feature = "tracing")]
            tracing::warn!(
                client = %identity.ip,
                org = %identity.org,
                retry_after,
                "websocket session rate limit exceeded"
            );
            let frame = json!({
                "event": "error",
                "message": "Rate limit exceeded",
                "replay": false,
                "retry_after": retry_after,
            });
            send(tx, &frame).await;
            close(tx, CLOSE_TOO_MANY, "Rate limit exceeded").await;
            return Disconnect::RateLimited;
        }

        match state.limiter.check_and_consume(identity).await {
            Ok(_) => increment_requests(),
            Err(Error::QuotaExceeded(rejection)) => {
                increment_rejections(&rejection.denied);
                let frame = json!({
                    "event": "error",
                    "message": "Rate limit exceeded",
                    "replay": false,
                    "retry_after": rejection.retry_after,
                });
                if !send(tx, &frame).await {
                    return Disconnect::SendFailed;
                }
                continue;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("admission check failed: {_e}");
            }
        }

        let Some(_guard) = state.registry.begin() else {
            close(tx, CLOSE_GOING_AWAY, "Server shutting down").await;
            return Disconnect::Shutdown;
        };

        let config = &state.config.stream;
        let start_at = request.cursor;
        let replay = start_at > 0;
        let streamer = FactStreamer::new(
            state.pipeline.clone(),
            clamp_chunk_size(request.chunk_size, config),
        )
        .with_delay(delay_or_default(request.delay, config));
        let mut chunks = streamer.stream(request.text, start_at);

        if !send(tx, &json!({ "event": "start", "cursor": start_at, "replay": replay })).await {
            return Disconnect::SendFailed;
        }

        let mut sent = 0;
        loop {
            let item = tokio::select! {
                () = &mut shutdown => {
                    close(tx, CLOSE_GOING_AWAY, "Server shutting down").await;
                    return Disconnect::Shutdown;
                }
                frame = rx.next() => {
                    match Inbound::from_frame(frame) {
                        Inbound::Request(raw) if queued.len() < MAX_QUEUED_REQUESTS => {
                            queued.push_back(raw);
                        }
                        Inbound::Request(_) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(client = %identity.ip, "websocket request queue full, dropping request");
                        }
                        Inbound::Ignore => {}
                        Inbound::Closed => return Disconnect::ClientClosed,
                    }
                    continue;
                }
                item = chunks.next() => item,
            };
            let frame = match item {
                Some(Ok(chunk)) => {
                    sent += 1;
                    increment_chunks_sent(1);
                    json!({ "event": "chunk", "id": chunk.index, "text": chunk.text, "replay": chunk.is_replay })
                }
                Some(Err(e)) => {
                    increment_stream_errors();
                    json!({ "event": "error", "message": e.to_string(), "replay": replay })
                }
                None => json!({ "event": "end", "cursor": start_at + sent, "replay": replay }),
            };
            if !send(tx, &frame).await {
                return Disconnect::SendFailed;
            }
            if frame["event"] != "chunk" {
                break;
            }
        }
    }
}

async fn send<Tx>(tx: &mut Tx, frame: &Value) -> bool
where
    Tx: Sink<Message> + Unpin,
{
    tx.send(Message::Text(frame.to_string().into())).await.is_ok()
}

async fn close<Tx>(tx: &mut Tx, code: u16, reason: &'static str)
where
    Tx: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = tx.send(Message::Close(Some(frame))).await;
}
