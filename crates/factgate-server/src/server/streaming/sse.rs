//! Server-Sent Events transport.
//!
//! A stream is a `start` event, one `chunk` event per chunk (its SSE `id` is
//! the chunk index), then either `end` or a single `error`. Clients resume by
//! reconnecting with `Last-Event-ID` or an explicit `cursor`.

use crate::server::{
    service::{
        handler::{AppState, RequestId, header_value},
        problem::Problem,
    },
    streaming::StreamParams,
    telemetry::{increment_chunks_sent, increment_stream_errors},
};
use async_stream::stream;
use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use core::convert::Infallible;
use factgate::FactStreamer;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};

pub const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Default, Deserialize)]
pub struct StreamRequest {
    #[serde(default)]
    pub text: String,
}

/// Resume position: an explicit `cursor` wins, otherwise the chunk after
/// `Last-Event-ID`, otherwise the beginning.
pub fn start_index(cursor: Option<usize>, headers: &HeaderMap) -> usize {
    cursor
        .or_else(|| {
            header_value(headers, LAST_EVENT_ID)
                .and_then(|id| id.parse::<i64>().ok())
                .map(|id| id.max(0) as usize + 1)
        })
        .unwrap_or(0)
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub async fn sse_stream(
    State(state): State<AppState>,
    RequestId(trace_id): RequestId,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
    Json(request): Json<StreamRequest>,
) -> Response {
    let Some(guard) = state.registry.begin() else {
        return Problem::new(StatusCode::SERVICE_UNAVAILABLE, "Service is shutting down", trace_id)
            .into_response();
    };

    let start_at = start_index(params.cursor(), &headers);
    let replay = start_at > 0;
    let streamer = FactStreamer::new(
        state.pipeline.clone(),
        params.chunk_size(&state.config.stream),
    )
    .with_delay(params.delay(&state.config.stream));
    let mut chunks = streamer.stream(request.text, start_at);

    let events = stream! {
        let _guard = guard;
        yield Ok::<_, Infallible>(event("start", &json!({ "cursor": start_at, "replay": replay })));

        let mut sent = 0;
        let mut failed = false;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    sent += 1;
                    increment_chunks_sent(1);
                    let data = json!({ "id": chunk.index, "text": chunk.text, "replay": chunk.is_replay });
                    yield Ok(event("chunk", &data).id(chunk.index.to_string()));
                }
                Err(e) => {
                    increment_stream_errors();
                    #[cfg(feature = "tracing")]
                    tracing::warn!("stream producer failed: {e}");
                    failed = true;
                    yield Ok(event("error", &json!({ "message": e.to_string(), "replay": replay })));
                    break;
                }
            }
        }
        if !failed {
            yield Ok(event("end", &json!({ "cursor": start_at + sent, "replay": replay })));
        }
    };

    Sse::new(events.take_until(state.registry.cancelled()))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn event(name: &str, data: &Value) -> Event {
    Event::default().event(name).data(data.to_string())
}
