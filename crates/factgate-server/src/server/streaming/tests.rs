use crate::server::{
    streaming::{
        StreamParams, clamp_chunk_size, delay_or_default,
        registry::StreamRegistry,
        session::{ConnectionTracker, SessionWindow},
        sse::start_index,
        ws::{Disconnect, WsRequest, serve_session},
    },
    testing::{config, state},
};
use axum::{
    extract::ws::{CloseFrame, Message},
    http::HeaderMap,
};
use core::{convert::Infallible, time::Duration};
use factgate::{Identity, RateQuota};
use futures::{StreamExt, channel::mpsc};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::time::Instant;

#[test]
fn start_index_prefers_cursor_then_last_event_id() {
    let mut headers = HeaderMap::new();
    assert_eq!(start_index(None, &headers), 0);

    headers.insert("last-event-id", "4".parse().unwrap());
    assert_eq!(start_index(None, &headers), 5);
    assert_eq!(start_index(Some(2), &headers), 2);

    headers.insert("last-event-id", "-3".parse().unwrap());
    assert_eq!(start_index(None, &headers), 1);

    headers.insert("last-event-id", "garbage".parse().unwrap());
    assert_eq!(start_index(None, &headers), 0);
}

#[test]
fn chunk_size_and_delay_fall_back_to_defaults() {
    let stream = config().stream;
    assert_eq!(clamp_chunk_size(None, &stream), 6);
    assert_eq!(clamp_chunk_size(Some(0), &stream), 1);
    assert_eq!(clamp_chunk_size(Some(10_000), &stream), 64);

    assert_eq!(delay_or_default(None, &stream), Duration::ZERO);
    assert_eq!(delay_or_default(Some(0.25), &stream), Duration::from_millis(250));
    assert_eq!(delay_or_default(Some(-1.0), &stream), Duration::ZERO);
    assert_eq!(delay_or_default(Some(f64::NAN), &stream), stream.token_delay);

    let params = StreamParams {
        chunk_size: Some(12),
        token_delay: Some(1.5),
        cursor: None,
    };
    assert_eq!(params.chunk_size(&stream), 12);
    assert_eq!(params.delay(&stream), Duration::from_millis(1500));
    assert_eq!(params.cursor(), None);

    let negative = StreamParams {
        chunk_size: Some(-4),
        token_delay: None,
        cursor: Some(-3),
    };
    assert_eq!(negative.chunk_size(&stream), 1);
    assert_eq!(negative.cursor(), Some(0));
}

#[test]
fn ws_messages_are_decoded_leniently() {
    assert_eq!(WsRequest::parse("plain words"), WsRequest {
        text: "plain words".to_owned(),
        cursor: 0,
        chunk_size: None,
        delay: None,
    });
    assert_eq!(
        WsRequest::parse(r#"{"text":"hi","cursor":3,"chunk_size":"8","delay":0.5}"#),
        WsRequest {
            text: "hi".to_owned(),
            cursor: 3,
            chunk_size: Some(8),
            delay: Some(0.5),
        }
    );
    assert_eq!(WsRequest::parse("42").text, "42");
    assert_eq!(WsRequest::parse(r#""quoted""#).text, "quoted");
    assert_eq!(WsRequest::parse(r#"{"text":null}"#).text, "");

    let odd = WsRequest::parse(r#"{"text":"x","cursor":-5,"chunk_size":0,"delay":"soon"}"#);
    assert_eq!(odd.cursor, 0);
    assert_eq!(odd.chunk_size, Some(1));
    assert_eq!(odd.delay, None);
}

#[tokio::test(start_paused = true)]
async fn session_window_limits_messages() {
    let mut window = SessionWindow::new(3, Duration::from_secs(60));
    assert_eq!(window.allow(), (true, 2));
    assert_eq!(window.allow(), (true, 1));
    assert_eq!(window.allow(), (true, 0));
    assert_eq!(window.allow(), (false, 0));

    tokio::time::advance(Duration::from_secs(20)).await;
    assert_eq!(window.retry_after(), 40);
    assert!(!window.allow().0);

    tokio::time::advance(Duration::from_secs(40)).await;
    assert_eq!(window.retry_after(), 0);
    assert_eq!(window.allow(), (true, 2));
}

#[tokio::test(start_paused = true)]
async fn session_window_retry_after_is_at_least_one_second() {
    let mut window = SessionWindow::new(1, Duration::from_secs(10));
    assert!(window.allow().0);
    tokio::time::advance(Duration::from_millis(9_900)).await;
    assert_eq!(window.retry_after(), 1);
}

#[test]
fn disabled_session_window_allows_everything() {
    let mut window = SessionWindow::new(0, Duration::from_secs(60));
    assert!((0..100).all(|_| window.allow().0));
    assert_eq!(window.retry_after(), 0);

    let mut window = SessionWindow::new(5, Duration::ZERO);
    assert!((0..100).all(|_| window.allow().0));
}

#[tokio::test(start_paused = true)]
async fn session_window_reset_forgets_history() {
    let mut window = SessionWindow::new(1, Duration::from_secs(60));
    assert!(window.allow().0);
    assert!(!window.allow().0);
    window.reset();
    assert!(window.allow().0);
}

#[test]
fn connection_tracker_caps_sessions_per_key() {
    let tracker = Arc::new(ConnectionTracker::default());
    let first = tracker.acquire("Key-A", 2).unwrap();
    let _second = tracker.acquire("key-a", 2).unwrap();
    assert_eq!(tracker.acquire("KEY-A", 2).unwrap_err(), 2);
    assert_eq!(tracker.active("key-a"), 2);

    // Other keys are independent.
    let _other = tracker.acquire("key-b", 2).unwrap();

    drop(first);
    assert_eq!(tracker.active("key-a"), 1);
    let _third = tracker.acquire("key-a", 2).unwrap();
}

#[test]
fn connection_tracker_zero_limit_is_unbounded() {
    let tracker = Arc::new(ConnectionTracker::default());
    let permits: Vec<_> = (0..50).map(|_| tracker.acquire("k", 0).unwrap()).collect();
    assert_eq!(tracker.active("k"), 50);
    drop(permits);
    assert_eq!(tracker.active("k"), 0);
}

#[tokio::test]
async fn registry_counts_running_streams() {
    let registry = Arc::new(StreamRegistry::new(Duration::from_secs(1)));
    let a = registry.begin().unwrap();
    let b = registry.begin().unwrap();
    assert_eq!(registry.inflight(), 2);
    drop(a);
    drop(b);
    assert_eq!(registry.inflight(), 0);
}

#[tokio::test(start_paused = true)]
async fn registry_shutdown_waits_for_streams_to_drain() {
    let registry = Arc::new(StreamRegistry::new(Duration::from_secs(5)));
    let guard = registry.begin().unwrap();

    let started = Instant::now();
    let shutdown = tokio::spawn({
        let registry = Arc::clone(&registry);
        async move { registry.shutdown().await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(registry.is_shutting_down());
    assert!(registry.begin().is_none());
    assert!(!shutdown.is_finished());

    drop(guard);
    shutdown.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    registry.cancelled().await;
}

#[tokio::test(start_paused = true)]
async fn registry_shutdown_cancels_streams_after_timeout() {
    let registry = Arc::new(StreamRegistry::new(Duration::from_secs(3)));
    let _stuck = registry.begin().unwrap();
    let cancelled = registry.cancelled();

    let started = Instant::now();
    registry.shutdown().await;
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(registry.inflight(), 1);
    cancelled.await;
}

fn identity() -> Identity {
    Identity::new("key-a", "anon", "anon")
}

fn text(frame: Value) -> Result<Message, Infallible> {
    Ok(Message::Text(frame.to_string().into()))
}

/// Whether `message` is the last frame sent for one request.
fn answers_request(message: &Message) -> bool {
    match message {
        Message::Text(text) => {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            frame["event"] == "end" || frame["event"] == "error"
        }
        _ => false,
    }
}

/// Feeds `inbound` to a session, hangs up once every message has been
/// answered and returns the exit reason with every frame sent back.
async fn drive(
    state: crate::server::service::handler::AppState,
    api_key: Option<&str>,
    inbound: Vec<Result<Message, Infallible>>,
) -> (Disconnect, Vec<Message>) {
    let (in_tx, in_rx) = mpsc::unbounded();
    let (out_tx, mut out_rx) = mpsc::unbounded::<Message>();
    let expected = inbound.len();
    for message in inbound {
        in_tx.unbounded_send(message).unwrap();
    }

    let session = serve_session(state, api_key.map(str::to_owned), identity(), out_tx, in_rx);
    let client = async move {
        let mut in_tx = Some(in_tx);
        if expected == 0 {
            in_tx.take();
        }
        let mut answered = 0;
        let mut sent = Vec::new();
        while let Some(message) = out_rx.next().await {
            if answers_request(&message) {
                answered += 1;
                if answered == expected {
                    in_tx.take();
                }
            }
            sent.push(message);
        }
        sent
    };
    tokio::join!(session, client)
}

fn json_frames(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::Text(text) => Some(serde_json::from_str(text.as_str()).unwrap()),
            _ => None,
        })
        .collect()
}

fn close_code(messages: &[Message]) -> Option<u16> {
    messages.iter().find_map(|m| match m {
        Message::Close(Some(CloseFrame { code, .. })) => Some(*code),
        _ => None,
    })
}

fn events(frames: &[Value]) -> Vec<&str> {
    frames.iter().map(|f| f["event"].as_str().unwrap()).collect()
}

#[tokio::test]
async fn ws_requires_an_api_key() {
    let (reason, sent) = drive(state(config()), None, vec![text(json!({ "text": "hi" }))]).await;
    assert_eq!(reason, Disconnect::MissingKey);
    assert_eq!(close_code(&sent), Some(4401));
    assert!(json_frames(&sent).is_empty());
}

#[tokio::test]
async fn ws_caps_parallel_sessions_per_key() {
    let state = state(config());
    let _held = state.connections.acquire("KEY-A", 1).unwrap();
    let (reason, sent) = drive(state.clone(), Some("key-a"), vec![]).await;
    assert_eq!(reason, Disconnect::TooManyConnections);
    assert_eq!(close_code(&sent), Some(4429));
    assert_eq!(state.connections.active("key-a"), 1);
}

#[tokio::test]
async fn ws_streams_one_sequence_per_message() {
    let state = state(config());
    let (reason, sent) = drive(state.clone(), Some("key-a"), vec![
        text(json!({ "text": "alpha beta gamma", "chunk_size": 6 })),
        Ok(Message::Text("alpha beta gamma".into())),
    ])
    .await;
    assert_eq!(reason, Disconnect::ClientClosed);
    assert_eq!(close_code(&sent), None);

    let frames = json_frames(&sent);
    assert_eq!(events(&frames), [
        "start", "chunk", "chunk", "chunk", "end", "start", "chunk", "chunk", "chunk", "end"
    ]);
    assert_eq!(frames[0], json!({ "event": "start", "cursor": 0, "replay": false }));
    assert_eq!(
        frames[1],
        json!({ "event": "chunk", "id": 0, "text": "alpha ", "replay": false })
    );
    assert_eq!(frames[3]["text"], "gamma.");
    assert_eq!(frames[4], json!({ "event": "end", "cursor": 3, "replay": false }));
    // The session released its slot.
    assert_eq!(state.connections.active("key-a"), 0);
}

#[tokio::test]
async fn ws_resumes_from_cursor() {
    let (_, sent) = drive(state(config()), Some("key-a"), vec![text(
        json!({ "text": "alpha beta gamma delta", "chunk_size": 6, "cursor": 2 }),
    )])
    .await;
    let frames = json_frames(&sent);
    assert_eq!(frames[0], json!({ "event": "start", "cursor": 2, "replay": true }));
    assert_eq!(
        frames
            .iter()
            .filter(|f| f["event"] == "chunk")
            .map(|f| (f["id"].as_u64().unwrap(), f["text"].as_str().unwrap()))
            .collect::<Vec<_>>(),
        [(2, "gamma "), (3, "delta.")]
    );
    assert_eq!(
        frames.last().unwrap(),
        &json!({ "event": "end", "cursor": 4, "replay": true })
    );
}

#[tokio::test]
async fn ws_empty_query_keeps_session_open() {
    let (reason, sent) = drive(state(config()), Some("key-a"), vec![
        text(json!({ "text": "  " })),
        text(json!({ "text": "still here" })),
    ])
    .await;
    assert_eq!(reason, Disconnect::ClientClosed);
    let frames = json_frames(&sent);
    assert_eq!(
        frames[0],
        json!({ "event": "error", "message": "Query must not be empty", "replay": false })
    );
    assert_eq!(events(&frames)[1], "start");
    assert_eq!(events(&frames).last(), Some(&"end"));
}

#[tokio::test]
async fn ws_quota_rejection_keeps_session_open() {
    let (reason, sent) = drive(state(config()), Some("key-a"), vec![
        text(json!({ "text": "one" })),
        text(json!({ "text": "two" })),
        text(json!({ "text": "three" })),
    ])
    .await;
    assert_eq!(reason, Disconnect::ClientClosed);
    assert_eq!(close_code(&sent), None);

    let frames = json_frames(&sent);
    let errors: Vec<&Value> = frames.iter().filter(|f| f["event"] == "error").collect();
    assert_eq!(errors, [&json!({
        "event": "error",
        "message": "Rate limit exceeded",
        "replay": false,
        "retry_after": 1,
    })]);
    assert_eq!(frames.iter().filter(|f| f["event"] == "end").count(), 2);
}

#[tokio::test]
async fn ws_session_window_violation_closes_session() {
    let mut config = config();
    config.limiter.api = RateQuota::new(100, 1.0).unwrap();
    let (reason, sent) = drive(state(config), Some("key-a"), vec![
        text(json!({ "text": "one" })),
        text(json!({ "text": "two" })),
        text(json!({ "text": "three" })),
        text(json!({ "text": "four" })),
        text(json!({ "text": "never answered" })),
    ])
    .await;
    assert_eq!(reason, Disconnect::RateLimited);
    assert_eq!(close_code(&sent), Some(4429));

    let frames = json_frames(&sent);
    assert_eq!(frames.iter().filter(|f| f["event"] == "end").count(), 3);
    let last = frames.last().unwrap();
    assert_eq!(last["event"], "error");
    assert_eq!(last["message"], "Rate limit exceeded");
    assert_eq!(last["retry_after"], 60);
}

#[tokio::test]
async fn ws_session_closes_on_shutdown() {
    let state = state(config());
    state.registry.shutdown().await;

    let (in_tx, in_rx) = mpsc::unbounded::<Result<Message, Infallible>>();
    let (out_tx, out_rx) = mpsc::unbounded::<Message>();
    let reason = serve_session(state, Some("key-a".to_owned()), identity(), out_tx, in_rx).await;
    drop(in_tx);

    assert_eq!(reason, Disconnect::Shutdown);
    let sent: Vec<Message> = out_rx.collect().await;
    assert_eq!(close_code(&sent), Some(1001));
}

#[tokio::test(start_paused = true)]
async fn ws_client_close_stops_a_running_stream() {
    let state = state(config());
    let (in_tx, in_rx) = mpsc::unbounded();
    let (out_tx, mut out_rx) = mpsc::unbounded::<Message>();
    let words = vec!["w"; 20].join(" ");
    in_tx
        .unbounded_send(text(json!({ "text": words, "chunk_size": 1, "delay": 1.0 })))
        .unwrap();

    let session = serve_session(state.clone(), Some("key-a".to_owned()), identity(), out_tx, in_rx);
    let client = async move {
        // The start frame and the first chunk.
        let mut sent = vec![out_rx.next().await.unwrap(), out_rx.next().await.unwrap()];
        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        sent.extend(out_rx.collect::<Vec<_>>().await);
        sent
    };

    let started = Instant::now();
    let (reason, sent) = tokio::join!(session, client);
    assert_eq!(reason, Disconnect::ClientClosed);
    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());

    let frames = json_frames(&sent);
    assert_eq!(frames.iter().filter(|f| f["event"] == "chunk").count(), 1);
    assert!(!events(&frames).contains(&"end"));
    assert_eq!(state.registry.inflight(), 0);
    assert_eq!(state.connections.active("key-a"), 0);
}

#[tokio::test]
async fn ws_requests_sent_mid_stream_are_answered_in_order() {
    let mut config = config();
    config.limiter.api = RateQuota::new(100, 1.0).unwrap();
    let (reason, sent) = drive(state(config), Some("key-a"), vec![
        text(json!({ "text": "first request here", "chunk_size": 6 })),
        text(json!({ "text": "second" })),
        text(json!({ "text": "third" })),
    ])
    .await;
    assert_eq!(reason, Disconnect::ClientClosed);

    let frames = json_frames(&sent);
    let texts: Vec<String> = frames
        .split(|f| f["event"] == "end")
        .filter(|run| !run.is_empty())
        .map(|run| {
            run.iter()
                .filter(|f| f["event"] == "chunk")
                .map(|f| f["text"].as_str().unwrap())
                .collect()
        })
        .collect();
    assert_eq!(texts, ["first request here.", "second.", "third."]);
}
