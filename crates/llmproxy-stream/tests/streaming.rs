use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc;
use llmproxy_stream::body::from_chunks;
use llmproxy_stream::prelude::*;
use llmproxy_stream::{BoxError, ByteStream, CloseReason, SessionState};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

type BodySender = mpsc::UnboundedSender<Result<Bytes, BoxError>>;

fn channel_body() -> (BodySender, ByteStream) {
    let (tx, rx) = mpsc::unbounded();
    (tx, Box::pin(rx))
}

fn send(tx: &BodySender, chunk: &'static str) {
    tx.unbounded_send(Ok(Bytes::from_static(chunk.as_bytes())))
        .expect("body receiver alive");
}

#[derive(Debug, Deserialize, PartialEq)]
struct Draft {
    title: String,
}

#[tokio::test]
async fn sse_example_stream_decodes_to_three_events() {
    let mut session = StreamSession::new(
        from_chunks(vec![
            "event: message_start\ndata: {\"response_id\":\"r1\",\"model\":\"demo\"}\n\n",
            ": keep-alive\n\n",
            "event: message_delta\ndata: {\"delta\":{\"text\":\"Hello\"}}\n\n",
            "event: message_stop\ndata: {\"stop_reason\":\"end_turn\",\"usage\":{\"input_tokens\":1,\"output_tokens\":2,\"total_tokens\":3}}\n\n",
        ]),
        ChatFormat::Sse,
        SessionOptions::new("req-sse"),
    );

    let start = session.next().await.expect("start").expect("event");
    assert_eq!(start.kind, EventKind::MessageStart);
    assert_eq!(start.response_id, "r1");
    assert_eq!(start.model, "demo");

    let delta = session.next().await.expect("delta").expect("event");
    assert_eq!(delta.text_delta, "Hello");

    let stop = session.next().await.expect("stop").expect("event");
    assert_eq!(stop.kind, EventKind::MessageStop);
    assert_eq!(stop.usage.map(|u| u.total_tokens), Some(3));

    assert!(session.next().await.expect("eof").is_none());
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn ndjson_chat_collects_latest_text() {
    let session = StreamSession::new(
        from_chunks(vec![
            "{\"event\":\"message_start\",\"response_id\":\"r2\",\"model\":\"demo\"}\n",
            "{\"event\":\"message_delta\",\"data\":\"Hel\"}\n",
            "{\"event\":\"message_delta\",\"data\":\"Hello\"}\n",
            "{\"event\":\"message_stop\",\"stop_reason\":\"end_turn\"}",
        ]),
        ChatFormat::Ndjson,
        SessionOptions::new("req-nd"),
    );
    let response = session
        .collect(&CancellationToken::new())
        .await
        .expect("collect");
    assert_eq!(response.response_id, "r2");
    assert_eq!(response.text, "Hello");
    assert_eq!(response.stop_reason, "end_turn");
}

#[tokio::test]
async fn structured_collect_returns_completion_then_stream_ends() {
    let mut stream = StructuredStream::<Draft>::new(
        from_chunks(vec![
            "{\"type\":\"update\",\"payload\":{\"title\":\"Dr\"}}\n",
            "{\"type\":\"update\",\"payload\":{\"title\":\"Draf\"}}\n",
            "{\"type\":\"completion\",\"payload\":{\"title\":\"Draft\"},\"complete_fields\":[\"title\"]}\n",
        ]),
        SessionOptions::new("req-st"),
    );
    let mut updates = 0;
    let completion = loop {
        let event = stream.next().await.expect("next").expect("event");
        if event.is_completion() {
            break event;
        }
        updates += 1;
    };
    assert_eq!(updates, 2);
    assert_eq!(completion.payload, Draft { title: "Draft".into() });
    assert!(completion.is_field_complete("title"));
    assert!(stream.next().await.expect("after completion").is_none());

    let collected = StructuredStream::<Draft>::new(
        from_chunks(vec![
            "{\"type\":\"update\",\"payload\":{\"title\":\"Dr\"}}\n",
            "{\"type\":\"completion\",\"payload\":{\"title\":\"Draft\"}}\n",
        ]),
        SessionOptions::new("req-st2"),
    )
    .collect(&CancellationToken::new())
    .await
    .expect("collect");
    assert_eq!(collected.title, "Draft");
}

#[tokio::test]
async fn structured_eof_without_terminal_record_is_protocol_error() {
    let lines = vec!["{\"type\":\"update\",\"payload\":{\"title\":\"x\"}}\n"];

    let mut stream = StructuredStream::<Draft>::new(from_chunks(lines.clone()), SessionOptions::new("a"));
    assert!(stream.next().await.expect("update").is_some());
    let err = stream.next().await.expect_err("premature eof");
    assert!(err.is_protocol(), "{err}");

    let err = StructuredStream::<Draft>::new(from_chunks(lines), SessionOptions::new("b"))
        .collect(&CancellationToken::new())
        .await
        .expect_err("premature eof");
    assert!(err.is_protocol(), "{err}");
}

#[tokio::test]
async fn structured_empty_type_fails_immediately() {
    let mut stream = StructuredStream::<Draft>::new(
        from_chunks(vec![
            "{\"type\":\"\",\"payload\":{\"title\":\"x\"}}\n",
            "{\"type\":\"completion\",\"payload\":{\"title\":\"x\"}}\n",
        ]),
        SessionOptions::new("req-empty"),
    );
    let err = stream.next().await.expect_err("protocol");
    assert!(err.is_protocol(), "{err}");
    assert_eq!(err.request_id(), "req-empty");
    assert!(stream.next().await.expect("closed").is_none());
}

#[tokio::test]
async fn parent_cancel_unblocks_pending_read() {
    let (_tx, body) = channel_body();
    let cancel = CancellationToken::new();
    let mut session = StreamSession::new(
        body,
        ChatFormat::Sse,
        SessionOptions::new("req-cancel").cancel_token(cancel.clone()),
    );
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let result = tokio::time::timeout(Duration::from_millis(200), session.next())
        .await
        .expect("pull returned promptly after cancel");
    assert!(matches!(result, Err(StreamError::Cancelled { .. })));
    assert_eq!(session.close_reason(), Some(CloseReason::Cancelled));
}

#[tokio::test]
async fn double_close_is_safe() {
    let mut session = StreamSession::new(
        from_chunks(vec!["event: ping\n\n"]),
        ChatFormat::Sse,
        SessionOptions::new("req-close"),
    );
    assert!(session.next().await.expect("ping").is_some());
    session.close();
    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.next().await.expect("closed").is_none());

    let mut stream = StructuredStream::<Draft>::new(
        from_chunks(Vec::<&'static str>::new()),
        SessionOptions::new("req-close-2"),
    );
    stream.close();
    stream.close();
    assert!(stream.next().await.expect("closed").is_none());
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_fires_only_after_gap() {
    let (tx, body) = channel_body();
    let budgets = TimeoutBudgets::none().idle(Duration::from_millis(100));
    let mut session = StreamSession::new(
        body,
        ChatFormat::Sse,
        SessionOptions::new("req-idle").budgets(budgets),
    );

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        send(&tx, "event: message_delta\ndata: {\"delta\":\"x\"}\n\n");
        let event = session.next().await.expect("within budget").expect("event");
        assert_eq!(event.text_delta, "x");
    }

    let started = tokio::time::Instant::now();
    let err = session.next().await.expect_err("idle timeout");
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::Idle));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(session.close_reason(), Some(CloseReason::TimedOut));
    assert!(session.next().await.expect("closed").is_none());
}

#[tokio::test(start_paused = true)]
async fn ttft_timeout_ignores_non_content_frames() {
    let (tx, body) = channel_body();
    let budgets = TimeoutBudgets::none().ttft(Duration::from_millis(100));
    let mut session = StreamSession::new(
        body,
        ChatFormat::Sse,
        SessionOptions::new("req-ttft").budgets(budgets),
    );
    send(&tx, "event: ping\ndata: {}\n\n");
    assert_eq!(
        session.next().await.expect("ping").expect("event").kind,
        EventKind::Ping
    );
    let err = session.next().await.expect_err("ttft timeout");
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::Ttft));
}

#[tokio::test(start_paused = true)]
async fn timeout_releases_body_while_consumer_is_idle() {
    let (tx, body) = channel_body();
    let session = StreamSession::new(
        body,
        ChatFormat::Sse,
        SessionOptions::new("req-idle-close").budgets(TimeoutBudgets::none().ttft(Duration::from_millis(50))),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(tx.is_closed(), "body should be dropped by the timeout itself");
}

#[tokio::test]
async fn pre_cancelled_parent_reports_cancellation_first() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut stream = StructuredStream::<Draft>::new(
        from_chunks(vec!["{\"type\":\"completion\",\"payload\":{\"title\":\"x\"}}\n"]),
        SessionOptions::new("req-pre").cancel_token(cancel),
    );
    assert!(matches!(stream.next().await, Err(StreamError::Cancelled { .. })));
    assert!(stream.next().await.expect("closed").is_none());
}

#[tokio::test]
async fn abort_handle_from_another_task() {
    let (_tx, body) = channel_body();
    let mut stream =
        StructuredStream::<Draft>::new(body, SessionOptions::new("req-abort"));
    let handle = stream.abort_handle();
    let aborter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.abort();
        handle.is_closed()
    });
    let err = stream.next().await.expect_err("aborted");
    assert!(matches!(err, StreamError::Cancelled { .. }));
    assert!(aborter.await.expect("join"));
}
