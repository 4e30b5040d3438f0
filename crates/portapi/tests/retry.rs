#![forbid(unsafe_code)]

use config::RetryPolicy;
use portapi::{
    Client, DataKind, Error, Event, Request, RequestKind, RequestOptions, RetryingSubscription,
    channel,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn policy(max_retries: Option<u32>) -> RetryPolicy {
    RetryPolicy {
        delay: Duration::from_millis(100),
        max_retries,
        ignore_new: false,
    }
}

fn qsub(query: &str) -> Request {
    Request::QuerySubscribe {
        query: query.into(),
    }
}

#[tokio::test(start_paused = true)]
async fn resubscribes_after_error_until_policy_gives_up() {
    let (transport, peer) = channel();
    let client = Client::new(transport);
    let mut stream = RetryingSubscription::new(
        client,
        qsub("network:"),
        RequestOptions { forward_done: true },
        policy(Some(1)),
    )
    .unwrap();

    let script = tokio::spawn(async move {
        assert_eq!(peer.recv().await.as_deref(), Some("1|qsub|query network:"));
        peer.send(r#"1|ok|network:a|J{}"#);
        peer.send(r#"1|ok|network:b|J{}"#);
        peer.send("1|done");
        peer.send("1|error|boom");
        assert_eq!(peer.recv().await.as_deref(), Some("2|qsub|query network:"));
        peer.send("2|error|again");
        peer
    });

    let mut seen = Vec::new();
    let mut failure = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(Event::Data(reply)) => seen.push(reply.key),
            Ok(Event::Done) => seen.push("done".into()),
            Err(err) => failure = Some(err),
        }
    }
    let _peer = script.await.unwrap();

    assert_eq!(seen, ["network:a", "network:b", "done"]);
    assert!(matches!(failure, Some(Error::Remote(message)) if message == "again"));
    assert_eq!(stream.generation(), 1);
}

#[tokio::test(start_paused = true)]
async fn waits_the_configured_delay() {
    let (transport, peer) = channel();
    let client = Client::new(transport);
    let mut stream =
        RetryingSubscription::new(client, qsub("a:"), RequestOptions::default(), policy(None))
            .unwrap();

    let started = tokio::time::Instant::now();
    let script = tokio::spawn(async move {
        peer.recv().await;
        peer.send("1|error|boom");
        assert_eq!(peer.recv().await.as_deref(), Some("2|qsub|query a:"));
        peer.send(r#"2|ok|a:x|J{}"#);
        peer
    });

    let event = stream.next().await.unwrap().unwrap();
    let _peer = script.await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(matches!(event, Event::Data(reply) if reply.key == "a:x"));
    assert_eq!(stream.request_id(), Some("2"));
}

#[tokio::test(start_paused = true)]
async fn interrupted_polls_keep_the_delay_running() {
    let (transport, peer) = channel();
    let client = Client::new(transport);
    let mut stream =
        RetryingSubscription::new(client, qsub("a:"), RequestOptions::default(), policy(None))
            .unwrap();
    assert_eq!(peer.recv().await.as_deref(), Some("1|qsub|query a:"));
    peer.send("1|error|boom");

    // Poll in slices shorter than the delay, as a select loop does.
    for _ in 0..5 {
        let slice = tokio::time::timeout(Duration::from_millis(30), stream.next()).await;
        assert!(slice.is_err());
    }

    let resubscribed = tokio::time::timeout(Duration::from_millis(10), peer.recv()).await;
    assert_eq!(resubscribed.unwrap().as_deref(), Some("2|qsub|query a:"));
    assert_eq!(stream.generation(), 1);
}

#[tokio::test(start_paused = true)]
async fn ignore_new_drops_new_notifications() {
    let (transport, peer) = channel();
    let client = Client::new(transport);
    let mut stream = RetryingSubscription::new(
        client,
        qsub("a:"),
        RequestOptions::default(),
        RetryPolicy {
            ignore_new: true,
            ..policy(None)
        },
    )
    .unwrap();

    peer.send(r#"1|new|a:x|J{}"#);
    peer.send(r#"1|upd|a:y|J{}"#);

    let Some(Ok(Event::Data(reply))) = stream.next().await else {
        panic!("expected data");
    };
    assert_eq!((reply.kind, reply.key.as_str()), (DataKind::Update, "a:y"));
}

#[tokio::test]
async fn only_subscriptions_are_retryable() {
    let (transport, _peer) = channel();
    let client = Client::new(transport);

    let err = RetryingSubscription::new(
        client,
        Request::Get { key: "a".into() },
        RequestOptions::default(),
        policy(None),
    )
    .unwrap_err();
    assert!(matches!(err, Error::NotRetryable(RequestKind::Get)));
}

#[tokio::test(start_paused = true)]
async fn closed_client_ends_the_stream() {
    let (transport, peer) = channel();
    let client = Client::new(transport);
    let mut stream =
        RetryingSubscription::new(client, qsub("a:"), RequestOptions::default(), policy(None))
            .unwrap();

    drop(peer);
    assert!(stream.next().await.is_none());
    assert!(stream.next().await.is_none());
}
