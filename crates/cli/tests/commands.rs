#![forbid(unsafe_code)]

use config::Config;
use portapi::{Client, channel};
use portwatch::cli::Command;
use portwatch::commands;
use portwatch::error::Error;
use portwatch::signals::SignalEvent;
use pretty_assertions::assert_eq;

fn output(out: Vec<u8>) -> String {
    String::from_utf8(out).unwrap()
}

#[tokio::test]
async fn get_prints_pretty_json() {
    let (transport, peer) = channel();
    let client = Client::new(transport);
    peer.send(r#"1|ok|core:a|J{"Name":"a"}"#);

    let mut out = Vec::new();
    commands::get(&client, "core:a", &mut out).await.unwrap();
    assert_eq!(output(out), "{\n  \"Name\": \"a\"\n}\n");
}

#[tokio::test]
async fn get_reports_remote_errors() {
    let (transport, peer) = channel();
    let client = Client::new(transport);
    peer.send("1|error|not found");

    let mut out = Vec::new();
    let err = commands::get(&client, "core:missing", &mut out)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Api(portapi::Error::Remote(message)) if message == "not found"));
    assert!(out.is_empty());
}

#[tokio::test]
async fn query_prints_one_line_per_record() {
    let (transport, peer) = channel();
    let client = Client::new(transport);
    peer.send(r#"1|ok|core:a|J{"x":1}"#);
    peer.send("1|ok|core:b|plain");
    peer.send("1|done");

    let mut out = Vec::new();
    let (_tx, signals) = flume::bounded::<SignalEvent>(1);
    commands::run(
        &client,
        Command::Query {
            query: "core:".into(),
        },
        &Config::default(),
        &signals,
        &mut out,
    )
    .await
    .unwrap();
    assert_eq!(output(out), "core:a {\"x\":1}\ncore:b plain\n");
}

#[tokio::test]
async fn watch_stops_on_shutdown_and_dumps_requests() {
    let (transport, peer) = channel();
    let client = Client::new(transport);
    peer.send(r#"1|ok|core:a|J{"x":1}"#);
    peer.send("1|done");

    let (tx, signals) = flume::unbounded();
    let mut out = Vec::new();
    {
        let run = commands::watch(
            &client,
            "core:",
            Config::default().retry,
            &signals,
            &mut out,
        );
        tokio::pin!(run);

        // Let the replay arrive before asking for a dump and stopping.
        tokio::select! {
            biased;
            _ = &mut run => panic!("watch ended early"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }
        tx.send(SignalEvent::SigUSR2).unwrap();
        tx.send(SignalEvent::Shutdown).unwrap();
        run.await.unwrap();
    }

    let text = output(out);
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines[0], "--- 1 records");
    assert_eq!(lines[1], "core:a {\"x\":1}");
    assert_eq!(lines[2], "--- 1 open requests");
    assert!(lines[3].contains("qsub"));
    assert!(lines[3].ends_with("last_key=core:a"));
}
