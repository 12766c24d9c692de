// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use http_poller::{
    BoundedQueue, Connector, FailureClass, HttpConnector, PollError, PollLoop, PollerConfig,
    Session,
};
use mockito::{Matcher, Server};
use serde_json::json;
use std::collections::BTreeMap;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn session_sends_static_headers_and_basic_auth() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", Matcher::Regex("^/events".to_string()))
        .match_query(Matcher::UrlEncoded("since".to_string(), "5".to_string()))
        .match_header("x-api-key", "secret")
        .match_header("authorization", "Basic dXNlcjpwYXNz")
        .match_header("x-logstash-avg-queue-secs", "0")
        .with_status(200)
        .with_header("X-More-Events-Available", "true")
        .with_body("hello")
        .create_async()
        .await;

    let config = PollerConfig {
        user: Some("user".to_string()),
        password: Some("pass".to_string()),
        headers: BTreeMap::from([("X-Api-Key".to_string(), "secret".to_string())]),
        ..PollerConfig::new(format!("{}/events?since=5", server.url()))
    };
    let connector = HttpConnector::from_config(&config).expect("valid config");
    let mut session = connector.connect().await.expect("connect");

    let path = connector.endpoint().path_and_query();
    let response = session
        .send(
            &path,
            &[("X-Logstash-Avg-Queue-Secs".to_string(), "0".to_string())],
        )
        .await
        .expect("send");

    mock.assert_async().await;
    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("X-More-Events-Available"), Some("true"));
    assert_eq!(response.body.as_deref(), Some(&b"hello"[..]));
}

#[tokio::test]
async fn session_reports_missing_body_as_none() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/")
        .with_status(204)
        .create_async()
        .await;

    let connector =
        HttpConnector::from_config(&PollerConfig::new(server.url())).expect("valid config");
    let mut session = connector.connect().await.expect("connect");
    let response = session.send("/", &[]).await.expect("send");

    assert_eq!(response.status, 204);
    assert!(response.body.is_none());
}

#[tokio::test]
async fn connect_fails_for_unresolvable_host() {
    let config = PollerConfig::new("http://poller-target.invalid/events");
    let connector = HttpConnector::from_config(&config).expect("valid config");

    let err = connector.connect().await.expect_err("host must not resolve");

    assert!(matches!(err, PollError::Connection(_)));
    assert_eq!(err.class(), FailureClass::Unexpected);
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}

#[tokio::test]
async fn connect_to_closed_port_is_a_connection_error() {
    let config = PollerConfig::new(format!("http://127.0.0.1:{}/", closed_port()));
    let connector = HttpConnector::from_config(&config).expect("valid config");

    let err = connector.connect().await.expect_err("nothing listens");

    assert!(matches!(err, PollError::Connection(_)), "{err:?}");
    assert_eq!(err.class(), FailureClass::Unexpected);
}

#[tokio::test]
async fn send_after_listener_closes_is_a_connection_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let config = PollerConfig::new(format!("http://127.0.0.1:{port}/"));
    let connector = HttpConnector::from_config(&config).expect("valid config");
    let mut session = connector.connect().await.expect("listener is up");
    drop(listener);

    let err = session.send("/", &[]).await.expect_err("nothing listens");

    assert!(matches!(err, PollError::Connection(_)), "{err:?}");
    assert_eq!(err.class(), FailureClass::Unexpected);
}

#[tokio::test]
async fn poller_acknowledges_batch_on_next_request() {
    let mut server = Server::new_async().await;
    let first = server
        .mock("GET", "/events")
        .match_header("x-successful-batch-ids", Matcher::Missing)
        .match_header("x-logstash-num-events", Matcher::Missing)
        .with_status(200)
        .with_header("X-Messages-Batch-Id", "abc")
        .with_header("X-More-Events-Available", "true")
        .with_body(r#"[{"n":1},{"n":2}]"#)
        .expect(1)
        .create_async()
        .await;
    let second = server
        .mock("GET", "/events")
        .match_header("x-successful-batch-ids", "abc")
        .match_header("x-logstash-num-events", "2")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let config = PollerConfig {
        interval: Duration::from_secs(3600),
        tags: vec!["polled".to_string()],
        ..PollerConfig::new(format!("{}/events", server.url()))
    };
    let connector = HttpConnector::from_config(&config).expect("valid config");
    let (queue, mut receiver) = BoundedQueue::new(config.queue_capacity);
    let cancel = CancellationToken::new();
    let poller = tokio::spawn(PollLoop::new(&config, connector, queue).run(cancel.clone()));

    let acknowledged = timeout(Duration::from_secs(5), async {
        while !second.matched_async().await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    cancel.cancel();

    assert!(acknowledged.is_ok(), "timed out waiting for the acknowledgement");
    poller.await.expect("poller task").expect("clean shutdown");
    first.assert_async().await;
    second.assert_async().await;

    for n in 1..=2 {
        let record = receiver.recv().await.expect("queued record");
        assert_eq!(record.get("n"), Some(&json!(n)));
        assert_eq!(record.get("tags"), Some(&json!(["polled"])));
        assert!(record.get("@timestamp").is_some());
        let metadata = record.get("http_response").expect("metadata");
        assert_eq!(metadata["code"], json!(200));
        assert!(metadata["elapsed_time"].is_number());
    }
    assert!(receiver.recv().await.is_none());
}
