use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

use mgindb_client::{
    BackoffPolicy, ClientConfig, ConnectionState, MetricsSnapshot, MginClient, MginError,
    QueueMode, SubscriptionEvent,
};
use mgindb_common::WELCOME_LINE;

const USER: &str = "admin";
const PASS: &str = "secret";
const AUTH_FAILED: &str = "Authentication failed: Incorrect username or password.";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct MockServer {
    listener: TcpListener,
}

impl MockServer {
    async fn bind() -> (Self, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        (MockServer { listener }, format!("tcp://{addr}"))
    }

    async fn accept(&self) -> MockConn {
        let (stream, _) = self.listener.accept().await.expect("accept");
        let (read, writer) = stream.into_split();
        MockConn {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }
}

struct MockConn {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl MockConn {
    async fn read_line(&mut self) -> Option<String> {
        self.lines.next_line().await.ok().flatten()
    }

    async fn write_line(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write");
        self.writer.flush().await.expect("flush");
    }

    async fn write_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write");
        self.writer.flush().await.expect("flush");
    }

    async fn expect(&mut self, command: &str) {
        assert_eq!(self.read_line().await.as_deref(), Some(command));
    }

    async fn expect_auth(&mut self) {
        let line = self.read_line().await.expect("auth line");
        let auth: serde_json::Value = serde_json::from_str(&line).expect("auth json");
        assert_eq!(auth, json!({"username": USER, "password": PASS}));
    }

    async fn handshake(&mut self) {
        self.expect_auth().await;
        self.write_line(WELCOME_LINE).await;
    }
}

fn config(url: String) -> ClientConfig {
    ClientConfig::new(url)
        .with_credentials(USER, PASS)
        .with_connect_timeout(Duration::from_secs(2))
        .with_command_timeout(Some(Duration::from_secs(2)))
}

async fn wait_for_state(client: &MginClient, expected: ConnectionState) {
    let mut state = client.watch_state();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == expected))
        .await
        .expect("state change in time")
        .expect("state channel open");
}

async fn wait_for_metrics(client: &MginClient, done: impl Fn(&MetricsSnapshot) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !done(&client.metrics()) {
        assert!(Instant::now() < deadline, "metrics never settled: {:?}", client.metrics());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn set_then_query_returns_exact_bytes() {
    init_tracing();
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.expect("SET k v").await;
        conn.write_line("OK").await;
        conn.expect("QUERY k").await;
        conn.write_line(r#"{"k": "v"}  "#).await;
    });

    let client = MginClient::new(config(url)).expect("client");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.set("k", "v").await.expect("set"), "OK");
    assert!(client.is_ready());
    assert_eq!(
        client.query("k", None, None).await.expect("query"),
        r#"{"k": "v"}  "#
    );
    server.await.expect("server");

    let metrics = client.metrics();
    assert_eq!(metrics.requests_total, 2);
    assert_eq!(metrics.errors_total, 0);
    assert_eq!(metrics.connects_total, 1);
}

#[tokio::test]
async fn every_verb_reaches_the_wire() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        for expected in [
            "INCR hits 2",
            "DECR hits 1",
            "DEL hits",
            "QUERY users WHERE age > 30 ORDER BY age",
            "COUNT users",
            "INDICES LIST",
            "INDICES GET users name",
            "SCHEDULE SHOW ALL",
            "KEYS",
            "RENAME a TO b",
            "SUBLIST",
            "FLUSHALL",
        ] {
            conn.expect(expected).await;
            conn.write_line("OK").await;
        }
    });

    let client = MginClient::new(config(url)).expect("client");
    client.incr("hits", "2").await.expect("incr");
    client.decr("hits", "1").await.expect("decr");
    client.delete("hits").await.expect("delete");
    client
        .query("users", Some("WHERE age > 30"), Some("ORDER BY age"))
        .await
        .expect("query");
    client.count("users").await.expect("count");
    client.indices("LIST", None, None).await.expect("indices");
    client
        .indices("GET", Some("users"), Some("name"))
        .await
        .expect("indices");
    client.schedule("SHOW", Some("ALL"), None).await.expect("schedule");
    client.keys().await.expect("keys");
    client.rename("a", "b").await.expect("rename");
    client.sublist().await.expect("sublist");
    client.raw("FLUSHALL").await.expect("raw");
    server.await.expect("server");
}

#[tokio::test]
async fn concurrent_commands_complete_in_issue_order() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        let mut seen = Vec::new();
        for idx in 0..5 {
            let line = conn.read_line().await.expect("command");
            if idx == 0 {
                // Delay the first answer; later commands must not overtake it.
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            conn.write_line(&format!("reply:{line}")).await;
            seen.push(line);
        }
        seen
    });

    let client = MginClient::new(config(url)).expect("client");
    client.connect().await.expect("connect");

    let keys: Vec<String> = (0..5).map(|idx| format!("key{idx}")).collect();
    let calls = keys.iter().map(|key| {
        let client = client.clone();
        async move { client.count(key).await }
    });
    let results = join_all(calls).await;

    for (idx, result) in results.into_iter().enumerate() {
        assert_eq!(result.expect("count"), format!("reply:COUNT key{idx}"));
    }
    let seen = server.await.expect("server");
    let expected: Vec<String> = (0..5).map(|idx| format!("COUNT key{idx}")).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn push_while_pending_goes_to_listener() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.expect("SUB users:*").await;
        conn.write_line("OK").await;
        conn.expect("COUNT users").await;
        conn.write_line(r#"{"key": "users:7", "data": {"name": "Ada"}}"#)
            .await;
        conn.write_line("3").await;
    });

    let client = MginClient::new(config(url)).expect("client");
    let mut listener = client.listen("users:*");
    assert_eq!(client.sub("users:*").await.expect("sub"), "OK");
    assert_eq!(client.subscriptions(), vec!["users:*".to_string()]);

    assert_eq!(client.count("users").await.expect("count"), "3");

    let event = tokio::time::timeout(Duration::from_secs(1), listener.recv())
        .await
        .expect("push in time")
        .expect("listener open");
    match event {
        SubscriptionEvent::Push(push) => {
            assert_eq!(push.key, "users:7");
            assert_eq!(push.data, json!({"name": "Ada"}));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    server.await.expect("server");
    assert_eq!(client.metrics().pushes_delivered, 1);
}

#[tokio::test]
async fn push_after_unsub_is_dropped_quietly() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.expect("SUB k").await;
        conn.write_line("OK").await;
        conn.expect("UNSUB k").await;
        conn.write_line("OK").await;
        // Let the caller observe the acknowledgment before the late push lands.
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.write_line(r#"{"key": "k", "data": 1}"#).await;
        conn.expect("COUNT k").await;
        conn.write_line("1").await;
    });

    let client = MginClient::new(config(url)).expect("client");
    let mut listener = client.listen("k");
    client.sub("k").await.expect("sub");
    client.unsub("k").await.expect("unsub");
    assert!(client.subscriptions().is_empty());

    let deadline = Instant::now() + Duration::from_secs(1);
    while client.metrics().pushes_dropped == 0 {
        assert!(Instant::now() < deadline, "push was never processed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(client.count("k").await.expect("count"), "1");
    assert!(listener.try_recv().is_none());
    server.await.expect("server");
}

#[tokio::test]
async fn rejected_subscription_is_rolled_back() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.expect("SUB k").await;
        conn.write_line("ERROR: not allowed").await;
    });

    let client = MginClient::new(config(url)).expect("client");
    assert_eq!(client.sub("k").await.expect("sub"), "ERROR: not allowed");
    assert!(client.subscriptions().is_empty());
    server.await.expect("server");
}

#[tokio::test]
async fn wrong_credentials_fail_with_authentication_error() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.read_line().await.expect("auth line");
        conn.write_line(AUTH_FAILED).await;
    });

    let client = MginClient::new(config(url).with_credentials("admin", "wrong")).expect("client");
    let err = client.connect().await.expect_err("auth must fail");
    assert_eq!(err, MginError::Authentication(AUTH_FAILED.to_string()));
    assert!(!err.is_connection_fatal());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    server.await.expect("server");
}

#[tokio::test]
async fn drop_mid_flight_fails_then_explicit_reconnect_resumes() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut first = server.accept().await;
        first.handshake().await;
        first.expect("SET k v").await;
        drop(first);

        let mut second = server.accept().await;
        second.handshake().await;
        second.expect("SET k v").await;
        second.write_line("OK").await;
    });

    let client = MginClient::new(config(url).with_auto_reconnect(false)).expect("client");
    client.connect().await.expect("connect");
    let err = client.set("k", "v").await.expect_err("drop must fail");
    assert!(matches!(err, MginError::ConnectionLost(_)), "{err:?}");
    assert!(err.is_connection_fatal());
    wait_for_state(&client, ConnectionState::Disconnected).await;
    assert_eq!(
        client.set("k", "v").await.expect_err("not connected"),
        MginError::NotConnected
    );

    client.connect().await.expect("reconnect");
    assert_eq!(client.set("k", "v").await.expect("set"), "OK");
    server.await.expect("server");
}

#[tokio::test]
async fn timeout_desynchronizes_until_reconnected() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut first = server.accept().await;
        first.handshake().await;
        first.expect("COUNT k").await;
        // Never answer; the client must give up and close this socket.
        assert_eq!(first.read_line().await, None);

        let mut second = server.accept().await;
        second.handshake().await;
        second.expect("COUNT k").await;
        second.write_line("5").await;
    });

    let client = MginClient::new(
        config(url)
            .with_command_timeout(Some(Duration::from_secs(1)))
            .with_auto_reconnect(false),
    )
    .expect("client");
    client.connect().await.expect("connect");

    let started = Instant::now();
    let err = client.count("k").await.expect_err("must time out");
    let elapsed = started.elapsed();
    assert_eq!(err, MginError::Timeout(Duration::from_secs(1)));
    assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1800), "{elapsed:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        client.count("k").await.expect_err("refused"),
        MginError::NotConnected
    );

    client.connect().await.expect("reconnect");
    assert_eq!(client.count("k").await.expect("count"), "5");
    server.await.expect("server");
    assert_eq!(client.metrics().timeouts_total, 1);
}

#[tokio::test]
async fn timeout_reconnects_on_demand_before_next_command() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut first = server.accept().await;
        first.handshake().await;
        first.expect("COUNT slow").await;
        let mut second = server.accept().await;
        // The stale socket is closed before the next command is written.
        assert_eq!(first.read_line().await, None);
        second.handshake().await;
        second.expect("COUNT fast").await;
        second.write_line("1").await;
    });

    let client = MginClient::new(config(url)).expect("client");
    let err = client
        .execute_with_timeout(
            mgindb_client::Command::Count { key: "slow".into() },
            Duration::from_millis(200),
        )
        .await
        .expect_err("must time out");
    assert_eq!(err, MginError::Timeout(Duration::from_millis(200)));
    assert_eq!(client.count("fast").await.expect("count"), "1");
    server.await.expect("server");
    assert_eq!(client.metrics().connects_total, 2);
}

#[tokio::test]
async fn close_fails_pending_and_future_commands() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.expect("COUNT k").await;
        assert_eq!(conn.read_line().await, None);
    });

    let client = MginClient::new(config(url)).expect("client");
    client.connect().await.expect("connect");
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.count("k").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.close().await;
    assert_eq!(
        pending.await.expect("join").expect_err("closed"),
        MginError::ConnectionClosed
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        client.set("k", "v").await.expect_err("closed"),
        MginError::ConnectionClosed
    );
    server.await.expect("server");
}

#[tokio::test]
async fn fail_fast_mode_rejects_second_caller() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.expect("COUNT a").await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        conn.write_line("1").await;
    });

    let client =
        MginClient::new(config(url).with_queue_mode(QueueMode::FailFast)).expect("client");
    client.connect().await.expect("connect");
    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.count("a").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client.count("b").await.expect_err("busy");
    assert_eq!(err, MginError::ConcurrentRequest);
    assert!(err.is_request_failure());
    assert_eq!(first.await.expect("join").expect("count"), "1");
    server.await.expect("server");
}

#[tokio::test]
async fn server_close_notifies_listeners_and_clears_subscriptions() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.expect("SUB orders").await;
        conn.write_line("OK").await;
    });

    let client = MginClient::new(config(url)).expect("client");
    let mut listener = client.listen("orders");
    client.sub("orders").await.expect("sub");
    server.await.expect("server");

    let event = tokio::time::timeout(Duration::from_secs(2), listener.recv())
        .await
        .expect("event in time");
    assert_eq!(event, Some(SubscriptionEvent::ConnectionLost));
    assert!(client.subscriptions().is_empty());
    wait_for_state(&client, ConnectionState::Disconnected).await;
}

#[tokio::test]
async fn resubscribes_after_reconnect_when_enabled() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut first = server.accept().await;
        first.handshake().await;
        first.expect("SUB a").await;
        first.write_line("OK").await;
        drop(first);

        let mut second = server.accept().await;
        second.handshake().await;
        second.expect("SUB a").await;
        second.write_line("OK").await;
        second.write_line(r#"{"key": "a", "data": 2}"#).await;
        // Keep the socket open until the client is done.
        second.read_line().await;
    });

    let client = MginClient::new(config(url).with_resubscribe_on_reconnect(true)).expect("client");
    let mut listener = client.listen("a");
    client.sub("a").await.expect("sub");

    let lost = tokio::time::timeout(Duration::from_secs(2), listener.recv())
        .await
        .expect("lost in time");
    assert_eq!(lost, Some(SubscriptionEvent::ConnectionLost));

    client.connect().await.expect("reconnect");
    assert_eq!(client.subscriptions(), vec!["a".to_string()]);

    let event = tokio::time::timeout(Duration::from_secs(2), listener.recv())
        .await
        .expect("push in time");
    assert!(matches!(event, Some(SubscriptionEvent::Push(push)) if push.data == json!(2)));
    client.close().await;
    server.await.expect("server");
}

#[tokio::test]
async fn websocket_transport_roundtrip() {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::protocol::Message;

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws");

        let auth = ws.next().await.expect("auth").expect("auth frame");
        let auth: serde_json::Value =
            serde_json::from_str(auth.to_text().expect("text")).expect("auth json");
        assert_eq!(auth, json!({"username": USER, "password": PASS}));
        ws.send(Message::Text(WELCOME_LINE.into())).await.expect("welcome");

        let command = ws.next().await.expect("command").expect("command frame");
        assert_eq!(command.to_text().expect("text"), "SET greeting hello world");
        ws.send(Message::Text("OK".into())).await.expect("reply");
        let _ = ws.next().await;
    });

    let client = MginClient::new(config(format!("ws://{addr}"))).expect("client");
    assert_eq!(
        client.set("greeting", "hello world").await.expect("set"),
        "OK"
    );
    client.close().await;
    server.await.expect("server");
}

#[tokio::test]
async fn invalid_arguments_never_touch_the_socket() {
    let client = MginClient::new(config("tcp://127.0.0.1:9".to_string())).expect("client");
    assert!(matches!(
        client.set("", "v").await,
        Err(MginError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.set("k", "v\nDEL k").await,
        Err(MginError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.sub("two words").await,
        Err(MginError::InvalidArgument(_))
    ));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.metrics().requests_total, 0);
}

#[tokio::test]
async fn connect_with_backoff_gives_up_after_max_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = MginClient::new(config(format!("tcp://{addr}"))).expect("client");
    let policy = BackoffPolicy {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(20),
        jitter: Duration::ZERO,
        max_attempts: Some(3),
    };
    let err = client
        .connect_with_backoff(&policy)
        .await
        .expect_err("nothing listens");
    assert!(matches!(err, MginError::Transport(_)), "{err:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_with_backoff_does_not_retry_bad_credentials() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.read_line().await.expect("auth line");
        conn.write_line(AUTH_FAILED).await;
    });

    let client = MginClient::new(config(url)).expect("client");
    let err = client
        .connect_with_backoff(&BackoffPolicy::default())
        .await
        .expect_err("auth must fail");
    assert!(matches!(err, MginError::Authentication(_)));
    server.await.expect("server");
}

#[tokio::test]
async fn subscription_list_activates_each_key() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.expect("SUB a,b").await;
        conn.write_line("OK").await;
        conn.expect("COUNT x").await;
        conn.write_line(r#"{"key": "a", "data": 1}"#).await;
        conn.write_line("3").await;
        conn.expect("UNSUB a,b").await;
        conn.write_line("OK").await;
    });

    let client = MginClient::new(config(url)).expect("client");
    let mut listener = client.listen("a");
    assert_eq!(client.sub("a,b").await.expect("sub"), "OK");
    assert_eq!(client.subscriptions(), vec!["a".to_string(), "b".to_string()]);

    assert_eq!(client.count("x").await.expect("count"), "3");
    let event = tokio::time::timeout(Duration::from_secs(1), listener.recv())
        .await
        .expect("push in time");
    assert!(matches!(event, Some(SubscriptionEvent::Push(push)) if push.key == "a"));

    client.unsub("a,b").await.expect("unsub");
    assert!(client.subscriptions().is_empty());
    assert!(matches!(
        client.sub("a,,b").await,
        Err(MginError::InvalidArgument(_))
    ));
    server.await.expect("server");
}

#[tokio::test]
async fn resubscribe_keeps_keys_when_interrupted() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut first = server.accept().await;
        first.handshake().await;
        first.expect("SUB a").await;
        first.write_line("OK").await;
        first.expect("SUB b").await;
        first.write_line("OK").await;
        drop(first);

        // Drops while the first resubscription is in flight.
        let mut second = server.accept().await;
        second.handshake().await;
        second.expect("SUB a").await;
        drop(second);

        let mut third = server.accept().await;
        third.handshake().await;
        third.expect("SUB a").await;
        third.write_line("OK").await;
        third.expect("SUB b").await;
        third.write_line("OK").await;
        third.read_line().await;
    });

    let client = MginClient::new(config(url).with_resubscribe_on_reconnect(true)).expect("client");
    client.sub("a").await.expect("sub a");
    client.sub("b").await.expect("sub b");
    wait_for_state(&client, ConnectionState::Disconnected).await;

    let err = client.connect().await.expect_err("second session drops");
    assert!(err.is_connection_fatal(), "{err:?}");
    wait_for_state(&client, ConnectionState::Disconnected).await;
    assert!(client.subscriptions().is_empty());

    client.connect().await.expect("third session");
    assert_eq!(client.subscriptions(), vec!["a".to_string(), "b".to_string()]);
    client.close().await;
    server.await.expect("server");
}

#[tokio::test]
async fn stray_lines_leave_the_session_ready() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.write_line("stray text").await;
        conn.write_raw(b"\xff\xfe stray\n").await;
        conn.write_line(r#"{"key": "never", "data": 1}"#).await;
        conn.expect("COUNT k").await;
        conn.write_line("4").await;
    });

    let client = MginClient::new(config(url)).expect("client");
    client.connect().await.expect("connect");
    wait_for_metrics(&client, |m| m.unexpected_frames == 2 && m.pushes_dropped == 1).await;

    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(client.count("k").await.expect("count"), "4");
    let metrics = client.metrics();
    assert_eq!(metrics.connects_total, 1);
    assert_eq!(metrics.pushes_delivered, 0);
    server.await.expect("server");
}

#[tokio::test]
async fn malformed_response_fails_only_the_pending_request() {
    let (server, url) = MockServer::bind().await;
    let server = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.expect("COUNT a").await;
        conn.write_raw(b"\xff\xfe\n").await;
        conn.expect("COUNT b").await;
        conn.write_line(&"x".repeat(200)).await;
        conn.expect("COUNT c").await;
        conn.write_line("2").await;
    });

    let mut config = config(url);
    config.max_line_length = 64;
    let client = MginClient::new(config).expect("client");

    let err = client.count("a").await.expect_err("undecodable line");
    assert!(matches!(err, MginError::Protocol(_)), "{err:?}");
    assert!(err.is_request_failure());
    let err = client.count("b").await.expect_err("over-long line");
    assert!(matches!(err, MginError::Protocol(_)), "{err:?}");

    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(client.count("c").await.expect("count"), "2");
    assert_eq!(client.metrics().connects_total, 1);
    server.await.expect("server");
}
