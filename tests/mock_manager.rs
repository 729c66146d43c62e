//! Client behaviour against a scripted manager server on loopback.

use asterisk_manager_tokio::auth::challenge_digest;
use asterisk_manager_tokio::{
    AmiError, AsteriskVersion, ConnectionState, DisconnectReason, ManagerAction, ManagerConfig,
    ManagerConnection, ManagerEvent, ReconnectPolicy,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

const SECRET: &str = "secret";
const NONCE: &str = "328614950";
const BANNER: &str = "Asterisk Call Manager/5.0.1";

type Action = HashMap<String, String>;

struct MockSession {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl MockSession {
    /// Next action, keys lowercased. Repeated keys are joined with '\n'.
    async fn read_action(&mut self) -> Option<Action> {
        let mut fields = Action::new();
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .ok()??;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                if fields.is_empty() {
                    continue;
                }
                return Some(fields);
            }
            if let Some((key, value)) = line.split_once(':') {
                fields
                    .entry(key.trim().to_ascii_lowercase())
                    .and_modify(|v: &mut String| {
                        v.push('\n');
                        v.push_str(value.trim());
                    })
                    .or_insert_with(|| value.trim().to_string());
            }
        }
    }

    async fn expect_action(&mut self, name: &str) -> Action {
        let action = self
            .read_action()
            .await
            .expect("client closed the connection");
        assert_eq!(action["action"], name, "unexpected action {:?}", action);
        action
    }

    async fn send(&mut self, text: &str) {
        self.writer
            .write_all(text.as_bytes())
            .await
            .unwrap();
    }

    async fn reply(&mut self, action: &Action, extra: &[&str]) {
        let mut text = format!("Response: Success\r\nActionID: {}\r\n", action["actionid"]);
        for line in extra {
            text.push_str(line);
            text.push_str("\r\n");
        }
        text.push_str("\r\n");
        self.send(&text)
            .await;
    }

    /// Banner, MD5 challenge, login and version probe.
    async fn handshake(&mut self) {
        self.send(&format!("{}\r\n", BANNER))
            .await;

        let challenge = self
            .expect_action("Challenge")
            .await;
        assert_eq!(challenge["authtype"], "MD5");
        self.reply(&challenge, &[&format!("Challenge: {}", NONCE)])
            .await;

        let login = self
            .expect_action("Login")
            .await;
        assert_eq!(login["username"], "admin");
        assert_eq!(login["key"], challenge_digest(NONCE, SECRET));
        assert!(!login.contains_key("secret"));
        self.reply(&login, &["Message: Authentication accepted"])
            .await;

        let probe = self
            .expect_action("Command")
            .await;
        assert_eq!(probe["command"], "core show version");
        self.send(&format!(
            "Response: Follows\r\nPrivilege: Command\r\nActionID: {}\r\nAsterisk 18.2.0 built by mock\r\n--END COMMAND--\r\n\r\n",
            probe["actionid"]
        ))
        .await;
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn listen() -> (TcpListener, u16) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let port = listener
        .local_addr()
        .unwrap()
        .port();
    (listener, port)
}

async fn accept(listener: &TcpListener) -> MockSession {
    let (stream, _) = listener
        .accept()
        .await
        .unwrap();
    let (read, writer) = stream.into_split();
    MockSession {
        lines: BufReader::new(read).lines(),
        writer,
    }
}

fn config(port: u16) -> ManagerConfig {
    let mut config = ManagerConfig::new("127.0.0.1", "admin", SECRET)
        .with_port(port)
        .with_reconnect(ReconnectPolicy::disabled());
    config.keepalive_interval_ms = 0;
    config.login_timeout_ms = 2000;
    config.default_response_timeout_ms = 1000;
    config.poll_interval_ms = 20;
    config
}

/// Logged-in client plus the server side of its session.
async fn connected(config: ManagerConfig, listener: &TcpListener) -> (ManagerConnection, MockSession) {
    let (manager, _events) = ManagerConnection::new(config);
    let (login, session) = tokio::join!(manager.login(), async {
        let mut session = accept(listener).await;
        session
            .handshake()
            .await;
        session
    });
    login.unwrap();
    (manager, session)
}

fn event_log(manager: &ManagerConnection, kind: Option<&str>) -> mpsc::UnboundedReceiver<ManagerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    manager.add_event_listener(kind, move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> ManagerEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event within 2s")
        .expect("listener dropped")
}

async fn wait_for_state(manager: &ManagerConnection, pred: impl Fn(&ConnectionState) -> bool) -> ConnectionState {
    let mut watch = manager.status_watch();
    let state = timeout(Duration::from_secs(5), watch.wait_for(|s| pred(s)))
        .await
        .expect("state not reached within 5s")
        .unwrap()
        .clone();
    state
}

#[tokio::test]
async fn login_handshake_detects_version() {
    let (listener, port) = listen().await;
    let (manager, _events) = ManagerConnection::new(config(port));
    let mut connects = event_log(&manager, Some("Connect"));

    let (login, _session) = tokio::join!(manager.login(), async {
        let mut session = accept(&listener).await;
        session
            .handshake()
            .await;
        session
    });
    login.unwrap();

    assert!(manager.is_connected());
    assert_eq!(manager.version(), Some(AsteriskVersion::new(18, 2, 0)));
    assert_eq!(manager.protocol_identifier().as_deref(), Some(BANNER));

    let connect = next_event(&mut connects).await;
    assert!(connect.is_connection_state());
    assert_eq!(connect.text("protocolidentifier"), Some(BANNER));

    assert!(matches!(
        manager
            .login()
            .await,
        Err(AmiError::AlreadyConnected)
    ));
}

#[tokio::test]
async fn rejected_login_leaves_client_disconnected() {
    let (listener, port) = listen().await;
    let (manager, _events) = ManagerConnection::new(config(port));

    let server = async {
        let mut session = accept(&listener).await;
        session
            .send(&format!("{}\r\n", BANNER))
            .await;
        let challenge = session
            .expect_action("Challenge")
            .await;
        session
            .reply(&challenge, &[&format!("Challenge: {}", NONCE)])
            .await;
        let login = session
            .expect_action("Login")
            .await;
        session
            .send(&format!(
                "Response: Error\r\nActionID: {}\r\nMessage: Authentication failed\r\n\r\n",
                login["actionid"]
            ))
            .await;
    };
    let (login, ()) = tokio::join!(manager.login(), server);

    match login {
        Err(AmiError::AuthenticationFailed { message }) => {
            assert_eq!(message, "Authentication failed")
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(manager.status(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn response_carries_only_the_caller_action_id() {
    let (listener, port) = listen().await;
    let (manager, mut session) = connected(config(port), &listener).await;

    let server = async {
        let ping = session
            .expect_action("Ping")
            .await;
        let (internal, caller) = ping["actionid"]
            .split_once('#')
            .unwrap();
        assert!(!internal.is_empty());
        assert_eq!(caller, "mine");
        session
            .reply(&ping, &["Ping: Pong"])
            .await;
    };
    let (reply, ()) = tokio::join!(
        manager.send_action(ManagerAction::ping().action_id("mine")),
        server
    );

    let reply = reply.unwrap();
    assert!(reply.is_pong());
    assert_eq!(reply.action_id(), Some("mine"));
    assert_eq!(manager.pending_requests(), 0);
}

#[tokio::test]
async fn concurrent_senders_get_their_own_responses() {
    let (listener, port) = listen().await;
    let (manager, mut session) = connected(config(port), &listener).await;

    let server = async {
        let mut actions = Vec::new();
        for _ in 0..3 {
            actions.push(
                session
                    .expect_action("GetVar")
                    .await,
            );
        }
        // Answer in reverse order
        for action in actions
            .iter()
            .rev()
        {
            let value = format!("Value: value-of-{}", action["variable"]);
            session
                .reply(action, &[&value])
                .await;
        }
    };

    let get = |name: &'static str| {
        let manager = manager.clone();
        async move {
            manager
                .send_action(ManagerAction::get_var(None, name).unwrap())
                .await
                .unwrap()
        }
    };
    let (a, b, c, ()) = tokio::join!(get("A"), get("B"), get("C"), server);

    assert_eq!(a.get("value"), Some("value-of-A"));
    assert_eq!(b.get("value"), Some("value-of-B"));
    assert_eq!(c.get("value"), Some("value-of-C"));
}

#[tokio::test]
async fn command_output_block() {
    let (listener, port) = listen().await;
    let (manager, mut session) = connected(config(port), &listener).await;

    let server = async {
        let cmd = session
            .expect_action("Command")
            .await;
        assert_eq!(cmd["command"], "core show uptime");
        session
            .send(&format!(
                "Response: Follows\r\nPrivilege: Command\r\nActionID: {}\r\nSystem uptime: 1 hour\r\nLast reload: 5 minutes\r\n--END COMMAND--\r\n\r\n",
                cmd["actionid"]
            ))
            .await;
    };
    let (reply, ()) = tokio::join!(
        manager.send_action(ManagerAction::command("core show uptime").unwrap()),
        server
    );

    let reply = reply.unwrap();
    assert_eq!(
        reply.output(),
        Some(vec!["System uptime: 1 hour", "Last reload: 5 minutes"])
    );
}

#[tokio::test]
async fn event_generating_action_collects_until_terminal_event() {
    let (listener, port) = listen().await;
    let (manager, mut session) = connected(config(port), &listener).await;
    let mut hangups = event_log(&manager, Some("Hangup"));

    let server = async {
        let status = session
            .expect_action("Status")
            .await;
        let id = status["actionid"].clone();
        // First list entry races ahead of the response
        session
            .send(&format!(
                "Event: Status\r\nActionID: {id}\r\nChannel: SIP/100-1\r\n\r\n"
            ))
            .await;
        session
            .send(&format!(
                "Response: Success\r\nActionID: {id}\r\nEventList: start\r\nMessage: Channel status will follow\r\n\r\n"
            ))
            .await;
        session
            .send("Event: Hangup\r\nChannel: SIP/200-2\r\nCause: 16\r\n\r\n")
            .await;
        session
            .send(&format!(
                "Event: Status\r\nActionID: {id}\r\nChannel: SIP/101-2\r\n\r\n"
            ))
            .await;
        session
            .send(&format!(
                "Event: StatusComplete\r\nActionID: {id}\r\nItems: 2\r\n\r\n"
            ))
            .await;
    };
    let (collected, ()) = tokio::join!(
        manager.send_event_generating_action(ManagerAction::status(), Duration::from_secs(2)),
        server
    );

    let collected = collected
        .unwrap()
        .into_result()
        .unwrap();
    assert!(collected.is_complete());
    assert_eq!(
        collected
            .response()
            .and_then(|r| r.message()),
        Some("Channel status will follow")
    );
    let channels: Vec<_> = collected
        .events()
        .iter()
        .filter_map(|e| e.channel())
        .collect();
    assert_eq!(channels, ["SIP/100-1", "SIP/101-2"]);
    assert!(collected
        .events()
        .last()
        .unwrap()
        .is_list_terminal());

    // The uncorrelated event still reaches general listeners
    let hangup = next_event(&mut hangups).await;
    assert_eq!(hangup.channel(), Some("SIP/200-2"));
    assert_eq!(hangup.integer("cause"), Some(16));
}

#[tokio::test]
async fn timeout_affects_only_that_request() {
    let (listener, port) = listen().await;
    let (manager, mut session) = connected(config(port), &listener).await;

    let server = async {
        let _ignored = session
            .expect_action("Ping")
            .await;
        let ping = session
            .expect_action("Ping")
            .await;
        session
            .reply(&ping, &["Ping: Pong"])
            .await;
        session
    };

    let client = async {
        let slow = manager
            .send_action_timeout(ManagerAction::ping(), Duration::from_millis(100))
            .await;
        let fast = manager
            .send_action(ManagerAction::ping())
            .await;
        (slow, fast)
    };
    let ((slow, fast), _session) = tokio::join!(client, server);

    assert!(matches!(slow, Err(AmiError::Timeout { timeout_ms: 100 })));
    assert!(fast
        .unwrap()
        .is_pong());
    assert!(manager.is_connected());
    assert_eq!(manager.pending_requests(), 0);
}

#[tokio::test]
async fn cancelled_request_is_deregistered() {
    let (listener, port) = listen().await;
    let (manager, _session) = connected(config(port), &listener).await;

    let result = manager
        .send_action_cancellable(
            ManagerAction::ping(),
            Duration::from_secs(5),
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await;
    assert!(matches!(result, Err(AmiError::Cancelled)));
    assert_eq!(manager.pending_requests(), 0);
}

#[tokio::test]
async fn untracked_ping_wakes_on_any_pong() {
    let (listener, port) = listen().await;
    let (manager, mut session) = connected(config(port), &listener).await;

    let server = async {
        let ping = session
            .expect_action("Ping")
            .await;
        assert!(!ping.contains_key("actionid"));
        session
            .send("Response: Success\r\nPing: Pong\r\nTimestamp: 1700000000.000000\r\n\r\n")
            .await;
    };
    let (pinged, ()) = tokio::join!(manager.ping(Duration::from_secs(2)), server);
    pinged.unwrap();
    assert!(manager
        .time_since_last_pong()
        .is_some());
}

#[tokio::test]
async fn callback_receives_response() {
    let (listener, port) = listen().await;
    let (manager, mut session) = connected(config(port), &listener).await;
    let (tx, rx) = tokio::sync::oneshot::channel();

    manager
        .send_action_with_callback(
            ManagerAction::ping(),
            move |result| {
                let _ = tx.send(result.map(|r| r.is_pong()));
            },
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    let ping = session
        .expect_action("Ping")
        .await;
    session
        .reply(&ping, &["Ping: Pong"])
        .await;

    let delivered = timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(delivered.unwrap());
}

#[tokio::test]
async fn variables_use_dialect_delimiter() {
    let (listener, port) = listen().await;
    let (manager, mut session) = connected(config(port), &listener).await;

    let originate = ManagerAction::originate("SIP/100")
        .unwrap()
        .variable("A", "1")
        .unwrap()
        .variable("B", "2")
        .unwrap();
    manager
        .send_action_no_reply(originate)
        .await
        .unwrap();

    let action = session
        .expect_action("Originate")
        .await;
    assert_eq!(action["channel"], "SIP/100");
    assert_eq!(action["variable"], "A=1,B=2");
}

#[tokio::test]
async fn server_disconnect_fails_pending_requests() {
    let (listener, port) = listen().await;
    let (manager, mut session) = connected(config(port), &listener).await;
    let mut disconnects = event_log(&manager, Some("Disconnect"));

    let server = async move {
        let _ = session
            .expect_action("Ping")
            .await;
        drop(session);
    };
    let (result, ()) = tokio::join!(
        manager.send_action_timeout(ManagerAction::ping(), Duration::from_secs(5)),
        server
    );

    assert!(matches!(result, Err(AmiError::ConnectionClosed)));
    let state = wait_for_state(&manager, |s| matches!(s, ConnectionState::Closed(_))).await;
    assert_eq!(
        state,
        ConnectionState::Closed(DisconnectReason::ConnectionClosed)
    );

    let event = next_event(&mut disconnects).await;
    assert_eq!(event.boolean("reconnecting"), Some(false));
    assert!(matches!(
        manager
            .send_action(ManagerAction::ping())
            .await,
        Err(AmiError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn reconnects_after_session_loss() {
    let (listener, port) = listen().await;
    let mut config = config(port);
    config.reconnect = ReconnectPolicy {
        fast_interval_ms: 10,
        ..ReconnectPolicy::default()
    };
    let (manager, session) = connected(config, &listener).await;
    let mut lifecycle = event_log(&manager, None);

    drop(session);
    let mut second = accept(&listener).await;
    second
        .handshake()
        .await;

    let lost = next_event(&mut lifecycle).await;
    assert_eq!(lost.kind(), "disconnect");
    assert_eq!(lost.boolean("reconnecting"), Some(true));
    let back = next_event(&mut lifecycle).await;
    assert_eq!(back.kind(), "connect");

    wait_for_state(&manager, ConnectionState::is_connected).await;

    let server = async {
        let ping = second
            .expect_action("Ping")
            .await;
        second
            .reply(&ping, &["Ping: Pong"])
            .await;
    };
    let (reply, ()) = tokio::join!(manager.send_action(ManagerAction::ping()), server);
    assert!(reply
        .unwrap()
        .is_pong());
}

#[tokio::test]
async fn unreachable_server_exhausts_reconnect_attempts() {
    let (listener, port) = listen().await;
    let mut config = config(port);
    config.reconnect = ReconnectPolicy {
        enabled: true,
        fast_interval_ms: 10,
        fast_attempts: 2,
        slow_interval_ms: 30,
        max_attempts: Some(4),
    };
    let (manager, session) = connected(config, &listener).await;
    let mut lifecycle = event_log(&manager, Some("Disconnect"));

    let started = tokio::time::Instant::now();
    drop(session);
    drop(listener);

    let lost = next_event(&mut lifecycle).await;
    assert_eq!(lost.boolean("reconnecting"), Some(true));

    let state = wait_for_state(&manager, |s| matches!(s, ConnectionState::Closed(_))).await;
    assert_eq!(
        state,
        ConnectionState::Closed(DisconnectReason::ReconnectExhausted { attempts: 4 })
    );
    // two fast retries then two slow ones
    assert!(started.elapsed() >= Duration::from_millis(80));

    let gave_up = next_event(&mut lifecycle).await;
    assert_eq!(gave_up.boolean("reconnecting"), Some(false));
    assert!(matches!(
        manager
            .send_action(ManagerAction::ping())
            .await,
        Err(AmiError::ReconnectExhausted { attempts: 4 })
    ));
}

#[tokio::test]
async fn keepalive_drops_silent_session() {
    let (listener, port) = listen().await;
    let mut config = config(port);
    config.keepalive_interval_ms = 50;
    let (manager, mut session) = connected(config, &listener).await;

    // Swallow pings without answering
    let server = tokio::spawn(async move { while session.read_action().await.is_some() {} });

    let state = wait_for_state(&manager, |s| matches!(s, ConnectionState::Closed(_))).await;
    assert_eq!(
        state,
        ConnectionState::Closed(DisconnectReason::KeepaliveTimeout)
    );
    server
        .await
        .unwrap();
}

#[tokio::test]
async fn close_is_idempotent_and_logs_off() {
    let (listener, port) = listen().await;
    let (manager, mut session) = connected(config(port), &listener).await;
    let mut lifecycle = event_log(&manager, Some("Disconnect"));

    manager
        .close()
        .await;
    manager
        .close()
        .await;

    session
        .expect_action("Logoff")
        .await;

    let closed = next_event(&mut lifecycle).await;
    assert_eq!(closed.boolean("reconnecting"), Some(false));
    assert!(timeout(Duration::from_millis(200), lifecycle.recv())
        .await
        .is_err());
    assert_eq!(
        manager.status(),
        ConnectionState::Closed(DisconnectReason::ClientRequested)
    );
    assert!(matches!(
        manager
            .login()
            .await,
        Err(AmiError::ConnectionClosed)
    ));
}
