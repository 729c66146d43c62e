//! FastAGI server driven by a fake Asterisk over loopback.

use asterisk_manager_tokio::agi::{AgiChannel, AgiRequest, AgiScript, AgiServer, SimpleMappingStrategy};
use asterisk_manager_tokio::{AgiError, AgiResult, AgiServerConfig};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// Answers, reads a variable and collects a PIN.
struct PinScript {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl AgiScript for PinScript {
    async fn service(&self, request: &AgiRequest, channel: &mut AgiChannel) -> AgiResult<()> {
        channel.answer().await?;
        let account = channel
            .get_variable("ACCOUNT")
            .await?
            .unwrap_or_default();
        let pin = channel
            .get_data("enter-pin", Some(3000), Some(4))
            .await?;
        let mut seen = self
            .seen
            .lock()
            .unwrap();
        seen.push(format!("{}:{}", request.parameter("lang").unwrap_or("?"), request.arguments().join(",")));
        seen.push(format!("{}={}", account, pin));
        Ok(())
    }
}

/// Keeps sending commands until the channel hangs up.
struct UntilHangup {
    result: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl AgiScript for UntilHangup {
    async fn service(&self, _request: &AgiRequest, channel: &mut AgiChannel) -> AgiResult<()> {
        let outcome = loop {
            if let Err(e) = channel.noop().await {
                break e;
            }
        };
        *self
            .result
            .lock()
            .unwrap() = Some(format!("{:?}", outcome));
        Err(outcome)
    }
}

struct FakeAsterisk {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl FakeAsterisk {
    async fn connect(addr: SocketAddr, script: &str, args: &[&str]) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .unwrap();
        let (read, mut writer) = stream.into_split();
        let mut env = format!(
            "agi_network: yes\nagi_request: agi://127.0.0.1/{}\nagi_channel: SIP/100-00000007\nagi_uniqueid: 1700000000.7\n",
            script
        );
        for (i, arg) in args
            .iter()
            .enumerate()
        {
            env.push_str(&format!("agi_arg_{}: {}\n", i + 1, arg));
        }
        env.push('\n');
        writer
            .write_all(env.as_bytes())
            .await
            .unwrap();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn command(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("no command within 2s")
            .unwrap()
    }

    async fn answer(&mut self, reply: &str) {
        self.writer
            .write_all(format!("{}\n", reply).as_bytes())
            .await
            .unwrap();
    }
}

async fn start(mapper: SimpleMappingStrategy) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<AgiResult<()>>) {
    let config = AgiServerConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        max_connections: 4,
    };
    let server = AgiServer::bind(config, mapper)
        .await
        .unwrap();
    let addr = server
        .local_addr()
        .unwrap();
    let (stop_tx, stop_rx) = oneshot::channel();
    let handle = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));
    (addr, stop_tx, handle)
}

#[tokio::test]
async fn script_runs_commands_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mapper = SimpleMappingStrategy::new().with_script(
        "pin",
        PinScript {
            seen: seen.clone(),
        },
    );
    let (addr, stop, server) = start(mapper).await;

    let mut asterisk = FakeAsterisk::connect(addr, "pin?lang=fr", &["a", "b c"]).await;
    assert_eq!(asterisk.command().await.as_deref(), Some("ANSWER"));
    asterisk
        .answer("200 result=0")
        .await;
    assert_eq!(
        asterisk
            .command()
            .await
            .as_deref(),
        Some("GET VARIABLE ACCOUNT")
    );
    asterisk
        .answer("200 result=1 (4711)")
        .await;
    assert_eq!(
        asterisk
            .command()
            .await
            .as_deref(),
        Some("GET DATA enter-pin 3000 4")
    );
    asterisk
        .answer("100 result=0 Trying...")
        .await;
    asterisk
        .answer("200 result=1234")
        .await;

    // Script finished; server closes its side
    assert_eq!(asterisk.command().await, None);
    assert_eq!(
        *seen
            .lock()
            .unwrap(),
        ["fr:a,b c", "4711=1234"]
    );

    stop.send(())
        .unwrap();
    server
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn hangup_ends_the_script() {
    let result = Arc::new(Mutex::new(None));
    let mapper = SimpleMappingStrategy::new().with_script(
        "loop",
        UntilHangup {
            result: result.clone(),
        },
    );
    let (addr, stop, _server) = start(mapper).await;

    let mut asterisk = FakeAsterisk::connect(addr, "loop", &[]).await;
    assert_eq!(asterisk.command().await.as_deref(), Some("NOOP"));
    asterisk
        .answer("200 result=0")
        .await;
    assert_eq!(asterisk.command().await.as_deref(), Some("NOOP"));
    asterisk
        .answer("HANGUP")
        .await;
    assert_eq!(asterisk.command().await, None);

    assert_eq!(
        result
            .lock()
            .unwrap()
            .as_deref(),
        Some(format!("{:?}", AgiError::Hangup).as_str())
    );
    let _ = stop.send(());
}

#[tokio::test]
async fn unmapped_script_is_closed() {
    let (addr, stop, _server) = start(SimpleMappingStrategy::new()).await;

    let mut asterisk = FakeAsterisk::connect(addr, "nowhere", &[]).await;
    assert_eq!(asterisk.command().await, None);
    let _ = stop.send(());
}

#[tokio::test]
async fn syntax_error_reply_carries_usage() {
    struct BadSyntax {
        error: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl AgiScript for BadSyntax {
        async fn service(&self, _request: &AgiRequest, channel: &mut AgiChannel) -> AgiResult<()> {
            if let Err(AgiError::InvalidCommandSyntax { usage }) = channel
                .stream_file("x", "")
                .await
            {
                *self
                    .error
                    .lock()
                    .unwrap() = Some(usage);
            }
            Ok(())
        }
    }

    let error = Arc::new(Mutex::new(None));
    let mapper = SimpleMappingStrategy::new().with_script(
        "bad",
        BadSyntax {
            error: error.clone(),
        },
    );
    let (addr, stop, _server) = start(mapper).await;

    let mut asterisk = FakeAsterisk::connect(addr, "bad", &[]).await;
    assert_eq!(
        asterisk
            .command()
            .await
            .as_deref(),
        Some(r#"STREAM FILE x """#)
    );
    asterisk
        .answer("520-Invalid command syntax.  Proper usage follows:")
        .await;
    asterisk
        .answer("Usage: STREAM FILE <filename> <escape digits> [sample offset]")
        .await;
    asterisk
        .answer("520 End of proper usage.")
        .await;
    assert_eq!(asterisk.command().await, None);

    assert_eq!(
        error
            .lock()
            .unwrap()
            .as_deref(),
        Some("Usage: STREAM FILE <filename> <escape digits> [sample offset]")
    );
    let _ = stop.send(());
}
