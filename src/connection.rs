//! Manager connection: session state machine and client facade

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::{
    action::ManagerAction,
    auth::challenge_digest,
    config::ManagerConfig,
    constants::SOCKET_BUF_SIZE,
    correlator::{lock, Correlator, EventCollector, PendingGuard, ResponseSink},
    error::{AmiError, AmiResult},
    event::{
        EventDispatcher, EventRegistry, FieldType, ManagerEvent, SubscriptionId, CONNECT_EVENT,
        DISCONNECT_EVENT, SHUTDOWN_EVENT,
    },
    framer::LineFramer,
    headers::ManagerHeader,
    keepalive::PongTracker,
    protocol::{AssembledPacket, Packet, PacketAssembler},
    response::{ManagerResponse, ResponseEvents},
    version::AsteriskVersion,
};

/// Upper bound for the best-effort `Logoff` written by [`ManagerConnection::close`].
const LOGOFF_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Session state.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionState {
    /// Not logged in. Initial state, and the state after a failed `login()`.
    Disconnected,
    /// Opening the TCP connection.
    Connecting,
    /// Connected, waiting for the protocol banner.
    AwaitingBanner,
    /// Running the challenge/login handshake.
    Authenticating,
    /// Logged in; actions may be sent.
    Connected,
    /// Session lost, retrying with backoff.
    Reconnecting,
    /// Terminal. The connection will not come back.
    Closed(DisconnectReason),
}

impl ConnectionState {
    /// `true` only in [`ConnectionState::Connected`].
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// The server sent a `Shutdown` event.
    ServerShutdown,
    /// A keepalive ping went unanswered for a whole interval.
    KeepaliveTimeout,
    /// TCP I/O error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// Clean EOF on the TCP connection
    ConnectionClosed,
    /// Client called close()
    ClientRequested,
    /// Reconnection gave up.
    ReconnectExhausted { attempts: usize },
    /// A reconnect attempt was refused by the server.
    AuthenticationFailed,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ServerShutdown => write!(f, "server shutdown"),
            DisconnectReason::KeepaliveTimeout => write!(f, "keepalive timeout"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
            DisconnectReason::ReconnectExhausted { attempts } => {
                write!(f, "reconnect abandoned after {} attempts", attempts)
            }
            DisconnectReason::AuthenticationFailed => write!(f, "authentication failed"),
        }
    }
}

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(host: &str, port: u16, limit: Duration) -> AmiResult<TcpStream> {
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established");
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(AmiError::Io(e))
        }
        Err(_) => {
            warn!(
                "[CONNECT] TCP connect timed out after {}ms",
                limit.as_millis()
            );
            Err(AmiError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })
        }
    }
}

/// Stop signal for one session's reader and keepalive tasks.
///
/// The first reason recorded wins.
struct SessionStop {
    notify: Notify,
    reason: StdMutex<Option<DisconnectReason>>,
}

impl SessionStop {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            notify: Notify::new(),
            reason: StdMutex::new(None),
        })
    }

    fn stop(&self, reason: DisconnectReason) {
        {
            let mut current = lock(&self.reason);
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.notify
            .notify_one();
    }

    fn reason(&self) -> Option<DisconnectReason> {
        lock(&self.reason).clone()
    }

    fn is_stopped(&self) -> bool {
        lock(&self.reason).is_some()
    }
}

/// Tasks belonging to one live socket.
struct Session {
    stop: Arc<SessionStop>,
    reader: JoinHandle<DisconnectReason>,
    keepalive: Option<JoinHandle<()>>,
}

impl Session {
    /// Wait for the reader to exit.
    async fn finished(&mut self) -> DisconnectReason {
        match (&mut self.reader).await {
            Ok(reason) => reason,
            Err(e) => DisconnectReason::IoError(format!("reader task failed: {}", e)),
        }
    }
}

/// State shared by the connection handle and its background tasks.
struct Inner {
    config: ManagerConfig,
    correlator: Correlator,
    dispatcher: EventDispatcher,
    registry: Arc<EventRegistry>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    state_tx: watch::Sender<ConnectionState>,
    closing_tx: watch::Sender<bool>,
    banner: RwLock<Option<String>>,
    version: RwLock<Option<AsteriskVersion>>,
    reconnect_enabled: AtomicBool,
    pongs: PongTracker,
    current_stop: StdMutex<Option<Arc<SessionStop>>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

/// Client for the Asterisk Manager Interface (Clone + Send).
///
/// Create with [`new`](Self::new), then [`login`](Self::login). Clones share
/// one session. Writes from concurrent senders are serialized by the writer
/// lock; responses are matched to callers by `ActionID`.
///
/// ```rust,no_run
/// # async fn example() -> Result<(), asterisk_manager_tokio::AmiError> {
/// use asterisk_manager_tokio::{ManagerAction, ManagerConfig, ManagerConnection};
///
/// let config = ManagerConfig::new("127.0.0.1", "admin", "secret");
/// let (manager, mut events) = ManagerConnection::new(config);
/// manager.login().await?;
///
/// manager.add_event_listener(Some("Hangup"), |event| {
///     println!("hangup on {:?}", event.channel());
/// });
///
/// let reply = manager.send_action(ManagerAction::command("core show uptime")?).await?;
/// println!("{:?}", reply.output());
///
/// let channels = manager
///     .send_event_generating_action(ManagerAction::core_show_channels(), std::time::Duration::from_secs(5))
///     .await?;
/// println!("{} channels", channels.events().len() - 1);
///
/// while let Some(Ok(event)) = events.recv().await {
///     println!("unhandled {}", event.name());
/// }
/// manager.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ManagerConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ManagerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConnection")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("state", &self.status())
            .finish()
    }
}

/// Event stream receiver (!Clone)
///
/// Receives events nobody subscribed to, when
/// [`fire_unhandled_events`](ManagerConfig::fire_unhandled_events) is on.
///
/// Events are delivered as `Result<ManagerEvent, AmiError>`. An
/// `Err(AmiError::QueueFull)` indicates that one or more events were dropped
/// because the application fell behind. Use
/// [`ManagerConnection::dropped_event_count`] for the exact count.
pub struct ManagerEventStream {
    rx: mpsc::Receiver<Result<ManagerEvent, AmiError>>,
    status_rx: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for ManagerEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerEventStream")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        self.state_tx
            .borrow()
            .clone()
    }

    fn set_state(&self, state: ConnectionState) {
        trace!("State -> {:?}", state);
        self.state_tx
            .send_replace(state);
    }

    fn is_closing(&self) -> bool {
        *self
            .closing_tx
            .borrow()
    }

    fn ensure_connected(&self) -> AmiResult<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed(DisconnectReason::ReconnectExhausted { attempts }) => {
                Err(AmiError::ReconnectExhausted { attempts })
            }
            ConnectionState::Closed(_) => Err(AmiError::ConnectionClosed),
            _ => Err(AmiError::NotConnected),
        }
    }

    fn variable_delimiter(&self) -> char {
        self.version
            .read()
            .ok()
            .and_then(|v| *v)
            .map(|v| v.variable_delimiter())
            .unwrap_or(',')
    }

    /// Serialize and write one action under the writer lock.
    async fn write_action(&self, action: &ManagerAction, internal_id: Option<&str>) -> AmiResult<()> {
        let wire = action.to_wire(internal_id, self.variable_delimiter())?;
        debug!("Sending action: {:?}", action);

        let mut writer = self
            .writer
            .lock()
            .await;
        let Some(stream) = writer.as_mut() else {
            return Err(AmiError::NotConnected);
        };
        stream
            .write_all(wire.as_bytes())
            .await
            .map_err(AmiError::Io)
    }

    /// Send a tracked action and wait for its response. No state check, so
    /// the login handshake can use it.
    async fn request(&self, action: &ManagerAction, limit: Duration) -> AmiResult<ManagerResponse> {
        let internal_id = self
            .correlator
            .next_internal_id();
        let (tx, rx) = oneshot::channel();
        let hash = self
            .correlator
            .register(&internal_id, action.name(), ResponseSink::Waiter(tx))?;
        let _guard = PendingGuard::new(&self.correlator, hash);

        self.write_action(action, Some(&internal_id))
            .await?;

        match timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AmiError::ConnectionClosed),
            Err(_) => {
                debug!(
                    "{} ({}) timed out after {}ms",
                    action.name(),
                    internal_id,
                    limit.as_millis()
                );
                Err(AmiError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    async fn request_events(
        &self,
        action: &ManagerAction,
        completion: &str,
        limit: Duration,
    ) -> AmiResult<ResponseEvents> {
        let internal_id = self
            .correlator
            .next_internal_id();
        let (collector, done) = EventCollector::new(completion);

        // Events may arrive before the response; subscribe first.
        let hash = self
            .correlator
            .register_events(&internal_id, collector.clone())?;
        let _guard = PendingGuard::new(&self.correlator, hash);
        self.correlator
            .register(
                &internal_id,
                action.name(),
                ResponseSink::Events(collector.clone()),
            )?;

        self.write_action(action, Some(&internal_id))
            .await?;

        match timeout(limit, done).await {
            Ok(Ok(Ok(()))) => Ok(collector.take()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(AmiError::ConnectionClosed),
            Err(_) => {
                let partial = collector.take();
                debug!(
                    "{} timed out with {} event(s) collected",
                    action.name(),
                    partial
                        .events()
                        .len()
                );
                Err(AmiError::EventsTimeout {
                    timeout_ms: limit.as_millis() as u64,
                    partial: Box::new(partial),
                })
            }
        }
    }

    /// Route one assembled packet. Runs on the reader task.
    fn handle_packet(
        &self,
        packet: AssembledPacket,
        banner_tx: &mut Option<oneshot::Sender<String>>,
        stop: &SessionStop,
    ) {
        match packet {
            AssembledPacket::Banner(banner) => {
                info!("[CONNECT] Server identifies as '{}'", banner);
                if let Ok(mut slot) = self
                    .banner
                    .write()
                {
                    *slot = Some(banner.clone());
                }
                if let Some(tx) = banner_tx.take() {
                    let _ = tx.send(banner);
                }
            }
            AssembledPacket::Response(packet) => {
                let response = ManagerResponse::from_packet(packet);
                let sink = response
                    .internal_action_id()
                    .and_then(|id| {
                        self.correlator
                            .take_pending(id)
                    });
                match sink {
                    Some(sink) => sink.deliver(Ok(response)),
                    None if response.is_pong() => {
                        trace!("[KEEPALIVE] Pong received");
                        self.pongs
                            .record_pong_received();
                    }
                    None => {
                        debug!(
                            "[RECV] Dropping response with no pending request: {:?}",
                            response
                        );
                    }
                }
            }
            AssembledPacket::Event(packet) => {
                let event = self
                    .registry
                    .build(packet);
                trace!("[RECV] Event {}", event.name());

                if event.is_response_event() {
                    if let Some(id) = event
                        .internal_action_id()
                        .map(str::to_string)
                    {
                        if let Some(collector) = self
                            .correlator
                            .event_collector(&id)
                        {
                            if collector.on_event(event) {
                                self.correlator
                                    .remove_event_collector(&id);
                            }
                            return;
                        }
                    }
                }

                let shutdown = event.kind() == SHUTDOWN_EVENT;
                self.dispatcher
                    .dispatch(event);
                if shutdown
                    && self
                        .reconnect_enabled
                        .load(Ordering::Relaxed)
                {
                    info!("[RECV] Server is shutting down");
                    stop.stop(DisconnectReason::ServerShutdown);
                }
            }
        }
    }

    fn dispatch_synthetic(&self, fields: &[(&str, String)]) {
        let mut packet = Packet::new();
        for (key, value) in fields {
            packet.insert(key, value.as_str());
        }
        let event = self
            .registry
            .build(packet);
        self.dispatcher
            .dispatch(event);
    }

    fn dispatch_connect(&self) {
        let banner = self
            .banner
            .read()
            .ok()
            .and_then(|b| b.clone())
            .unwrap_or_default();
        self.dispatch_synthetic(&[
            (ManagerHeader::Event.as_str(), CONNECT_EVENT.to_string()),
            ("ProtocolIdentifier", banner),
        ]);
    }

    fn dispatch_disconnect(&self, reason: &DisconnectReason, reconnecting: bool) {
        self.dispatch_synthetic(&[
            (ManagerHeader::Event.as_str(), DISCONNECT_EVENT.to_string()),
            ("Reason", reason.to_string()),
            ("Reconnecting", if reconnecting { "yes" } else { "no" }.to_string()),
        ]);
    }

    fn stop_current_session(&self, reason: DisconnectReason) {
        if let Some(stop) = lock(&self.current_stop).as_ref() {
            stop.stop(reason);
        }
    }

    /// Connect, wait for the banner, authenticate and probe the version.
    ///
    /// On failure every task started here has exited before returning.
    async fn establish_session(self: &Arc<Self>) -> AmiResult<Session> {
        let config = &self.config;
        self.set_state(ConnectionState::Connecting);
        info!(
            "[CONNECT] Connecting to Asterisk at {}:{}",
            config.host, config.port
        );

        let deadline = Instant::now() + config.login_timeout();
        let stream =
            tcp_connect_with_timeout(&config.host, config.port, config.connect_timeout()).await?;
        let (read_half, write_half) = stream.into_split();
        *self
            .writer
            .lock()
            .await = Some(write_half);

        let stop = SessionStop::new();
        *lock(&self.current_stop) = Some(stop.clone());
        let (banner_tx, banner_rx) = oneshot::channel();
        let reader = tokio::spawn(reader_loop(
            self.clone(),
            read_half,
            stop.clone(),
            banner_tx,
        ));
        let mut session = Session {
            stop,
            reader,
            keepalive: None,
        };

        match self
            .handshake(deadline, banner_rx)
            .await
        {
            Ok(()) => Ok(session),
            Err(e) => {
                session
                    .stop
                    .stop(DisconnectReason::ClientRequested);
                let _ = session
                    .finished()
                    .await;
                self.end_session(&mut session)
                    .await;
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        deadline: Instant,
        banner_rx: oneshot::Receiver<String>,
    ) -> AmiResult<()> {
        let config = &self.config;
        self.set_state(ConnectionState::AwaitingBanner);
        match tokio::time::timeout_at(deadline, banner_rx).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return Err(AmiError::ConnectionClosed),
            Err(_) => {
                warn!("[CONNECT] No protocol banner within the login timeout");
                return Err(AmiError::Timeout {
                    timeout_ms: config.login_timeout_ms,
                });
            }
        }

        self.set_state(ConnectionState::Authenticating);
        debug!("[AUTH] Requesting MD5 challenge");
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let challenge = self
            .request(&ManagerAction::challenge("MD5")?, remaining())
            .await?;
        if challenge.is_error() {
            return Err(AmiError::auth_failed(
                challenge
                    .message()
                    .unwrap_or("Challenge refused"),
            ));
        }
        let Some(nonce) = challenge.get(ManagerHeader::Challenge) else {
            return Err(AmiError::protocol_error("Challenge response without challenge"));
        };

        let key = challenge_digest(nonce, &config.secret);
        debug!("[AUTH] Logging in as {} (key [REDACTED])", config.username);
        let login = ManagerAction::login(&config.username, &key, config.events.as_deref())?;
        let reply = self
            .request(&login, remaining())
            .await?;
        if reply.is_error() {
            let message = reply
                .message()
                .unwrap_or("Authentication failed")
                .to_string();
            warn!("[AUTH] Login rejected: {}", message);
            return Err(AmiError::AuthenticationFailed { message });
        }
        info!("[AUTH] Logged in as {}", config.username);

        let version = self
            .probe_version()
            .await;
        if let Ok(mut slot) = self
            .version
            .write()
        {
            *slot = version;
        }
        Ok(())
    }

    /// `core show version`, then `show version`, then a guess from the banner.
    async fn probe_version(&self) -> Option<AsteriskVersion> {
        for command in ["core show version", "show version"] {
            let Ok(action) = ManagerAction::command(command) else {
                continue;
            };
            match self
                .request(&action, self.config.response_timeout())
                .await
            {
                Ok(reply) => {
                    let text = reply
                        .output()
                        .map(|lines| lines.join("\n"))
                        .unwrap_or_default();
                    if let Some(version) = AsteriskVersion::parse(&text) {
                        info!("[CONNECT] Asterisk version {}", version);
                        return Some(version);
                    }
                }
                Err(e) => debug!("[CONNECT] Version probe '{}' failed: {}", command, e),
            }
        }

        let guess = self
            .banner
            .read()
            .ok()
            .and_then(|b| {
                b.as_deref()
                    .and_then(AsteriskVersion::from_banner)
            });
        match guess {
            Some(version) => info!("[CONNECT] Assuming Asterisk {} from banner", version),
            None => warn!("[CONNECT] Could not determine Asterisk version"),
        }
        guess
    }

    /// Mark the session live: state, keepalive, connect event.
    fn session_up(self: &Arc<Self>, session: &mut Session) {
        self.pongs
            .reset();
        self.set_state(ConnectionState::Connected);
        if let Some(interval) = self
            .config
            .keepalive_interval()
        {
            session.keepalive = Some(tokio::spawn(keepalive_loop(
                self.clone(),
                session
                    .stop
                    .clone(),
                interval,
            )));
        }
        self.dispatch_connect();
    }

    /// Release everything tied to a finished session.
    async fn end_session(&self, session: &mut Session) {
        if let Some(keepalive) = session
            .keepalive
            .take()
        {
            keepalive.abort();
        }
        if let Some(mut writer) = self
            .writer
            .lock()
            .await
            .take()
        {
            let _ = writer
                .shutdown()
                .await;
        }
        {
            let mut current = lock(&self.current_stop);
            if current
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(s, &session.stop))
            {
                *current = None;
            }
        }
        self.correlator
            .fail_all(|| AmiError::ConnectionClosed);
    }

    /// Retry with the configured backoff until a session is up.
    async fn reconnect_loop(self: &Arc<Self>) -> Result<Session, DisconnectReason> {
        let policy = &self.config.reconnect;
        let mut closing = self
            .closing_tx
            .subscribe();
        let mut attempt = 0;

        loop {
            let Some(delay) = policy.delay_for(attempt) else {
                warn!("[RECONNECT] Giving up after {} attempts", attempt);
                return Err(DisconnectReason::ReconnectExhausted { attempts: attempt });
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closing.wait_for(|c| *c) => return Err(DisconnectReason::ClientRequested),
            }
            attempt += 1;
            debug!(
                "[RECONNECT] Attempt {} after {}ms",
                attempt,
                delay.as_millis()
            );

            match self
                .establish_session()
                .await
            {
                Ok(session) => {
                    info!("[RECONNECT] Reconnected after {} attempt(s)", attempt);
                    return Ok(session);
                }
                Err(AmiError::AuthenticationFailed { message }) => {
                    warn!("[RECONNECT] Authentication failed: {}", message);
                    if !self
                        .config
                        .keep_alive_after_auth_failure
                    {
                        return Err(DisconnectReason::AuthenticationFailed);
                    }
                }
                Err(e) => debug!("[RECONNECT] Attempt {} failed: {}", attempt, e),
            }

            if self.is_closing() {
                return Err(DisconnectReason::ClientRequested);
            }
            self.set_state(ConnectionState::Reconnecting);
        }
    }
}

/// Watches a live session and runs the reconnect procedure when it ends.
async fn supervise(inner: Arc<Inner>, mut session: Session) {
    loop {
        let reason = session
            .finished()
            .await;
        inner
            .end_session(&mut session)
            .await;

        if inner.is_closing() {
            info!("Connection closed by client");
            inner.set_state(ConnectionState::Closed(DisconnectReason::ClientRequested));
            inner.dispatch_disconnect(&DisconnectReason::ClientRequested, false);
            return;
        }

        if !inner
            .reconnect_enabled
            .load(Ordering::Relaxed)
        {
            info!("Session ended: {}", reason);
            inner.set_state(ConnectionState::Closed(reason.clone()));
            inner.dispatch_disconnect(&reason, false);
            return;
        }

        warn!("[RECONNECT] Session lost ({}), reconnecting", reason);
        inner.set_state(ConnectionState::Reconnecting);
        inner
            .dispatcher
            .set_suppressed(true);
        inner.dispatch_disconnect(&reason, true);

        match inner
            .reconnect_loop()
            .await
        {
            Ok(mut next) => {
                inner
                    .dispatcher
                    .set_suppressed(false);
                if inner.is_closing() {
                    next.stop
                        .stop(DisconnectReason::ClientRequested);
                } else {
                    inner.session_up(&mut next);
                }
                session = next;
            }
            Err(final_reason) => {
                inner
                    .dispatcher
                    .set_suppressed(false);
                error!("[RECONNECT] Connection lost for good: {}", final_reason);
                inner.set_state(ConnectionState::Closed(final_reason.clone()));
                inner.dispatch_disconnect(&final_reason, false);
                return;
            }
        }
    }
}

/// Pings every interval; stops the session if the previous ping got no pong.
async fn keepalive_loop(inner: Arc<Inner>, stop: Arc<SessionStop>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        ticker
            .tick()
            .await;
        if stop.is_stopped() {
            return;
        }
        if inner
            .pongs
            .awaiting_pong()
        {
            warn!(
                "[KEEPALIVE] No pong within {}ms, dropping session",
                interval.as_millis()
            );
            stop.stop(DisconnectReason::KeepaliveTimeout);
            return;
        }

        inner
            .pongs
            .record_ping_sent();
        if let Err(e) = inner
            .write_action(&ManagerAction::ping(), None)
            .await
        {
            warn!("[KEEPALIVE] Ping write failed: {}", e);
            stop.stop(DisconnectReason::IoError(e.to_string()));
            return;
        }
        trace!("[KEEPALIVE] Ping sent");
    }
}

/// Background reader loop
async fn reader_loop(
    inner: Arc<Inner>,
    reader: OwnedReadHalf,
    stop: Arc<SessionStop>,
    banner_tx: oneshot::Sender<String>,
) -> DisconnectReason {
    let result = std::panic::AssertUnwindSafe(reader_loop_inner(inner, reader, stop, banner_tx));
    match futures_util::FutureExt::catch_unwind(result).await {
        Ok(reason) => reason,
        Err(_) => {
            error!("reader task panicked");
            DisconnectReason::IoError("reader task panicked".to_string())
        }
    }
}

async fn reader_loop_inner(
    inner: Arc<Inner>,
    mut reader: OwnedReadHalf,
    stop: Arc<SessionStop>,
    banner_tx: oneshot::Sender<String>,
) -> DisconnectReason {
    let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];
    let mut framer = LineFramer::new();
    let mut assembler = PacketAssembler::new();
    let mut banner_tx = Some(banner_tx);
    let poll = inner
        .config
        .poll_interval();

    loop {
        if let Some(reason) = stop.reason() {
            debug!("[RECV] Reader stopping: {}", reason);
            return reason;
        }

        let read_result = tokio::select! {
            _ = stop.notify.notified() => continue,
            r = timeout(poll, reader.read(&mut read_buffer)) => r,
        };

        match read_result {
            Ok(Ok(0)) => {
                info!("[RECV] Connection closed (EOF)");
                return DisconnectReason::ConnectionClosed;
            }
            Ok(Ok(n)) => {
                trace!("[RECV] Read {} bytes from socket", n);
                framer.push(&read_buffer[..n]);
                while let Some(line) = framer.next_line() {
                    if let Some(packet) = assembler.feed(&line) {
                        inner.handle_packet(packet, &mut banner_tx, &stop);
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("[RECV] Read error: {}", e);
                return DisconnectReason::IoError(e.to_string());
            }
            Err(_) => {
                // Idle; loop back to check the stop flag
            }
        }
    }
}

impl ManagerConnection {
    /// Create a connection using the process-wide event registry.
    ///
    /// Nothing touches the network until [`login`](Self::login).
    pub fn new(config: ManagerConfig) -> (Self, ManagerEventStream) {
        Self::with_registry(config, EventRegistry::shared())
    }

    /// Create a connection with its own event registry.
    pub fn with_registry(
        config: ManagerConfig,
        registry: Arc<EventRegistry>,
    ) -> (Self, ManagerEventStream) {
        let queue_size = config
            .event_queue_size
            .max(1);
        let (event_tx, event_rx) = mpsc::channel(queue_size);
        let (state_tx, status_rx) = watch::channel(ConnectionState::Disconnected);
        let (closing_tx, _) = watch::channel(false);

        let dispatcher = EventDispatcher::new(
            config.dispatch_mode,
            config.fire_unhandled_events,
            event_tx,
        );

        let inner = Arc::new(Inner {
            correlator: Correlator::new(),
            dispatcher,
            registry,
            writer: Mutex::new(None),
            state_tx,
            closing_tx,
            banner: RwLock::new(None),
            version: RwLock::new(None),
            reconnect_enabled: AtomicBool::new(false),
            pongs: PongTracker::new(),
            current_stop: StdMutex::new(None),
            supervisor: StdMutex::new(None),
            config,
        });

        let stream = ManagerEventStream {
            rx: event_rx,
            status_rx,
        };
        (Self { inner }, stream)
    }

    /// Connect and authenticate.
    ///
    /// Fails with [`AmiError::AlreadyConnected`] on a live connection and
    /// [`AmiError::ConnectionClosed`] after [`close`](Self::close). A failed
    /// login leaves the connection [`Disconnected`](ConnectionState::Disconnected)
    /// and is never retried automatically; reconnection only covers sessions
    /// lost after a successful login.
    pub async fn login(&self) -> AmiResult<()> {
        let inner = &self.inner;
        let mut admitted = Err(AmiError::AlreadyConnected);
        inner
            .state_tx
            .send_if_modified(|state| match state {
                ConnectionState::Disconnected => {
                    *state = ConnectionState::Connecting;
                    admitted = Ok(());
                    true
                }
                ConnectionState::Closed(_) => {
                    admitted = Err(AmiError::ConnectionClosed);
                    false
                }
                _ => false,
            });
        admitted?;

        let mut session = match inner
            .establish_session()
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!("[CONNECT] Login failed: {}", e);
                if inner.is_closing() {
                    inner.set_state(ConnectionState::Closed(DisconnectReason::ClientRequested));
                } else {
                    inner.set_state(ConnectionState::Disconnected);
                }
                return Err(e);
            }
        };

        inner
            .reconnect_enabled
            .store(inner.config.reconnect.enabled, Ordering::Relaxed);
        if inner.is_closing() {
            session
                .stop
                .stop(DisconnectReason::ClientRequested);
        } else {
            inner.session_up(&mut session);
        }

        let handle = tokio::spawn(supervise(inner.clone(), session));
        *lock(&inner.supervisor) = Some(handle);
        Ok(())
    }

    /// Send an action and wait for its response with the configured default
    /// timeout.
    ///
    /// A `Response: Error` is returned as `Ok`; use
    /// [`ManagerResponse::into_result`] to turn it into an error.
    pub async fn send_action(&self, action: ManagerAction) -> AmiResult<ManagerResponse> {
        self.send_action_timeout(action, self.inner.config.response_timeout())
            .await
    }

    /// Send an action and wait up to `limit` for its response.
    pub async fn send_action_timeout(
        &self,
        action: ManagerAction,
        limit: Duration,
    ) -> AmiResult<ManagerResponse> {
        self.inner
            .ensure_connected()?;
        self.inner
            .request(&action, limit)
            .await
    }

    /// Like [`send_action_timeout`](Self::send_action_timeout), abandoned
    /// with [`AmiError::Cancelled`] when `cancel` resolves first.
    ///
    /// The request is deregistered; an action already written is not recalled.
    pub async fn send_action_cancellable<F>(
        &self,
        action: ManagerAction,
        limit: Duration,
        cancel: F,
    ) -> AmiResult<ManagerResponse>
    where
        F: Future<Output = ()>,
    {
        self.inner
            .ensure_connected()?;
        tokio::select! {
            result = self.inner.request(&action, limit) => result,
            _ = cancel => {
                debug!("{} cancelled by caller", action.name());
                Err(AmiError::Cancelled)
            }
        }
    }

    /// Send an action and return at once; `callback` gets the response.
    ///
    /// With `limit`, the callback receives [`AmiError::Timeout`] if nothing
    /// arrives in time. If the session drops first it receives
    /// [`AmiError::ConnectionClosed`]. Errors returned here mean the action
    /// was not sent and the callback will not run. Returns the correlation key.
    pub async fn send_action_with_callback<F>(
        &self,
        action: ManagerAction,
        callback: F,
        limit: Option<Duration>,
    ) -> AmiResult<u64>
    where
        F: FnOnce(AmiResult<ManagerResponse>) + Send + 'static,
    {
        let inner = &self.inner;
        inner.ensure_connected()?;
        let internal_id = inner
            .correlator
            .next_internal_id();
        let hash = inner
            .correlator
            .register(
                &internal_id,
                action.name(),
                ResponseSink::Callback(Box::new(callback)),
            )?;

        if let Err(e) = inner
            .write_action(&action, Some(&internal_id))
            .await
        {
            inner
                .correlator
                .deregister(hash);
            return Err(e);
        }

        if let Some(limit) = limit {
            let inner = inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                if let Some(sink) = inner
                    .correlator
                    .take_pending(&internal_id)
                {
                    debug!("{} timed out after {}ms", internal_id, limit.as_millis());
                    sink.deliver(Err(AmiError::Timeout {
                        timeout_ms: limit.as_millis() as u64,
                    }));
                }
            });
        }
        Ok(hash)
    }

    /// Send an action without tracking its response. Returns the correlation
    /// key embedded in the `ActionID`; the reply is logged and dropped.
    pub async fn send_action_no_reply(&self, action: ManagerAction) -> AmiResult<u64> {
        let inner = &self.inner;
        inner.ensure_connected()?;
        let internal_id = inner
            .correlator
            .next_internal_id();
        inner
            .write_action(&action, Some(&internal_id))
            .await?;
        Ok(crate::correlator::correlation_hash(&internal_id))
    }

    /// Send an action that answers with a response plus a list of events,
    /// and collect both until the completion event.
    ///
    /// The action must declare its completion kind
    /// ([`ManagerAction::completes_with`]). On timeout the error carries what
    /// was collected so far.
    pub async fn send_event_generating_action(
        &self,
        action: ManagerAction,
        limit: Duration,
    ) -> AmiResult<ResponseEvents> {
        let Some(completion) = action
            .completion_event()
            .map(str::to_string)
        else {
            return Err(AmiError::MissingCompletionEvent {
                action: action
                    .name()
                    .to_string(),
            });
        };
        self.inner
            .ensure_connected()?;
        self.inner
            .request_events(&action, &completion, limit)
            .await
    }

    /// Send an untracked `Ping` and wait for any pong.
    ///
    /// Pongs are not matched by id: every waiter wakes on the next one.
    pub async fn ping(&self, limit: Duration) -> AmiResult<()> {
        let inner = &self.inner;
        inner.ensure_connected()?;
        let notified = inner
            .pongs
            .notified();
        tokio::pin!(notified);
        notified
            .as_mut()
            .enable();

        inner
            .write_action(&ManagerAction::ping(), None)
            .await?;
        timeout(limit, notified)
            .await
            .map_err(|_| AmiError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })
    }

    /// Close the connection. Idempotent.
    ///
    /// Sends a best-effort `Logoff`, stops the reader and keepalive, releases
    /// the socket and fails every pending request with
    /// [`AmiError::ConnectionClosed`]. Subscribers see one final disconnect
    /// event.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner
            .closing_tx
            .send_replace(true)
        {
            debug!("close() already called");
            return;
        }
        info!("Client requested close");
        inner
            .reconnect_enabled
            .store(false, Ordering::Relaxed);

        if inner
            .state()
            .is_connected()
        {
            let _ = timeout(
                LOGOFF_WRITE_TIMEOUT,
                inner.write_action(&ManagerAction::logoff(), None),
            )
            .await;
        }
        inner.stop_current_session(DisconnectReason::ClientRequested);

        let supervisor = lock(&inner.supervisor).take();
        match supervisor {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!("Supervisor task failed: {}", e);
                }
            }
            None => {
                inner
                    .correlator
                    .fail_all(|| AmiError::ConnectionClosed);
                let was_idle = matches!(inner.state(), ConnectionState::Disconnected);
                if was_idle {
                    inner.set_state(ConnectionState::Closed(DisconnectReason::ClientRequested));
                }
            }
        }
    }

    /// Register a handler for one event kind (any spelling: `Hangup`,
    /// `hangup`), or for every event with `None`.
    pub fn add_event_listener<F>(&self, kind: Option<&str>, handler: F) -> SubscriptionId
    where
        F: Fn(&ManagerEvent) + Send + Sync + 'static,
    {
        self.inner
            .dispatcher
            .subscribe(kind, Arc::new(handler))
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn remove_event_listener(&self, id: SubscriptionId) -> bool {
        self.inner
            .dispatcher
            .unsubscribe(id)
    }

    /// Register the field layout of a user-defined event.
    pub fn register_user_event(&self, name: &str, fields: &[(&str, FieldType)]) -> bool {
        self.inner
            .registry
            .register_user_event(name, fields)
    }

    /// The event registry used to classify incoming events.
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.inner.registry
    }

    /// Current state snapshot.
    pub fn status(&self) -> ConnectionState {
        self.inner
            .state()
    }

    /// Receiver that observes every state change.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner
            .state_tx
            .subscribe()
    }

    /// Whether actions can be sent right now.
    pub fn is_connected(&self) -> bool {
        self.status()
            .is_connected()
    }

    /// Banner of the current (or last) session, e.g. `Asterisk Call Manager/5.0.1`.
    pub fn protocol_identifier(&self) -> Option<String> {
        self.inner
            .banner
            .read()
            .ok()
            .and_then(|b| b.clone())
    }

    /// Server version detected at login.
    pub fn version(&self) -> Option<AsteriskVersion> {
        self.inner
            .version
            .read()
            .ok()
            .and_then(|v| *v)
    }

    /// Number of events dropped due to a full event queue.
    pub fn dropped_event_count(&self) -> u64 {
        self.inner
            .dispatcher
            .dropped_event_count()
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner
            .correlator
            .pending_count()
    }

    /// Time since the last keepalive pong.
    pub fn time_since_last_pong(&self) -> Option<Duration> {
        self.inner
            .pongs
            .time_since_last_pong()
    }
}

impl ManagerEventStream {
    /// Receive the next event, or None once the connection is gone.
    ///
    /// Returns `Err(AmiError::QueueFull)` if events were dropped because the
    /// application was not draining them fast enough. This is a one-time
    /// notification per overflow episode.
    pub async fn recv(&mut self) -> Option<Result<ManagerEvent, AmiError>> {
        self.rx
            .recv()
            .await
    }

    /// Whether the session is currently up.
    pub fn is_connected(&self) -> bool {
        self.status_rx
            .borrow()
            .is_connected()
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionState {
        self.status_rx
            .borrow()
            .clone()
    }
}

impl futures_util::Stream for ManagerEventStream {
    type Item = Result<ManagerEvent, AmiError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
    }
}
