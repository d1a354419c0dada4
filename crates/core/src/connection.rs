//! Managed WebSocket connection with reconnection, heartbeat, and circuit
//! breaking.
//!
//! Exchange clients compose a [`ManagedSocket`] with their wire-specific
//! subscribe messages and codecs instead of each carrying its own reconnect
//! loop. The socket:
//!
//! - reconnects with exponential backoff (1s initial, 30s cap, ±10% jitter),
//! - opens a circuit breaker for a cooldown after too many failed attempts,
//! - replays registered subscribe messages after every successful connect,
//! - sends a heartbeat ping on an interval and drops the connection when no
//!   message arrives within the idle limit,
//! - reconnects immediately on a server `Close` frame, outside the breaker
//!   count.
//!
//! Consumers receive [`SocketEvent`]s over a channel; text payloads are
//! forwarded verbatim for the owning client to decode.

use crate::error::{ExchangeError, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

// =============================================================================
// Backoff
// =============================================================================

/// Exponential backoff policy with jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on the delay.
    pub max: Duration,
    /// Jitter fraction applied to each delay (0.10 = ±10%).
    pub jitter: f64,
    /// Attempts before the circuit breaker trips.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.10,
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given zero-based attempt number, jittered.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let base = self
            .initial
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max);
        let jitter = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + jitter).max(0.0))
    }
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Time-based circuit breaker for reconnection attempts.
///
/// After tripping, [`CircuitBreaker::is_open`] reports open until the
/// cooldown elapses.
#[derive(Debug)]
pub struct CircuitBreaker {
    cooldown: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Creates a breaker with the given cooldown.
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            opened_at: None,
        }
    }

    /// Trips the breaker, starting the cooldown.
    pub fn trip(&mut self) {
        self.opened_at = Some(Instant::now());
    }

    /// Closes the breaker.
    pub fn reset(&mut self) {
        self.opened_at = None;
    }

    /// Returns true while the cooldown is running.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.opened_at
            .is_some_and(|at| at.elapsed() < self.cooldown)
    }

    /// Remaining cooldown, if open.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.opened_at.and_then(|at| {
            let elapsed = at.elapsed();
            (elapsed < self.cooldown).then(|| self.cooldown - elapsed)
        })
    }
}

// =============================================================================
// Health
// =============================================================================

/// Snapshot of a connection's health, surfaced through `get_status`.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHealth {
    /// True while the transport is established.
    pub connected: bool,
    /// True while the circuit breaker is open.
    pub breaker_open: bool,
    /// Time of the last inbound message.
    pub last_message_at: Option<DateTime<Utc>>,
    /// Last error string, if any.
    pub last_error: Option<String>,
    /// Inbound message count.
    pub messages_in: u64,
    /// Outbound message count.
    pub messages_out: u64,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
}

impl ConnectionHealth {
    /// Health is connected, breaker closed, and a message within the idle
    /// limit.
    #[must_use]
    pub fn is_healthy(&self, idle_limit: Duration) -> bool {
        if !self.connected || self.breaker_open {
            return false;
        }
        match self.last_message_at {
            Some(at) => {
                let age = Utc::now() - at;
                age.to_std().map_or(true, |age| age < idle_limit)
            }
            None => false,
        }
    }
}

// =============================================================================
// Socket Configuration and Events
// =============================================================================

/// Configuration for a [`ManagedSocket`].
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// WebSocket URL.
    pub url: String,
    /// Deadline for establishing the transport.
    pub connect_timeout: Duration,
    /// Deadline for a single outbound send.
    pub send_timeout: Duration,
    /// Ping interval.
    pub heartbeat_interval: Duration,
    /// Connection is dropped when no message arrives within this window.
    pub idle_timeout: Duration,
    /// Reconnect backoff policy.
    pub backoff: BackoffPolicy,
    /// Circuit breaker cooldown after exhausting backoff attempts.
    pub breaker_cooldown: Duration,
    /// Event channel capacity.
    pub channel_buffer: usize,
}

impl SocketConfig {
    /// Creates a config for the given URL with the standard timings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            backoff: BackoffPolicy::default(),
            breaker_cooldown: Duration::from_secs(300),
            channel_buffer: 1024,
        }
    }
}

/// Events emitted by a managed socket.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Transport established; subscriptions have been replayed.
    Connected,
    /// A text payload arrived.
    Message(String),
    /// Transport lost.
    Disconnected {
        /// Why the connection dropped.
        reason: String,
    },
}

enum SocketCommand {
    Send(String),
    Shutdown,
}

enum Disconnect {
    Shutdown,
    CloseFrame(String),
    Failed(String),
}

// =============================================================================
// Managed Socket
// =============================================================================

/// Handle to a supervised WebSocket connection.
#[derive(Clone)]
pub struct ManagedSocket {
    command_tx: mpsc::Sender<SocketCommand>,
    health: Arc<RwLock<ConnectionHealth>>,
    on_connect: Arc<RwLock<Vec<String>>>,
}

impl ManagedSocket {
    /// Spawns the connection task and returns the handle plus event stream.
    #[must_use]
    pub fn spawn(config: SocketConfig) -> (Self, mpsc::Receiver<SocketEvent>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(config.channel_buffer);
        let health = Arc::new(RwLock::new(ConnectionHealth::default()));
        let on_connect: Arc<RwLock<Vec<String>>> = Arc::new(RwLock::new(Vec::new()));

        tokio::spawn(run_socket_loop(
            config,
            command_rx,
            event_tx,
            Arc::clone(&health),
            Arc::clone(&on_connect),
        ));

        (
            Self {
                command_tx,
                health,
                on_connect,
            },
            event_rx,
        )
    }

    /// Sends a text frame over the live connection.
    ///
    /// # Errors
    /// Returns `Transport` if the connection task has stopped.
    pub async fn send(&self, text: String) -> Result<()> {
        self.command_tx
            .send(SocketCommand::Send(text))
            .await
            .map_err(|_| ExchangeError::transport("connection task stopped"))
    }

    /// Registers a message to replay after every successful connect.
    pub fn add_on_connect(&self, text: String) {
        self.on_connect.write().push(text);
    }

    /// Removes a previously registered replay message.
    pub fn remove_on_connect(&self, text: &str) {
        self.on_connect.write().retain(|m| m != text);
    }

    /// Current health snapshot.
    #[must_use]
    pub fn health(&self) -> ConnectionHealth {
        self.health.read().clone()
    }

    /// Stops the connection task.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(SocketCommand::Shutdown).await;
    }
}

// =============================================================================
// Connection Loop
// =============================================================================

async fn run_socket_loop(
    config: SocketConfig,
    mut command_rx: mpsc::Receiver<SocketCommand>,
    event_tx: mpsc::Sender<SocketEvent>,
    health: Arc<RwLock<ConnectionHealth>>,
    on_connect: Arc<RwLock<Vec<String>>>,
) {
    let mut breaker = CircuitBreaker::new(config.breaker_cooldown);
    let mut attempts: u32 = 0;

    loop {
        if let Some(remaining) = breaker.remaining() {
            health.write().breaker_open = true;
            warn!(url = %config.url, remaining = ?remaining, "Circuit breaker open");
            tokio::select! {
                _ = sleep(remaining) => {}
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(SocketCommand::Shutdown) | None => return,
                        Some(SocketCommand::Send(_)) => {
                            // Nothing to send it on; drop while disconnected.
                            continue;
                        }
                    }
                }
            }
            breaker.reset();
            health.write().breaker_open = false;
        }

        info!(url = %config.url, attempt = attempts, "Connecting WebSocket");
        let connected = timeout(config.connect_timeout, connect_async(&config.url)).await;

        let ws_stream = match connected {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                let (next, delay) =
                    record_failure(&config, &health, &event_tx, &mut breaker, attempts, e.to_string())
                        .await;
                attempts = next;
                if wait_or_shutdown(delay, &mut command_rx).await {
                    return;
                }
                continue;
            }
            Err(_) => {
                let (next, delay) = record_failure(
                    &config,
                    &health,
                    &event_tx,
                    &mut breaker,
                    attempts,
                    "connect timeout".to_string(),
                )
                .await;
                attempts = next;
                if wait_or_shutdown(delay, &mut command_rx).await {
                    return;
                }
                continue;
            }
        };

        breaker.reset();
        attempts = 0;
        {
            let mut h = health.write();
            h.connected = true;
            h.breaker_open = false;
            h.reconnect_attempts = 0;
            h.last_error = None;
        }
        info!(url = %config.url, "WebSocket connected");

        let disconnect = run_connected(
            ws_stream,
            &config,
            &mut command_rx,
            &event_tx,
            &health,
            &on_connect,
        )
        .await;

        health.write().connected = false;

        match disconnect {
            Disconnect::Shutdown => {
                info!(url = %config.url, "WebSocket shutdown requested");
                return;
            }
            Disconnect::CloseFrame(reason) => {
                // Server-initiated close: reconnect immediately, outside the
                // breaker count.
                info!(url = %config.url, reason = %reason, "Close frame, reconnecting");
                let _ = event_tx.send(SocketEvent::Disconnected { reason }).await;
            }
            Disconnect::Failed(reason) => {
                let (next, delay) =
                    record_failure(&config, &health, &event_tx, &mut breaker, attempts, reason)
                        .await;
                attempts = next;
                if wait_or_shutdown(delay, &mut command_rx).await {
                    return;
                }
            }
        }
    }
}

/// Records one failed attempt, returning the updated count and the backoff
/// delay to wait before retrying (none once the breaker trips).
async fn record_failure(
    config: &SocketConfig,
    health: &Arc<RwLock<ConnectionHealth>>,
    event_tx: &mpsc::Sender<SocketEvent>,
    breaker: &mut CircuitBreaker,
    attempts: u32,
    reason: String,
) -> (u32, Option<Duration>) {
    let attempts = attempts + 1;
    {
        let mut h = health.write();
        h.connected = false;
        h.reconnect_attempts = attempts;
        h.last_error = Some(reason.clone());
    }
    warn!(url = %config.url, attempt = attempts, reason = %reason, "Connection failed");
    let _ = event_tx.send(SocketEvent::Disconnected { reason }).await;

    if attempts >= config.backoff.max_attempts {
        breaker.trip();
        return (0, None);
    }

    let delay = config.backoff.delay_for(attempts - 1);
    debug!(delay = ?delay, "Backing off before reconnect");
    (attempts, Some(delay))
}

/// Sleeps the backoff delay while staying responsive to shutdown. Returns
/// true when the loop should exit.
async fn wait_or_shutdown(
    delay: Option<Duration>,
    command_rx: &mut mpsc::Receiver<SocketCommand>,
) -> bool {
    let Some(delay) = delay else { return false };
    tokio::select! {
        _ = sleep(delay) => false,
        cmd = command_rx.recv() => match cmd {
            Some(SocketCommand::Shutdown) | None => true,
            // Nothing to send it on while disconnected; drop it.
            Some(SocketCommand::Send(_)) => false,
        },
    }
}

async fn run_connected(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    config: &SocketConfig,
    command_rx: &mut mpsc::Receiver<SocketCommand>,
    event_tx: &mpsc::Sender<SocketEvent>,
    health: &Arc<RwLock<ConnectionHealth>>,
    on_connect: &Arc<RwLock<Vec<String>>>,
) -> Disconnect {
    let (mut write, mut read) = ws_stream.split();

    // Replay subscriptions before announcing the connection.
    let replay: Vec<String> = on_connect.read().clone();
    for msg in replay {
        debug!(message = %msg, "Replaying on-connect message");
        if let Err(e) = write.send(Message::Text(msg)).await {
            return Disconnect::Failed(format!("replay failed: {e}"));
        }
        health.write().messages_out += 1;
    }
    let _ = event_tx.send(SocketEvent::Connected).await;

    let mut heartbeat = interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut idle_check = interval(Duration::from_secs(1).min(config.idle_timeout));
    idle_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_message = Instant::now();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(SocketCommand::Send(text)) => {
                        let sent = timeout(config.send_timeout, write.send(Message::Text(text))).await;
                        match sent {
                            Ok(Ok(())) => health.write().messages_out += 1,
                            Ok(Err(e)) => return Disconnect::Failed(format!("send failed: {e}")),
                            Err(_) => return Disconnect::Failed("send timeout".to_string()),
                        }
                    }
                    Some(SocketCommand::Shutdown) | None => {
                        let _ = write.close().await;
                        return Disconnect::Shutdown;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    return Disconnect::Failed(format!("ping failed: {e}"));
                }
                health.write().messages_out += 1;
            }

            _ = idle_check.tick() => {
                if last_message.elapsed() >= config.idle_timeout {
                    return Disconnect::Failed(format!(
                        "idle timeout after {:?}", config.idle_timeout
                    ));
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_message = Instant::now();
                        {
                            let mut h = health.write();
                            h.messages_in += 1;
                            h.last_message_at = Some(Utc::now());
                        }
                        let _ = event_tx.send(SocketEvent::Message(text)).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_message = Instant::now();
                        if let Ok(text) = String::from_utf8(data) {
                            {
                                let mut h = health.write();
                                h.messages_in += 1;
                                h.last_message_at = Some(Utc::now());
                            }
                            let _ = event_tx.send(SocketEvent::Message(text)).await;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_message = Instant::now();
                        if write.send(Message::Pong(data)).await.is_err() {
                            return Disconnect::Failed("pong failed".to_string());
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_message = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "close".to_string());
                        return Disconnect::CloseFrame(reason);
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        return Disconnect::Failed(e.to_string());
                    }
                    None => {
                        return Disconnect::Failed("stream ended".to_string());
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Backoff Tests ====================

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for(30), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            let d = policy.delay_for(2);
            assert!(d >= Duration::from_millis(3600), "delay {d:?} below -10%");
            assert!(d <= Duration::from_millis(4400), "delay {d:?} above +10%");
        }
    }

    // ==================== Circuit Breaker Tests ====================

    #[test]
    fn test_breaker_open_then_expires() {
        let mut breaker = CircuitBreaker::new(Duration::from_millis(30));
        assert!(!breaker.is_open());
        breaker.trip();
        assert!(breaker.is_open());
        assert!(breaker.remaining().is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(!breaker.is_open());
        assert!(breaker.remaining().is_none());
    }

    #[test]
    fn test_breaker_reset() {
        let mut breaker = CircuitBreaker::new(Duration::from_secs(300));
        breaker.trip();
        assert!(breaker.is_open());
        breaker.reset();
        assert!(!breaker.is_open());
    }

    // ==================== Health Tests ====================

    #[test]
    fn test_health_requires_recent_message() {
        let idle = Duration::from_secs(120);
        let mut health = ConnectionHealth {
            connected: true,
            ..Default::default()
        };
        // No message yet: not healthy.
        assert!(!health.is_healthy(idle));

        health.last_message_at = Some(Utc::now());
        assert!(health.is_healthy(idle));

        health.last_message_at = Some(Utc::now() - chrono::Duration::seconds(121));
        assert!(!health.is_healthy(idle));
    }

    #[test]
    fn test_health_breaker_and_disconnect() {
        let idle = Duration::from_secs(120);
        let mut health = ConnectionHealth {
            connected: true,
            last_message_at: Some(Utc::now()),
            ..Default::default()
        };
        assert!(health.is_healthy(idle));

        health.breaker_open = true;
        assert!(!health.is_healthy(idle));

        health.breaker_open = false;
        health.connected = false;
        assert!(!health.is_healthy(idle));
    }

    // ==================== Managed Socket Tests ====================

    mod socket {
        use super::*;
        use tokio::net::TcpListener;

        /// Accepts connections and sends one text frame per connection,
        /// recording the first inbound message of each session.
        async fn spawn_server(
            sessions: usize,
            payload: &'static str,
        ) -> (String, mpsc::UnboundedReceiver<String>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("ws://{}", listener.local_addr().unwrap());
            let (seen_tx, seen_rx) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                for _ in 0..sessions {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    let (mut write, mut read) = ws.split();
                    if let Some(Ok(Message::Text(first))) = read.next().await {
                        let _ = seen_tx.send(first);
                    }
                    let _ = write.send(Message::Text(payload.to_string())).await;
                    // Drop the connection to force a reconnect.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            });

            (url, seen_rx)
        }

        fn fast_config(url: String) -> SocketConfig {
            let mut config = SocketConfig::new(url);
            config.backoff = BackoffPolicy {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(50),
                jitter: 0.0,
                max_attempts: 10,
            };
            config
        }

        #[tokio::test]
        async fn test_connects_and_receives() {
            let (url, mut seen) = spawn_server(1, r#"{"type":"tick"}"#).await;
            let (socket, mut events) = ManagedSocket::spawn(fast_config(url));
            socket.add_on_connect(r#"{"type":"subscribe"}"#.to_string());

            let mut got_connected = false;
            let mut got_message = false;
            let deadline = tokio::time::timeout(Duration::from_secs(5), async {
                while let Some(event) = events.recv().await {
                    match event {
                        SocketEvent::Connected => got_connected = true,
                        SocketEvent::Message(text) => {
                            assert_eq!(text, r#"{"type":"tick"}"#);
                            got_message = true;
                            break;
                        }
                        SocketEvent::Disconnected { .. } => {}
                    }
                }
            });
            deadline.await.unwrap();

            assert!(got_connected);
            assert!(got_message);
            assert_eq!(seen.recv().await.unwrap(), r#"{"type":"subscribe"}"#);

            let health = socket.health();
            assert!(health.messages_in >= 1);
            assert!(health.last_message_at.is_some());

            socket.shutdown().await;
        }

        #[tokio::test]
        async fn test_reconnects_and_replays_subscriptions() {
            let (url, mut seen) = spawn_server(2, r#"{"type":"tick"}"#).await;
            let (socket, mut events) = ManagedSocket::spawn(fast_config(url));
            socket.add_on_connect(r#"{"type":"subscribe"}"#.to_string());

            let mut connects = 0;
            let deadline = tokio::time::timeout(Duration::from_secs(5), async {
                while let Some(event) = events.recv().await {
                    if matches!(event, SocketEvent::Connected) {
                        connects += 1;
                        if connects == 2 {
                            break;
                        }
                    }
                }
            });
            deadline.await.unwrap();
            assert_eq!(connects, 2);

            // The subscription was replayed on the second session.
            assert_eq!(seen.recv().await.unwrap(), r#"{"type":"subscribe"}"#);
            assert_eq!(seen.recv().await.unwrap(), r#"{"type":"subscribe"}"#);

            socket.shutdown().await;
        }
    }
}
