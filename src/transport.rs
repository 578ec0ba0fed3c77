//! Reconnecting WebSocket client for the capture process endpoint.
//!
//! # Architecture
//!
//! ```text
//!   TransportClient                      connection task (one per run)
//!         │                                      │
//!         │  connect() ── spawn ───────────────► │  ws::open ─────► Open
//!         │                                      │      │
//!         │  send("start") ── mpsc + oneshot ──► │  sender.command
//!         │                                      │      │
//!         │  wait_open() ◄── watch<ConnectionState> ────┤
//!         │                                      │  next_frame ───► Pipeline
//!         │  close() ── CancellationToken ─────► │      │
//!         │                                      │  error ──► Reconnecting
//!         ▼                                      │  sleep(delay), retry
//! ```
//!
//! The connection task is the single owner of the socket. It retries after a
//! fixed delay, forever, until its run is cancelled by [`TransportClient::close`].
//! A close frame from the peer ends the run without a retry.
//!
//! # States
//!
//! `Disconnected → Connecting → Open → Closing → Disconnected`, with
//! `Reconnecting` entered on any transport error while the run is alive.
//! Commands may only be sent in `Open`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::pipeline::Pipeline;
use crate::ws::{self, Frame, LinkReceiver, LinkSender};

/// How long a graceful close may take before the socket is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection state of the transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No run is active.
    #[default]
    Disconnected,
    /// First connection attempt of a run is in flight.
    Connecting,
    /// Connected; commands may be sent.
    Open,
    /// A close was requested and the run is shutting down.
    Closing,
    /// A transport error occurred; retrying after the reconnect delay.
    Reconnecting {
        /// Number of consecutive failed attempts.
        attempt: u32,
    },
}

impl ConnectionState {
    /// Whether commands may be sent.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Whether no further transition to `Open` can happen without a new run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Closing)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Open => f.write_str("open"),
            Self::Closing => f.write_str("closing"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
        }
    }
}

/// Outgoing command awaiting its send outcome.
#[derive(Debug)]
struct OutgoingCommand {
    text: String,
    reply: oneshot::Sender<Result<()>>,
}

/// Handles of one connection run.
#[derive(Debug)]
struct TransportRun {
    cancel: CancellationToken,
    command_tx: mpsc::UnboundedSender<OutgoingCommand>,
    task: JoinHandle<()>,
}

/// Everything the connection task needs, cloned out of the client.
#[derive(Debug, Clone)]
struct LoopContext {
    url: String,
    address: String,
    reconnect_delay: Duration,
    pipeline: Pipeline,
    logger: crate::config::Logger,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl LoopContext {
    fn set_state(&self, new_state: ConnectionState) {
        log::debug!("[Transport] State -> {}", new_state);
        self.state.send_replace(new_state);
    }
}

/// Client side of the duplex channel to the capture process.
#[derive(Debug)]
pub struct TransportClient {
    context: LoopContext,
    run: Mutex<Option<TransportRun>>,
}

impl TransportClient {
    /// Client for the endpoint of `config`, feeding inbound messages to `pipeline`.
    ///
    /// Nothing connects until [`Self::connect`] is called.
    #[must_use]
    pub fn new(config: &Config, pipeline: Pipeline) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            context: LoopContext {
                url: config.endpoint_url(),
                address: format!("{}:{}", config.network_device, config.port),
                reconnect_delay: config.reconnect_delay,
                pipeline,
                logger: config.logger.clone(),
                state: Arc::new(state),
            },
            run: Mutex::new(None),
        }
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.context.url
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.context.state.borrow().clone()
    }

    /// Receiver observing every state transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.context.state.subscribe()
    }

    /// Whether a connection run is alive (connecting, open or retrying).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .expect("transport run mutex poisoned")
            .as_ref()
            .is_some_and(|run| !run.task.is_finished())
    }

    /// Start a connection run unless one is already alive.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut run = self.run.lock().expect("transport run mutex poisoned");
        if run.as_ref().is_some_and(|r| !r.task.is_finished()) {
            log::debug!("[Transport] Connect requested while a run is alive, ignoring");
            return;
        }

        let cancel = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        self.context.set_state(ConnectionState::Connecting);
        let task = tokio::spawn(run_connection_loop(
            self.context.clone(),
            cancel.clone(),
            command_rx,
        ));

        *run = Some(TransportRun {
            cancel,
            command_tx,
            task,
        });
    }

    /// Wait until the transport is `Open`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Timeout`] once `timeout` elapses and
    /// [`SessionError::Cancelled`] if the run ends first.
    pub async fn wait_open(&self, timeout: Option<Duration>) -> Result<()> {
        let mut rx = self.watch_state();
        let wait = async move {
            let open = rx
                .wait_for(|state| state.is_open() || state.is_terminal())
                .await
                .map_err(|_closed| SessionError::Cancelled)?
                .is_open();
            if open {
                Ok(())
            } else {
                Err(SessionError::Cancelled)
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_elapsed| SessionError::Timeout(limit))?,
            None => wait.await,
        }
    }

    /// Send a command string. The transport must be `Open`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotOpen`] in any other state and
    /// [`SessionError::Send`] if the write fails or the run ends first.
    pub async fn send(&self, command: &str) -> Result<()> {
        let state = self.state();
        if !state.is_open() {
            return Err(SessionError::NotOpen(state));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let run = self.run.lock().expect("transport run mutex poisoned");
            let Some(run) = run.as_ref() else {
                return Err(SessionError::NotOpen(self.state()));
            };
            run.command_tx
                .send(OutgoingCommand {
                    text: command.to_string(),
                    reply: reply_tx,
                })
                .map_err(|_dropped| SessionError::Send("transport task has exited".into()))?;
        }

        reply_rx
            .await
            .map_err(|_dropped| SessionError::Send("transport closed before sending".into()))?
    }

    /// Close the channel and cancel any pending reconnect. Idempotent.
    pub async fn close(&self) {
        let run = self.run.lock().expect("transport run mutex poisoned").take();
        let Some(run) = run else {
            self.context.set_state(ConnectionState::Disconnected);
            return;
        };

        if !run.task.is_finished() {
            self.context.set_state(ConnectionState::Closing);
        }
        run.cancel.cancel();
        if let Err(e) = run.task.await {
            log::warn!("[Transport] Connection task ended abnormally: {}", e);
        }
        self.context.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        if let Ok(mut run) = self.run.lock() {
            if let Some(run) = run.take() {
                run.cancel.cancel();
            }
        }
    }
}

/// Result of the inner message loop.
enum LoopExit {
    /// The run was cancelled.
    Shutdown,
    /// The peer sent a close frame.
    Closed,
    /// Transport error; reconnect.
    Errored(String),
}

/// Connection loop of one run: connect, pump messages, retry on error.
async fn run_connection_loop(
    ctx: LoopContext,
    cancel: CancellationToken,
    mut command_rx: mpsc::UnboundedReceiver<OutgoingCommand>,
) {
    let mut attempt: u32 = 0;

    loop {
        log::info!("[Transport] Connecting to {}", ctx.url);

        let connected = tokio::select! {
            result = ws::open(&ctx.url) => result,
            () = cancel.cancelled() => break,
        };

        let error = match connected {
            Ok((mut sender, mut receiver, status)) => {
                if status == 101 {
                    ctx.logger
                        .log("ZanarkandWrapper connection protocol upgraded.");
                }
                attempt = 0;
                ctx.set_state(ConnectionState::Open);
                ctx.logger
                    .log(format!("Connected to ZanarkandWrapper on {}!", ctx.address));

                match run_message_loop(&ctx, &mut sender, &mut receiver, &mut command_rx, &cancel)
                    .await
                {
                    LoopExit::Shutdown => {
                        if tokio::time::timeout(CLOSE_TIMEOUT, sender.shutdown())
                            .await
                            .is_err()
                        {
                            log::debug!("[Transport] Close handshake timed out");
                        }
                        ctx.logger.log("Connection with ZanarkandWrapper closed.");
                        break;
                    }
                    LoopExit::Closed => {
                        ctx.logger.log("Connection with ZanarkandWrapper closed.");
                        break;
                    }
                    LoopExit::Errored(message) => message,
                }
            }
            Err(e) => format!("{e:#}"),
        };

        attempt = attempt.saturating_add(1);
        ctx.set_state(ConnectionState::Reconnecting { attempt });
        ctx.logger.log(format!(
            "Connection errored with message \"{}\", reconnecting in {}...",
            error,
            describe_delay(ctx.reconnect_delay)
        ));

        tokio::select! {
            () = tokio::time::sleep(ctx.reconnect_delay) => {}
            () = cancel.cancelled() => {
                log::debug!("[Transport] Cancelled during reconnect delay");
                break;
            }
        }
    }

    // Fail commands that never reached the socket.
    command_rx.close();
    while let Ok(command) = command_rx.try_recv() {
        let _ = command
            .reply
            .send(Err(SessionError::Send("transport closed".into())));
    }

    ctx.set_state(ConnectionState::Disconnected);
}

/// Pump one open connection until it ends or the run is cancelled.
///
/// Inbound frames are handed to the pipeline synchronously, one at a time.
async fn run_message_loop(
    ctx: &LoopContext,
    sender: &mut LinkSender,
    receiver: &mut LinkReceiver,
    command_rx: &mut mpsc::UnboundedReceiver<OutgoingCommand>,
    cancel: &CancellationToken,
) -> LoopExit {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return LoopExit::Shutdown,

            frame = receiver.next_frame() => match frame {
                Some(Ok(Frame::Text(text))) => {
                    ctx.pipeline.handle_text(&text);
                }
                Some(Ok(Frame::Binary(data))) => {
                    ctx.pipeline.handle_binary(&data);
                }
                Some(Ok(Frame::Closed { code, reason })) => {
                    log::info!("[Transport] Closed by peer ({}): {}", code, reason);
                    return LoopExit::Closed;
                }
                Some(Err(e)) => return LoopExit::Errored(format!("{e:#}")),
                None => return LoopExit::Errored("stream ended without a close frame".into()),
            },

            Some(command) = command_rx.recv() => {
                log::debug!("[Transport] Sending command '{}'", command.text);
                match sender.command(&command.text).await {
                    Ok(()) => {
                        let _ = command.reply.send(Ok(()));
                    }
                    Err(e) => {
                        let message = format!("{e:#}");
                        let _ = command.reply.send(Err(SessionError::Send(message.clone())));
                        return LoopExit::Errored(message);
                    }
                }
            }
        }
    }
}

/// Human wording of the reconnect delay, e.g. `1 second` or `250ms`.
fn describe_delay(delay: Duration) -> String {
    let millis = delay.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    match millis / 1000 {
        1 => "1 second".to_string(),
        secs => format!("{secs} seconds"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Logger, Options};
    use crate::filter::SharedFilter;
    use crate::postprocess::PostprocessorRegistry;
    use crate::router::SharedRouter;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    fn client_for(port: u16, router: &SharedRouter) -> TransportClient {
        client_with_logger(port, router, Logger::noop())
    }

    fn client_with_logger(port: u16, router: &SharedRouter, logger: Logger) -> TransportClient {
        let options = Options::new()
            .network_device("127.0.0.1")
            .port(port)
            .no_exe(true)
            .logger(logger)
            .reconnect_delay(Duration::from_millis(50));
        let config = Config::resolve(&options).unwrap();
        let pipeline = Pipeline::new(
            SharedFilter::new(),
            Arc::new(PostprocessorRegistry::new()),
            router.clone(),
            Logger::noop(),
        );
        TransportClient::new(&config, pipeline)
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert_eq!(
            ConnectionState::Reconnecting { attempt: 2 }.to_string(),
            "reconnecting (attempt 2)"
        );
        assert!(ConnectionState::Closing.is_terminal());
        assert!(!ConnectionState::Reconnecting { attempt: 1 }.is_terminal());
    }

    #[test]
    fn test_describe_delay() {
        assert_eq!(describe_delay(Duration::from_secs(1)), "1 second");
        assert_eq!(describe_delay(Duration::from_secs(3)), "3 seconds");
        assert_eq!(describe_delay(Duration::from_millis(250)), "250ms");
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let client = client_for(1, &SharedRouter::new());
        let result = client.send("start").await;
        assert!(matches!(
            result,
            Err(SessionError::NotOpen(ConnectionState::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_wait_open_times_out_while_reconnecting() {
        let client = client_for(1, &SharedRouter::new());
        client.connect();

        let result = client.wait_open(Some(Duration::from_millis(200))).await;
        assert!(matches!(result, Err(SessionError::Timeout(_))));
        assert!(matches!(
            client.state(),
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        ));

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_wait() {
        let client = Arc::new(client_for(1, &SharedRouter::new()));
        client.connect();

        let waiter = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.wait_open(None).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.close().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_open_send_and_dispatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let router = SharedRouter::new();
        let mut next = router.once("any");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"opcode": 1, "type": "hello"}"#.into()))
                .await
                .unwrap();
            let command = ws.next().await.unwrap().unwrap();
            (ws, command)
        });

        let client = client_for(port, &router);
        client.connect();
        client.wait_open(Some(Duration::from_secs(5))).await.unwrap();
        client.send("start").await.unwrap();

        let (_ws, command) = server.await.unwrap();
        assert_eq!(command, Message::Text("start".into()));

        let packet = tokio::time::timeout(Duration::from_secs(5), &mut next)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.packet_type, "hello");

        client.close().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            // First connection: drop the socket without a close handshake.
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        });

        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&lines);
        let client = client_with_logger(
            port,
            &SharedRouter::new(),
            Logger::new(move |line| sink.lock().unwrap().push(line.to_string())),
        );
        client.connect();

        let _second = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        client.wait_open(Some(Duration::from_secs(5))).await.unwrap();
        assert!(client.is_running());

        {
            let lines = lines.lock().unwrap();
            let connected = lines.iter().filter(|l| l.starts_with("Connected to")).count();
            assert_eq!(connected, 2, "log: {lines:?}");
            assert!(lines
                .iter()
                .any(|l| l.starts_with("Connection errored with message")));
        }

        client.close().await;
    }

    #[tokio::test]
    async fn test_peer_close_ends_run_without_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let client = client_for(port, &SharedRouter::new());
        client.connect();
        let mut states = client.watch_state();

        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = client_for(1, &SharedRouter::new());
        client.close().await;
        client.connect();
        client.close().await;
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
