//! WebSocket signaling server: bind, accept loop, and per-connection tasks.
//!
//! This module is responsible for:
//!
//! 1. Binding the listener with address reuse, retrying with a fixed backoff
//!    while the port is still held by a previous instance.
//! 2. Accepting connections and upgrading each one to a WebSocket.
//! 3. Running one task per connection that feeds text frames and peer events
//!    into the [`SessionRegistry`], in arrival order.
//! 4. Writing outbound signaling messages through a per-connection queue so
//!    that registry calls never wait on the socket.
//! 5. Stopping when the `running` flag is cleared.
//!
//! [`SignalingServer`] wraps all of this with start/stop so a restart always
//! stops the previous listener before binding again.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use mirror_core::{encode_outbound, OutboundMessage};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};

use crate::application::{SendError, SessionHandle, SessionRegistry, SignalSink};
use crate::domain::config::{ConfigError, ServerConfig};

/// How long the accept loop waits before re-checking the `running` flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// How long a closing connection waits for queued frames to flush.
const WRITER_FLUSH: Duration = Duration::from_millis(500);

const LISTEN_BACKLOG: u32 = 1024;

// ── Outbound signaling ────────────────────────────────────────────────────────

/// [`SignalSink`] backed by a connection's outbound frame queue.
pub struct WsSignalSink {
    tx: mpsc::UnboundedSender<WsMessage>,
}

impl WsSignalSink {
    pub fn new(tx: mpsc::UnboundedSender<WsMessage>) -> Self {
        Self { tx }
    }
}

impl SignalSink for WsSignalSink {
    fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        let text = encode_outbound(message)?;
        debug!("→ {}", message.type_name());
        self.tx
            .send(WsMessage::Text(text))
            .map_err(|_| SendError::Closed)
    }
}

// ── Server lifecycle ──────────────────────────────────────────────────────────

struct RunningServer {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Owns the listener task.  At most one listener runs at a time.
pub struct SignalingServer {
    addr: SocketAddr,
    bind_retry: Duration,
    rebind_delay: Duration,
    shutdown_grace: Duration,
    registry: Arc<SessionRegistry>,
    current: Mutex<Option<RunningServer>>,
    bound_tx: watch::Sender<Option<SocketAddr>>,
}

impl SignalingServer {
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if the configured bind address is not an IP.
    pub fn new(config: &ServerConfig, registry: Arc<SessionRegistry>) -> Result<Self, ConfigError> {
        let (bound_tx, _) = watch::channel(None);
        Ok(Self {
            addr: config.bind_addr()?,
            bind_retry: config.bind_retry_backoff(),
            rebind_delay: config.rebind_delay(),
            shutdown_grace: config.shutdown_grace(),
            registry,
            current: Mutex::new(None),
            bound_tx,
        })
    }

    /// Starts listening in the background.
    ///
    /// A listener that is already running is stopped first, and binding waits
    /// `rebind_delay` after that so the old socket is released.
    pub async fn start(&self) {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            info!("restarting signaling server");
            self.stop_running(previous).await;
            sleep(self.rebind_delay).await;
        }

        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run_listener(
            self.addr,
            self.bind_retry,
            Arc::clone(&self.registry),
            Arc::clone(&running),
            self.bound_tx.clone(),
        ));
        *current = Some(RunningServer { running, task });
    }

    /// Stops the listener.  Returns once the accept loop has exited, or after
    /// the shutdown grace period.  Idempotent.
    pub async fn stop(&self) {
        if let Some(previous) = self.current.lock().await.take() {
            self.stop_running(previous).await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// Waits until the listener is bound and returns its address.
    ///
    /// Returns `None` if the server was dropped before binding.
    pub async fn wait_bound(&self) -> Option<SocketAddr> {
        let mut rx = self.bound_tx.subscribe();
        rx.wait_for(Option::is_some).await.ok().and_then(|addr| *addr)
    }

    async fn stop_running(&self, server: RunningServer) {
        server.running.store(false, Ordering::SeqCst);
        self.bound_tx.send_replace(None);
        let abort = server.task.abort_handle();
        if timeout(self.shutdown_grace, server.task).await.is_err() {
            warn!(
                "signaling listener did not stop within {:?}; aborting",
                self.shutdown_grace
            );
            abort.abort();
        }
    }
}

async fn run_listener(
    addr: SocketAddr,
    backoff: Duration,
    registry: Arc<SessionRegistry>,
    running: Arc<AtomicBool>,
    bound_tx: watch::Sender<Option<SocketAddr>>,
) {
    let Some(listener) = bind_with_retry(addr, backoff, &running).await else {
        return;
    };
    if let Ok(local) = listener.local_addr() {
        bound_tx.send_replace(Some(local));
    }
    if let Err(e) = serve(listener, registry, running).await {
        error!("signaling server stopped: {e:#}");
    }
}

/// Binds `addr` with `SO_REUSEADDR`, retrying every `backoff` until it
/// succeeds or `running` is cleared.
///
/// Returns `None` only when stopped before a bind succeeded.
pub async fn bind_with_retry(
    addr: SocketAddr,
    backoff: Duration,
    running: &AtomicBool,
) -> Option<TcpListener> {
    let mut attempt: u32 = 0;
    while running.load(Ordering::SeqCst) {
        attempt += 1;
        match bind_reusable(addr) {
            Ok(listener) => {
                info!("signaling server listening on {addr}");
                return Some(listener);
            }
            Err(e) => {
                warn!("bind {addr} failed (attempt {attempt}): {e}; retrying in {backoff:?}");
                sleep(backoff).await;
            }
        }
    }
    debug!("bind to {addr} abandoned: server stopped");
    None
}

fn bind_reusable(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

// ── Accept loop ───────────────────────────────────────────────────────────────

/// Runs the accept loop on `listener` until `running` is set to `false`.
///
/// Each accepted connection gets its own task, so a slow controller never
/// blocks the others.
///
/// # Errors
///
/// Currently never fails; accept errors are logged and the loop continues.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // Short timeout so the loop notices the flag even with no connections.
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                info!("new controller connection from {peer_addr}");
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    handle_connection(stream, peer_addr, registry).await;
                });
            }
            Ok(Err(e)) => {
                error!("accept error: {e}");
            }
            Err(_) => {}
        }
    }

    Ok(())
}

// ── Per-connection handler ────────────────────────────────────────────────────

async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, registry: Arc<SessionRegistry>) {
    match run_connection(stream, peer_addr, registry).await {
        Ok(()) => info!("connection {peer_addr} closed normally"),
        Err(e) => warn!("connection {peer_addr} closed with error: {e:#}"),
    }
}

/// Runs one controller connection from handshake to close.
///
/// Inbound text frames and peer events are handled one at a time on this
/// task, so everything that happens to a session is serialized.
async fn run_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
    let SessionHandle { id, mut events } = registry
        .accept(peer_addr, Arc::new(WsSignalSink::new(out_tx)))
        .await
        .with_context(|| format!("connection {peer_addr} refused"))?;

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_tx.send(frame).await.is_err() {
                debug!("session {id}: WebSocket send failed (controller gone)");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) => {
                        debug!("session {id}: WebSocket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("session {id}: WebSocket error: {e}");
                        break;
                    }
                    None => {
                        debug!("session {id}: stream ended");
                        break;
                    }
                };

                match frame {
                    WsMessage::Text(text) => registry.dispatch(id, &text).await,
                    WsMessage::Binary(data) => {
                        warn!("session {id}: unexpected binary frame ({} bytes, ignored)", data.len());
                    }
                    WsMessage::Ping(data) => {
                        debug!("session {id}: WebSocket ping ({} bytes)", data.len());
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => {
                        debug!("session {id}: Close frame received");
                        break;
                    }
                    WsMessage::Frame(_) => {}
                }
            }
            Some(event) = events.recv() => {
                registry.on_peer_event(id, event).await;
            }
        }
    }

    // Closing the session drops its signal sink, which ends the writer.
    registry.close(id).await;
    let abort = writer.abort_handle();
    if timeout(WRITER_FLUSH, writer).await.is_err() {
        abort.abort();
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
