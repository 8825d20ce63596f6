//! Channel server: session registry, transport supersede, message routing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::{reserved, ChannelMessage, EvalError, Result, SessionId};
use crate::metrics::METRICS;

/// One inbound message plus its receipt timestamp.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub received_at: DateTime<Utc>,
    pub message: ChannelMessage,
}

/// Per-session routing state. The map entry holds the only strong reference
/// besides live connection tasks, so removing the entry (and letting the
/// transport die) closes the session's inbound stream.
struct SessionEntry {
    inbound: mpsc::UnboundedSender<Inbound>,
    ready: watch::Sender<bool>,
    /// Sender for the current physical transport, if one is connected.
    outbound: Mutex<Option<mpsc::UnboundedSender<ChannelMessage>>>,
    /// Observation source re-sent on every (re)connect.
    staged_inject: Mutex<Option<String>>,
    /// Physical connection epoch; a new `hello` supersedes lower epochs.
    epoch: AtomicU64,
}

/// Evaluator-side endpoint of one logical session.
///
/// Holds the single inbound consumer for the session. Identity is stable
/// across transport reconnects; `recv` returning `None` means the session was
/// closed server-side (unrecoverable channel loss).
pub struct SessionChannel {
    session_id: SessionId,
    entry: Weak<SessionEntry>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    ready: watch::Receiver<bool>,
}

impl SessionChannel {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Receive the next inbound message, in receipt order.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    /// Send a message to the script over the active transport.
    pub fn send(&self, message: ChannelMessage) -> Result<()> {
        let entry = self
            .entry
            .upgrade()
            .ok_or_else(|| EvalError::Channel("session closed".to_string()))?;
        let guard = lock(&entry.outbound);
        match guard.as_ref() {
            Some(tx) => tx
                .send(message)
                .map_err(|_| EvalError::Channel("transport writer gone".to_string())),
            None => Err(EvalError::Channel("no active transport".to_string())),
        }
    }

    /// Whether the script has reported `start_success`.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the script reports `start_success`, bounded by `timeout`.
    /// Returns `false` on expiry or if the session was closed.
    pub async fn wait_ready(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.ready.wait_for(|ready| *ready))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }
}

/// The evaluator-side channel server.
///
/// Accepts connections from injected shims, performs the `hello` handshake,
/// and routes messages between physical transports and logical sessions.
pub struct ChannelServer {
    local_addr: SocketAddr,
    sessions: Arc<DashMap<SessionId, Arc<SessionEntry>>>,
    accept_task: JoinHandle<()>,
}

impl ChannelServer {
    /// Bind the listener and start accepting connections.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let sessions: Arc<DashMap<SessionId, Arc<SessionEntry>>> = Arc::new(DashMap::new());
        let accept_task = tokio::spawn(accept_loop(listener, sessions.clone()));
        debug!(addr = %local_addr, "channel server listening");
        Ok(Self {
            local_addr,
            sessions,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a logical session and hand back its endpoint.
    ///
    /// The returned [`SessionChannel`] is the session's single inbound
    /// consumer; opening the same session id again supersedes the previous
    /// registration entirely.
    pub fn open_session(&self, session_id: &SessionId) -> SessionChannel {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        let entry = Arc::new(SessionEntry {
            inbound: inbound_tx,
            ready: ready_tx,
            outbound: Mutex::new(None),
            staged_inject: Mutex::new(None),
            epoch: AtomicU64::new(0),
        });
        self.sessions.insert(session_id.clone(), entry.clone());
        SessionChannel {
            session_id: session_id.clone(),
            entry: Arc::downgrade(&entry),
            inbound: inbound_rx,
            ready: ready_rx,
        }
    }

    /// Stage observation source for a session. It is sent immediately if a
    /// transport is connected, and re-sent on every subsequent (re)connect.
    pub fn stage_inject(&self, session_id: &SessionId, source: &str) -> Result<()> {
        let entry = self
            .sessions
            .get(session_id)
            .map(|e| e.clone())
            .ok_or_else(|| EvalError::Channel(format!("unknown session: {session_id}")))?;
        *lock(&entry.staged_inject) = Some(source.to_string());
        if let Some(tx) = lock(&entry.outbound).as_ref() {
            let _ = tx.send(ChannelMessage::inject(source));
        }
        Ok(())
    }

    /// Remove a session. Its endpoint's `recv` drains and then yields `None`
    /// once the current transport (if any) goes away.
    pub fn close_session(&self, session_id: &SessionId) {
        if let Some((_, entry)) = self.sessions.remove(session_id) {
            // Invalidate the current transport so stale readers stop
            // forwarding and the inbound stream can close.
            entry.epoch.fetch_add(1, Ordering::SeqCst);
            *lock(&entry.outbound) = None;
        }
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Lock a mutex, recovering from poisoning (no panics happen under these
/// guards in normal operation, but a poisoned registry must not take the
/// whole server down).
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn accept_loop(listener: TcpListener, sessions: Arc<DashMap<SessionId, Arc<SessionEntry>>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(stream, peer, sessions.clone()));
            }
            Err(error) => {
                warn!(%error, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    sessions: Arc<DashMap<SessionId, Arc<SessionEntry>>>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Handshake: first line must be `hello` with a registered session id.
    let hello = match lines.next_line().await {
        Ok(Some(line)) => line,
        _ => return,
    };
    let message: ChannelMessage = match serde_json::from_str(&hello) {
        Ok(message) => message,
        Err(error) => {
            warn!(%peer, %error, "dropping connection: malformed handshake");
            return;
        }
    };
    if message.event_type != reserved::HELLO {
        warn!(%peer, event_type = %message.event_type, "dropping connection: expected hello");
        return;
    }
    let Some(session_id) = message.field_str("session_id").map(SessionId::from) else {
        warn!(%peer, "dropping connection: hello without session_id");
        return;
    };
    let Some(entry) = sessions.get(&session_id).map(|e| e.clone()) else {
        warn!(%peer, %session_id, "dropping connection: unknown session");
        return;
    };

    // Supersede any previous transport for this session.
    let epoch = entry.epoch.fetch_add(1, Ordering::SeqCst) + 1;
    if epoch > 1 {
        METRICS.inc_reconnects();
        debug!(%session_id, epoch, "transport superseded");
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ChannelMessage>();
    *lock(&entry.outbound) = Some(outbound_tx.clone());

    let writer_task = tokio::spawn(async move {
        let mut write_half = write_half;
        while let Some(message) = outbound_rx.recv().await {
            let Ok(mut line) = serde_json::to_string(&message) else {
                continue;
            };
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    // Idempotent scripts re-initialize from the staged source on reconnect.
    let staged = lock(&entry.staged_inject).clone();
    if let Some(source) = staged {
        let _ = outbound_tx.send(ChannelMessage::inject(&source));
    }
    drop(outbound_tx);

    debug!(%peer, %session_id, epoch, "transport attached");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        // A superseding transport owns the session now; stop forwarding.
        if entry.epoch.load(Ordering::SeqCst) != epoch {
            break;
        }
        let message: ChannelMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(error) => {
                warn!(%session_id, %error, "ignoring malformed message");
                continue;
            }
        };
        if message.event_type == reserved::START_SUCCESS {
            let _ = entry.ready.send(true);
            continue;
        }
        let inbound = Inbound {
            received_at: Utc::now(),
            message,
        };
        if entry.inbound.send(inbound).is_err() {
            break;
        }
    }

    // Only the current transport clears the outbound slot on exit.
    if entry.epoch.load(Ordering::SeqCst) == epoch {
        *lock(&entry.outbound) = None;
        debug!(%session_id, epoch, "transport dropped");
    }
    writer_task.abort();
}
