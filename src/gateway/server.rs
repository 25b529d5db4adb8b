// =============================================================================
// Connection reactor: accept loop, per-connection driver, flush cycle.
//
//   accept -> handshake -> HELLO -> IDENTIFY -> claim -> READY -> OPEN loop
//
// One tokio task drives each connection and owns its state transitions.
// Outbound events reach a connection through its ConnectionBuffer (written
// by the fan-out broadcaster) and are drained to the socket by a single flush
// task using non-blocking writes, so one slow socket never stalls the cycle.
// Control frames from the driver and bytes from the flush task share one
// mutex-guarded write half, which keeps frames from interleaving.
// =============================================================================

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::backpressure::{BackpressurePolicy, EvictReason};
use super::buffer::{BufferConsumer, BufferMonitor, BufferProducer, ConnectionBuffer};
use super::fanout::{DispatchEvent, FanoutHandle, spawn_broadcaster};
use super::frame::{
    CLOSE_ALREADY_AUTHENTICATED, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
    CLOSE_POLICY_VIOLATION, CLOSE_PROTOCOL_ERROR, CLOSE_SESSION_TIMED_OUT, FrameCodec, FrameError,
    FrameReader, Opcode, encode_close_frame, encode_frame, encode_text_frame,
};
use super::handshake::HandshakeNegotiator;
use super::heartbeat::HeartbeatWatchdog;
use super::intents;
use super::metrics::{GatewayMetrics, MetricsSnapshot, add, decr, incr};
use super::payload::{self, ClientPayload, IdentifyPayload, IdentifyValidator, parse_client_payload};
use super::registry::{ClaimResult, LivenessProbe, ShardRegistry, SlotHolder};
use super::session::{GatewaySession, SessionState, epoch_ms};
use crate::config::{ConfigError, GatewayConfig};

/// Grace period for drivers to finish once shutdown starts.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
}

// ---------------------------------------------------------------------------
// Per-connection socket side
// ---------------------------------------------------------------------------

struct SocketWriter {
    half: OwnedWriteHalf,
    /// Bytes taken from the buffer that the socket has not accepted yet.
    carry: BytesMut,
    consumer: BufferConsumer,
    close_sent: bool,
}

impl SocketWriter {
    /// Move up to `max_bytes` from the buffer and write without blocking.
    fn flush_nonblocking(&mut self, max_bytes: usize) -> io::Result<usize> {
        let room = max_bytes.saturating_sub(self.carry.len());
        if room > 0 {
            self.consumer.read_into(&mut self.carry, room);
        }
        let mut written = 0;
        while !self.carry.is_empty() {
            match self.half.try_write(&self.carry) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.carry.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn is_drained(&self) -> bool {
        self.carry.is_empty() && self.consumer.occupancy() == 0
    }

    /// Finish any partially written frame, then write `frame`.
    async fn write_control(&mut self, frame: &[u8]) -> io::Result<()> {
        if !self.carry.is_empty() {
            self.half.write_all(&self.carry).await?;
            self.carry.clear();
        }
        self.half.write_all(frame).await
    }

    /// Drop everything buffered and attempt a close frame without blocking.
    /// The close frame is skipped when a partial frame is still pending.
    fn abort(&mut self, code: u16) {
        self.consumer.clear();
        if self.carry.is_empty() && !self.close_sent {
            let _ = self.half.try_write(&encode_close_frame(code));
        }
        self.carry.clear();
        self.close_sent = true;
    }
}

struct Connection {
    session: Arc<GatewaySession>,
    writer: Mutex<SocketWriter>,
    monitor: BufferMonitor,
}

impl Connection {
    fn new(session: Arc<GatewaySession>, half: OwnedWriteHalf, consumer: BufferConsumer) -> Self {
        let monitor = consumer.monitor();
        Self {
            session,
            writer: Mutex::new(SocketWriter {
                half,
                carry: BytesMut::new(),
                consumer,
                close_sent: false,
            }),
            monitor,
        }
    }

    fn id(&self) -> u64 {
        self.session.connection_id()
    }

    async fn send(&self, frame: &[u8], deadline: Duration) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.close_sent {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "close frame already sent"));
        }
        with_deadline(deadline, writer.write_control(frame)).await
    }

    async fn send_text(&self, text: &str, deadline: Duration) -> io::Result<()> {
        self.send(&encode_text_frame(text), deadline).await
    }

    async fn send_close(&self, code: u16, deadline: Duration) {
        let mut writer = self.writer.lock().await;
        if writer.close_sent {
            return;
        }
        writer.close_sent = true;
        let _ = with_deadline(deadline, writer.write_control(&encode_close_frame(code))).await;
    }
}

async fn with_deadline<F>(deadline: Duration, fut: F) -> io::Result<()>
where
    F: std::future::Future<Output = io::Result<()>>,
{
    match timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "socket write timed out")),
    }
}

/// How a driver's read loop ended.
#[derive(Debug)]
enum Exit {
    /// Send a close frame with this status, then drop the socket.
    Close(u16),
    /// Peer sent a close frame.
    PeerClosed,
    /// Peer disconnected without a close frame.
    PeerGone,
    Failed(io::Error),
    /// Session cancelled from outside (forced close, zombie eviction, shutdown).
    Cancelled,
}

impl From<FrameError> for Exit {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => Exit::Failed(e),
            other => Exit::Close(other.close_code()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    config: GatewayConfig,
    registry: Arc<ShardRegistry>,
    metrics: Arc<GatewayMetrics>,
    fanout: FanoutHandle,
    /// Open sessions visited by the flush cycle.
    connections: DashMap<u64, Arc<Connection>>,
    negotiator: HandshakeNegotiator,
    validator: IdentifyValidator,
    watchdog: HeartbeatWatchdog,
    policy: BackpressurePolicy,
    shutdown: CancellationToken,
}

/// Cloneable control handle for a running gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    shared: Arc<Shared>,
}

impl GatewayHandle {
    /// Queue an event for every open session responsible for it.
    pub fn dispatch(&self, event: DispatchEvent) -> bool {
        self.shared.fanout.dispatch(event)
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.shared.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn open_sessions(&self) -> usize {
        self.shared.connections.len()
    }

    /// Stop accepting and close every session with 1001.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

pub struct GatewayServer {
    listener: TcpListener,
    shared: Arc<Shared>,
    tracker: TaskTracker,
    broadcaster: JoinHandle<()>,
}

impl GatewayServer {
    /// Validate `config`, bind the listener and start the fan-out broadcaster.
    pub async fn bind(config: GatewayConfig, registry: Arc<ShardRegistry>) -> Result<Self, ServerError> {
        config.validate()?;
        let addr = config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        let metrics = Arc::new(GatewayMetrics::new());
        let (fanout, broadcaster) = spawn_broadcaster(metrics.clone());
        let shared = Arc::new(Shared {
            negotiator: HandshakeNegotiator::new(config.max_handshake_bytes),
            validator: IdentifyValidator::new(config.max_shards),
            watchdog: HeartbeatWatchdog::new(config.watchdog_tick, config.heartbeat_timeout()),
            policy: BackpressurePolicy {
                lag_threshold: config.lag_threshold,
                force_close_percent: config.force_close_percent,
                grace: config.eviction_grace,
            },
            config,
            registry,
            metrics,
            fanout,
            connections: DashMap::new(),
            shutdown: CancellationToken::new(),
        });
        Ok(Self {
            listener,
            shared,
            tracker: TaskTracker::new(),
            broadcaster,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            shared: self.shared.clone(),
        }
    }

    /// Accept connections until [`GatewayHandle::shutdown`] is called, then
    /// wait for every connection driver to finish.
    pub async fn run(self) {
        let Self {
            listener,
            shared,
            tracker,
            broadcaster,
        } = self;
        let flush = tokio::spawn(flush_loop(shared.clone()));
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "gateway listening");
        }

        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        let active = shared.metrics.connections_active.load(Ordering::Relaxed);
                        if active >= shared.config.max_connections as u64 {
                            incr(&shared.metrics.connections_refused);
                            warn!(%peer, active, "connection limit reached, refusing");
                            drop(stream);
                            continue;
                        }
                        incr(&shared.metrics.connections_accepted);
                        incr(&shared.metrics.connections_active);
                        let shared = shared.clone();
                        tracker.spawn(async move {
                            drive_connection(shared.clone(), stream, peer).await;
                            decr(&shared.metrics.connections_active);
                        });
                    }
                    Err(e) => {
                        // EMFILE and friends: back off instead of spinning.
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                () = shared.shutdown.cancelled() => break,
            }
        }

        drop(listener);
        info!(open = shared.connections.len(), "shutting down gateway");
        tracker.close();
        if timeout(SHUTDOWN_DRAIN, tracker.wait()).await.is_err() {
            warn!(remaining = tracker.len(), "connection drivers did not finish in time");
        }
        if let Some(subscribers) = shared.fanout.subscriber_count().await {
            debug!(subscribers, "stopping fan-out");
        }
        shared.fanout.shutdown();
        let _ = broadcaster.await;
        let _ = flush.await;
        info!(metrics = ?shared.metrics.snapshot(), "gateway stopped");
    }
}

fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

// ---------------------------------------------------------------------------
// Connection driver
// ---------------------------------------------------------------------------

async fn drive_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    tune_socket(&stream);
    let session = Arc::new(GatewaySession::new(peer, shared.shutdown.child_token()));
    let conn_id = session.connection_id();
    let (mut read_half, mut write_half) = stream.into_split();

    let handshake = tokio::select! {
        biased;
        () = session.cancel_token().cancelled() => return,
        res = timeout(
            shared.config.identify_timeout,
            shared.negotiator.perform(&mut read_half, &mut write_half),
        ) => res,
    };
    let handshake = match handshake {
        Ok(Ok(hs)) => hs,
        Ok(Err(e)) => {
            incr(&shared.metrics.handshake_failures);
            debug!(conn_id, %peer, error = %e, "handshake failed");
            return;
        }
        Err(_) => {
            incr(&shared.metrics.handshake_failures);
            debug!(conn_id, %peer, "handshake timed out");
            return;
        }
    };
    debug!(conn_id, %peer, path = %handshake.path, "upgraded");
    if session
        .transition(SessionState::Handshaking, SessionState::Identifying)
        .is_err()
    {
        return;
    }

    let (producer, consumer) =
        match ConnectionBuffer::new(shared.config.buffer_capacity, shared.config.high_watermark) {
            Ok(buffer) => buffer.split(),
            Err(e) => {
                error!(conn_id, error = %e, "cannot allocate connection buffer");
                let _ = write_half.write_all(&encode_close_frame(CLOSE_INTERNAL_ERROR)).await;
                return;
            }
        };
    let conn = Arc::new(Connection::new(session.clone(), write_half, consumer));
    let mut frames = FrameReader::with_leftover(
        read_half,
        FrameCodec::server(shared.config.max_frame_payload),
        &handshake.leftover,
    );

    let exit = run_session(&shared, &conn, &mut frames, producer).await;
    finish(&shared, &conn, exit).await;
}

async fn run_session(
    shared: &Shared,
    conn: &Arc<Connection>,
    frames: &mut FrameReader<OwnedReadHalf>,
    producer: BufferProducer,
) -> Exit {
    let session = &conn.session;
    let conn_id = conn.id();
    let deadline = shared.config.write_timeout;

    let hello = payload::hello(shared.config.heartbeat_interval.as_millis() as u64);
    if let Err(e) = conn.send_text(&hello, deadline).await {
        return Exit::Failed(e);
    }

    let identify = tokio::select! {
        biased;
        () = session.cancel_token().cancelled() => return Exit::Cancelled,
        res = timeout(shared.config.identify_timeout, await_identify(conn, frames, deadline)) => match res {
            Ok(Ok(identify)) => identify,
            Ok(Err(exit)) => return exit,
            Err(_) => {
                debug!(conn_id, "no IDENTIFY before timeout");
                return Exit::Close(CLOSE_SESSION_TIMED_OUT);
            }
        },
    };

    let valid = match shared.validator.validate(&identify) {
        Ok(valid) => valid,
        Err(e) => {
            incr(&shared.metrics.identify_rejected);
            info!(conn_id, peer = %session.peer(), error = %e, "identify rejected");
            return invalid_session(conn, deadline).await;
        }
    };
    let identity = valid.identity;
    let _ = session.set_identity(identity);

    let probe: Arc<dyn LivenessProbe> = session.clone();
    let evicted = match shared.registry.claim(identity, SlotHolder::new(conn_id, probe)) {
        ClaimResult::Claimed => false,
        ClaimResult::Evicted {
            previous_connection_id,
        } => {
            incr(&shared.metrics.zombie_evictions);
            warn!(conn_id, shard = %identity, evicted = previous_connection_id, "evicted zombie session");
            true
        }
        ClaimResult::Rejected {
            holder_connection_id,
        } => {
            incr(&shared.metrics.identify_rejected);
            info!(conn_id, shard = %identity, holder = holder_connection_id, "shard already claimed");
            let _ = session.transition(SessionState::Identifying, SessionState::Closing);
            return invalid_session(conn, deadline).await;
        }
    };

    if session
        .transition(SessionState::Identifying, SessionState::Open)
        .is_err()
    {
        return Exit::Cancelled;
    }
    incr(&shared.metrics.identify_accepted);

    // READY goes out before the session is visible to the flush cycle, so it
    // always precedes the first dispatch.
    let ready = payload::ready(session.session_id(), identity, evicted);
    if let Err(e) = conn.send_text(&ready, deadline).await {
        return Exit::Failed(e);
    }
    info!(
        conn_id,
        shard = %identity,
        session_id = session.session_id(),
        intents = %intents::describe(valid.intents),
        evicted,
        "session ready"
    );

    shared.fanout.attach(conn_id, identity, valid.intents, producer);
    shared.connections.insert(conn_id, conn.clone());
    let watchdog = tokio::spawn(
        shared
            .watchdog
            .watch(session.clone(), shared.metrics.clone()),
    );

    let exit = open_loop(shared, conn, frames).await;
    watchdog.abort();
    exit
}

/// Wait for the first text frame, which must be IDENTIFY.
async fn await_identify(
    conn: &Connection,
    frames: &mut FrameReader<OwnedReadHalf>,
    deadline: Duration,
) -> Result<IdentifyPayload, Exit> {
    loop {
        let frame = match frames.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(Exit::PeerGone),
            Err(e) => return Err(e.into()),
        };
        conn.session.touch();
        match frame.opcode {
            Opcode::Ping => {
                let pong = encode_frame(Opcode::Pong, &frame.payload);
                conn.send(&pong, deadline).await.map_err(Exit::Failed)?;
            }
            Opcode::Pong => {}
            Opcode::Close => return Err(Exit::PeerClosed),
            Opcode::Text if frame.fin => {
                let parsed = frame.as_text().map(parse_client_payload);
                return match parsed {
                    Some(Ok(ClientPayload::Identify(identify))) => Ok(identify),
                    other => {
                        debug!(conn_id = conn.id(), payload = ?other, "expected IDENTIFY");
                        Err(invalid_session(conn, deadline).await)
                    }
                };
            }
            _ => return Err(Exit::Close(CLOSE_PROTOCOL_ERROR)),
        }
    }
}

async fn invalid_session(conn: &Connection, deadline: Duration) -> Exit {
    match conn.send_text(&payload::invalid_session(false), deadline).await {
        Ok(()) => Exit::Close(CLOSE_NORMAL),
        Err(e) => Exit::Failed(e),
    }
}

async fn open_loop(shared: &Shared, conn: &Connection, frames: &mut FrameReader<OwnedReadHalf>) -> Exit {
    let session = &conn.session;
    let deadline = shared.config.write_timeout;
    loop {
        let frame = tokio::select! {
            biased;
            () = session.cancel_token().cancelled() => return Exit::Cancelled,
            res = frames.read_frame() => match res {
                Ok(Some(frame)) => frame,
                Ok(None) => return Exit::PeerGone,
                Err(e) => return e.into(),
            },
        };
        session.touch();

        match frame.opcode {
            Opcode::Text if frame.fin => {
                let Some(text) = frame.as_text() else {
                    return Exit::Close(CLOSE_PROTOCOL_ERROR);
                };
                match parse_client_payload(text) {
                    Ok(ClientPayload::Heartbeat { .. }) => {
                        incr(&shared.metrics.heartbeats);
                        if let Err(e) = conn.send_text(&payload::heartbeat_ack(), deadline).await {
                            return Exit::Failed(e);
                        }
                    }
                    Ok(ClientPayload::Identify(_)) => return Exit::Close(CLOSE_ALREADY_AUTHENTICATED),
                    Ok(ClientPayload::Unhandled(op)) => {
                        debug!(conn_id = conn.id(), ?op, "ignoring payload");
                    }
                    Err(e) => {
                        debug!(conn_id = conn.id(), error = %e, "undecodable payload");
                        return Exit::Close(CLOSE_PROTOCOL_ERROR);
                    }
                }
            }
            Opcode::Ping => {
                let pong = encode_frame(Opcode::Pong, &frame.payload);
                if let Err(e) = conn.send(&pong, deadline).await {
                    return Exit::Failed(e);
                }
            }
            Opcode::Pong => {}
            Opcode::Close => return Exit::PeerClosed,
            // Binary payloads and fragmented messages are not part of the protocol.
            _ => return Exit::Close(CLOSE_PROTOCOL_ERROR),
        }
    }
}

/// Send the closing frame (if any), release everything the session holds
/// and settle its final state.
async fn finish(shared: &Shared, conn: &Connection, exit: Exit) {
    let session = &conn.session;
    let conn_id = conn.id();
    let deadline = shared.config.write_timeout;

    match exit {
        Exit::Close(code) => {
            session.request_close(code);
            conn.send_close(code, deadline).await;
        }
        Exit::PeerClosed => {
            session.request_close(CLOSE_NORMAL);
            conn.send_close(CLOSE_NORMAL, deadline).await;
        }
        Exit::Cancelled if session.state() == SessionState::Error => {}
        Exit::Cancelled => {
            // Shutdown cancels through the parent token without a code.
            session.request_close(CLOSE_GOING_AWAY);
            let code = session.close_code().unwrap_or(CLOSE_GOING_AWAY);
            if code == CLOSE_POLICY_VIOLATION {
                conn.writer.lock().await.abort(code);
            } else {
                conn.send_close(code, deadline).await;
            }
        }
        Exit::PeerGone => {
            session.mark_error();
        }
        Exit::Failed(e) => {
            debug!(conn_id, error = %e, "connection i/o error");
            session.mark_error();
        }
    }

    shared.connections.remove(&conn_id);
    shared.fanout.detach(conn_id);
    if let Some(identity) = session.identity()
        && shared.registry.release(&identity, conn_id)
    {
        debug!(conn_id, shard = %identity, "shard slot released");
    }

    {
        let mut writer = conn.writer.lock().await;
        writer.consumer.clear();
        let _ = timeout(deadline, writer.half.shutdown()).await;
    }
    if session.state() == SessionState::Closing {
        let _ = session.transition(SessionState::Closing, SessionState::Closed);
    }
    session.cancel_token().cancel();

    info!(
        conn_id,
        shard = ?session.identity(),
        state = %session.state(),
        lifetime_ms = epoch_ms().saturating_sub(session.created_at()),
        "connection closed"
    );
}

// ---------------------------------------------------------------------------
// Flush cycle
// ---------------------------------------------------------------------------

async fn flush_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => flush_cycle(&shared),
            () = shared.shutdown.cancelled() => break,
        }
    }
}

fn flush_cycle(shared: &Shared) {
    let max_bytes = shared.config.flush_max_bytes;
    let mut failed = Vec::new();
    let mut evict = Vec::new();

    for entry in shared.connections.iter() {
        let conn = entry.value();
        if conn.session.state() != SessionState::Open {
            continue;
        }
        // A driver writing a control frame holds the lock; skip this tick.
        if let Ok(mut writer) = conn.writer.try_lock() {
            match writer.flush_nonblocking(max_bytes) {
                Ok(n) => {
                    add(&shared.metrics.bytes_flushed, n as u64);
                    if writer.is_drained() {
                        conn.monitor.reset_watermark_hits();
                    }
                }
                Err(e) => {
                    failed.push((conn.clone(), e));
                    continue;
                }
            }
        }
        let age = Duration::from_millis(epoch_ms().saturating_sub(conn.session.created_at()));
        if let Some(reason) = shared.policy.check(age, &conn.monitor) {
            evict.push((conn.clone(), reason));
        }
    }

    for (conn, e) in failed {
        debug!(conn_id = conn.id(), error = %e, "flush write failed");
        conn.session.mark_error();
    }
    for (conn, reason) in evict {
        force_close(shared, &conn, reason);
    }
}

/// Hard-cancel a session that cannot keep up: best-effort close 1008,
/// buffered bytes dropped, slot released immediately.
fn force_close(shared: &Shared, conn: &Connection, reason: EvictReason) {
    let session = &conn.session;
    if !session.request_close(CLOSE_POLICY_VIOLATION) {
        return;
    }
    let conn_id = conn.id();
    incr(&shared.metrics.forced_closes);
    warn!(
        conn_id,
        shard = ?session.identity(),
        %reason,
        usage = conn.monitor.usage_percent(),
        "force-closing slow connection"
    );
    if let Ok(mut writer) = conn.writer.try_lock() {
        writer.abort(CLOSE_POLICY_VIOLATION);
    }
    shared.connections.remove(&conn_id);
    shared.fanout.detach(conn_id);
    if let Some(identity) = session.identity() {
        shared.registry.release(&identity, conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::frame::{Frame, encode_masked_frame};
    use crate::gateway::shard::ShardIdentity;
    use crate::gateway::intents::{GUILD_MESSAGES, GUILD_PRESENCES};
    use serde_json::{Value, json};
    use tokio::io::AsyncReadExt;

    const TOKEN: &str = "Bot abcdefghijklmnopqrstuvwx";
    const UPGRADE: &[u8] = b"GET /gateway HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..GatewayConfig::default()
        }
    }

    async fn start(config: GatewayConfig) -> (SocketAddr, GatewayHandle, JoinHandle<()>) {
        start_with(config, Arc::new(ShardRegistry::new())).await
    }

    async fn start_with(
        config: GatewayConfig,
        registry: Arc<ShardRegistry>,
    ) -> (SocketAddr, GatewayHandle, JoinHandle<()>) {
        let server = GatewayServer::bind(config, registry).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        (addr, handle, tokio::spawn(server.run()))
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    struct Client {
        frames: FrameReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            Self::upgrade(addr, UPGRADE).await
        }

        /// Send `request` in one write and read the 101 response head.
        async fn upgrade(addr: SocketAddr, request: &[u8]) -> Self {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(request).await.unwrap();
            let mut head = Vec::new();
            while !head.ends_with(b"\r\n\r\n") {
                head.push(stream.read_u8().await.unwrap());
            }
            assert!(head.starts_with(b"HTTP/1.1 101"));
            let (read, writer) = stream.into_split();
            Self {
                frames: FrameReader::new(read, FrameCodec::default()),
                writer,
            }
        }

        /// Connect and consume HELLO.
        async fn hello(addr: SocketAddr) -> Self {
            let mut client = Self::connect(addr).await;
            let hello = client.recv_json().await;
            assert_eq!(hello["op"], 10);
            client
        }

        async fn identify(addr: SocketAddr, shard_id: u32, num_shards: u32) -> (Self, Value) {
            let mut client = Self::hello(addr).await;
            client.send(&payload::identify(TOKEN, 513, shard_id, num_shards)).await;
            let reply = client.recv_json().await;
            (client, reply)
        }

        async fn send(&mut self, text: &str) {
            self.send_frame(Opcode::Text, text.as_bytes()).await;
        }

        async fn send_frame(&mut self, opcode: Opcode, payload: &[u8]) {
            let frame = encode_masked_frame(opcode, payload, [0x37, 0xfa, 0x21, 0x3d]);
            self.writer.write_all(&frame).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Frame> {
            timeout(Duration::from_secs(5), self.frames.read_frame())
                .await
                .expect("frame in time")
                .unwrap()
        }

        async fn recv_json(&mut self) -> Value {
            let frame = self.recv().await.expect("text frame");
            assert_eq!(frame.opcode, Opcode::Text);
            serde_json::from_slice(&frame.payload).unwrap()
        }

        /// Skip to the close frame and return its status.
        async fn recv_close(&mut self) -> Option<u16> {
            while let Some(frame) = self.recv().await {
                if frame.opcode == Opcode::Close {
                    return frame.close_code();
                }
            }
            None
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_identify_ready_and_heartbeat() {
        let (addr, handle, _server) = start(test_config()).await;
        let mut client = Client::hello(addr).await;
        client.send(&payload::identify(TOKEN, 513, 1, 4)).await;

        let ready = client.recv_json().await;
        assert_eq!(ready["op"], 0);
        assert_eq!(ready["t"], "READY");
        assert_eq!(ready["d"]["shard"], json!([1, 4]));
        assert_eq!(ready["d"]["evicted"], false);
        assert_eq!(ready["d"]["session_id"].as_str().unwrap().len(), 16);

        client.send(&payload::heartbeat(None)).await;
        assert_eq!(client.recv_json().await, json!({"op": 11}));

        let shard = ShardIdentity::new(1, 4).unwrap();
        assert!(handle.registry().holder(&shard).is_some());
        let m = handle.metrics();
        assert_eq!(m.identify_accepted, 1);
        assert_eq!(m.heartbeats, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_identify_single_winner() {
        let (addr, handle, _server) = start(test_config()).await;
        let (a, b) = tokio::join!(Client::identify(addr, 5, 16), Client::identify(addr, 5, 16));
        let (mut a, ra) = a;
        let (mut b, rb) = b;

        let ready = [&ra, &rb].iter().filter(|r| r["t"] == "READY").count();
        assert_eq!(ready, 1);
        let loser = if ra["t"] == "READY" { &mut b } else { &mut a };
        let rejected = if ra["t"] == "READY" { &rb } else { &ra };
        assert_eq!(*rejected, json!({"op": 9, "d": false}));
        assert_eq!(loser.recv_close().await, Some(CLOSE_NORMAL));

        assert_eq!(handle.registry().len(), 1);
        eventually(|| handle.metrics().identify_rejected == 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_token_rejected() {
        let (addr, handle, _server) = start(test_config()).await;
        let mut client = Client::hello(addr).await;
        client.send(&payload::identify("hunter2", 0, 0, 1)).await;
        assert_eq!(client.recv_json().await, json!({"op": 9, "d": false}));
        assert_eq!(client.recv_close().await, Some(CLOSE_NORMAL));
        assert!(handle.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_before_identify_rejected() {
        let (addr, _handle, _server) = start(test_config()).await;
        let mut client = Client::hello(addr).await;
        client.send(&payload::heartbeat(None)).await;
        assert_eq!(client.recv_json().await["op"], 9);
        assert_eq!(client.recv_close().await, Some(CLOSE_NORMAL));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_identify_closes_4005() {
        let (addr, handle, _server) = start(test_config()).await;
        let (mut client, ready) = Client::identify(addr, 0, 1).await;
        assert_eq!(ready["t"], "READY");
        client.send(&payload::identify(TOKEN, 0, 0, 1)).await;
        assert_eq!(client.recv_close().await, Some(CLOSE_ALREADY_AUTHENTICATED));
        eventually(|| handle.registry().is_empty()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ping_pong_and_client_close() {
        let (addr, handle, _server) = start(test_config()).await;
        let (mut client, _) = Client::identify(addr, 2, 3).await;

        client.send_frame(Opcode::Ping, b"are you there").await;
        let pong = client.recv().await.unwrap();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(&pong.payload[..], b"are you there");

        client.send_frame(Opcode::Close, &1000u16.to_be_bytes()).await;
        assert_eq!(client.recv_close().await, Some(CLOSE_NORMAL));
        eventually(|| handle.registry().is_empty() && handle.open_sessions() == 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_binary_frame_is_protocol_error() {
        let (addr, _handle, _server) = start(test_config()).await;
        let (mut client, _) = Client::identify(addr, 0, 1).await;
        client.send_frame(Opcode::Binary, &[1, 2, 3]).await;
        assert_eq!(client.recv_close().await, Some(CLOSE_PROTOCOL_ERROR));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_silent_session_times_out() {
        let config = GatewayConfig {
            heartbeat_interval: Duration::from_millis(200),
            heartbeat_grace: 1.0,
            watchdog_tick: Duration::from_millis(50),
            ..test_config()
        };
        let (addr, handle, _server) = start(config).await;
        let (mut client, _) = Client::identify(addr, 0, 1).await;

        assert_eq!(client.recv_close().await, Some(CLOSE_SESSION_TIMED_OUT));
        eventually(|| handle.registry().is_empty()).await;
        assert_eq!(handle.metrics().heartbeat_timeouts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_identify_timeout() {
        let config = GatewayConfig {
            identify_timeout: Duration::from_millis(200),
            ..test_config()
        };
        let (addr, _handle, _server) = start(config).await;
        let mut client = Client::hello(addr).await;
        assert_eq!(client.recv_close().await, Some(CLOSE_SESSION_TIMED_OUT));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispatch_routed_by_entity() {
        let (addr, handle, _server) = start(test_config()).await;
        let (mut zero, _) = Client::identify(addr, 0, 2).await;
        let (mut one, _) = Client::identify(addr, 1, 2).await;
        eventually(|| handle.open_sessions() == 2).await;

        // (1 << 22) routes to shard 1 of 2.
        handle.dispatch(DispatchEvent::new("MESSAGE_CREATE", json!({"id": 1})).for_entity(1 << 22));
        handle.dispatch(DispatchEvent::new("GUILD_CREATE", json!({"id": 2})));

        let first = one.recv_json().await;
        assert_eq!(first["t"], "MESSAGE_CREATE");
        assert_eq!(first["d"], json!({"id": 1}));
        assert_eq!(one.recv_json().await["t"], "GUILD_CREATE");
        assert_eq!(zero.recv_json().await["t"], "GUILD_CREATE");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_consumer_force_closed() {
        let config = GatewayConfig {
            buffer_capacity: 1024,
            flush_max_bytes: 1,
            eviction_grace: Duration::ZERO,
            ..test_config()
        };
        let (addr, handle, _server) = start(config).await;
        let (mut client, _) = Client::identify(addr, 0, 1).await;
        eventually(|| handle.open_sessions() == 1).await;

        let blob = "x".repeat(200);
        for n in 0..40 {
            handle.dispatch(DispatchEvent::new("BLOB", json!({"n": n, "blob": blob})));
        }

        eventually(|| handle.metrics().forced_closes == 1).await;
        assert!(handle.registry().is_empty());
        assert_eq!(handle.open_sessions(), 0);
        assert!(handle.metrics().events_dropped > 0);

        // The socket ends; trailing bytes may be a truncated frame.
        let ended = timeout(Duration::from_secs(5), async {
            loop {
                match client.frames.read_frame().await {
                    Ok(Some(_)) => continue,
                    _ => break,
                }
            }
        })
        .await;
        assert!(ended.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connection_limit() {
        let config = GatewayConfig {
            max_connections: 1,
            ..test_config()
        };
        let (addr, handle, _server) = start(config).await;
        let _first = Client::hello(addr).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let _ = second.write_all(UPGRADE).await;
        let mut buf = [0u8; 64];
        let read = timeout(Duration::from_secs(5), second.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(handle.metrics().connections_refused, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bad_handshake_gets_400() {
        let (addr, handle, _server) = start(test_config()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        let _ = timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;
        assert!(response.starts_with(b"HTTP/1.1 400"));
        eventually(|| handle.metrics().handshake_failures == 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_closes_sessions() {
        let (addr, handle, server) = start(test_config()).await;
        let (mut client, _) = Client::identify(addr, 0, 1).await;
        eventually(|| handle.open_sessions() == 1).await;

        handle.shutdown();
        assert_eq!(client.recv_close().await, Some(CLOSE_GOING_AWAY));
        timeout(Duration::from_secs(10), server).await.unwrap().unwrap();
        assert!(handle.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_identify_pipelined_with_upgrade() {
        let (addr, _handle, _server) = start(test_config()).await;
        let mut burst = UPGRADE.to_vec();
        let identify = payload::identify(TOKEN, 1, 0, 1);
        burst.extend_from_slice(&encode_masked_frame(Opcode::Text, identify.as_bytes(), [9, 8, 7, 6]));

        // Nothing else is sent; READY must come from the bytes behind the request head.
        let mut client = Client::upgrade(addr, &burst).await;
        assert_eq!(client.recv_json().await["op"], 10);
        assert_eq!(client.recv_json().await["t"], "READY");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unmasked_client_frame_closes_1002() {
        let (addr, _handle, _server) = start(test_config()).await;
        let mut client = Client::hello(addr).await;
        let identify = payload::identify(TOKEN, 1, 0, 1);
        client.writer.write_all(&encode_text_frame(&identify)).await.unwrap();
        assert_eq!(client.recv_close().await, Some(CLOSE_PROTOCOL_ERROR));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_zombie_holder_evicted_by_identify() {
        let registry = Arc::new(ShardRegistry::new());
        let zombie = Arc::new(GatewaySession::new(
            "127.0.0.1:9".parse().unwrap(),
            CancellationToken::new(),
        ));
        zombie.transition(SessionState::Handshaking, SessionState::Identifying).unwrap();
        zombie.transition(SessionState::Identifying, SessionState::Open).unwrap();
        zombie.mark_zombie();
        let shard = ShardIdentity::new(0, 1).unwrap();
        let probe: Arc<dyn LivenessProbe> = zombie.clone();
        assert_eq!(
            registry.claim(shard, SlotHolder::new(zombie.connection_id(), probe)),
            ClaimResult::Claimed
        );

        let (addr, handle, _server) = start_with(test_config(), registry.clone()).await;
        let (_client, ready) = Client::identify(addr, 0, 1).await;
        assert_eq!(ready["t"], "READY");
        assert_eq!(ready["d"]["evicted"], true);
        assert_eq!(handle.metrics().zombie_evictions, 1);

        let holder = registry.holder(&shard).unwrap();
        assert_ne!(holder, zombie.connection_id());
        assert_eq!(zombie.state(), SessionState::Closing);
        assert_eq!(zombie.close_code(), Some(CLOSE_SESSION_TIMED_OUT));
        assert!(zombie.cancel_token().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reset_peer_errors_and_releases_slot() {
        let (addr, handle, _server) = start(test_config()).await;
        let (client, _) = Client::identify(addr, 0, 1).await;
        eventually(|| handle.open_sessions() == 1).await;
        let session = handle
            .shared
            .connections
            .iter()
            .next()
            .map(|entry| entry.value().session.clone())
            .unwrap();

        // Linger 0 turns the close into a RST.
        let stream: &TcpStream = client.writer.as_ref();
        SockRef::from(stream).set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);
        for n in 0..50 {
            handle.dispatch(DispatchEvent::new("LOAD", json!({"n": n})));
        }

        eventually(|| session.state() == SessionState::Error).await;
        eventually(|| handle.registry().is_empty() && handle.open_sessions() == 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_write_failure_marks_error() {
        let server = GatewayServer::bind(test_config(), Arc::new(ShardRegistry::new()))
            .await
            .unwrap();
        let shared = server.handle().shared;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (accepted, peer_addr) = listener.accept().await.unwrap();
        SockRef::from(&peer).set_linger(Some(Duration::ZERO)).unwrap();
        drop(peer);

        let session = Arc::new(GatewaySession::new(peer_addr, CancellationToken::new()));
        session.transition(SessionState::Handshaking, SessionState::Identifying).unwrap();
        session.transition(SessionState::Identifying, SessionState::Open).unwrap();
        let (mut producer, consumer) = ConnectionBuffer::with_capacity(4096).unwrap().split();
        let (_read, write) = accepted.into_split();
        let conn = Arc::new(Connection::new(session.clone(), write, consumer));
        shared.connections.insert(conn.id(), conn);

        for _ in 0..200 {
            let _ = producer.try_write(&encode_text_frame("pending"));
            flush_cycle(&shared);
            if session.state() == SessionState::Error {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.state(), SessionState::Error);
        assert!(session.cancel_token().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispatch_honours_identify_intents() {
        let (addr, handle, _server) = start(test_config()).await;
        // Client::identify sends intents 513 (GUILDS | GUILD_MESSAGES).
        let (mut client, _) = Client::identify(addr, 0, 1).await;
        eventually(|| handle.open_sessions() == 1).await;

        handle.dispatch(DispatchEvent::new("PRESENCE_UPDATE", json!({})).requires_intent(GUILD_PRESENCES));
        handle.dispatch(DispatchEvent::new("MESSAGE_CREATE", json!({})).requires_intent(GUILD_MESSAGES));

        let event = client.recv_json().await;
        assert_eq!(event["t"], "MESSAGE_CREATE");
        assert_eq!(event["s"], 1);
        eventually(|| handle.metrics().events_filtered == 1).await;
    }
}
