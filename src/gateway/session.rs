use std::fmt;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::registry::LivenessProbe;
use super::shard::ShardIdentity;

/// Wall-clock time in milliseconds since UNIX epoch (for lock-free heartbeat tracking).
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically increasing connection id.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// 16 hex characters taken from a random UUID.
pub fn new_session_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Handshaking = 0,
    Identifying = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
    Error = 5,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Handshaking,
            1 => Self::Identifying,
            2 => Self::Open,
            3 => Self::Closing,
            4 => Self::Closed,
            _ => Self::Error,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }

    fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, Error) => !from.is_terminal(),
            (Handshaking, Identifying) | (Handshaking, Closing) => true,
            (Identifying, Open) | (Identifying, Closing) => true,
            (Open, Closing) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Handshaking => "HANDSHAKING",
            Self::Identifying => "IDENTIFYING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: SessionState, to: SessionState },
    #[error("shard identity already set to {0}")]
    IdentityAlreadySet(ShardIdentity),
}

/// Per-connection state shared between the driver task, the flush cycle,
/// the heartbeat watchdog and the shard registry.
pub struct GatewaySession {
    connection_id: u64,
    session_id: String,
    peer: SocketAddr,
    created_at: u64,
    state: AtomicU8,
    identity: OnceLock<ShardIdentity>,
    last_heartbeat: AtomicU64,
    zombie: AtomicBool,
    /// Close status the driver should send; 0 = none requested.
    close_code: AtomicU16,
    cancel: CancellationToken,
}

impl GatewaySession {
    pub fn new(peer: SocketAddr, cancel: CancellationToken) -> Self {
        let now = epoch_ms();
        Self {
            connection_id: next_connection_id(),
            session_id: new_session_id(),
            peer,
            created_at: now,
            state: AtomicU8::new(SessionState::Handshaking as u8),
            identity: OnceLock::new(),
            last_heartbeat: AtomicU64::new(now),
            zombie: AtomicBool::new(false),
            close_code: AtomicU16::new(0),
            cancel,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Compare-and-swap `from -> to`. Fails without touching the state when
    /// the move is not allowed or the session is no longer in `from`.
    pub fn transition(&self, from: SessionState, to: SessionState) -> Result<(), SessionError> {
        if !from.can_become(to) {
            return Err(SessionError::IllegalTransition { from, to });
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| SessionError::IllegalTransition {
                from: SessionState::from_u8(actual),
                to,
            })
    }

    /// Move any non-terminal state to `Error` and cancel the driver.
    pub fn mark_error(&self) -> bool {
        let moved = self.move_to(SessionState::Error);
        self.cancel.cancel();
        moved
    }

    /// Ask the driver to close with `code`. Only the first request wins;
    /// returns `false` if the session was already closing or finished.
    pub fn request_close(&self, code: u16) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = SessionState::from_u8(current);
            if !state.can_become(SessionState::Closing) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.close_code.store(code, Ordering::Release);
        self.cancel.cancel();
        true
    }

    /// Close status requested through [`request_close`](Self::request_close).
    pub fn close_code(&self) -> Option<u16> {
        match self.close_code.load(Ordering::Acquire) {
            0 => None,
            code => Some(code),
        }
    }

    fn move_to(&self, target: SessionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !SessionState::from_u8(current).can_become(target) {
                return false;
            }
            match self.state.compare_exchange(current, target as u8, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn set_identity(&self, identity: ShardIdentity) -> Result<(), SessionError> {
        self.identity
            .set(identity)
            .map_err(|_| SessionError::IdentityAlreadySet(*self.identity.get().unwrap_or(&identity)))
    }

    pub fn identity(&self) -> Option<ShardIdentity> {
        self.identity.get().copied()
    }

    /// Record client activity (heartbeat or any inbound frame).
    pub fn touch(&self) {
        self.last_heartbeat.store(epoch_ms(), Ordering::Relaxed);
    }

    pub fn millis_since_heartbeat(&self) -> u64 {
        epoch_ms().saturating_sub(self.last_heartbeat.load(Ordering::Relaxed))
    }

    /// Flag the session as unresponsive. It stays in place until its driver
    /// closes it, but the registry will treat it as a zombie.
    pub fn mark_zombie(&self) {
        self.zombie.store(true, Ordering::Release);
    }

    pub fn is_zombie(&self) -> bool {
        self.zombie.load(Ordering::Acquire)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl LivenessProbe for GatewaySession {
    fn is_alive(&self) -> bool {
        !self.is_zombie()
            && matches!(
                self.state(),
                SessionState::Handshaking | SessionState::Identifying | SessionState::Open
            )
    }

    fn evict(&self) {
        self.mark_zombie();
        self.request_close(super::frame::CLOSE_SESSION_TIMED_OUT);
    }
}

impl fmt::Debug for GatewaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewaySession")
            .field("connection_id", &self.connection_id)
            .field("session_id", &self.session_id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("identity", &self.identity())
            .finish()
    }
}
