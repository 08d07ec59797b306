//! Session gate: maps opaque tokens to authenticated sessions.
//!
//! Every session owns its working transcript and current-conversation
//! pointer, so two users (or two logins of one user) never share context.
//! Sessions idle for longer than the gate's timeout are evicted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::http::HeaderMap;
use axum::http::header::COOKIE;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{RelayError, RelayResult};
use crate::ids::{ConversationId, SessionToken};
use crate::store::records::{Turn, UserRole};

/// Header carrying the session token.
pub const SESSION_HEADER: &str = "x-session-token";
/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "relay_session";
/// Idle time after which a session is evicted.
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Mutable per-session conversation state.
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    /// Conversation the transcript belongs to, if any has been allocated.
    pub current_conversation: Option<ConversationId>,
    /// Working transcript sent upstream on the next turn.
    pub transcript: Vec<Turn>,
}

/// An authenticated session.
#[derive(Debug)]
pub struct Session {
    /// Token identifying this session.
    pub token: SessionToken,
    /// Account name.
    pub username: String,
    /// Account role at login time.
    pub role: UserRole,
    /// Conversation state; locked for the duration of a chat turn.
    pub state: Mutex<SessionState>,
    /// Milliseconds since the gate epoch at the last successful resolve.
    last_seen_ms: AtomicU64,
}

impl Session {
    /// Fail with `Forbidden` unless this session belongs to an admin.
    ///
    /// # Errors
    /// Returns `Forbidden` for non-admin sessions.
    pub fn require_admin(&self) -> RelayResult<()> {
        if self.role == UserRole::Admin {
            Ok(())
        } else {
            Err(RelayError::Forbidden("admin role required".to_string()))
        }
    }
}

/// In-memory table of live sessions.
pub struct SessionGate {
    sessions: DashMap<SessionToken, Arc<Session>>,
    epoch: Instant,
    idle_timeout: Duration,
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::with_idle_timeout(DEFAULT_SESSION_IDLE_TIMEOUT)
    }
}

impl SessionGate {
    /// Create an empty gate with the default idle timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty gate that evicts sessions idle for `idle_timeout`.
    #[must_use]
    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            epoch: Instant::now(),
            idle_timeout,
        }
    }

    /// Open a fresh session with an empty transcript and no pointer.
    ///
    /// Expired sessions are pruned first.
    pub fn open(&self, username: &str, role: UserRole) -> Arc<Session> {
        self.prune_expired();

        let session = Arc::new(Session {
            token: SessionToken::new(),
            username: username.to_string(),
            role,
            state: Mutex::new(SessionState::default()),
            last_seen_ms: AtomicU64::new(self.now_ms()),
        });
        self.sessions.insert(session.token, Arc::clone(&session));
        debug!("opened session for {username}");
        session
    }

    /// Look up a live session and mark it as used.
    ///
    /// # Errors
    /// Returns `AuthRequired` if the token is unknown or has expired.
    pub fn resolve(&self, token: SessionToken) -> RelayResult<Arc<Session>> {
        let session = self
            .sessions
            .get(&token)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RelayError::AuthRequired)?;

        let now = self.now_ms();
        if self.is_expired(&session, now) {
            self.sessions.remove(&token);
            debug!("session for {} expired", session.username);
            return Err(RelayError::AuthRequired);
        }

        session.last_seen_ms.fetch_max(now, Ordering::Relaxed);
        Ok(session)
    }

    /// Drop every session idle for longer than the timeout. Returns how many were dropped.
    pub fn prune_expired(&self) -> usize {
        let now = self.now_ms();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !self.is_expired(session, now));
        let pruned = before.saturating_sub(self.sessions.len());
        if pruned > 0 {
            debug!("pruned {pruned} idle sessions");
        }
        pruned
    }

    fn is_expired(&self, session: &Session, now_ms: u64) -> bool {
        let idle = now_ms.saturating_sub(session.last_seen_ms.load(Ordering::Relaxed));
        u128::from(idle) > self.idle_timeout.as_millis()
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Resolve the session referenced by request headers.
    ///
    /// # Errors
    /// Returns `AuthRequired` if no valid token is present.
    pub fn resolve_headers(&self, headers: &HeaderMap) -> RelayResult<Arc<Session>> {
        let token = token_from_headers(headers).ok_or(RelayError::AuthRequired)?;
        self.resolve(token)
    }

    /// Close one session. Returns `false` if it was not open.
    pub fn close(&self, token: SessionToken) -> bool {
        self.sessions.remove(&token).is_some()
    }

    /// Close every session of a user. Returns how many were closed.
    pub fn close_user(&self, username: &str) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.username != username);
        before.saturating_sub(self.sessions.len())
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Extract a session token from the dedicated header or the session cookie.
#[must_use]
pub fn token_from_headers(headers: &HeaderMap) -> Option<SessionToken> {
    if let Some(value) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        return value.trim().parse().ok();
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .and_then(|(_, value)| value.parse().ok())
}

/// `Set-Cookie` value for a freshly issued token.
#[must_use]
pub fn session_cookie(token: SessionToken) -> String {
    format!("{SESSION_COOKIE}={token}; HttpOnly; Path=/; SameSite=Lax")
}
