use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::backchannel::BackChannelLogoutNotifier;
use crate::error::{Error, Result};
use crate::interaction::Principal;

/// A signed-in browser session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// `sid`; carried by both the authentication and check-session cookies.
    pub session_id: String,
    pub subject_id: String,
    pub name: String,
    pub identity_provider: String,
    pub claims: BTreeMap<String, String>,
    pub auth_time: DateTime<Utc>,
    /// Clients that received an authorize response in this session.
    pub clients: BTreeSet<String>,
}

impl Session {
    pub fn new(principal: &Principal) -> Self {
        let mut sid = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::rng(), &mut sid);
        Self {
            session_id: hex::encode_upper(sid),
            subject_id: principal.subject_id.clone(),
            name: principal.name.clone(),
            identity_provider: principal.identity_provider.clone(),
            claims: principal.claims.clone(),
            auth_time: Utc::now(),
            clients: BTreeSet::new(),
        }
    }
}

/// OIDC session management `session_state` for a response to `client_id`.
///
/// `sha256(client_id origin sid salt)` in hex, then `.salt`. The origin is
/// taken from `redirect_uri`; unparsable URIs hash as-is.
pub fn session_state(client_id: &str, redirect_uri: &str, session_id: &str) -> String {
    let origin = url::Url::parse(redirect_uri)
        .map(|u| u.origin().ascii_serialization())
        .unwrap_or_else(|_| redirect_uri.to_string());

    let mut salt = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut salt);
    let salt = hex::encode(salt);

    let mut hasher = Sha256::new();
    hasher.update(format!("{client_id} {origin} {session_id} {salt}").as_bytes());
    format!("{}.{salt}", hex::encode(hasher.finalize()))
}

/// Where sign-in and sign-out land. Cookies are written by the caller.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn sign_in(&self, principal: &Principal) -> Result<Session>;

    /// End a session. Returns the session that ended, if any.
    async fn sign_out(&self, session_id: &str) -> Result<Option<Session>>;

    async fn session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Record that a client received a response in this session.
    async fn add_client(&self, session_id: &str, client_id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    notifier: Option<BackChannelLogoutNotifier>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifier(notifier: BackChannelLogoutNotifier) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            notifier: Some(notifier),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Session>>> {
        self.sessions
            .lock()
            .map_err(|_| Error::Internal(anyhow::anyhow!("session store lock poisoned")))
    }

    pub fn active_sessions(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or_default()
    }
}

#[async_trait]
impl SessionSink for InMemorySessionStore {
    async fn sign_in(&self, principal: &Principal) -> Result<Session> {
        let session = Session::new(principal);
        self.lock()?.insert(session.session_id.clone(), session.clone());
        info!(sub = %session.subject_id, sid = %session.session_id, "signed in");
        Ok(session)
    }

    async fn sign_out(&self, session_id: &str) -> Result<Option<Session>> {
        let removed = self.lock()?.remove(session_id);
        let Some(session) = removed else { return Ok(None) };
        info!(sub = %session.subject_id, sid = %session.session_id, "signed out");

        if let Some(notifier) = &self.notifier {
            notifier.notify(&session).await?;
        }
        Ok(Some(session))
    }

    async fn session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.lock()?.get(session_id).cloned())
    }

    async fn add_client(&self, session_id: &str, client_id: &str) -> Result<()> {
        if let Some(session) = self.lock()?.get_mut(session_id) {
            session.clients.insert(client_id.to_string());
        }
        Ok(())
    }
}
