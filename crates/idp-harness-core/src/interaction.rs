use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::config::UserConfig;
use crate::error::{Error, Result};

// --- Contexts ---

/// A pending authorization request, as seen by the interaction pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationContext {
    pub client_id: String,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub response_mode: Option<String>,
    pub scopes: Vec<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub login_hint: Option<String>,
    pub acr_values: Vec<String>,
    pub prompt: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub extra: BTreeMap<String, String>,
    /// Raw authorize query the context was read from; keys consent decisions.
    pub correlation_id: String,
}

impl AuthorizationContext {
    /// Read an authorize query string. Returns `None` without a `client_id`.
    pub fn from_query(query: &str) -> Option<Self> {
        let mut ctx = Self {
            correlation_id: query.to_string(),
            ..Self::default()
        };
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let value = value.into_owned();
            match key.as_ref() {
                "client_id" => ctx.client_id = value,
                "redirect_uri" => ctx.redirect_uri = Some(value),
                "response_type" => ctx.response_type = Some(value),
                "response_mode" => ctx.response_mode = Some(value),
                "scope" => ctx.scopes = value.split_whitespace().map(String::from).collect(),
                "state" => ctx.state = Some(value),
                "nonce" => ctx.nonce = Some(value),
                "login_hint" => ctx.login_hint = Some(value),
                "acr_values" => {
                    ctx.acr_values = value.split_whitespace().map(String::from).collect()
                }
                "prompt" => ctx.prompt = Some(value),
                "code_challenge" => ctx.code_challenge = Some(value),
                "code_challenge_method" => ctx.code_challenge_method = Some(value),
                _ => {
                    ctx.extra.insert(key.into_owned(), value);
                }
            }
        }
        if ctx.client_id.is_empty() { None } else { Some(ctx) }
    }

    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }

    /// The `idp:` acr value, used by relying parties to pick an upstream provider.
    pub fn idp(&self) -> Option<&str> {
        self.acr_values.iter().find_map(|v| v.strip_prefix("idp:"))
    }

    /// The `tenant:` acr value.
    pub fn tenant(&self) -> Option<&str> {
        self.acr_values.iter().find_map(|v| v.strip_prefix("tenant:"))
    }
}

/// A pending end-session request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogoutContext {
    pub logout_id: String,
    pub client_id: Option<String>,
    pub subject_id: Option<String>,
    pub session_id: Option<String>,
    /// Validated post-logout redirect, with `state` already appended.
    pub post_logout_redirect_uri: Option<String>,
    pub show_signout_prompt: bool,
}

/// An authorization error that was routed to the error page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub error: String,
    pub error_description: Option<String>,
    pub request_id: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_mode: Option<String>,
}

// --- Decisions made by the simulated user ---

/// An authenticated identity to sign in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject_id: String,
    pub name: String,
    pub identity_provider: String,
    pub claims: BTreeMap<String, String>,
}

impl Principal {
    pub fn new(subject_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            name: name.into(),
            identity_provider: "local".to_string(),
            claims: BTreeMap::new(),
        }
    }

    pub fn with_claim(mut self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(kind.into(), value.into());
        self
    }

    pub fn with_identity_provider(mut self, idp: impl Into<String>) -> Self {
        self.identity_provider = idp.into();
        self
    }
}

impl From<&UserConfig> for Principal {
    fn from(user: &UserConfig) -> Self {
        Self {
            claims: user.claims.clone(),
            ..Self::new(user.subject_id.clone(), user.display_name())
        }
    }
}

/// The user's answer on the consent page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentResult {
    pub scopes_consented: Vec<String>,
    pub remember_consent: bool,
    pub denied: bool,
}

impl ConsentResult {
    pub fn granted<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes_consented: scopes.into_iter().map(Into::into).collect(),
            remember_consent: false,
            denied: false,
        }
    }

    pub fn denied() -> Self {
        Self { denied: true, ..Self::default() }
    }

    pub fn remember(mut self) -> Self {
        self.remember_consent = true;
        self
    }
}

/// A consent decision forwarded by the consent page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentGrant {
    pub correlation_id: String,
    pub client_id: String,
    pub subject_id: Option<String>,
    pub result: ConsentResult,
}

// --- Contract ---

/// Resolves opaque interaction ids into contexts and accepts consent.
///
/// "Nothing found" is `Ok(None)`, never an error.
#[async_trait]
pub trait InteractionService: Send + Sync {
    async fn authorization_context(
        &self,
        return_url: Option<&str>,
    ) -> Result<Option<AuthorizationContext>>;

    async fn logout_context(&self, logout_id: Option<&str>) -> Result<Option<LogoutContext>>;

    async fn error_context(&self, error_id: Option<&str>) -> Result<Option<ErrorContext>>;

    async fn grant_consent(
        &self,
        request: &AuthorizationContext,
        consent: &ConsentResult,
        subject_id: Option<&str>,
    ) -> Result<()>;
}

// --- In-memory implementation ---

#[derive(Default)]
struct StoreState {
    logouts: HashMap<String, LogoutContext>,
    errors: HashMap<String, ErrorContext>,
    pending_consent: HashMap<String, ConsentGrant>,
    grant_history: Vec<ConsentGrant>,
    remembered: HashMap<(String, String), Vec<String>>,
}

/// Interaction store shared by the simulated authority and the pages.
///
/// Authorization contexts are not stored: a `returnUrl` pointing at the
/// authorize callback path carries the whole request in its query.
pub struct InMemoryInteractionStore {
    origin: String,
    callback_path: String,
    state: Mutex<StoreState>,
}

impl InMemoryInteractionStore {
    pub fn new(origin: impl Into<String>, callback_path: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            callback_path: callback_path.into(),
            state: Mutex::new(StoreState::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal(anyhow::anyhow!("interaction store lock poisoned")))
    }

    /// Accept only local return URLs that target the authorize callback.
    fn callback_query<'a>(&self, return_url: &'a str) -> Option<&'a str> {
        let local = return_url.strip_prefix(self.origin.as_str()).unwrap_or(return_url);
        let (path, query) = local.split_once('?')?;
        (path == self.callback_path).then_some(query)
    }

    pub fn store_logout(&self, mut ctx: LogoutContext) -> Result<String> {
        let id = new_id();
        ctx.logout_id = id.clone();
        self.lock()?.logouts.insert(id.clone(), ctx);
        Ok(id)
    }

    pub fn store_error(&self, ctx: ErrorContext) -> Result<String> {
        let id = new_id();
        self.lock()?.errors.insert(id.clone(), ctx);
        Ok(id)
    }

    /// Remove and return the pending consent decision for a request.
    pub fn take_consent(&self, correlation_id: &str) -> Result<Option<ConsentGrant>> {
        Ok(self.lock()?.pending_consent.remove(correlation_id))
    }

    pub fn remember_consent(&self, subject_id: &str, client_id: &str, scopes: &[String]) -> Result<()> {
        self.lock()?
            .remembered
            .insert((subject_id.to_string(), client_id.to_string()), scopes.to_vec());
        Ok(())
    }

    pub fn remembered_scopes(&self, subject_id: &str, client_id: &str) -> Result<Option<Vec<String>>> {
        Ok(self
            .lock()?
            .remembered
            .get(&(subject_id.to_string(), client_id.to_string()))
            .cloned())
    }

    /// Every grant forwarded so far, oldest first.
    pub fn grant_history(&self) -> Result<Vec<ConsentGrant>> {
        Ok(self.lock()?.grant_history.clone())
    }
}

#[async_trait]
impl InteractionService for InMemoryInteractionStore {
    async fn authorization_context(
        &self,
        return_url: Option<&str>,
    ) -> Result<Option<AuthorizationContext>> {
        Ok(return_url
            .and_then(|url| self.callback_query(url))
            .and_then(AuthorizationContext::from_query))
    }

    async fn logout_context(&self, logout_id: Option<&str>) -> Result<Option<LogoutContext>> {
        let Some(id) = logout_id else { return Ok(None) };
        Ok(self.lock()?.logouts.get(id).cloned())
    }

    async fn error_context(&self, error_id: Option<&str>) -> Result<Option<ErrorContext>> {
        let Some(id) = error_id else { return Ok(None) };
        Ok(self.lock()?.errors.get(id).cloned())
    }

    async fn grant_consent(
        &self,
        request: &AuthorizationContext,
        consent: &ConsentResult,
        subject_id: Option<&str>,
    ) -> Result<()> {
        let grant = ConsentGrant {
            correlation_id: request.correlation_id.clone(),
            client_id: request.client_id.clone(),
            subject_id: subject_id.map(String::from),
            result: consent.clone(),
        };
        tracing::debug!(client_id = %grant.client_id, denied = consent.denied, "consent granted");
        let mut state = self.lock()?;
        state.grant_history.push(grant.clone());
        // At most one unanswered grant per client and subject.
        state
            .pending_consent
            .retain(|_, g| g.client_id != grant.client_id || g.subject_id != grant.subject_id);
        state.pending_consent.insert(grant.correlation_id.clone(), grant);
        Ok(())
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
