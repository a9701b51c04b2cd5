//! Interaction page plumbing.
//!
//! Each page route dispatches to whatever [`PageHandler`] is currently
//! registered for its [`PageKind`]. Handlers see the request through a
//! [`PageContext`] and answer by signing in/out and optionally redirecting.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};

use idp_harness_core::config::Config;
use idp_harness_core::error::{Error, Result};
use idp_harness_core::interaction::{InteractionService, Principal};
use idp_harness_core::session::{Session, SessionSink};

use crate::server::{AppState, CookieNames};
use crate::simulator::{InteractionSimulator, SimulatedPage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    Login,
    Logout,
    Consent,
    Error,
    FederatedSignOut,
}

impl PageKind {
    pub const ALL: [PageKind; 5] = [
        PageKind::Login,
        PageKind::Logout,
        PageKind::Consent,
        PageKind::Error,
        PageKind::FederatedSignOut,
    ];

    /// Route the page is served on.
    pub fn path(self, config: &Config) -> &str {
        let ui = &config.user_interaction;
        match self {
            PageKind::Login => &ui.login_url,
            PageKind::Logout => &ui.logout_url,
            PageKind::Consent => &ui.consent_url,
            PageKind::Error => &ui.error_url,
            PageKind::FederatedSignOut => &ui.federated_signout_path,
        }
    }
}

#[async_trait]
pub trait PageHandler: Send + Sync {
    async fn handle(&self, ctx: &mut PageContext) -> Result<()>;
}

/// Everything a page handler may touch for one request.
pub struct PageContext {
    pub kind: PageKind,
    pub path: String,
    pub config: Arc<Config>,
    pub interaction: Arc<dyn InteractionService>,
    pub sessions: Arc<dyn SessionSink>,
    pub cookie_names: CookieNames,
    query: HashMap<String, String>,
    jar: CookieJar,
    redirect: Option<String>,
}

impl PageContext {
    pub fn new(
        kind: PageKind,
        path: impl Into<String>,
        raw_query: Option<&str>,
        state: &AppState,
        jar: CookieJar,
    ) -> Self {
        let mut query = HashMap::new();
        for (key, value) in url::form_urlencoded::parse(raw_query.unwrap_or_default().as_bytes()) {
            // First occurrence wins.
            query.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }
        Self {
            kind,
            path: path.into(),
            config: state.config.clone(),
            interaction: state.interaction.clone(),
            sessions: state.sessions.clone(),
            cookie_names: state.cookie_names.clone(),
            query,
            jar,
            redirect: None,
        }
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn session_id(&self) -> Option<String> {
        self.jar
            .get(&self.cookie_names.authentication)
            .map(|c| c.value().to_string())
    }

    pub async fn current_session(&self) -> Result<Option<Session>> {
        match self.session_id() {
            Some(sid) => self.sessions.session(&sid).await,
            None => Ok(None),
        }
    }

    /// Sign `principal` in and issue both session cookies.
    pub async fn sign_in(&mut self, principal: &Principal) -> Result<Session> {
        let session = self.sessions.sign_in(principal).await?;
        self.jar = set_session_cookies(self.jar.clone(), &self.cookie_names, &session.session_id);
        Ok(session)
    }

    /// End the current session, if any, and clear both cookies regardless,
    /// including when ending the session fails.
    pub async fn sign_out(&mut self) -> Result<Option<Session>> {
        let ended = match self.session_id() {
            Some(sid) => self.sessions.sign_out(&sid).await,
            None => Ok(None),
        };
        self.jar = clear_session_cookies(self.jar.clone(), &self.cookie_names);
        ended
    }

    pub fn redirect(&mut self, location: impl Into<String>) {
        self.redirect = Some(location.into());
    }

    pub fn redirect_location(&self) -> Option<&str> {
        self.redirect.as_deref()
    }

    /// 302 when a redirect was requested, otherwise an empty 200.
    pub fn into_response(self) -> Response {
        match self.redirect {
            Some(location) => (self.jar, found(location)).into_response(),
            None => (self.jar, StatusCode::OK).into_response(),
        }
    }

    /// Error response that still carries the cookie changes made so far.
    pub fn into_error_response(self, err: Error) -> Response {
        (self.jar, err).into_response()
    }
}

/// Handlers currently answering each page. Swappable at any time.
pub struct PageRegistry {
    slots: RwLock<HashMap<PageKind, Arc<dyn PageHandler>>>,
}

impl PageRegistry {
    /// Every page answered by `simulator`.
    pub fn simulated(simulator: Arc<InteractionSimulator>) -> Self {
        let slots = PageKind::ALL
            .into_iter()
            .map(|kind| {
                let page: Arc<dyn PageHandler> =
                    Arc::new(SimulatedPage::new(simulator.clone(), kind));
                (kind, page)
            })
            .collect();
        Self {
            slots: RwLock::new(slots),
        }
    }

    pub fn get(&self, kind: PageKind) -> Result<Arc<dyn PageHandler>> {
        let slots = self
            .slots
            .read()
            .map_err(|_| Error::Internal(anyhow::anyhow!("page registry lock poisoned")))?;
        slots
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("no handler for {kind:?} page")))
    }

    pub fn set(&self, kind: PageKind, handler: Arc<dyn PageHandler>) -> Result<()> {
        self.slots
            .write()
            .map_err(|_| Error::Internal(anyhow::anyhow!("page registry lock poisoned")))?
            .insert(kind, handler);
        Ok(())
    }
}

pub fn found(location: String) -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, location)])
}

fn session_cookie(name: &str, value: &str, http_only: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(name.to_string(), value.to_string());
    cookie.set_http_only(http_only);
    cookie.set_secure(true);
    cookie.set_same_site(SameSite::None);
    cookie.set_path("/");
    cookie
}

pub fn set_session_cookies(jar: CookieJar, names: &CookieNames, session_id: &str) -> CookieJar {
    jar.add(session_cookie(&names.authentication, session_id, true))
        .add(session_cookie(&names.check_session, session_id, false))
}

pub fn clear_session_cookies(jar: CookieJar, names: &CookieNames) -> CookieJar {
    let mut auth = Cookie::from(names.authentication.clone());
    auth.set_path("/");
    let mut check = Cookie::from(names.check_session.clone());
    check.set_path("/");
    jar.remove(auth).remove(check)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_paths_follow_config() {
        let config = Config::default();
        assert_eq!(PageKind::Login.path(&config), "/account/login");
        assert_eq!(PageKind::Logout.path(&config), "/account/logout");
        assert_eq!(PageKind::Consent.path(&config), "/consent");
        assert_eq!(PageKind::Error.path(&config), "/home/error");
        assert_eq!(PageKind::FederatedSignOut.path(&config), "/signout-oidc");
    }

    struct Nothing;

    #[async_trait]
    impl PageHandler for Nothing {
        async fn handle(&self, _ctx: &mut PageContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_swaps_handlers() {
        let registry = PageRegistry::simulated(Arc::new(InteractionSimulator::new()));
        let before = registry.get(PageKind::Logout).unwrap();
        registry.set(PageKind::Logout, Arc::new(Nothing)).unwrap();
        let after = registry.get(PageKind::Logout).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }
}
