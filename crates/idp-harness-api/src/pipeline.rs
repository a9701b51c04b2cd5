//! Test harness wiring the simulated authority, the page simulator and the
//! virtual browser together.

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use tracing::debug;

use idp_harness_core::authorize::{AuthorizeParameters, AuthorizeRequest, AuthorizeResponse};
use idp_harness_core::backchannel::BackChannelMessageHandler;
use idp_harness_core::config::Config;
use idp_harness_core::error::{Error, Result};
use idp_harness_core::external::ExternalIdentityBridge;
use idp_harness_core::interaction::{ConsentResult, InMemoryInteractionStore, Principal};
use idp_harness_core::session::SessionSink;

use crate::browser::BrowserClient;
use crate::pages::{PageHandler, PageKind, PageRegistry};
use crate::server::{AppState, build_router};
use crate::simulator::{CallLog, InteractionSimulator};

type ConfigureServices = Box<dyn FnOnce(&mut Config) + Send>;
type Configure = Box<dyn FnOnce(Router) -> Router + Send>;

/// Builds a [`MockIdpPipeline`]. Callbacks run in registration order.
pub struct PipelineBuilder {
    config: Config,
    configure_services: Vec<ConfigureServices>,
    configure: Vec<Configure>,
    pages: Vec<(PageKind, Arc<dyn PageHandler>)>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl PipelineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            configure_services: Vec::new(),
            configure: Vec::new(),
            pages: Vec::new(),
        }
    }

    /// Adjust configuration before anything is built from it.
    pub fn on_configure_services(mut self, f: impl FnOnce(&mut Config) + Send + 'static) -> Self {
        self.configure_services.push(Box::new(f));
        self
    }

    /// Wrap the finished router, e.g. with extra routes or layers.
    pub fn on_configure(mut self, f: impl FnOnce(Router) -> Router + Send + 'static) -> Self {
        self.configure.push(Box::new(f));
        self
    }

    /// Answer `kind` with `handler` instead of the simulator.
    pub fn page(mut self, kind: PageKind, handler: Arc<dyn PageHandler>) -> Self {
        self.pages.push((kind, handler));
        self
    }

    pub fn build(self) -> Result<MockIdpPipeline> {
        let mut config = self.config;
        for f in self.configure_services {
            f(&mut config);
        }

        let simulator = Arc::new(InteractionSimulator::new());
        let pages = Arc::new(PageRegistry::simulated(simulator.clone()));
        for (kind, handler) in self.pages {
            pages.set(kind, handler)?;
        }

        let backchannel = Arc::new(BackChannelMessageHandler::new());
        let state = AppState::new(config, backchannel.clone(), pages)?;

        let mut router = build_router(state.clone());
        for f in self.configure {
            router = f(router);
        }
        let browser = BrowserClient::new(router, state.origin.clone());

        debug!(origin = %state.origin, "mock identity provider pipeline built");
        Ok(MockIdpPipeline {
            state,
            simulator,
            backchannel,
            browser,
        })
    }
}

/// An in-process identity provider plus a browser pointed at it.
pub struct MockIdpPipeline {
    state: AppState,
    simulator: Arc<InteractionSimulator>,
    backchannel: Arc<BackChannelMessageHandler>,
    browser: BrowserClient,
}

impl MockIdpPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// A pipeline over the default configuration.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    pub fn browser(&self) -> &BrowserClient {
        &self.browser
    }

    pub fn simulator(&self) -> &InteractionSimulator {
        &self.simulator
    }

    pub fn interaction(&self) -> &InMemoryInteractionStore {
        &self.state.interaction
    }

    pub fn sessions(&self) -> &dyn SessionSink {
        self.state.sessions.as_ref()
    }

    pub fn backchannel(&self) -> &BackChannelMessageHandler {
        &self.backchannel
    }

    pub fn external_bridge(&self) -> Option<&ExternalIdentityBridge> {
        self.state.bridge.as_deref()
    }

    /// Replace a page handler on the live router.
    pub fn set_page(&self, kind: PageKind, handler: Arc<dyn PageHandler>) -> Result<()> {
        self.state.pages.set(kind, handler)
    }

    // --- URLs ---

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.state.origin)
    }

    pub fn login_page(&self) -> String {
        self.url(&self.config().user_interaction.login_url)
    }

    pub fn logout_page(&self) -> String {
        self.url(&self.config().user_interaction.logout_url)
    }

    pub fn consent_page(&self) -> String {
        self.url(&self.config().user_interaction.consent_url)
    }

    pub fn error_page(&self) -> String {
        self.url(&self.config().user_interaction.error_url)
    }

    pub fn federated_signout_url(&self) -> String {
        self.url(&self.config().user_interaction.federated_signout_path)
    }

    pub fn authorize_endpoint(&self) -> String {
        self.url(&self.config().authority.authorize_path)
    }

    pub fn end_session_endpoint(&self) -> String {
        self.url(&self.config().authority.end_session_path)
    }

    // --- Simulated user ---

    pub fn call_log(&self) -> Result<CallLog> {
        self.simulator.call_log()
    }

    pub fn reset_call_log(&self) -> Result<()> {
        self.simulator.reset_call_log()
    }

    pub fn set_subject(&self, principal: Option<Principal>) -> Result<()> {
        self.simulator.set_subject(principal)
    }

    pub fn set_consent_response(&self, consent: Option<ConsentResult>) -> Result<()> {
        self.simulator.set_consent_response(consent)
    }

    /// Sign `principal` in by visiting the login page with redirects off.
    pub async fn login_as(&self, principal: Principal) -> Result<()> {
        let _guard = self.browser.without_auto_redirect();
        self.simulator.set_subject(Some(principal))?;
        self.browser.get(&self.login_page()).await?;
        Ok(())
    }

    /// Sign in a configured user by subject id.
    pub async fn login_as_subject(&self, subject_id: &str) -> Result<()> {
        let user = self
            .config()
            .find_user(subject_id)
            .ok_or_else(|| Error::UnknownUser(subject_id.to_string()))?;
        self.login_as(Principal::from(user)).await
    }

    // --- Cookies ---

    pub fn remove_login_cookie(&self) {
        self.browser
            .remove_cookie(&self.state.origin, &self.state.cookie_names.authentication);
    }

    pub fn remove_session_cookie(&self) {
        self.browser
            .remove_cookie(&self.state.origin, &self.state.cookie_names.check_session);
    }

    /// Current check-session cookie value.
    pub fn session_cookie(&self) -> Option<String> {
        self.browser
            .get_cookie(&self.state.origin, &self.state.cookie_names.check_session)
    }

    // --- Authorize requests ---

    pub fn create_authorize_url(&self, params: &AuthorizeParameters) -> String {
        AuthorizeRequest::new(self.authorize_endpoint()).create_authorize_url(params)
    }

    pub fn parse_authorization_response_url(&self, url: &str) -> Result<AuthorizeResponse> {
        AuthorizeResponse::parse(url)
    }

    /// Hit the authorize endpoint once with redirects off.
    ///
    /// Expects a 302. A redirect to the error page is followed so the error
    /// page can record the error, and yields `None`. Any other redirect is
    /// parsed as the authorization response.
    pub async fn request_authorization_endpoint(
        &self,
        params: &AuthorizeParameters,
    ) -> Result<Option<AuthorizeResponse>> {
        let url = self.create_authorize_url(params);
        let location = {
            let _guard = self.browser.without_auto_redirect();
            let response = self.browser.get(&url).await?;
            if response.status != StatusCode::FOUND {
                return Err(Error::UnexpectedStatus {
                    expected: StatusCode::FOUND.as_u16(),
                    actual: response.status.as_u16(),
                });
            }
            response.location().ok_or(Error::MissingLocation)?
        };

        if location.as_str().starts_with(&self.error_page()) {
            self.browser.get(location.as_str()).await?;
            return Ok(None);
        }

        AuthorizeResponse::parse(location.as_str()).map(Some)
    }
}
