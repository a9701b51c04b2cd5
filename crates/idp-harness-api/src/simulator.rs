//! Simulated user behind the interaction pages.
//!
//! Tests pre-assign what the "user" will do (sign in as a principal, answer
//! consent) and afterwards inspect the [`CallLog`] to see what each page was
//! asked.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info};

use idp_harness_core::error::{Error, Result};
use idp_harness_core::interaction::{
    AuthorizationContext, ConsentResult, ErrorContext, LogoutContext, Principal,
};

use crate::pages::{PageContext, PageHandler, PageKind};

/// Query parameter the login and consent pages resolve their authorization
/// context from, whatever return-URL parameter the authority is configured
/// to send.
pub const CONTEXT_PARAMETER: &str = "returnUrl";

/// What the pages saw. `None` means the id did not resolve (or was absent).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallLog {
    pub login_was_called: bool,
    pub login_request: Option<AuthorizationContext>,
    pub consent_was_called: bool,
    pub consent_request: Option<AuthorizationContext>,
    pub logout_was_called: bool,
    pub logout_request: Option<LogoutContext>,
    pub error_was_called: bool,
    pub error_message: Option<ErrorContext>,
}

#[derive(Default)]
struct SimulatorState {
    call_log: CallLog,
    subject: Option<Principal>,
    consent_response: Option<ConsentResult>,
}

#[derive(Default)]
pub struct InteractionSimulator {
    state: Mutex<SimulatorState>,
}

impl InteractionSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimulatorState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal(anyhow::anyhow!("simulator lock poisoned")))
    }

    /// Principal the next login page visit signs in. Consumed by that visit.
    pub fn set_subject(&self, principal: Option<Principal>) -> Result<()> {
        self.lock()?.subject = principal;
        Ok(())
    }

    pub fn pending_subject(&self) -> Result<Option<Principal>> {
        Ok(self.lock()?.subject.clone())
    }

    /// Answer the next consent page visit gives. Consumed once forwarded.
    pub fn set_consent_response(&self, consent: Option<ConsentResult>) -> Result<()> {
        self.lock()?.consent_response = consent;
        Ok(())
    }

    pub fn pending_consent(&self) -> Result<Option<ConsentResult>> {
        Ok(self.lock()?.consent_response.clone())
    }

    pub fn call_log(&self) -> Result<CallLog> {
        Ok(self.lock()?.call_log.clone())
    }

    pub fn reset_call_log(&self) -> Result<()> {
        self.lock()?.call_log = CallLog::default();
        Ok(())
    }

    pub async fn login(&self, ctx: &mut PageContext) -> Result<()> {
        self.lock()?.call_log.login_was_called = true;
        let request = ctx.interaction.authorization_context(ctx.query(CONTEXT_PARAMETER)).await?;

        let principal = {
            let mut state = self.lock()?;
            state.call_log.login_request = request;
            state.subject.take()
        };

        let Some(principal) = principal else {
            debug!("login page visited with no subject assigned");
            return Ok(());
        };

        let session = ctx.sign_in(&principal).await?;
        info!(sub = %principal.subject_id, sid = %session.session_id, "login page signed in subject");
        let param = ctx.config.user_interaction.login_return_url_parameter.clone();
        if let Some(url) = ctx.query(&param).map(str::to_string) {
            ctx.redirect(url);
        }
        Ok(())
    }

    pub async fn logout(&self, ctx: &mut PageContext) -> Result<()> {
        self.lock()?.call_log.logout_was_called = true;
        let request = ctx.interaction.logout_context(ctx.query("logoutId")).await?;
        self.lock()?.call_log.logout_request = request;
        Ok(())
    }

    pub async fn consent(&self, ctx: &mut PageContext) -> Result<()> {
        self.lock()?.call_log.consent_was_called = true;
        let request = ctx.interaction.authorization_context(ctx.query(CONTEXT_PARAMETER)).await?;

        let pending = {
            let mut state = self.lock()?;
            state.call_log.consent_request = request.clone();
            state.consent_response.clone()
        };

        let (Some(request), Some(consent)) = (request, pending) else {
            debug!("consent page visited without a context and a pending answer");
            return Ok(());
        };

        let subject = ctx.current_session().await?.map(|s| s.subject_id);
        ctx.interaction
            .grant_consent(&request, &consent, subject.as_deref())
            .await?;
        self.lock()?.consent_response = None;
        info!(client_id = %request.client_id, denied = consent.denied, "consent page answered");

        let param = ctx.config.user_interaction.consent_return_url_parameter.clone();
        if let Some(url) = ctx.query(&param).map(str::to_string) {
            ctx.redirect(url);
        }
        Ok(())
    }

    pub async fn error(&self, ctx: &mut PageContext) -> Result<()> {
        self.lock()?.call_log.error_was_called = true;
        let message = ctx.interaction.error_context(ctx.query("errorId")).await?;
        if let Some(message) = &message {
            info!(error = %message.error, "error page shown");
        }
        self.lock()?.call_log.error_message = message;
        Ok(())
    }

    pub async fn federated_sign_out(&self, ctx: &mut PageContext) -> Result<()> {
        let ended = ctx.sign_out().await?;
        info!(had_session = ended.is_some(), "federated sign-out");
        Ok(())
    }
}

/// Routes one page kind to the matching simulator behavior.
pub struct SimulatedPage {
    simulator: Arc<InteractionSimulator>,
    kind: PageKind,
}

impl SimulatedPage {
    pub fn new(simulator: Arc<InteractionSimulator>, kind: PageKind) -> Self {
        Self { simulator, kind }
    }
}

#[async_trait]
impl PageHandler for SimulatedPage {
    async fn handle(&self, ctx: &mut PageContext) -> Result<()> {
        match self.kind {
            PageKind::Login => self.simulator.login(ctx).await,
            PageKind::Logout => self.simulator.logout(ctx).await,
            PageKind::Consent => self.simulator.consent(ctx).await,
            PageKind::Error => self.simulator.error(ctx).await,
            PageKind::FederatedSignOut => self.simulator.federated_sign_out(ctx).await,
        }
    }
}

/// Login page that signs the same principal in on every visit.
pub struct FixedLoginPage {
    principal: Principal,
}

impl FixedLoginPage {
    pub fn new(principal: Principal) -> Self {
        Self { principal }
    }
}

#[async_trait]
impl PageHandler for FixedLoginPage {
    async fn handle(&self, ctx: &mut PageContext) -> Result<()> {
        ctx.sign_in(&self.principal).await?;
        let param = ctx.config.user_interaction.login_return_url_parameter.clone();
        if let Some(url) = ctx.query(&param).map(str::to_string) {
            ctx.redirect(url);
        }
        Ok(())
    }
}
