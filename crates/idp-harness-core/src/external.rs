//! Stand-in for an upstream (federated) identity provider handler.
//!
//! Only the federated sign-out callback is meaningful; the rest of the
//! handler surface exists so callers can wire it in like a real provider.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::interaction::Principal;
use crate::session::{Session, SessionSink};

/// The capabilities an upstream authentication handler exposes.
#[async_trait]
pub trait AuthenticationHandler: Send + Sync {
    /// Give the handler first look at a request. `Ok(true)` means the
    /// request was fully handled and must not reach the router.
    async fn handle_request(&self, path: &str, session_id: Option<&str>) -> Result<bool>;

    async fn sign_in(&self, principal: &Principal) -> Result<()>;

    async fn sign_out(&self, session_id: Option<&str>) -> Result<Option<Session>>;

    async fn authenticate(&self, session_id: Option<&str>) -> Result<Session>;
}

pub struct ExternalIdentityBridge {
    federated_signout_path: String,
    sessions: Arc<dyn SessionSink>,
}

impl ExternalIdentityBridge {
    pub fn new(federated_signout_path: impl Into<String>, sessions: Arc<dyn SessionSink>) -> Self {
        Self {
            federated_signout_path: federated_signout_path.into(),
            sessions,
        }
    }

    pub fn federated_signout_path(&self) -> &str {
        &self.federated_signout_path
    }
}

#[async_trait]
impl AuthenticationHandler for ExternalIdentityBridge {
    async fn handle_request(&self, path: &str, session_id: Option<&str>) -> Result<bool> {
        if path != self.federated_signout_path {
            return Ok(false);
        }
        self.sign_out(session_id).await?;
        info!(path, "federated sign-out handled by external bridge");
        Ok(true)
    }

    // Upstream sign-in is never simulated.
    async fn sign_in(&self, _principal: &Principal) -> Result<()> {
        Ok(())
    }

    async fn sign_out(&self, session_id: Option<&str>) -> Result<Option<Session>> {
        match session_id {
            Some(sid) => self.sessions.sign_out(sid).await,
            None => Ok(None),
        }
    }

    async fn authenticate(&self, _session_id: Option<&str>) -> Result<Session> {
        error!("external bridge cannot authenticate requests");
        Err(Error::ContractViolation("authenticate"))
    }
}
