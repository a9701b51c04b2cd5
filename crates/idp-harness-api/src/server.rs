use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::middleware;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use idp_harness_core::backchannel::{BackChannelLogoutNotifier, OutboundHandler, ReqwestHandler};
use idp_harness_core::config::{Config, CookieConfig};
use idp_harness_core::error::Result;
use idp_harness_core::external::ExternalIdentityBridge;
use idp_harness_core::interaction::{InMemoryInteractionStore, Principal};
use idp_harness_core::session::{InMemorySessionStore, SessionSink};

use crate::pages::{PageKind, PageRegistry};
use crate::routes;
use crate::simulator::{FixedLoginPage, InteractionSimulator};

/// Names of the two session cookies.
#[derive(Clone, Debug)]
pub struct CookieNames {
    /// Carries the session id; `HttpOnly`.
    pub authentication: String,
    /// Same `sid`, readable by check-session scripts.
    pub check_session: String,
}

impl CookieNames {
    pub fn from_config(cookies: &CookieConfig) -> Self {
        Self {
            authentication: cookies.authentication.clone(),
            check_session: cookies.check_session.clone(),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub origin: String,
    pub issuer: String,
    pub interaction: Arc<InMemoryInteractionStore>,
    pub sessions: Arc<dyn SessionSink>,
    pub pages: Arc<PageRegistry>,
    pub bridge: Option<Arc<ExternalIdentityBridge>>,
    pub cookie_names: CookieNames,
}

impl AppState {
    pub fn new(
        config: Config,
        outbound: Arc<dyn OutboundHandler>,
        pages: Arc<PageRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let origin = config.origin()?;
        let issuer = config.issuer()?;

        let interaction = Arc::new(InMemoryInteractionStore::new(
            origin.clone(),
            config.authority.authorize_callback_path.clone(),
        ));

        let sessions: Arc<dyn SessionSink> = if config.backchannel.logout_notifications {
            let notifier = BackChannelLogoutNotifier::new(outbound, issuer.clone(), &config.clients);
            Arc::new(InMemorySessionStore::with_notifier(notifier))
        } else {
            Arc::new(InMemorySessionStore::new())
        };

        let bridge = config.external.enabled.then(|| {
            Arc::new(ExternalIdentityBridge::new(
                config.user_interaction.federated_signout_path.clone(),
                sessions.clone(),
            ))
        });

        Ok(Self {
            cookie_names: CookieNames::from_config(&config.cookies),
            config: Arc::new(config),
            origin,
            issuer,
            interaction,
            sessions,
            pages,
            bridge,
        })
    }
}

/// Assemble the full router for `state`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::router(&state.config))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            routes::external::external_bridge,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the simulated IdP over TCP.
///
/// With `login_as` set, every visit to the login page signs that user in;
/// otherwise the pages only record what they were asked.
pub async fn serve(config: Config, login_as: Option<Principal>) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);

    let outbound = Arc::new(ReqwestHandler::new(Duration::from_secs(
        config.backchannel.timeout_secs,
    ))?);

    let simulator = Arc::new(InteractionSimulator::new());
    let pages = Arc::new(PageRegistry::simulated(simulator));
    if let Some(principal) = login_as {
        tracing::info!(sub = %principal.subject_id, "login page signs in automatically");
        pages.set(PageKind::Login, Arc::new(FixedLoginPage::new(principal)))?;
    }

    let state = AppState::new(config, outbound, pages)?;
    let origin = state.origin.clone();
    let app = build_router(state);

    tracing::info!(%addr, %origin, "starting simulated identity provider");
    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received CTRL+C"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
                tracing::info!("received CTRL+C");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received CTRL+C");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_names_default() {
        let names = CookieNames::from_config(&CookieConfig::default());
        assert_eq!(names.authentication, "idsrv");
        assert_eq!(names.check_session, "idsrv.session");
    }

    #[test]
    fn bridge_installed_only_when_enabled() {
        let outbound = Arc::new(idp_harness_core::backchannel::BackChannelMessageHandler::new());
        let pages = Arc::new(PageRegistry::simulated(Arc::new(InteractionSimulator::new())));

        let state = AppState::new(Config::default(), outbound.clone(), pages.clone()).unwrap();
        assert!(state.bridge.is_none());

        let mut config = Config::default();
        config.external.enabled = true;
        let state = AppState::new(config, outbound, pages).unwrap();
        assert_eq!(state.bridge.unwrap().federated_signout_path(), "/signout-oidc");
    }
}
