// Default route layout (all paths configurable):
//   GET  /connect/authorize                  authorization endpoint
//   GET  /connect/authorize/callback         re-entry after login/consent
//   GET  /connect/endsession                 end-session endpoint
//   GET  /.well-known/openid-configuration   discovery document
//   ANY  /account/login, /account/logout, /consent, /home/error, /signout-oidc
//                                            interaction pages
use std::collections::BTreeSet;

use axum::extract::State;
use axum::http::Uri;
use axum::response::Response;
use axum::routing::{any, get};
use axum::{Json, Router};
use axum_extra::extract::CookieJar;

use idp_harness_core::config::Config;
use idp_harness_core::error::Error;

pub mod authority;
pub mod external;

use crate::pages::{PageContext, PageKind};
use crate::server::AppState;

/// OpenID Connect Discovery document.
async fn openid_configuration(State(state): State<AppState>) -> Json<serde_json::Value> {
    let base = state.origin.as_str();
    let authority = &state.config.authority;

    let mut scopes: BTreeSet<&str> = BTreeSet::from(["openid"]);
    let mut response_types: BTreeSet<String> = BTreeSet::new();
    for client in &state.config.clients {
        scopes.extend(client.allowed_scopes.iter().map(String::as_str));
        response_types.extend(
            client
                .allowed_response_types
                .iter()
                .map(|rt| authority::normalize_response_type(rt)),
        );
    }

    Json(serde_json::json!({
        "issuer": state.issuer,
        "authorization_endpoint": format!("{base}{}", authority.authorize_path),
        "end_session_endpoint": format!("{base}{}", authority.end_session_path),
        "response_types_supported": response_types,
        "response_modes_supported": ["query", "fragment"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["none"],
        "scopes_supported": scopes,
        "claims_supported": ["sub", "name", "sid", "auth_time", "idp"],
        "code_challenge_methods_supported": ["plain", "S256"],
        "frontchannel_logout_supported": false,
        "backchannel_logout_supported": state.config.backchannel.logout_notifications,
        "backchannel_logout_session_supported": state.config.backchannel.logout_notifications,
    }))
}

async fn page(
    kind: PageKind,
    state: AppState,
    uri: Uri,
    jar: CookieJar,
) -> Result<Response, Error> {
    let handler = state.pages.get(kind)?;
    let mut ctx = PageContext::new(kind, uri.path(), uri.query(), &state, jar);
    match handler.handle(&mut ctx).await {
        Ok(()) => Ok(ctx.into_response()),
        Err(err) => Ok(ctx.into_error_response(err)),
    }
}

/// Build the application router. Page routes come from `config`.
pub fn router(config: &Config) -> Router<AppState> {
    let authority = &config.authority;
    let mut router = Router::new()
        .route("/.well-known/openid-configuration", get(openid_configuration))
        .route(&authority.authorize_path, get(authority::authorize))
        .route(&authority.authorize_callback_path, get(authority::authorize))
        .route(&authority.end_session_path, get(authority::end_session));

    for kind in PageKind::ALL {
        router = router.route(
            kind.path(config),
            any(move |State(state): State<AppState>, uri: Uri, jar: CookieJar| {
                page(kind, state, uri, jar)
            }),
        );
    }
    router
}
