use std::collections::{BTreeSet, HashMap};

use axum::extract::{Query, State};
use axum::http::Uri;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use chrono::Utc;
use tracing::{debug, info};
use url::form_urlencoded;

use idp_harness_core::config::ClientConfig;
use idp_harness_core::error::Result;
use idp_harness_core::interaction::{AuthorizationContext, ErrorContext, LogoutContext};
use idp_harness_core::session::{Session, session_state};
use idp_harness_core::token;

use crate::pages::found;
use crate::server::AppState;

/// Response type words in canonical (sorted) order, e.g. `"id_token token"`.
pub fn normalize_response_type(response_type: &str) -> String {
    let words: BTreeSet<&str> = response_type.split_whitespace().collect();
    words.into_iter().collect::<Vec<_>>().join(" ")
}

/// A validated authorize request.
struct Validated<'a> {
    request: AuthorizationContext,
    client: &'a ClientConfig,
    redirect_uri: String,
    response_types: BTreeSet<String>,
    response_mode: ResponseMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseMode {
    Query,
    Fragment,
}

impl ResponseMode {
    fn as_str(self) -> &'static str {
        match self {
            ResponseMode::Query => "query",
            ResponseMode::Fragment => "fragment",
        }
    }
}

/// GET /connect/authorize and /connect/authorize/callback
pub async fn authorize(
    State(state): State<AppState>,
    uri: Uri,
    jar: CookieJar,
) -> Result<Response> {
    let query = uri.query().unwrap_or_default();
    let validated = match validate(&state, query) {
        Ok(v) => v,
        Err(ctx) => return show_error(&state, ctx),
    };
    let request = &validated.request;
    let prompt = request.prompt.as_deref();

    let session = match jar.get(&state.cookie_names.authentication) {
        Some(cookie) => state.sessions.session(cookie.value()).await?,
        None => None,
    };

    let session = match session {
        Some(session) if prompt != Some("login") => session,
        _ if prompt == Some("none") => {
            return Ok(to_client(&validated, error_params("login_required", None)));
        }
        _ => {
            let return_url = callback_url(&state, query);
            let param = &state.config.user_interaction.login_return_url_parameter;
            debug!(client_id = %request.client_id, "authentication required");
            return Ok(page_redirect(&state.config.user_interaction.login_url, param, &return_url));
        }
    };

    let mut scopes = request.scopes.clone();
    // A consent page answer for this exact request wins, even once `prompt`
    // has been dropped from the callback query.
    match state.interaction.take_consent(&request.correlation_id)? {
        Some(grant) if grant.result.denied || grant.result.scopes_consented.is_empty() => {
            info!(client_id = %request.client_id, "consent denied");
            return Ok(to_client(&validated, error_params("access_denied", None)));
        }
        Some(grant) => {
            scopes.retain(|s| grant.result.scopes_consented.contains(s));
            if grant.result.remember_consent && validated.client.allow_remember_consent {
                state
                    .interaction
                    .remember_consent(&session.subject_id, &request.client_id, &scopes)?;
            }
        }
        None => {
            let needs_consent = validated.client.require_consent || prompt == Some("consent");
            let remembered = state
                .interaction
                .remembered_scopes(&session.subject_id, &request.client_id)?
                .unwrap_or_default();
            let covered = prompt != Some("consent")
                && !remembered.is_empty()
                && scopes.iter().all(|s| remembered.contains(s));

            if needs_consent && !covered {
                if prompt == Some("none") {
                    return Ok(to_client(&validated, error_params("consent_required", None)));
                }
                let return_url = callback_url(&state, query);
                let param = &state.config.user_interaction.consent_return_url_parameter;
                debug!(client_id = %request.client_id, "consent required");
                return Ok(page_redirect(
                    &state.config.user_interaction.consent_url,
                    param,
                    &return_url,
                ));
            }
        }
    }

    state
        .sessions
        .add_client(&session.session_id, &request.client_id)
        .await?;
    let params = issue(&state, &validated, &session, &scopes);
    info!(
        client_id = %request.client_id,
        sub = %session.subject_id,
        response_type = %validated.response_types.iter().cloned().collect::<Vec<_>>().join(" "),
        "authorize response issued"
    );
    Ok(to_client(&validated, params))
}

fn validate<'a>(state: &'a AppState, query: &str) -> std::result::Result<Validated<'a>, ErrorContext> {
    let Some(request) = AuthorizationContext::from_query(query) else {
        return Err(error_context("invalid_request", "client_id is required", None));
    };
    let Some(client) = state.config.find_client(&request.client_id) else {
        return Err(error_context("unauthorized_client", "unknown client", Some(&request)));
    };

    let redirect_uri = match &request.redirect_uri {
        Some(uri) if client.redirect_uris.contains(uri) => uri.clone(),
        _ => return Err(error_context("invalid_request", "invalid redirect_uri", Some(&request))),
    };

    let fail = |error: &str, description: &str| {
        let mut ctx = error_context(error, description, Some(&request));
        ctx.redirect_uri = Some(redirect_uri.clone());
        ctx
    };

    let response_type = normalize_response_type(request.response_type.as_deref().unwrap_or_default());
    let supported = client
        .allowed_response_types
        .iter()
        .any(|rt| normalize_response_type(rt) == response_type);
    if response_type.is_empty() || !supported {
        return Err(fail("unsupported_response_type", "response_type not allowed for this client"));
    }
    let response_types: BTreeSet<String> =
        response_type.split(' ').map(String::from).collect();

    let response_mode = match request.response_mode.as_deref() {
        Some("query") => ResponseMode::Query,
        Some("fragment") => ResponseMode::Fragment,
        Some(_) => return Err(fail("invalid_request", "unsupported response_mode")),
        None if response_type == "code" => ResponseMode::Query,
        None => ResponseMode::Fragment,
    };

    for scope in &request.scopes {
        if !client.allowed_scopes.contains(scope) {
            return Err(fail("invalid_scope", &format!("scope not allowed for this client: {scope}")));
        }
    }
    if response_types.contains("id_token") && !request.scopes.iter().any(|s| s == "openid") {
        return Err(fail("invalid_scope", "openid scope is required for id_token"));
    }
    if response_types.contains("id_token") && request.nonce.is_none() {
        return Err(fail("invalid_request", "nonce is required for id_token"));
    }

    if client.require_pkce && response_types.contains("code") && request.code_challenge.is_none() {
        return Err(fail("invalid_request", "code_challenge is required"));
    }
    match request.code_challenge_method.as_deref() {
        None | Some("plain") | Some("S256") => {}
        Some(_) => return Err(fail("invalid_request", "unsupported code_challenge_method")),
    }

    Ok(Validated {
        request,
        client,
        redirect_uri,
        response_types,
        response_mode,
    })
}

fn error_context(error: &str, description: &str, request: Option<&AuthorizationContext>) -> ErrorContext {
    ErrorContext {
        error: error.to_string(),
        error_description: Some(description.to_string()),
        request_id: None,
        client_id: request.map(|r| r.client_id.clone()),
        redirect_uri: None,
        response_mode: request.and_then(|r| r.response_mode.clone()),
    }
}

fn show_error(state: &AppState, mut ctx: ErrorContext) -> Result<Response> {
    ctx.request_id = Some(uuid::Uuid::new_v4().to_string());
    info!(error = %ctx.error, client_id = ?ctx.client_id, "authorize request rejected");
    let error_id = state.interaction.store_error(ctx)?;
    let location = format!("{}?errorId={error_id}", state.config.user_interaction.error_url);
    Ok(found(location).into_response())
}

/// Local return URL re-entering the authorize pipeline, `prompt` dropped.
fn callback_url(state: &AppState, query: &str) -> String {
    let query: String = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(form_urlencoded::parse(query.as_bytes()).filter(|(k, _)| k != "prompt"))
        .finish();
    format!("{}?{query}", state.config.authority.authorize_callback_path)
}

fn page_redirect(page: &str, param: &str, return_url: &str) -> Response {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair(param, return_url)
        .finish();
    found(format!("{page}?{query}")).into_response()
}

fn error_params(error: &str, description: Option<&str>) -> Vec<(String, String)> {
    let mut params = vec![("error".to_string(), error.to_string())];
    if let Some(description) = description {
        params.push(("error_description".to_string(), description.to_string()));
    }
    params
}

fn issue(
    state: &AppState,
    validated: &Validated<'_>,
    session: &Session,
    scopes: &[String],
) -> Vec<(String, String)> {
    let request = &validated.request;
    let types = &validated.response_types;
    let mut params = Vec::new();

    if types.contains("code") {
        params.push(("code".to_string(), token::random_handle()));
    }
    if types.contains("id_token") {
        params.push(("id_token".to_string(), id_token(state, request, session)));
    }
    if types.contains("token") {
        params.push(("access_token".to_string(), token::random_handle()));
        params.push(("token_type".to_string(), "Bearer".to_string()));
        params.push((
            "expires_in".to_string(),
            state.config.authority.access_token_ttl_secs.to_string(),
        ));
        params.push(("scope".to_string(), scopes.join(" ")));
    }
    params.push((
        "session_state".to_string(),
        session_state(&request.client_id, &validated.redirect_uri, &session.session_id),
    ));
    params
}

fn id_token(state: &AppState, request: &AuthorizationContext, session: &Session) -> String {
    let now = Utc::now().timestamp();
    let mut claims = serde_json::json!({
        "iss": state.issuer,
        "aud": request.client_id,
        "sub": session.subject_id,
        "iat": now,
        "nbf": now,
        "exp": now + 300,
        "auth_time": session.auth_time.timestamp(),
        "idp": session.identity_provider,
        "sid": session.session_id,
        "name": session.name,
    });
    if let Some(object) = claims.as_object_mut() {
        if let Some(nonce) = &request.nonce {
            object.insert("nonce".to_string(), nonce.clone().into());
        }
        for (kind, value) in &session.claims {
            object
                .entry(kind.clone())
                .or_insert_with(|| value.clone().into());
        }
    }
    token::unsigned_jwt("JWT", &claims)
}

/// Redirect to the client with `params`, plus `state` when the request had one.
fn to_client(validated: &Validated<'_>, mut params: Vec<(String, String)>) -> Response {
    if let Some(state) = &validated.request.state {
        params.push(("state".to_string(), state.clone()));
    }
    let encoded = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish();

    let uri = &validated.redirect_uri;
    let location = match validated.response_mode {
        ResponseMode::Fragment => format!("{uri}#{encoded}"),
        ResponseMode::Query if uri.contains('?') => format!("{uri}&{encoded}"),
        ResponseMode::Query => format!("{uri}?{encoded}"),
    };
    debug!(mode = validated.response_mode.as_str(), "redirecting to client");
    found(location).into_response()
}

/// GET /connect/endsession
pub async fn end_session(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    jar: CookieJar,
) -> Result<Response> {
    let session = match jar.get(&state.cookie_names.authentication) {
        Some(cookie) => state.sessions.session(cookie.value()).await?,
        None => None,
    };

    let hinted_client = params
        .get("id_token_hint")
        .and_then(|hint| token::decode_claims(hint))
        .and_then(|claims| claims.get("aud").and_then(|aud| aud.as_str()).map(String::from));
    let client_id = params.get("client_id").cloned().or(hinted_client);
    let client = client_id.as_deref().and_then(|id| state.config.find_client(id));

    let post_logout_redirect_uri = match (client, params.get("post_logout_redirect_uri")) {
        (Some(client), Some(uri)) if client.post_logout_redirect_uris.contains(uri) => {
            Some(match params.get("state") {
                Some(s) => {
                    let separator = if uri.contains('?') { '&' } else { '?' };
                    let state_pair = form_urlencoded::Serializer::new(String::new())
                        .append_pair("state", s)
                        .finish();
                    format!("{uri}{separator}{state_pair}")
                }
                None => uri.clone(),
            })
        }
        (_, Some(uri)) => {
            debug!(uri = %uri, "ignoring unregistered post_logout_redirect_uri");
            None
        }
        _ => None,
    };

    let ctx = LogoutContext {
        logout_id: String::new(),
        client_id: client.map(|c| c.client_id.clone()),
        subject_id: session.as_ref().map(|s| s.subject_id.clone()),
        session_id: session.as_ref().map(|s| s.session_id.clone()),
        post_logout_redirect_uri,
        show_signout_prompt: client.is_none(),
    };
    let logout_id = state.interaction.store_logout(ctx)?;
    info!(logout_id = %logout_id, "end-session request");

    let location = format!("{}?logoutId={logout_id}", state.config.user_interaction.logout_url);
    Ok(found(location).into_response())
}
