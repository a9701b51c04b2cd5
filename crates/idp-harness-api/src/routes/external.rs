use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;

use idp_harness_core::error::Error;
use idp_harness_core::external::AuthenticationHandler;

use crate::pages::clear_session_cookies;
use crate::server::AppState;

/// Lets the external identity bridge answer requests before the router.
///
/// A request the bridge handles ends here with an empty 200 and both
/// session cookies cleared.
pub async fn external_bridge(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let Some(bridge) = state.bridge.clone() else {
        return Ok(next.run(request).await);
    };

    let path = request.uri().path().to_string();
    let session_id = jar
        .get(&state.cookie_names.authentication)
        .map(|c| c.value().to_string());
    match bridge.handle_request(&path, session_id.as_deref()).await {
        Ok(true) => {
            let jar = clear_session_cookies(jar, &state.cookie_names);
            return Ok((jar, StatusCode::OK).into_response());
        }
        Ok(false) => {}
        // The bridge only fails while signing out; the session is gone either way.
        Err(err) => {
            let jar = clear_session_cookies(jar, &state.cookie_names);
            return Ok((jar, err).into_response());
        }
    }

    Ok(next.run(request).await)
}
