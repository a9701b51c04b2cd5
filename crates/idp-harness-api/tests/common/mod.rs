//! Shared test infrastructure for the harness integration tests.
//!
//! Every test builds its own [`MockIdpPipeline`]; nothing is shared between
//! tests, so they run in parallel.

pub use axum::http::StatusCode;
pub use idp_harness_api::pages::{PageContext, PageHandler, PageKind};
pub use idp_harness_api::simulator::CallLog;
pub use idp_harness_api::{MockIdpPipeline, PipelineBuilder};
pub use idp_harness_core::authorize::{AuthorizeParameters, AuthorizeResponse, ResponseLocation};
pub use idp_harness_core::config::Config;
pub use idp_harness_core::error::Error;
pub use idp_harness_core::interaction::{ConsentResult, InteractionService, Principal};
pub use idp_harness_core::session::SessionSink;
pub use idp_harness_core::token;
pub use serde_json;

pub const CLIENT1_CALLBACK: &str = "https://client/callback";
pub const CLIENT2_CALLBACK: &str = "https://client2/callback";
pub const CLIENT3_CALLBACK: &str = "https://client3/callback";

pub fn pipeline() -> MockIdpPipeline {
    MockIdpPipeline::new().expect("default pipeline must build")
}

/// Plain code-flow request for `client1`.
pub fn code_request(state: &str) -> AuthorizeParameters {
    AuthorizeParameters::new("client1", "code")
        .scope("openid")
        .redirect_uri(CLIENT1_CALLBACK)
        .state(state)
}

/// Code-flow request for `client2`, which requires consent and PKCE.
pub fn consent_request(state: &str) -> AuthorizeParameters {
    let (_verifier, challenge) = idp_harness_core::authorize::generate_pkce();
    AuthorizeParameters::new("client2", "code")
        .scope("openid profile")
        .redirect_uri(CLIENT2_CALLBACK)
        .state(state)
        .code_challenge(challenge, "S256")
}

/// Drive the full browser flow for `params`, following same-origin
/// redirects, and parse the redirect that leaves the server.
pub async fn run_flow(p: &MockIdpPipeline, params: &AuthorizeParameters) -> AuthorizeResponse {
    let url = p.create_authorize_url(params);
    let resp = p.browser().get(&url).await.expect("authorize request failed");
    assert_eq!(resp.status, StatusCode::FOUND, "flow must end on a redirect to the client");
    let location = resp.location().expect("redirect without location");
    AuthorizeResponse::parse(location.as_str()).expect("client redirect must parse")
}
