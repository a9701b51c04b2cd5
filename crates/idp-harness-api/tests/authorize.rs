mod common;
use common::*;

use axum::Router;
use axum::routing::get;

#[tokio::test]
async fn code_flow_redirects_to_login_then_issues_code() {
    let p = pipeline();
    let params = code_request("abc123");

    let first = p.request_authorization_endpoint(&params).await.unwrap().unwrap();
    assert!(
        first.raw.starts_with(&p.login_page()),
        "unauthenticated request should go to login, got {}",
        first.raw
    );
    assert!(first.code.is_none());

    p.login_as_subject("bob").await.unwrap();

    let resp = p.request_authorization_endpoint(&params).await.unwrap().unwrap();
    assert!(resp.raw.starts_with(CLIENT1_CALLBACK));
    assert_eq!(resp.location, ResponseLocation::Query);
    assert!(resp.code.is_some());
    assert_eq!(resp.state.as_deref(), Some("abc123"));
    assert!(!resp.is_error());

    let session_state = resp.session_state.unwrap();
    let (hash, salt) = session_state.split_once('.').unwrap();
    assert_eq!(hash.len(), 64);
    assert!(!salt.is_empty());
}

#[tokio::test]
async fn login_return_url_resumes_the_authorize_request() {
    let p = pipeline();
    p.set_subject(Some(Principal::new("bob", "Bob Loblaw"))).unwrap();

    let resp = run_flow(&p, &code_request("resume")).await;
    assert!(resp.code.is_some());
    assert_eq!(resp.state.as_deref(), Some("resume"));

    let log = p.call_log().unwrap();
    assert!(log.login_was_called);
    let login_request = log.login_request.unwrap();
    assert_eq!(login_request.client_id, "client1");
    assert_eq!(login_request.redirect_uri.as_deref(), Some(CLIENT1_CALLBACK));
    assert_eq!(login_request.state.as_deref(), Some("resume"));
    assert!(p.session_cookie().is_some());
}

#[tokio::test]
async fn login_page_without_subject_leaves_flow_waiting() {
    let p = pipeline();

    let url = p.create_authorize_url(&code_request("waiting"));
    let resp = p.browser().get(&url).await.unwrap();
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.url.path(), "/account/login");

    let log = p.call_log().unwrap();
    assert!(log.login_was_called);
    assert_eq!(log.login_request.unwrap().state.as_deref(), Some("waiting"));
    assert!(p.session_cookie().is_none());
}

#[tokio::test]
async fn state_survives_the_round_trip() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();

    for state in ["abc123", "with space", "a+b=c&d", "üñí©ødé", "x".repeat(300).as_str()] {
        let resp = p
            .request_authorization_endpoint(&code_request(state))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.state.as_deref(), Some(state));
    }
}

#[tokio::test]
async fn implicit_responses_use_the_fragment() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();

    let params = AuthorizeParameters::new("client3", "id_token token")
        .scope("openid profile api1")
        .redirect_uri(CLIENT3_CALLBACK)
        .state("frag")
        .nonce("n-0S6_WzA2Mj");
    let resp = p.request_authorization_endpoint(&params).await.unwrap().unwrap();

    assert_eq!(resp.location, ResponseLocation::Fragment);
    assert_eq!(resp.token_type.as_deref(), Some("Bearer"));
    assert_eq!(resp.expires_in, Some(3600));
    assert_eq!(resp.scope.as_deref(), Some("openid profile api1"));
    assert!(resp.access_token.is_some());
    assert!(resp.code.is_none());

    let claims = token::decode_claims(resp.id_token.as_deref().unwrap()).unwrap();
    assert_eq!(claims["sub"], "bob");
    assert_eq!(claims["aud"], "client3");
    assert_eq!(claims["iss"], "https://server");
    assert_eq!(claims["nonce"], "n-0S6_WzA2Mj");
    assert_eq!(claims["name"], "Bob Loblaw");
    assert_eq!(claims["email"], "bob@loblaw.com");
    assert_eq!(claims["sid"], p.session_cookie().unwrap().as_str());
}

#[tokio::test]
async fn response_mode_overrides_default_location() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();

    let params = code_request("frag").response_mode("fragment");
    let resp = p.request_authorization_endpoint(&params).await.unwrap().unwrap();
    assert_eq!(resp.location, ResponseLocation::Fragment);
    assert!(resp.code.is_some());
}

#[tokio::test]
async fn prompt_none_without_session_returns_login_required() {
    let p = pipeline();
    let params = code_request("silent").extra("prompt", "none");
    let resp = p.request_authorization_endpoint(&params).await.unwrap().unwrap();
    assert!(resp.raw.starts_with(CLIENT1_CALLBACK));
    assert_eq!(resp.error.as_deref(), Some("login_required"));
    assert_eq!(resp.state.as_deref(), Some("silent"));
}

#[tokio::test]
async fn prompt_login_forces_the_login_page() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();

    let params = code_request("again").extra("prompt", "login");
    let resp = p.request_authorization_endpoint(&params).await.unwrap().unwrap();
    assert!(resp.raw.starts_with(&p.login_page()));
    let return_url = resp.extra.get("returnUrl").unwrap();
    assert!(return_url.starts_with("/connect/authorize/callback?"));
    assert!(!return_url.contains("prompt"));
}

#[tokio::test]
async fn unknown_client_goes_to_error_page() {
    let p = pipeline();
    let params = AuthorizeParameters::new("nope", "code").redirect_uri(CLIENT1_CALLBACK);

    let resp = p.request_authorization_endpoint(&params).await.unwrap();
    assert!(resp.is_none());

    let log = p.call_log().unwrap();
    assert!(log.error_was_called);
    let error = log.error_message.unwrap();
    assert_eq!(error.error, "unauthorized_client");
    assert_eq!(error.client_id.as_deref(), Some("nope"));
    assert!(error.request_id.is_some());
}

#[tokio::test]
async fn invalid_requests_are_reported_on_the_error_page() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();

    let cases = [
        (
            AuthorizeParameters::new("client1", "code").redirect_uri("https://evil/callback"),
            "invalid_request",
        ),
        (code_request("s").scope("openid email"), "invalid_scope"),
        (
            AuthorizeParameters::new("client1", "token")
                .scope("openid")
                .redirect_uri(CLIENT1_CALLBACK),
            "unsupported_response_type",
        ),
        (
            AuthorizeParameters::new("client2", "code")
                .scope("openid")
                .redirect_uri(CLIENT2_CALLBACK),
            "invalid_request",
        ),
    ];

    for (params, expected) in cases {
        p.reset_call_log().unwrap();
        assert!(p.request_authorization_endpoint(&params).await.unwrap().is_none());
        let log = p.call_log().unwrap();
        assert!(log.error_was_called);
        assert_eq!(log.error_message.unwrap().error, expected);
    }
}

#[tokio::test]
async fn non_redirect_status_is_an_error_and_restores_redirects() {
    let p = MockIdpPipeline::builder()
        .on_configure(|inner| {
            Router::new()
                .route("/connect/authorize", get(|| async { "down for maintenance" }))
                .fallback_service(inner)
        })
        .build()
        .unwrap();

    assert!(p.browser().allow_auto_redirect());
    let err = p
        .request_authorization_endpoint(&code_request("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnexpectedStatus { expected: 302, actual: 200 }));
    assert!(p.browser().allow_auto_redirect());
}

#[tokio::test]
async fn login_helper_restores_redirect_flag() {
    let p = pipeline();
    p.browser().set_allow_auto_redirect(false);
    p.login_as_subject("alice").await.unwrap();
    assert!(!p.browser().allow_auto_redirect());
    assert!(p.session_cookie().is_some());
}

#[tokio::test]
async fn login_as_unknown_subject_fails() {
    let p = pipeline();
    let err = p.login_as_subject("mallory").await.unwrap_err();
    assert!(matches!(err, Error::UnknownUser(ref s) if s == "mallory"));
}

#[tokio::test]
async fn removing_the_login_cookie_requires_login_again() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();
    p.remove_login_cookie();

    let resp = p
        .request_authorization_endpoint(&code_request("gone"))
        .await
        .unwrap()
        .unwrap();
    assert!(resp.raw.starts_with(&p.login_page()));

    assert!(p.session_cookie().is_some());
    p.remove_session_cookie();
    assert!(p.session_cookie().is_none());
}
