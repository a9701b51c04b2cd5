mod common;
use common::*;

#[tokio::test]
async fn granted_consent_completes_the_flow() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();
    p.set_consent_response(Some(ConsentResult::granted(["openid", "profile"])))
        .unwrap();

    let resp = run_flow(&p, &consent_request("granted")).await;
    assert!(resp.raw.starts_with(CLIENT2_CALLBACK));
    assert!(resp.code.is_some());
    assert_eq!(resp.state.as_deref(), Some("granted"));

    let log = p.call_log().unwrap();
    assert!(log.consent_was_called);
    assert_eq!(log.consent_request.unwrap().client_id, "client2");
}

#[tokio::test]
async fn denied_consent_returns_access_denied() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();
    p.set_consent_response(Some(ConsentResult::denied())).unwrap();

    let resp = run_flow(&p, &consent_request("no")).await;
    assert!(resp.raw.starts_with(CLIENT2_CALLBACK));
    assert_eq!(resp.error.as_deref(), Some("access_denied"));
    assert_eq!(resp.state.as_deref(), Some("no"));
    assert!(resp.code.is_none());
}

#[tokio::test]
async fn consent_with_no_scopes_is_a_denial() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();
    p.set_consent_response(Some(ConsentResult::granted(Vec::<String>::new())))
        .unwrap();

    let resp = run_flow(&p, &consent_request("empty")).await;
    assert_eq!(resp.error.as_deref(), Some("access_denied"));
}

#[tokio::test]
async fn remembered_consent_skips_the_consent_page() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();
    p.set_consent_response(Some(ConsentResult::granted(["openid", "profile"]).remember()))
        .unwrap();
    run_flow(&p, &consent_request("first")).await;
    assert_eq!(
        p.interaction().remembered_scopes("bob", "client2").unwrap(),
        Some(vec!["openid".to_string(), "profile".to_string()])
    );

    p.reset_call_log().unwrap();
    let resp = p
        .request_authorization_endpoint(&consent_request("second"))
        .await
        .unwrap()
        .unwrap();
    assert!(resp.code.is_some());
    assert!(!p.call_log().unwrap().consent_was_called);
}

#[tokio::test]
async fn unremembered_consent_is_asked_again() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();
    p.set_consent_response(Some(ConsentResult::granted(["openid", "profile"])))
        .unwrap();
    run_flow(&p, &consent_request("first")).await;

    let resp = p
        .request_authorization_endpoint(&consent_request("second"))
        .await
        .unwrap()
        .unwrap();
    assert!(resp.raw.starts_with(&p.consent_page()));
}

#[tokio::test]
async fn prompt_none_without_consent_returns_consent_required() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();

    let params = consent_request("silent").extra("prompt", "none");
    let resp = p.request_authorization_endpoint(&params).await.unwrap().unwrap();
    assert_eq!(resp.error.as_deref(), Some("consent_required"));
    assert_eq!(resp.state.as_deref(), Some("silent"));
}

#[tokio::test]
async fn prompt_consent_asks_even_when_not_required() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();

    let params = code_request("ask").extra("prompt", "consent");
    let resp = p.request_authorization_endpoint(&params).await.unwrap().unwrap();
    assert!(resp.raw.starts_with(&p.consent_page()));
}

#[tokio::test]
async fn prompt_consent_denial_reaches_the_client() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();
    p.set_consent_response(Some(ConsentResult::denied())).unwrap();

    let resp = run_flow(&p, &code_request("ask").extra("prompt", "consent")).await;
    assert!(resp.raw.starts_with(CLIENT1_CALLBACK));
    assert_eq!(resp.error.as_deref(), Some("access_denied"));
    assert!(resp.code.is_none());
    assert_eq!(resp.state.as_deref(), Some("ask"));
    assert!(p.call_log().unwrap().consent_was_called);
}

#[tokio::test]
async fn prompt_consent_grant_issues_a_code() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();
    p.set_consent_response(Some(ConsentResult::granted(["openid", "profile"])))
        .unwrap();

    let resp = run_flow(&p, &code_request("yes").extra("prompt", "consent")).await;
    assert!(resp.raw.starts_with(CLIENT1_CALLBACK));
    assert!(resp.code.is_some());
    assert_eq!(resp.state.as_deref(), Some("yes"));
}

#[tokio::test]
async fn consent_narrows_issued_scopes() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();
    p.set_consent_response(Some(ConsentResult::granted(["openid"]).remember()))
        .unwrap();

    run_flow(&p, &consent_request("narrow")).await;
    assert_eq!(
        p.interaction().remembered_scopes("bob", "client2").unwrap(),
        Some(vec!["openid".to_string()])
    );
}
