mod common;
use common::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

#[tokio::test]
async fn principal_is_single_use() {
    let p = pipeline();
    p.set_subject(Some(Principal::new("bob", "Bob Loblaw"))).unwrap();

    p.browser().get(&p.login_page()).await.unwrap();
    let first = p.session_cookie().expect("first login signs in");
    assert!(p.simulator().pending_subject().unwrap().is_none());

    p.browser().get(&p.login_page()).await.unwrap();
    assert_eq!(p.session_cookie().as_deref(), Some(first.as_str()));
    assert_eq!(p.sessions().session(&first).await.unwrap().unwrap().subject_id, "bob");
}

#[tokio::test]
async fn pages_tolerate_missing_ids() {
    let p = pipeline();
    for url in [
        p.login_page(),
        format!("{}?returnUrl=", p.login_page()),
        p.consent_page(),
        format!("{}?returnUrl=", p.consent_page()),
        p.logout_page(),
        format!("{}?logoutId=", p.logout_page()),
        p.error_page(),
        format!("{}?errorId=", p.error_page()),
    ] {
        let resp = p.browser().get(&url).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK, "{url}");
    }

    let log = p.call_log().unwrap();
    assert!(log.login_was_called);
    assert!(log.login_request.is_none());
    assert!(log.consent_was_called);
    assert!(log.consent_request.is_none());
    assert!(log.logout_was_called);
    assert!(log.logout_request.is_none());
    assert!(log.error_was_called);
    assert!(log.error_message.is_none());
}

#[tokio::test]
async fn error_page_with_unknown_id_records_empty_message() {
    let p = pipeline();
    let resp = p
        .browser()
        .get(&format!("{}?errorId=missing", p.error_page()))
        .await
        .unwrap();
    assert_eq!(resp.status, StatusCode::OK);

    let log = p.call_log().unwrap();
    assert!(log.error_was_called);
    assert!(log.error_message.is_none());
}

#[tokio::test]
async fn consent_page_without_answer_makes_no_grant() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();

    let url = p.create_authorize_url(&consent_request("pending"));
    let resp = p.browser().get(&url).await.unwrap();
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.url.path(), "/consent");

    let log = p.call_log().unwrap();
    assert!(log.consent_was_called);
    let request = log.consent_request.unwrap();
    assert_eq!(request.client_id, "client2");
    assert_eq!(request.scopes, vec!["openid", "profile"]);
    assert_eq!(request.state.as_deref(), Some("pending"));
    assert!(p.interaction().grant_history().unwrap().is_empty());
}

#[tokio::test]
async fn consent_answer_is_forwarded_once() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();

    // Park the flow on the consent page to learn its URL.
    let url = p.create_authorize_url(&consent_request("once"));
    let parked = p.browser().get(&url).await.unwrap();
    let consent_url = parked.url.to_string();

    p.set_consent_response(Some(ConsentResult::granted(["openid", "profile"])))
        .unwrap();
    {
        let _guard = p.browser().without_auto_redirect();
        let first = p.browser().get(&consent_url).await.unwrap();
        assert_eq!(first.status, StatusCode::FOUND);
        let second = p.browser().get(&consent_url).await.unwrap();
        assert_eq!(second.status, StatusCode::OK);
    }

    let grants = p.interaction().grant_history().unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].client_id, "client2");
    assert_eq!(grants[0].subject_id.as_deref(), Some("bob"));
    assert!(p.simulator().pending_consent().unwrap().is_none());
}

#[tokio::test]
async fn consent_answer_without_context_is_kept() {
    let p = pipeline();
    p.set_consent_response(Some(ConsentResult::granted(["openid"]))).unwrap();

    p.browser().get(&p.consent_page()).await.unwrap();

    assert!(p.interaction().grant_history().unwrap().is_empty());
    assert!(p.simulator().pending_consent().unwrap().is_some());
}

#[tokio::test]
async fn call_log_can_be_reset() {
    let p = pipeline();
    p.browser().get(&p.error_page()).await.unwrap();
    assert!(p.call_log().unwrap().error_was_called);

    p.reset_call_log().unwrap();
    assert_eq!(p.call_log().unwrap(), CallLog::default());
}

#[tokio::test]
async fn federated_sign_out_clears_cookies() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();
    let sid = p.session_cookie().unwrap();

    let resp = p.browser().get(&p.federated_signout_url()).await.unwrap();
    assert_eq!(resp.status, StatusCode::OK);
    assert!(p.session_cookie().is_none());
    assert!(p.browser().get_cookie("https://server", "idsrv").is_none());
    assert!(p.sessions().session(&sid).await.unwrap().is_none());
}

#[tokio::test]
async fn federated_sign_out_without_session_still_clears_cookies() {
    let p = pipeline();
    p.browser().set_cookie("https://server", "idsrv.session", "stale");

    let resp = p.browser().get(&p.federated_signout_url()).await.unwrap();
    assert_eq!(resp.status, StatusCode::OK);
    assert!(p.session_cookie().is_none());
}

#[tokio::test]
async fn logout_page_is_inert() {
    let p = pipeline();
    p.login_as_subject("bob").await.unwrap();
    let sid = p.session_cookie().unwrap();

    let resp = p
        .browser()
        .get(&format!(
            "{}?client_id=client1&post_logout_redirect_uri={}&state=bye",
            p.end_session_endpoint(),
            "https%3A%2F%2Fclient%2Fsignout-callback"
        ))
        .await
        .unwrap();
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.url.path(), "/account/logout");

    let log = p.call_log().unwrap();
    assert!(log.logout_was_called);
    let logout = log.logout_request.unwrap();
    assert_eq!(logout.client_id.as_deref(), Some("client1"));
    assert_eq!(logout.subject_id.as_deref(), Some("bob"));
    assert_eq!(logout.session_id.as_deref(), Some(sid.as_str()));
    assert_eq!(
        logout.post_logout_redirect_uri.as_deref(),
        Some("https://client/signout-callback?state=bye")
    );
    assert!(!logout.show_signout_prompt);

    assert_eq!(p.session_cookie().as_deref(), Some(sid.as_str()));
}

/// Logout page that really signs out, the way a test would replace the
/// inert default.
struct SigningOutLogout {
    visits: AtomicUsize,
}

#[async_trait]
impl PageHandler for SigningOutLogout {
    async fn handle(&self, ctx: &mut PageContext) -> idp_harness_core::error::Result<()> {
        self.visits.fetch_add(1, Ordering::SeqCst);
        let logout_id = ctx.query("logoutId").map(str::to_string);
        let logout = ctx.interaction.logout_context(logout_id.as_deref()).await?;
        ctx.sign_out().await?;
        if let Some(uri) = logout.and_then(|l| l.post_logout_redirect_uri) {
            ctx.redirect(uri);
        }
        Ok(())
    }
}

#[tokio::test]
async fn page_handlers_can_be_replaced() {
    let p = pipeline();
    let page = Arc::new(SigningOutLogout {
        visits: AtomicUsize::new(0),
    });
    p.set_page(PageKind::Logout, page.clone()).unwrap();
    p.login_as_subject("bob").await.unwrap();

    let resp = p
        .browser()
        .get(&format!(
            "{}?client_id=client1&post_logout_redirect_uri={}",
            p.end_session_endpoint(),
            "https%3A%2F%2Fclient%2Fsignout-callback"
        ))
        .await
        .unwrap();

    assert_eq!(resp.status, StatusCode::FOUND);
    assert_eq!(
        resp.location().unwrap().as_str(),
        "https://client/signout-callback"
    );
    assert_eq!(page.visits.load(Ordering::SeqCst), 1);
    assert!(p.session_cookie().is_none());
    assert!(!p.call_log().unwrap().logout_was_called);
}

#[tokio::test]
async fn builder_page_overrides_apply() {
    struct Silent;

    #[async_trait]
    impl PageHandler for Silent {
        async fn handle(&self, _ctx: &mut PageContext) -> idp_harness_core::error::Result<()> {
            Ok(())
        }
    }

    let p = MockIdpPipeline::builder()
        .page(PageKind::Error, Arc::new(Silent))
        .build()
        .unwrap();
    p.browser().get(&p.error_page()).await.unwrap();
    assert!(!p.call_log().unwrap().error_was_called);
}

#[tokio::test]
async fn configured_paths_and_parameters_are_honored() {
    let p = MockIdpPipeline::builder()
        .on_configure_services(|config| {
            config.user_interaction.login_url = "/signin".to_string();
            config.user_interaction.login_return_url_parameter = "next".to_string();
        })
        .build()
        .unwrap();
    p.set_subject(Some(Principal::new("alice", "alice"))).unwrap();

    let resp = run_flow(&p, &code_request("custom")).await;
    assert!(resp.code.is_some());
    // The redirect follows the configured parameter; the context only ever
    // resolves from `returnUrl`.
    let log = p.call_log().unwrap();
    assert!(log.login_was_called);
    assert!(log.login_request.is_none());
    assert_eq!(p.login_page(), "https://server/signin");
}
