//! Outbound HTTP calls made by the authority mid-flow.
//!
//! Everything the authority sends over the back channel goes through an
//! [`OutboundHandler`]. Production wiring uses [`ReqwestHandler`]; tests plug
//! in a [`BackChannelMessageHandler`] to watch or shape those calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::token;

pub const BACKCHANNEL_LOGOUT_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    pub fn form_post(url: impl Into<String>, pairs: &[(&str, &str)]) -> Self {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        Self {
            method: Method::POST,
            url: url.into(),
            headers,
            body: Bytes::from(body),
        }
    }

    /// Decode a form-urlencoded body into pairs.
    pub fn form(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(&self.body).into_owned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Default for OutboundResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

#[async_trait]
pub trait OutboundHandler: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse>;
}

/// Real network transport.
pub struct ReqwestHandler {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestHandler {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl OutboundHandler for ReqwestHandler {
    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse> {
        let resp = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| Error::Http(e.to_string()))?;
        Ok(OutboundResponse { status, headers, body })
    }
}

pub type OnInvoke = dyn Fn(OutboundRequest) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Interceptor standing in for the network.
///
/// Records each request, awaits the observer (an observer error fails the
/// outbound call), then answers with the canned response.
#[derive(Default)]
pub struct BackChannelMessageHandler {
    on_invoke: RwLock<Option<Arc<OnInvoke>>>,
    response: RwLock<OutboundResponse>,
    captured: Mutex<Vec<OutboundRequest>>,
}

impl BackChannelMessageHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_invoke<F>(&self, observer: F)
    where
        F: Fn(OutboundRequest) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.on_invoke.write() {
            *slot = Some(Arc::new(observer));
        }
    }

    pub fn clear_on_invoke(&self) {
        if let Ok(mut slot) = self.on_invoke.write() {
            *slot = None;
        }
    }

    pub fn set_response(&self, response: OutboundResponse) {
        if let Ok(mut slot) = self.response.write() {
            *slot = response;
        }
    }

    /// Requests seen so far, oldest first.
    pub fn captured(&self) -> Vec<OutboundRequest> {
        self.captured.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn clear_captured(&self) {
        if let Ok(mut c) = self.captured.lock() {
            c.clear();
        }
    }
}

#[async_trait]
impl OutboundHandler for BackChannelMessageHandler {
    async fn send(&self, request: OutboundRequest) -> Result<OutboundResponse> {
        if let Ok(mut c) = self.captured.lock() {
            c.push(request.clone());
        }

        let observer = self.on_invoke.read().ok().and_then(|slot| slot.clone());
        if let Some(observer) = observer {
            observer(request).await?;
        }

        self.response
            .read()
            .map(|r| r.clone())
            .map_err(|_| Error::Internal(anyhow::anyhow!("canned response lock poisoned")))
    }
}

/// Sends OIDC back-channel logout notifications when a session ends.
pub struct BackChannelLogoutNotifier {
    handler: Arc<dyn OutboundHandler>,
    issuer: String,
    endpoints: HashMap<String, String>,
}

impl BackChannelLogoutNotifier {
    pub fn new(handler: Arc<dyn OutboundHandler>, issuer: impl Into<String>, clients: &[ClientConfig]) -> Self {
        let endpoints = clients
            .iter()
            .filter_map(|c| {
                c.backchannel_logout_uri
                    .as_ref()
                    .map(|uri| (c.client_id.clone(), uri.clone()))
            })
            .collect();
        Self {
            handler,
            issuer: issuer.into(),
            endpoints,
        }
    }

    pub fn logout_token(&self, session: &Session, client_id: &str) -> String {
        let claims = serde_json::json!({
            "iss": self.issuer,
            "aud": client_id,
            "iat": chrono::Utc::now().timestamp(),
            "jti": token::random_handle(),
            "sub": session.subject_id,
            "sid": session.session_id,
            "events": { BACKCHANNEL_LOGOUT_EVENT: {} },
        });
        token::unsigned_jwt("logout+jwt", &claims)
    }

    /// Notify every client of the session that registered an endpoint.
    /// Returns how many notifications were sent.
    pub async fn notify(&self, session: &Session) -> Result<usize> {
        let mut sent = 0;
        for client_id in &session.clients {
            let Some(uri) = self.endpoints.get(client_id) else { continue };
            let logout_token = self.logout_token(session, client_id);
            let request = OutboundRequest::form_post(uri, &[("logout_token", logout_token.as_str())]);

            let resp = self.handler.send(request).await.map_err(|e| match e {
                Error::Http(msg) => Error::Outbound(msg),
                other => other,
            })?;
            if resp.status.is_success() {
                info!(client_id = %client_id, sid = %session.session_id, "back-channel logout delivered");
            } else {
                warn!(
                    client_id = %client_id,
                    status = resp.status.as_u16(),
                    "back-channel logout rejected by client"
                );
            }
            sent += 1;
        }
        Ok(sent)
    }
}
