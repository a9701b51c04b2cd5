//! In-process virtual browser.
//!
//! Drives the router through `tower::ServiceExt::oneshot`, so no sockets are
//! involved. Keeps one cookie jar per origin and follows same-origin
//! redirects while auto-redirect is on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header};
use bytes::Bytes;
use cookie::Cookie;
use tower::ServiceExt;
use tracing::debug;
use url::Url;

use idp_harness_core::error::{Error, Result};

pub const MAX_REDIRECTS: usize = 20;

#[derive(Debug, Clone)]
pub struct BrowserResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// URL that produced this response (after any followed redirects).
    pub url: Url,
}

impl BrowserResponse {
    /// `Location` resolved against the request URL.
    pub fn location(&self) -> Option<Url> {
        let raw = self.headers.get(header::LOCATION)?.to_str().ok()?;
        self.url.join(raw).ok()
    }

    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection()
    }
}

pub struct BrowserClient {
    router: Router,
    origin: String,
    jars: Mutex<HashMap<String, BTreeMap<String, String>>>,
    allow_auto_redirect: AtomicBool,
}

impl BrowserClient {
    /// A browser whose requests to `origin` are served by `router`.
    pub fn new(router: Router, origin: impl Into<String>) -> Self {
        Self {
            router,
            origin: origin.into().trim_end_matches('/').to_string(),
            jars: Mutex::new(HashMap::new()),
            allow_auto_redirect: AtomicBool::new(true),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn allow_auto_redirect(&self) -> bool {
        self.allow_auto_redirect.load(Ordering::SeqCst)
    }

    pub fn set_allow_auto_redirect(&self, allow: bool) {
        self.allow_auto_redirect.store(allow, Ordering::SeqCst);
    }

    /// Turn auto-redirect off until the guard drops, then restore it.
    pub fn without_auto_redirect(&self) -> AutoRedirectGuard<'_> {
        AutoRedirectGuard::new(self, false)
    }

    pub async fn get(&self, url: &str) -> Result<BrowserResponse> {
        self.send(Method::GET, url, None).await
    }

    /// POST an `application/x-www-form-urlencoded` body.
    pub async fn post_form(&self, url: &str, pairs: &[(&str, &str)]) -> Result<BrowserResponse> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        self.send(Method::POST, url, Some(Bytes::from(body))).await
    }

    pub async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
    ) -> Result<BrowserResponse> {
        let mut url = self.resolve(url)?;
        let mut method = method;
        let mut body = body;
        let mut hops = 0;

        loop {
            let response = self.dispatch(method.clone(), &url, body.take()).await?;
            if !response.is_redirect() || !self.allow_auto_redirect() {
                return Ok(response);
            }
            let Some(next) = response.location() else {
                return Ok(response);
            };
            if origin_of(&next) != self.origin {
                debug!(location = %next, "leaving cross-origin redirect unfollowed");
                return Ok(response);
            }
            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(Error::Http(format!("too many redirects (last: {next})")));
            }
            // 307/308 keep the method; everything else becomes a GET.
            if !matches!(
                response.status,
                StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
            ) {
                method = Method::GET;
            }
            url = next;
        }
    }

    fn resolve(&self, url: &str) -> Result<Url> {
        let base = Url::parse(&format!("{}/", self.origin))
            .map_err(|e| Error::InvalidUrl(format!("{}: {e}", self.origin)))?;
        base.join(url)
            .map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))
    }

    async fn dispatch(&self, method: Method, url: &Url, body: Option<Bytes>) -> Result<BrowserResponse> {
        let origin = origin_of(url);
        if origin != self.origin {
            return Err(Error::Http(format!("no server for origin {origin}")));
        }

        let path_and_query = match url.query() {
            Some(q) => format!("{}?{q}", url.path()),
            None => url.path().to_string(),
        };
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(path_and_query)
            .header(header::HOST, url.host_str().unwrap_or_default());
        if let Some(cookies) = self.cookie_header(&origin)? {
            builder = builder.header(header::COOKIE, cookies);
        }
        let request = match body {
            Some(bytes) => builder
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(bytes)),
            None => builder.body(Body::empty()),
        }
        .map_err(|e| Error::Http(e.to_string()))?;

        let response = match self.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };
        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        self.store_cookies(&origin, &parts.headers)?;
        debug!(%method, %url, status = parts.status.as_u16(), "browser request");

        Ok(BrowserResponse {
            status: parts.status,
            headers: parts.headers,
            body,
            url: url.clone(),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, String>>>> {
        self.jars
            .lock()
            .map_err(|_| Error::Internal(anyhow::anyhow!("cookie jar lock poisoned")))
    }

    fn cookie_header(&self, origin: &str) -> Result<Option<HeaderValue>> {
        let jars = self.lock()?;
        let Some(jar) = jars.get(origin).filter(|jar| !jar.is_empty()) else {
            return Ok(None);
        };
        let header = jar
            .iter()
            .map(|(name, value)| Cookie::new(name.as_str(), value.as_str()).encoded().to_string())
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&header)
            .map(Some)
            .map_err(|e| Error::Http(format!("invalid cookie header: {e}")))
    }

    fn store_cookies(&self, origin: &str, headers: &HeaderMap) -> Result<()> {
        let mut jars = self.lock()?;
        let jar = jars.entry(origin.to_string()).or_default();
        for value in headers.get_all(header::SET_COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            let Ok(cookie) = Cookie::parse_encoded(raw) else { continue };
            let removal = cookie.value().is_empty()
                || cookie
                    .max_age()
                    .is_some_and(|age| age.is_zero() || age.is_negative());
            if removal {
                jar.remove(cookie.name());
            } else {
                jar.insert(cookie.name().to_string(), cookie.value().to_string());
            }
        }
        Ok(())
    }

    /// Cookie value stored for `origin` (trailing `/` ignored).
    pub fn get_cookie(&self, origin: &str, name: &str) -> Option<String> {
        let origin = origin.trim_end_matches('/');
        self.lock()
            .ok()?
            .get(origin)
            .and_then(|jar| jar.get(name).cloned())
    }

    pub fn remove_cookie(&self, origin: &str, name: &str) {
        let origin = origin.trim_end_matches('/');
        if let Ok(mut jars) = self.lock() {
            if let Some(jar) = jars.get_mut(origin) {
                jar.remove(name);
            }
        }
    }

    pub fn set_cookie(&self, origin: &str, name: &str, value: &str) {
        let origin = origin.trim_end_matches('/');
        if let Ok(mut jars) = self.lock() {
            jars.entry(origin.to_string())
                .or_default()
                .insert(name.to_string(), value.to_string());
        }
    }
}

fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Restores the browser's auto-redirect flag when dropped.
pub struct AutoRedirectGuard<'a> {
    browser: &'a BrowserClient,
    previous: bool,
}

impl<'a> AutoRedirectGuard<'a> {
    fn new(browser: &'a BrowserClient, allow: bool) -> Self {
        let previous = browser.allow_auto_redirect();
        browser.set_allow_auto_redirect(allow);
        Self { browser, previous }
    }
}

impl Drop for AutoRedirectGuard<'_> {
    fn drop(&mut self) {
        self.browser.set_allow_auto_redirect(self.previous);
    }
}
