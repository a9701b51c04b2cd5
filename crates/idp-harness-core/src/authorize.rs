//! Authorization request URLs and the redirects that answer them.
//!
//! [`AuthorizeRequest`] builds the URL a relying party would send the browser
//! to; [`AuthorizeResponse`] decodes the URL the authority redirects back to.

use std::collections::BTreeMap;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Serialize;
use sha2::{Digest, Sha256};
use url::form_urlencoded;

use crate::error::{Error, Result};

/// Parameters of an authorization request.
///
/// Serialized in this order: `client_id`, `response_type`, `scope`,
/// `redirect_uri`, `state`, `nonce`, `login_hint`, `acr_values`,
/// `response_mode`, `code_challenge`, `code_challenge_method`, then `extra`
/// in insertion order. Unset values are left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizeParameters {
    pub client_id: String,
    pub response_type: String,
    pub scope: Option<String>,
    pub redirect_uri: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub login_hint: Option<String>,
    pub acr_values: Option<String>,
    pub response_mode: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl AuthorizeParameters {
    pub fn new(client_id: impl Into<String>, response_type: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            response_type: response_type.into(),
            ..Self::default()
        }
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn login_hint(mut self, login_hint: impl Into<String>) -> Self {
        self.login_hint = Some(login_hint.into());
        self
    }

    pub fn acr_values(mut self, acr_values: impl Into<String>) -> Self {
        self.acr_values = Some(acr_values.into());
        self
    }

    pub fn response_mode(mut self, response_mode: impl Into<String>) -> Self {
        self.response_mode = Some(response_mode.into());
        self
    }

    pub fn code_challenge(
        mut self,
        challenge: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        self.code_challenge = Some(challenge.into());
        self.code_challenge_method = Some(method.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    /// All set parameters as ordered key/value pairs.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        let mut pairs = vec![
            ("client_id", self.client_id.as_str()),
            ("response_type", self.response_type.as_str()),
        ];
        let optional = [
            ("scope", &self.scope),
            ("redirect_uri", &self.redirect_uri),
            ("state", &self.state),
            ("nonce", &self.nonce),
            ("login_hint", &self.login_hint),
            ("acr_values", &self.acr_values),
            ("response_mode", &self.response_mode),
            ("code_challenge", &self.code_challenge),
            ("code_challenge_method", &self.code_challenge_method),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                pairs.push((key, value.as_str()));
            }
        }
        for (key, value) in &self.extra {
            pairs.push((key.as_str(), value.as_str()));
        }
        pairs
    }
}

/// Builds authorization request URLs against a fixed endpoint.
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    endpoint: String,
}

impl AuthorizeRequest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into() }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Append every set parameter to the endpoint. Never validates, never fails.
    pub fn create_authorize_url(&self, params: &AuthorizeParameters) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for (key, value) in params.pairs() {
            query.append_pair(key, value);
        }
        let query = query.finish();

        let separator = if self.endpoint.contains('?') {
            if self.endpoint.ends_with('?') || self.endpoint.ends_with('&') { "" } else { "&" }
        } else {
            "?"
        };
        format!("{}{separator}{query}", self.endpoint)
    }
}

/// Where a response carried its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseLocation {
    Query,
    Fragment,
}

/// A decoded authorization response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizeResponse {
    pub raw: String,
    pub location: ResponseLocation,
    pub code: Option<String>,
    pub access_token: Option<String>,
    pub id_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub session_state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    /// Parameters without a typed field above.
    pub extra: BTreeMap<String, String>,
}

impl AuthorizeResponse {
    /// Parse a redirect target. The fragment wins when it is non-empty,
    /// otherwise parameters come from the query.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = url::Url::parse(raw).map_err(|e| Error::InvalidUrl(format!("{raw}: {e}")))?;

        let (location, params) = match url.fragment().filter(|f| !f.is_empty()) {
            Some(fragment) => (ResponseLocation::Fragment, fragment),
            None => (ResponseLocation::Query, url.query().unwrap_or_default()),
        };

        let mut response = Self {
            raw: raw.to_string(),
            location,
            code: None,
            access_token: None,
            id_token: None,
            token_type: None,
            expires_in: None,
            scope: None,
            state: None,
            session_state: None,
            error: None,
            error_description: None,
            extra: BTreeMap::new(),
        };

        for (key, value) in form_urlencoded::parse(params.as_bytes()) {
            let value = value.into_owned();
            match key.as_ref() {
                "code" => response.code = Some(value),
                "access_token" => response.access_token = Some(value),
                "id_token" => response.id_token = Some(value),
                "token_type" => response.token_type = Some(value),
                "expires_in" => match value.parse() {
                    Ok(secs) => response.expires_in = Some(secs),
                    Err(_) => {
                        response.extra.insert(key.into_owned(), value);
                    }
                },
                "scope" => response.scope = Some(value),
                "state" => response.state = Some(value),
                "session_state" => response.session_state = Some(value),
                "error" => response.error = Some(value),
                "error_description" => response.error_description = Some(value),
                _ => {
                    response.extra.insert(key.into_owned(), value);
                }
            }
        }

        Ok(response)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Generate a random state parameter.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a PKCE code verifier and its S256 challenge.
pub fn generate_pkce() -> (String, String) {
    let verifier = generate_state();
    (verifier.clone(), s256_challenge(&verifier))
}

pub fn s256_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}
