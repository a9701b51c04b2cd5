use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level configuration.
///
/// Every section has defaults, so an empty file yields the built-in test
/// setup returned by [`Config::default`].
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub user_interaction: UserInteractionConfig,
    #[serde(default)]
    pub cookies: CookieConfig,
    #[serde(default)]
    pub backchannel: BackChannelConfig,
    #[serde(default)]
    pub external: ExternalConfig,
    #[serde(default = "default_clients")]
    pub clients: Vec<ClientConfig>,
    #[serde(default = "default_users")]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Origin the virtual browser and all cookies are scoped to.
    #[serde(default = "default_origin")]
    pub origin: ConfigValue,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorityConfig {
    /// Issuer identifier. Defaults to the server origin when unset.
    pub issuer: Option<ConfigValue>,
    #[serde(default = "default_authorize_path")]
    pub authorize_path: String,
    #[serde(default = "default_authorize_callback_path")]
    pub authorize_callback_path: String,
    #[serde(default = "default_end_session_path")]
    pub end_session_path: String,
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl_secs: u64,
}

/// Routes of the interaction pages and the query parameters they consume.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInteractionConfig {
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default = "default_logout_url")]
    pub logout_url: String,
    #[serde(default = "default_consent_url")]
    pub consent_url: String,
    #[serde(default = "default_error_url")]
    pub error_url: String,
    #[serde(default = "default_return_url_parameter")]
    pub login_return_url_parameter: String,
    #[serde(default = "default_return_url_parameter")]
    pub consent_return_url_parameter: String,
    #[serde(default = "default_federated_signout_path")]
    pub federated_signout_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CookieConfig {
    #[serde(default = "default_authentication_cookie")]
    pub authentication: String,
    #[serde(default = "default_check_session_cookie")]
    pub check_session: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackChannelConfig {
    /// Send back-channel logout notifications when a session ends.
    #[serde(default = "default_true")]
    pub logout_notifications: bool,
    #[serde(default = "default_backchannel_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalConfig {
    /// Install the external identity bridge in front of the router.
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub client_id: String,
    pub client_name: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub post_logout_redirect_uris: Vec<String>,
    #[serde(default)]
    pub allowed_scopes: Vec<String>,
    #[serde(default = "default_response_types")]
    pub allowed_response_types: Vec<String>,
    #[serde(default)]
    pub require_consent: bool,
    #[serde(default = "default_true")]
    pub allow_remember_consent: bool,
    #[serde(default)]
    pub require_pkce: bool,
    pub backchannel_logout_uri: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub subject_id: String,
    pub username: String,
    #[serde(default)]
    pub claims: BTreeMap<String, String>,
}

impl UserConfig {
    /// Display name: the `name` claim, falling back to the username.
    pub fn display_name(&self) -> &str {
        self.claims
            .get("name")
            .map(String::as_str)
            .unwrap_or(&self.username)
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ui = &self.user_interaction;
        for (name, path) in [
            ("user_interaction.login_url", &ui.login_url),
            ("user_interaction.logout_url", &ui.logout_url),
            ("user_interaction.consent_url", &ui.consent_url),
            ("user_interaction.error_url", &ui.error_url),
            ("user_interaction.federated_signout_path", &ui.federated_signout_path),
            ("authority.authorize_path", &self.authority.authorize_path),
            ("authority.authorize_callback_path", &self.authority.authorize_callback_path),
            ("authority.end_session_path", &self.authority.end_session_path),
        ] {
            if !path.starts_with('/') {
                return Err(Error::Config(format!("{name} must start with '/': {path}")));
            }
        }
        if ui.login_return_url_parameter.is_empty() || ui.consent_return_url_parameter.is_empty() {
            return Err(Error::Config("return url parameter names cannot be empty".to_string()));
        }
        if self.cookies.authentication.is_empty() || self.cookies.check_session.is_empty() {
            return Err(Error::Config("cookie names cannot be empty".to_string()));
        }
        if self.cookies.authentication == self.cookies.check_session {
            return Err(Error::Config(
                "cookies.authentication and cookies.check_session must differ".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for client in &self.clients {
            if !seen.insert(client.client_id.as_str()) {
                return Err(Error::Config(format!("duplicate client_id: {}", client.client_id)));
            }
            if client.redirect_uris.is_empty() {
                return Err(Error::Config(format!(
                    "client '{}' needs at least one redirect_uri",
                    client.client_id
                )));
            }
            for scope in &client.allowed_scopes {
                validate_scope_name(scope)?;
            }
        }

        let mut seen = HashSet::new();
        for user in &self.users {
            if !seen.insert(user.subject_id.as_str()) {
                return Err(Error::Config(format!("duplicate subject_id: {}", user.subject_id)));
            }
        }
        Ok(())
    }

    pub fn origin(&self) -> Result<String> {
        Ok(self.server.origin.resolve()?.trim_end_matches('/').to_string())
    }

    pub fn issuer(&self) -> Result<String> {
        match &self.authority.issuer {
            Some(issuer) => issuer.resolve(),
            None => self.origin(),
        }
    }

    pub fn find_client(&self, client_id: &str) -> Option<&ClientConfig> {
        self.clients.iter().find(|c| c.client_id == client_id)
    }

    pub fn find_user(&self, subject_id: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.subject_id == subject_id)
    }
}

/// Validate that a scope name uses only safe characters.
/// Allowed: ASCII letters, digits, colons, dots, underscores, hyphens.
pub fn validate_scope_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("scope name cannot be empty".to_string()));
    }
    for ch in name.bytes() {
        if !matches!(ch, b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b':' | b'.' | b'_' | b'-') {
            return Err(Error::Config(format!(
                "scope name contains invalid character '{}': {name}",
                ch as char
            )));
        }
    }
    Ok(())
}

// --- ConfigValue: supports "env:VAR_NAME" syntax ---

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Literal(String),
}

impl ConfigValue {
    pub fn resolve(&self) -> Result<String> {
        let ConfigValue::Literal(s) = self;
        if let Some(var_name) = s.strip_prefix("env:") {
            std::env::var(var_name).map_err(|_| {
                Error::Config(format!("environment variable {var_name} not set"))
            })
        } else {
            Ok(s.clone())
        }
    }
}

// --- Config resolution ---

const CONFIG_FILENAME: &str = "idp_harness.toml";
const CONFIG_ENV_VAR: &str = "IDP_HARNESS_CONFIG";

/// Resolve config file location using the standard search order:
/// 1. Explicit path (CLI flag)
/// 2. IDP_HARNESS_CONFIG env var
/// 3. Current directory
/// 4. Walk up parent directories
/// 5. ~/.config/idp_harness/config.toml
/// 6. /etc/idp_harness/config.toml
pub fn resolve_config(explicit_path: Option<&Path>) -> Result<Config> {
    let mut searched = Vec::new();

    if let Some(path) = explicit_path {
        if path.exists() {
            return Config::from_path(path);
        }
        return Err(Error::Config(format!(
            "config file not found: {}",
            path.display()
        )));
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            return Config::from_path(&path);
        }
        searched.push(path);
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = Some(cwd.as_path());
        while let Some(d) = dir {
            let config_path = d.join(CONFIG_FILENAME);
            if config_path.exists() {
                return Config::from_path(&config_path);
            }
            searched.push(config_path);
            dir = d.parent();
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user_config = config_dir.join("idp_harness").join("config.toml");
        if user_config.exists() {
            return Config::from_path(&user_config);
        }
        searched.push(user_config);
    }

    let system_config = PathBuf::from("/etc/idp_harness/config.toml");
    if system_config.exists() {
        return Config::from_path(&system_config);
    }
    searched.push(system_config);

    Err(Error::ConfigNotFound { searched })
}

// --- Defaults ---

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            authority: AuthorityConfig::default(),
            user_interaction: UserInteractionConfig::default(),
            cookies: CookieConfig::default(),
            backchannel: BackChannelConfig::default(),
            external: ExternalConfig::default(),
            clients: default_clients(),
            users: default_users(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            issuer: None,
            authorize_path: default_authorize_path(),
            authorize_callback_path: default_authorize_callback_path(),
            end_session_path: default_end_session_path(),
            access_token_ttl_secs: default_access_token_ttl(),
        }
    }
}

impl Default for UserInteractionConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            logout_url: default_logout_url(),
            consent_url: default_consent_url(),
            error_url: default_error_url(),
            login_return_url_parameter: default_return_url_parameter(),
            consent_return_url_parameter: default_return_url_parameter(),
            federated_signout_path: default_federated_signout_path(),
        }
    }
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            authentication: default_authentication_cookie(),
            check_session: default_check_session_cookie(),
        }
    }
}

impl Default for BackChannelConfig {
    fn default() -> Self {
        Self {
            logout_notifications: true,
            timeout_secs: default_backchannel_timeout(),
        }
    }
}

/// `client1`: plain code flow, no consent. `client2`: code flow with consent
/// and PKCE. `client3`: implicit/hybrid responses delivered in the fragment.
fn default_clients() -> Vec<ClientConfig> {
    vec![
        ClientConfig {
            client_id: "client1".to_string(),
            client_name: Some("Code Client".to_string()),
            redirect_uris: vec!["https://client/callback".to_string()],
            post_logout_redirect_uris: vec!["https://client/signout-callback".to_string()],
            allowed_scopes: vec!["openid".to_string(), "profile".to_string(), "api1".to_string()],
            allowed_response_types: default_response_types(),
            require_consent: false,
            allow_remember_consent: true,
            require_pkce: false,
            backchannel_logout_uri: Some("https://client/backchannel-logout".to_string()),
        },
        ClientConfig {
            client_id: "client2".to_string(),
            client_name: Some("Consent Client".to_string()),
            redirect_uris: vec!["https://client2/callback".to_string()],
            post_logout_redirect_uris: vec![],
            allowed_scopes: vec![
                "openid".to_string(),
                "profile".to_string(),
                "email".to_string(),
                "api1".to_string(),
            ],
            allowed_response_types: default_response_types(),
            require_consent: true,
            allow_remember_consent: true,
            require_pkce: true,
            backchannel_logout_uri: None,
        },
        ClientConfig {
            client_id: "client3".to_string(),
            client_name: Some("Implicit Client".to_string()),
            redirect_uris: vec!["https://client3/callback".to_string()],
            post_logout_redirect_uris: vec![],
            allowed_scopes: vec!["openid".to_string(), "profile".to_string(), "api1".to_string()],
            allowed_response_types: vec![
                "id_token".to_string(),
                "id_token token".to_string(),
                "code id_token".to_string(),
            ],
            require_consent: false,
            allow_remember_consent: true,
            require_pkce: false,
            backchannel_logout_uri: None,
        },
    ]
}

fn default_users() -> Vec<UserConfig> {
    vec![
        UserConfig {
            subject_id: "bob".to_string(),
            username: "bob".to_string(),
            claims: BTreeMap::from([
                ("name".to_string(), "Bob Loblaw".to_string()),
                ("email".to_string(), "bob@loblaw.com".to_string()),
            ]),
        },
        UserConfig {
            subject_id: "alice".to_string(),
            username: "alice".to_string(),
            claims: BTreeMap::new(),
        },
    ]
}

fn default_origin() -> ConfigValue { ConfigValue::Literal("https://server".to_string()) }
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 5000 }
fn default_authorize_path() -> String { "/connect/authorize".to_string() }
fn default_authorize_callback_path() -> String { "/connect/authorize/callback".to_string() }
fn default_end_session_path() -> String { "/connect/endsession".to_string() }
fn default_access_token_ttl() -> u64 { 3600 }
fn default_login_url() -> String { "/account/login".to_string() }
fn default_logout_url() -> String { "/account/logout".to_string() }
fn default_consent_url() -> String { "/consent".to_string() }
fn default_error_url() -> String { "/home/error".to_string() }
fn default_return_url_parameter() -> String { "returnUrl".to_string() }
fn default_federated_signout_path() -> String { "/signout-oidc".to_string() }
fn default_authentication_cookie() -> String { "idsrv".to_string() }
fn default_check_session_cookie() -> String { "idsrv.session".to_string() }
fn default_backchannel_timeout() -> u64 { 10 }
fn default_response_types() -> Vec<String> { vec!["code".to_string()] }
fn default_true() -> bool { true }
