use std::path::PathBuf;

use clap::{Parser, Subcommand};

use idp_harness_core::authorize::{self, AuthorizeParameters, AuthorizeRequest, AuthorizeResponse};
use idp_harness_core::config::{self, Config};
use idp_harness_core::error::Error;
use idp_harness_core::interaction::Principal;

#[derive(Parser)]
#[command(name = "idp-harness", about = "Simulated OpenID Connect identity provider")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve {
        /// Sign every login page visit in as this configured subject
        #[arg(long)]
        login_as: Option<String>,
    },
    /// Check the config file
    Validate,
    /// List configured clients
    ListClients,
    /// List configured users
    ListUsers,
    /// Print an authorize URL for a configured client
    AuthorizeUrl {
        client_id: String,
        #[arg(long, default_value = "code")]
        response_type: String,
        #[arg(long, default_value = "openid profile")]
        scope: String,
        /// Defaults to the client's first registered redirect URI
        #[arg(long)]
        redirect_uri: Option<String>,
        /// Defaults to a random value
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        nonce: Option<String>,
        #[arg(long)]
        response_mode: Option<String>,
        /// Add an S256 code challenge and print the verifier
        #[arg(long)]
        pkce: bool,
        /// Extra parameters as key=value
        #[arg(long = "param", value_parser = parse_key_value)]
        params: Vec<(String, String)>,
    },
    /// Decode an authorization response URL into JSON
    ParseResponse {
        url: String,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("idp_harness=info,tower_http=info")
            }),
        )
        .init();

    let cli = Cli::parse();

    // parse-response doesn't need config
    if let Command::ParseResponse { url } = &cli.command {
        let response = AuthorizeResponse::parse(url)?;
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    let config = load_config(&cli)?;

    match cli.command {
        Command::Serve { login_as } => {
            let principal = match login_as {
                Some(subject_id) => {
                    let user = config
                        .find_user(&subject_id)
                        .ok_or_else(|| anyhow::anyhow!("user '{}' not found", subject_id))?;
                    Some(Principal::from(user))
                }
                None => None,
            };
            idp_harness_api::serve(config, principal).await?;
        }
        Command::Validate => {
            config.validate()?;
            tracing::info!("config loaded successfully");
            tracing::info!(origin = %config.origin()?, issuer = %config.issuer()?, "authority resolved");
        }
        Command::ListClients => {
            if config.clients.is_empty() {
                println!("No clients configured.");
            } else {
                println!("{:<16} {:<24} {:<8} {:<6} {}", "Client ID", "Name", "Consent", "PKCE", "Redirect URIs");
                println!("{}", "-".repeat(90));
                for client in &config.clients {
                    println!(
                        "{:<16} {:<24} {:<8} {:<6} {}",
                        client.client_id,
                        client.client_name.as_deref().unwrap_or("-"),
                        client.require_consent,
                        client.require_pkce,
                        client.redirect_uris.join(" "),
                    );
                }
                println!("\n{} client(s)", config.clients.len());
            }
        }
        Command::ListUsers => {
            if config.users.is_empty() {
                println!("No users configured.");
            } else {
                println!("{:<16} {:<16} {}", "Subject", "Username", "Name");
                println!("{}", "-".repeat(60));
                for user in &config.users {
                    println!("{:<16} {:<16} {}", user.subject_id, user.username, user.display_name());
                }
                println!("\n{} user(s)", config.users.len());
            }
        }
        Command::AuthorizeUrl {
            client_id,
            response_type,
            scope,
            redirect_uri,
            state,
            nonce,
            response_mode,
            pkce,
            params,
        } => {
            let client = config
                .find_client(&client_id)
                .ok_or_else(|| anyhow::anyhow!("client '{}' not found", client_id))?;
            let redirect_uri = redirect_uri
                .or_else(|| client.redirect_uris.first().cloned())
                .ok_or_else(|| anyhow::anyhow!("client '{}' has no redirect URIs", client_id))?;

            let mut request = AuthorizeParameters::new(&client_id, &response_type)
                .scope(scope)
                .redirect_uri(redirect_uri)
                .state(state.unwrap_or_else(authorize::generate_state));
            if let Some(nonce) = nonce {
                request = request.nonce(nonce);
            } else if response_type.split(' ').any(|t| t == "id_token") {
                request = request.nonce(authorize::generate_state());
            }
            if let Some(mode) = response_mode {
                request = request.response_mode(mode);
            }
            let verifier = if pkce {
                let (verifier, challenge) = authorize::generate_pkce();
                request = request.code_challenge(challenge, "S256");
                Some(verifier)
            } else {
                None
            };
            for (key, value) in params {
                request = request.extra(key, value);
            }

            let endpoint = format!("{}{}", config.origin()?, config.authority.authorize_path);
            println!("{}", AuthorizeRequest::new(endpoint).create_authorize_url(&request));
            if let Some(verifier) = verifier {
                println!("code_verifier: {verifier}");
            }
        }
        Command::ParseResponse { .. } => unreachable!(),
    }

    Ok(())
}

/// Resolve the config file, falling back to the built-in defaults when none
/// was named and none was found.
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    match config::resolve_config(cli.config.as_deref()) {
        Ok(config) => Ok(config),
        Err(Error::ConfigNotFound { searched }) => {
            tracing::info!(searched = searched.len(), "no config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(e.into()),
    }
}
