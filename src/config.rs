use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::auth::{ChainedCredentials, CredentialSource};

/// RDP token - obtain and cache an OAuth2 access token for the Refinitiv Data Platform
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// INI file with an [RDP] section (username, password, clientId, uuid)
    #[arg(long, env = "RDP_CREDENTIALS_FILE", default_value = "credentials.ini")]
    pub credentials_file: String,

    /// File the token record is cached in
    #[arg(long, env = "RDP_TOKEN_FILE", default_value = "token.txt")]
    pub token_file: String,

    /// Machine or user account name
    #[arg(short = 'u', long, env = "RDP_USERNAME")]
    pub username: Option<String>,

    /// Account password
    #[arg(short = 'p', long, env = "RDP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Application key (client id)
    #[arg(short = 'c', long, env = "RDP_CLIENT_ID")]
    pub client_id: Option<String>,

    /// User identifier for research messages
    #[arg(long, env = "RDP_UUID")]
    pub uuid: Option<String>,

    /// Client secret sent through HTTP Basic auth
    #[arg(long, env = "RDP_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Scope requested by password grants
    #[arg(long, env = "RDP_SCOPE", default_value = "trapi")]
    pub scope: String,

    /// API base URL; the token endpoint lives below it
    #[arg(long, env = "RDP_BASE_URL", default_value = "https://api.refinitiv.com")]
    pub base_url: String,

    /// Token endpoint timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Take exclusive sign-on control on password grants
    #[arg(long, env = "RDP_EXCLUSIVE_SIGN_ON", default_value = "true", action = ArgAction::Set)]
    pub exclusive_sign_on: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Print a valid access token (default)
    Token,
    /// Show the cached token state without contacting the server
    Status,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub command: Command,

    // Storage
    pub credentials_file: PathBuf,
    pub token_file: PathBuf,

    // Process-supplied credentials
    pub credentials: CredentialSource,

    // Shared client settings
    pub client_secret: Option<String>,
    pub scope: String,

    // Token endpoint
    pub base_url: String,
    pub http_timeout: u64,
    pub exclusive_sign_on: bool,

    pub log_level: String,
}

impl Config {
    /// Load configuration with priority: CLI > ENV (.env included) > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            command: args.command.unwrap_or(Command::Token),
            credentials_file: expand_tilde(&args.credentials_file),
            token_file: expand_tilde(&args.token_file),
            credentials: CredentialSource {
                username: args.username,
                password: args.password,
                client_id: args.client_id,
                client_secret: None,
                scope: None,
                uuid: args.uuid,
            },
            client_secret: args.client_secret.filter(|s| !s.is_empty()),
            scope: args.scope,
            base_url: args.base_url,
            http_timeout: args.http_timeout,
            exclusive_sign_on: args.exclusive_sign_on,
            log_level: args.log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("https://") || self.base_url.starts_with("http://")) {
            anyhow::bail!("RDP_BASE_URL must be an http(s) URL: {}", self.base_url);
        }

        if self.http_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be at least 1 second");
        }

        if self.token_file.as_os_str().is_empty() {
            anyhow::bail!("RDP_TOKEN_FILE must not be empty");
        }

        if self.scope.trim().is_empty() {
            anyhow::bail!("RDP_SCOPE must not be empty");
        }

        Ok(())
    }

    /// Credential chain: credentials file > parameters > compiled-in defaults
    pub fn credential_chain(&self) -> ChainedCredentials {
        ChainedCredentials {
            file: Some(self.credentials_file.clone()),
            params: self.credentials.clone(),
            defaults: CredentialSource::compiled_in(),
            client_secret: self.client_secret.clone(),
            scope: Some(self.scope.clone()),
        }
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse an explicit argument list (env fallbacks still apply)
pub fn parse_args<I, T>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    CliArgs::try_parse_from(args).context("Invalid command line")
}
