use anyhow::{Context, Result};
use chrono::Utc;

use rdp_token::auth::{HttpAuthEndpoint, TokenManager, TokenStatus};
use rdp_token::config::{Command, Config};
use rdp_token::store::FileTokenStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;

    // Logs go to stderr; stdout carries only the token
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!(
        token_file = %config.token_file.display(),
        credentials_file = %config.credentials_file.display(),
        base_url = %config.base_url,
        "Configuration loaded"
    );

    // Credentials are read only when a grant is sent
    let endpoint = HttpAuthEndpoint::new(
        &config.base_url,
        config.http_timeout,
        config.exclusive_sign_on,
    )?;
    let store = FileTokenStore::new(config.token_file.clone());
    let manager = TokenManager::new(store, endpoint, config.credential_chain());

    match config.command {
        Command::Token => {
            let token = match manager.get_access_token().await {
                Ok(token) => token,
                Err(e) => {
                    tracing::error!(stage = %e.stage(), "❌ Failed to obtain access token: {}", e);
                    tracing::error!("");
                    tracing::error!("🔧 Troubleshooting steps:");
                    tracing::error!("   1. Check your network connection and RDP_BASE_URL");
                    tracing::error!("   2. Verify username, password and client id in {}", config.credentials_file.display());
                    tracing::error!("   3. Delete {} to force a fresh login", config.token_file.display());
                    return Err(e).context("Authentication failed");
                }
            };
            println!("{}", token);
        }
        Command::Status => {
            let path = config.token_file.display();
            match manager.status(Utc::now()) {
                TokenStatus::Absent => println!("No cached token in {}", path),
                TokenStatus::Valid { expires_at } => {
                    println!("Cached token in {} valid until {}", path, expires_at.to_rfc3339())
                }
                TokenStatus::Expired { expired_at } => {
                    println!("Cached token in {} expired at {}", path, expired_at.to_rfc3339())
                }
            }
        }
    }

    Ok(())
}
