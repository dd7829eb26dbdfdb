// Authentication module
// Manages token lifecycle, grant requests and credential resolution

mod credentials;
mod grant;
mod manager;
mod types;

pub use credentials::{ChainedCredentials, CredentialSource, CredentialsProvider};
pub use grant::{
    classify_failure, parse_grant, token_url, AuthEndpoint, HttpAuthEndpoint, DEFAULT_SCOPE,
    TOKEN_PATH,
};
pub use manager::TokenManager;
pub use types::{
    compute_expiry, redacted, ClientIdentity, Credentials, GrantResponse, GrantStage, TokenRecord,
    TokenStatus, EXPIRY_MARGIN_SECS,
};
