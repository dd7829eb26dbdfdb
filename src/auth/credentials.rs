// Credential resolution
// Priority: credentials file > process parameters > compiled-in defaults

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::types::{ClientIdentity, Credentials, GrantStage};
use crate::error::AuthError;

/// INI section holding the credentials
const CREDENTIALS_SECTION: &str = "RDP";

/// Supplies credentials for grants
///
/// Called only when a grant is about to be sent, never on the cached path.
pub trait CredentialsProvider {
    /// Full credentials for a password grant
    fn resolve(&self) -> std::result::Result<Credentials, AuthError>;

    /// Client id and secret for a refresh grant, which carries no user credentials
    fn client_identity(&self) -> std::result::Result<ClientIdentity, AuthError>;
}

/// Fixed credentials
impl CredentialsProvider for Credentials {
    fn resolve(&self) -> std::result::Result<Credentials, AuthError> {
        Ok(self.clone())
    }

    fn client_identity(&self) -> std::result::Result<ClientIdentity, AuthError> {
        Ok(ClientIdentity {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone().unwrap_or_default(),
        })
    }
}

/// Whatever one source provides, possibly incomplete
#[derive(Clone, Default, PartialEq)]
pub struct CredentialSource {
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    pub uuid: Option<String>,
}

impl CredentialSource {
    /// Defaults baked in at build time through `RDP_DEFAULT_*` variables
    pub fn compiled_in() -> Self {
        Self {
            username: non_empty(option_env!("RDP_DEFAULT_USERNAME")),
            password: non_empty(option_env!("RDP_DEFAULT_PASSWORD")),
            client_id: non_empty(option_env!("RDP_DEFAULT_CLIENT_ID")),
            client_secret: None,
            scope: None,
            uuid: non_empty(option_env!("RDP_DEFAULT_UUID")),
        }
    }

    /// Read the `[RDP]` section of an INI credentials file
    pub fn from_ini_file(path: &Path) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Ini))
            .build()
            .with_context(|| format!("Failed to read credentials file: {}", path.display()))?;

        // Keys outside any section sit next to the sections, so only [RDP] is read as a table
        let entries: HashMap<String, ::config::Value> = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse credentials file: {}", path.display()))?;

        let section = entries
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(CREDENTIALS_SECTION))
            .map(|(_, value)| value)
            .with_context(|| {
                format!(
                    "Credentials file {} has no [{}] section",
                    path.display(),
                    CREDENTIALS_SECTION
                )
            })?
            .into_table()
            .with_context(|| {
                format!(
                    "[{}] in credentials file {} is not a section",
                    CREDENTIALS_SECTION,
                    path.display()
                )
            })?;

        // Key case is not preserved by every INI reader
        let get = |key: &str| {
            section
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .and_then(|(_, v)| v.clone().into_string().ok())
                .and_then(|v| non_empty(Some(v.as_str())))
        };

        Ok(Self {
            username: get("username"),
            password: get("password"),
            client_id: get("clientId"),
            client_secret: get("clientSecret"),
            scope: get("scope"),
            uuid: get("uuid"),
        })
    }

    /// Complete credentials, when this source has all required fields
    pub fn complete(&self) -> Option<Credentials> {
        Some(Credentials {
            username: self.username.clone()?,
            password: self.password.clone()?,
            client_id: self.client_id.clone()?,
            client_secret: self.client_secret.clone(),
            scope: self.scope.clone(),
            uuid: self.uuid.clone(),
        })
    }
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSource")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("scope", &self.scope)
            .field("uuid", &self.uuid)
            .finish()
    }
}

/// Resolves credentials from the first complete source, re-reading the file each time
#[derive(Debug, Clone, Default)]
pub struct ChainedCredentials {
    pub file: Option<PathBuf>,
    pub params: CredentialSource,
    pub defaults: CredentialSource,

    /// Fallbacks for fields a winning source leaves unset
    pub client_secret: Option<String>,
    pub scope: Option<String>,
}

impl ChainedCredentials {
    fn file_source(&self) -> Option<CredentialSource> {
        let path = self.file.as_deref()?;
        match CredentialSource::from_ini_file(path) {
            Ok(source) => Some(source),
            Err(e) if path.exists() => {
                tracing::warn!("Ignoring unreadable credentials file: {:#}", e);
                None
            }
            Err(e) => {
                tracing::debug!("Skipping credentials file: {:#}", e);
                None
            }
        }
    }

    /// Sources in priority order, tagged for logging
    fn sources(&self) -> Vec<(&'static str, CredentialSource)> {
        let mut sources = Vec::with_capacity(3);
        if let Some(file) = self.file_source() {
            sources.push(("credentials file", file));
        }
        sources.push(("parameters", self.params.clone()));
        sources.push(("compiled-in defaults", self.defaults.clone()));
        sources
    }
}

impl CredentialsProvider for ChainedCredentials {
    fn resolve(&self) -> std::result::Result<Credentials, AuthError> {
        for (origin, source) in self.sources() {
            if let Some(mut creds) = source.complete() {
                tracing::info!(
                    "Using credentials from {} (user: {}, client: {}...)",
                    origin,
                    creds.username,
                    creds.client_id.chars().take(8).collect::<String>()
                );
                if creds.client_secret.is_none() {
                    creds.client_secret = self.client_secret.clone();
                }
                if creds.scope.is_none() {
                    creds.scope = self.scope.clone();
                }
                return Ok(creds);
            }
            tracing::debug!("Credential source '{}' is incomplete", origin);
        }

        Err(AuthError::Credentials {
            stage: GrantStage::Password,
            message: "no source provides username, password and client id \
                      (credentials file, --username/--password/--client-id, or build-time defaults)"
                .to_string(),
        })
    }

    /// Client id from the first source that has one, with the shared secret as fallback
    fn client_identity(&self) -> std::result::Result<ClientIdentity, AuthError> {
        self.sources()
            .into_iter()
            .find_map(|(_, source)| {
                let client_id = source.client_id?;
                let client_secret = source
                    .client_secret
                    .or_else(|| self.client_secret.clone())
                    .unwrap_or_default();
                Some(ClientIdentity {
                    client_id,
                    client_secret,
                })
            })
            .ok_or_else(|| AuthError::Credentials {
                stage: GrantStage::Refresh,
                message: "no source provides a client id".to_string(),
            })
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
