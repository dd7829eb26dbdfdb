// Authentication types

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Seconds subtracted from the server-reported lifetime when computing expiry
pub const EXPIRY_MARGIN_SECS: i64 = 10;

/// Record fields that never come from a response's pass-through fields
const RECORD_FIELDS: [&str; 4] = ["access_token", "refresh_token", "expires_in", "expiry_tm"];

/// Lifecycle stage a token was served from, or failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantStage {
    /// Non-expired token read from the store
    Cached,
    /// `refresh_token` grant
    Refresh,
    /// `password` grant
    Password,
}

impl fmt::Display for GrantStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GrantStage::Cached => "cached",
            GrantStage::Refresh => "refresh",
            GrantStage::Password => "password",
        };
        f.write_str(name)
    }
}

/// Credential set used for a password grant
#[derive(Clone, Default, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scope: Option<String>,

    /// User identifier issued for research messages; carried, never sent
    pub uuid: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
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

/// Client identity presented through HTTP Basic authentication
#[derive(Clone, Default, PartialEq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Successful token response from the authorization server
#[derive(Clone, PartialEq, Deserialize)]
pub struct GrantResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(deserialize_with = "seconds_from_number_or_string")]
    pub expires_in: u64,

    /// Remaining response fields (`scope`, `token_type`, ...), passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl fmt::Debug for GrantResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantResponse")
            .field("access_token", &redacted(&self.access_token))
            .field("refresh_token", &redacted(&self.refresh_token))
            .field("expires_in", &self.expires_in)
            .field("extra", &self.extra)
            .finish()
    }
}

/// The persisted token
///
/// `expiry_tm` is always computed locally from the issuance time; it is
/// never taken from the server response.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(deserialize_with = "seconds_from_number_or_string")]
    pub expires_in: u64,
    #[serde(with = "epoch_seconds")]
    pub expiry_tm: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenRecord {
    /// Build a record from a grant issued at `issued_at`
    pub fn from_grant(grant: GrantResponse, issued_at: DateTime<Utc>) -> Self {
        let expiry_tm = compute_expiry(issued_at, grant.expires_in);

        let mut extra = grant.extra;
        extra.retain(|key, _| !RECORD_FIELDS.contains(&key.as_str()));

        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_in: grant.expires_in,
            expiry_tm,
            extra,
        }
    }

    /// Whether the access token can still be used at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_tm > now
    }

    /// Whether every required field carries a value
    pub fn is_complete(&self) -> bool {
        !self.access_token.is_empty() && !self.refresh_token.is_empty()
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &redacted(&self.access_token))
            .field("refresh_token", &redacted(&self.refresh_token))
            .field("expires_in", &self.expires_in)
            .field("expiry_tm", &self.expiry_tm.to_rfc3339())
            .field("extra", &self.extra)
            .finish()
    }
}

/// Cache state as seen without touching the network
#[derive(Debug, Clone, PartialEq)]
pub enum TokenStatus {
    Absent,
    Valid { expires_at: DateTime<Utc> },
    Expired { expired_at: DateTime<Utc> },
}

/// `issued_at + expires_in - margin`, truncated to whole seconds
pub fn compute_expiry(issued_at: DateTime<Utc>, expires_in: u64) -> DateTime<Utc> {
    let lifetime = i64::try_from(expires_in)
        .ok()
        .and_then(|secs| secs.checked_sub(EXPIRY_MARGIN_SECS))
        .and_then(Duration::try_seconds);

    match lifetime {
        Some(lifetime) => issued_at
            .trunc_subsecs(0)
            .checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
        None => DateTime::<Utc>::MAX_UTC,
    }
}

/// Length-only rendering of a secret for logs and `Debug`
pub fn redacted(secret: &str) -> String {
    format!("<redacted:{} chars>", secret.len())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Float(f64),
    Text(String),
}

/// The server reports `expires_in` as a string; older token files may hold a number
fn seconds_from_number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Float(f) if f.is_finite() && f >= 0.0 => Ok(f as u64),
        NumberOrString::Float(f) => Err(D::Error::custom(format!("invalid expires_in: {}", f))),
        NumberOrString::Text(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| D::Error::custom(format!("invalid expires_in: {:?}", s))),
    }
}

/// `expiry_tm` as Unix epoch seconds
///
/// Saved as an integer; fractional values from legacy files are accepted and truncated.
mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum EpochValue {
        Whole(i64),
        Fractional(f64),
    }

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(value.timestamp())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = match EpochValue::deserialize(deserializer)? {
            EpochValue::Whole(secs) => secs,
            EpochValue::Fractional(f) if f.is_finite() => f.floor() as i64,
            EpochValue::Fractional(f) => {
                return Err(D::Error::custom(format!("invalid expiry_tm: {}", f)))
            }
        };

        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| D::Error::custom(format!("expiry_tm out of range: {}", secs)))
    }
}
