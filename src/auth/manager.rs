use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::credentials::CredentialsProvider;
use super::grant::AuthEndpoint;
use super::types::{redacted, GrantResponse, GrantStage, TokenRecord, TokenStatus};
use crate::error::{AuthError, GrantError, Result};
use crate::store::TokenStore;

/// Token lifecycle manager
///
/// Serves the cached token while it is valid, otherwise refreshes it, and
/// falls back to a password grant when there is no token or the refresh
/// token was rejected. Every successful grant overwrites the stored record.
pub struct TokenManager<S, E, C> {
    /// Persisted token record
    store: S,

    /// Authorization server
    endpoint: E,

    /// Source of user credentials for password grants
    credentials: C,

    /// Serializes the load-decide-save sequence between callers sharing this manager
    lifecycle: Mutex<()>,
}

impl<S, E, C> TokenManager<S, E, C>
where
    S: TokenStore,
    E: AuthEndpoint,
    C: CredentialsProvider,
{
    pub fn new(store: S, endpoint: E, credentials: C) -> Self {
        Self {
            store,
            endpoint,
            credentials,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Get a valid access token, refreshing or re-authenticating if necessary
    pub async fn get_access_token(&self) -> Result<String> {
        self.get_access_token_at(Utc::now()).await
    }

    /// Same as `get_access_token`, with the current time supplied by the caller
    pub async fn get_access_token_at(&self, now: DateTime<Utc>) -> Result<String> {
        let _guard = self.lifecycle.lock().await;

        let grant = match self.store.load() {
            Some(record) if record.is_valid_at(now) => {
                tracing::debug!(
                    stage = %GrantStage::Cached,
                    expires_at = %record.expiry_tm.to_rfc3339(),
                    "Using cached access token"
                );
                return Ok(record.access_token);
            }
            Some(record) => {
                tracing::info!("Token expired, refreshing a new one...");
                match self.refresh(&record.refresh_token).await? {
                    Some(grant) => grant,
                    None => {
                        tracing::info!("Refresh token expired, using password grant...");
                        self.reauthenticate().await?
                    }
                }
            }
            None => {
                tracing::info!("Getting a new token using password grant...");
                self.reauthenticate().await?
            }
        };

        Ok(self.persist(grant, now))
    }

    /// Report the cache state without any network call
    pub fn status(&self, now: DateTime<Utc>) -> TokenStatus {
        match self.store.load() {
            None => TokenStatus::Absent,
            Some(record) if record.is_valid_at(now) => TokenStatus::Valid {
                expires_at: record.expiry_tm,
            },
            Some(record) => TokenStatus::Expired {
                expired_at: record.expiry_tm,
            },
        }
    }

    /// Refresh grant; `None` means the refresh token was rejected and a password grant is due
    async fn refresh(&self, refresh_token: &str) -> Result<Option<GrantResponse>> {
        let identity = self.credentials.client_identity()?;

        match self.endpoint.refresh_grant(refresh_token, &identity).await {
            Ok(grant) => Ok(Some(grant)),
            Err(GrantError::InvalidGrant { status, .. }) => {
                tracing::warn!(
                    stage = %GrantStage::Refresh,
                    status = status,
                    "Refresh token rejected as invalid_grant"
                );
                Ok(None)
            }
            Err(e) => {
                tracing::error!(stage = %GrantStage::Refresh, "Token refresh failed: {}", e);
                Err(AuthError::Transport {
                    stage: GrantStage::Refresh,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Password grant with freshly resolved credentials
    async fn reauthenticate(&self) -> Result<GrantResponse> {
        let credentials = self.credentials.resolve()?;

        match self.endpoint.password_grant(&credentials).await {
            Ok(grant) => Ok(grant),
            Err(GrantError::InvalidGrant { status, body })
            | Err(GrantError::Rejected { status, body }) => {
                tracing::error!(
                    stage = %GrantStage::Password,
                    status = status,
                    user = %credentials.username,
                    "Password grant rejected"
                );
                Err(AuthError::Authentication {
                    stage: GrantStage::Password,
                    status,
                    body,
                })
            }
            Err(e) => {
                tracing::error!(stage = %GrantStage::Password, "Password grant failed: {}", e);
                Err(AuthError::Transport {
                    stage: GrantStage::Password,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Store the new record; a failed save still hands out the token
    fn persist(&self, grant: GrantResponse, issued_at: DateTime<Utc>) -> String {
        let record = TokenRecord::from_grant(grant, issued_at);

        match self.store.save(&record) {
            Ok(()) => tracing::info!(
                access_token = %redacted(&record.access_token),
                "Saved new token, expires: {}",
                record.expiry_tm.to_rfc3339()
            ),
            Err(e) => tracing::warn!("Failed to persist token, continuing with it: {}", e),
        }

        record.access_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::{ClientIdentity, Credentials, EXPIRY_MARGIN_SECS};
    use crate::error::StoreError;
    use crate::store::MemoryTokenStore;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 12, 10, 30, 0).unwrap()
    }

    fn grant(access: &str, refresh: &str, expires_in: u64) -> GrantResponse {
        GrantResponse {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
            expires_in,
            extra: Map::new(),
        }
    }

    fn record(expiry_tm: DateTime<Utc>) -> TokenRecord {
        TokenRecord {
            access_token: "cached-access".to_string(),
            refresh_token: "cached-refresh".to_string(),
            expires_in: 3600,
            expiry_tm,
            extra: Map::new(),
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "user".to_string(),
            password: "pass".to_string(),
            client_id: "client".to_string(),
            ..Default::default()
        }
    }

    /// Endpoint replaying fixed outcomes and counting calls
    struct ScriptedEndpoint {
        refresh: std::result::Result<GrantResponse, GrantError>,
        password: std::result::Result<GrantResponse, GrantError>,
        refresh_calls: AtomicUsize,
        password_calls: AtomicUsize,
        refresh_client: std::sync::Mutex<Option<String>>,
    }

    impl ScriptedEndpoint {
        fn new(
            refresh: std::result::Result<GrantResponse, GrantError>,
            password: std::result::Result<GrantResponse, GrantError>,
        ) -> Self {
            Self {
                refresh,
                password,
                refresh_calls: AtomicUsize::new(0),
                password_calls: AtomicUsize::new(0),
                refresh_client: std::sync::Mutex::new(None),
            }
        }

        fn unreachable() -> Self {
            Self::new(
                Err(GrantError::Network("unreachable".to_string())),
                Err(GrantError::Network("unreachable".to_string())),
            )
        }

        fn calls(&self) -> (usize, usize) {
            (
                self.refresh_calls.load(Ordering::SeqCst),
                self.password_calls.load(Ordering::SeqCst),
            )
        }
    }

    impl AuthEndpoint for ScriptedEndpoint {
        async fn password_grant(
            &self,
            _credentials: &Credentials,
        ) -> std::result::Result<GrantResponse, GrantError> {
            self.password_calls.fetch_add(1, Ordering::SeqCst);
            self.password.clone()
        }

        async fn refresh_grant(
            &self,
            _refresh_token: &str,
            identity: &ClientIdentity,
        ) -> std::result::Result<GrantResponse, GrantError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            *self.refresh_client.lock().unwrap() = Some(identity.client_id.clone());
            self.refresh.clone()
        }
    }

    /// Credentials that count how often they are asked for
    #[derive(Default)]
    struct CountingCredentials {
        resolves: AtomicUsize,
        identities: AtomicUsize,
    }

    impl CountingCredentials {
        fn calls(&self) -> (usize, usize) {
            (
                self.resolves.load(Ordering::SeqCst),
                self.identities.load(Ordering::SeqCst),
            )
        }
    }

    impl CredentialsProvider for CountingCredentials {
        fn resolve(&self) -> Result<Credentials> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            Ok(credentials())
        }

        fn client_identity(&self) -> Result<ClientIdentity> {
            self.identities.fetch_add(1, Ordering::SeqCst);
            credentials().client_identity()
        }
    }

    /// Store whose writes always fail
    struct ReadOnlyStore(Option<TokenRecord>);

    impl TokenStore for ReadOnlyStore {
        fn load(&self) -> Option<TokenRecord> {
            self.0.clone()
        }

        fn save(&self, _record: &TokenRecord) -> std::result::Result<(), StoreError> {
            Err(StoreError::Io {
                path: "/read-only/token.txt".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }
    }

    #[tokio::test]
    async fn test_cached_token_makes_no_calls() {
        let manager = TokenManager::new(
            MemoryTokenStore::with_record(record(t0() + Duration::seconds(3600))),
            ScriptedEndpoint::unreachable(),
            credentials(),
        );

        let token = manager
            .get_access_token_at(t0() + Duration::seconds(10))
            .await
            .unwrap();

        assert_eq!(token, "cached-access");
        assert_eq!(manager.endpoint().calls(), (0, 0));
        assert_eq!(manager.store().save_count(), 0);
    }

    #[tokio::test]
    async fn test_cached_token_does_not_consult_credentials() {
        let manager = TokenManager::new(
            MemoryTokenStore::with_record(record(t0() + Duration::seconds(3600))),
            ScriptedEndpoint::unreachable(),
            CountingCredentials::default(),
        );

        manager.get_access_token_at(t0()).await.unwrap();
        assert_eq!(manager.credentials.calls(), (0, 0));
    }

    #[tokio::test]
    async fn test_refresh_resolves_client_identity_when_sent() {
        let manager = TokenManager::new(
            MemoryTokenStore::with_record(record(t0())),
            ScriptedEndpoint::new(
                Ok(grant("refreshed-access", "refreshed-refresh", 300)),
                Err(GrantError::Network("must not be called".to_string())),
            ),
            CountingCredentials::default(),
        );

        manager
            .get_access_token_at(t0() + Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(manager.credentials.calls(), (0, 1));
        assert_eq!(
            manager.endpoint().refresh_client.lock().unwrap().as_deref(),
            Some("client")
        );
    }

    #[tokio::test]
    async fn test_missing_client_identity_skips_refresh_call() {
        struct NoClient;

        impl CredentialsProvider for NoClient {
            fn resolve(&self) -> Result<Credentials> {
                Ok(credentials())
            }

            fn client_identity(&self) -> Result<ClientIdentity> {
                Err(AuthError::Credentials {
                    stage: GrantStage::Refresh,
                    message: "no client id".to_string(),
                })
            }
        }

        let manager = TokenManager::new(
            MemoryTokenStore::with_record(record(t0())),
            ScriptedEndpoint::unreachable(),
            NoClient,
        );

        let err = manager
            .get_access_token_at(t0() + Duration::seconds(1))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), GrantStage::Refresh);
        assert_eq!(manager.endpoint().calls(), (0, 0));
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let manager = TokenManager::new(
            MemoryTokenStore::with_record(record(t0() + Duration::seconds(3600))),
            ScriptedEndpoint::new(
                Ok(grant("refreshed-access", "refreshed-refresh", 300)),
                Err(GrantError::Network("must not be called".to_string())),
            ),
            credentials(),
        );
        let now = t0() + Duration::seconds(3700);

        let token = manager.get_access_token_at(now).await.unwrap();

        assert_eq!(token, "refreshed-access");
        assert_eq!(manager.endpoint().calls(), (1, 0));

        let stored = manager.store().load().unwrap();
        assert_eq!(stored.refresh_token, "refreshed-refresh");
        assert_eq!(
            stored.expiry_tm,
            now + Duration::seconds(300 - EXPIRY_MARGIN_SECS)
        );
    }

    #[tokio::test]
    async fn test_expiry_boundary_is_expired() {
        let manager = TokenManager::new(
            MemoryTokenStore::with_record(record(t0())),
            ScriptedEndpoint::new(Ok(grant("new", "new-refresh", 300)), Ok(grant("pw", "pw", 300))),
            credentials(),
        );

        let token = manager.get_access_token_at(t0()).await.unwrap();
        assert_eq!(token, "new");
        assert_eq!(manager.endpoint().calls(), (1, 0));
    }

    #[tokio::test]
    async fn test_invalid_refresh_falls_back_to_password_once() {
        let manager = TokenManager::new(
            MemoryTokenStore::with_record(record(t0() + Duration::seconds(3600))),
            ScriptedEndpoint::new(
                Err(GrantError::InvalidGrant {
                    status: 400,
                    body: r#"{"error":"invalid_grant"}"#.to_string(),
                }),
                Ok(grant("password-access", "password-refresh", 600)),
            ),
            credentials(),
        );

        let token = manager
            .get_access_token_at(t0() + Duration::seconds(3700))
            .await
            .unwrap();

        assert_eq!(token, "password-access");
        assert_eq!(manager.endpoint().calls(), (1, 1));
        assert_eq!(
            manager.store().load().unwrap().refresh_token,
            "password-refresh"
        );
    }

    #[tokio::test]
    async fn test_missing_record_goes_straight_to_password() {
        let manager = TokenManager::new(
            MemoryTokenStore::new(),
            ScriptedEndpoint::new(
                Err(GrantError::Network("must not be called".to_string())),
                Ok(grant("password-access", "password-refresh", 600)),
            ),
            credentials(),
        );

        let token = manager.get_access_token_at(t0()).await.unwrap();

        assert_eq!(token, "password-access");
        assert_eq!(manager.endpoint().calls(), (0, 1));
        assert_eq!(manager.store().save_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_server_error_is_fatal() {
        let manager = TokenManager::new(
            MemoryTokenStore::with_record(record(t0())),
            ScriptedEndpoint::new(
                Err(GrantError::Rejected {
                    status: 503,
                    body: "maintenance".to_string(),
                }),
                Ok(grant("password-access", "password-refresh", 600)),
            ),
            credentials(),
        );

        let err = manager
            .get_access_token_at(t0() + Duration::seconds(1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AuthError::Transport {
                stage: GrantStage::Refresh,
                ..
            }
        ));
        assert!(err.to_string().contains("503"));
        assert_eq!(manager.endpoint().calls(), (1, 0));
        assert_eq!(manager.store().save_count(), 0);
    }

    #[tokio::test]
    async fn test_password_rejection_is_authentication_error() {
        let manager = TokenManager::new(
            MemoryTokenStore::new(),
            ScriptedEndpoint::new(
                Err(GrantError::Network("must not be called".to_string())),
                Err(GrantError::Rejected {
                    status: 401,
                    body: "bad credentials".to_string(),
                }),
            ),
            credentials(),
        );

        match manager.get_access_token_at(t0()).await {
            Err(AuthError::Authentication {
                stage,
                status,
                body,
            }) => {
                assert_eq!(stage, GrantStage::Password);
                assert_eq!(status, 401);
                assert_eq!(body, "bad credentials");
            }
            other => panic!("expected authentication error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_password_invalid_grant_is_not_retried() {
        let manager = TokenManager::new(
            MemoryTokenStore::with_record(record(t0())),
            ScriptedEndpoint::new(
                Err(GrantError::InvalidGrant {
                    status: 400,
                    body: "invalid_grant".to_string(),
                }),
                Err(GrantError::InvalidGrant {
                    status: 400,
                    body: "invalid_grant".to_string(),
                }),
            ),
            credentials(),
        );

        let err = manager
            .get_access_token_at(t0() + Duration::seconds(1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AuthError::Authentication {
                stage: GrantStage::Password,
                status: 400,
                ..
            }
        ));
        assert_eq!(manager.endpoint().calls(), (1, 1));
    }

    #[tokio::test]
    async fn test_password_network_failure_is_transport_error() {
        let manager = TokenManager::new(
            MemoryTokenStore::new(),
            ScriptedEndpoint::unreachable(),
            credentials(),
        );

        let err = manager.get_access_token_at(t0()).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::Transport {
                stage: GrantStage::Password,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unresolvable_credentials_skip_network() {
        struct NoCredentials;

        impl CredentialsProvider for NoCredentials {
            fn resolve(&self) -> Result<Credentials> {
                Err(AuthError::Credentials {
                    stage: GrantStage::Password,
                    message: "none configured".to_string(),
                })
            }

            fn client_identity(&self) -> Result<ClientIdentity> {
                self.resolve()?.client_identity()
            }
        }

        let manager = TokenManager::new(
            MemoryTokenStore::new(),
            ScriptedEndpoint::unreachable(),
            NoCredentials,
        );

        let err = manager.get_access_token_at(t0()).await.unwrap_err();
        assert!(matches!(err, AuthError::Credentials { .. }));
        assert_eq!(manager.endpoint().calls(), (0, 0));
    }

    #[tokio::test]
    async fn test_failed_save_still_returns_token() {
        let manager = TokenManager::new(
            ReadOnlyStore(None),
            ScriptedEndpoint::new(
                Err(GrantError::Network("must not be called".to_string())),
                Ok(grant("password-access", "password-refresh", 600)),
            ),
            credentials(),
        );

        let token = manager.get_access_token_at(t0()).await.unwrap();
        assert_eq!(token, "password-access");
    }

    #[tokio::test]
    async fn test_response_extras_are_persisted() {
        let mut response = grant("access", "refresh", 300);
        response
            .extra
            .insert("scope".to_string(), serde_json::Value::from("trapi"));

        let manager = TokenManager::new(
            MemoryTokenStore::new(),
            ScriptedEndpoint::new(Err(GrantError::Network("unused".to_string())), Ok(response)),
            credentials(),
        );
        manager.get_access_token_at(t0()).await.unwrap();

        let stored = manager.store().load().unwrap();
        assert_eq!(
            stored.extra.get("scope"),
            Some(&serde_json::Value::from("trapi"))
        );
    }

    #[test]
    fn test_status() {
        let manager = TokenManager::new(
            MemoryTokenStore::new(),
            ScriptedEndpoint::unreachable(),
            credentials(),
        );
        assert_eq!(manager.status(t0()), TokenStatus::Absent);

        let expiry = t0() + Duration::seconds(60);
        manager.store().save(&record(expiry)).unwrap();
        assert_eq!(
            manager.status(t0()),
            TokenStatus::Valid { expires_at: expiry }
        );
        assert_eq!(
            manager.status(expiry),
            TokenStatus::Expired { expired_at: expiry }
        );
        assert_eq!(manager.endpoint().calls(), (0, 0));
    }

    proptest! {
        #[test]
        fn prop_future_expiry_is_served_from_cache(
            remaining in 1i64..10_000_000,
            elapsed in 0i64..10_000_000,
        ) {
            let now = t0() + Duration::seconds(elapsed);
            let manager = TokenManager::new(
                MemoryTokenStore::with_record(record(now + Duration::seconds(remaining))),
                ScriptedEndpoint::unreachable(),
                credentials(),
            );

            let token = tokio_test::block_on(manager.get_access_token_at(now)).unwrap();

            prop_assert_eq!(token, "cached-access");
            prop_assert_eq!(manager.endpoint().calls(), (0, 0));
        }

        #[test]
        fn prop_saved_expiry_is_now_plus_lifetime_minus_margin(
            expires_in in 0u64..1_000_000,
            elapsed in 0i64..10_000_000,
        ) {
            let now = t0() + Duration::seconds(elapsed);
            let manager = TokenManager::new(
                MemoryTokenStore::new(),
                ScriptedEndpoint::new(
                    Err(GrantError::Network("unused".to_string())),
                    Ok(grant("access", "refresh", expires_in)),
                ),
                credentials(),
            );

            tokio_test::block_on(manager.get_access_token_at(now)).unwrap();

            let stored = manager.store().load().unwrap();
            prop_assert_eq!(
                stored.expiry_tm,
                now + Duration::seconds(expires_in as i64 - EXPIRY_MARGIN_SECS)
            );
            prop_assert_eq!(stored.expires_in, expires_in);
        }
    }
}
