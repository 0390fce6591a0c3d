//! Auth negotiator - picks the handshake credential and resolves auth failures

use super::{Credential, CredentialStore, GuestIdentity, TokenRefresher};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tether_shared::{now_ms, timing, AuthErrorCode, AuthErrorInfo};
use tokio::time::timeout;
use tracing::{info, warn};

/// How an auth failure was resolved for the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResolution {
    /// The refresh token was exchanged for a new primary token
    Refreshed,
    /// A new guest token was minted and persisted
    GuestFallback,
}

/// Supplies credentials and recovers from rejected ones
pub struct AuthNegotiator {
    store: Arc<dyn CredentialStore>,
    guest: Arc<dyn GuestIdentity>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    refresh_timeout: Duration,
    /// Credential used by the most recent attempt
    current: Option<Credential>,
}

impl AuthNegotiator {
    /// Create a negotiator without a token refresher
    pub fn new(store: Arc<dyn CredentialStore>, guest: Arc<dyn GuestIdentity>) -> Self {
        Self {
            store,
            guest,
            refresher: None,
            refresh_timeout: Duration::from_millis(timing::REFRESH_TIMEOUT_MS),
            current: None,
        }
    }

    /// Enable refresh-token exchange for `AUTH_EXPIRED`
    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub(crate) fn set_refresh_timeout(&mut self, refresh_timeout: Duration) {
        self.refresh_timeout = refresh_timeout;
    }

    /// Credential used by the most recent attempt
    pub fn current(&self) -> Option<&Credential> {
        self.current.as_ref()
    }

    /// Credential for the next connection attempt
    ///
    /// Reads the stored access token; if there is none, a guest token is
    /// minted and persisted first.
    pub fn credential(&mut self) -> Credential {
        let credential = match self.store.access_token() {
            Some(token) if self.guest.is_guest_token(&token) => Credential::guest(token),
            Some(token) => Credential::primary(token),
            None => {
                info!("No stored access token, using a guest identity");
                self.mint_guest()
            }
        };

        self.current = Some(credential.clone());
        credential
    }

    /// Resolve an auth failure so the next attempt carries a usable credential
    pub async fn resolve_failure(&mut self, failure: &AuthErrorInfo) -> AuthResolution {
        let used = self.current.as_ref().map(|c| c.kind);
        warn!(
            code = %failure.code,
            message = %failure.message,
            credential = ?used,
            timestamp = failure.timestamp.unwrap_or_else(now_ms),
            "Authentication rejected"
        );

        if failure.code == AuthErrorCode::Expired {
            match self.exchange_refresh_token().await {
                Ok(token) => {
                    self.store.set_access_token(&token);
                    self.current = Some(Credential::primary(token));
                    info!("Access token refreshed");
                    return AuthResolution::Refreshed;
                }
                Err(e) => {
                    warn!("Token refresh failed, falling back to guest: {}", e);
                }
            }
        }

        // AUTH_REQUIRED, AUTH_INVALID, unknown codes and failed refreshes
        self.mint_guest();
        AuthResolution::GuestFallback
    }

    async fn exchange_refresh_token(&self) -> Result<String> {
        let refresh_token = self
            .store
            .refresh_token()
            .ok_or_else(|| anyhow!("no refresh token stored"))?;

        let refresher = self
            .refresher
            .as_ref()
            .ok_or_else(|| anyhow!("token refresh unavailable"))?;

        timeout(self.refresh_timeout, refresher.refresh(&refresh_token))
            .await
            .map_err(|_| anyhow!("token refresh timed out after {:?}", self.refresh_timeout))?
    }

    fn mint_guest(&mut self) -> Credential {
        let token = self.guest.generate_guest_token();
        self.store.set_access_token(&token);
        info!("Guest credential generated and persisted");

        let credential = Credential::guest(token);
        self.current = Some(credential.clone());
        credential
    }
}

impl std::fmt::Debug for AuthNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthNegotiator")
            .field("current", &self.current)
            .field("has_refresher", &self.refresher.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialKind;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Store and guest identity that log every call into a shared journal
    #[derive(Default)]
    struct Journal {
        calls: Mutex<Vec<String>>,
        access: Mutex<Option<String>>,
        refresh: Mutex<Option<String>>,
    }

    impl Journal {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    impl CredentialStore for Journal {
        fn access_token(&self) -> Option<String> {
            self.record("access_token");
            self.access.lock().unwrap().clone()
        }

        fn set_access_token(&self, token: &str) {
            self.record(&format!("set_access_token:{}", token));
            *self.access.lock().unwrap() = Some(token.to_string());
        }

        fn refresh_token(&self) -> Option<String> {
            self.record("refresh_token");
            self.refresh.lock().unwrap().clone()
        }
    }

    impl GuestIdentity for Journal {
        fn generate_guest_token(&self) -> String {
            self.record("generate_guest_token");
            "guest_fixed".to_string()
        }

        fn is_guest_token(&self, token: &str) -> bool {
            token.starts_with("guest_")
        }
    }

    struct StaticRefresher(Result<&'static str, &'static str>);

    #[async_trait]
    impl TokenRefresher for StaticRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<String> {
            self.0.map(str::to_string).map_err(|e| anyhow!(e))
        }
    }

    struct StalledRefresher;

    #[async_trait]
    impl TokenRefresher for StalledRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<String> {
            std::future::pending().await
        }
    }

    fn failure(code: &str) -> AuthErrorInfo {
        AuthErrorInfo {
            code: AuthErrorCode::from(code),
            message: "rejected".into(),
            timestamp: None,
        }
    }

    fn negotiator(journal: &Arc<Journal>) -> AuthNegotiator {
        AuthNegotiator::new(journal.clone(), journal.clone())
    }

    fn position(calls: &[String], name: &str) -> Option<usize> {
        calls.iter().position(|c| c.starts_with(name))
    }

    #[test]
    fn test_stored_token_is_classified() {
        let journal = Arc::new(Journal::default());
        let mut auth = negotiator(&journal);

        *journal.access.lock().unwrap() = Some("jwt-primary".into());
        assert_eq!(auth.credential().kind, CredentialKind::Primary);

        *journal.access.lock().unwrap() = Some("guest_abc".into());
        assert_eq!(auth.credential().kind, CredentialKind::Guest);
        assert!(auth.current().unwrap().kind.is_guest());
    }

    #[test]
    fn test_missing_token_mints_and_persists_guest() {
        let journal = Arc::new(Journal::default());
        let mut auth = negotiator(&journal);

        let credential = auth.credential();
        assert_eq!(credential, Credential::guest("guest_fixed"));
        assert_eq!(journal.access.lock().unwrap().as_deref(), Some("guest_fixed"));
    }

    #[tokio::test]
    async fn test_expired_looks_up_refresh_before_guest() {
        let journal = Arc::new(Journal::default());
        *journal.refresh.lock().unwrap() = Some("r-1".into());
        let mut auth = negotiator(&journal);

        let resolution = auth.resolve_failure(&failure("AUTH_EXPIRED")).await;
        assert_eq!(resolution, AuthResolution::GuestFallback);

        let calls = journal.calls();
        let lookup = position(&calls, "refresh_token").expect("refresh lookup");
        let guest = position(&calls, "generate_guest_token").expect("guest minted");
        assert!(lookup < guest);
        assert!(calls.contains(&"set_access_token:guest_fixed".to_string()));
    }

    #[tokio::test]
    async fn test_expired_with_refresher_keeps_primary() {
        let journal = Arc::new(Journal::default());
        *journal.refresh.lock().unwrap() = Some("r-1".into());
        let mut auth =
            negotiator(&journal).with_refresher(Arc::new(StaticRefresher(Ok("jwt-new"))));

        let resolution = auth.resolve_failure(&failure("AUTH_EXPIRED")).await;
        assert_eq!(resolution, AuthResolution::Refreshed);
        assert_eq!(auth.current(), Some(&Credential::primary("jwt-new")));
        assert!(position(&journal.calls(), "generate_guest_token").is_none());
        assert_eq!(auth.credential(), Credential::primary("jwt-new"));
    }

    #[tokio::test]
    async fn test_failed_refresh_falls_back_to_guest() {
        let journal = Arc::new(Journal::default());
        *journal.refresh.lock().unwrap() = Some("r-1".into());
        let mut auth = negotiator(&journal).with_refresher(Arc::new(StaticRefresher(Err("401"))));

        let resolution = auth.resolve_failure(&failure("AUTH_EXPIRED")).await;
        assert_eq!(resolution, AuthResolution::GuestFallback);
        assert_eq!(auth.current(), Some(&Credential::guest("guest_fixed")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_refresh_times_out_into_guest() {
        let journal = Arc::new(Journal::default());
        *journal.refresh.lock().unwrap() = Some("r-1".into());
        let mut auth = negotiator(&journal).with_refresher(Arc::new(StalledRefresher));
        auth.set_refresh_timeout(Duration::from_secs(2));

        let resolution = auth.resolve_failure(&failure("AUTH_EXPIRED")).await;
        assert_eq!(resolution, AuthResolution::GuestFallback);
    }

    #[tokio::test]
    async fn test_required_and_invalid_skip_refresh_lookup() {
        for code in ["AUTH_REQUIRED", "AUTH_INVALID", "AUTH_SOMETHING_NEW"] {
            let journal = Arc::new(Journal::default());
            *journal.refresh.lock().unwrap() = Some("r-1".into());
            let mut auth =
                negotiator(&journal).with_refresher(Arc::new(StaticRefresher(Ok("jwt-new"))));

            let resolution = auth.resolve_failure(&failure(code)).await;
            assert_eq!(resolution, AuthResolution::GuestFallback, "{}", code);

            let calls = journal.calls();
            assert!(position(&calls, "refresh_token").is_none(), "{}: {:?}", code, calls);
            assert!(position(&calls, "generate_guest_token").is_some());
        }
    }
}
