//! Collaborator interfaces for token storage and guest identities

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;
use uuid::Uuid;

/// Persistent token storage owned by the application
pub trait CredentialStore: Send + Sync {
    fn access_token(&self) -> Option<String>;

    fn set_access_token(&self, token: &str);

    fn refresh_token(&self) -> Option<String>;
}

/// Mints and recognizes locally generated guest tokens
pub trait GuestIdentity: Send + Sync {
    fn generate_guest_token(&self) -> String;

    fn is_guest_token(&self, token: &str) -> bool;
}

/// Exchanges a refresh token for a new access token
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<String>;
}

/// In-process credential store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    access: Mutex<Option<String>>,
    refresh: Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with tokens
    pub fn with_tokens(access: Option<String>, refresh: Option<String>) -> Self {
        Self {
            access: Mutex::new(access),
            refresh: Mutex::new(refresh),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn access_token(&self) -> Option<String> {
        self.access.lock().ok()?.clone()
    }

    fn set_access_token(&self, token: &str) {
        if let Ok(mut access) = self.access.lock() {
            *access = Some(token.to_string());
        }
    }

    fn refresh_token(&self) -> Option<String> {
        self.refresh.lock().ok()?.clone()
    }
}

/// Guest tokens of the form `<prefix><uuid>`
#[derive(Debug, Clone)]
pub struct PrefixGuestIdentity {
    prefix: String,
}

impl PrefixGuestIdentity {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for PrefixGuestIdentity {
    fn default() -> Self {
        Self::new("guest_")
    }
}

impl GuestIdentity for PrefixGuestIdentity {
    fn generate_guest_token(&self) -> String {
        format!("{}{}", self.prefix, Uuid::new_v4().simple())
    }

    fn is_guest_token(&self, token: &str) -> bool {
        token.starts_with(&self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryCredentialStore::with_tokens(None, Some("r-1".into()));
        assert_eq!(store.access_token(), None);

        store.set_access_token("a-1");
        assert_eq!(store.access_token().as_deref(), Some("a-1"));
        assert_eq!(store.refresh_token().as_deref(), Some("r-1"));
    }

    #[test]
    fn test_guest_tokens_are_unique_and_recognized() {
        let guests = PrefixGuestIdentity::default();
        let a = guests.generate_guest_token();
        let b = guests.generate_guest_token();

        assert_ne!(a, b);
        assert!(guests.is_guest_token(&a));
        assert!(!guests.is_guest_token("eyJhbGciOi.primary"));
    }
}
