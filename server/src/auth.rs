//! Token policy for the reference backend

use std::collections::HashSet;
use tether_shared::{now_ms, AuthErrorCode, AuthErrorInfo};

/// Who a validated token belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub is_guest: bool,
}

/// Decides which handshake tokens are accepted
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    accepted: Vec<String>,
    expired: HashSet<String>,
    guest_prefix: String,
}

impl AuthPolicy {
    pub fn new(accepted: Vec<String>, expired: Vec<String>) -> Self {
        Self {
            accepted,
            expired: expired.into_iter().collect(),
            guest_prefix: "guest_".into(),
        }
    }

    pub fn with_guest_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.guest_prefix = prefix.into();
        self
    }

    /// Validate the token carried by an `auth` frame
    pub fn validate(&self, token: Option<&str>) -> Result<Identity, AuthErrorInfo> {
        let token = match token {
            Some(token) if !token.is_empty() => token,
            _ => return Err(reject(AuthErrorCode::Required, "authentication token required")),
        };

        if let Some(index) = self.accepted.iter().position(|t| t == token) {
            return Ok(Identity {
                user_id: format!("user-{}", index + 1),
                is_guest: false,
            });
        }

        if token.starts_with(&self.guest_prefix) && token.len() > self.guest_prefix.len() {
            return Ok(Identity {
                user_id: token.to_string(),
                is_guest: true,
            });
        }

        if self.expired.contains(token) {
            return Err(reject(AuthErrorCode::Expired, "authentication token expired"));
        }

        Err(reject(AuthErrorCode::Invalid, "authentication token invalid"))
    }
}

fn reject(code: AuthErrorCode, message: &str) -> AuthErrorInfo {
    AuthErrorInfo {
        code,
        message: message.to_string(),
        timestamp: Some(now_ms()),
    }
}
