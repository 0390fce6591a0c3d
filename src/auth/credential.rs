//! Credentials attached to the handshake

/// Whether a credential identifies a signed-in user or a local guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Primary,
    Guest,
}

impl CredentialKind {
    pub fn is_guest(&self) -> bool {
        matches!(self, CredentialKind::Guest)
    }
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialKind::Primary => write!(f, "primary"),
            CredentialKind::Guest => write!(f, "guest"),
        }
    }
}

/// A token plus its kind
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub value: String,
    pub kind: CredentialKind,
}

impl Credential {
    pub fn primary(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: CredentialKind::Primary,
        }
    }

    pub fn guest(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: CredentialKind::Guest,
        }
    }
}

// Keep token values out of logs
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("value", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_value() {
        let credential = Credential::primary("secret-token");
        let printed = format!("{:?}", credential);
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("Primary"));
    }
}
