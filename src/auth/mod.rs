//! Authentication for the connection handshake
//!
//! This module handles:
//! - Choosing the credential attached to each connection attempt
//! - Resolving backend auth failures (token refresh or guest fallback)
//! - The storage and guest-identity collaborator interfaces

mod credential;
mod negotiator;
mod store;

pub use credential::{Credential, CredentialKind};
pub use negotiator::{AuthNegotiator, AuthResolution};
pub use store::{CredentialStore, GuestIdentity, MemoryCredentialStore, PrefixGuestIdentity, TokenRefresher};
