//! Bearer-token lookup and storage.
//!
//! The stream and REST clients only need "a bearer token or absent" at the
//! moment a request goes out; `TokenProvider` is that seam. The backend
//! issues JWTs through the login endpoint, so most applications hold them
//! in a [`MemoryTokenStore`] shared between both clients.

use std::sync::RwLock;

use secrecy::SecretString;

/// Synchronous lookup of the current bearer token.
pub trait TokenProvider: Send + Sync {
    /// Returns the bearer token to attach to the next request, if any.
    fn bearer_token(&self) -> Option<SecretString>;
}

/// Provider that always yields the same token.
pub struct StaticToken {
    token: SecretString,
}

impl StaticToken {
    /// Wraps a fixed bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::new(token.into()),
        }
    }
}

impl TokenProvider for StaticToken {
    fn bearer_token(&self) -> Option<SecretString> {
        Some(self.token.clone())
    }
}

/// Provider for unauthenticated access; never yields a token.
pub struct Anonymous;

impl TokenProvider for Anonymous {
    fn bearer_token(&self) -> Option<SecretString> {
        None
    }
}

/// In-memory credential store shared between clients.
///
/// [`RestApiClient`](crate::rest_api::RestApiClient) writes to the store on
/// login and clears it on logout or a rejected token; stream sessions read
/// from it on every connection attempt so a re-login is picked up without
/// rebuilding the client.
#[derive(Default)]
pub struct MemoryTokenStore {
    token: RwLock<Option<SecretString>>,
}

impl MemoryTokenStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored token.
    pub fn store(&self, token: SecretString) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token);
        }
    }

    /// Removes the stored token.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.token.write() {
            *guard = None;
        }
    }

    /// Returns whether a token is currently stored.
    pub fn is_authenticated(&self) -> bool {
        self.token
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }
}

impl TokenProvider for MemoryTokenStore {
    fn bearer_token(&self) -> Option<SecretString> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }
}
