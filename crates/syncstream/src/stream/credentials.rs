//! Credential access for authenticated stream connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use secrecy::SecretString;

/// Bearer token plus tenant identifier sent when a stream is opened.
#[derive(Debug)]
pub struct Credentials {
    pub token: SecretString,
    pub organization_id: Option<String>,
}

impl Credentials {
    pub fn new(token: &str, organization_id: Option<&str>) -> Self {
        Self {
            token: SecretString::from(token.to_string()),
            organization_id: organization_id.map(|s| s.to_string()),
        }
    }
}

/// Source of the current credentials.
///
/// Token issuance and refresh live outside this crate; the engine only reads
/// the current value and reports when the server rejected it.
pub trait CredentialProvider: Send + Sync {
    /// Returns the current credentials, or `None` when signed out.
    fn credentials(&self) -> Option<Credentials>;

    /// Called after the server answered 401/403 for these credentials.
    fn invalidate(&self);
}

/// Fixed credentials, mainly for tests and command-line use.
///
/// `invalidate` clears the token so later connections fail fast.
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
    organization_id: Option<String>,
    invalidations: AtomicUsize,
}

impl StaticCredentials {
    pub fn new(token: &str, organization_id: Option<&str>) -> Self {
        Self {
            token: RwLock::new(Some(token.to_string())),
            organization_id: organization_id.map(|s| s.to_string()),
            invalidations: AtomicUsize::new(0),
        }
    }

    /// How many times the credentials were invalidated.
    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::Acquire)
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self) -> Option<Credentials> {
        let guard = match self.token.read() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Credential lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard
            .as_deref()
            .map(|token| Credentials::new(token, self.organization_id.as_deref()))
    }

    fn invalidate(&self) {
        let mut guard = match self.token.write() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Credential lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        *guard = None;
        self.invalidations.fetch_add(1, Ordering::AcqRel);
    }
}
