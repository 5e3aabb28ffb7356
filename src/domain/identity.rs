//! Identity Registry and Queue Guards
//!
//! Identities are static `(name, token)` pairs loaded once from the
//! configuration file. Each publisher and consumer route resolves its
//! allowlist of identity names into an [`IdentityGuard`] at startup, so a
//! request is checked against exactly the tokens that may touch that queue.
//!
//! Token comparison is constant-time. Missing headers against a restricted
//! queue fail exactly like a wrong token does, so probing for restricted
//! queues is no cheaper than probing for valid tokens.

use std::collections::HashMap;

use subtle::ConstantTimeEq;

/// A request failed the identity check. Always maps to HTTP 403.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("identity or token not accepted for this queue")]
pub struct Forbidden;

/// All identities known to the proxy, keyed by name.
///
/// Immutable after load. Tokens are kept out of `Debug` output.
#[derive(Clone, Default)]
pub struct IdentityRegistry {
    tokens: HashMap<String, String>,
}

impl std::fmt::Debug for IdentityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRegistry")
            .field("names", &self.tokens.keys().collect::<Vec<_>>())
            .field("tokens", &"[REDACTED]")
            .finish()
    }
}

impl IdentityRegistry {
    /// Build a registry from `(name, token)` pairs.
    ///
    /// Returns the duplicated name if two entries share one.
    pub fn new<I>(entries: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut tokens = HashMap::new();
        for (name, token) in entries {
            if tokens.insert(name.clone(), token).is_some() {
                return Err(name);
            }
        }
        Ok(Self { tokens })
    }

    /// Look up an identity's token.
    #[must_use]
    pub fn token(&self, name: &str) -> Option<&str> {
        self.tokens.get(name).map(String::as_str)
    }
}

/// Per-queue allowlist resolved against the registry.
#[derive(Clone, Default)]
pub struct IdentityGuard {
    allowed: HashMap<String, String>,
}

impl std::fmt::Debug for IdentityGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityGuard")
            .field("allowed", &self.allowed.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl IdentityGuard {
    /// Resolve a list of identity names into a guard.
    ///
    /// Returns the offending name if it is not in the registry; an unknown
    /// name in the configuration is a startup-fatal mistake, not something
    /// to discover on the first request.
    pub fn resolve(registry: &IdentityRegistry, names: &[String]) -> Result<Self, String> {
        let mut allowed = HashMap::new();
        for name in names {
            let token = registry.token(name).ok_or_else(|| name.clone())?;
            allowed.insert(name.clone(), token.to_string());
        }
        Ok(Self { allowed })
    }

    /// Whether this guard restricts access at all.
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        !self.allowed.is_empty()
    }

    /// Check a request's identity headers against the allowlist.
    ///
    /// An unrestricted guard accepts everything. A restricted guard requires
    /// both headers, a known name, and a token matching in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`Forbidden`] on any mismatch, including absent headers.
    pub fn authorize(
        &self,
        identity: Option<&str>,
        token: Option<&str>,
    ) -> Result<(), Forbidden> {
        if !self.is_restricted() {
            return Ok(());
        }

        let (Some(identity), Some(token)) = (identity, token) else {
            return Err(Forbidden);
        };

        let Some(expected) = self.allowed.get(identity) else {
            return Err(Forbidden);
        };

        if expected.as_bytes().ct_eq(token.as_bytes()).into() {
            Ok(())
        } else {
            Err(Forbidden)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> IdentityRegistry {
        IdentityRegistry::new(vec![
            (
                "Bob".to_string(),
                "THISisBOBSsuperSECRETauthToken123".to_string(),
            ),
            ("Alice".to_string(), "alices-token".to_string()),
        ])
        .unwrap()
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = IdentityRegistry::new(vec![
            ("Bob".to_string(), "a".to_string()),
            ("Bob".to_string(), "b".to_string()),
        ])
        .unwrap_err();
        assert_eq!(err, "Bob");
    }

    #[test]
    fn unrestricted_guard_allows_anonymous() {
        let guard = IdentityGuard::resolve(&registry(), &[]).unwrap();
        assert!(!guard.is_restricted());
        assert!(guard.authorize(None, None).is_ok());
        assert!(guard.authorize(Some("Eve"), Some("whatever")).is_ok());
    }

    #[test]
    fn restricted_guard_requires_both_headers() {
        let guard = IdentityGuard::resolve(&registry(), &["Bob".to_string()]).unwrap();
        assert_eq!(guard.authorize(None, None), Err(Forbidden));
        assert_eq!(guard.authorize(Some("Bob"), None), Err(Forbidden));
        assert_eq!(
            guard.authorize(None, Some("THISisBOBSsuperSECRETauthToken123")),
            Err(Forbidden)
        );
    }

    #[test]
    fn valid_identity_and_token_accepted() {
        let guard = IdentityGuard::resolve(&registry(), &["Bob".to_string()]).unwrap();
        assert!(
            guard
                .authorize(Some("Bob"), Some("THISisBOBSsuperSECRETauthToken123"))
                .is_ok()
        );
    }

    #[test]
    fn wrong_token_and_wrong_identity_rejected() {
        let guard = IdentityGuard::resolve(&registry(), &["Bob".to_string()]).unwrap();
        assert_eq!(
            guard.authorize(Some("Bob"), Some("not-bobs-token")),
            Err(Forbidden)
        );
        // Alice exists in the registry but is not on this queue's list.
        assert_eq!(
            guard.authorize(Some("Alice"), Some("alices-token")),
            Err(Forbidden)
        );
    }

    #[test]
    fn token_of_different_length_rejected() {
        let guard = IdentityGuard::resolve(&registry(), &["Bob".to_string()]).unwrap();
        assert_eq!(guard.authorize(Some("Bob"), Some("short")), Err(Forbidden));
    }

    #[test]
    fn unknown_name_fails_resolution() {
        let err = IdentityGuard::resolve(&registry(), &["Mallory".to_string()]).unwrap_err();
        assert_eq!(err, "Mallory");
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let registry = registry();
        let debug = format!("{registry:?}");
        assert!(!debug.contains("THISisBOBSsuperSECRETauthToken123"));
        assert!(debug.contains("[REDACTED]"));
    }
}
