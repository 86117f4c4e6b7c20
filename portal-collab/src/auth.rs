//! Bearer-token authentication and room access policy.
//!
//! Tokens are HS256 JWTs carrying the user id, workspace id and display
//! name. A verified token yields an [`Identity`]; whether that identity may
//! enter a room is decided by an [`AccessPolicy`].

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::error::{CollabError, CollabResult};

/// Role name granting administrative access.
pub const ADMIN_ROLE: &str = "admin";

/// Verified caller identity attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub workspace_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub role: String,
}

impl Identity {
    pub fn new(
        user_id: impl Into<String>,
        workspace_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
            display_name: display_name.into(),
            avatar: None,
            role: "member".to_string(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }
}

/// JWT claims embedded in every access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    /// Subject: the user id.
    pub sub: String,
    pub workspace_id: String,
    /// Display name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub role: String,
    /// Expiration time (UTC Unix timestamp).
    pub exp: u64,
}

impl From<Claims> for Identity {
    fn from(c: Claims) -> Self {
        Self {
            user_id: c.sub,
            workspace_id: c.workspace_id,
            display_name: c.name,
            avatar: c.avatar,
            role: c.role,
        }
    }
}

/// Signs and validates access tokens with a shared HMAC secret.
#[derive(Clone)]
pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier").finish_non_exhaustive()
    }
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate signature and expiry, returning the embedded identity.
    pub fn verify(&self, token: &str) -> CollabResult<Identity> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|e| CollabError::AuthRejected(e.to_string()))?;
        if data.claims.sub.is_empty() {
            return Err(CollabError::AuthRejected("token has no subject".into()));
        }
        Ok(data.claims.into())
    }

    /// Issue a token for `identity`, valid for `ttl`.
    pub fn issue(&self, identity: &Identity, ttl: Duration) -> CollabResult<String> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        let claims = Claims {
            sub: identity.user_id.clone(),
            workspace_id: identity.workspace_id.clone(),
            name: identity.display_name.clone(),
            avatar: identity.avatar.clone(),
            role: identity.role.clone(),
            exp: (now + ttl).as_secs(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| CollabError::AuthRejected(e.to_string()))
    }
}

/// Token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Token from a `token=<value>` pair in a raw query string.
pub fn query_token(query: &str) -> Option<&str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "token")
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

/// Decides who may enter which room.
pub trait AccessPolicy: Send + Sync {
    fn can_access(&self, identity: &Identity, room_id: &str) -> bool;

    fn is_admin(&self, identity: &Identity) -> bool;
}

/// Rooms named `"<workspace>:<id>"` belong to that workspace; other room ids
/// are open to every authenticated user.
#[derive(Debug, Clone, Default)]
pub struct WorkspacePolicy;

impl AccessPolicy for WorkspacePolicy {
    fn can_access(&self, identity: &Identity, room_id: &str) -> bool {
        match room_id.split_once(':') {
            Some((workspace, _)) => workspace == identity.workspace_id,
            None => true,
        }
    }

    fn is_admin(&self, identity: &Identity) -> bool {
        identity.role == ADMIN_ROLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new("test-secret-that-is-long-enough-for-hmac")
    }

    #[test]
    fn test_issue_and_verify() {
        let v = verifier();
        let alice = Identity::new("u1", "ws1", "Alice");
        let token = v.issue(&alice, Duration::from_secs(300)).unwrap();
        assert_eq!(v.verify(&token).unwrap(), alice);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = verifier()
            .issue(&Identity::new("u1", "ws1", "Alice"), Duration::from_secs(300))
            .unwrap();
        let err = TokenVerifier::new("another-secret").verify(&token).unwrap_err();
        assert_eq!(err.code(), "AUTH_REJECTED");
    }

    #[test]
    fn test_expired_token_rejected() {
        let v = verifier();
        // Well past the default 60s leeway.
        let claims = Claims {
            sub: "u1".into(),
            workspace_id: "ws1".into(),
            name: "Alice".into(),
            avatar: None,
            role: String::new(),
            exp: 1_000,
        };
        let token = encode(&Header::default(), &claims, &v.encoding).unwrap();
        assert!(v.verify(&token).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(verifier().verify("not-a-jwt").is_err());
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc"), None);
    }

    #[test]
    fn test_query_token() {
        assert_eq!(query_token("token=abc"), Some("abc"));
        assert_eq!(query_token("room=r1&token=xyz"), Some("xyz"));
        assert_eq!(query_token("room=r1"), None);
        assert_eq!(query_token("token="), None);
    }

    #[test]
    fn test_workspace_policy() {
        let policy = WorkspacePolicy;
        let alice = Identity::new("u1", "ws1", "Alice");
        assert!(policy.can_access(&alice, "ws1:dashboard"));
        assert!(!policy.can_access(&alice, "ws2:dashboard"));
        assert!(policy.can_access(&alice, "lobby"));
        assert!(!policy.is_admin(&alice));
        assert!(policy.is_admin(&alice.with_role(ADMIN_ROLE)));
    }
}
