//! Authentication collaborator.
//!
//! The sync core only needs `verify(token) -> user`. Tokens are
//! HMAC-SHA256 signed strings of the form
//! `user_id.client_id.expires_at.signature`, so a token pins both the
//! owning user and the device the client syncs from.

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims {
    pub user_id: i64,
    pub client_id: String,
}

/// Verification errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
}

/// Seam the supervisor and HTTP surface authenticate through.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<AuthClaims, AuthError>;
}

/// An authenticated device session.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: i64,
    pub client_id: String,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Token issuing and verification service.
pub struct AuthService {
    secret: Vec<u8>,
    /// Issued sessions keyed by token.
    sessions: DashMap<String, Session>,
}

impl AuthService {
    /// Create a service with the given signing secret, or a random one.
    pub fn new(secret: Option<String>) -> Self {
        let secret = match secret {
            Some(s) => s.into_bytes(),
            None => {
                let random: [u8; 32] = rand::random();
                warn!("AUTH_SECRET not configured; using a process-local random secret");
                random.to_vec()
            }
        };
        Self {
            secret,
            sessions: DashMap::new(),
        }
    }

    fn sign(&self, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Issue a token for a user's device, valid for `ttl_ms`.
    pub fn issue_token(&self, user_id: i64, client_id: &str, ttl_ms: i64) -> String {
        let now = chrono::Utc::now().timestamp_millis();
        let expires_at = now + ttl_ms;
        let body = format!("{}.{}.{}", user_id, client_id, expires_at);
        let token = format!("{}.{}", body, self.sign(&body));

        self.sessions.insert(
            token.clone(),
            Session {
                token: token.clone(),
                user_id,
                client_id: client_id.to_string(),
                created_at: now,
                expires_at,
            },
        );
        debug!("Issued token for user {} client {}", user_id, client_id);
        token
    }

    /// Invalidate a session.
    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    /// Number of live sessions (expired ones are pruned lazily).
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl TokenVerifier for AuthService {
    fn verify(&self, token: &str) -> Result<AuthClaims, AuthError> {
        // user_id.client_id.expires_at.signature, client_id may not contain '.'
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 4 {
            return Err(AuthError::Malformed);
        }
        let user_id: i64 = parts[0].parse().map_err(|_| AuthError::Malformed)?;
        let client_id = parts[1].to_string();
        let expires_at: i64 = parts[2].parse().map_err(|_| AuthError::Malformed)?;

        let body = format!("{}.{}.{}", user_id, client_id, expires_at);
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(body.as_bytes());
        let signature = hex::decode(parts[3]).map_err(|_| AuthError::InvalidSignature)?;
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let now = chrono::Utc::now().timestamp_millis();
        if now >= expires_at {
            self.sessions.remove(token);
            return Err(AuthError::Expired);
        }

        Ok(AuthClaims { user_id, client_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify_round_trip() {
        let auth = AuthService::new(Some("secret".to_string()));
        let token = auth.issue_token(7, "web-1", 60_000);

        let claims = auth.verify(&token).unwrap();
        assert_eq!(claims.user_id, 7);
        assert_eq!(claims.client_id, "web-1");
    }

    #[test]
    fn test_tampered_token_rejected() {
        let auth = AuthService::new(Some("secret".to_string()));
        let token = auth.issue_token(7, "web-1", 60_000);
        let tampered = token.replacen('7', "8", 1);

        assert_eq!(auth.verify(&tampered), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn test_expired_token_rejected() {
        let auth = AuthService::new(Some("secret".to_string()));
        let token = auth.issue_token(7, "web-1", -1);

        assert_eq!(auth.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = AuthService::new(Some("one".to_string()));
        let verifier = AuthService::new(Some("two".to_string()));
        let token = issuer.issue_token(7, "web-1", 60_000);

        assert_eq!(verifier.verify(&token), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn test_malformed_token_rejected() {
        let auth = AuthService::new(Some("secret".to_string()));
        assert_eq!(auth.verify("not-a-token"), Err(AuthError::Malformed));
    }
}
