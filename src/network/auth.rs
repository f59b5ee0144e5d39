//! Token Authentication
//!
//! Connections prove who they are with an HS256 JWT minted by the account
//! service. The server only verifies tokens. A verified token yields the
//! [`UserId`] that game seats are bound to.

use std::collections::HashSet;
use std::time::Duration;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::ids::UserId;

/// Token validation settings.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Required `iss`, if set.
    pub issuer: Option<String>,
    /// Required `aud`, if set.
    pub audience: Option<String>,
    /// Shared HS256 secret.
    pub secret: Option<String>,
    /// Clock skew tolerated on `exp`.
    pub leeway: Duration,
    /// With no secret configured, treat the raw token as the user id.
    /// Local development only.
    pub allow_anonymous: bool,
}

impl AuthConfig {
    /// Whether tokens can be verified at all.
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        // exp is checked when present; tokens without one never expire
        validation.required_spec_claims = HashSet::new();
        validation.leeway = self.leeway.as_secs();
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        validation
    }
}

/// Claims the server reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Account id at the issuer.
    pub sub: String,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Expiry (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

impl TokenClaims {
    /// Stable user id for an issuer and subject pair.
    ///
    /// Two issuers handing out the same `sub` map to different users.
    pub fn user_id(&self) -> UserId {
        let mut hasher = Sha256::new();
        hasher.update(b"tycoon-user:");
        hasher.update(self.iss.as_deref().unwrap_or_default().as_bytes());
        hasher.update(b":");
        hasher.update(self.sub.as_bytes());
        UserId::new(hex::encode(&hasher.finalize()[..16]))
    }
}

/// Why a token was refused.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No secret to verify with.
    #[error("authentication not configured")]
    NotConfigured,
    /// Not a JWT.
    #[error("invalid token format")]
    InvalidFormat,
    /// Signed with another key.
    #[error("invalid signature")]
    InvalidSignature,
    /// Past `exp` plus leeway.
    #[error("token expired")]
    Expired,
    /// `iss` mismatch.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// `aud` mismatch.
    #[error("invalid audience")]
    InvalidAudience,
    /// Claim absent or blank.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Anything else the decoder refused.
    #[error("decode error: {0}")]
    DecodeError(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
            ErrorKind::InvalidAudience => AuthError::InvalidAudience,
            ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                AuthError::InvalidFormat
            }
            _ => AuthError::DecodeError(err.to_string()),
        }
    }
}

/// Verify a token and return its claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let Some(secret) = &config.secret else {
        return Err(AuthError::NotConfigured);
    };
    let key = DecodingKey::from_secret(secret.as_bytes());
    let claims = decode::<TokenClaims>(token, &key, &config.validation())?.claims;
    if claims.sub.trim().is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }
    Ok(claims)
}

/// Resolve a connection token to the user it speaks for.
pub fn authenticate(token: &str, config: &AuthConfig) -> Result<UserId, AuthError> {
    if !config.is_configured() && config.allow_anonymous {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingClaim("sub".into()));
        }
        return Ok(UserId::new(token));
    }
    validate_token(token, config).map(|claims| claims.user_id())
}
