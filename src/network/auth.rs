//! Join Authentication
//!
//! Optional JWT check on join. When no key is configured the server accepts
//! anonymous joins; otherwise every join must carry a token issued by the
//! external auth provider. The server never issues tokens itself.

use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format.
    pub public_key_pem: Option<String>,
    /// HS256 secret.
    pub secret: Option<String>,
    /// Skip expiry validation (local testing only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: std::env::var("AUTH_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// True if joins must be authenticated.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Claims we read from the provider's token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject, the provider's user id.
    pub sub: String,
    /// Display name, if the provider includes one.
    #[serde(default)]
    pub name: Option<String>,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

impl TokenClaims {
    /// Name to show in game: the token's name, else the subject.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(self.sub.as_str())
    }

    /// Short stable key for logs that does not expose the subject.
    pub fn account_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"candy-chase-account:");
        hasher.update(self.sub.as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No key configured on the server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Join carried no token but one is required.
    #[error("token required")]
    MissingToken,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer mismatch.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience mismatch.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Other decode failure.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Check a join token.
///
/// Returns `Ok(None)` for an anonymous join on a server without auth, and
/// the validated claims otherwise.
pub fn authenticate_join(token: Option<&str>, config: &AuthConfig) -> Result<Option<TokenClaims>, AuthError> {
    if !config.is_configured() {
        if token.is_some() {
            debug!("token ignored, auth not configured");
        }
        return Ok(None);
    }
    let token = token.ok_or(AuthError::MissingToken)?;
    validate_token(token, config).map(Some)
}

/// Validate a JWT and extract its claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let algorithm = if config.public_key_pem.is_some() {
        Algorithm::RS256
    } else if config.secret.is_some() {
        Algorithm::HS256
    } else {
        return Err(AuthError::NotConfigured);
    };

    let mut validation = Validation::new(algorithm);
    validation.required_spec_claims = std::collections::HashSet::new();
    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }
    match config.audience {
        Some(ref audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }
    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let key = match (&config.public_key_pem, &config.secret) {
        (Some(pem), _) => DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e)))?,
        (None, Some(secret)) => DecodingKey::from_secret(secret.as_bytes()),
        (None, None) => return Err(AuthError::NotConfigured),
    };
    let token_data: TokenData<TokenClaims> = decode(token, &key, &validation).map_err(map_jwt_error)?;
    let claims = token_data.claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }

    // exp = 0 means the provider sent no expiry
    if !config.skip_expiry && claims.exp > 0 {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if now > claims.exp {
            return Err(AuthError::Expired);
        }
    }

    Ok(claims)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "candy-secret-key-256-bits-long!";

    fn token(claims: &TokenClaims, secret: &str) -> String {
        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&Header::new(Algorithm::HS256), claims, &key).unwrap()
    }

    fn claims() -> TokenClaims {
        let now = chrono::Utc::now().timestamp() as u64;
        TokenClaims {
            sub: "kid-42".into(),
            name: Some("Mia".into()),
            exp: now + 3600,
            iat: now,
            iss: Some("test-issuer".into()),
            aud: Some(serde_json::json!("candy")),
        }
    }

    fn secret_config() -> AuthConfig {
        AuthConfig { secret: Some(SECRET.into()), ..Default::default() }
    }

    #[test]
    fn test_anonymous_join_without_auth() {
        let config = AuthConfig::default();
        assert!(authenticate_join(None, &config).unwrap().is_none());
        assert!(authenticate_join(Some("whatever"), &config).unwrap().is_none());
    }

    #[test]
    fn test_token_required_when_configured() {
        assert!(matches!(
            authenticate_join(None, &secret_config()),
            Err(AuthError::MissingToken)
        ));
    }

    #[test]
    fn test_valid_token() {
        let jwt = token(&claims(), SECRET);
        let validated = authenticate_join(Some(&jwt), &secret_config()).unwrap().unwrap();
        assert_eq!(validated.sub, "kid-42");
        assert_eq!(validated.display_name(), "Mia");
    }

    #[test]
    fn test_expired_token_rejected() {
        let mut c = claims();
        c.exp = 1;
        let jwt = token(&c, SECRET);
        assert!(matches!(validate_token(&jwt, &secret_config()), Err(AuthError::Expired)));

        let lenient = AuthConfig { skip_expiry: true, ..secret_config() };
        assert!(validate_token(&jwt, &lenient).is_ok());
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let jwt = token(&claims(), "some-other-secret-key-entirely!");
        assert!(matches!(
            validate_token(&jwt, &secret_config()),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn test_missing_sub_rejected() {
        let mut c = claims();
        c.sub = String::new();
        let jwt = token(&c, SECRET);
        assert!(matches!(validate_token(&jwt, &secret_config()), Err(AuthError::MissingClaim(_))));
    }

    #[test]
    fn test_issuer_validation() {
        let jwt = token(&claims(), SECRET);
        let config = AuthConfig { issuer: Some("wrong-issuer".into()), ..secret_config() };
        assert!(matches!(validate_token(&jwt, &config), Err(AuthError::InvalidIssuer)));
    }

    #[test]
    fn test_display_name_falls_back_to_sub() {
        let mut c = claims();
        c.name = None;
        assert_eq!(c.display_name(), "kid-42");
        c.name = Some(String::new());
        assert_eq!(c.display_name(), "kid-42");
    }

    #[test]
    fn test_account_key_is_stable() {
        let a = claims();
        let mut b = claims();
        assert_eq!(a.account_key(), b.account_key());
        b.sub = "kid-43".into();
        assert_ne!(a.account_key(), b.account_key());
        assert_eq!(a.account_key().len(), 16);
    }
}
