//! JWT issuance and verification (HS256 access/refresh pairs).

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const TYPE_ACCESS: &str = "access";
const TYPE_REFRESH: &str = "refresh";

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("Token is invalid or expired")]
    Invalid,

    #[error("Wrong token type")]
    WrongType,

    #[error("JWT signing secret is not configured")]
    MissingSecret,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: user id.
    pub sub: i64,
    /// Token type: "access" or "refresh".
    pub typ: String,
    /// Unique id, set for refresh tokens so each issuance is distinct.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Stateless JWT signer/verifier. Refresh-token persistence lives in the
/// store; this type only covers the cryptographic claims.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl JwtService {
    pub fn new(
        secret: &str,
        access_ttl_minutes: i64,
        refresh_ttl_minutes: i64,
    ) -> Result<Self, JwtError> {
        if secret.is_empty() {
            return Err(JwtError::MissingSecret);
        }

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl: Duration::minutes(access_ttl_minutes.max(1)),
            refresh_ttl: Duration::minutes(refresh_ttl_minutes.max(1)),
        })
    }

    /// Issue a short-lived access token.
    pub fn issue_access_token(&self, user_id: i64) -> Result<String, JwtError> {
        self.issue(user_id, TYPE_ACCESS, None, self.access_ttl)
    }

    /// Issue a long-lived refresh token. The caller persists its hash so it
    /// can be revoked later.
    pub fn issue_refresh_token(&self, user_id: i64) -> Result<String, JwtError> {
        let jti = uuid::Uuid::new_v4().to_string();
        self.issue(user_id, TYPE_REFRESH, Some(jti), self.refresh_ttl)
    }

    fn issue(
        &self,
        user_id: i64,
        typ: &str,
        jti: Option<String>,
        ttl: Duration,
    ) -> Result<String, JwtError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id,
            typ: typ.to_string(),
            jti,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| JwtError::Invalid)
    }

    /// Resolve a user id from a valid access token.
    pub fn verify_access_token(&self, token: &str) -> Result<i64, JwtError> {
        let claims = self.decode(token)?;
        if claims.typ != TYPE_ACCESS {
            return Err(JwtError::WrongType);
        }
        Ok(claims.sub)
    }

    /// Validate refresh-token claims and return the user id. Callers must
    /// additionally check the persisted token row is still active.
    pub fn verify_refresh_token(&self, token: &str) -> Result<i64, JwtError> {
        let claims = self.decode(token)?;
        if claims.typ != TYPE_REFRESH {
            return Err(JwtError::WrongType);
        }
        Ok(claims.sub)
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    fn decode(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| JwtError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> JwtService {
        JwtService::new("test-secret", 60, 60 * 24).unwrap()
    }

    #[test]
    fn test_access_token_round_trip() {
        let jwt = service();
        let token = jwt.issue_access_token(7).unwrap();
        assert_eq!(jwt.verify_access_token(&token).unwrap(), 7);
    }

    #[test]
    fn test_access_token_cannot_refresh() {
        let jwt = service();
        let token = jwt.issue_access_token(7).unwrap();
        assert!(matches!(
            jwt.verify_refresh_token(&token),
            Err(JwtError::WrongType)
        ));
    }

    #[test]
    fn test_refresh_token_cannot_access() {
        let jwt = service();
        let token = jwt.issue_refresh_token(7).unwrap();
        assert!(matches!(
            jwt.verify_access_token(&token),
            Err(JwtError::WrongType)
        ));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let jwt = service();
        let token = jwt.issue_access_token(7).unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push(if token.ends_with('a') { 'b' } else { 'a' });
        assert!(jwt.verify_access_token(&tampered).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = service().issue_access_token(7).unwrap();
        let other = JwtService::new("another-secret", 60, 120).unwrap();
        assert!(matches!(
            other.verify_access_token(&token),
            Err(JwtError::Invalid)
        ));
    }

    #[test]
    fn test_refresh_tokens_are_unique() {
        let jwt = service();
        let a = jwt.issue_refresh_token(7).unwrap();
        let b = jwt.issue_refresh_token(7).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(
            JwtService::new("", 60, 120),
            Err(JwtError::MissingSecret)
        ));
    }
}
