use crate::errors::{Error, Result};
use crate::model::{Identity, Role};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Session token lifetime. Tokens become invalid exactly at issue + 12h.
const TOKEN_TTL_SECS: i64 = 12 * 60 * 60;

/// Claims embedded in every issued bearer token.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: Role,
    exp: i64,
}

/// Issues and verifies HS256-signed session tokens. Stateless: nothing is
/// persisted server-side, so a token stays valid until expiry (no revocation
/// list in the current design).
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the caller-supplied clock below, with no
        // leeway, so a token dies exactly at its expires_at.
        validation.validate_exp = false;

        TokenService {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Produce a signed token for `subject` with `role`, expiring 12 hours
    /// after `now`.
    pub fn issue(&self, subject: &str, role: Role, now: DateTime<Utc>) -> Result<String> {
        let claims = Claims {
            sub: subject.to_string(),
            role,
            exp: now.timestamp() + TOKEN_TTL_SECS,
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| Error::InvalidToken)
    }

    /// Validate signature, structure and expiry. Every failure mode collapses
    /// to `InvalidToken` so callers cannot distinguish expired from tampered.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Identity> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| Error::InvalidToken)?;

        if now.timestamp() >= data.claims.exp {
            return Err(Error::InvalidToken);
        }

        Ok(Identity {
            subject: data.claims.sub,
            role: data.claims.role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn service() -> TokenService {
        TokenService::new("test-secret")
    }

    #[test]
    fn test_issue_verify_roundtrip() {
        let svc = service();
        let now = Utc::now();
        let token = svc.issue("admin", Role::Admin, now).unwrap();

        let identity = svc.verify(&token, now).unwrap();
        assert_eq!(identity.subject, "admin");
        assert_eq!(identity.role, Role::Admin);
    }

    #[test]
    fn test_valid_until_just_before_expiry() {
        let svc = service();
        let now = Utc::now();
        let token = svc.issue("user", Role::User, now).unwrap();

        let almost = now + Duration::hours(12) - Duration::seconds(1);
        let identity = svc.verify(&token, almost).unwrap();
        assert_eq!(identity.role, Role::User);
    }

    #[test]
    fn test_invalid_exactly_at_expiry() {
        let svc = service();
        let now = Utc::now();
        let token = svc.issue("user", Role::User, now).unwrap();

        let err = svc.verify(&token, now + Duration::hours(12)).unwrap_err();
        assert!(matches!(err, Error::InvalidToken));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let svc = service();
        let token = svc.issue("user", Role::User, Utc::now()).unwrap();

        // Flip one byte of the signature segment.
        let mut bytes = token.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();

        let err = svc.verify(&tampered, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::InvalidToken));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = service().issue("user", Role::User, Utc::now()).unwrap();
        let other = TokenService::new("another-secret");

        let err = other.verify(&token, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::InvalidToken));
    }

    #[test]
    fn test_garbage_rejected() {
        let err = service().verify("not.a.token", Utc::now()).unwrap_err();
        assert!(matches!(err, Error::InvalidToken));
    }
}
