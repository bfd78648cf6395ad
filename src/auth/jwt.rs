use jsonwebtoken::{decode, DecodingKey, Validation};

use crate::config::JwtConfig;
use crate::connection_manager::UserId;
use crate::error::AppError;

use super::Claims;

/// HMAC token verification against the configured secret, issuer and audience
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::default();
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &config.audience {
            validation.set_audience(&[audience]);
        }

        Self {
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }

    /// Verify a token and return the user id it names
    pub fn verify(&self, token: &str) -> Result<UserId, AppError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?
            .claims;

        claims
            .user_id()
            .ok_or_else(|| AppError::Auth("Token subject is empty".to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::claims::Subject;
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub(crate) const TEST_SECRET: &str = "signaling-test-secret";

    pub(crate) fn create_test_config() -> JwtConfig {
        JwtConfig {
            secret: TEST_SECRET.to_string(),
            issuer: None,
            audience: None,
        }
    }

    fn sign(sub: Subject, exp_offset: i64, secret: &str) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub,
            exp: now + exp_offset,
            iat: Some(now),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    pub(crate) fn create_test_token(sub: &str, secret: &str) -> String {
        sign(Subject::Text(sub.to_string()), 3600, secret)
    }

    #[test]
    fn test_string_and_numeric_subjects() {
        let validator = JwtValidator::new(&create_test_config());

        let token = create_test_token("alice", TEST_SECRET);
        assert_eq!(validator.verify(&token).unwrap(), "alice");

        let token = sign(Subject::Number(42), 3600, TEST_SECRET);
        assert_eq!(validator.verify(&token).unwrap(), "42");
    }

    #[test]
    fn test_rejected_tokens() {
        let validator = JwtValidator::new(&create_test_config());

        assert!(validator.verify("not-a-token").is_err());

        let wrong_secret = create_test_token("alice", "another-secret");
        assert!(matches!(validator.verify(&wrong_secret), Err(AppError::Auth(_))));

        let expired = sign(Subject::Text("alice".into()), -3600, TEST_SECRET);
        assert!(validator.verify(&expired).is_err());

        let blank = create_test_token("  ", TEST_SECRET);
        assert!(validator.verify(&blank).is_err());
    }

    #[test]
    fn test_issuer_is_enforced_when_configured() {
        let config = JwtConfig {
            issuer: Some("signaling".to_string()),
            ..create_test_config()
        };
        let validator = JwtValidator::new(&config);

        // Token carries no iss claim
        let token = create_test_token("alice", TEST_SECRET);
        assert!(validator.verify(&token).is_err());
    }
}
