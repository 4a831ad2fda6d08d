// Admin capability checks for DMPool
// Every administrative mutation requires an AdminCapability minted from a verified token

use chrono::{TimeDelta, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

pub const ADMIN_ROLE: &str = "admin";

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,
    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("Role '{0}' may not perform admin operations")]
    Forbidden(String),
}

/// Proof that the caller was authorized as an admin. Only `Authorizer`
/// can construct one.
#[derive(Debug, Clone)]
pub struct AdminCapability {
    subject: String,
}

impl AdminCapability {
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

pub struct Authorizer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl Authorizer {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn issue_token(&self, subject: &str, role: &str, ttl: TimeDelta) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            role: role.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }

    /// Verify a bearer token and require the admin role
    pub fn authorize(&self, token: &str) -> Result<AdminCapability, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        if data.claims.role != ADMIN_ROLE {
            return Err(AuthError::Forbidden(data.claims.role));
        }
        Ok(AdminCapability {
            subject: data.claims.sub,
        })
    }

    /// Authorize from an `Authorization: Bearer <token>` header value
    pub fn authorize_header(&self, header: Option<&str>) -> Result<AdminCapability, AuthError> {
        let token = header
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AuthError::MissingToken)?;
        self.authorize(token)
    }
}
