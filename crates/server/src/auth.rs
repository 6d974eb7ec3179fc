use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// JWT claims carried by viewer and API tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id from the `[[users]]` table)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    pub iat: u64,
}

const TOKEN_EXPIRY_SECS: u64 = 24 * 60 * 60; // 24 hours

/// Issue a JWT for a user id.
pub fn generate_jwt(user_id: &str, secret: &str) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock error")?
        .as_secs();

    let claims = Claims {
        sub: user_id.to_string(),
        iat: now,
        exp: now + TOKEN_EXPIRY_SECS,
    };

    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("Failed to encode JWT")
}

/// Validate a JWT and return its claims.
pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims> {
    let validation = Validation::new(Algorithm::HS256);

    let token_data: TokenData<Claims> = jsonwebtoken::decode(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .context("Invalid or expired token")?;

    Ok(token_data.claims)
}

/// Random 256-bit secret, hex encoded. Used when no `jwt_secret` is configured.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Compare two secrets without short-circuiting on the first difference.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}
