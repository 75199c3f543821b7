#![forbid(unsafe_code)]

// Token validation for the signaling channel and the admin HTTP surface.
// Tokens are HMAC JWTs carrying {sub, name, role, exp}; the secret comes from
// JWT_SECRET. Without a secret every token is rejected.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

const TOKEN_LIFETIME_SECS: u64 = 60 * 60;

/// Authenticated principal attached to a client session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub role: UserRole,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    User,
    Admin,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    #[serde(default = "default_role")]
    pub role: UserRole,
    pub exp: usize,
}

fn default_role() -> UserRole {
    UserRole::User
}

/// Mint a token. Used by operator tooling and tests; the server itself only
/// validates.
pub fn create_token(
    user_id: &str,
    display_name: &str,
    role: UserRole,
    secret: &str,
) -> anyhow::Result<String> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?;

    let claims = Claims {
        sub: user_id.to_string(),
        name: display_name.to_string(),
        role,
        exp: (now.as_secs() + TOKEN_LIFETIME_SECS) as usize,
    };

    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

/// Validate a token against the configured secret. Returns the principal, or
/// None for a missing secret, bad signature, malformed token, or expiry.
pub fn validate_token(token: &str, secret: Option<&str>) -> Option<User> {
    let secret = secret?;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;

    Some(User {
        id: data.claims.sub,
        name: data.claims.name,
        role: data.claims.role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_validate_token() {
        let secret = "test-secret-at-least-32-bytes-long!!";
        let token = create_token("user-123", "Alice", UserRole::User, secret).unwrap();
        let user = validate_token(&token, Some(secret)).unwrap();
        assert_eq!(user.id, "user-123");
        assert_eq!(user.name, "Alice");
        assert!(!user.is_admin());
    }

    #[test]
    fn test_admin_role_survives_round_trip() {
        let secret = "test-secret-at-least-32-bytes-long!!";
        let token = create_token("root", "Root", UserRole::Admin, secret).unwrap();
        let user = validate_token(&token, Some(secret)).unwrap();
        assert!(user.is_admin());
    }

    #[test]
    fn test_invalid_secret_rejects() {
        let token = create_token("user-123", "Alice", UserRole::User, "secret-1").unwrap();
        assert!(validate_token(&token, Some("secret-2")).is_none());
    }

    #[test]
    fn test_no_secret_rejects_everything() {
        let token = create_token("user-123", "Alice", UserRole::User, "secret-1").unwrap();
        assert!(validate_token(&token, None).is_none());
    }

    #[test]
    fn test_garbage_token_rejects() {
        assert!(validate_token("not.a.jwt", Some("secret")).is_none());
    }
}
