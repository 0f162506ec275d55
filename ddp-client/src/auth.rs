//! Login credentials for the accounts `login` method.
//!
//! Passwords never leave the client in plain text: they are sent as the
//! lowercase hex SHA-256 digest with `algorithm: "sha-256"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Method name used for every login variant.
pub const LOGIN_METHOD: &str = "login";

#[derive(Clone, PartialEq, Eq)]
pub enum LoginCredential {
    Username { username: String, password: String },
    Email { email: String, password: String },
    /// Resume token from an earlier login.
    Token(String),
}

impl LoginCredential {
    pub fn username(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Username {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn email(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Email {
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self::Token(token.into())
    }

    /// The single `params` entry of the `login` call.
    pub fn to_params(&self) -> Value {
        match self {
            Self::Username { username, password } => json!({
                "user": { "username": username },
                "password": hashed_password(password),
            }),
            Self::Email { email, password } => json!({
                "user": { "email": email },
                "password": hashed_password(password),
            }),
            Self::Token(token) => json!({ "resume": token }),
        }
    }
}

impl std::fmt::Debug for LoginCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Username { username, .. } => write!(f, "Username({username})"),
            Self::Email { email, .. } => write!(f, "Email({email})"),
            Self::Token(_) => write!(f, "Token(..)"),
        }
    }
}

/// Lowercase hex SHA-256 of `password`.
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn hashed_password(password: &str) -> Value {
    json!({
        "digest": password_digest(password),
        "algorithm": "sha-256",
    })
}

/// Successful `login` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginToken {
    /// User id.
    pub id: String,
    pub token: String,
    #[serde(with = "crate::ejson::date::option", default)]
    pub token_expires: Option<DateTime<Utc>>,
}

impl LoginToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.token_expires.is_some_and(|expires| expires <= now)
    }
}
