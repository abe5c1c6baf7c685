//! Bearer-token authentication boundary.
//!
//! The engine never authenticates anyone: handlers hand a bearer token to a
//! [`TokenVerifier`] and get back the verified `(uid, role)` pair the external
//! identity provider vouches for.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use serde::Deserialize;
use thiserror::Error;

use crate::model::{Role, UserId};

/// Verified caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: UserId,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid bearer token")]
    InvalidToken,
}

/// Errors loading a token table file.
#[derive(Debug, Error)]
pub enum TokenFileError {
    #[error("failed to read token file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse token file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Verifies bearer tokens against the identity provider.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Extract the bearer token from the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingToken)?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingToken)
}

#[derive(Debug, Deserialize)]
struct TokenEntry {
    uid: UserId,
    #[serde(default)]
    role: Role,
}

/// Fixed token table for local development and tests.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    tokens: Vec<(String, Identity)>,
}

impl StaticTokenVerifier {
    /// An empty table: every token is rejected.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, uid: impl Into<UserId>, role: Role) -> Self {
        self.tokens.push((
            token.into(),
            Identity {
                uid: uid.into(),
                role,
            },
        ));
        self
    }

    /// Load a JSON map of `token -> { uid, role }`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TokenFileError> {
        let file = File::open(path)?;
        let entries: HashMap<String, TokenEntry> = serde_json::from_reader(BufReader::new(file))?;
        let mut verifier = Self::new();
        for (token, entry) in entries {
            verifier = verifier.with_token(token, entry.uid, entry.role);
        }
        Ok(verifier)
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens
            .iter()
            .find(|(known, _)| constant_time_eq(known, token))
            .map(|(_, identity)| identity.clone())
            .ok_or(AuthError::InvalidToken)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}
