// Authentication options and configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tms_core::TmsConfigSnapshot;

/// Only used when nothing is configured and the app is not in production.
pub const DEVELOPMENT_SECRET: &str = "fallback-secret-key-for-development-only";

/// HMAC signing algorithms. Tokens are signed and verified with one shared secret.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum JwtAlgorithm {
    /// HMAC using SHA-256
    #[default]
    HS256,
    /// HMAC using SHA-384
    HS384,
    /// HMAC using SHA-512
    HS512,
}

/// Main authentication configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthOptions {
    pub jwt: JwtOptions,
    pub password: PasswordOptions,
}

impl AuthOptions {
    /// Reads `auth.jwt.*` and `auth.password.*` keys; anything missing keeps its default.
    pub fn from_snapshot(snapshot: &TmsConfigSnapshot) -> Self {
        let mut options = Self::default();

        if let Some(secret) = snapshot.get_string("auth.jwt.secret") {
            options.jwt.secret = Some(secret);
        }
        if let Some(issuer) = snapshot.get_string("auth.jwt.issuer") {
            options.jwt.issuer = Some(issuer);
        }
        if let Some(secs) = snapshot.get_u64("auth.jwt.expires_in_secs") {
            options.jwt.access_token_expires_in = Duration::from_secs(secs);
        }
        if let Some(secs) = snapshot.get_u64("auth.jwt.leeway_secs") {
            options.jwt.leeway = Duration::from_secs(secs);
        }
        if let Some(cost) = snapshot.get_u32("auth.password.cost") {
            options.password.cost = cost;
        }

        options
    }

    pub fn validate(&self) -> Result<(), String> {
        self.jwt
            .validate()
            .map_err(|e| format!("JWT validation failed: {e}"))?;
        self.password
            .validate()
            .map_err(|e| format!("Password validation failed: {e}"))
    }
}

/// JWT-specific configuration options
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JwtOptions {
    pub algorithm: JwtAlgorithm,
    /// Process-wide signing secret.
    pub secret: Option<String>,
    /// Optional `iss` claim; verified only when set.
    pub issuer: Option<String>,
    #[serde(with = "humantime_serde")]
    pub access_token_expires_in: Duration,
    /// Clock skew tolerated on `exp`.
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
}

impl Default for JwtOptions {
    fn default() -> Self {
        Self {
            algorithm: JwtAlgorithm::default(),
            secret: None,
            issuer: None,
            access_token_expires_in: Duration::from_secs(24 * 60 * 60),
            leeway: Duration::from_secs(60),
        }
    }
}

impl JwtOptions {
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.secret.as_deref() {
            None => return Err("HMAC algorithms require a secret".to_string()),
            Some(s) if s.trim().is_empty() => {
                return Err("JWT secret cannot be empty".to_string())
            }
            _ => {}
        }

        if self.access_token_expires_in.as_secs() == 0 {
            return Err("Access token expiration must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PasswordOptions {
    /// bcrypt work factor.
    pub cost: u32,
}

impl Default for PasswordOptions {
    fn default() -> Self {
        Self {
            cost: bcrypt::DEFAULT_COST,
        }
    }
}

impl PasswordOptions {
    pub fn validate(&self) -> Result<(), String> {
        if !(4..=31).contains(&self.cost) {
            return Err(format!("bcrypt cost must be within 4..=31, got {}", self.cost));
        }
        Ok(())
    }
}
