// JWT signing and verification.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tms_core::errors::TmsError;
use tms_core::{PartitionKey, Role};
use uuid::Uuid;

use crate::options::{JwtAlgorithm, JwtOptions};

/// Claims carried by an access token.
///
/// Every field is optional on the way in: a verified token with a missing
/// claim yields an empty value, not an error.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    /// Caller (user) id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Partition key of the caller's tenant.
    #[serde(rename = "tenantId", default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(rename = "tenantUuid", default, skip_serializing_if = "Option::is_none")]
    pub tenant_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default)]
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

/// What the issuer knows about the caller when a token is minted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessTokenSubject {
    pub user_id: String,
    pub email: String,
    pub partition_key: PartitionKey,
    pub tenant_uuid: String,
    pub role: Role,
}

pub trait JwtProvider: Send + Sync {
    fn sign(&self, jwt: &JwtOptions, claims: &TokenClaims) -> Result<String>;

    fn verify(&self, jwt: &JwtOptions, token: &str) -> Result<TokenClaims>;
}

struct JsonwebtokenProvider;

impl JsonwebtokenProvider {
    fn algorithm(alg: &JwtAlgorithm) -> jsonwebtoken::Algorithm {
        match alg {
            JwtAlgorithm::HS256 => jsonwebtoken::Algorithm::HS256,
            JwtAlgorithm::HS384 => jsonwebtoken::Algorithm::HS384,
            JwtAlgorithm::HS512 => jsonwebtoken::Algorithm::HS512,
        }
    }

    fn secret(jwt: &JwtOptions) -> Result<&str> {
        jwt.secret
            .as_deref()
            .ok_or_else(|| TmsError::not_authenticated("JWT secret is not configured").into_anyhow())
    }
}

impl JwtProvider for JsonwebtokenProvider {
    fn sign(&self, jwt: &JwtOptions, claims: &TokenClaims) -> Result<String> {
        use jsonwebtoken::{encode, EncodingKey, Header};

        let secret = Self::secret(jwt)?;
        let header = Header::new(Self::algorithm(&jwt.algorithm));

        encode(&header, claims, &EncodingKey::from_secret(secret.as_bytes()))
            .map_err(|e| TmsError::not_authenticated(e.to_string()).into_anyhow())
    }

    fn verify(&self, jwt: &JwtOptions, token: &str) -> Result<TokenClaims> {
        use jsonwebtoken::{decode, DecodingKey, Validation};

        let secret = Self::secret(jwt)?;

        let mut validation = Validation::new(Self::algorithm(&jwt.algorithm));
        validation.leeway = jwt.leeway.as_secs();
        validation.validate_aud = false;
        if let Some(issuer) = jwt.issuer.as_deref() {
            validation.set_issuer(&[issuer]);
        }

        let decoded = decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map_err(|e| TmsError::not_authenticated(e.to_string()).into_anyhow())?;

        Ok(decoded.claims)
    }
}

/// Issues and verifies access tokens against the process-wide options.
#[derive(Clone)]
pub struct TokenService {
    options: Arc<JwtOptions>,
    provider: Arc<dyn JwtProvider>,
}

impl TokenService {
    pub fn new(options: JwtOptions) -> Self {
        Self {
            options: Arc::new(options),
            provider: Arc::new(JsonwebtokenProvider),
        }
    }

    pub fn with_provider(options: JwtOptions, provider: Arc<dyn JwtProvider>) -> Self {
        Self {
            options: Arc::new(options),
            provider,
        }
    }

    pub fn options(&self) -> &JwtOptions {
        &self.options
    }

    pub fn create_access_token(&self, subject: &AccessTokenSubject) -> Result<String> {
        let now = Utc::now().timestamp();
        let expires_in = self.options.access_token_expires_in.as_secs() as i64;

        let claims = TokenClaims {
            sub: Some(subject.user_id.clone()),
            email: Some(subject.email.clone()),
            tenant_id: Some(subject.partition_key.to_string()),
            tenant_uuid: Some(subject.tenant_uuid.clone()),
            role: Some(subject.role.as_str().to_string()),
            iss: self.options.issuer.clone(),
            iat: Some(now),
            exp: now + expires_in,
            jti: Some(Uuid::new_v4().to_string()),
        };

        self.sign(&claims)
    }

    /// Sign arbitrary claims with the configured secret.
    pub fn sign(&self, claims: &TokenClaims) -> Result<String> {
        self.provider.sign(&self.options, claims)
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        self.provider.verify(&self.options, token)
    }
}

/// Pull the token out of an `Authorization` header value.
///
/// Accepts `Bearer <token>` and `JWT <token>` (scheme is case-insensitive);
/// a header without a scheme is taken as the token itself.
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    const SCHEMES: [&str; 2] = ["Bearer", "JWT"];

    let hv = header.trim();
    if hv.is_empty() || SCHEMES.iter().any(|s| s.eq_ignore_ascii_case(hv)) {
        return None;
    }

    if let Some((scheme, token)) = hv.split_once(' ') {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }

        let allowed = SCHEMES
            .iter()
            .any(|s| s.eq_ignore_ascii_case(scheme.trim()));
        return allowed.then_some(token);
    }

    Some(hv)
}
