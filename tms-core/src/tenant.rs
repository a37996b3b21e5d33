//! Core multi-tenant types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// PostgreSQL truncates identifiers beyond 63 bytes.
pub const MAX_PARTITION_KEY_LEN: usize = 63;

const PUBLIC: &str = "public";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionKeyError {
    #[error("partition key is empty")]
    Empty,

    #[error("partition key is longer than 63 bytes")]
    TooLong,

    #[error("partition key must start with a lowercase letter or underscore: {0:?}")]
    InvalidStart(String),

    #[error("partition key may only contain [a-z0-9_]: {0:?}")]
    InvalidCharacter(String),
}

/// Name of the isolated data partition (a PostgreSQL schema) a tenant owns.
///
/// Only `[a-z_][a-z0-9_]*` up to 63 bytes is accepted, so a key can be
/// embedded as a quoted identifier without any chance of breaking out of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn parse(raw: impl Into<String>) -> Result<Self, PartitionKeyError> {
        let raw = raw.into();
        let Some(first) = raw.chars().next() else {
            return Err(PartitionKeyError::Empty);
        };
        if raw.len() > MAX_PARTITION_KEY_LEN {
            return Err(PartitionKeyError::TooLong);
        }
        if !(first.is_ascii_lowercase() || first == '_') {
            return Err(PartitionKeyError::InvalidStart(raw));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(PartitionKeyError::InvalidCharacter(raw));
        }
        Ok(Self(raw))
    }

    /// The shared partition holding tenants, users and credential tokens.
    pub fn public() -> Self {
        Self(PUBLIC.to_string())
    }

    /// Derive a fresh key for a newly registered tenant: a slug of the
    /// display name followed by `_<suffix>` (registration uses the current
    /// time in milliseconds). `"ABC Lojistik"` → `abc_lojistik_1762000000000`.
    pub fn from_display_name(display_name: &str, suffix: i64) -> Result<Self, PartitionKeyError> {
        let mut slug = String::with_capacity(display_name.len());
        for ch in display_name.trim().chars().flat_map(char::to_lowercase) {
            if ch.is_ascii_alphanumeric() {
                slug.push(ch);
            } else if !slug.is_empty() && !slug.ends_with('_') {
                slug.push('_');
            }
        }

        if slug.is_empty() {
            slug.push_str("tenant");
        } else if slug.starts_with(|c: char| c.is_ascii_digit()) {
            slug.insert_str(0, "t_");
        }

        let suffix = format!("_{suffix}");
        slug.truncate(MAX_PARTITION_KEY_LEN.saturating_sub(suffix.len()));
        while slug.ends_with('_') {
            slug.pop();
        }

        Self::parse(format!("{slug}{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_public(&self) -> bool {
        self.0 == PUBLIC
    }

    /// Names that belong to the database itself and can never be provisioned or dropped.
    pub fn is_reserved(&self) -> bool {
        self.is_public() || self.0 == "information_schema" || self.0.starts_with("pg_")
    }

    /// Double-quoted identifier form, safe to splice into DDL.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0.replace('"', "\"\""))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PartitionKey {
    type Error = PartitionKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<PartitionKey> for String {
    fn from(key: PartitionKey) -> Self {
        key.0
    }
}

impl Default for PartitionKey {
    fn default() -> Self {
        Self::public()
    }
}

/// Caller roles stored on user accounts and carried in access tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "operator" => Some(Role::Operator),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
        }
    }
}

/// Context carried with every request.
///
/// Built once per request by the identity resolver and read-only afterwards.
/// The default is the shared `public` partition with no caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTenantContext {
    pub partition_key: PartitionKey,
    pub caller_id: Option<String>,
    pub caller_role: Option<Role>,
    pub tenant_uuid: Option<String>,
}

impl RequestTenantContext {
    /// Anonymous context on the shared partition.
    pub fn public() -> Self {
        Self::default()
    }

    pub fn for_partition(partition_key: PartitionKey) -> Self {
        Self {
            partition_key,
            ..Self::default()
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.caller_id.is_some()
    }
}
