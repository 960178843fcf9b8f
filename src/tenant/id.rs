// Tenant identifier
// Canonical hyphenated UUID, only constructible through validation

use crate::error::TenantIdError;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a hyphenated UUID
pub const TENANT_ID_LEN: usize = 36;

const HYPHEN_POSITIONS: [usize; 4] = [8, 13, 18, 23];

/// Validated tenant identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Validate and normalise a raw identifier (uppercase hex is lowered)
    pub fn parse(raw: &str) -> Result<Self, TenantIdError> {
        validate_id(raw)?;
        Ok(Self(raw.to_ascii_lowercase()))
    }

    /// Fresh random identifier, handy for provisioning and tests
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_uuid(&self) -> uuid::Uuid {
        // Validated at construction, so this parse cannot fail
        uuid::Uuid::parse_str(&self.0).unwrap_or_default()
    }
}

/// Check the exact length and character pattern of a tenant identifier
pub fn validate_id(raw: &str) -> Result<(), TenantIdError> {
    if raw.trim().is_empty() {
        return Err(TenantIdError::Blank);
    }

    let len = raw.chars().count();
    if len != TENANT_ID_LEN {
        return Err(TenantIdError::WrongLength {
            expected: TENANT_ID_LEN,
            actual: len,
        });
    }

    for (idx, ch) in raw.chars().enumerate() {
        if HYPHEN_POSITIONS.contains(&idx) {
            if ch != '-' {
                return Err(TenantIdError::Malformed(format!(
                    "expected '-' at position {}",
                    idx
                )));
            }
        } else if !ch.is_ascii_hexdigit() {
            return Err(TenantIdError::Malformed(format!(
                "invalid character {:?} at position {}",
                ch, idx
            )));
        }
    }

    Ok(())
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = TenantIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<uuid::Uuid> for TenantId {
    fn from(id: uuid::Uuid) -> Self {
        Self(id.hyphenated().to_string())
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        TenantId::parse(&raw).map_err(serde::de::Error::custom)
    }
}
