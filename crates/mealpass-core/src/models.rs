//! Domain types shared by the vault, the pipeline and the session controller.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header carrying the establishment id for establishment operators
pub const ESTABLISHMENT_HEADER: &str = "x-establishment-id";

/// Header carrying the restaurant id for restaurant operators
pub const RESTAURANT_HEADER: &str = "x-restaurant-id";

/// Unix timestamps above this are taken to be milliseconds.
const MILLIS_THRESHOLD: i64 = 10_000_000_000;

/// The session token and its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    /// Minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        self.time_until_expiry(now).num_minutes().max(0)
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// A permission value as the server sends it: booleans, 0/1 or strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(transparent)]
pub struct PermissionFlag(pub bool);

impl<'de> Deserialize<'de> for PermissionFlag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let granted = match Value::deserialize(deserializer)? {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Value::String(s) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            ),
            Value::Null => false,
            other => {
                return Err(de::Error::custom(format!(
                    "unsupported permission value: {}",
                    other
                )))
            }
        };
        Ok(PermissionFlag(granted))
    }
}

/// Which kind of operator the user is. The two roles are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Affiliation {
    Establishment { establishment_id: i64 },
    Restaurant { restaurant_id: i64 },
}

impl Affiliation {
    /// Tenant header name and value for requests made on behalf of this user.
    pub fn tenant_header(&self) -> (&'static str, String) {
        match self {
            Affiliation::Establishment { establishment_id } => {
                (ESTABLISHMENT_HEADER, establishment_id.to_string())
            }
            Affiliation::Restaurant { restaurant_id } => {
                (RESTAURANT_HEADER, restaurant_id.to_string())
            }
        }
    }
}

/// The authenticated principal, cached alongside the credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub permissions: BTreeMap<String, PermissionFlag>,
    pub affiliation: Option<Affiliation>,
}

impl UserProfile {
    pub fn can(&self, permission: &str) -> bool {
        self.permissions
            .get(permission)
            .map(|flag| flag.0)
            .unwrap_or(false)
    }
}

/// User as the remote API sends it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPayload {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub permissions: BTreeMap<String, PermissionFlag>,
    pub establishment_id: Option<i64>,
    pub restaurant_id: Option<i64>,
}

impl TryFrom<UserPayload> for UserProfile {
    type Error = String;

    fn try_from(payload: UserPayload) -> Result<Self, Self::Error> {
        let affiliation = match (payload.establishment_id, payload.restaurant_id) {
            (Some(_), Some(_)) => {
                return Err(format!(
                    "user {} is linked to both an establishment and a restaurant",
                    payload.id
                ))
            }
            (Some(establishment_id), None) => Some(Affiliation::Establishment { establishment_id }),
            (None, Some(restaurant_id)) => Some(Affiliation::Restaurant { restaurant_id }),
            (None, None) => None,
        };

        Ok(UserProfile {
            id: payload.id,
            name: payload.name,
            email: payload.email,
            permissions: payload.permissions,
            affiliation,
        })
    }
}

/// Accept token expiries as RFC 3339 strings or Unix timestamps.
pub fn deserialize_expiry<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<DateTime<Utc>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(de::Error::custom),
        Value::Number(n) => {
            let raw = n
                .as_i64()
                .ok_or_else(|| de::Error::custom("token expiry is not an integer"))?;
            let parsed = if raw > MILLIS_THRESHOLD {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            };
            parsed.ok_or_else(|| de::Error::custom(format!("token expiry out of range: {}", raw)))
        }
        other => Err(de::Error::custom(format!(
            "unsupported token expiry: {}",
            other
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================
