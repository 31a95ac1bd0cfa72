//! User record model
//!
//! The serialized shape (`userID`, `name`, `exp`, `money`, ...) is what the
//! flat-file backend writes and what dotted paths address.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Serialized key of the identity field
pub const USER_ID_KEY: &str = "userID";
pub const CREATED_AT_KEY: &str = "createdAt";
pub const UPDATED_AT_KEY: &str = "updatedAt";

/// Top-level keys a patch may touch
pub const MUTABLE_FIELDS: [&str; 8] = [
    "name", "gender", "vanity", "exp", "money", "banned", "settings", "data",
];

pub const DEFAULT_NAME: &str = "User";
pub const UNKNOWN: &str = "unknown";

/// Partial record: top-level key → new value
pub type Patch = Map<String, Value>;

/// Numeric identity of one account record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(UserId).map_err(|_| {
            StoreError::InvalidUserId(format!("userID must be an integer, not {:?}", s))
        })
    }
}

/// Parse a money argument
pub fn parse_money(s: &str) -> Result<i64, StoreError> {
    s.trim()
        .parse::<i64>()
        .map_err(|_| StoreError::InvalidMoney(format!("money must be an integer, not {:?}", s)))
}

/// Profile fields supplied by a caller or the profile provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub vanity: Option<String>,
}

impl ProfileInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_unknown() -> String {
    UNKNOWN.to_string()
}

/// One account record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(rename = "userID")]
    pub user_id: UserId,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_unknown")]
    pub gender: String,
    #[serde(default = "default_unknown")]
    pub vanity: String,
    #[serde(default)]
    pub exp: u64,
    #[serde(default)]
    pub money: i64,
    #[serde(default)]
    pub banned: Map<String, Value>,
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl UserRecord {
    /// Fresh record with zeroed counters; blank or missing profile fields
    /// fall back to `default_name` / `"unknown"`.
    pub fn new(user_id: UserId, info: &ProfileInfo, default_name: &str) -> Self {
        let pick = |v: &Option<String>, fallback: &str| {
            v.as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or(fallback)
                .to_string()
        };
        Self {
            user_id,
            name: pick(&info.name, default_name),
            gender: pick(&info.gender, UNKNOWN),
            vanity: pick(&info.vanity, UNKNOWN),
            exp: 0,
            money: 0,
            banned: Map::new(),
            settings: Map::new(),
            data: Map::new(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Serialized object form
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(USER_ID_KEY.into(), Value::from(self.user_id.0));
        map.insert("name".into(), Value::from(self.name.clone()));
        map.insert("gender".into(), Value::from(self.gender.clone()));
        map.insert("vanity".into(), Value::from(self.vanity.clone()));
        map.insert("exp".into(), Value::from(self.exp));
        map.insert("money".into(), Value::from(self.money));
        map.insert("banned".into(), Value::Object(self.banned.clone()));
        map.insert("settings".into(), Value::Object(self.settings.clone()));
        map.insert("data".into(), Value::Object(self.data.clone()));
        if let Some(ref ts) = self.created_at {
            map.insert(CREATED_AT_KEY.into(), Value::from(ts.clone()));
        }
        if let Some(ref ts) = self.updated_at {
            map.insert(UPDATED_AT_KEY.into(), Value::from(ts.clone()));
        }
        map
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.to_map())
    }

    /// Copy of this record with the patch's top-level keys replaced
    ///
    /// Fails with `InvalidData` when a patched value has the wrong shape or the
    /// patch tries to change the identity.
    pub fn with_patch(&self, patch: &Patch) -> Result<UserRecord, StoreError> {
        let mut map = self.to_map();
        for (key, value) in patch {
            map.insert(key.clone(), value.clone());
        }
        let patched: UserRecord = serde_json::from_value(Value::Object(map))
            .map_err(|e| StoreError::InvalidData(format!("user {}: {}", self.user_id, e)))?;
        if patched.user_id != self.user_id {
            return Err(StoreError::InvalidData(format!(
                "userID is immutable (user {})",
                self.user_id
            )));
        }
        Ok(patched)
    }

    /// Value a top-level field holds on a freshly created record
    pub fn default_field(key: &str, default_name: &str) -> Option<Value> {
        match key {
            "name" => Some(Value::from(default_name)),
            "gender" | "vanity" => Some(Value::from(UNKNOWN)),
            "exp" | "money" => Some(Value::from(0)),
            "banned" | "settings" | "data" => Some(Value::Object(Map::new())),
            _ => None,
        }
    }
}
