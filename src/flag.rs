use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Save-time treatment of an entity in the working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntityState {
    #[default]
    Unmodified,
    New,
    Modified,
}

impl EntityState {
    pub fn is_dirty(&self) -> bool {
        *self != EntityState::Unmodified
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Variant,
    Rule,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Variant => write!(f, "variant"),
            EntityKind::Rule => write!(f, "rule"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantType {
    Boolean,
    String,
    Number,
    Json,
}

impl VariantType {
    /// Infers the type tag of a persisted value.
    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(_) => VariantType::Boolean,
            serde_json::Value::Number(_) => VariantType::Number,
            serde_json::Value::String(_) => VariantType::String,
            _ => VariantType::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    OneOf,
    NotOneOf,
    Greater,
    GreaterOrEqual,
    Lower,
    LowerOrEqual,
    Exists,
    DoesntExist,
    Contains,
    DoesntContain,
    StartsWith,
    DoesntStartWith,
    EndsWith,
    DoesntEndWith,
    MatchesRegex,
    DoesntMatchRegex,
    IsInSegment,
    IsntInSegment,
    IsInNetwork,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub property: String,
    pub operation: Operation,
    #[serde(default)]
    pub values: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub name: String,
}

/// A possible flag value. `value` holds the raw editor text; formatting
/// coerces it according to `variant_type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RemoteVariant")]
pub struct Variant {
    pub id: String,
    pub variant_type: VariantType,
    pub value: String,
    pub description: Option<String>,
    pub state: EntityState,
}

impl Variant {
    /// Builds an unmodified variant from a value as the backing store holds it.
    pub fn from_remote(id: String, value: serde_json::Value, description: Option<String>) -> Self {
        let variant_type = VariantType::of(&value);
        let value = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };

        Self {
            id,
            variant_type,
            value,
            description,
            state: EntityState::Unmodified,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RemoteVariant {
    id: String,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    description: Option<String>,
}

impl From<RemoteVariant> for Variant {
    fn from(remote: RemoteVariant) -> Self {
        Variant::from_remote(remote.id, remote.value, remote.description)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub variant_id: String,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(skip)]
    pub state: EntityState,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub enabled: bool,
    /// Variant served when the flag is on and no rule matches.
    #[serde(default)]
    pub default_variant_when_on: Option<String>,
    /// Variant served when the flag is off.
    #[serde(default)]
    pub default_variant_when_off: Option<String>,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub state: EntityState,
}

impl Flag {
    pub fn variant(&self, id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }

    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// The default variant ids that are set, on first.
    pub fn default_variants(&self) -> impl Iterator<Item = &String> {
        self.default_variant_when_on
            .iter()
            .chain(self.default_variant_when_off.iter())
    }
}

/// Everything the editor needs from `fetch-flag`.
#[derive(Debug, Clone, Deserialize)]
pub struct EditorData {
    pub flag: Flag,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deletion {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub id: String,
    pub flag_id: String,
}
