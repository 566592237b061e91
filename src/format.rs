use serde::Serialize;

use crate::flag::{Constraint, EntityState, Flag, Rule, Variant, VariantType};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagInput {
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub default_variant_when_on: Option<String>,
    pub default_variant_when_off: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub variant_type: VariantType,
    pub value: serde_json::Value,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub variant_id: String,
    pub constraints: Vec<Constraint>,
}

pub fn format_flag(flag: &Flag) -> FlagInput {
    FlagInput {
        key: flag.key.clone(),
        name: flag.name.clone(),
        description: flag.description.clone(),
        enabled: flag.enabled,
        default_variant_when_on: flag.default_variant_when_on.clone(),
        default_variant_when_off: flag.default_variant_when_off.clone(),
    }
}

pub fn format_variant(variant: &Variant) -> VariantInput {
    VariantInput {
        id: persisted_id(&variant.id, variant.state),
        variant_type: variant.variant_type,
        value: coerce(variant.variant_type, &variant.value),
        description: variant.description.clone(),
    }
}

pub fn format_rule(rule: &Rule) -> RuleInput {
    RuleInput {
        id: persisted_id(&rule.id, rule.state),
        variant_id: rule.variant_id.clone(),
        constraints: rule.constraints.clone(),
    }
}

fn persisted_id(id: &str, state: EntityState) -> Option<String> {
    match state {
        EntityState::New => None,
        _ => Some(id.to_string()),
    }
}

/// Converts raw editor text into the JSON value for `variant_type`.
/// Text that does not fit the type is sent as a string.
pub fn coerce(variant_type: VariantType, raw: &str) -> serde_json::Value {
    match variant_type {
        VariantType::Boolean => serde_json::Value::Bool(raw.trim() == "true"),
        VariantType::Number => parse_number(raw)
            .unwrap_or_else(|| serde_json::Value::String(raw.to_string())),
        VariantType::Json => serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
        VariantType::String => serde_json::Value::String(raw.to_string()),
    }
}

pub(crate) fn parse_number(raw: &str) -> Option<serde_json::Value> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        return Some(n.into());
    }
    raw.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(serde_json::Value::Number)
}
