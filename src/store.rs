use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::flag::{EditorData, EntityState, Flag, Operation, Rule, Segment, Variant};
use crate::format::{FlagInput, RuleInput, VariantInput};
use crate::StoreError;

/// Flag fields echoed back by `update-flag`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FlagSummary {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub version: u64,
}

/// The backing store the editor writes to.
#[async_trait]
pub trait Store {
    async fn fetch_flag(&self, id: &str) -> Result<EditorData, StoreError>;
    async fn update_flag(&self, id: &str, input: &FlagInput) -> Result<FlagSummary, StoreError>;
    async fn delete_flag(&self, id: &str) -> Result<String, StoreError>;

    /// Returns the id the store assigned to the new variant.
    async fn create_variant(&self, flag_id: &str, input: &VariantInput) -> Result<String, StoreError>;
    async fn update_variant(&self, flag_id: &str, id: &str, input: &VariantInput) -> Result<String, StoreError>;
    async fn delete_variant(&self, flag_id: &str, id: &str) -> Result<String, StoreError>;

    /// Returns the id the store assigned to the new rule.
    async fn create_rule(&self, flag_id: &str, input: &RuleInput) -> Result<String, StoreError>;
    async fn update_rule(&self, flag_id: &str, id: &str, input: &RuleInput) -> Result<String, StoreError>;
    async fn delete_rule(&self, flag_id: &str, id: &str) -> Result<String, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    FetchFlag,
    UpdateFlag,
    DeleteFlag,
    CreateVariant,
    UpdateVariant,
    DeleteVariant,
    CreateRule,
    UpdateRule,
    DeleteRule,
}

/// A call received by [`MemoryStore`], in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    FetchFlag { id: String },
    UpdateFlag { id: String, input: FlagInput },
    DeleteFlag { id: String },
    CreateVariant { flag_id: String, input: VariantInput },
    UpdateVariant { flag_id: String, id: String, input: VariantInput },
    DeleteVariant { flag_id: String, id: String },
    CreateRule { flag_id: String, input: RuleInput },
    UpdateRule { flag_id: String, id: String, input: RuleInput },
    DeleteRule { flag_id: String, id: String },
}

impl Call {
    pub fn kind(&self) -> CallKind {
        match self {
            Call::FetchFlag { .. } => CallKind::FetchFlag,
            Call::UpdateFlag { .. } => CallKind::UpdateFlag,
            Call::DeleteFlag { .. } => CallKind::DeleteFlag,
            Call::CreateVariant { .. } => CallKind::CreateVariant,
            Call::UpdateVariant { .. } => CallKind::UpdateVariant,
            Call::DeleteVariant { .. } => CallKind::DeleteVariant,
            Call::CreateRule { .. } => CallKind::CreateRule,
            Call::UpdateRule { .. } => CallKind::UpdateRule,
            Call::DeleteRule { .. } => CallKind::DeleteRule,
        }
    }
}

/// In-process store that enforces the same referential checks as the
/// remote one. Every call is logged, and calls of a given kind can be made
/// to fail with a validation error.
pub struct MemoryStore {
    flags: RwLock<HashMap<String, Flag>>,
    operations: Vec<Operation>,
    segments: Vec<Segment>,
    next_id: AtomicU64,
    calls: Mutex<Vec<Call>>,
    rejections: Mutex<HashMap<CallKind, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            flags: RwLock::new(HashMap::new()),
            operations: Vec::new(),
            segments: Vec::new(),
            next_id: AtomicU64::new(1000),
            calls: Mutex::new(Vec::new()),
            rejections: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_reference_data(mut self, operations: Vec<Operation>, segments: Vec<Segment>) -> Self {
        self.operations = operations;
        self.segments = segments;
        self
    }

    pub async fn insert(&self, mut flag: Flag) {
        flag.state = EntityState::Unmodified;
        self.flags.write().await.insert(flag.id.clone(), flag);
    }

    pub async fn get(&self, id: &str) -> Option<Flag> {
        self.flags.read().await.get(id).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    /// Makes every subsequent call of `kind` fail with a validation error.
    pub fn reject(&self, kind: CallKind, message: &str) {
        if let Ok(mut rejections) = self.rejections.lock() {
            rejections.insert(kind, message.to_string());
        }
    }

    pub fn clear_rejections(&self) {
        if let Ok(mut rejections) = self.rejections.lock() {
            rejections.clear();
        }
    }

    fn record(&self, call: Call) -> Result<(), StoreError> {
        let kind = call.kind();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        let rejected = self
            .rejections
            .lock()
            .ok()
            .and_then(|r| r.get(&kind).cloned());
        match rejected {
            Some(message) => Err(StoreError::Validation(message)),
            None => Ok(()),
        }
    }

    fn assign_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn flag_mut<'a>(flags: &'a mut HashMap<String, Flag>, id: &str) -> Result<&'a mut Flag, StoreError> {
    flags
        .get_mut(id)
        .ok_or_else(|| StoreError::NotFound(format!("flag {}", id)))
}

fn check_variant_ref(flag: &Flag, input: &RuleInput) -> Result<(), StoreError> {
    if flag.variant(&input.variant_id).is_none() {
        return Err(StoreError::Validation(format!(
            "variant {} does not exist",
            input.variant_id
        )));
    }
    Ok(())
}

fn bump(flag: &mut Flag) {
    flag.version += 1;
    flag.updated_at = Some(Utc::now());
}

#[async_trait]
impl Store for MemoryStore {
    async fn fetch_flag(&self, id: &str) -> Result<EditorData, StoreError> {
        self.record(Call::FetchFlag { id: id.to_string() })?;
        let flags = self.flags.read().await;
        let flag = flags
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("flag {}", id)))?;
        Ok(EditorData {
            flag,
            operations: self.operations.clone(),
            segments: self.segments.clone(),
        })
    }

    async fn update_flag(&self, id: &str, input: &FlagInput) -> Result<FlagSummary, StoreError> {
        self.record(Call::UpdateFlag { id: id.to_string(), input: input.clone() })?;
        let mut flags = self.flags.write().await;
        let flag = flag_mut(&mut flags, id)?;
        for default in input.default_variant_when_on.iter().chain(input.default_variant_when_off.iter()) {
            if flag.variant(default).is_none() {
                return Err(StoreError::Validation(format!("variant {} does not exist", default)));
            }
        }
        flag.key = input.key.clone();
        flag.name = input.name.clone();
        flag.description = input.description.clone();
        flag.enabled = input.enabled;
        flag.default_variant_when_on = input.default_variant_when_on.clone();
        flag.default_variant_when_off = input.default_variant_when_off.clone();
        bump(flag);
        Ok(FlagSummary {
            id: flag.id.clone(),
            key: flag.key.clone(),
            version: flag.version,
        })
    }

    async fn delete_flag(&self, id: &str) -> Result<String, StoreError> {
        self.record(Call::DeleteFlag { id: id.to_string() })?;
        let mut flags = self.flags.write().await;
        flags
            .remove(id)
            .map(|f| f.id)
            .ok_or_else(|| StoreError::NotFound(format!("flag {}", id)))
    }

    async fn create_variant(&self, flag_id: &str, input: &VariantInput) -> Result<String, StoreError> {
        self.record(Call::CreateVariant { flag_id: flag_id.to_string(), input: input.clone() })?;
        let mut flags = self.flags.write().await;
        let flag = flag_mut(&mut flags, flag_id)?;
        let id = self.assign_id();
        flag.variants.push(Variant::from_remote(
            id.clone(),
            input.value.clone(),
            input.description.clone(),
        ));
        bump(flag);
        Ok(id)
    }

    async fn update_variant(&self, flag_id: &str, id: &str, input: &VariantInput) -> Result<String, StoreError> {
        self.record(Call::UpdateVariant {
            flag_id: flag_id.to_string(),
            id: id.to_string(),
            input: input.clone(),
        })?;
        let mut flags = self.flags.write().await;
        let flag = flag_mut(&mut flags, flag_id)?;
        let variant = flag
            .variants
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("variant {}", id)))?;
        *variant = Variant::from_remote(id.to_string(), input.value.clone(), input.description.clone());
        bump(flag);
        Ok(id.to_string())
    }

    async fn delete_variant(&self, flag_id: &str, id: &str) -> Result<String, StoreError> {
        self.record(Call::DeleteVariant { flag_id: flag_id.to_string(), id: id.to_string() })?;
        let mut flags = self.flags.write().await;
        let flag = flag_mut(&mut flags, flag_id)?;
        if let Some(rule) = flag.rules.iter().find(|r| r.variant_id == id) {
            return Err(StoreError::ReferentialConstraint(format!(
                "variant {} is used by rule {}",
                id, rule.id
            )));
        }
        if flag.default_variants().any(|v| v == id) {
            return Err(StoreError::ReferentialConstraint(format!(
                "variant {} is a default of flag {}",
                id, flag.id
            )));
        }
        let index = flag
            .variants
            .iter()
            .position(|v| v.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("variant {}", id)))?;
        flag.variants.remove(index);
        bump(flag);
        Ok(id.to_string())
    }

    async fn create_rule(&self, flag_id: &str, input: &RuleInput) -> Result<String, StoreError> {
        self.record(Call::CreateRule { flag_id: flag_id.to_string(), input: input.clone() })?;
        let mut flags = self.flags.write().await;
        let flag = flag_mut(&mut flags, flag_id)?;
        check_variant_ref(flag, input)?;
        let id = self.assign_id();
        flag.rules.push(Rule {
            id: id.clone(),
            variant_id: input.variant_id.clone(),
            constraints: input.constraints.clone(),
            state: EntityState::Unmodified,
        });
        bump(flag);
        Ok(id)
    }

    async fn update_rule(&self, flag_id: &str, id: &str, input: &RuleInput) -> Result<String, StoreError> {
        self.record(Call::UpdateRule {
            flag_id: flag_id.to_string(),
            id: id.to_string(),
            input: input.clone(),
        })?;
        let mut flags = self.flags.write().await;
        let flag = flag_mut(&mut flags, flag_id)?;
        check_variant_ref(flag, input)?;
        let rule = flag
            .rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("rule {}", id)))?;
        rule.variant_id = input.variant_id.clone();
        rule.constraints = input.constraints.clone();
        bump(flag);
        Ok(id.to_string())
    }

    async fn delete_rule(&self, flag_id: &str, id: &str) -> Result<String, StoreError> {
        self.record(Call::DeleteRule { flag_id: flag_id.to_string(), id: id.to_string() })?;
        let mut flags = self.flags.write().await;
        let flag = flag_mut(&mut flags, flag_id)?;
        let index = flag
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("rule {}", id)))?;
        flag.rules.remove(index);
        bump(flag);
        Ok(id.to_string())
    }
}
