use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::flag::{EntityKind, EntityState};
use crate::format::{format_flag, format_rule, format_variant, FlagInput, RuleInput, VariantInput};
use crate::store::Store;
use crate::tracker::WorkingCopy;
use crate::StoreError;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Flag,
    Variant,
    Rule,
}

impl From<EntityKind> for TargetKind {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Variant => TargetKind::Variant,
            EntityKind::Rule => TargetKind::Rule,
        }
    }
}

/// The entity a write operation or failure belongs to. For creates this is
/// the placeholder id from the working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub kind: TargetKind,
    pub id: String,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            TargetKind::Flag => "flag",
            TargetKind::Variant => "variant",
            TargetKind::Rule => "rule",
        };
        write!(f, "{} {}", kind, self.id)
    }
}

/// Emitted after the store confirms a delete, for list views that cache by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDeleted {
    pub kind: TargetKind,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    UpdateFlag { flag_id: String, input: FlagInput },
    CreateVariant { flag_id: String, placeholder: String, input: VariantInput },
    UpdateVariant { flag_id: String, id: String, input: VariantInput },
    DeleteVariant { flag_id: String, id: String },
    CreateRule { flag_id: String, placeholder: String, input: RuleInput },
    UpdateRule { flag_id: String, id: String, input: RuleInput },
    DeleteRule { flag_id: String, id: String },
}

impl WriteOp {
    pub fn target(&self) -> Target {
        let (kind, id) = match self {
            WriteOp::UpdateFlag { flag_id, .. } => (TargetKind::Flag, flag_id),
            WriteOp::CreateVariant { placeholder, .. } => (TargetKind::Variant, placeholder),
            WriteOp::UpdateVariant { id, .. } | WriteOp::DeleteVariant { id, .. } => (TargetKind::Variant, id),
            WriteOp::CreateRule { placeholder, .. } => (TargetKind::Rule, placeholder),
            WriteOp::UpdateRule { id, .. } | WriteOp::DeleteRule { id, .. } => (TargetKind::Rule, id),
        };
        Target { kind, id: id.clone() }
    }

    /// Rewrites references to variants created earlier in the save. Returns
    /// the placeholder of the first one whose create did not succeed.
    fn resolve(&mut self, new_variants: &[String], resolved: &HashMap<String, String>) -> Result<(), String> {
        let refs: Vec<&mut String> = match self {
            WriteOp::CreateRule { input, .. } | WriteOp::UpdateRule { input, .. } => vec![&mut input.variant_id],
            WriteOp::UpdateFlag { input, .. } => input
                .default_variant_when_on
                .iter_mut()
                .chain(input.default_variant_when_off.iter_mut())
                .collect(),
            _ => Vec::new(),
        };

        for id in refs {
            if !new_variants.contains(&*id) {
                continue;
            }
            match resolved.get(id.as_str()) {
                Some(real) => *id = real.clone(),
                None => return Err(id.clone()),
            }
        }
        Ok(())
    }
}

/// Write operations for one save, grouped by when they may be sent. Each
/// group is sent concurrently and settles before the next one starts.
///
/// - `flag`: the flag update, alone, unless it points at a new variant.
/// - `batch`: everything without an ordering need.
/// - `dependent`: writes that point at a variant created in `batch`
///   (rules, and the flag update when a default does).
/// - `trailing`: variant deletes, held back only when `dependent` is not
///   empty so a reference can move off a variant before it is removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub flag: Option<WriteOp>,
    pub batch: Vec<WriteOp>,
    pub dependent: Vec<WriteOp>,
    pub trailing: Vec<WriteOp>,
    /// Placeholder ids of the variants created by `batch`.
    pub new_variants: Vec<String>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.flag.iter().count() + self.batch.len() + self.dependent.len() + self.trailing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ops(&self) -> impl Iterator<Item = &WriteOp> {
        self.flag
            .iter()
            .chain(self.batch.iter())
            .chain(self.dependent.iter())
            .chain(self.trailing.iter())
    }
}

#[derive(Debug)]
pub enum FailureReason {
    Store(StoreError),
    /// The variant this rule points at was not created.
    Blocked { variant: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Store(e) => write!(f, "{}", e),
            FailureReason::Blocked { variant } => write!(f, "variant {} was not created", variant),
        }
    }
}

#[derive(Debug)]
pub struct OpFailure {
    pub target: Target,
    pub reason: FailureReason,
}

impl fmt::Display for OpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.reason)
    }
}

#[derive(Debug, Default)]
pub struct SaveOutcome {
    /// Placeholder id to store-assigned id, for every successful create.
    pub resolved: HashMap<String, String>,
    pub applied: usize,
    pub failures: Vec<OpFailure>,
}

impl SaveOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

enum Applied {
    Created { placeholder: String, id: String },
    Updated,
    Deleted { kind: TargetKind, id: String },
    /// A delete the store had already applied, as when a failed save is retried.
    AlreadyDeleted,
}

/// Turns a working copy's diff into store writes.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store + Send + Sync>,
    events: broadcast::Sender<EntityDeleted>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store + Send + Sync>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { store, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityDeleted> {
        self.events.subscribe()
    }

    /// One op per dirty entity and per deletion record; clean entities yield none.
    pub fn plan(copy: &WorkingCopy) -> Plan {
        let flag = copy.flag();
        let flag_id = flag.id.clone();
        let mut plan = Plan::default();

        for variant in &flag.variants {
            match variant.state {
                EntityState::New => {
                    plan.new_variants.push(variant.id.clone());
                    plan.batch.push(WriteOp::CreateVariant {
                        flag_id: flag_id.clone(),
                        placeholder: variant.id.clone(),
                        input: format_variant(variant),
                    });
                }
                EntityState::Modified => plan.batch.push(WriteOp::UpdateVariant {
                    flag_id: flag_id.clone(),
                    id: variant.id.clone(),
                    input: format_variant(variant),
                }),
                EntityState::Unmodified => {}
            }
        }

        if flag.state.is_dirty() {
            let op = WriteOp::UpdateFlag {
                flag_id: flag_id.clone(),
                input: format_flag(flag),
            };
            if flag.default_variants().any(|id| plan.new_variants.contains(id)) {
                plan.dependent.push(op);
            } else {
                plan.flag = Some(op);
            }
        }

        for rule in &flag.rules {
            let op = match rule.state {
                EntityState::New => WriteOp::CreateRule {
                    flag_id: flag_id.clone(),
                    placeholder: rule.id.clone(),
                    input: format_rule(rule),
                },
                EntityState::Modified => WriteOp::UpdateRule {
                    flag_id: flag_id.clone(),
                    id: rule.id.clone(),
                    input: format_rule(rule),
                },
                EntityState::Unmodified => continue,
            };
            if plan.new_variants.contains(&rule.variant_id) {
                plan.dependent.push(op);
            } else {
                plan.batch.push(op);
            }
        }

        let mut variant_deletes = Vec::new();
        for deletion in copy.deletions() {
            match deletion.kind {
                EntityKind::Variant => variant_deletes.push(WriteOp::DeleteVariant {
                    flag_id: deletion.flag_id.clone(),
                    id: deletion.id.clone(),
                }),
                EntityKind::Rule => plan.batch.push(WriteOp::DeleteRule {
                    flag_id: deletion.flag_id.clone(),
                    id: deletion.id.clone(),
                }),
            }
        }
        if plan.dependent.is_empty() {
            plan.batch.extend(variant_deletes);
        } else {
            plan.trailing = variant_deletes;
        }

        plan
    }

    /// Sends a plan and waits for every op to settle. Nothing is rolled back
    /// on failure.
    pub async fn apply(&self, plan: Plan) -> SaveOutcome {
        let mut outcome = SaveOutcome::default();

        if let Some(op) = plan.flag {
            self.settle(vec![op], &mut outcome).await;
            if !outcome.is_success() {
                warn!(
                    "Flag update failed, skipping {} child operations",
                    plan.batch.len() + plan.dependent.len() + plan.trailing.len()
                );
                return outcome;
            }
        }

        self.settle(plan.batch, &mut outcome).await;

        let mut ready = Vec::with_capacity(plan.dependent.len());
        for mut op in plan.dependent {
            if let Err(variant) = op.resolve(&plan.new_variants, &outcome.resolved) {
                let target = op.target();
                warn!("Not sending {}: variant {} was not created", target, variant);
                outcome.failures.push(OpFailure {
                    target,
                    reason: FailureReason::Blocked { variant },
                });
                continue;
            }
            ready.push(op);
        }
        self.settle(ready, &mut outcome).await;

        self.settle(plan.trailing, &mut outcome).await;

        info!(
            "Save finished: {} applied, {} failed",
            outcome.applied,
            outcome.failures.len()
        );
        outcome
    }

    /// Runs `plan` and `apply` for a working copy.
    pub async fn save(&self, copy: &WorkingCopy) -> SaveOutcome {
        self.apply(Self::plan(copy)).await
    }

    pub async fn delete_flag(&self, id: &str) -> Result<String, StoreError> {
        let deleted = self.store.delete_flag(id).await?;
        self.emit(TargetKind::Flag, &deleted);
        Ok(deleted)
    }

    async fn settle(&self, ops: Vec<WriteOp>, outcome: &mut SaveOutcome) {
        if ops.is_empty() {
            return;
        }
        debug!("Dispatching {} operations", ops.len());

        let results = join_all(ops.iter().map(|op| self.dispatch(op))).await;
        for (op, result) in ops.iter().zip(results) {
            match result {
                Ok(Applied::Created { placeholder, id }) => {
                    outcome.resolved.insert(placeholder, id);
                    outcome.applied += 1;
                }
                Ok(Applied::Updated) => outcome.applied += 1,
                Ok(Applied::Deleted { kind, id }) => {
                    self.emit(kind, &id);
                    outcome.applied += 1;
                }
                Ok(Applied::AlreadyDeleted) => outcome.applied += 1,
                Err(e) => {
                    let target = op.target();
                    warn!("Failed to save {}: {}", target, e);
                    outcome.failures.push(OpFailure {
                        target,
                        reason: FailureReason::Store(e),
                    });
                }
            }
        }
    }

    async fn dispatch(&self, op: &WriteOp) -> Result<Applied, StoreError> {
        match op {
            WriteOp::UpdateFlag { flag_id, input } => {
                self.store.update_flag(flag_id, input).await?;
                Ok(Applied::Updated)
            }
            WriteOp::CreateVariant { flag_id, placeholder, input } => {
                let id = self.store.create_variant(flag_id, input).await?;
                Ok(Applied::Created { placeholder: placeholder.clone(), id })
            }
            WriteOp::UpdateVariant { flag_id, id, input } => {
                self.store.update_variant(flag_id, id, input).await?;
                Ok(Applied::Updated)
            }
            WriteOp::DeleteVariant { flag_id, id } => {
                deleted(TargetKind::Variant, id, self.store.delete_variant(flag_id, id).await)
            }
            WriteOp::CreateRule { flag_id, placeholder, input } => {
                let id = self.store.create_rule(flag_id, input).await?;
                Ok(Applied::Created { placeholder: placeholder.clone(), id })
            }
            WriteOp::UpdateRule { flag_id, id, input } => {
                self.store.update_rule(flag_id, id, input).await?;
                Ok(Applied::Updated)
            }
            WriteOp::DeleteRule { flag_id, id } => {
                deleted(TargetKind::Rule, id, self.store.delete_rule(flag_id, id).await)
            }
        }
    }

    fn emit(&self, kind: TargetKind, id: &str) {
        // Fails only when nobody is subscribed.
        let _ = self.events.send(EntityDeleted { kind, id: id.to_string() });
    }
}

/// A delete that finds nothing to remove was applied by an earlier save.
fn deleted(kind: TargetKind, id: &str, result: Result<String, StoreError>) -> Result<Applied, StoreError> {
    match result {
        Ok(id) => Ok(Applied::Deleted { kind, id }),
        Err(StoreError::NotFound(_)) => {
            debug!("{} is already gone", Target { kind, id: id.to_string() });
            Ok(Applied::AlreadyDeleted)
        }
        Err(e) => Err(e),
    }
}
