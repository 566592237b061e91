use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::broadcast;

use crate::flag::{EntityKind, Flag, Operation, Segment, VariantType};
use crate::format::parse_number;
use crate::reconcile::{EntityDeleted, Reconciler, SaveOutcome, Target, TargetKind};
use crate::store::Store;
use crate::tracker::{FlagField, Removed, RuleField, VariantField, WorkingCopy};
use crate::EditorError;

/// Lifecycle of one flag-edit session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorState {
    Loading,
    Ready,
    Saving,
    /// Terminal: the router should leave the editor.
    Redirecting,
    /// Terminal: the initial fetch failed.
    Error(String),
}

/// Drives a [`WorkingCopy`] from operator actions and saves it through a
/// [`Reconciler`].
pub struct Editor {
    store: Arc<dyn Store + Send + Sync>,
    reconciler: Reconciler,
    state: EditorState,
    copy: Option<WorkingCopy>,
    operations: Vec<Operation>,
    segments: Vec<Segment>,
}

impl Editor {
    pub fn new(store: Arc<dyn Store + Send + Sync>) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone()),
            store,
            state: EditorState::Loading,
            copy: None,
            operations: Vec::new(),
            segments: Vec::new(),
        }
    }

    pub fn state(&self) -> &EditorState {
        &self.state
    }

    pub fn working_copy(&self) -> Option<&WorkingCopy> {
        self.copy.as_ref()
    }

    pub fn flag(&self) -> Option<&Flag> {
        self.copy.as_ref().map(|c| c.flag())
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Receives an event for every delete the store confirms.
    pub fn subscribe(&self) -> broadcast::Receiver<EntityDeleted> {
        self.reconciler.subscribe()
    }

    pub async fn load(&mut self, flag_id: &str) -> Result<(), EditorError> {
        if self.state != EditorState::Loading {
            return Err(EditorError::InvalidState(self.state.clone()));
        }

        match self.store.fetch_flag(flag_id).await {
            Ok(data) => {
                self.copy = Some(WorkingCopy::new(data.flag));
                self.operations = data.operations;
                self.segments = data.segments;
                self.state = EditorState::Ready;
                info!("Editing flag {}", flag_id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to load flag {}: {}", flag_id, e);
                self.state = EditorState::Error(e.to_string());
                Err(EditorError::FetchError(e))
            }
        }
    }

    pub fn update_flag(&mut self, field: FlagField) -> Result<(), EditorError> {
        self.ready_copy()?.update_flag(field);
        Ok(())
    }

    pub fn add_variant(&mut self) -> Result<String, EditorError> {
        Ok(self.ready_copy()?.add_variant())
    }

    pub fn update_variant(&mut self, id: &str, field: VariantField) -> Result<(), EditorError> {
        if self.ready_copy()?.update_variant(id, field) {
            Ok(())
        } else {
            Err(unknown(EntityKind::Variant, id))
        }
    }

    /// Refuses to remove a variant that a rule or a flag default still points at.
    pub fn delete_variant(&mut self, id: &str) -> Result<Removed, EditorError> {
        let copy = self.ready_copy()?;
        let referenced_by = if let Some(rule) = copy.rules_referencing(id).next() {
            Some(Target { kind: TargetKind::Rule, id: rule.id.clone() })
        } else if copy.flag().default_variants().any(|v| v == id) {
            Some(Target { kind: TargetKind::Flag, id: copy.flag().id.clone() })
        } else {
            None
        };
        if let Some(referenced_by) = referenced_by {
            return Err(EditorError::ReferentialConstraintError {
                variant_id: id.to_string(),
                referenced_by,
            });
        }
        copy.delete(EntityKind::Variant, id)
            .ok_or_else(|| unknown(EntityKind::Variant, id))
    }

    pub fn add_rule(&mut self, variant_id: &str) -> Result<String, EditorError> {
        let copy = self.ready_copy()?;
        if copy.flag().variant(variant_id).is_none() {
            return Err(unknown(EntityKind::Variant, variant_id));
        }
        Ok(copy.add_rule(variant_id))
    }

    pub fn update_rule(&mut self, id: &str, field: RuleField) -> Result<(), EditorError> {
        if self.ready_copy()?.update_rule(id, field) {
            Ok(())
        } else {
            Err(unknown(EntityKind::Rule, id))
        }
    }

    pub fn delete_rule(&mut self, id: &str) -> Result<Removed, EditorError> {
        self.ready_copy()?
            .delete(EntityKind::Rule, id)
            .ok_or_else(|| unknown(EntityKind::Rule, id))
    }

    /// Undoes a delete_variant/delete_rule made in this session.
    pub fn restore(&mut self, removed: Removed) -> Result<(), EditorError> {
        let kind = removed.kind();
        let id = removed.id().to_string();
        if self.ready_copy()?.restore(removed) {
            Ok(())
        } else {
            Err(EditorError::ValidationError {
                target: Target { kind: kind.into(), id },
                message: "an entity with this id is already present".to_string(),
            })
        }
    }

    /// Saves every pending change. On success the editor redirects; on any
    /// failure it returns to `Ready` with the working copy as it was.
    pub async fn save(&mut self) -> Result<SaveOutcome, EditorError> {
        let copy = match (&self.state, &self.copy) {
            (EditorState::Ready, Some(copy)) => copy,
            _ => return Err(EditorError::InvalidState(self.state.clone())),
        };
        validate(copy)?;

        let plan = Reconciler::plan(copy);
        if plan.is_empty() {
            info!("Nothing to save for flag {}", copy.flag().id);
            self.state = EditorState::Redirecting;
            return Ok(SaveOutcome::default());
        }

        let saving = SavingGuard::enter(&mut self.state);
        let mut outcome = self.reconciler.apply(plan).await;

        if !outcome.is_success() {
            warn!("Save left {} failed operations", outcome.failures.len());
            saving.finish(EditorState::Ready);
            return Err(EditorError::SaveFailed(std::mem::take(&mut outcome.failures)));
        }

        if let Some(copy) = self.copy.as_mut() {
            copy.mark_saved(&outcome.resolved);
        }
        saving.finish(EditorState::Redirecting);
        Ok(outcome)
    }

    /// Deletes the whole flag, discarding any pending edits.
    pub async fn delete_flag(&mut self) -> Result<String, EditorError> {
        let flag_id = match (&self.state, &self.copy) {
            (EditorState::Ready, Some(copy)) => copy.flag().id.clone(),
            _ => return Err(EditorError::InvalidState(self.state.clone())),
        };

        match self.reconciler.delete_flag(&flag_id).await {
            Ok(id) => {
                info!("Deleted flag {}", id);
                self.state = EditorState::Redirecting;
                Ok(id)
            }
            Err(e) => {
                warn!("Failed to delete flag {}: {}", flag_id, e);
                Err(EditorError::DeleteFailed(e))
            }
        }
    }

    /// Leaves the editor without saving.
    pub fn cancel(&mut self) -> Result<(), EditorError> {
        if self.state != EditorState::Ready {
            return Err(EditorError::InvalidState(self.state.clone()));
        }
        self.state = EditorState::Redirecting;
        Ok(())
    }

    fn ready_copy(&mut self) -> Result<&mut WorkingCopy, EditorError> {
        match (&self.state, self.copy.as_mut()) {
            (EditorState::Ready, Some(copy)) => Ok(copy),
            _ => Err(EditorError::InvalidState(self.state.clone())),
        }
    }
}

/// Holds the editor in `Saving`. If the save future is dropped before it
/// settles, the editor goes back to `Ready` with the working copy untouched.
struct SavingGuard<'a> {
    state: &'a mut EditorState,
}

impl<'a> SavingGuard<'a> {
    fn enter(state: &'a mut EditorState) -> Self {
        *state = EditorState::Saving;
        Self { state }
    }

    fn finish(self, next: EditorState) {
        *self.state = next;
    }
}

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        if *self.state == EditorState::Saving {
            warn!("Save was interrupted, editor is ready again");
            *self.state = EditorState::Ready;
        }
    }
}

fn unknown(kind: EntityKind, id: &str) -> EditorError {
    EditorError::UnknownEntity {
        kind,
        id: id.to_string(),
    }
}

fn invalid(kind: TargetKind, id: &str, message: String) -> EditorError {
    EditorError::ValidationError {
        target: Target {
            kind,
            id: id.to_string(),
        },
        message,
    }
}

/// Checks the working copy before anything is sent.
fn validate(copy: &WorkingCopy) -> Result<(), EditorError> {
    let flag = copy.flag();
    if flag.key.trim().is_empty() {
        return Err(invalid(TargetKind::Flag, &flag.id, "key must not be empty".to_string()));
    }

    for variant in flag.variants.iter().filter(|v| v.state.is_dirty()) {
        let value = variant.value.trim();
        let fits = match variant.variant_type {
            VariantType::Boolean => value == "true" || value == "false",
            VariantType::Number => parse_number(value).is_some(),
            VariantType::Json => serde_json::from_str::<serde_json::Value>(value).is_ok(),
            VariantType::String => true,
        };
        if !fits {
            return Err(invalid(
                TargetKind::Variant,
                &variant.id,
                format!("{:?} is not a valid {:?} value", variant.value, variant.variant_type),
            ));
        }
    }

    for id in flag.default_variants() {
        if flag.variant(id).is_none() {
            return Err(invalid(
                TargetKind::Flag,
                &flag.id,
                format!("default variant {} is not part of this flag", id),
            ));
        }
    }

    for rule in &flag.rules {
        if flag.variant(&rule.variant_id).is_none() {
            return Err(invalid(
                TargetKind::Rule,
                &rule.id,
                format!("variant {} is not part of this flag", rule.variant_id),
            ));
        }
    }

    Ok(())
}
