use std::collections::HashMap;

use log::debug;

use crate::flag::{Constraint, Deletion, EntityKind, EntityState, Flag, Rule, Variant, VariantType};

#[derive(Debug, Clone, PartialEq)]
pub enum FlagField {
    Key(String),
    Name(String),
    Description(Option<String>),
    Enabled(bool),
    DefaultVariantWhenOn(Option<String>),
    DefaultVariantWhenOff(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum VariantField {
    Type(VariantType),
    Value(String),
    Description(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleField {
    Variant(String),
    Constraints(Vec<Constraint>),
}

/// An entity taken out of the working copy, kept so the removal can be undone.
#[derive(Debug, Clone, PartialEq)]
pub enum Removed {
    Variant { index: usize, variant: Variant },
    Rule { index: usize, rule: Rule },
}

impl Removed {
    pub fn kind(&self) -> EntityKind {
        match self {
            Removed::Variant { .. } => EntityKind::Variant,
            Removed::Rule { .. } => EntityKind::Rule,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Removed::Variant { variant, .. } => &variant.id,
            Removed::Rule { rule, .. } => &rule.id,
        }
    }
}

/// Session-local copy of a flag with its pending deletions.
///
/// Entities carry their own [`EntityState`]; deletions of persisted entities
/// are queued here. Nothing in this type talks to a store.
#[derive(Debug, Clone)]
pub struct WorkingCopy {
    flag: Flag,
    deletions: Vec<Deletion>,
    next_placeholder: u64,
}

impl WorkingCopy {
    pub fn new(mut flag: Flag) -> Self {
        flag.state = EntityState::Unmodified;
        for variant in &mut flag.variants {
            variant.state = EntityState::Unmodified;
        }
        for rule in &mut flag.rules {
            rule.state = EntityState::Unmodified;
        }

        Self {
            flag,
            deletions: Vec::new(),
            next_placeholder: 0,
        }
    }

    pub fn flag(&self) -> &Flag {
        &self.flag
    }

    pub fn deletions(&self) -> &[Deletion] {
        &self.deletions
    }

    pub fn is_dirty(&self) -> bool {
        self.flag.state.is_dirty()
            || !self.deletions.is_empty()
            || self.flag.variants.iter().any(|v| v.state.is_dirty())
            || self.flag.rules.iter().any(|r| r.state.is_dirty())
    }

    pub fn update_flag(&mut self, field: FlagField) {
        match field {
            FlagField::Key(key) => self.flag.key = key,
            FlagField::Name(name) => self.flag.name = name,
            FlagField::Description(description) => self.flag.description = description,
            FlagField::Enabled(enabled) => self.flag.enabled = enabled,
            FlagField::DefaultVariantWhenOn(id) => self.flag.default_variant_when_on = id,
            FlagField::DefaultVariantWhenOff(id) => self.flag.default_variant_when_off = id,
        }
        self.flag.state = EntityState::Modified;
    }

    /// Appends a blank boolean variant and returns its placeholder id.
    pub fn add_variant(&mut self) -> String {
        let id = self.placeholder(EntityKind::Variant);
        self.flag.variants.push(Variant {
            id: id.clone(),
            variant_type: VariantType::Boolean,
            value: String::new(),
            description: None,
            state: EntityState::New,
        });
        debug!("Added variant {}", id);
        id
    }

    /// Appends a rule pointing at `variant_id` and returns its placeholder id.
    pub fn add_rule(&mut self, variant_id: &str) -> String {
        let id = self.placeholder(EntityKind::Rule);
        self.flag.rules.push(Rule {
            id: id.clone(),
            variant_id: variant_id.to_string(),
            constraints: Vec::new(),
            state: EntityState::New,
        });
        debug!("Added rule {}", id);
        id
    }

    /// Returns false when no variant has this id.
    pub fn update_variant(&mut self, id: &str, field: VariantField) -> bool {
        let Some(variant) = self.flag.variants.iter_mut().find(|v| v.id == id) else {
            return false;
        };

        match field {
            VariantField::Type(variant_type) => {
                variant.variant_type = variant_type;
                variant.value.clear();
            }
            VariantField::Value(value) => variant.value = value,
            VariantField::Description(description) => variant.description = description,
        }
        touch(&mut variant.state);
        true
    }

    /// Returns false when no rule has this id.
    pub fn update_rule(&mut self, id: &str, field: RuleField) -> bool {
        let Some(rule) = self.flag.rules.iter_mut().find(|r| r.id == id) else {
            return false;
        };

        match field {
            RuleField::Variant(variant_id) => rule.variant_id = variant_id,
            RuleField::Constraints(constraints) => rule.constraints = constraints,
        }
        touch(&mut rule.state);
        true
    }

    /// Removes an entity. Persisted entities leave a deletion record behind;
    /// new ones vanish without a trace.
    pub fn delete(&mut self, kind: EntityKind, id: &str) -> Option<Removed> {
        let (removed, state) = match kind {
            EntityKind::Variant => {
                let index = self.flag.variants.iter().position(|v| v.id == id)?;
                let variant = self.flag.variants.remove(index);
                let state = variant.state;
                (Removed::Variant { index, variant }, state)
            }
            EntityKind::Rule => {
                let index = self.flag.rules.iter().position(|r| r.id == id)?;
                let rule = self.flag.rules.remove(index);
                let state = rule.state;
                (Removed::Rule { index, rule }, state)
            }
        };

        if state != EntityState::New {
            self.deletions.push(Deletion {
                kind,
                id: id.to_string(),
                flag_id: self.flag.id.clone(),
            });
        }
        debug!("Removed {} {}", kind, id);
        Some(removed)
    }

    /// Undoes a removal, cancelling its deletion record. Returns false if an
    /// entity with the same id is already back in the working copy.
    pub fn restore(&mut self, removed: Removed) -> bool {
        let kind = removed.kind();
        let id = removed.id().to_string();
        match removed {
            Removed::Variant { index, variant } => {
                if self.flag.variant(&variant.id).is_some() {
                    return false;
                }
                let index = index.min(self.flag.variants.len());
                self.flag.variants.insert(index, variant);
            }
            Removed::Rule { index, rule } => {
                if self.flag.rule(&rule.id).is_some() {
                    return false;
                }
                let index = index.min(self.flag.rules.len());
                self.flag.rules.insert(index, rule);
            }
        }

        self.deletions.retain(|d| !(d.kind == kind && d.id == id));
        debug!("Restored {} {}", kind, id);
        true
    }

    /// Rules whose variant reference points at `variant_id`.
    pub fn rules_referencing<'a>(&'a self, variant_id: &'a str) -> impl Iterator<Item = &'a Rule> + 'a {
        self.flag.rules.iter().filter(move |r| r.variant_id == variant_id)
    }

    /// Makes the working copy the new baseline after a fully successful save.
    /// `resolved` maps placeholder ids to the ids the store assigned.
    pub fn mark_saved(&mut self, resolved: &HashMap<String, String>) {
        let resolve = |id: &mut String| {
            if let Some(real) = resolved.get(id.as_str()) {
                *id = real.clone();
            }
        };

        if let Some(id) = self.flag.default_variant_when_on.as_mut() {
            resolve(id);
        }
        if let Some(id) = self.flag.default_variant_when_off.as_mut() {
            resolve(id);
        }
        for variant in &mut self.flag.variants {
            resolve(&mut variant.id);
            variant.state = EntityState::Unmodified;
        }
        for rule in &mut self.flag.rules {
            resolve(&mut rule.id);
            resolve(&mut rule.variant_id);
            rule.state = EntityState::Unmodified;
        }
        self.flag.state = EntityState::Unmodified;
        self.deletions.clear();
    }

    fn placeholder(&mut self, kind: EntityKind) -> String {
        loop {
            self.next_placeholder += 1;
            let id = format!("new-{}-{}", kind, self.next_placeholder);
            let taken = match kind {
                EntityKind::Variant => self.flag.variant(&id).is_some(),
                EntityKind::Rule => self.flag.rule(&id).is_some(),
            };
            if !taken {
                return id;
            }
        }
    }
}

fn touch(state: &mut EntityState) {
    if *state == EntityState::Unmodified {
        *state = EntityState::Modified;
    }
}
