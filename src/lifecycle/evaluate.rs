//! Lifecycle rule evaluation
//!
//! Pure functions deciding what should happen to an object version or a
//! multipart upload at a given instant. Rules are walked in document
//! order; the first expiration decision wins and transitions across rules
//! resolve to the heaviest target class.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::model::Rule;
use crate::config::LifecycleConfig;
use crate::meta::StorageClass;

/// What the worker should do with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Action {
    #[default]
    None,
    Delete,
    DeleteMarker,
    Transition,
    AbortMultipartUpload,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::None => "none",
            Action::Delete => "delete",
            Action::DeleteMarker => "delete_marker",
            Action::Transition => "transition",
            Action::AbortMultipartUpload => "abort_multipart_upload",
        }
    }
}

/// Evaluation clock: the current instant and the length of one rule day.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext {
    pub now: DateTime<Utc>,
    pub day: Duration,
}

impl EvalContext {
    pub fn new(now: DateTime<Utc>, debug_mode: bool) -> Self {
        let day = if debug_mode {
            Duration::seconds(1)
        } else {
            Duration::days(1)
        };
        Self { now, day }
    }

    pub fn from_config(config: &LifecycleConfig) -> Self {
        Self::new(Utc::now(), config.debug_mode)
    }

    /// Whether `days` rule days have fully elapsed since `start`.
    /// Windows too large to represent never elapse.
    fn elapsed(&self, start: DateTime<Utc>, days: i64) -> bool {
        let Some(millis) = self.day.num_milliseconds().checked_mul(days) else {
            return false;
        };
        match start.checked_add_signed(Duration::milliseconds(millis)) {
            Some(deadline) => self.now > deadline,
            None => false,
        }
    }

    fn past(&self, date: Option<DateTime<Utc>>) -> bool {
        date.map(|d| self.now > d).unwrap_or(false)
    }
}

/// The facts about an object version rules are evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct ObjectFacts<'a> {
    pub name: &'a str,
    pub tags: &'a BTreeMap<String, String>,
    pub storage_class: StorageClass,
    /// Modification time of the version, or for non-current versions the
    /// time it stopped being current.
    pub mod_time: DateTime<Utc>,
    /// The version is a delete marker with no other version behind it.
    pub lone_delete_marker: bool,
}

/// Action and target class for a transition.
pub type Decision = (Action, Option<StorageClass>);

fn transition_outcome(object: StorageClass, action: Action, target: StorageClass) -> Decision {
    if object.weight() >= target.weight() {
        return (Action::None, None);
    }
    (action, Some(target))
}

fn heavier(current: StorageClass, candidate: Option<StorageClass>) -> StorageClass {
    match candidate {
        Some(c) if c.weight() > current.weight() => c,
        _ => current,
    }
}

/// Decide the action for a current version.
pub fn compute_action(ctx: &EvalContext, object: &ObjectFacts<'_>, rules: &[Rule]) -> Decision {
    let mut action = Action::None;
    let mut target = StorageClass::Standard;
    if object.name.is_empty() {
        return (Action::None, None);
    }

    for rule in rules {
        if !rule.is_enabled() || !rule.matches(object.name, object.tags) {
            continue;
        }

        if let Some(expiration) = &rule.expiration {
            let due = ctx.past(expiration.date())
                || expiration
                    .days
                    .map(|d| ctx.elapsed(object.mod_time, d))
                    .unwrap_or(false);
            if expiration.delete_marker() {
                if object.lone_delete_marker {
                    return (Action::DeleteMarker, None);
                }
            } else if due {
                if object.lone_delete_marker {
                    return (Action::None, None);
                }
                return (Action::Delete, None);
            }
        }

        for transition in &rule.transitions {
            let due = ctx.past(transition.date())
                || transition
                    .days
                    .map(|d| ctx.elapsed(object.mod_time, d))
                    .unwrap_or(false);
            if due {
                action = Action::Transition;
                target = heavier(target, transition.target());
            }
        }
    }
    transition_outcome(object.storage_class, action, target)
}

/// Decide the action for a non-current version. `object.mod_time` is when
/// the version stopped being current.
pub fn compute_action_for_noncurrent(
    ctx: &EvalContext,
    object: &ObjectFacts<'_>,
    rules: &[Rule],
) -> Decision {
    let mut action = Action::None;
    let mut target = StorageClass::Standard;
    if object.name.is_empty() {
        return (Action::None, None);
    }

    for rule in rules {
        if !rule.is_enabled() || !rule.matches(object.name, object.tags) {
            continue;
        }
        if let Some(days) = rule
            .noncurrent_version_expiration
            .as_ref()
            .and_then(|e| e.noncurrent_days)
        {
            if ctx.elapsed(object.mod_time, days) {
                return (Action::Delete, None);
            }
        }
        for transition in &rule.noncurrent_version_transitions {
            let due = transition
                .noncurrent_days
                .map(|d| ctx.elapsed(object.mod_time, d))
                .unwrap_or(false);
            if due {
                action = Action::Transition;
                target = heavier(target, transition.target());
            }
        }
    }
    transition_outcome(object.storage_class, action, target)
}

/// Decide whether an incomplete multipart upload should be aborted.
/// Abort rules carry no tags, so only the prefix is matched.
pub fn compute_action_for_abort(
    ctx: &EvalContext,
    name: &str,
    initiated: DateTime<Utc>,
    rules: &[Rule],
) -> Action {
    if name.is_empty() {
        return Action::None;
    }
    let no_tags = BTreeMap::new();
    for rule in rules {
        if !rule.is_enabled() || !rule.matches(name, &no_tags) {
            continue;
        }
        let days = rule
            .abort_incomplete_multipart_upload
            .as_ref()
            .and_then(|a| a.days_after_initiation);
        if let Some(days) = days {
            if ctx.elapsed(initiated, days) {
                return Action::AbortMultipartUpload;
            }
        }
    }
    Action::None
}
