use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ProgressionRule, ScheduleType};

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// The single active rule for a schedule type, or
    /// [`ProgressionError::RuleNotFound`](crate::error::ProgressionError::RuleNotFound).
    async fn active_rule(&self, schedule_type: ScheduleType) -> Result<ProgressionRule>;

    async fn list_rules(&self) -> Result<Vec<ProgressionRule>>;

    /// Validates and stores a rule. Saving an active rule deactivates every
    /// other rule for the same schedule type.
    async fn save_rule(&self, rule: &ProgressionRule) -> Result<()>;
}

/// Picks the active rule out of a set of stored rules, enforcing at most one
/// active rule per schedule type on the read side as well.
pub fn select_active(
    rules: &[ProgressionRule],
    schedule_type: ScheduleType,
) -> Option<&ProgressionRule> {
    let mut active = rules
        .iter()
        .filter(|rule| rule.schedule_type == schedule_type && rule.is_active);
    let first = active.next();
    if active.next().is_some() {
        tracing::warn!(%schedule_type, "more than one active rule stored; using the first");
    }
    first
}
