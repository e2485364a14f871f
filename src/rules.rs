// Filter rule manager: keeps the upstream's server-side filter rules in
// line with the configured account list.
//
// Accounts are packed into `from:a OR from:b` expressions under the upstream
// length ceiling; each expression becomes one rule tagged `{prefix}-{n}`.
// Only rules carrying our prefix are touched, so rules created by hand on the
// upstream dashboard survive a reconcile.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::db::models::FilterRule;
use crate::error::PipelineResult;
use crate::twitter::RuleApi;

/// Upstream limit on a rule's match expression.
pub const MAX_RULE_VALUE_LEN: usize = 255;

/// What reconcile did to one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleOutcome {
    /// Created and then activated.
    Created { tag: String, rule_id: String },
    /// Expression or interval changed.
    Updated { tag: String, rule_id: String },
    /// Existed with the right expression but was inactive.
    Activated { tag: String, rule_id: String },
    Unchanged { tag: String, rule_id: String },
    Deleted { tag: String, rule_id: String },
    Failed { tag: String, error: String },
}

impl RuleOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RuleOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub outcomes: Vec<RuleOutcome>,
}

impl ReconcileReport {
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }
}

/// A rule as it should exist upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRule {
    pub tag: String,
    pub value: String,
}

pub struct FilterRuleManager {
    api: Arc<dyn RuleApi>,
    tag_prefix: String,
    interval_seconds: u32,
}

impl FilterRuleManager {
    pub fn new(api: Arc<dyn RuleApi>, tag_prefix: &str, interval_seconds: u32) -> Self {
        Self {
            api,
            tag_prefix: tag_prefix.to_string(),
            interval_seconds,
        }
    }

    fn owns(&self, rule: &FilterRule) -> bool {
        rule.tag
            .strip_prefix(&self.tag_prefix)
            .is_some_and(|rest| rest.starts_with('-'))
    }

    /// Pack accounts into as few rule expressions as fit the length ceiling.
    ///
    /// A single handle longer than the ceiling still gets its own rule; the
    /// upstream will reject it and that rule alone reports a failure.
    pub fn desired_rules(&self, accounts: &[String]) -> Vec<DesiredRule> {
        let mut values: Vec<String> = Vec::new();
        let mut current = String::new();

        for account in accounts {
            let clause = format!("from:{account}");
            if current.is_empty() {
                current = clause;
            } else if current.len() + " OR ".len() + clause.len() <= MAX_RULE_VALUE_LEN {
                current.push_str(" OR ");
                current.push_str(&clause);
            } else {
                values.push(std::mem::replace(&mut current, clause));
            }
        }
        if !current.is_empty() {
            values.push(current);
        }

        values
            .into_iter()
            .enumerate()
            .map(|(i, value)| DesiredRule {
                tag: format!("{}-{}", self.tag_prefix, i + 1),
                value,
            })
            .collect()
    }

    /// Bring the upstream rules in line with `accounts`.
    ///
    /// Only a failure to list the existing rules is returned as an error;
    /// every per-rule failure lands in the report and the rest carry on.
    pub async fn reconcile(&self, accounts: &[String]) -> PipelineResult<ReconcileReport> {
        let existing = self.api.list_rules().await?;
        let desired = self.desired_rules(accounts);

        let mut ours: HashMap<String, FilterRule> = existing
            .into_iter()
            .filter(|r| self.owns(r))
            .map(|r| (r.tag.clone(), r))
            .collect();

        let mut report = ReconcileReport::default();

        for want in &desired {
            let outcome = match ours.remove(&want.tag) {
                Some(have) => self.converge(have, want).await,
                None => self.create(want).await,
            };
            log_outcome(&outcome);
            report.outcomes.push(outcome);
        }

        // Whatever is left carries our prefix but is no longer wanted
        let mut surplus: Vec<FilterRule> = ours.into_values().collect();
        surplus.sort_by(|a, b| a.tag.cmp(&b.tag));
        for rule in surplus {
            let outcome = match self.api.delete_rule(&rule.rule_id).await {
                Ok(()) => RuleOutcome::Deleted {
                    tag: rule.tag,
                    rule_id: rule.rule_id,
                },
                Err(e) => RuleOutcome::Failed {
                    tag: rule.tag,
                    error: e.to_string(),
                },
            };
            log_outcome(&outcome);
            report.outcomes.push(outcome);
        }

        info!(
            rules = report.outcomes.len(),
            failures = report.failures(),
            "Filter rule reconcile complete"
        );
        Ok(report)
    }

    /// Create inactive, then activate with a full replace.
    async fn create(&self, want: &DesiredRule) -> RuleOutcome {
        let rule_id = match self
            .api
            .add_rule(&want.tag, &want.value, self.interval_seconds)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                return RuleOutcome::Failed {
                    tag: want.tag.clone(),
                    error: e.to_string(),
                }
            }
        };

        let active = FilterRule {
            rule_id: rule_id.clone(),
            tag: want.tag.clone(),
            value: want.value.clone(),
            interval_seconds: self.interval_seconds,
            active: true,
        };
        match self.api.update_rule(&active).await {
            Ok(()) => RuleOutcome::Created {
                tag: want.tag.clone(),
                rule_id,
            },
            Err(e) => RuleOutcome::Failed {
                tag: want.tag.clone(),
                error: format!("created {rule_id} but activation failed: {e}"),
            },
        }
    }

    async fn converge(&self, have: FilterRule, want: &DesiredRule) -> RuleOutcome {
        let config_matches =
            have.value == want.value && have.interval_seconds == self.interval_seconds;
        if config_matches && have.active {
            return RuleOutcome::Unchanged {
                tag: have.tag,
                rule_id: have.rule_id,
            };
        }

        let target = FilterRule {
            rule_id: have.rule_id.clone(),
            tag: want.tag.clone(),
            value: want.value.clone(),
            interval_seconds: self.interval_seconds,
            active: true,
        };
        match self.api.update_rule(&target).await {
            Ok(()) if config_matches => RuleOutcome::Activated {
                tag: target.tag,
                rule_id: target.rule_id,
            },
            Ok(()) => RuleOutcome::Updated {
                tag: target.tag,
                rule_id: target.rule_id,
            },
            Err(e) => RuleOutcome::Failed {
                tag: target.tag,
                error: e.to_string(),
            },
        }
    }
}

fn log_outcome(outcome: &RuleOutcome) {
    match outcome {
        RuleOutcome::Failed { tag, error } => warn!(tag, error, "Filter rule reconcile failed"),
        other => info!(outcome = ?other, "Filter rule"),
    }
}
