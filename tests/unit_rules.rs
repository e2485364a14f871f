// Filter rule reconcile against an in-memory fake of the upstream rule API.
//
// The fake mirrors upstream behavior that matters here: new rules are
// created inactive, and update is a full replace including the active flag.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use tweetwatch::db::models::FilterRule;
use tweetwatch::error::{PipelineError, PipelineResult};
use tweetwatch::rules::{FilterRuleManager, RuleOutcome, MAX_RULE_VALUE_LEN};
use tweetwatch::twitter::RuleApi;

#[derive(Default)]
struct FakeRules {
    rules: Mutex<BTreeMap<String, FilterRule>>,
    next_id: Mutex<u32>,
    /// Tags whose add_rule call fails.
    fail_add: HashSet<String>,
    fail_list: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeRules {
    fn with_rules(rules: Vec<FilterRule>) -> Self {
        let fake = FakeRules::default();
        {
            let mut map = fake.rules.lock().unwrap();
            for rule in rules {
                map.insert(rule.rule_id.clone(), rule);
            }
        }
        fake
    }

    fn by_tag(&self, tag: &str) -> Option<FilterRule> {
        self.rules
            .lock()
            .unwrap()
            .values()
            .find(|r| r.tag == tag)
            .cloned()
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuleApi for FakeRules {
    async fn list_rules(&self) -> PipelineResult<Vec<FilterRule>> {
        self.calls.lock().unwrap().push("list".to_string());
        if self.fail_list {
            return Err(PipelineError::transient("list failed"));
        }
        Ok(self.rules.lock().unwrap().values().cloned().collect())
    }

    async fn add_rule(&self, tag: &str, value: &str, interval_seconds: u32) -> PipelineResult<String> {
        self.calls.lock().unwrap().push(format!("add {tag}"));
        if self.fail_add.contains(tag) {
            return Err(PipelineError::PermanentItem(format!("rejected {tag}")));
        }
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        let rule_id = format!("new-{next}");
        self.rules.lock().unwrap().insert(
            rule_id.clone(),
            FilterRule {
                rule_id: rule_id.clone(),
                tag: tag.to_string(),
                value: value.to_string(),
                interval_seconds,
                active: false,
            },
        );
        Ok(rule_id)
    }

    async fn update_rule(&self, rule: &FilterRule) -> PipelineResult<()> {
        self.calls.lock().unwrap().push(format!("update {}", rule.tag));
        let mut rules = self.rules.lock().unwrap();
        match rules.get_mut(&rule.rule_id) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(())
            }
            None => Err(PipelineError::PermanentItem("no such rule".to_string())),
        }
    }

    async fn delete_rule(&self, rule_id: &str) -> PipelineResult<()> {
        self.calls.lock().unwrap().push(format!("delete {rule_id}"));
        self.rules.lock().unwrap().remove(rule_id);
        Ok(())
    }
}

fn accounts(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn rule(id: &str, tag: &str, value: &str, active: bool) -> FilterRule {
    FilterRule {
        rule_id: id.to_string(),
        tag: tag.to_string(),
        value: value.to_string(),
        interval_seconds: 100,
        active,
    }
}

// ============================================================
// Creation and activation
// ============================================================

#[tokio::test]
async fn new_rule_is_created_then_activated() {
    let api = Arc::new(FakeRules::default());
    let manager = FilterRuleManager::new(api.clone(), "tweetwatch", 100);

    let report = manager.reconcile(&accounts(&["alice", "bob"])).await.unwrap();

    assert_eq!(report.failures(), 0);
    assert!(matches!(report.outcomes[0], RuleOutcome::Created { .. }));
    let created = api.by_tag("tweetwatch-1").unwrap();
    assert!(created.active, "rule must end up active after the follow-up update");
    assert_eq!(created.value, "from:alice OR from:bob");
    assert_eq!(
        api.calls(),
        vec!["list", "add tweetwatch-1", "update tweetwatch-1"]
    );
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let api = Arc::new(FakeRules::default());
    let manager = FilterRuleManager::new(api.clone(), "tweetwatch", 100);
    let list = accounts(&["alice"]);

    manager.reconcile(&list).await.unwrap();
    let second = manager.reconcile(&list).await.unwrap();

    assert!(matches!(second.outcomes[..], [RuleOutcome::Unchanged { .. }]));
    assert_eq!(api.rules.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn inactive_matching_rule_is_activated() {
    let api = Arc::new(FakeRules::with_rules(vec![rule(
        "r1",
        "tweetwatch-1",
        "from:alice",
        false,
    )]));
    let manager = FilterRuleManager::new(api.clone(), "tweetwatch", 100);

    let report = manager.reconcile(&accounts(&["alice"])).await.unwrap();

    assert!(matches!(report.outcomes[..], [RuleOutcome::Activated { .. }]));
    assert!(api.by_tag("tweetwatch-1").unwrap().active);
}

#[tokio::test]
async fn changed_account_list_updates_in_place() {
    let api = Arc::new(FakeRules::with_rules(vec![rule(
        "r1",
        "tweetwatch-1",
        "from:alice",
        true,
    )]));
    let manager = FilterRuleManager::new(api.clone(), "tweetwatch", 100);

    let report = manager.reconcile(&accounts(&["alice", "carol"])).await.unwrap();

    assert!(matches!(report.outcomes[..], [RuleOutcome::Updated { .. }]));
    let updated = api.by_tag("tweetwatch-1").unwrap();
    assert_eq!(updated.rule_id, "r1");
    assert_eq!(updated.value, "from:alice OR from:carol");
}

// ============================================================
// Failures and ownership
// ============================================================

#[tokio::test]
async fn one_failure_does_not_block_the_others() {
    // Long handles force one rule per account
    let long: Vec<String> = (0..3)
        .map(|i| format!("{}{i}", "x".repeat(MAX_RULE_VALUE_LEN / 2)))
        .collect();
    let mut api = FakeRules::default();
    api.fail_add.insert("tweetwatch-2".to_string());
    let api = Arc::new(api);
    let manager = FilterRuleManager::new(api.clone(), "tweetwatch", 100);

    let report = manager.reconcile(&long).await.unwrap();

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.failures(), 1);
    assert!(api.by_tag("tweetwatch-1").unwrap().active);
    assert!(api.by_tag("tweetwatch-2").is_none());
    assert!(api.by_tag("tweetwatch-3").unwrap().active);
}

#[tokio::test]
async fn surplus_owned_rules_are_deleted_and_foreign_rules_kept() {
    let api = Arc::new(FakeRules::with_rules(vec![
        rule("r1", "tweetwatch-1", "from:alice", true),
        rule("r2", "tweetwatch-2", "from:old", true),
        rule("r3", "manual", "from:someone", true),
        rule("r4", "tweetwatchers", "from:other", true),
    ]));
    let manager = FilterRuleManager::new(api.clone(), "tweetwatch", 100);

    let report = manager.reconcile(&accounts(&["alice"])).await.unwrap();

    assert_eq!(report.failures(), 0);
    assert!(report
        .outcomes
        .iter()
        .any(|o| matches!(o, RuleOutcome::Deleted { rule_id, .. } if rule_id == "r2")));
    let remaining: Vec<String> = api.rules.lock().unwrap().keys().cloned().collect();
    assert_eq!(remaining, vec!["r1", "r3", "r4"]);
}

#[tokio::test]
async fn list_failure_is_an_error() {
    let api = Arc::new(FakeRules {
        fail_list: true,
        ..Default::default()
    });
    let manager = FilterRuleManager::new(api.clone(), "tweetwatch", 100);

    assert!(manager.reconcile(&accounts(&["alice"])).await.is_err());
    assert_eq!(api.calls(), vec!["list"]);
}
