//! Built-in matching rules and the immutable registry the engine evaluates them from.

use rust_decimal::Decimal;
use serde::Serialize;

pub const EXACT_MATCH: &str = "EXACT_MATCH";
pub const PARTIAL_MATCH: &str = "PARTIAL_MATCH";
pub const DUPLICATE_DETECTION: &str = "DUPLICATE_DETECTION";

/// Rule name stored on results no rule claimed.
pub const UNMATCHED_RULE: &str = "UNMATCHED";

/// ±2% relative amount difference.
pub fn default_partial_variance() -> Decimal {
    Decimal::new(2, 2)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCriteria {
    pub fields: Vec<String>,
    pub amount_variance: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub match_criteria: MatchCriteria,
}

impl Rule {
    pub fn new(name: &str, priority: i32, fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            priority,
            enabled: true,
            match_criteria: MatchCriteria {
                fields: fields.iter().map(|f| f.to_string()).collect(),
                amount_variance: None,
            },
        }
    }

    pub fn with_amount_variance(mut self, variance: Decimal) -> Self {
        self.match_criteria.amount_variance = Some(variance);
        self
    }
}

/// Ordered rule set. Built once at startup and shared read-only; changing the
/// enabled set means building a new registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleRegistry {
    rules: Vec<Rule>,
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::builtin(default_partial_variance())
    }
}

impl RuleRegistry {
    pub fn new(mut rules: Vec<Rule>) -> Self {
        // Stable sort: equal priorities keep declaration order.
        rules.sort_by_key(|r| r.priority);
        Self { rules }
    }

    pub fn builtin(partial_variance: Decimal) -> Self {
        Self::new(vec![
            Rule::new(EXACT_MATCH, 1, &["transactionId", "amount"]),
            Rule::new(PARTIAL_MATCH, 2, &["referenceNumber"]).with_amount_variance(partial_variance),
            Rule::new(DUPLICATE_DETECTION, 3, &["transactionId"]),
        ])
    }

    /// Disable every rule whose name appears in `names`. Unknown names are ignored.
    pub fn with_disabled<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        for rule in &mut self.rules {
            if names.iter().any(|n| n.as_ref().eq_ignore_ascii_case(&rule.name)) {
                rule.enabled = false;
            }
        }
        self
    }

    /// Enabled rules, ascending priority.
    pub fn active_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    pub fn rule_by_name(&self, name: &str) -> Option<&Rule> {
        self.active_rules().find(|r| r.name == name)
    }

    pub fn all(&self) -> &[Rule] {
        &self.rules
    }
}
