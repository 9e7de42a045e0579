//! Arithmetic checks over a statement draft
//!
//! Rules are deterministic and synchronous. A draft passes only when no
//! rule reports a mismatch.

use crate::models::{Formula, Mismatch, ReconciliationCheck, StatementDraft};
use tracing::debug;

/// Relative slack that absorbs floating-point noise on exact checks
const FLOAT_NOISE: f64 = 1e-9;

/// Trait for reconciliation rules
pub trait CheckRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, draft: &StatementDraft, tolerance: f64) -> Vec<Mismatch>;
}

/// Whether `actual` matches `expected` within `tolerance`
pub fn within_tolerance(expected: f64, actual: f64, tolerance: f64) -> bool {
    let noise = FLOAT_NOISE * expected.abs().max(actual.abs()).max(1.0);
    (actual - expected).abs() <= tolerance + noise
}

/// `Σ sign·component`, or `None` if a component is missing
pub fn formula_sum(draft: &StatementDraft, formula: &Formula) -> Option<f64> {
    formula
        .components
        .iter()
        .map(|term| draft.value_of(&term.item).map(|v| term.sign * v))
        .sum()
}

/// Rule: every declared total equals the signed sum of its components
pub struct FormulaSumRule;

impl CheckRule for FormulaSumRule {
    fn name(&self) -> &'static str {
        "formula_sum"
    }

    fn check(&self, draft: &StatementDraft, tolerance: f64) -> Vec<Mismatch> {
        draft
            .formulas
            .iter()
            .filter_map(|formula| {
                let actual = draft.value_of(&formula.total)?;
                let expected = formula_sum(draft, formula)?;
                if within_tolerance(expected, actual, tolerance) {
                    return None;
                }
                Some(Mismatch {
                    line_item: formula.total.clone(),
                    expected,
                    actual,
                    delta: actual - expected,
                })
            })
            .collect()
    }
}

/// Rule: formulas only reference line items that exist. The sum rule
/// skips such formulas, so they are reported here.
pub struct ComponentPresenceRule;

impl CheckRule for ComponentPresenceRule {
    fn name(&self) -> &'static str {
        "component_presence"
    }

    fn check(&self, draft: &StatementDraft, _tolerance: f64) -> Vec<Mismatch> {
        draft
            .formulas
            .iter()
            .filter(|f| {
                draft.value_of(&f.total).is_none()
                    || f.components.iter().any(|t| draft.value_of(&t.item).is_none())
            })
            .map(|f| {
                let actual = draft.value_of(&f.total).unwrap_or(f64::NAN);
                Mismatch {
                    line_item: f.total.clone(),
                    expected: f64::NAN,
                    actual,
                    delta: f64::NAN,
                }
            })
            .collect()
    }
}

/// Runs every rule against a draft
pub struct CheckEngine {
    rules: Vec<Box<dyn CheckRule>>,
}

impl CheckEngine {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: Box<dyn CheckRule>) {
        self.rules.push(rule);
    }

    pub fn check(&self, draft: &StatementDraft, tolerance: f64) -> ReconciliationCheck {
        let mut mismatches = Vec::new();

        for rule in &self.rules {
            let found = rule.check(draft, tolerance);
            if !found.is_empty() {
                debug!(rule = rule.name(), count = found.len(), "Check rule failed");
            }
            mismatches.extend(found);
        }

        ReconciliationCheck {
            passed: mismatches.is_empty(),
            tolerance,
            mismatches,
        }
    }
}

impl Default for CheckEngine {
    fn default() -> Self {
        let mut engine = Self::new();
        engine.add_rule(Box::new(ComponentPresenceRule));
        engine.add_rule(Box::new(FormulaSumRule));
        engine
    }
}
