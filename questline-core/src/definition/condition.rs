//! Conditions, condition groups and switch cases.
//!
//! Conditions are data only; evaluation lives in the interpreter, which owns
//! the variable scopes and the host capabilities they read.

use serde::{Deserialize, Serialize};

use super::action::VarScope;
use crate::types::QuestId;

/// Comparison operator used by switches and conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// Equal.
    #[serde(rename = "==", alias = "eq", alias = "=")]
    Eq,
    /// Not equal.
    #[serde(rename = "!=", alias = "ne")]
    Ne,
    /// Less than.
    #[serde(rename = "<", alias = "lt")]
    Lt,
    /// Less than or equal.
    #[serde(rename = "<=", alias = "le")]
    Le,
    /// Greater than.
    #[serde(rename = ">", alias = "gt")]
    Gt,
    /// Greater than or equal.
    #[serde(rename = ">=", alias = "ge")]
    Ge,
}

impl CompareOp {
    /// Compare two numbers.
    #[must_use]
    pub fn numbers(self, a: f64, b: f64) -> bool {
        match self {
            Self::Eq => (a - b).abs() < f64::EPSILON,
            Self::Ne => (a - b).abs() >= f64::EPSILON,
            Self::Lt => a < b,
            Self::Le => a <= b,
            Self::Gt => a > b,
            Self::Ge => a >= b,
        }
    }

    /// Compare two strings (ordering operators compare lexicographically).
    #[must_use]
    pub fn strings(self, a: &str, b: &str) -> bool {
        match self {
            Self::Eq => a == b,
            Self::Ne => a != b,
            Self::Lt => a < b,
            Self::Le => a <= b,
            Self::Gt => a > b,
            Self::Ge => a >= b,
        }
    }
}

/// One predicate. Tagged by `type` in content files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Compare two formulas or texts.
    Compare {
        /// Left operand.
        left: String,
        /// Operator.
        op: CompareOp,
        /// Right operand.
        right: String,
    },
    /// Compare a scoped variable.
    Variable {
        /// Variable name.
        name: String,
        /// Scope.
        #[serde(default)]
        scope: VarScope,
        /// Operator.
        op: CompareOp,
        /// Formula or text to compare against.
        value: String,
    },
    /// The player holds items.
    HasItem {
        /// Item name.
        item: String,
        /// Minimum amount.
        #[serde(default = "default_one")]
        amount: u32,
    },
    /// The player holds a permission.
    Permission {
        /// Permission node.
        permission: String,
    },
    /// A quest has been completed at least once.
    QuestCompleted {
        /// Quest id.
        quest: QuestId,
    },
    /// A quest is running.
    QuestActive {
        /// Quest id.
        quest: QuestId,
    },
    /// The player is in a world.
    World {
        /// World name.
        world: String,
    },
    /// An objective of this quest has been recorded complete.
    Objective {
        /// Objective key (`branch:node`).
        key: String,
    },
    /// A progress counter compares against a value.
    Counter {
        /// Counter key.
        key: String,
        /// Operator.
        op: CompareOp,
        /// Value.
        value: f64,
    },
    /// A pool's token balance compares against a value.
    PoolTokens {
        /// Pool id.
        pool: String,
        /// Operator.
        op: CompareOp,
        /// Value.
        value: f64,
    },
    /// Random chance in percent.
    Chance {
        /// Probability 0..=100.
        percent: f64,
    },
    /// A condition this build does not know. Never satisfied.
    #[serde(other)]
    Unknown,
}

/// A list of conditions with an optional threshold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionGroup {
    /// Member conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Conditions that must hold (default: all).
    #[serde(default)]
    pub min_matches: Option<usize>,
    /// Conditions allowed to fail.
    #[serde(default)]
    pub max_misses: Option<usize>,
}

impl ConditionGroup {
    /// A group requiring every condition.
    #[must_use]
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self {
            conditions,
            min_matches: None,
            max_misses: None,
        }
    }

    /// Decide the group from the number of satisfied members.
    #[must_use]
    pub fn satisfied_by(&self, matches: usize) -> bool {
        let total = self.conditions.len();
        let misses = total.saturating_sub(matches);
        let required = self.min_matches.unwrap_or(total).min(total);
        matches >= required && self.max_misses.is_none_or(|max| misses <= max)
    }
}

/// A case of a condition switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionCase {
    /// All groups must hold.
    #[serde(default)]
    pub groups: Vec<ConditionGroup>,
    /// Target when the case matches.
    pub goto: String,
}

/// A case of a logic switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicCase {
    /// Operator applied as `subject <op> value`.
    pub op: CompareOp,
    /// Formula or text.
    pub value: String,
    /// Target when the case matches.
    pub goto: String,
}

fn default_one() -> u32 { 1 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_symbols_and_aliases() {
        let ops: Vec<CompareOp> =
            serde_json::from_str(r#"["==", ">=", "lt", "!="]"#).expect("parse");
        assert_eq!(ops, vec![CompareOp::Eq, CompareOp::Ge, CompareOp::Lt, CompareOp::Ne]);
        assert!(CompareOp::Ge.numbers(5.0, 5.0));
        assert!(!CompareOp::Gt.numbers(5.0, 5.0));
        assert!(CompareOp::Eq.strings("knight", "knight"));
    }

    #[test]
    fn group_thresholds() {
        let group = ConditionGroup {
            conditions: vec![Condition::Unknown, Condition::Unknown, Condition::Unknown],
            min_matches: Some(2),
            max_misses: None,
        };
        assert!(group.satisfied_by(2));
        assert!(!group.satisfied_by(1));

        let strict = ConditionGroup {
            conditions: vec![Condition::Unknown, Condition::Unknown, Condition::Unknown],
            min_matches: Some(0),
            max_misses: Some(1),
        };
        assert!(strict.satisfied_by(2));
        assert!(!strict.satisfied_by(1));

        assert!(ConditionGroup::all(Vec::new()).satisfied_by(0));
    }
}
