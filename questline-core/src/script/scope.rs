//! Variable scopes, placeholder interpolation and condition evaluation.

use rand::Rng;
use rand::rngs::StdRng;

use crate::cache::ServerVariables;
use crate::definition::{CompareOp, Condition, ConditionGroup, VarScope};
use crate::expr::{self, Expr, NoVars, VarRef};
use crate::host::Host;
use crate::state::{PlayerState, QuestProgress};
use crate::types::{PlayerId, QuestId};

/// Read-only view of every variable scope visible to one quest of one player.
pub(crate) struct Scope<'a> {
    pub player: PlayerId,
    pub quest: Option<&'a QuestId>,
    pub state: Option<&'a PlayerState>,
    pub server: &'a ServerVariables,
    pub host: &'a dyn Host,
}

impl Scope<'_> {
    fn progress(&self) -> Option<&QuestProgress> {
        self.state?.active.get(self.quest?)
    }

    /// Text value of a placeholder, `None` when unset.
    pub fn text(&self, var: &VarRef) -> Option<String> {
        let name = var.name.as_str();
        match var.scope.as_deref() {
            None => match name {
                "player" => Some(
                    self.host
                        .player_name(self.player)
                        .unwrap_or_else(|| self.player.to_string()),
                ),
                "quest" => self.quest.map(ToString::to_string),
                _ => self.progress()?.variables.get(name).cloned(),
            },
            Some("var" | "quest") => self.progress()?.variables.get(name).cloned(),
            Some("user") => self.state?.user_vars.get(name).cloned(),
            Some("server") => self.server.get(name).map(str::to_string),
            Some("counter") => self
                .progress()?
                .counters
                .get(name)
                .map(|v| expr::format_number(*v)),
            Some("pool") => self.state?.pools.get(name).map(|p| p.tokens.to_string()),
            Some("streak") => self.state?.pools.get(name).map(|p| p.streak.to_string()),
            Some("item") => Some(self.host.count_item(self.player, name).to_string()),
            Some(_) => None,
        }
    }

    /// Value of a scoped variable by [`VarScope`].
    pub fn variable(&self, scope: VarScope, name: &str) -> Option<String> {
        match scope {
            VarScope::Quest => self.progress()?.variables.get(name).cloned(),
            VarScope::User => self.state?.user_vars.get(name).cloned(),
            VarScope::Server => self.server.get(name).map(str::to_string),
        }
    }

    /// Replace placeholders; unknown ones stay verbatim.
    pub fn interpolate(&self, template: &str) -> String {
        if !template.contains('{') {
            return template.to_string();
        }
        expr::interpolate(template, &|v| self.text(v))
    }

    /// Evaluate `src` as a number: placeholders resolve (unset numeric
    /// scopes read as `0`), then the text must be a literal or a formula
    /// without free variables. `None` means the value is text.
    pub fn numeric(&self, src: &str) -> Option<f64> {
        let text = expr::interpolate(src, &|v| self.text(v).or_else(|| zero_default(v)));
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(n) = trimmed.parse::<f64>() {
            return Some(n);
        }
        let compiled = Expr::compile(trimmed).ok()?;
        if compiled.variables().next().is_some() {
            return None;
        }
        compiled.eval(&NoVars).ok()
    }

    /// Evaluate a formula, degrading malformed input to `0`.
    pub fn number_or_zero(&self, src: &str) -> f64 {
        self.numeric(src).unwrap_or_else(|| {
            tracing::warn!(formula = src, "Value is not numeric; using 0");
            0.0
        })
    }

    /// `left <op> right`: numeric when both sides are numeric, textual otherwise.
    pub fn compare(&self, left: &str, op: CompareOp, right: &str) -> bool {
        match (self.numeric(left), self.numeric(right)) {
            (Some(a), Some(b)) => op.numbers(a, b),
            _ => op.strings(&self.interpolate(left), &self.interpolate(right)),
        }
    }

    fn compare_value(&self, current: Option<String>, op: CompareOp, right: &str) -> bool {
        let current_num = match &current {
            Some(text) => text.trim().parse::<f64>().ok(),
            None => Some(0.0),
        };
        match (current_num, self.numeric(right)) {
            (Some(a), Some(b)) => op.numbers(a, b),
            _ => op.strings(current.as_deref().unwrap_or(""), &self.interpolate(right)),
        }
    }

    /// Evaluate one condition.
    pub fn condition(&self, condition: &Condition, rng: &mut StdRng) -> bool {
        match condition {
            Condition::Compare { left, op, right } => self.compare(left, *op, right),
            Condition::Variable { name, scope, op, value } => {
                self.compare_value(self.variable(*scope, name), *op, value)
            }
            Condition::HasItem { item, amount } => self.host.count_item(self.player, item) >= *amount,
            Condition::Permission { permission } => self.host.has_permission(self.player, permission),
            Condition::QuestCompleted { quest } => self.state.is_some_and(|s| s.has_completed(quest)),
            Condition::QuestActive { quest } => self.state.is_some_and(|s| s.is_active(quest)),
            Condition::World { world } => self
                .host
                .location_of(self.player)
                .is_some_and(|l| l.world.eq_ignore_ascii_case(world)),
            Condition::Objective { key } => self.progress().is_some_and(|p| p.objectives.contains(key)),
            Condition::Counter { key, op, value } => {
                op.numbers(self.progress().map_or(0.0, |p| p.counter(key)), *value)
            }
            Condition::PoolTokens { pool, op, value } => {
                #[allow(clippy::cast_precision_loss)]
                let tokens = self
                    .state
                    .and_then(|s| s.pools.get(pool))
                    .map_or(0.0, |p| p.tokens as f64);
                op.numbers(tokens, *value)
            }
            Condition::Chance { percent } => rng.gen_range(0.0..100.0) < *percent,
            Condition::Unknown => {
                tracing::warn!(player = %self.player, "Unknown condition type; treated as unsatisfied");
                false
            }
        }
    }

    /// Evaluate a group against its thresholds.
    pub fn group(&self, group: &ConditionGroup, rng: &mut StdRng) -> bool {
        let matches = group
            .conditions
            .iter()
            .filter(|c| self.condition(c, rng))
            .count();
        group.satisfied_by(matches)
    }

    /// Whether every group holds.
    pub fn all_groups(&self, groups: &[ConditionGroup], rng: &mut StdRng) -> bool {
        groups.iter().all(|g| self.group(g, rng))
    }
}

fn zero_default(var: &VarRef) -> Option<String> {
    match var.scope.as_deref() {
        None | Some("var" | "quest" | "user" | "server" | "counter" | "pool" | "streak" | "item") => {
            Some("0".to_string())
        }
        Some(_) => None,
    }
}
