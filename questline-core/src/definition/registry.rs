//! Definition registry with atomic snapshot swap on reload.
//!
//! Readers take an `Arc<DefinitionSet>` and keep using it for as long as
//! they like; a reload builds a fresh set and swaps the pointer, so nobody
//! ever observes a half-loaded catalogue.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::QuestDefinition;
use crate::types::QuestId;

/// An immutable catalogue of validated definitions.
#[derive(Debug, Default)]
pub struct DefinitionSet {
    quests: HashMap<QuestId, Arc<QuestDefinition>>,
}

impl DefinitionSet {
    /// Look up a definition.
    #[must_use]
    pub fn get(&self, id: &QuestId) -> Option<&Arc<QuestDefinition>> {
        self.quests.get(id)
    }

    /// Number of definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.quests.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.quests.is_empty()
    }

    /// Sorted quest ids.
    #[must_use]
    pub fn ids(&self) -> Vec<QuestId> {
        let mut ids: Vec<QuestId> = self.quests.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Outcome of a (re)load.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Definitions accepted.
    pub loaded: usize,
    /// Definitions rejected, with the reason.
    pub rejected: Vec<(QuestId, String)>,
    /// Non-fatal content warnings.
    pub warnings: Vec<String>,
}

/// Holds the current definition snapshot.
#[derive(Debug)]
pub struct DefinitionRegistry {
    current: Arc<DefinitionSet>,
    default_branch: String,
    outcome_prefix: String,
}

impl DefinitionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(default_branch: impl Into<String>, outcome_prefix: impl Into<String>) -> Self {
        Self {
            current: Arc::new(DefinitionSet::default()),
            default_branch: default_branch.into(),
            outcome_prefix: outcome_prefix.into(),
        }
    }

    /// Validate `defs` and swap them in as the new snapshot.
    ///
    /// Definitions without a usable start node are rejected; everything
    /// else is loaded with its warnings logged.
    pub fn reload(&mut self, defs: Vec<QuestDefinition>) -> LoadReport {
        let mut report = LoadReport::default();
        let mut quests = HashMap::with_capacity(defs.len());
        for def in defs {
            match def.validate(&self.default_branch, &self.outcome_prefix) {
                Ok(warnings) => {
                    for w in &warnings {
                        warn!(quest = %def.id, "{w}");
                    }
                    report.warnings.extend(warnings.into_iter().map(|w| format!("{}: {w}", def.id)));
                    if quests.contains_key(&def.id) {
                        warn!(quest = %def.id, "Duplicate quest id; later definition wins");
                    }
                    quests.insert(def.id.clone(), Arc::new(def));
                }
                Err(reason) => {
                    warn!(quest = %def.id, %reason, "Rejected quest definition");
                    report.rejected.push((def.id.clone(), reason));
                }
            }
        }
        report.loaded = quests.len();
        self.current = Arc::new(DefinitionSet { quests });
        info!(
            loaded = report.loaded,
            rejected = report.rejected.len(),
            "Quest definitions loaded"
        );
        report
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<DefinitionSet> {
        Arc::clone(&self.current)
    }

    /// Look up a definition in the current snapshot.
    #[must_use]
    pub fn get(&self, id: &QuestId) -> Option<Arc<QuestDefinition>> {
        self.current.get(id).cloned()
    }

    /// Number of loaded definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current.len()
    }

    /// Whether no definitions are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Branch, Node, NodeKind};

    fn quest(id: &str, start: &str) -> QuestDefinition {
        QuestDefinition::new(id).with_branch(
            "main",
            Branch::new(start).with_node("a", Node::new(NodeKind::None)),
        )
    }

    #[test]
    fn reload_rejects_missing_start_and_swaps_snapshot() {
        let mut reg = DefinitionRegistry::new("main", "end:");
        let report = reg.reload(vec![quest("good", "a"), quest("bad", "zzz")]);
        assert_eq!(report.loaded, 1);
        assert_eq!(report.rejected.len(), 1);
        assert!(reg.get(&"good".into()).is_some());

        let old = reg.snapshot();
        reg.reload(vec![quest("other", "a")]);
        assert!(old.get(&"good".into()).is_some(), "old snapshot unchanged");
        assert!(reg.get(&"good".into()).is_none());
        assert_eq!(reg.snapshot().ids(), vec![QuestId::from("other")]);
    }
}
