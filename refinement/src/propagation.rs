//! Cross-unit fact propagation with a hard depth limit.
//!
//! ```text
//! X finalizes, fact f changes
//!   depth 0 → every terminal unit citing f is re-opened for one
//!             critical-stage mini-round
//!   depth 1 → a mini-round changed another fact: nothing is re-opened,
//!             one unresolved cross-reference per citing unit
//!   depth 2+ → cycle attempt: recorded as unresolved, never mutates state
//! ```
//!
//! Units that cite `f` but have not started are left alone; they read the
//! updated value from the [`FactIndex`] when they start. Units already
//! running get a pending change instead, settled when they turn terminal
//! (see [`PropagationEngine::mark_terminal`]).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PROPAGATION_DEPTH_LIMIT;
use crate::partition::facts::extract_definitions;
use crate::stage::ReferenceFacts;
use crate::unit::{Unit, UnitId};

/// Canonical value of a fact and the unit that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactEntry {
    pub owner: UnitId,
    pub value: String,
}

/// Fact key to owner/value, plus the units citing each key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactIndex {
    facts: BTreeMap<String, FactEntry>,
    referencers: BTreeMap<String, BTreeSet<UnitId>>,
}

impl FactIndex {
    /// Build from units in document order. The first declaration of a key
    /// owns it.
    pub fn from_units(units: &[Unit]) -> Self {
        let mut index = Self::default();
        for unit in units {
            for (key, value) in extract_definitions(&unit.content) {
                index.facts.entry(key).or_insert_with(|| FactEntry {
                    owner: unit.id.clone(),
                    value,
                });
            }
            for key in &unit.references {
                index
                    .referencers
                    .entry(key.clone())
                    .or_default()
                    .insert(unit.id.clone());
            }
        }
        index
    }

    pub fn get(&self, key: &str) -> Option<&FactEntry> {
        self.facts.get(key)
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Units citing `key`, in id order.
    pub fn referencers_of(&self, key: &str) -> Vec<UnitId> {
        self.referencers
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Facts a unit is checked against: everything owned by other units.
    pub fn reference_facts_for(&self, unit_id: &str) -> ReferenceFacts {
        self.facts
            .iter()
            .filter(|(_, entry)| entry.owner != unit_id)
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Re-read a unit's declarations and citations. Returns the keys the
    /// unit owns (or newly claims) whose value changed, plus owned keys it
    /// no longer declares.
    pub fn update_unit(&mut self, unit: &Unit) -> Vec<String> {
        let declared: BTreeMap<String, String> = extract_definitions(&unit.content)
            .into_iter()
            .rev()
            .collect();
        let mut changed = Vec::new();

        let dropped: Vec<String> = self
            .facts
            .iter()
            .filter(|(key, entry)| entry.owner == unit.id && !declared.contains_key(*key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in dropped {
            debug!(unit_id = %unit.id, fact = %key, "Fact declaration removed");
            self.facts.remove(&key);
            changed.push(key);
        }

        for (key, value) in declared {
            match self.facts.get_mut(&key) {
                Some(entry) if entry.owner == unit.id => {
                    if entry.value != value {
                        debug!(unit_id = %unit.id, fact = %key, old = %entry.value, new = %value, "Fact changed");
                        entry.value = value;
                        changed.push(key);
                    }
                }
                Some(_) => {}
                None => {
                    self.facts.insert(
                        key.clone(),
                        FactEntry {
                            owner: unit.id.clone(),
                            value,
                        },
                    );
                    changed.push(key);
                }
            }
        }

        for set in self.referencers.values_mut() {
            set.remove(&unit.id);
        }
        for key in &unit.references {
            self.referencers
                .entry(key.clone())
                .or_default()
                .insert(unit.id.clone());
        }
        changed.sort();
        changed.dedup();
        changed
    }
}

/// One propagation step that was allowed to happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationEvent {
    pub source_unit: UnitId,
    pub affected_fact: String,
    /// Always `<= 1`.
    pub depth: u32,
}

/// A citation left possibly stale because propagation stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedCrossReference {
    pub source_unit: UnitId,
    pub target_unit: UnitId,
    pub fact: String,
    pub depth: u32,
    pub reason: String,
}

/// Propagation attempted beyond the depth limit. Recorded, never thrown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("propagation cycle attempt from {source_unit} on '{fact}' at depth {depth}")]
pub struct PropagationCycleAttempt {
    pub source_unit: UnitId,
    pub fact: String,
    pub depth: u32,
}

/// Where a unit stands in the run, as far as propagation is concerned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitProgress {
    #[default]
    NotStarted,
    /// Refining against a snapshot of the index taken at start.
    Running,
    Terminal,
}

impl std::fmt::Display for UnitProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

/// A depth-0 change that reached a unit while it was running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    pub source_unit: UnitId,
    pub fact: String,
}

/// What the caller has to do for one `propagate` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropagationDecision {
    /// Run one critical-stage mini-round on each target.
    Reopen { targets: Vec<UnitId> },
    /// Nothing to run; unresolved references (if any) were recorded.
    Recorded { unresolved: Vec<UnresolvedCrossReference> },
}

/// Owns the fact index, unit progress and the propagation ledger for one run.
///
/// Progress lives here so that a unit's snapshot, its terminal transition
/// and every propagation decision are serialized by one lock.
#[derive(Debug, Clone, Default)]
pub struct PropagationEngine {
    index: FactIndex,
    progress: BTreeMap<UnitId, UnitProgress>,
    pending: BTreeMap<UnitId, Vec<PendingChange>>,
    events: Vec<PropagationEvent>,
    unresolved: Vec<UnresolvedCrossReference>,
}

impl PropagationEngine {
    pub fn new(index: FactIndex) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    pub fn index(&self) -> &FactIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut FactIndex {
        &mut self.index
    }

    pub fn events(&self) -> &[PropagationEvent] {
        &self.events
    }

    pub fn unresolved(&self) -> &[UnresolvedCrossReference] {
        &self.unresolved
    }

    /// Unresolved references targeting one unit.
    pub fn unresolved_for(&self, unit_id: &str) -> Vec<&UnresolvedCrossReference> {
        self.unresolved
            .iter()
            .filter(|u| u.target_unit == unit_id)
            .collect()
    }

    pub fn progress_of(&self, unit_id: &str) -> UnitProgress {
        self.progress.get(unit_id).copied().unwrap_or_default()
    }

    /// Changes queued against a running unit.
    pub fn pending_for(&self, unit_id: &str) -> &[PendingChange] {
        self.pending.get(unit_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Mark a unit running and hand back the facts it refines against.
    pub fn start_unit(&mut self, unit_id: &str) -> ReferenceFacts {
        self.progress.insert(unit_id.to_string(), UnitProgress::Running);
        self.index.reference_facts_for(unit_id)
    }

    /// Mark a unit terminal. Returns the pending changes whose current value
    /// differs from `seen`, the facts the unit was refined against; those
    /// need one review round. Changes already reflected in `seen` are dropped.
    pub fn mark_terminal(&mut self, unit_id: &str, seen: &ReferenceFacts) -> Vec<PendingChange> {
        self.progress.insert(unit_id.to_string(), UnitProgress::Terminal);
        let queued = self.pending.remove(unit_id).unwrap_or_default();
        if queued.is_empty() {
            return queued;
        }
        let current = self.index.reference_facts_for(unit_id);
        let mut stale: Vec<PendingChange> = Vec::new();
        for change in queued {
            let outdated = current.get(&change.fact) != seen.get(&change.fact);
            if outdated && !stale.iter().any(|c| c.fact == change.fact) {
                stale.push(change);
            } else if !outdated {
                debug!(unit_id, fact = %change.fact, "Pending change already seen");
            }
        }
        if !stale.is_empty() {
            info!(unit_id, stale = stale.len(), "Unit finished against outdated facts");
        }
        stale
    }

    fn record_unresolved(
        &mut self,
        source_unit: &str,
        fact: &str,
        depth: u32,
        reason: &str,
    ) -> Vec<UnresolvedCrossReference> {
        let entries: Vec<UnresolvedCrossReference> = self
            .index
            .referencers_of(fact)
            .into_iter()
            .filter(|target| target != source_unit)
            .map(|target_unit| UnresolvedCrossReference {
                source_unit: source_unit.to_string(),
                target_unit,
                fact: fact.to_string(),
                depth,
                reason: reason.to_string(),
            })
            .collect();
        for entry in &entries {
            if !self.unresolved.contains(entry) {
                self.unresolved.push(entry.clone());
            }
        }
        entries
    }

    /// Decide how a change to `fact` in `source_unit` propagates.
    ///
    /// At depth 0 terminal referencers are returned for re-opening, running
    /// ones get a [`PendingChange`], and units that have not started are
    /// skipped.
    pub fn propagate(&mut self, source_unit: &str, fact: &str, depth: u32) -> PropagationDecision {
        if depth > PROPAGATION_DEPTH_LIMIT {
            let attempt = PropagationCycleAttempt {
                source_unit: source_unit.to_string(),
                fact: fact.to_string(),
                depth,
            };
            warn!(error = %attempt, "Recording propagation beyond depth limit as unresolved");
            let unresolved = self.record_unresolved(source_unit, fact, depth, &attempt.to_string());
            return PropagationDecision::Recorded { unresolved };
        }

        self.events.push(PropagationEvent {
            source_unit: source_unit.to_string(),
            affected_fact: fact.to_string(),
            depth,
        });

        if depth == PROPAGATION_DEPTH_LIMIT {
            let unresolved = self.record_unresolved(source_unit, fact, depth, "depth limit reached");
            if !unresolved.is_empty() {
                info!(
                    source_unit,
                    fact,
                    count = unresolved.len(),
                    "Propagation stopped at depth limit"
                );
            }
            return PropagationDecision::Recorded { unresolved };
        }

        let mut targets = Vec::new();
        for target in self.index.referencers_of(fact) {
            if target == source_unit {
                continue;
            }
            match self.progress_of(&target) {
                UnitProgress::Terminal => targets.push(target),
                UnitProgress::Running => {
                    debug!(target_unit = %target, fact, "Queueing change for running unit");
                    let change = PendingChange {
                        source_unit: source_unit.to_string(),
                        fact: fact.to_string(),
                    };
                    let queue = self.pending.entry(target).or_default();
                    if !queue.contains(&change) {
                        queue.push(change);
                    }
                }
                UnitProgress::NotStarted => {
                    debug!(target_unit = %target, fact, "Not started, reads the index when it starts");
                }
            }
        }
        info!(source_unit, fact, depth, targets = targets.len(), "Propagating fact change");
        PropagationDecision::Reopen { targets }
    }
}
