//! Static transition tables.
//!
//! A table lists, per action, the states from which a backend can honor it.
//! An action without an entry is never legal.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Action, VmState};

/// Legal source states per action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionTable {
    entries: BTreeMap<Action, BTreeSet<VmState>>,
}

impl TransitionTable {
    pub fn builder() -> TransitionTableBuilder {
        TransitionTableBuilder::default()
    }

    /// True iff `action` has an entry and `state` is one of its sources.
    pub fn can_transition(&self, state: VmState, action: Action) -> bool {
        self.entries
            .get(&action)
            .is_some_and(|sources| sources.contains(&state))
    }

    /// Source states for `action`; `None` if the action is not supported.
    pub fn sources(&self, action: Action) -> Option<&BTreeSet<VmState>> {
        self.entries.get(&action)
    }

    /// Actions that have an entry.
    pub fn actions(&self) -> impl Iterator<Item = Action> + '_ {
        self.entries.keys().copied()
    }
}

#[derive(Debug, Default)]
pub struct TransitionTableBuilder {
    entries: BTreeMap<Action, BTreeSet<VmState>>,
}

impl TransitionTableBuilder {
    /// Allow `action` from each of `states`. Repeated calls accumulate.
    pub fn allow(mut self, action: Action, states: &[VmState]) -> Self {
        self.entries
            .entry(action)
            .or_default()
            .extend(states.iter().copied());
        self
    }

    pub fn build(self) -> TransitionTable {
        TransitionTable {
            entries: self.entries,
        }
    }
}
