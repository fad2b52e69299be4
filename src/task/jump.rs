// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use super::{Locals, Machine, StepId};
use ahash::AHashMap;
use std::rc::Rc;

/// A value a compiled switch dispatches on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CaseKey {
    /// An integer case label.
    Int(i64),
    /// A string case label.
    Str(&'static str),
}

impl From<i64> for CaseKey {
    fn from(v: i64) -> CaseKey {
        CaseKey::Int(v)
    }
}

impl From<&'static str> for CaseKey {
    fn from(v: &'static str) -> CaseKey {
        CaseKey::Str(v)
    }
}

/// Immutable per-switch dispatch metadata, built once per compiled task
/// and cached on the [`Machine`].
///
/// Case blocks are laid out back to back after the switch step: the first
/// case starts at `id + 1`, each following case starts one block further,
/// and `beyond` points past all of them — the post-switch join step.
#[derive(Debug)]
pub struct JumpTable {
    step_ids: AHashMap<CaseKey, StepId>,
    beyond: StepId,
}

impl JumpTable {
    pub(crate) fn build(id: StepId, cases: Vec<CaseKey>, block_sizes: Vec<StepId>) -> JumpTable {
        let mut step_ids = AHashMap::new();
        let mut at = id + 1;
        for (case, size) in cases.into_iter().zip(block_sizes) {
            step_ids.insert(case, at);
            at += size;
        }
        JumpTable {
            step_ids,
            beyond: at,
        }
    }

    /// The join step past all case blocks.
    pub fn beyond(&self) -> StepId {
        self.beyond
    }

    /// The entry step of the case for `key`, if the switch has one.
    pub fn case_step(&self, key: &CaseKey) -> Option<StepId> {
        self.step_ids.get(key).copied()
    }

    /// Dispatches `sm` to the case for `key`, arming a join point at the
    /// post-switch step first.
    ///
    /// # Panics
    ///
    /// Panics when `key` has no mapping — a compiled switch always covers
    /// the values it dispatches on.
    pub fn jump_to_case<C: Locals>(&self, sm: &Rc<Machine<C>>, key: &CaseKey) {
        sm.push_phi(self.beyond);
        match self.case_step(key) {
            Some(step) => sm.go_to(step),
            None => panic!("no case mapping for {:?} in jump table", key),
        }
    }
}
