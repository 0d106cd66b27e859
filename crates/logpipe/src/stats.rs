// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counters shared by every processor and output worker of a pipeline.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::action::ActionResult;

#[derive(Debug, Default)]
pub struct ActionCounters {
    passed: AtomicU64,
    discarded: AtomicU64,
    collapsed: AtomicU64,
    held: AtomicU64,
    not_matched: AtomicU64,
}

impl ActionCounters {
    pub(crate) fn record(&self, result: ActionResult) {
        let counter = match result {
            ActionResult::Pass => &self.passed,
            ActionResult::Discard => &self.discarded,
            ActionResult::Collapse => &self.collapsed,
            ActionResult::Hold => &self.held,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_not_matched(&self) {
        self.not_matched.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, name: &str) -> ActionStats {
        ActionStats {
            name: name.to_string(),
            passed: self.passed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            collapsed: self.collapsed.load(Ordering::Relaxed),
            held: self.held.load(Ordering::Relaxed),
            not_matched: self.not_matched.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct BatcherCounters {
    pub(crate) batches_sealed: AtomicU64,
    pub(crate) batches_committed: AtomicU64,
    pub(crate) events_committed: AtomicU64,
    pub(crate) send_failures: AtomicU64,
}

impl BatcherCounters {
    #[must_use]
    pub fn snapshot(&self) -> BatcherStats {
        BatcherStats {
            batches_sealed: self.batches_sealed.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            events_committed: self.events_committed.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionStats {
    pub name: String,
    pub passed: u64,
    pub discarded: u64,
    pub collapsed: u64,
    pub held: u64,
    pub not_matched: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatcherStats {
    pub batches_sealed: u64,
    pub batches_committed: u64,
    pub events_committed: u64,
    pub send_failures: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub events_in_use: usize,
    pub streams: usize,
    pub actions: Vec<ActionStats>,
    pub batcher: BatcherStats,
}

/// One set of counters per configured action, indexed like the chain.
#[derive(Debug)]
pub struct ChainCounters {
    names: Vec<String>,
    counters: Vec<ActionCounters>,
}

impl ChainCounters {
    #[must_use]
    pub fn new(names: Vec<String>) -> Self {
        let counters = names.iter().map(|_| ActionCounters::default()).collect();
        Self { names, counters }
    }

    pub(crate) fn get(&self, index: usize) -> Option<&ActionCounters> {
        self.counters.get(index)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ActionStats> {
        self.names
            .iter()
            .zip(&self.counters)
            .map(|(name, counters)| counters.snapshot(name))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_counters_snapshot() {
        let chain = ChainCounters::new(vec!["mask".to_string(), "discard".to_string()]);
        let mask = chain.get(0).unwrap();
        mask.record(ActionResult::Pass);
        mask.record(ActionResult::Pass);
        mask.record_not_matched();
        chain.get(1).unwrap().record(ActionResult::Discard);
        assert!(chain.get(2).is_none());

        let stats = chain.snapshot();
        assert_eq!(stats[0].name, "mask");
        assert_eq!(stats[0].passed, 2);
        assert_eq!(stats[0].not_matched, 1);
        assert_eq!(stats[1].discarded, 1);
        assert_eq!(stats[1].held, 0);
    }
}
