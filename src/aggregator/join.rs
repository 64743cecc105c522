//! Counted join barrier
//!
//! One [`PartReporter`] is handed out per expected part. Reporting consumes
//! the reporter, so a part can report at most once; a reporter dropped without
//! reporting (error path, panic, cancelled task) reports `Unavailable` itself.
//! Every part therefore reports exactly once and [`CountedJoin::wait`] always
//! resolves.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use tokio::sync::mpsc;
use tracing::warn;

/// Result of one joined part
#[derive(Debug, Clone, PartialEq)]
pub enum PartOutcome<T> {
    Resolved(T),
    Unavailable(String),
}

impl<T> PartOutcome<T> {
    pub fn is_resolved(&self) -> bool {
        matches!(self, PartOutcome::Resolved(_))
    }

    pub fn resolved(self) -> Option<T> {
        match self {
            PartOutcome::Resolved(value) => Some(value),
            PartOutcome::Unavailable(_) => None,
        }
    }
}

type Report<K, T> = (K, PartOutcome<T>);

/// Single-use completion handle for one part
pub struct PartReporter<K: Copy, T> {
    key: K,
    tx: Option<mpsc::UnboundedSender<Report<K, T>>>,
}

impl<K: Copy, T> PartReporter<K, T> {
    pub fn key(&self) -> K {
        self.key
    }

    pub fn report(mut self, outcome: PartOutcome<T>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send((self.key, outcome));
        }
    }

    pub fn resolve(self, value: T) {
        self.report(PartOutcome::Resolved(value));
    }

    pub fn unavailable(self, reason: impl Into<String>) {
        self.report(PartOutcome::Unavailable(reason.into()));
    }
}

impl<K: Copy, T> Drop for PartReporter<K, T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let outcome = PartOutcome::Unavailable("part ended without reporting".to_string());
            let _ = tx.send((self.key, outcome));
        }
    }
}

/// Barrier that resolves once every expected part has reported
pub struct CountedJoin<K: Copy, T> {
    expected: BTreeSet<K>,
    rx: mpsc::UnboundedReceiver<Report<K, T>>,
}

impl<K, T> CountedJoin<K, T>
where
    K: Copy + Ord + Debug,
{
    /// Create a barrier for `keys`, returning one reporter per distinct key
    pub fn new(keys: impl IntoIterator<Item = K>) -> (Self, Vec<PartReporter<K, T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let expected: BTreeSet<K> = keys.into_iter().collect();
        let reporters = expected
            .iter()
            .map(|key| PartReporter {
                key: *key,
                tx: Some(tx.clone()),
            })
            .collect();
        (Self { expected, rx }, reporters)
    }

    pub fn expected(&self) -> usize {
        self.expected.len()
    }

    /// Wait for every part. Outcomes are keyed, so the result does not depend
    /// on completion order.
    pub async fn wait(mut self) -> BTreeMap<K, PartOutcome<T>> {
        let mut outcomes = BTreeMap::new();

        while outcomes.len() < self.expected.len() {
            let Some((key, outcome)) = self.rx.recv().await else {
                break;
            };
            if !self.expected.contains(&key) || outcomes.contains_key(&key) {
                warn!("Ignoring unexpected report for part {:?}", key);
                continue;
            }
            outcomes.insert(key, outcome);
        }

        // Only reachable if reporters were leaked with mem::forget
        for key in &self.expected {
            outcomes
                .entry(*key)
                .or_insert_with(|| PartOutcome::Unavailable("no report".to_string()));
        }
        outcomes
    }
}
