//! Context window optimization with level-by-level compression.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use ctx_memory::{CompressionLevel, MemoryEntry};
use ctx_primitives::ConsumerId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::budget::TokenBudgetManager;
use crate::compression::CompressionTable;
use crate::error::{BudgetError, BudgetResult};
use crate::tokens::TokenEstimator;

/// One entry selected for a consumer, possibly compressed.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectedEntry {
    /// Projection copy; its content and compression level reflect what the consumer receives.
    pub entry: MemoryEntry,
    /// Tokens reserved for the entry.
    pub tokens: usize,
    /// Whether the entry was pinned by the caller.
    pub required: bool,
}

/// Accounting attached to a [`Projection`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionStats {
    /// Entries included.
    pub included_count: usize,
    /// Entries that fit at no compression level.
    pub excluded_count: usize,
    /// Tokens reserved by this projection.
    pub budget_consumed: usize,
    /// Keys of excluded entries, in rank order.
    pub excluded_keys: Vec<String>,
    /// Required entries admitted at heavy compression beyond the remaining budget.
    pub over_budget_required: usize,
}

/// Ordered result of an optimization pass: required entries first, then
/// optional entries in rank order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Projection {
    /// Included entries.
    pub entries: Vec<ProjectedEntry>,
    /// Accounting summary.
    pub stats: ProjectionStats,
}

/// Selects and compresses entries so they fit a consumer's remaining budget.
///
/// Reservations made during a pass stay with the consumer; callers release
/// them when the projected entries leave the consumer's view.
#[derive(Clone, Debug)]
pub struct ContextOptimizer {
    estimator: TokenEstimator,
    compression: CompressionTable,
    half_life: Duration,
}

impl ContextOptimizer {
    /// Creates an optimizer.
    ///
    /// `half_life` controls relevance decay when ranking optional entries; a
    /// zero value disables decay.
    #[must_use]
    pub fn new(estimator: TokenEstimator, compression: CompressionTable, half_life: Duration) -> Self {
        Self {
            estimator,
            compression,
            half_life,
        }
    }

    /// Returns the token estimator.
    #[must_use]
    pub fn estimator(&self) -> TokenEstimator {
        self.estimator
    }

    /// Returns the compression table.
    #[must_use]
    pub fn compression(&self) -> &CompressionTable {
        &self.compression
    }

    /// Renders `entry` at `level` and estimates its cost.
    #[must_use]
    pub fn render(&self, entry: &MemoryEntry, level: CompressionLevel) -> (MemoryEntry, usize) {
        let content = self.compression.apply(level, entry.content());
        let tokens = self.estimator.estimate_content(&content);
        (entry.with_compressed(content, level), tokens)
    }

    /// Builds the projection of `candidates` for `consumer`, reserving budget as it goes.
    ///
    /// Keys in `required` are processed first in candidate order; the rest are
    /// ranked by priority, decayed relevance, recency and key.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::UnknownConsumer`] if the consumer is not registered.
    pub fn optimize(
        &self,
        budget: &TokenBudgetManager,
        consumer: &ConsumerId,
        candidates: Vec<MemoryEntry>,
        required: &HashSet<String>,
        now: SystemTime,
    ) -> BudgetResult<Projection> {
        budget.available(consumer)?;

        let (pinned, mut optional): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|entry| required.contains(entry.key()));
        optional.sort_by(|a, b| self.rank(a, b, now));

        let mut projection = Projection::default();

        for entry in pinned {
            if let Some((projected, tokens)) = self.admit(budget, consumer, &entry)? {
                projection.push(projected, tokens, true);
                continue;
            }
            let (projected, tokens) = self.render(&entry, CompressionLevel::Heavy);
            let granted = budget.reserve_up_to(consumer, tokens)?;
            debug!(
                consumer = %consumer,
                key = entry.key(),
                tokens,
                granted,
                "required entry exceeds remaining budget"
            );
            projection.stats.over_budget_required += 1;
            projection.push(projected, granted, true);
        }

        for entry in optional {
            match self.admit(budget, consumer, &entry)? {
                Some((projected, tokens)) => projection.push(projected, tokens, false),
                None => {
                    projection.stats.excluded_count += 1;
                    projection.stats.excluded_keys.push(entry.key().to_owned());
                }
            }
        }

        debug!(
            consumer = %consumer,
            included = projection.stats.included_count,
            excluded = projection.stats.excluded_count,
            consumed = projection.stats.budget_consumed,
            "projection computed"
        );
        Ok(projection)
    }

    /// Tries each level in escalation order and reserves the first that fits.
    fn admit(
        &self,
        budget: &TokenBudgetManager,
        consumer: &ConsumerId,
        entry: &MemoryEntry,
    ) -> BudgetResult<Option<(MemoryEntry, usize)>> {
        for level in CompressionLevel::ESCALATION {
            let (projected, tokens) = self.render(entry, level);
            match budget.reserve(consumer, tokens) {
                Ok(()) => return Ok(Some((projected, tokens))),
                Err(BudgetError::Insufficient { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn rank(&self, a: &MemoryEntry, b: &MemoryEntry, now: SystemTime) -> Ordering {
        b.priority()
            .cmp(&a.priority())
            .then_with(|| {
                b.relevance_at(now, self.half_life)
                    .total_cmp(&a.relevance_at(now, self.half_life))
            })
            .then_with(|| {
                b.metadata()
                    .last_accessed
                    .cmp(&a.metadata().last_accessed)
            })
            .then_with(|| a.key().cmp(b.key()))
    }
}

impl Projection {
    fn push(&mut self, entry: MemoryEntry, tokens: usize, required: bool) {
        self.stats.included_count += 1;
        self.stats.budget_consumed += tokens;
        self.entries.push(ProjectedEntry {
            entry,
            tokens,
            required,
        });
    }

    /// Keys of the included entries, in projection order.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|projected| projected.entry.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionParams;
    use std::time::UNIX_EPOCH;

    fn consumer() -> ConsumerId {
        ConsumerId::new("claude-desktop").unwrap()
    }

    fn optimizer() -> ContextOptimizer {
        ContextOptimizer::new(
            TokenEstimator::default(),
            CompressionTable::new(CompressionParams::default()),
            Duration::ZERO,
        )
    }

    fn entry(key: &str, bytes: usize, priority: i32) -> MemoryEntry {
        MemoryEntry::builder(key, "x".repeat(bytes))
            .priority(priority)
            .timestamp(UNIX_EPOCH + Duration::from_secs(1_000))
            .build()
            .unwrap()
    }

    fn required(keys: &[&str]) -> HashSet<String> {
        keys.iter().map(|key| (*key).to_owned()).collect()
    }

    #[test]
    fn required_entry_and_one_full_optional_fit() {
        let budget = TokenBudgetManager::new();
        let id = consumer();
        budget.register_consumer(id.clone(), 500);

        let candidates = vec![
            entry("shared-a", 1_200, 1),
            entry("pinned", 400, 9),
            entry("shared-b", 1_200, 1),
            entry("shared-c", 1_200, 1),
        ];
        let projection = optimizer()
            .optimize(&budget, &id, candidates, &required(&["pinned"]), UNIX_EPOCH)
            .unwrap();

        assert_eq!(projection.entries[0].entry.key(), "pinned");
        assert!(projection.entries[0].required);
        let at_none = projection
            .entries
            .iter()
            .filter(|p| !p.required && p.entry.compression_level() == CompressionLevel::None)
            .count();
        assert!(at_none <= 1);
        assert!(projection.stats.budget_consumed <= 500);
        assert_eq!(
            projection.stats.included_count + projection.stats.excluded_count,
            4
        );
        assert_eq!(
            budget.snapshot(&id).unwrap().reserved,
            projection.stats.budget_consumed
        );
    }

    #[test]
    fn escalates_to_lightest_fitting_level() {
        let budget = TokenBudgetManager::new();
        let id = consumer();
        budget.register_consumer(id.clone(), 160);

        let projection = optimizer()
            .optimize(&budget, &id, vec![entry("doc", 1_000, 0)], &HashSet::new(), UNIX_EPOCH)
            .unwrap();

        let projected = &projection.entries[0];
        assert_eq!(projected.entry.compression_level(), CompressionLevel::Light);
        assert_eq!(projected.tokens, 126);
        assert_eq!(projected.entry.content().byte_len(), 503);
    }

    #[test]
    fn oversize_required_entry_is_kept_at_heavy() {
        let budget = TokenBudgetManager::new();
        let id = consumer();
        budget.register_consumer(id.clone(), 10);

        let projection = optimizer()
            .optimize(
                &budget,
                &id,
                vec![entry("huge", 4_000, 0), entry("extra", 8, 5)],
                &required(&["huge"]),
                UNIX_EPOCH,
            )
            .unwrap();

        assert_eq!(projection.keys(), ["huge"]);
        assert_eq!(
            projection.entries[0].entry.compression_level(),
            CompressionLevel::Heavy
        );
        assert_eq!(projection.stats.over_budget_required, 1);
        assert_eq!(projection.stats.excluded_keys, ["extra"]);
        let snapshot = budget.snapshot(&id).unwrap();
        assert_eq!(snapshot.reserved, 10);
        assert!(snapshot.reserved <= snapshot.window);
    }

    #[test]
    fn ranks_by_priority_then_relevance_then_key() {
        let budget = TokenBudgetManager::new();
        let id = consumer();
        budget.register_consumer(id.clone(), 10_000);

        let stale = MemoryEntry::builder("b-low-relevance", "x")
            .priority(3)
            .relevance(0.1)
            .build()
            .unwrap();
        let fresh = MemoryEntry::builder("c-high-relevance", "x")
            .priority(3)
            .relevance(0.9)
            .build()
            .unwrap();
        let tie = MemoryEntry::builder("a-high-relevance", "x")
            .priority(3)
            .relevance(0.9)
            .timestamp(fresh.metadata().last_accessed)
            .build()
            .unwrap();
        let top = MemoryEntry::builder("z-top", "x").priority(8).build().unwrap();

        let projection = optimizer()
            .optimize(
                &budget,
                &id,
                vec![stale, fresh, tie, top],
                &HashSet::new(),
                SystemTime::now(),
            )
            .unwrap();

        assert_eq!(
            projection.keys(),
            ["z-top", "a-high-relevance", "c-high-relevance", "b-low-relevance"]
        );
    }

    #[test]
    fn unknown_consumer_is_an_error() {
        let budget = TokenBudgetManager::new();
        let err = optimizer()
            .optimize(&budget, &consumer(), Vec::new(), &HashSet::new(), UNIX_EPOCH)
            .unwrap_err();
        assert!(matches!(err, BudgetError::UnknownConsumer { .. }));
    }
}
