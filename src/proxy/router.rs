// Candidate router - decides which providers are tried, and in what order

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::provider::MatchedProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// Start at a rotating offset so load spreads across equal candidates.
    RoundRobin,
    /// Always start at the highest-priority candidate.
    FillFirst,
}

impl RoutingStrategy {
    pub fn from_round_robin(enabled: bool) -> Self {
        if enabled {
            RoutingStrategy::RoundRobin
        } else {
            RoutingStrategy::FillFirst
        }
    }
}

/// Produces the attempt order for each request. The rotation counter lives
/// here, so two selectors never share state.
pub struct CandidateSelector {
    strategy: RoutingStrategy,
    current_index: AtomicUsize,
}

impl CandidateSelector {
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            strategy,
            current_index: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Offset of the first attempt among `len` candidates.
    pub fn start_index(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        match self.strategy {
            RoutingStrategy::FillFirst => 0,
            RoutingStrategy::RoundRobin => self.current_index.fetch_add(1, Ordering::Relaxed) % len,
        }
    }

    /// The candidates to try, at most `retry_count` of them, wrapping from
    /// the start index.
    pub fn attempt_order<'a>(
        &self,
        candidates: &'a [MatchedProvider],
        retry_count: usize,
    ) -> Vec<&'a MatchedProvider> {
        let len = candidates.len();
        let start = self.start_index(len);
        (0..retry_count.min(len))
            .map(|i| &candidates[(start + i) % len])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;
    use std::sync::Arc;

    fn candidates(names: &[&str]) -> Vec<MatchedProvider> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let provider: Provider =
                    serde_json::from_value(serde_json::json!({ "name": name })).unwrap();
                MatchedProvider {
                    provider: Arc::new(provider),
                    mapped_model: "m".to_string(),
                    priority: i as i32,
                }
            })
            .collect()
    }

    fn names(order: &[&MatchedProvider]) -> Vec<String> {
        order.iter().map(|c| c.provider.name.clone()).collect()
    }

    #[test]
    fn test_fill_first_always_starts_at_top() {
        let selector = CandidateSelector::new(RoutingStrategy::FillFirst);
        let list = candidates(&["a", "b", "c"]);
        for _ in 0..3 {
            assert_eq!(names(&selector.attempt_order(&list, 2)), vec!["a", "b"]);
        }
    }

    #[test]
    fn test_round_robin_rotates_and_wraps() {
        let selector = CandidateSelector::new(RoutingStrategy::RoundRobin);
        let list = candidates(&["a", "b", "c"]);
        assert_eq!(names(&selector.attempt_order(&list, 3)), vec!["a", "b", "c"]);
        assert_eq!(names(&selector.attempt_order(&list, 3)), vec!["b", "c", "a"]);
        assert_eq!(names(&selector.attempt_order(&list, 3)), vec!["c", "a", "b"]);
        assert_eq!(names(&selector.attempt_order(&list, 3)), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_attempts_bounded_by_retry_count_and_candidates() {
        let selector = CandidateSelector::new(RoutingStrategy::FillFirst);
        let list = candidates(&["a", "b", "c", "d", "e"]);
        assert_eq!(selector.attempt_order(&list, 3).len(), 3);
        assert_eq!(selector.attempt_order(&list[..2], 3).len(), 2);
        assert!(selector.attempt_order(&[], 3).is_empty());
    }

    #[test]
    fn test_selectors_do_not_share_rotation() {
        let first = CandidateSelector::new(RoutingStrategy::RoundRobin);
        let second = CandidateSelector::new(RoutingStrategy::RoundRobin);
        assert_eq!(first.start_index(4), 0);
        assert_eq!(first.start_index(4), 1);
        assert_eq!(second.start_index(4), 0);
    }
}
