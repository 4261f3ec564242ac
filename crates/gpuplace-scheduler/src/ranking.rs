//! Runner ranking among candidates that can host a workload

use std::sync::Arc;

use gpuplace_core::{Placement, RankingPolicy};

/// A runner the engine found a placement on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Runner identifier
    pub runner_id: String,
    /// Runner slot API endpoint
    pub endpoint: Option<String>,
    /// Placement the engine computed
    pub placement: Placement,
    /// Aggregate effective free memory left once the placement is reserved
    pub free_after_bytes: u64,
}

/// Strategy for choosing the winning candidate
pub trait RankingStrategy: Send + Sync {
    /// Pick one candidate; `None` only when the slice is empty
    fn pick<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate>;

    /// Get the strategy name
    fn name(&self) -> &'static str;
}

/// Prefer the runner left with the most free memory
pub struct LeastLoaded;

impl RankingStrategy for LeastLoaded {
    fn pick<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        candidates.iter().min_by(|a, b| {
            b.free_after_bytes
                .cmp(&a.free_after_bytes)
                .then_with(|| a.runner_id.cmp(&b.runner_id))
        })
    }

    fn name(&self) -> &'static str {
        "least-loaded"
    }
}

/// Take the first runner by identifier
pub struct FirstFit;

impl RankingStrategy for FirstFit {
    fn pick<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        candidates.iter().min_by(|a, b| a.runner_id.cmp(&b.runner_id))
    }

    fn name(&self) -> &'static str {
        "first-fit"
    }
}

/// Build the strategy for a configured policy
pub fn strategy_for(policy: RankingPolicy) -> Arc<dyn RankingStrategy> {
    match policy {
        RankingPolicy::LeastLoaded => Arc::new(LeastLoaded),
        RankingPolicy::FirstFit => Arc::new(FirstFit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuplace_core::GIB;

    fn candidate(runner: &str, free_after: u64) -> Candidate {
        Candidate {
            runner_id: runner.to_string(),
            endpoint: None,
            placement: Placement::Single { gpu_index: 0 },
            free_after_bytes: free_after,
        }
    }

    #[test]
    fn test_least_loaded_prefers_most_free() {
        let candidates = vec![candidate("a", 4 * GIB), candidate("b", 16 * GIB)];
        assert_eq!(LeastLoaded.pick(&candidates).unwrap().runner_id, "b");
    }

    #[test]
    fn test_least_loaded_tie_breaks_by_id() {
        let candidates = vec![candidate("c", 8 * GIB), candidate("a", 8 * GIB)];
        assert_eq!(LeastLoaded.pick(&candidates).unwrap().runner_id, "a");
    }

    #[test]
    fn test_first_fit() {
        let candidates = vec![candidate("b", 16 * GIB), candidate("a", GIB)];
        assert_eq!(FirstFit.pick(&candidates).unwrap().runner_id, "a");
    }

    #[test]
    fn test_empty_candidates() {
        assert!(LeastLoaded.pick(&[]).is_none());
        assert!(FirstFit.pick(&[]).is_none());
    }

    #[test]
    fn test_strategy_for_policy() {
        assert_eq!(strategy_for(RankingPolicy::FirstFit).name(), "first-fit");
        assert_eq!(strategy_for(RankingPolicy::LeastLoaded).name(), "least-loaded");
    }
}
