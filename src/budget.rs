//! Token budget allocation across context components.
//!
//! Non-compressible components (the current chapter) are always kept whole.
//! The rest of the budget is shared by importance, capped at each
//! component's own size, and components that get less than their size are
//! truncated at segment boundaries.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::component::{ContextComponent, sort_by_priority};
use crate::error::{ContextError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocationConfig {
    /// Upper bound on redistribution passes
    pub rebalance_iterations: usize,
    /// Stop once the undistributed pool is below this share of the budget
    pub convergence: f64,
    /// Allocations smaller than this drop the component instead of
    /// truncating it to a sliver
    pub min_useful_tokens: usize,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            rebalance_iterations: 5,
            convergence: 0.01,
            min_useful_tokens: 16,
        }
    }
}

impl AllocationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rebalance_iterations == 0 {
            return Err(ContextError::Config("rebalance_iterations must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.convergence) {
            return Err(ContextError::Config(format!(
                "convergence {} is outside [0, 1)",
                self.convergence
            )));
        }
        Ok(())
    }
}

/// Result of an allocation
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    /// Included components in priority order
    pub components: Vec<ContextComponent>,
    pub budget: usize,
    /// Cost of the non-compressible components
    pub required: usize,
    /// Labels of compressible components that were truncated
    pub truncated: Vec<String>,
    /// Labels of compressible components left out entirely
    pub dropped: Vec<String>,
}

impl Allocation {
    pub fn token_count(&self) -> usize {
        self.components.iter().map(|c| c.token_count).sum()
    }

    /// Non-compressible components alone exceed the budget
    pub fn is_infeasible(&self) -> bool {
        self.required > self.budget
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenBudgetAllocator {
    config: AllocationConfig,
}

impl TokenBudgetAllocator {
    pub fn new(config: AllocationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AllocationConfig {
        &self.config
    }

    /// Fit `components` into `total_budget`.
    ///
    /// The returned components' token counts sum to at most `total_budget`
    /// unless the non-compressible ones alone exceed it, in which case only
    /// those are returned, in full.
    pub fn allocate(&self, components: Vec<ContextComponent>, total_budget: usize) -> Allocation {
        let (mut fixed, flexible): (Vec<_>, Vec<_>) = components.into_iter().partition(|c| !c.compressible);
        let required: usize = fixed.iter().map(|c| c.token_count).sum();

        let mut allocation = Allocation {
            budget: total_budget,
            required,
            ..Default::default()
        };

        if required > total_budget {
            warn!(
                "Non-compressible components need {} tokens, budget is {}; keeping them in full",
                required, total_budget
            );
            allocation.dropped = flexible.iter().map(|c| c.label.clone()).collect();
            sort_by_priority(&mut fixed);
            allocation.components = fixed;
            return allocation;
        }

        let remaining = total_budget - required;
        let mut flexible = flexible;
        sort_by_priority(&mut flexible);
        let shares = self.distribute(&flexible, remaining);

        let mut kept = fixed;
        for (component, share) in flexible.into_iter().zip(shares) {
            let share = share.floor() as usize;
            if share >= component.token_count {
                kept.push(component);
                continue;
            }
            if share < self.config.min_useful_tokens.min(component.token_count) {
                allocation.dropped.push(component.label);
                continue;
            }
            match component.truncated_to(share) {
                Some(truncated) => {
                    allocation.truncated.push(truncated.label.clone());
                    kept.push(truncated);
                }
                None => allocation.dropped.push(component.label),
            }
        }

        sort_by_priority(&mut kept);
        enforce_budget(&mut kept, total_budget, &mut allocation.dropped);
        allocation.components = kept;

        debug!(
            "Allocated {} of {} tokens ({} truncated, {} dropped)",
            allocation.token_count(),
            total_budget,
            allocation.truncated.len(),
            allocation.dropped.len()
        );
        allocation
    }

    /// Share `pool` among components by importance, never above a
    /// component's own size, redistributing what capped components leave
    fn distribute(&self, components: &[ContextComponent], pool: usize) -> Vec<f64> {
        let caps: Vec<f64> = components.iter().map(|c| c.token_count as f64).collect();
        let mut shares = vec![0.0; components.len()];
        let mut available = pool as f64;

        // soft minimums first, in priority order, while they fit
        for (i, component) in components.iter().enumerate() {
            let minimum = component.min_tokens.min(component.token_count) as f64;
            if minimum > 0.0 && minimum <= available {
                shares[i] = minimum;
                available -= minimum;
            }
        }

        let threshold = self.config.convergence * pool as f64;
        for iteration in 0..self.config.rebalance_iterations {
            let open: Vec<usize> = (0..components.len()).filter(|&i| shares[i] < caps[i]).collect();
            if open.is_empty() || available <= threshold.max(f64::EPSILON) {
                break;
            }

            let importance_sum: f64 = open.iter().map(|&i| components[i].importance).sum();
            let weight = |i: usize| {
                if importance_sum > 0.0 {
                    components[i].importance / importance_sum
                } else {
                    1.0 / open.len() as f64
                }
            };

            let mut handed_out = 0.0;
            for &i in &open {
                let grant = (available * weight(i)).min(caps[i] - shares[i]);
                shares[i] += grant;
                handed_out += grant;
            }
            available = (available - handed_out).max(0.0);
            debug!("Rebalance pass {}: {:.0} tokens undistributed", iteration + 1, available);
        }
        shares
    }
}

/// Drop trailing compressible components until the budget holds
fn enforce_budget(components: &mut Vec<ContextComponent>, budget: usize, dropped: &mut Vec<String>) {
    let mut total: usize = components.iter().map(|c| c.token_count).sum();
    while total > budget {
        let Some(position) = components.iter().rposition(|c| c.compressible) else {
            break;
        };
        let removed = components.remove(position);
        total -= removed.token_count;
        dropped.push(removed.label);
    }
}
