//! # Machine Telemetry Selector
//!
//! Picks the least-loaded worker machine from live telemetry:
//!
//! ```text
//! score = running_jobs * running_job_weight
//!       + cpu_percent / cpu_divisor
//!       - free_memory_gb * free_memory_weight
//! ```
//!
//! Lowest score wins; on a tie the earlier candidate wins. A missing or non-finite
//! metric contributes zero. Candidates are filtered first with [`eligible_candidates`].

use tracing::debug;
use uuid::Uuid;

use crate::config::SelectorConfig;
use crate::error::{OrchestratorError, Result};
use crate::models::Machine;

/// Online machines with a reachable tunnel, provisioned with `profile_id` when one is given
pub fn eligible_candidates(machines: &[Machine], profile_id: Option<Uuid>) -> Vec<Machine> {
    machines
        .iter()
        .filter(|m| m.online && m.has_reachable_tunnel())
        .filter(|m| profile_id.map_or(true, |p| m.has_profile(p)))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MachineSelector {
    config: SelectorConfig,
}

impl MachineSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, machine: &Machine) -> f64 {
        let finite = |v: f64| if v.is_finite() { v } else { 0.0 };

        let jobs = finite(machine.running_job_count.unwrap_or(0) as f64);
        let cpu = finite(machine.cpu_percent.unwrap_or(0.0));
        let free_memory = finite(machine.free_memory_gb.unwrap_or(0.0));

        let cpu_term = if self.config.cpu_divisor > 0.0 {
            cpu / self.config.cpu_divisor
        } else {
            0.0
        };

        jobs * self.config.running_job_weight + cpu_term
            - free_memory * self.config.free_memory_weight
    }

    /// Lowest-scoring candidate; the first one wins ties
    pub fn select_best<'a>(&self, candidates: &'a [Machine]) -> Option<&'a Machine> {
        let mut best: Option<(&Machine, f64)> = None;
        for machine in candidates {
            let score = self.score(machine);
            match best {
                Some((_, best_score)) if score >= best_score => {}
                _ => best = Some((machine, score)),
            }
        }
        best.map(|(machine, _)| machine)
    }

    /// Filter `machines` and pick the best one, or fail with [`OrchestratorError::NoCandidate`]
    pub fn select(&self, machines: &[Machine], profile_id: Option<Uuid>) -> Result<Machine> {
        let candidates = eligible_candidates(machines, profile_id);
        let chosen = self
            .select_best(&candidates)
            .cloned()
            .ok_or(OrchestratorError::NoCandidate { profile_id })?;

        debug!(
            machine_id = %chosen.machine_id,
            machine = %chosen.name,
            score = self.score(&chosen),
            candidates = candidates.len(),
            "🖥️ SELECTOR: Machine selected"
        );
        Ok(chosen)
    }
}
