//! C10 — Rebalancer.
//!
//! Builds and executes [`MigrationPlan`]s that replace instances sitting on
//! a more expensive offering with a cheaper substitute, in batches, under a
//! same-pool/same-offering no-op guard to prevent oscillation when upstream
//! price data briefly fluctuates.

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStrategy {
    Rolling,
    Surge,
    BlueGreen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationCandidate {
    pub instance_name: String,
    pub current_pool: String,
    pub current_offering: String,
    pub target_pool: String,
    pub target_offering: String,
}

impl MigrationCandidate {
    fn is_noop(&self) -> bool {
        self.target_pool == self.current_pool && self.target_offering == self.current_offering
    }
}

#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub strategy: MigrationStrategy,
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    pub steps: Vec<MigrationCandidate>,
}

/// Filters out same-pool/same-offering candidates (the oscillation guard)
/// and assembles the ordered, batched plan.
pub fn build_plan(candidates: Vec<MigrationCandidate>, strategy: MigrationStrategy, batch_size: usize, inter_batch_delay: Duration) -> MigrationPlan {
    let steps = candidates.into_iter().filter(|c| !c.is_noop()).collect();
    MigrationPlan { strategy, batch_size: batch_size.max(1), inter_batch_delay, steps }
}

#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    async fn provision_replacement(&self, candidate: &MigrationCandidate) -> Result<(), String>;
    async fn drain_and_terminate(&self, candidate: &MigrationCandidate) -> Result<(), String>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub completed: Vec<String>,
    pub failed: Option<(String, String)>,
    pub halted_early: bool,
}

/// Executes `plan` batch by batch. Rolling interleaves provision-then-drain
/// per instance; Surge/BlueGreen provision the whole batch first, then
/// drain the whole batch. A failure anywhere halts the plan immediately —
/// no rollback is attempted, matching the no-rollback design decision.
pub async fn execute_plan(plan: &MigrationPlan, executor: &dyn MigrationExecutor) -> ExecutionOutcome {
    let mut completed = Vec::new();
    let batches: Vec<&[MigrationCandidate]> = plan.steps.chunks(plan.batch_size.max(1)).collect();

    for (i, batch) in batches.iter().enumerate() {
        match plan.strategy {
            MigrationStrategy::Rolling => {
                for candidate in *batch {
                    if let Err(e) = executor.provision_replacement(candidate).await {
                        return ExecutionOutcome { completed, failed: Some((candidate.instance_name.clone(), e)), halted_early: true };
                    }
                    if let Err(e) = executor.drain_and_terminate(candidate).await {
                        return ExecutionOutcome { completed, failed: Some((candidate.instance_name.clone(), e)), halted_early: true };
                    }
                    completed.push(candidate.instance_name.clone());
                }
            }
            MigrationStrategy::Surge | MigrationStrategy::BlueGreen => {
                for candidate in *batch {
                    if let Err(e) = executor.provision_replacement(candidate).await {
                        return ExecutionOutcome { completed, failed: Some((candidate.instance_name.clone(), e)), halted_early: true };
                    }
                }
                for candidate in *batch {
                    if let Err(e) = executor.drain_and_terminate(candidate).await {
                        return ExecutionOutcome { completed, failed: Some((candidate.instance_name.clone(), e)), halted_early: true };
                    }
                    completed.push(candidate.instance_name.clone());
                }
            }
        }

        if i + 1 < batches.len() && !plan.inter_batch_delay.is_zero() {
            tokio::time::sleep(plan.inter_batch_delay).await;
        }
    }

    ExecutionOutcome { completed, failed: None, halted_early: false }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    fn candidate(name: &str, cur_pool: &str, cur_offer: &str, tgt_pool: &str, tgt_offer: &str) -> MigrationCandidate {
        MigrationCandidate { instance_name: name.to_string(), current_pool: cur_pool.to_string(), current_offering: cur_offer.to_string(), target_pool: tgt_pool.to_string(), target_offering: tgt_offer.to_string() }
    }

    #[test]
    fn build_plan_drops_noop_candidates() {
        let candidates = vec![candidate("i1", "p", "small", "p", "small"), candidate("i2", "p", "small", "p", "big")];
        let plan = build_plan(candidates, MigrationStrategy::Rolling, 2, Duration::ZERO);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].instance_name, "i2");
    }

    #[test]
    fn build_plan_enforces_minimum_batch_size_of_one() {
        let plan = build_plan(vec![], MigrationStrategy::Rolling, 0, Duration::ZERO);
        assert_eq!(plan.batch_size, 1);
    }

    struct RecordingExecutor {
        fail_on: Option<String>,
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MigrationExecutor for RecordingExecutor {
        async fn provision_replacement(&self, candidate: &MigrationCandidate) -> Result<(), String> {
            self.log.lock().await.push(format!("provision:{}", candidate.instance_name));
            if self.fail_on.as_deref() == Some(&format!("provision:{}", candidate.instance_name)) {
                return Err("provider rejected create".to_string());
            }
            Ok(())
        }

        async fn drain_and_terminate(&self, candidate: &MigrationCandidate) -> Result<(), String> {
            self.log.lock().await.push(format!("drain:{}", candidate.instance_name));
            if self.fail_on.as_deref() == Some(&format!("drain:{}", candidate.instance_name)) {
                return Err("drain deadline exceeded".to_string());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn rolling_strategy_interleaves_provision_and_drain() {
        let plan = build_plan(vec![candidate("i1", "p", "big", "p", "small"), candidate("i2", "p", "big", "p", "small")], MigrationStrategy::Rolling, 1, Duration::ZERO);
        let executor = RecordingExecutor { fail_on: None, log: Mutex::new(Vec::new()) };
        let outcome = execute_plan(&plan, &executor).await;
        assert_eq!(outcome.completed, vec!["i1".to_string(), "i2".to_string()]);
        assert!(outcome.failed.is_none());
        let log = executor.log.lock().await;
        assert_eq!(*log, vec!["provision:i1", "drain:i1", "provision:i2", "drain:i2"]);
    }

    #[tokio::test]
    async fn surge_strategy_provisions_batch_before_draining() {
        let plan = build_plan(vec![candidate("i1", "p", "big", "p", "small"), candidate("i2", "p", "big", "p", "small")], MigrationStrategy::Surge, 2, Duration::ZERO);
        let executor = RecordingExecutor { fail_on: None, log: Mutex::new(Vec::new()) };
        execute_plan(&plan, &executor).await;
        let log = executor.log.lock().await;
        assert_eq!(*log, vec!["provision:i1", "provision:i2", "drain:i1", "drain:i2"]);
    }

    #[tokio::test]
    async fn failure_halts_plan_without_rollback() {
        let plan = build_plan(vec![candidate("i1", "p", "big", "p", "small"), candidate("i2", "p", "big", "p", "small")], MigrationStrategy::Rolling, 1, Duration::ZERO);
        let executor = RecordingExecutor { fail_on: Some("drain:i1".to_string()), log: Mutex::new(Vec::new()) };
        let outcome = execute_plan(&plan, &executor).await;
        assert!(outcome.halted_early);
        assert_eq!(outcome.failed.unwrap().0, "i1");
        assert!(outcome.completed.is_empty());
        let log = executor.log.lock().await;
        assert_eq!(*log, vec!["provision:i1", "drain:i1"]);
    }
}
