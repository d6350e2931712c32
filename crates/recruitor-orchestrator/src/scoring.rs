use crate::balancer::{AgentLoad, WorkloadTask};
use crate::monitor::HealthStatus;
use recruitor_core::AgentInfo;
use serde::{Deserialize, Serialize};

/// How the balancer ranks eligible workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringStrategy {
    RoundRobin,
    LeastLoaded,
    CapabilityMatch,
    PerformanceBased,
    #[default]
    Hybrid,
}

/// A worker as seen by a scorer: registry record plus balancer bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub info: &'a AgentInfo,
    pub load: &'a AgentLoad,
}

/// Pluggable scoring used by the `hybrid` strategy. Higher is better.
pub trait TaskScorer: Send + Sync {
    fn score(&self, task: &WorkloadTask, candidate: Candidate<'_>) -> f64;
}

/// Blends load, success rate, capability coverage and health, then scales
/// the result by the worker's health factor.
#[derive(Debug, Clone)]
pub struct HybridScorer {
    pub load_weight: f64,
    pub success_weight: f64,
    pub capability_weight: f64,
    pub health_weight: f64,
}

impl Default for HybridScorer {
    fn default() -> Self {
        Self {
            load_weight: 0.4,
            success_weight: 0.3,
            capability_weight: 0.2,
            health_weight: 0.1,
        }
    }
}

impl TaskScorer for HybridScorer {
    fn score(&self, task: &WorkloadTask, candidate: Candidate<'_>) -> f64 {
        let load = 100.0 - candidate.load.current_load;
        let success = candidate.load.success_rate() * 100.0;
        let coverage = capability_coverage(task, candidate.info) * 100.0;
        let health = match candidate.load.health {
            HealthStatus::Healthy => 100.0,
            HealthStatus::Degraded => 50.0,
            HealthStatus::Unhealthy => 0.0,
        };
        let blended = self.load_weight * load
            + self.success_weight * success
            + self.capability_weight * coverage
            + self.health_weight * health;
        blended * candidate.load.health.factor()
    }
}

/// Fraction of the task's required capabilities the worker has (1.0 when none are required).
fn capability_coverage(task: &WorkloadTask, info: &AgentInfo) -> f64 {
    if task.required_capabilities.is_empty() {
        return 1.0;
    }
    let matched = task
        .required_capabilities
        .iter()
        .filter(|c| info.has_capability(c))
        .count();
    matched as f64 / task.required_capabilities.len() as f64
}

/// Scores `candidate` for `task` with one of the built-in strategies.
/// `hybrid` delegates to `scorer`.
pub fn score(
    strategy: ScoringStrategy,
    scorer: &dyn TaskScorer,
    task: &WorkloadTask,
    candidate: Candidate<'_>,
) -> f64 {
    let load = candidate.load.current_load;
    match strategy {
        ScoringStrategy::RoundRobin | ScoringStrategy::LeastLoaded => 100.0 - load,
        ScoringStrategy::CapabilityMatch => {
            let matched = task
                .required_capabilities
                .iter()
                .filter(|c| candidate.info.has_capability(c))
                .count();
            let specialized = candidate
                .info
                .specializations()
                .iter()
                .any(|s| s == &task.task_type);
            50.0 - load / 2.0 + 15.0 * matched as f64 + if specialized { 25.0 } else { 0.0 }
        }
        ScoringStrategy::PerformanceBased => {
            0.6 * candidate.load.success_rate() * 100.0 + 0.4 * (100.0 - load)
        }
        ScoringStrategy::Hybrid => scorer.score(task, candidate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recruitor_core::AgentDescriptor;
    use serde_json::json;

    fn info(agent_type: &str, caps: &[&str]) -> AgentInfo {
        AgentInfo::new(
            &AgentDescriptor::new("w", "w", agent_type)
                .with_metadata("specializations", json!(["linkedin"])),
            caps.iter().map(|c| c.to_string()).collect(),
        )
    }

    fn load(current: f64) -> AgentLoad {
        AgentLoad {
            current_load: current,
            ..AgentLoad::new("w")
        }
    }

    fn task(task_type: &str, caps: &[&str]) -> WorkloadTask {
        WorkloadTask::new(task_type, json!({}))
            .with_required_capabilities(caps.iter().map(|c| c.to_string()).collect())
    }

    #[test]
    fn test_least_loaded() {
        let i = info("scraper", &["scrape"]);
        let l = load(30.0);
        let s = score(
            ScoringStrategy::LeastLoaded,
            &HybridScorer::default(),
            &task("scrape", &[]),
            Candidate { info: &i, load: &l },
        );
        assert_eq!(s, 70.0);
    }

    #[test]
    fn test_capability_match_bonuses() {
        let i = info("sourcing", &["scrape", "search"]);
        let l = load(20.0);
        let c = Candidate { info: &i, load: &l };
        let hybrid = HybridScorer::default();

        // 50 - 10 + 2 * 15 + 25 (type matches a specialization)
        let s = score(ScoringStrategy::CapabilityMatch, &hybrid, &task("linkedin", &["scrape", "search"]), c);
        assert_eq!(s, 95.0);

        // Declared type also counts as a specialization.
        let s = score(ScoringStrategy::CapabilityMatch, &hybrid, &task("sourcing", &["scrape"]), c);
        assert_eq!(s, 80.0);

        let s = score(ScoringStrategy::CapabilityMatch, &hybrid, &task("outreach", &[]), c);
        assert_eq!(s, 40.0);
    }

    #[test]
    fn test_performance_based() {
        let i = info("g", &[]);
        let mut l = load(50.0);
        l.completed = 3;
        l.failed = 1;
        let s = score(
            ScoringStrategy::PerformanceBased,
            &HybridScorer::default(),
            &task("t", &[]),
            Candidate { info: &i, load: &l },
        );
        assert!((s - (0.6 * 75.0 + 0.4 * 50.0)).abs() < 1e-9);
    }

    #[test]
    fn test_hybrid_applies_health_factor() {
        let i = info("g", &["scrape"]);
        let healthy = load(0.0);
        let degraded = AgentLoad {
            health: HealthStatus::Degraded,
            ..load(0.0)
        };
        let t = task("t", &["scrape"]);
        let scorer = HybridScorer::default();

        let h = scorer.score(&t, Candidate { info: &i, load: &healthy });
        assert!((h - 100.0).abs() < 1e-9);

        let d = scorer.score(&t, Candidate { info: &i, load: &degraded });
        // (40 + 30 + 20 + 5) * 0.75
        assert!((d - 71.25).abs() < 1e-9);
    }

    #[test]
    fn test_strategy_wire_names() {
        let s: ScoringStrategy = serde_json::from_str("\"performance_based\"").unwrap_or_default();
        assert_eq!(s, ScoringStrategy::PerformanceBased);
        assert_eq!(ScoringStrategy::default(), ScoringStrategy::Hybrid);
    }
}
