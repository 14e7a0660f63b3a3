//! Liveness and dependency reachability.

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Ok,
    Degraded,
}

/// Result of probing every dependency once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub services: BTreeMap<&'static str, ProbeStatus>,
}

impl HealthReport {
    pub fn from_probes<I>(probes: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, bool)>,
    {
        let services: BTreeMap<_, _> = probes
            .into_iter()
            .map(|(name, up)| (name, if up { ProbeStatus::Up } else { ProbeStatus::Down }))
            .collect();
        let status = if services.values().all(|s| *s == ProbeStatus::Up) {
            OverallStatus::Ok
        } else {
            OverallStatus::Degraded
        };
        Self { status, services }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == OverallStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_down_dependency_degrades() {
        let report = HealthReport::from_probes([("job_queue", true), ("counter_store", false)]);
        assert!(!report.is_healthy());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["services"]["counter_store"], "down");
        assert_eq!(json["services"]["job_queue"], "up");
    }

    #[test]
    fn all_up_is_ok() {
        assert!(HealthReport::from_probes([("job_queue", true)]).is_healthy());
    }
}
