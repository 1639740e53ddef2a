use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall pipeline health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// 0 issues healthy, 1-2 degraded, more unhealthy.
    pub fn for_issues(issues: usize) -> Self {
        match issues {
            0 => HealthStatus::Healthy,
            1 | 2 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Probe results gathered by the health tick.
///
/// `prediction_service_reachable` is None when no prediction
/// service is configured; the sub-check is then omitted.
#[derive(Debug, Clone, Copy)]
pub struct HealthProbes {
    pub pipeline_running: bool,
    pub storage_reachable: bool,
    pub prediction_service_reachable: Option<bool>,
    pub fetch_adapters_reachable: bool,
}

impl HealthProbes {
    pub(crate) fn checks(&self) -> BTreeMap<String, bool> {
        let mut checks = BTreeMap::from([
            ("pipeline_running".to_string(), self.pipeline_running),
            ("storage_reachable".to_string(), self.storage_reachable),
            ("fetch_adapters_reachable".to_string(), self.fetch_adapters_reachable),
        ]);
        if let Some(ok) = self.prediction_service_reachable {
            checks.insert("prediction_service_reachable".to_string(), ok);
        }
        checks
    }
}

/// Result of one health tick. Superseded by the next one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub checks: BTreeMap<String, bool>,
    pub issues: Vec<String>,

    /// Sources that keep failing without a single success.
    /// Reported separately; they do not count as issues.
    pub unhealthy_sources: Vec<String>,

    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, source_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            source_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_issue_count() {
        assert_eq!(HealthStatus::for_issues(0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::for_issues(1), HealthStatus::Degraded);
        assert_eq!(HealthStatus::for_issues(2), HealthStatus::Degraded);
        assert_eq!(HealthStatus::for_issues(3), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::for_issues(7), HealthStatus::Unhealthy);
    }

    #[test]
    fn prediction_check_is_omitted_when_unconfigured() {
        let probes = HealthProbes {
            pipeline_running: true,
            storage_reachable: true,
            prediction_service_reachable: None,
            fetch_adapters_reachable: false,
        };
        let checks = probes.checks();
        assert_eq!(checks.len(), 3);
        assert!(!checks.contains_key("prediction_service_reachable"));
        assert_eq!(checks["fetch_adapters_reachable"], false);
    }

    #[test]
    fn alert_serializes_lowercase_level() {
        let alert = Alert::new(AlertLevel::Critical, Some("espn".into()), "down");
        let v = serde_json::to_value(&alert).unwrap();
        assert_eq!(v["level"], "critical");
        assert_eq!(v["source_id"], "espn");
    }
}
