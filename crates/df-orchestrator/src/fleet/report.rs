//! Per-host results of one fleet operation

use serde::Serialize;

/// What happened on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    /// Every step completed
    Succeeded,
    /// Nothing needed doing
    Skipped(String),
    /// A step failed; the host stays in the fleet
    Failed(String),
    /// The host was closed and dropped from the fleet
    Removed(String),
}

impl Outcome {
    /// Failed or removed
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_) | Outcome::Removed(_))
    }

    /// Short status word
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "ok",
            Outcome::Skipped(_) => "skipped",
            Outcome::Failed(_) => "failed",
            Outcome::Removed(_) => "removed",
        }
    }

    /// Reason attached to the outcome, if any
    pub fn detail(&self) -> Option<&str> {
        match self {
            Outcome::Succeeded => None,
            Outcome::Skipped(detail) | Outcome::Failed(detail) | Outcome::Removed(detail) => {
                Some(detail)
            }
        }
    }
}

/// Result for one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostReport {
    /// `name (address)`, or the bare name when resolution failed
    pub host: String,
    pub outcome: Outcome,
}

/// Results of one operation across the fleet, in fleet order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetReport {
    pub operation: String,
    pub hosts: Vec<HostReport>,
}

impl FleetReport {
    /// Empty report for `operation`
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            hosts: Vec::new(),
        }
    }

    /// Append the outcome for `host`
    pub fn push(&mut self, host: impl Into<String>, outcome: Outcome) {
        self.hosts.push(HostReport {
            host: host.into(),
            outcome,
        });
    }

    /// No host failed or was removed
    pub fn is_success(&self) -> bool {
        !self.hosts.iter().any(|h| h.outcome.is_failure())
    }

    /// Hosts that failed or were removed
    pub fn failures(&self) -> impl Iterator<Item = &HostReport> {
        self.hosts.iter().filter(|h| h.outcome.is_failure())
    }

    /// Number of hosts with the given status word
    pub fn count(&self, label: &str) -> usize {
        self.hosts
            .iter()
            .filter(|h| h.outcome.label() == label)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_ignores_skips() {
        let mut report = FleetReport::new("ensure_packages");
        report.push("a (10.0.0.1)", Outcome::Succeeded);
        report.push("b (10.0.0.2)", Outcome::Skipped("up to date".into()));
        assert!(report.is_success());

        report.push("c (10.0.0.3)", Outcome::Removed("upload refused".into()));
        assert!(!report.is_success());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.count("skipped"), 1);
    }

    #[test]
    fn test_serializes_status_and_detail() {
        let mut report = FleetReport::new("deploy");
        report.push("a (10.0.0.1)", Outcome::Failed("exit 1".into()));
        report.push("b (10.0.0.2)", Outcome::Succeeded);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["operation"], "deploy");
        assert_eq!(json["hosts"][0]["host"], "a (10.0.0.1)");
        assert_eq!(json["hosts"][0]["outcome"]["status"], "failed");
        assert_eq!(json["hosts"][0]["outcome"]["detail"], "exit 1");
        assert_eq!(json["hosts"][1]["outcome"]["status"], "succeeded");
    }
}
