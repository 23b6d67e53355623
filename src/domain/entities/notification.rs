use serde::{Deserialize, Serialize};

/// Message severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

impl Severity {
    /// Integer rank stored in the database so the lease query can compare levels.
    pub fn rank(&self) -> i64 {
        match self {
            Severity::Info => 0,
            Severity::Warn => 1,
            Severity::Error => 2,
            Severity::Critical => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Severity::Info),
            1 => Some(Severity::Warn),
            2 => Some(Severity::Error),
            3 => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INFO" => Some(Severity::Info),
            "WARN" | "WARNING" => Some(Severity::Warn),
            "ERROR" => Some(Severity::Error),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbox entry lifecycle. SENT and FAILED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(OutboxStatus::Pending),
            "SENT" => Some(OutboxStatus::Sent),
            "FAILED" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message to enqueue.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub channel: String,
    pub target: String,
    pub severity: Severity,
    pub title: String,
    pub body: String,
    pub dedupe_key: Option<String>,
}

/// Where operational alerts (admission blocks, exhaustion) are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRoute {
    pub channel: String,
    pub target: String,
}

impl AlertRoute {
    pub fn new(channel: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            target: target.into(),
        }
    }

    pub fn notification(
        &self,
        severity: Severity,
        title: impl Into<String>,
        body: impl Into<String>,
        dedupe_key: Option<String>,
    ) -> NewNotification {
        NewNotification {
            channel: self.channel.clone(),
            target: self.target.clone(),
            severity,
            title: title.into(),
            body: body.into(),
            dedupe_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Error < Severity::Critical);
        for severity in [Severity::Info, Severity::Warn, Severity::Error, Severity::Critical] {
            assert_eq!(Severity::from_rank(severity.rank()), Some(severity));
        }
        assert_eq!(Severity::from_rank(9), None);
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("warning"), Some(Severity::Warn));
        assert_eq!(Severity::parse("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::parse("loud"), None);
    }

    #[test]
    fn test_alert_route_builds_notification() {
        let route = AlertRoute::new("telegram", "-100123");
        let n = route.notification(Severity::Critical, "t", "m", Some("k".into()));
        assert_eq!(n.channel, "telegram");
        assert_eq!(n.target, "-100123");
        assert_eq!(n.dedupe_key.as_deref(), Some("k"));
    }
}
