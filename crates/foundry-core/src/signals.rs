//! Watchdog signals
//!
//! Ephemeral: published on the bus, never stored on a workflow record.

use crate::types::FlowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of risk detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskType {
    /// No update for longer than the staleness threshold
    StaleWorkflow,
    /// Error log reached the threshold
    HighErrorCount,
}

impl fmt::Display for RiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StaleWorkflow => "stale_workflow",
            Self::HighErrorCount => "high_error_count",
        })
    }
}

/// Risk severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational
    Low,
    /// Needs attention
    Medium,
    /// Needs attention now
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        })
    }
}

/// `pm.risk_flagged` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSignal {
    /// Workflow
    pub flow_id: FlowId,
    /// Risk kind
    pub risk_type: RiskType,
    /// Human-readable description
    pub message: String,
    /// Severity
    pub severity: Severity,
    /// Most recent error entries, for error-count risks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    /// Scan time
    pub detected_at: DateTime<Utc>,
}

/// `pm.milestone_reached` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneSignal {
    /// Workflow
    pub flow_id: FlowId,
    /// Milestone name
    pub milestone: String,
    /// Human-readable description
    pub message: String,
    /// Components in the design
    pub component_count: usize,
}

/// `pm.cost_alert` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostAlert {
    /// Workflow
    pub flow_id: FlowId,
    /// Current estimated cost
    pub estimated_cost: f64,
    /// Configured budget
    pub budget: f64,
}
