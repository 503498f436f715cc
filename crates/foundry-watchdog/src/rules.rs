//! Per-workflow rule set
//!
//! Pure: a record and a clock in, signals out. One-shot bookkeeping for
//! milestones is the caller's business.

use chrono::{DateTime, Utc};
use foundry_core::{
    CostAlert, Event, MilestoneSignal, Phase, RiskSignal, RiskType, Severity, WatchdogConfig,
    Workflow,
};

/// Error entries carried on a high-error-count risk
pub const RECENT_ERRORS: usize = 3;

/// Milestone name for a stored design awaiting code
pub const DESIGN_MILESTONE: &str = "design_completed";

/// Something the watchdog noticed
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// `pm.risk_flagged`
    Risk(RiskSignal),
    /// `pm.milestone_reached`
    Milestone(MilestoneSignal),
    /// `pm.cost_alert`
    Cost(CostAlert),
}

impl Signal {
    /// Bus event for this signal
    #[must_use]
    pub fn into_event(self) -> Event {
        match self {
            Self::Risk(risk) => Event::RiskFlagged(risk),
            Self::Milestone(milestone) => Event::MilestoneReached(milestone),
            Self::Cost(alert) => Event::CostAlert(alert),
        }
    }

    /// Is this a milestone
    #[inline]
    #[must_use]
    pub fn is_milestone(&self) -> bool {
        matches!(self, Self::Milestone(_))
    }
}

/// Evaluate every rule against one record
///
/// Terminal records yield nothing.
#[must_use]
pub fn evaluate(workflow: &Workflow, now: DateTime<Utc>, config: &WatchdogConfig) -> Vec<Signal> {
    if workflow.is_terminal() {
        return Vec::new();
    }
    let mut signals = Vec::new();

    let idle = now.signed_duration_since(workflow.updated_at);
    let threshold = chrono::Duration::seconds(i64::try_from(config.stale_threshold_secs).unwrap_or(i64::MAX));
    if idle > threshold {
        signals.push(Signal::Risk(RiskSignal {
            flow_id: workflow.flow_id,
            risk_type: RiskType::StaleWorkflow,
            message: format!(
                "no progress for {} minute(s) in phase {}",
                idle.num_minutes(),
                workflow.status
            ),
            severity: Severity::High,
            errors: None,
            detected_at: now,
        }));
    }

    if workflow.errors.len() >= config.error_threshold {
        let recent = workflow.errors[workflow.errors.len().saturating_sub(RECENT_ERRORS)..].to_vec();
        signals.push(Signal::Risk(RiskSignal {
            flow_id: workflow.flow_id,
            risk_type: RiskType::HighErrorCount,
            message: format!("{} error(s) recorded", workflow.errors.len()),
            severity: Severity::Medium,
            errors: Some(recent),
            detected_at: now,
        }));
    }

    if workflow.metrics.estimated_cost > config.budget_usd {
        signals.push(Signal::Cost(CostAlert {
            flow_id: workflow.flow_id,
            estimated_cost: workflow.metrics.estimated_cost,
            budget: config.budget_usd,
        }));
    }

    if workflow.current_phase == Phase::DesignCompleted {
        if let Some(design) = &workflow.design_document {
            signals.push(Signal::Milestone(MilestoneSignal {
                flow_id: workflow.flow_id,
                milestone: DESIGN_MILESTONE.to_string(),
                message: format!("design ready with {} component(s)", design.component_count()),
                component_count: design.component_count(),
            }));
        }
    }

    signals
}
