//! Periodic scan loop
//!
//! Each scan snapshots the active set once, evaluates every record and
//! publishes the resulting signals. The watchdog holds the store only for
//! reading; nothing here writes a workflow.

use crate::error::WatchdogError;
use crate::rules::{evaluate, Signal};
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use foundry_core::{EventBus, FlowId, WatchdogConfig};
use foundry_store::WorkflowStore;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const MIN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Outcome of one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Active workflows examined
    pub scanned: usize,
    /// Risk signals published
    pub risks: usize,
    /// Milestones published
    pub milestones: usize,
    /// Cost alerts published
    pub cost_alerts: usize,
    /// Signals the bus refused
    pub publish_failures: usize,
}

impl ScanReport {
    /// Signals published
    #[inline]
    #[must_use]
    pub fn published(&self) -> usize {
        self.risks + self.milestones + self.cost_alerts
    }
}

/// Read-only workflow monitor
pub struct Watchdog {
    store: Arc<dyn WorkflowStore>,
    bus: Arc<dyn EventBus>,
    config: WatchdogConfig,
    milestones: DashSet<FlowId>,
}

impl Watchdog {
    /// Create a watchdog
    #[must_use]
    pub fn new(store: Arc<dyn WorkflowStore>, bus: Arc<dyn EventBus>, config: WatchdogConfig) -> Self {
        Self {
            store,
            bus,
            config,
            milestones: DashSet::new(),
        }
    }

    /// Settings in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Workflows whose milestone was already announced
    #[inline]
    #[must_use]
    pub fn announced_milestones(&self) -> usize {
        self.milestones.len()
    }

    /// Scan now
    ///
    /// # Errors
    ///
    /// See [`Watchdog::scan_at`].
    pub async fn scan(&self) -> Result<ScanReport, WatchdogError> {
        self.scan_at(Utc::now()).await
    }

    /// Scan as if the clock read `now`
    ///
    /// # Errors
    ///
    /// [`WatchdogError::Snapshot`] when the active set cannot be read.
    /// Publication failures are counted, not returned.
    pub async fn scan_at(&self, now: DateTime<Utc>) -> Result<ScanReport, WatchdogError> {
        let snapshot = self.store.scan_active().await?;
        let active: HashSet<FlowId> = snapshot.iter().map(|wf| wf.flow_id).collect();
        self.milestones.retain(|flow_id| active.contains(flow_id));

        let mut report = ScanReport {
            scanned: snapshot.len(),
            ..ScanReport::default()
        };
        for workflow in &snapshot {
            for signal in evaluate(workflow, now, &self.config) {
                let milestone = signal.is_milestone();
                if milestone && self.milestones.contains(&workflow.flow_id) {
                    continue;
                }
                let counter = match &signal {
                    Signal::Risk(risk) => {
                        tracing::warn!(
                            flow_id = %risk.flow_id,
                            risk = %risk.risk_type,
                            severity = %risk.severity,
                            "{}",
                            risk.message
                        );
                        &mut report.risks
                    }
                    Signal::Milestone(milestone) => {
                        tracing::info!(flow_id = %milestone.flow_id, milestone = %milestone.milestone, "{}", milestone.message);
                        &mut report.milestones
                    }
                    Signal::Cost(alert) => {
                        tracing::info!(
                            flow_id = %alert.flow_id,
                            cost = alert.estimated_cost,
                            budget = alert.budget,
                            "workflow over budget"
                        );
                        &mut report.cost_alerts
                    }
                };
                match self.bus.publish(signal.into_event()).await {
                    Ok(()) => {
                        *counter += 1;
                        if milestone {
                            self.milestones.insert(workflow.flow_id);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(flow_id = %workflow.flow_id, "signal not published: {}", err);
                        report.publish_failures += 1;
                    }
                }
            }
        }

        tracing::debug!(
            scanned = report.scanned,
            published = report.published(),
            failures = report.publish_failures,
            "watchdog scan finished"
        );
        Ok(report)
    }

    /// Scan every `interval` until `shutdown` flips to true
    ///
    /// The first scan runs immediately. A failed scan is logged and the loop
    /// carries on.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval().max(MIN_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_secs = self.config.interval_secs, "watchdog started");
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = self.scan().await {
                            tracing::error!(retryable = err.is_retryable(), "watchdog scan failed: {}", err);
                        }
                    }
                }
            }
            tracing::info!("watchdog stopped");
        })
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("config", &self.config)
            .field("milestones", &self.milestones.len())
            .finish_non_exhaustive()
    }
}
