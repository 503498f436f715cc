//! Typed events and the in-process bus
//!
//! Each [`Event`] variant maps to exactly one [`Topic`]. Handlers subscribe
//! to the topics they need and receive [`Envelope`]s on an unbounded
//! mailbox, so a slow handler never causes a dropped delivery. Delivery is
//! at-least-once from the handler's point of view: handlers must tolerate
//! duplicates.

use crate::error::BusError;
use crate::signals::{CostAlert, MilestoneSignal, RiskSignal};
use crate::types::{
    AssembledArtifact, CodeModule, ComponentSpec, DesignDocument, FailureStage, FlowId, ModuleId,
    TestCase, TestReport,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use ulid::Ulid;

/// Event topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// `app_generation.requested`
    #[serde(rename = "app_generation.requested")]
    AppGenerationRequested,
    /// `design.completed`
    #[serde(rename = "design.completed")]
    DesignCompleted,
    /// `module_coding.requested`
    #[serde(rename = "module_coding.requested")]
    ModuleCodingRequested,
    /// `module_coding.completed`
    #[serde(rename = "module_coding.completed")]
    ModuleCodingCompleted,
    /// `tests_designed.ready`
    #[serde(rename = "tests_designed.ready")]
    TestsDesignedReady,
    /// `tests.passed`
    #[serde(rename = "tests.passed")]
    TestsPassed,
    /// `tests.failed`
    #[serde(rename = "tests.failed")]
    TestsFailed,
    /// `code_refined.ready`
    #[serde(rename = "code_refined.ready")]
    CodeRefinedReady,
    /// `all_modules.tested`
    #[serde(rename = "all_modules.tested")]
    AllModulesTested,
    /// `app_generation.completed`
    #[serde(rename = "app_generation.completed")]
    AppGenerationCompleted,
    /// `app_generation.failed`
    #[serde(rename = "app_generation.failed")]
    AppGenerationFailed,
    /// `pm.risk_flagged`
    #[serde(rename = "pm.risk_flagged")]
    RiskFlagged,
    /// `pm.milestone_reached`
    #[serde(rename = "pm.milestone_reached")]
    MilestoneReached,
    /// `pm.cost_alert`
    #[serde(rename = "pm.cost_alert")]
    CostAlert,
}

impl Topic {
    /// Every topic
    pub const ALL: [Topic; 14] = [
        Topic::AppGenerationRequested,
        Topic::DesignCompleted,
        Topic::ModuleCodingRequested,
        Topic::ModuleCodingCompleted,
        Topic::TestsDesignedReady,
        Topic::TestsPassed,
        Topic::TestsFailed,
        Topic::CodeRefinedReady,
        Topic::AllModulesTested,
        Topic::AppGenerationCompleted,
        Topic::AppGenerationFailed,
        Topic::RiskFlagged,
        Topic::MilestoneReached,
        Topic::CostAlert,
    ];

    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Topic::AppGenerationRequested => "app_generation.requested",
            Topic::DesignCompleted => "design.completed",
            Topic::ModuleCodingRequested => "module_coding.requested",
            Topic::ModuleCodingCompleted => "module_coding.completed",
            Topic::TestsDesignedReady => "tests_designed.ready",
            Topic::TestsPassed => "tests.passed",
            Topic::TestsFailed => "tests.failed",
            Topic::CodeRefinedReady => "code_refined.ready",
            Topic::AllModulesTested => "all_modules.tested",
            Topic::AppGenerationCompleted => "app_generation.completed",
            Topic::AppGenerationFailed => "app_generation.failed",
            Topic::RiskFlagged => "pm.risk_flagged",
            Topic::MilestoneReached => "pm.milestone_reached",
            Topic::CostAlert => "pm.cost_alert",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload")]
#[allow(missing_docs)]
pub enum Event {
    /// Workflow submitted
    #[serde(rename = "app_generation.requested", rename_all = "camelCase")]
    AppGenerationRequested { flow_id: FlowId, request: String },

    /// Design generator finished
    #[serde(rename = "design.completed", rename_all = "camelCase")]
    DesignCompleted {
        flow_id: FlowId,
        design_document: DesignDocument,
    },

    /// Code generation requested for one module
    #[serde(rename = "module_coding.requested", rename_all = "camelCase")]
    ModuleCodingRequested {
        flow_id: FlowId,
        module_id: ModuleId,
        component: ComponentSpec,
        design_document: DesignDocument,
    },

    /// Code generator finished one module
    #[serde(rename = "module_coding.completed", rename_all = "camelCase")]
    ModuleCodingCompleted {
        flow_id: FlowId,
        module_id: ModuleId,
        code_module: CodeModule,
    },

    /// Test cases designed and stored
    #[serde(rename = "tests_designed.ready", rename_all = "camelCase")]
    TestsDesignedReady {
        flow_id: FlowId,
        module_id: ModuleId,
        test_cases: Vec<TestCase>,
        code_module: CodeModule,
    },

    /// Every test passed
    #[serde(rename = "tests.passed", rename_all = "camelCase")]
    TestsPassed {
        flow_id: FlowId,
        module_id: ModuleId,
        test_report: TestReport,
        code_module: CodeModule,
    },

    /// At least one test failed
    #[serde(rename = "tests.failed", rename_all = "camelCase")]
    TestsFailed {
        flow_id: FlowId,
        module_id: ModuleId,
        code_module: CodeModule,
        test_report: TestReport,
        iteration: u32,
    },

    /// Refined files merged and stored
    #[serde(rename = "code_refined.ready", rename_all = "camelCase")]
    CodeRefinedReady {
        flow_id: FlowId,
        module_id: ModuleId,
        code_module: CodeModule,
        test_cases: Vec<TestCase>,
    },

    /// Every module passed; emitted once per workflow
    #[serde(rename = "all_modules.tested", rename_all = "camelCase")]
    AllModulesTested {
        flow_id: FlowId,
        design_document: Option<DesignDocument>,
        modules: Vec<CodeModule>,
    },

    /// Artifact assembled
    #[serde(rename = "app_generation.completed", rename_all = "camelCase")]
    AppGenerationCompleted {
        flow_id: FlowId,
        artifact: AssembledArtifact,
    },

    /// Workflow failed
    #[serde(rename = "app_generation.failed", rename_all = "camelCase")]
    AppGenerationFailed {
        flow_id: FlowId,
        phase: FailureStage,
        module_id: Option<ModuleId>,
        error: String,
    },

    /// Watchdog risk
    #[serde(rename = "pm.risk_flagged")]
    RiskFlagged(RiskSignal),

    /// Watchdog milestone
    #[serde(rename = "pm.milestone_reached")]
    MilestoneReached(MilestoneSignal),

    /// Watchdog budget alert
    #[serde(rename = "pm.cost_alert")]
    CostAlert(CostAlert),
}

impl Event {
    /// Topic this event is published on
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Event::AppGenerationRequested { .. } => Topic::AppGenerationRequested,
            Event::DesignCompleted { .. } => Topic::DesignCompleted,
            Event::ModuleCodingRequested { .. } => Topic::ModuleCodingRequested,
            Event::ModuleCodingCompleted { .. } => Topic::ModuleCodingCompleted,
            Event::TestsDesignedReady { .. } => Topic::TestsDesignedReady,
            Event::TestsPassed { .. } => Topic::TestsPassed,
            Event::TestsFailed { .. } => Topic::TestsFailed,
            Event::CodeRefinedReady { .. } => Topic::CodeRefinedReady,
            Event::AllModulesTested { .. } => Topic::AllModulesTested,
            Event::AppGenerationCompleted { .. } => Topic::AppGenerationCompleted,
            Event::AppGenerationFailed { .. } => Topic::AppGenerationFailed,
            Event::RiskFlagged(_) => Topic::RiskFlagged,
            Event::MilestoneReached(_) => Topic::MilestoneReached,
            Event::CostAlert(_) => Topic::CostAlert,
        }
    }

    /// Workflow the event belongs to
    #[must_use]
    pub fn flow_id(&self) -> FlowId {
        match self {
            Event::AppGenerationRequested { flow_id, .. }
            | Event::DesignCompleted { flow_id, .. }
            | Event::ModuleCodingRequested { flow_id, .. }
            | Event::ModuleCodingCompleted { flow_id, .. }
            | Event::TestsDesignedReady { flow_id, .. }
            | Event::TestsPassed { flow_id, .. }
            | Event::TestsFailed { flow_id, .. }
            | Event::CodeRefinedReady { flow_id, .. }
            | Event::AllModulesTested { flow_id, .. }
            | Event::AppGenerationCompleted { flow_id, .. }
            | Event::AppGenerationFailed { flow_id, .. } => *flow_id,
            Event::RiskFlagged(signal) => signal.flow_id,
            Event::MilestoneReached(signal) => signal.flow_id,
            Event::CostAlert(alert) => alert.flow_id,
        }
    }
}

/// A delivered event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Delivery id; shared by every subscriber's copy
    pub id: Ulid,
    /// Publish time
    pub published_at: DateTime<Utc>,
    /// The event
    pub event: Event,
}

impl Envelope {
    /// Wrap an event
    #[must_use]
    pub fn new(event: Event) -> Self {
        Self {
            id: Ulid::new(),
            published_at: Utc::now(),
            event,
        }
    }

    /// Event topic
    #[inline]
    #[must_use]
    pub fn topic(&self) -> Topic {
        self.event.topic()
    }
}

/// Publish/subscribe transport
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Deliver to every subscriber of the event's topic
    async fn publish(&self, event: Event) -> Result<(), BusError>;

    /// Open a mailbox for `topics`
    fn subscribe(&self, topics: &[Topic]) -> Subscription;
}

/// Receiving end of a subscription
#[derive(Debug)]
pub struct Subscription {
    topics: Vec<Topic>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    /// Create from a receiver
    #[must_use]
    pub fn new(topics: Vec<Topic>, rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self { topics, rx }
    }

    /// Subscribed topics
    #[must_use]
    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Wait for the next delivery; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Next delivery if one is queued
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    topics: Vec<Topic>,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// In-process bus with one unbounded mailbox per subscriber
#[derive(Default)]
pub struct InProcessBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl InProcessBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every topic
    #[must_use]
    pub fn subscribe_all(&self) -> Subscription {
        self.open(Topic::ALL.to_vec())
    }

    /// Live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn open(&self, topics: Vec<Topic>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(Subscriber {
            topics: topics.clone(),
            tx,
        });
        Subscription::new(topics, rx)
    }

    fn deliver(&self, envelope: &Envelope) -> usize {
        let topic = envelope.topic();
        let mut delivered = 0;
        let mut closed = false;
        {
            let subscribers = self.subscribers.read();
            for sub in subscribers.iter().filter(|s| s.topics.contains(&topic)) {
                if sub.tx.send(envelope.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed = true;
                }
            }
        }
        if closed {
            self.subscribers.write().retain(|s| !s.tx.is_closed());
        }
        delivered
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    async fn publish(&self, event: Event) -> Result<(), BusError> {
        let envelope = Envelope::new(event);
        let delivered = self.deliver(&envelope);
        tracing::trace!(
            topic = %envelope.topic(),
            flow_id = %envelope.event.flow_id(),
            delivered,
            "published"
        );
        Ok(())
    }

    fn subscribe(&self, topics: &[Topic]) -> Subscription {
        self.open(topics.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requested(flow_id: FlowId) -> Event {
        Event::AppGenerationRequested {
            flow_id,
            request: "todo api".into(),
        }
    }

    fn failed(flow_id: FlowId) -> Event {
        Event::AppGenerationFailed {
            flow_id,
            phase: FailureStage::Refinement,
            module_id: Some(ModuleId::new("m1")),
            error: "budget exhausted".into(),
        }
    }

    #[test]
    fn topic_names_match_serde_names() {
        for topic in Topic::ALL {
            let json = serde_json::to_value(topic).unwrap();
            assert_eq!(json, topic.as_str());
        }
    }

    #[test]
    fn event_serializes_with_topic_tag() {
        let flow_id = FlowId::new();
        let json = serde_json::to_value(failed(flow_id)).unwrap();
        assert_eq!(json["topic"], "app_generation.failed");
        assert_eq!(json["payload"]["phase"], "refinement");
        assert_eq!(json["payload"]["moduleId"], "m1");
    }

    #[tokio::test]
    async fn subscribers_only_see_their_topics() {
        let bus = InProcessBus::new();
        let mut failures = bus.subscribe(&[Topic::AppGenerationFailed]);
        let mut everything = bus.subscribe_all();
        let flow_id = FlowId::new();

        bus.publish(requested(flow_id)).await.unwrap();
        bus.publish(failed(flow_id)).await.unwrap();

        let first = failures.recv().await.unwrap();
        assert_eq!(first.topic(), Topic::AppGenerationFailed);
        assert!(failures.try_recv().is_none());

        assert_eq!(everything.recv().await.unwrap().topic(), Topic::AppGenerationRequested);
        assert_eq!(everything.recv().await.unwrap().event.flow_id(), flow_id);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = InProcessBus::new();
        let kept = bus.subscribe(&[Topic::AppGenerationRequested]);
        drop(bus.subscribe(&[Topic::AppGenerationRequested]));
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(requested(FlowId::new())).await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.topics(), &[Topic::AppGenerationRequested]);
    }
}
