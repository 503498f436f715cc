//! Testing utilities for the Foundry workspace
//!
//! Scripted collaborators, a recording bus and workflow fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use foundry_artifact::{FileBlock, GeneratedFile, ModuleType};
use foundry_core::{
    BusError, CodeModule, CollaboratorError, ComponentSpec, DesignDocument, Event, EventBus,
    FlowId, InProcessBus, Phase, Subscription, TestCase, TestResult, Topic, Usage, Workflow,
};
use foundry_engine::{
    CodeGenerator, Collaborators, DesignGenerator, Generated, ManifestAssembler, Refiner,
    TestDesigner, TestExecutor,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const BROKEN: &str = "broken";
pub const FIXED: &str = "fixed";

// ----------------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------------

pub fn design(components: usize) -> DesignDocument {
    DesignDocument {
        summary: format!("app with {components} component(s)"),
        components: (0..components)
            .map(|i| ComponentSpec::new(format!("m{i}"), format!("Module {i}"), "does things", ModuleType::Step))
            .collect(),
    }
}

/// Workflow that walked the DAG up to `phase` and has a design
pub fn workflow_in(phase: Phase, components: usize) -> Workflow {
    let mut workflow = Workflow::new(FlowId::new(), "fixture", 3);
    workflow.enter_phase(Phase::Designing).unwrap();
    if phase != Phase::Designing {
        workflow.set_design(design(components));
        workflow.enter_phase(Phase::DesignCompleted).unwrap();
        if phase != Phase::DesignCompleted {
            workflow.enter_phase(phase).unwrap();
        }
    }
    workflow
}

/// Push `updated_at` into the past
pub fn aged(mut workflow: Workflow, minutes: i64) -> Workflow {
    workflow.updated_at = Utc::now() - ChronoDuration::minutes(minutes);
    workflow
}

// ----------------------------------------------------------------------------
// Recording bus
// ----------------------------------------------------------------------------

/// In-process bus that keeps every published event
#[derive(Default)]
pub struct RecordingBus {
    inner: InProcessBus,
    log: Mutex<Vec<Event>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().clone()
    }

    pub fn events_for(&self, flow_id: FlowId) -> Vec<Event> {
        self.log.lock().iter().filter(|e| e.flow_id() == flow_id).cloned().collect()
    }

    pub fn topics_for(&self, flow_id: FlowId) -> Vec<Topic> {
        self.events_for(flow_id).iter().map(Event::topic).collect()
    }

    pub fn count(&self, flow_id: FlowId, topic: Topic) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|e| e.flow_id() == flow_id && e.topic() == topic)
            .count()
    }

    /// Wait until `topic` was published at least `n` times for the flow
    pub async fn wait_for(&self, flow_id: FlowId, topic: Topic, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.count(flow_id, topic) >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.count(flow_id, topic) >= n
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn publish(&self, event: Event) -> Result<(), BusError> {
        self.log.lock().push(event.clone());
        self.inner.publish(event).await
    }

    fn subscribe(&self, topics: &[Topic]) -> Subscription {
        self.inner.subscribe(topics)
    }
}

// ----------------------------------------------------------------------------
// Scripted collaborators
// ----------------------------------------------------------------------------

/// Always returns the same design
pub struct StaticDesigner(pub DesignDocument);

#[async_trait]
impl DesignGenerator for StaticDesigner {
    async fn design(&self, _request: &str) -> Result<Generated<DesignDocument>, CollaboratorError> {
        Ok(Generated::new(self.0.clone(), Usage::new(1_000, 0.01)))
    }
}

/// Generates `files` broken files per component
pub struct FixedCoder {
    pub files: usize,
}

#[async_trait]
impl CodeGenerator for FixedCoder {
    async fn generate(
        &self,
        component: &ComponentSpec,
        _design: &DesignDocument,
    ) -> Result<Generated<Vec<GeneratedFile>>, CollaboratorError> {
        let files = (0..self.files)
            .map(|i| GeneratedFile::new(format!("{}/file{i}.ts", component.id), BROKEN, component.module_type))
            .collect();
        Ok(Generated::new(files, Usage::new(500, 0.005)))
    }
}

/// Designs `tests` cases per module and counts calls
pub struct FixedTestDesigner {
    pub tests: usize,
    pub calls: AtomicUsize,
}

impl FixedTestDesigner {
    pub fn new(tests: usize) -> Self {
        Self {
            tests,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TestDesigner for FixedTestDesigner {
    async fn design_tests(&self, module: &CodeModule) -> Result<Generated<Vec<TestCase>>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let cases = (0..self.tests)
            .map(|i| {
                TestCase::new(
                    format!("{}-t{i}", module.module_id),
                    module.module_id.clone(),
                    format!("test {i}"),
                    "expect(fixed)",
                    format!("{}/file0.ts", module.module_id),
                )
            })
            .collect();
        Ok(Generated::new(cases, Usage::new(200, 0.002)))
    }
}

/// Every test passes once no file of the module is still broken
#[derive(Default)]
pub struct ContentExecutor {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TestExecutor for ContentExecutor {
    async fn execute(&self, module: &CodeModule, tests: &[TestCase]) -> Result<Vec<TestResult>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fixed = module.files.iter().all(|f| f.content != BROKEN);
        Ok(tests
            .iter()
            .map(|t| {
                if fixed {
                    TestResult::pass(t.id.clone())
                } else {
                    TestResult::fail(t.id.clone(), format!("{} is broken", t.target_file))
                }
            })
            .collect())
    }
}

/// What a [`ScriptedRefiner`] does on each call
#[derive(Debug, Clone)]
pub enum RefineStep {
    /// Rewrite every file as fixed
    FixAll,
    /// Rewrite the named files only, still broken
    Touch(Vec<String>),
    /// Reply with nothing parsable
    Empty,
    /// Fail with this error
    Fail(CollaboratorError),
}

/// Plays `steps` in order, then repeats the last one; records what it saw
pub struct ScriptedRefiner {
    steps: Vec<RefineStep>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<TestResult>>>,
}

impl ScriptedRefiner {
    pub fn new(steps: Vec<RefineStep>) -> Self {
        Self {
            steps,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Failure lists passed to each call
    pub fn seen(&self) -> Vec<Vec<TestResult>> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Refiner for ScriptedRefiner {
    async fn refine(
        &self,
        module: &CodeModule,
        failures: &[TestResult],
        _tests: &[TestCase],
    ) -> Result<Generated<Vec<FileBlock>>, CollaboratorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(failures.to_vec());
        let step = self
            .steps
            .get(call)
            .or_else(|| self.steps.last())
            .cloned()
            .unwrap_or(RefineStep::Empty);
        let usage = Usage::new(300, 0.003);
        match step {
            RefineStep::FixAll => Ok(Generated::new(
                module.files.iter().map(|f| FileBlock::new(f.path.clone(), FIXED)).collect(),
                usage,
            )),
            RefineStep::Touch(paths) => Ok(Generated::new(
                paths.into_iter().map(|p| FileBlock::new(p, BROKEN)).collect(),
                usage,
            )),
            RefineStep::Empty => Ok(Generated::new(Vec::new(), usage)),
            RefineStep::Fail(err) => Err(err),
        }
    }
}

/// Fails every role with the same error
pub struct Failing(pub CollaboratorError);

#[async_trait]
impl DesignGenerator for Failing {
    async fn design(&self, _request: &str) -> Result<Generated<DesignDocument>, CollaboratorError> {
        Err(self.0.clone())
    }
}

#[async_trait]
impl CodeGenerator for Failing {
    async fn generate(
        &self,
        _component: &ComponentSpec,
        _design: &DesignDocument,
    ) -> Result<Generated<Vec<GeneratedFile>>, CollaboratorError> {
        Err(self.0.clone())
    }
}

#[async_trait]
impl TestExecutor for Failing {
    async fn execute(&self, _module: &CodeModule, _tests: &[TestCase]) -> Result<Vec<TestResult>, CollaboratorError> {
        Err(self.0.clone())
    }
}

/// Collaborators for `components` modules of two files and two tests each,
/// with the given refiner
pub fn scripted(components: usize, refiner: Arc<ScriptedRefiner>) -> Collaborators {
    Collaborators {
        designer: Arc::new(StaticDesigner(design(components))),
        coder: Arc::new(FixedCoder { files: 2 }),
        test_designer: Arc::new(FixedTestDesigner::new(2)),
        executor: Arc::new(ContentExecutor::default()),
        refiner,
        assembler: Arc::new(ManifestAssembler),
    }
}
