use async_trait::async_trait;
use foundry_artifact::FileBlock;
use foundry_core::{
    CodeModule, CollaboratorError, EngineConfig, Event, FailureStage, FlowId, ModuleId,
    ModuleStatus, Phase, TestCase, TestResult, Topic, Workflow,
};
use foundry_engine::{Collaborators, Engine, EngineHandle, Generated, Refiner};
use foundry_store::MemoryStore;
use foundry_test_utils::{
    scripted, Failing, FixedTestDesigner, RecordingBus, RefineStep, ScriptedRefiner, BROKEN, FIXED,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    engine: Engine,
    bus: Arc<RecordingBus>,
    handle: EngineHandle,
}

impl Harness {
    fn start(collaborators: Collaborators, max_iterations: u32) -> Self {
        let bus = Arc::new(RecordingBus::new());
        let config = EngineConfig {
            max_iterations,
            ..EngineConfig::default()
        };
        let engine = Engine::new(Arc::new(MemoryStore::new()), bus.clone(), collaborators, config);
        let handle = engine.start();
        Self { engine, bus, handle }
    }

    async fn run(self, request: &str) -> (Workflow, Arc<RecordingBus>) {
        let flow_id = self.engine.submit(request).await.unwrap();
        let workflow = self.engine.wait_for_terminal(flow_id, WAIT).await.unwrap();
        self.handle.shutdown().await;
        // Re-read after in-flight handlers drained.
        let workflow = self.engine.workflow(workflow.flow_id).await.unwrap();
        (workflow, self.bus)
    }
}

fn failed_event(bus: &RecordingBus, flow_id: FlowId) -> Option<(FailureStage, Option<ModuleId>, String)> {
    bus.events_for(flow_id).into_iter().find_map(|e| match e {
        Event::AppGenerationFailed {
            phase, module_id, error, ..
        } => Some((phase, module_id, error)),
        _ => None,
    })
}

#[tokio::test]
async fn refiner_fixes_failing_module_in_one_iteration() {
    let refiner = Arc::new(ScriptedRefiner::new(vec![RefineStep::FixAll]));
    let (workflow, bus) = Harness::start(scripted(1, refiner.clone()), 3).run("calculator").await;

    assert_eq!(workflow.status, Phase::Completed);
    assert_eq!(workflow.progress(), 100);
    let module = &workflow.modules[0];
    assert_eq!(module.status, ModuleStatus::Passed);
    assert_eq!(module.iteration, 1);
    assert!(module.files.iter().all(|f| f.content == FIXED && f.iteration == 1));
    assert_eq!(module.reports.len(), 2);
    assert_eq!(module.reports[0].failed_tests, 2);
    assert!(module.reports[1].is_passing());

    // The refiner only ever sees failing results.
    assert_eq!(refiner.calls(), 1);
    let seen = refiner.seen();
    assert_eq!(seen[0].len(), 2);
    assert!(seen[0].iter().all(|r| !r.passed));

    let flow_id = workflow.flow_id;
    assert_eq!(bus.count(flow_id, Topic::TestsFailed), 1);
    assert_eq!(bus.count(flow_id, Topic::TestsPassed), 1);
    assert_eq!(bus.count(flow_id, Topic::AllModulesTested), 1);
    assert_eq!(bus.count(flow_id, Topic::AppGenerationCompleted), 1);
    assert_eq!(bus.count(flow_id, Topic::AppGenerationFailed), 0);

    // design 1000 + code 500 + tests 200 + refine 300
    assert_eq!(workflow.metrics.total_tokens, 2_000);
    assert!(workflow.errors.is_empty());
}

#[tokio::test]
async fn exhausted_budget_fails_module_and_workflow() {
    let refiner = Arc::new(ScriptedRefiner::new(vec![RefineStep::Touch(vec!["m0/file0.ts".into()])]));
    let (workflow, bus) = Harness::start(scripted(1, refiner.clone()), 3).run("never converges").await;
    let flow_id = workflow.flow_id;

    assert_eq!(workflow.status, Phase::Failed);
    let module = &workflow.modules[0];
    assert_eq!(module.status, ModuleStatus::Failed);
    assert_eq!(module.iteration, 3);
    assert_eq!(module.reports.len(), 4);
    assert_eq!(refiner.calls(), 3);
    assert_eq!(bus.count(flow_id, Topic::TestsFailed), 4);
    assert_eq!(bus.count(flow_id, Topic::AllModulesTested), 0);

    let (stage, module_id, error) = failed_event(&bus, flow_id).unwrap();
    assert_eq!(stage, FailureStage::Refinement);
    assert_eq!(module_id, Some(ModuleId::new("m0")));
    assert!(error.contains("m0"));

    let summary = workflow.summary();
    assert_eq!(summary.failure_stage, Some(FailureStage::Refinement));
    assert!(matches!(summary.phase, Phase::Testing | Phase::Refining));
    assert_eq!(summary.progress, 0);
    assert!(summary.error.is_some());

    // Rewriting a file with identical content is surfaced as non-progress.
    assert!(workflow.errors.iter().any(|e| e.contains("changed nothing")));
}

#[tokio::test]
async fn empty_refinement_carries_every_file_forward() {
    let refiner = Arc::new(ScriptedRefiner::new(vec![RefineStep::Empty, RefineStep::FixAll]));
    let (workflow, bus) = Harness::start(scripted(1, refiner), 3).run("lazy refiner").await;
    let flow_id = workflow.flow_id;

    let carried: Vec<CodeModule> = bus
        .events_for(flow_id)
        .into_iter()
        .filter_map(|e| match e {
            Event::CodeRefinedReady { code_module, .. } => Some(code_module),
            _ => None,
        })
        .collect();
    assert_eq!(carried.len(), 2);
    let first = &carried[0];
    assert_eq!(first.iteration, 1);
    assert_eq!(first.files.len(), 2);
    assert!(first.files.iter().all(|f| f.content == BROKEN && f.iteration == 1));

    assert_eq!(workflow.status, Phase::Completed);
    assert_eq!(workflow.modules[0].iteration, 2);
    assert!(workflow.errors.iter().any(|e| e.contains("carried 2 file(s)")));
}

#[tokio::test]
async fn assembly_is_triggered_once_with_every_module() {
    let refiner = Arc::new(ScriptedRefiner::new(vec![RefineStep::FixAll]));
    let mut collaborators = scripted(4, refiner);
    let test_designer = Arc::new(FixedTestDesigner::new(3));
    collaborators.test_designer = test_designer.clone();
    let (workflow, bus) = Harness::start(collaborators, 3).run("four modules").await;
    let flow_id = workflow.flow_id;

    assert_eq!(workflow.status, Phase::Completed);
    assert!(workflow.all_modules_passed());
    assert_eq!(bus.count(flow_id, Topic::AllModulesTested), 1);
    assert_eq!(bus.count(flow_id, Topic::ModuleCodingRequested), 4);
    // Tests are designed once per module, not per iteration.
    assert_eq!(test_designer.calls.load(Ordering::SeqCst), 4);

    let events = bus.events_for(flow_id);
    let tested = events
        .iter()
        .find_map(|e| match e {
            Event::AllModulesTested { modules, .. } => Some(modules.len()),
            _ => None,
        })
        .unwrap();
    assert_eq!(tested, 4);
    let file_count = events
        .iter()
        .find_map(|e| match e {
            Event::AppGenerationCompleted { artifact, .. } => Some(artifact.file_count),
            _ => None,
        })
        .unwrap();
    assert_eq!(file_count, 8);
    assert_eq!(workflow.current_iteration, 1);
}

#[tokio::test]
async fn design_failure_fails_workflow_at_design() {
    let mut collaborators = scripted(1, Arc::new(ScriptedRefiner::new(vec![])));
    collaborators.designer = Arc::new(Failing(CollaboratorError::unrecoverable("no quota")));
    let (workflow, bus) = Harness::start(collaborators, 3).run("x").await;

    assert_eq!(workflow.status, Phase::Failed);
    assert_eq!(workflow.current_phase, Phase::Designing);
    assert!(workflow.modules.is_empty());
    let (stage, module_id, error) = failed_event(&bus, workflow.flow_id).unwrap();
    assert_eq!(stage, FailureStage::Design);
    assert_eq!(module_id, None);
    assert!(error.contains("no quota"));
}

#[tokio::test]
async fn zero_component_design_fails_at_design() {
    let mut collaborators = scripted(1, Arc::new(ScriptedRefiner::new(vec![])));
    collaborators.designer = Arc::new(foundry_test_utils::StaticDesigner(foundry_test_utils::design(0)));
    let (workflow, bus) = Harness::start(collaborators, 3).run("nothing").await;

    assert_eq!(workflow.status, Phase::Failed);
    assert_eq!(workflow.failure.as_ref().map(|f| f.stage), Some(FailureStage::Design));
    assert_eq!(bus.count(workflow.flow_id, Topic::ModuleCodingRequested), 0);
}

#[tokio::test]
async fn code_generation_failure_fails_module() {
    let mut collaborators = scripted(2, Arc::new(ScriptedRefiner::new(vec![])));
    collaborators.coder = Arc::new(Failing(CollaboratorError::malformed("no blocks")));
    let (workflow, _bus) = Harness::start(collaborators, 3).run("x").await;

    assert_eq!(workflow.status, Phase::Failed);
    let failure = workflow.failure.as_ref().unwrap();
    assert_eq!(failure.stage, FailureStage::Coding);
    assert!(failure.module_id.is_some());
    assert!(workflow.modules.iter().any(|m| m.status == ModuleStatus::Failed));
    assert!(workflow.errors.iter().any(|e| e.starts_with("[coding]")));
}

#[tokio::test]
async fn empty_test_design_fails_module_instead_of_passing() {
    let mut collaborators = scripted(1, Arc::new(ScriptedRefiner::new(vec![])));
    collaborators.test_designer = Arc::new(FixedTestDesigner::new(0));
    let (workflow, bus) = Harness::start(collaborators, 3).run("x").await;

    assert_eq!(workflow.status, Phase::Failed);
    let (stage, module_id, error) = failed_event(&bus, workflow.flow_id).unwrap();
    assert_eq!(stage, FailureStage::TestDesign);
    assert_eq!(module_id, Some(ModuleId::from("m0")));
    assert!(error.contains("no test cases"));
    assert_eq!(bus.count(workflow.flow_id, Topic::TestsPassed), 0);
    assert_eq!(bus.count(workflow.flow_id, Topic::AllModulesTested), 0);
}

#[tokio::test]
async fn unrecoverable_executor_error_fails_at_testing() {
    let mut collaborators = scripted(1, Arc::new(ScriptedRefiner::new(vec![])));
    collaborators.executor = Arc::new(Failing(CollaboratorError::unrecoverable("sandbox gone")));
    let (workflow, _bus) = Harness::start(collaborators, 3).run("x").await;

    assert_eq!(workflow.status, Phase::Failed);
    assert_eq!(workflow.failure.as_ref().map(|f| f.stage), Some(FailureStage::Testing));
    assert_eq!(workflow.modules[0].status, ModuleStatus::Failed);
}

#[tokio::test]
async fn transient_executor_error_becomes_a_failing_report() {
    let refiner = Arc::new(ScriptedRefiner::new(vec![RefineStep::Empty]));
    let mut collaborators = scripted(1, refiner.clone());
    collaborators.executor = Arc::new(Failing(CollaboratorError::transient("runner timed out")));
    let (workflow, _bus) = Harness::start(collaborators, 1).run("x").await;

    assert_eq!(workflow.status, Phase::Failed);
    let report = &workflow.modules[0].reports[0];
    assert_eq!(report.failed_tests, 1);
    assert_eq!(report.results[0].test_id, TestResult::EXECUTION);
    assert_eq!(refiner.seen()[0][0].test_id, TestResult::EXECUTION);
    assert!(workflow.errors.iter().any(|e| e.contains("runner timed out")));
}

/// Blocks its first call until released, then fixes everything
struct GateRefiner {
    entered: Notify,
    release: Notify,
    calls: AtomicUsize,
}

impl GateRefiner {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Refiner for GateRefiner {
    async fn refine(
        &self,
        module: &CodeModule,
        _failures: &[TestResult],
        _tests: &[TestCase],
    ) -> Result<Generated<Vec<FileBlock>>, CollaboratorError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(Generated::free(
            module.files.iter().map(|f| FileBlock::new(f.path.clone(), FIXED)).collect(),
        ))
    }
}

#[tokio::test]
async fn cancellation_stops_module_mutations_without_error() {
    let refiner = Arc::new(GateRefiner::new());
    let mut collaborators = scripted(1, Arc::new(ScriptedRefiner::new(vec![])));
    collaborators.refiner = refiner.clone();
    let harness = Harness::start(collaborators, 3);

    let flow_id = harness.engine.submit("cancel mid refine").await.unwrap();
    tokio::time::timeout(WAIT, refiner.entered.notified()).await.unwrap();
    assert!(harness.engine.cancel(flow_id).await.unwrap());
    refiner.release.notify_one();
    harness.handle.shutdown().await;

    let workflow = harness.engine.workflow(flow_id).await.unwrap();
    assert_eq!(workflow.status, Phase::Cancelled);
    assert_eq!(workflow.modules[0].iteration, 0);
    assert!(workflow.failure.is_none());
    assert_eq!(harness.engine.status(flow_id).await.unwrap().error, None);
    assert_eq!(harness.bus.count(flow_id, Topic::CodeRefinedReady), 0);
    assert_eq!(harness.bus.count(flow_id, Topic::AppGenerationFailed), 0);
}

#[tokio::test]
async fn duplicate_failure_event_does_not_refine_twice() {
    let refiner = Arc::new(GateRefiner::new());
    let mut collaborators = scripted(1, Arc::new(ScriptedRefiner::new(vec![])));
    collaborators.refiner = refiner.clone();
    let harness = Harness::start(collaborators, 3);

    let flow_id = harness.engine.submit("duplicate delivery").await.unwrap();
    tokio::time::timeout(WAIT, refiner.entered.notified()).await.unwrap();

    let original = harness
        .bus
        .events_for(flow_id)
        .into_iter()
        .find(|e| e.topic() == Topic::TestsFailed)
        .unwrap();
    foundry_core::EventBus::publish(harness.bus.as_ref(), original).await.unwrap();
    assert!(harness.bus.wait_for(flow_id, Topic::TestsFailed, 2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    refiner.release.notify_one();

    let workflow = harness.engine.wait_for_terminal(flow_id, WAIT).await.unwrap();
    harness.handle.shutdown().await;

    assert_eq!(workflow.status, Phase::Completed);
    assert_eq!(refiner.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.bus.count(flow_id, Topic::CodeRefinedReady), 1);
    assert_eq!(harness.bus.count(flow_id, Topic::AllModulesTested), 1);
}

#[tokio::test]
async fn status_reports_modules_and_metrics() {
    let refiner = Arc::new(ScriptedRefiner::new(vec![RefineStep::FixAll]));
    let harness = Harness::start(scripted(2, refiner), 3);
    let flow_id = harness.engine.submit("two modules").await.unwrap();
    harness.engine.wait_for_terminal(flow_id, WAIT).await.unwrap();
    harness.handle.shutdown().await;

    let summary = harness.engine.status(flow_id).await.unwrap();
    assert_eq!(summary.status, Phase::Completed);
    assert_eq!(summary.phase, Phase::Assembling);
    assert_eq!(summary.modules.len(), 2);
    assert!(summary.modules.iter().all(|m| m.status == ModuleStatus::Passed && m.iteration == 1));
    assert_eq!(summary.metrics.total_tokens, 1_000 + 2 * (500 + 200 + 300));
    assert_eq!(summary.error, None);
}
