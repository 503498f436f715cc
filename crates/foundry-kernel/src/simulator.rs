//! Seeded workflow simulator
//!
//! Drives synthetic workflows through the real engine with simulated
//! collaborators, then checks the engine's invariants on every record:
//!
//! - no module iteration exceeds the budget
//! - assembly is all-or-nothing: a completed workflow has every module
//!   passed, a failed one has none assembled
//! - `all_modules.tested` is emitted at most once, and exactly once with the
//!   full module list for completed workflows
//! - failed workflows carry their failure stage and message

use async_trait::async_trait;
use foundry_artifact::{FileBlock, GeneratedFile};
use foundry_core::{
    CodeModule, CollaboratorError, ComponentSpec, DesignDocument, Event, EventBus, FlowId,
    FoundryConfig, InProcessBus, ModuleStatus, ModuleType, Phase, Subscription, TestCase,
    TestResult, Topic, Usage, Workflow,
};
use foundry_engine::{
    CodeGenerator, Collaborators, DesignGenerator, Engine, EngineError, Generated,
    ManifestAssembler, Refiner, TestDesigner, TestExecutor,
};
use foundry_store::MemoryStore;
use foundry_watchdog::Watchdog;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const BUG: &str = "// bug";
const CLEAN: &str = "// ok";
const MODULE_TYPES: [ModuleType; 4] = [ModuleType::Types, ModuleType::Service, ModuleType::Step, ModuleType::Config];

/// Simulator configuration
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Workflows to submit
    pub workflows: usize,
    /// Components per design
    pub modules: usize,
    /// Chance that the refiner fixes a given broken file
    pub fix_probability: f64,
    /// Chance that a test execution fails transiently
    pub error_probability: f64,
    /// Run the watchdog alongside the engine
    pub watchdog: bool,
    /// Per-workflow completion deadline
    #[serde(skip)]
    pub timeout: Duration,
    /// Engine and watchdog settings
    #[serde(skip)]
    pub foundry: FoundryConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            workflows: 10,
            modules: 3,
            fix_probability: 0.6,
            error_probability: 0.02,
            watchdog: false,
            timeout: Duration::from_secs(30),
            foundry: FoundryConfig::default(),
        }
    }
}

/// An invariant the engine broke
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Workflow did not finish in time
    Timeout { flow_id: String },
    /// A module went past the budget
    IterationBound {
        flow_id: String,
        module_id: String,
        iteration: u32,
        max: u32,
    },
    /// Completed without every module passed
    PartialAssembly { flow_id: String, passed: usize, modules: usize },
    /// `all_modules.tested` count or payload is wrong
    AssemblyTrigger {
        flow_id: String,
        emitted: usize,
        listed: usize,
        modules: usize,
    },
    /// Failed without failure info
    MissingFailure { flow_id: String },
    /// Completion event for a workflow that did not complete
    UnexpectedCompletion { flow_id: String, status: Phase },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { flow_id } => write!(f, "{flow_id}: still running at deadline"),
            Self::IterationBound {
                flow_id,
                module_id,
                iteration,
                max,
            } => write!(f, "{flow_id}: module {module_id} reached iteration {iteration} > {max}"),
            Self::PartialAssembly { flow_id, passed, modules } => {
                write!(f, "{flow_id}: completed with {passed}/{modules} module(s) passed")
            }
            Self::AssemblyTrigger {
                flow_id,
                emitted,
                listed,
                modules,
            } => write!(
                f,
                "{flow_id}: all_modules.tested emitted {emitted} time(s) listing {listed} of {modules} module(s)"
            ),
            Self::MissingFailure { flow_id } => write!(f, "{flow_id}: failed without failure info"),
            Self::UnexpectedCompletion { flow_id, status } => {
                write!(f, "{flow_id}: completion emitted but status is {status}")
            }
        }
    }
}

/// Statistics for a run
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulatorStats {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub modules: usize,
    pub refinements: u64,
    pub max_iteration: u32,
    pub total_tokens: u64,
    pub estimated_cost: f64,
    pub logged_errors: usize,
    pub risks: usize,
    pub milestones: usize,
    pub cost_alerts: usize,
}

/// Final report
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    pub config: SimulatorConfig,
    pub stats: SimulatorStats,
    pub violations: Vec<Violation>,
}

impl SimulatorReport {
    /// No invariant was broken
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let s = &self.stats;
        let mut out = String::new();
        let _ = writeln!(out, "=== Foundry Simulator Report ===\n");
        let _ = writeln!(out, "Seed: {}", self.config.seed);
        let _ = writeln!(out, "Workflows: {} ({} module(s) each)", s.submitted, self.config.modules);
        let _ = writeln!(out, "Max Iterations: {}", self.config.foundry.engine.max_iterations);
        let _ = writeln!(out, "Fix Probability: {:.2}", self.config.fix_probability);
        let _ = writeln!(out, "Completed: {}", s.completed);
        let _ = writeln!(out, "Failed: {}", s.failed);
        let _ = writeln!(out, "Timed Out: {}", s.timed_out);
        let _ = writeln!(out, "Refinements: {}", s.refinements);
        let _ = writeln!(out, "Highest Iteration: {}", s.max_iteration);
        let _ = writeln!(out, "Tokens: {}", s.total_tokens);
        let _ = writeln!(out, "Estimated Cost: ${:.4}", s.estimated_cost);
        let _ = writeln!(out, "Logged Errors: {}", s.logged_errors);
        if self.config.watchdog {
            let _ = writeln!(
                out,
                "Watchdog: {} risk(s), {} milestone(s), {} cost alert(s)",
                s.risks, s.milestones, s.cost_alerts
            );
        }
        let _ = writeln!(out, "Violations: {}", self.violations.len());
        if !self.violations.is_empty() {
            let _ = writeln!(out, "\n=== Violations ===");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(out, "{}. {v}", i + 1);
            }
        }
        let _ = writeln!(out, "\nStatus: {}", if self.passed() { "PASSED" } else { "FAILED" });
        out
    }
}

// ----------------------------------------------------------------------------
// Simulated collaborators
// ----------------------------------------------------------------------------

type SharedRng = Arc<Mutex<StdRng>>;

struct SimDesigner {
    modules: usize,
}

#[async_trait]
impl DesignGenerator for SimDesigner {
    async fn design(&self, request: &str) -> Result<Generated<DesignDocument>, CollaboratorError> {
        let components = (0..self.modules)
            .map(|i| {
                ComponentSpec::new(
                    format!("mod{i}"),
                    format!("Module {i}"),
                    format!("part {i} of {request}"),
                    MODULE_TYPES[i % MODULE_TYPES.len()],
                )
            })
            .collect();
        let design = DesignDocument {
            summary: request.to_string(),
            components,
        };
        Ok(Generated::new(design, Usage::new(800, 0.008)))
    }
}

struct SimCoder {
    rng: SharedRng,
}

#[async_trait]
impl CodeGenerator for SimCoder {
    async fn generate(
        &self,
        component: &ComponentSpec,
        _design: &DesignDocument,
    ) -> Result<Generated<Vec<GeneratedFile>>, CollaboratorError> {
        let files = {
            let mut rng = self.rng.lock();
            let count = rng.random_range(1..=3);
            (0..count)
                .map(|i| {
                    let content = if rng.random_bool(0.5) { BUG } else { CLEAN };
                    GeneratedFile::new(format!("src/{}/part{i}.ts", component.id), content, component.module_type)
                })
                .collect()
        };
        Ok(Generated::new(files, Usage::new(1_500, 0.015)))
    }
}

struct SimTestDesigner;

#[async_trait]
impl TestDesigner for SimTestDesigner {
    async fn design_tests(&self, module: &CodeModule) -> Result<Generated<Vec<TestCase>>, CollaboratorError> {
        let cases = module
            .files
            .iter()
            .map(|f| {
                TestCase::new(
                    format!("{}::{}", module.module_id, f.path),
                    module.module_id.clone(),
                    format!("checks {}", f.path),
                    "expect(ok)",
                    f.path.clone(),
                )
            })
            .collect();
        Ok(Generated::new(cases, Usage::new(600, 0.006)))
    }
}

struct SimExecutor {
    rng: SharedRng,
    error_probability: f64,
}

#[async_trait]
impl TestExecutor for SimExecutor {
    async fn execute(&self, module: &CodeModule, tests: &[TestCase]) -> Result<Vec<TestResult>, CollaboratorError> {
        if self.rng.lock().random_bool(self.error_probability) {
            return Err(CollaboratorError::transient("sandbox did not start"));
        }
        Ok(tests
            .iter()
            .map(|t| {
                let broken = module
                    .files
                    .iter()
                    .any(|f| f.path == t.target_file && f.content.contains(BUG));
                if broken {
                    TestResult::fail(t.id.clone(), "assertion failed").with_stack_trace(format!("at {}:1", t.target_file))
                } else {
                    TestResult::pass(t.id.clone())
                }
            })
            .collect())
    }
}

struct SimRefiner {
    rng: SharedRng,
    fix_probability: f64,
}

#[async_trait]
impl Refiner for SimRefiner {
    async fn refine(
        &self,
        module: &CodeModule,
        failures: &[TestResult],
        tests: &[TestCase],
    ) -> Result<Generated<Vec<FileBlock>>, CollaboratorError> {
        let targets: Vec<&str> = failures
            .iter()
            .filter_map(|r| tests.iter().find(|t| t.id == r.test_id))
            .map(|t| t.target_file.as_str())
            .collect();
        let blocks = {
            let mut rng = self.rng.lock();
            module
                .files
                .iter()
                .filter(|f| targets.contains(&f.path.as_str()) && rng.random_bool(self.fix_probability))
                .map(|f| FileBlock::new(f.path.clone(), CLEAN))
                .collect()
        };
        Ok(Generated::new(blocks, Usage::new(1_000, 0.01)))
    }
}

fn collaborators(config: &SimulatorConfig) -> Collaborators {
    let rng: SharedRng = Arc::new(Mutex::new(StdRng::seed_from_u64(config.seed)));
    Collaborators {
        designer: Arc::new(SimDesigner {
            modules: config.modules,
        }),
        coder: Arc::new(SimCoder { rng: Arc::clone(&rng) }),
        test_designer: Arc::new(SimTestDesigner),
        executor: Arc::new(SimExecutor {
            rng: Arc::clone(&rng),
            error_probability: config.error_probability.clamp(0.0, 1.0),
        }),
        refiner: Arc::new(SimRefiner {
            rng,
            fix_probability: config.fix_probability.clamp(0.0, 1.0),
        }),
        assembler: Arc::new(ManifestAssembler),
    }
}

// ----------------------------------------------------------------------------
// Run and check
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Observed {
    tested: Vec<usize>,
    completed: usize,
}

fn drain(subscription: &mut Subscription, stats: &mut SimulatorStats) -> HashMap<FlowId, Observed> {
    let mut observed: HashMap<FlowId, Observed> = HashMap::new();
    while let Some(envelope) = subscription.try_recv() {
        match envelope.event {
            Event::AllModulesTested { flow_id, modules, .. } => {
                observed.entry(flow_id).or_default().tested.push(modules.len());
            }
            Event::AppGenerationCompleted { flow_id, .. } => observed.entry(flow_id).or_default().completed += 1,
            Event::RiskFlagged(_) => stats.risks += 1,
            Event::MilestoneReached(_) => stats.milestones += 1,
            Event::CostAlert(_) => stats.cost_alerts += 1,
            _ => {}
        }
    }
    observed
}

fn check(workflow: &Workflow, observed: Option<&Observed>, violations: &mut Vec<Violation>) {
    let flow_id = workflow.flow_id.to_string();
    for module in &workflow.modules {
        if module.iteration > workflow.max_iterations {
            violations.push(Violation::IterationBound {
                flow_id: flow_id.clone(),
                module_id: module.id.to_string(),
                iteration: module.iteration,
                max: workflow.max_iterations,
            });
        }
    }

    let empty = Observed::default();
    let observed = observed.unwrap_or(&empty);
    let emitted = observed.tested.len();
    let listed = observed.tested.first().copied().unwrap_or(0);
    let modules = workflow.modules.len();
    let passed = workflow.modules.iter().filter(|m| m.status == ModuleStatus::Passed).count();

    match workflow.status {
        Phase::Completed => {
            if passed != modules || modules == 0 {
                violations.push(Violation::PartialAssembly {
                    flow_id: flow_id.clone(),
                    passed,
                    modules,
                });
            }
            if emitted != 1 || listed != modules {
                violations.push(Violation::AssemblyTrigger {
                    flow_id,
                    emitted,
                    listed,
                    modules,
                });
            }
        }
        status => {
            if emitted > 1 || (emitted == 1 && listed != modules) {
                violations.push(Violation::AssemblyTrigger {
                    flow_id: flow_id.clone(),
                    emitted,
                    listed,
                    modules,
                });
            }
            if status == Phase::Failed && workflow.failure.is_none() {
                violations.push(Violation::MissingFailure { flow_id: flow_id.clone() });
            }
            if observed.completed > 0 {
                violations.push(Violation::UnexpectedCompletion { flow_id, status });
            }
        }
    }
}

/// Run the simulation
///
/// # Errors
///
/// Engine failures outside the workflows themselves, such as a submit that
/// cannot be stored.
pub async fn run_simulator(config: SimulatorConfig) -> Result<SimulatorReport, EngineError> {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(InProcessBus::new());
    let mut observer = bus.subscribe(&[
        Topic::AllModulesTested,
        Topic::AppGenerationCompleted,
        Topic::RiskFlagged,
        Topic::MilestoneReached,
        Topic::CostAlert,
    ]);

    let engine = Engine::new(store.clone(), bus.clone(), collaborators(&config), config.foundry.engine.clone());
    let handle = engine.start();

    let (stop_watchdog, shutdown) = watch::channel(false);
    let watchdog = config.watchdog.then(|| {
        let dog = Arc::new(Watchdog::new(store.clone(), bus.clone(), config.foundry.watchdog.clone()));
        dog.spawn(shutdown)
    });

    tracing::info!(seed = config.seed, workflows = config.workflows, "simulation started");
    let mut flow_ids = Vec::with_capacity(config.workflows);
    for i in 0..config.workflows {
        flow_ids.push(engine.submit(&format!("simulated app #{i}")).await?);
    }

    let mut stats = SimulatorStats {
        submitted: flow_ids.len(),
        ..SimulatorStats::default()
    };
    let mut violations = Vec::new();
    let mut finished = Vec::with_capacity(flow_ids.len());
    for flow_id in flow_ids {
        match engine.wait_for_terminal(flow_id, config.timeout).await {
            Ok(workflow) => finished.push(workflow.flow_id),
            Err(EngineError::Timeout(..)) => {
                stats.timed_out += 1;
                violations.push(Violation::Timeout {
                    flow_id: flow_id.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }

    handle.shutdown().await;
    let _ = stop_watchdog.send(true);
    if let Some(task) = watchdog {
        let _ = task.await;
    }

    let observed = drain(&mut observer, &mut stats);
    for flow_id in finished {
        let workflow = engine.workflow(flow_id).await?;
        match workflow.status {
            Phase::Completed => stats.completed += 1,
            Phase::Failed => stats.failed += 1,
            _ => {}
        }
        stats.modules += workflow.modules.len();
        stats.refinements += workflow.modules.iter().map(|m| u64::from(m.iteration)).sum::<u64>();
        stats.max_iteration = stats.max_iteration.max(workflow.current_iteration);
        stats.total_tokens += workflow.metrics.total_tokens;
        stats.estimated_cost += workflow.metrics.estimated_cost;
        stats.logged_errors += workflow.errors.len();
        check(&workflow, observed.get(&flow_id), &mut violations);
    }

    tracing::info!(violations = violations.len(), "simulation finished");
    Ok(SimulatorReport {
        config,
        stats,
        violations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_core::{FailureInfo, FailureStage, Module};

    fn finished(status: Phase, passed: usize, modules: usize) -> Workflow {
        let mut wf = Workflow::new(FlowId::new(), "x", 3);
        wf.status = status;
        wf.modules = (0..modules)
            .map(|i| {
                let mut m = Module::from_component(&ComponentSpec::new(format!("m{i}"), "M", "", ModuleType::Step));
                if i < passed {
                    m.status = ModuleStatus::Passed;
                }
                m
            })
            .collect();
        wf
    }

    #[test]
    fn completed_workflow_needs_single_full_trigger() {
        let wf = finished(Phase::Completed, 2, 2);
        let mut violations = Vec::new();
        check(
            &wf,
            Some(&Observed {
                tested: vec![2],
                completed: 1,
            }),
            &mut violations,
        );
        assert!(violations.is_empty());

        check(
            &wf,
            Some(&Observed {
                tested: vec![2, 2],
                completed: 1,
            }),
            &mut violations,
        );
        assert!(matches!(violations[0], Violation::AssemblyTrigger { emitted: 2, .. }));
    }

    #[test]
    fn partial_assembly_is_flagged() {
        let wf = finished(Phase::Completed, 1, 2);
        let mut violations = Vec::new();
        check(
            &wf,
            Some(&Observed {
                tested: vec![2],
                completed: 1,
            }),
            &mut violations,
        );
        assert!(matches!(violations[0], Violation::PartialAssembly { passed: 1, modules: 2, .. }));
    }

    #[test]
    fn failed_workflow_needs_failure_info() {
        let mut wf = finished(Phase::Failed, 0, 1);
        let mut violations = Vec::new();
        check(&wf, None, &mut violations);
        assert!(matches!(violations[0], Violation::MissingFailure { .. }));

        violations.clear();
        wf.failure = Some(FailureInfo::new(FailureStage::Refinement, "budget"));
        check(&wf, None, &mut violations);
        assert!(violations.is_empty());
    }

    #[test]
    fn iteration_above_budget_is_flagged() {
        let mut wf = finished(Phase::Failed, 0, 1);
        wf.failure = Some(FailureInfo::new(FailureStage::Refinement, "budget"));
        wf.modules[0].iteration = 4;
        let mut violations = Vec::new();
        check(&wf, None, &mut violations);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].to_string().contains("iteration 4 > 3"));
    }

    #[tokio::test]
    async fn sure_fixes_complete_every_workflow() {
        let config = SimulatorConfig {
            workflows: 5,
            modules: 3,
            fix_probability: 1.0,
            error_probability: 0.0,
            ..SimulatorConfig::default()
        };
        let report = run_simulator(config).await.unwrap();
        assert!(report.passed(), "{}", report.generate_text());
        assert_eq!(report.stats.completed, 5);
        assert!(report.stats.max_iteration <= 1);
    }

    #[tokio::test]
    async fn hopeless_refiner_fails_within_budget() {
        let config = SimulatorConfig {
            seed: 7,
            workflows: 4,
            modules: 4,
            fix_probability: 0.0,
            error_probability: 0.0,
            ..SimulatorConfig::default()
        };
        let report = run_simulator(config).await.unwrap();
        assert!(report.passed(), "{}", report.generate_text());
        assert_eq!(report.stats.completed + report.stats.failed, 4);
        assert!(report.stats.max_iteration <= 3);
    }
}
