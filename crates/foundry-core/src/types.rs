//! Workflow data model
//!
//! [`Workflow`] is the shared record every component reads. Module loops
//! mutate their own [`Module`] entry; the orchestrator mutates phase, design
//! and failure fields. Every mutating method refreshes `updated_at`.

use crate::error::WorkflowError;
use crate::phase::{plan_transition, validate_transition, Phase, PhasePlan};
use chrono::{DateTime, Utc};
use foundry_artifact::{ContentHash, GeneratedFile, MergeOutcome, ModuleType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Workflow identifier (ULID, sortable by creation time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(Ulid);

impl FlowId {
    /// Generate a fresh id
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Wrap an existing ULID
    #[inline]
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Underlying ULID
    #[inline]
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FlowId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Module identifier, taken from the design component id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(String);

impl ModuleId {
    /// Create a module id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Module lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    /// Waiting for code generation
    #[default]
    Pending,
    /// Files present for the current iteration
    Generated,
    /// All tests passed
    Passed,
    /// Refiner running for the next iteration
    Refined,
    /// Iteration budget exhausted or generation failed
    Failed,
}

impl ModuleStatus {
    /// Module loop is done with this module
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Failed)
    }
}

/// Token and cost usage of one collaborator call
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed
    pub tokens: u64,
    /// Estimated cost in USD
    pub cost: f64,
}

impl Usage {
    /// No usage
    pub const ZERO: Usage = Usage { tokens: 0, cost: 0.0 };

    /// Create usage
    #[inline]
    #[must_use]
    pub const fn new(tokens: u64, cost: f64) -> Self {
        Self { tokens, cost }
    }

    /// Reject values that would break metric monotonicity
    ///
    /// # Errors
    ///
    /// [`WorkflowError::InvalidUsage`] for a negative or non-finite cost.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if !self.cost.is_finite() || self.cost < 0.0 {
            return Err(WorkflowError::InvalidUsage(format!("cost {}", self.cost)));
        }
        Ok(())
    }
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            tokens: self.tokens.saturating_add(rhs.tokens),
            cost: self.cost + rhs.cost,
        }
    }
}

/// Accumulated workflow metrics; never decrease
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// Total tokens consumed
    pub total_tokens: u64,
    /// Total estimated cost in USD
    pub estimated_cost: f64,
}

/// A test case designed once per module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    /// Test id
    pub id: String,
    /// Owning module
    pub module_id: ModuleId,
    /// Display name
    pub name: String,
    /// Test source
    pub code: String,
    /// File under test
    pub target_file: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl TestCase {
    /// Create a test case
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        module_id: ModuleId,
        name: impl Into<String>,
        code: impl Into<String>,
        target_file: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            module_id,
            name: name.into(),
            code: code.into(),
            target_file: target_file.into(),
            created_at: Utc::now(),
        }
    }
}

/// Outcome of one test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// Test id
    pub test_id: String,
    /// Passed
    pub passed: bool,
    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Failure stack trace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl TestResult {
    /// Test id reserved for executor failures
    pub const EXECUTION: &'static str = "<execution>";

    /// Passing result
    #[must_use]
    pub fn pass(test_id: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            passed: true,
            error_message: None,
            stack_trace: None,
        }
    }

    /// Failing result
    #[must_use]
    pub fn fail(test_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            passed: false,
            error_message: Some(message.into()),
            stack_trace: None,
        }
    }

    /// With stack trace
    #[inline]
    #[must_use]
    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }
}

/// Immutable report of one test execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    /// Iteration the tests ran against
    pub iteration: u32,
    /// Number of results
    pub total_tests: usize,
    /// Passing results
    pub passed_tests: usize,
    /// Failing results
    pub failed_tests: usize,
    /// Individual results
    pub results: Vec<TestResult>,
    /// Execution time
    pub executed_at: DateTime<Utc>,
}

impl TestReport {
    /// Build a report; counts are derived from `results`
    #[must_use]
    pub fn from_results(iteration: u32, results: Vec<TestResult>) -> Self {
        let passed_tests = results.iter().filter(|r| r.passed).count();
        Self {
            iteration,
            total_tests: results.len(),
            passed_tests,
            failed_tests: results.len() - passed_tests,
            results,
            executed_at: Utc::now(),
        }
    }

    /// Synthetic failed report for an executor that could not run
    #[must_use]
    pub fn execution_failure(iteration: u32, message: impl Into<String>) -> Self {
        Self::from_results(iteration, vec![TestResult::fail(TestResult::EXECUTION, message)])
    }

    /// No failing test
    #[inline]
    #[must_use]
    pub fn is_passing(&self) -> bool {
        self.failed_tests == 0
    }

    /// Failing results only
    #[must_use]
    pub fn failures(&self) -> Vec<TestResult> {
        self.results.iter().filter(|r| !r.passed).cloned().collect()
    }
}

/// One component of the design; becomes one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Component id, reused as module id
    pub id: String,
    /// Display name
    pub name: String,
    /// What the component does
    pub description: String,
    /// Module kind
    pub module_type: ModuleType,
}

impl ComponentSpec {
    /// Create a component
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        module_type: ModuleType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            module_type,
        }
    }
}

/// Output of the design generator
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignDocument {
    /// Architecture summary
    pub summary: String,
    /// Components to build
    pub components: Vec<ComponentSpec>,
}

impl DesignDocument {
    /// Number of components
    #[inline]
    #[must_use]
    pub fn component_count(&self) -> usize {
        self.components.len()
    }
}

/// Snapshot of a module's code carried in events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeModule {
    /// Module id
    pub module_id: ModuleId,
    /// Module name
    pub name: String,
    /// Module kind
    pub module_type: ModuleType,
    /// Files at `iteration`
    pub files: Vec<GeneratedFile>,
    /// Iteration of the files
    pub iteration: u32,
}

/// Summary of an assembled artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledArtifact {
    /// Modules included
    pub module_count: usize,
    /// Files included
    pub file_count: usize,
    /// Hash over every file
    pub content_hash: ContentHash,
    /// File paths in assembly order
    pub paths: Vec<String>,
}

/// A buildable unit of the artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    /// Module id
    pub id: ModuleId,
    /// Display name
    pub name: String,
    /// Module kind
    pub module_type: ModuleType,
    /// Current files
    pub files: Vec<GeneratedFile>,
    /// Lifecycle status
    pub status: ModuleStatus,
    /// Refine cycles completed
    pub iteration: u32,
    /// Test report history, oldest first
    #[serde(default)]
    pub reports: Vec<TestReport>,
}

impl Module {
    /// Pending module for a design component
    #[must_use]
    pub fn from_component(component: &ComponentSpec) -> Self {
        Self {
            id: ModuleId::new(component.id.clone()),
            name: component.name.clone(),
            module_type: component.module_type,
            files: Vec::new(),
            status: ModuleStatus::Pending,
            iteration: 0,
            reports: Vec::new(),
        }
    }

    /// Event payload snapshot
    #[must_use]
    pub fn snapshot(&self) -> CodeModule {
        CodeModule {
            module_id: self.id.clone(),
            name: self.name.clone(),
            module_type: self.module_type,
            files: self.files.clone(),
            iteration: self.iteration,
        }
    }

    /// Reject events for another iteration
    ///
    /// # Errors
    ///
    /// [`WorkflowError::StaleIteration`] when `iteration` differs from the
    /// stored one.
    pub fn expect_iteration(&self, iteration: u32) -> Result<(), WorkflowError> {
        if self.iteration == iteration {
            Ok(())
        } else {
            Err(WorkflowError::StaleIteration {
                module: self.id.clone(),
                event: iteration,
                stored: self.iteration,
            })
        }
    }

    /// Store first-generation files
    pub fn install_generated(&mut self, files: Vec<GeneratedFile>) {
        self.files = files.into_iter().map(|f| f.carried_to(0)).collect();
        self.iteration = 0;
        self.status = ModuleStatus::Generated;
    }

    /// Append a report to the history
    pub fn record_report(&mut self, report: TestReport) {
        self.reports.push(report);
    }

    /// Latest report
    #[must_use]
    pub fn latest_report(&self) -> Option<&TestReport> {
        self.reports.last()
    }

    /// Store merged files and advance the iteration
    pub fn apply_merge(&mut self, outcome: &MergeOutcome) {
        self.files.clone_from(&outcome.files);
        self.iteration = outcome.iteration;
        self.status = ModuleStatus::Generated;
    }
}

/// Pipeline stage a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Design generation
    Design,
    /// Module code generation
    Coding,
    /// Test design
    TestDesign,
    /// Test execution
    Testing,
    /// Refinement budget exhausted
    Refinement,
    /// Artifact assembly
    Assembly,
}

impl FailureStage {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Design => "design",
            Self::Coding => "coding",
            Self::TestDesign => "test_design",
            Self::Testing => "testing",
            Self::Refinement => "refinement",
            Self::Assembly => "assembly",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a workflow failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    /// Stage
    pub stage: FailureStage,
    /// Module, when the failure is module-scoped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<ModuleId>,
    /// Human-readable message
    pub error: String,
}

impl FailureInfo {
    /// Workflow-scoped failure
    #[must_use]
    pub fn new(stage: FailureStage, error: impl Into<String>) -> Self {
        Self {
            stage,
            module_id: None,
            error: error.into(),
        }
    }

    /// With module scope
    #[inline]
    #[must_use]
    pub fn with_module(mut self, module_id: ModuleId) -> Self {
        self.module_id = Some(module_id);
        self
    }
}

/// The shared workflow record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Workflow id
    pub flow_id: FlowId,
    /// Submitted description
    pub request: String,
    /// Phase, including terminal sinks
    pub status: Phase,
    /// Last active phase; equals `status` until the workflow is terminal
    pub current_phase: Phase,
    /// Modules created from the design
    pub modules: Vec<Module>,
    /// Highest module iteration reached
    pub current_iteration: u32,
    /// Iteration budget per module
    pub max_iterations: u32,
    /// Usage totals
    pub metrics: Metrics,
    /// Error log, most recent last
    pub errors: Vec<String>,
    /// Design, once produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design_document: Option<DesignDocument>,
    /// Set exactly when `status` is failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    /// `all_modules.tested` has been emitted
    pub assembly_triggered: bool,
    /// Store version for compare-and-set
    pub version: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// New workflow in `requested`
    #[must_use]
    pub fn new(flow_id: FlowId, request: impl Into<String>, max_iterations: u32) -> Self {
        let now = Utc::now();
        Self {
            flow_id,
            request: request.into(),
            status: Phase::Requested,
            current_phase: Phase::Requested,
            modules: Vec::new(),
            current_iteration: 0,
            max_iterations,
            metrics: Metrics::default(),
            errors: Vec::new(),
            design_document: None,
            failure: None,
            assembly_triggered: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// In a terminal phase
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Progress percentage
    #[inline]
    #[must_use]
    pub fn progress(&self) -> u8 {
        self.status.progress()
    }

    /// Refresh `updated_at`; never moves it backwards
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Fail with [`WorkflowError::Terminal`] once terminal
    ///
    /// # Errors
    ///
    /// Returns the terminal phase as an error.
    pub fn ensure_active(&self) -> Result<(), WorkflowError> {
        if self.is_terminal() {
            Err(WorkflowError::Terminal(self.status))
        } else {
            Ok(())
        }
    }

    /// Move towards `target`, walking every intermediate DAG edge
    ///
    /// # Errors
    ///
    /// Propagates [`plan_transition`] errors; a stale or repeated target is
    /// not an error and leaves the record untouched.
    pub fn enter_phase(&mut self, target: Phase) -> Result<PhasePlan, WorkflowError> {
        let plan = plan_transition(self.status, target)?;
        if let PhasePlan::Steps(steps) = &plan {
            for &step in steps {
                validate_transition(self.status, step)?;
                tracing::debug!(flow_id = %self.flow_id, from = %self.status, to = %step, "phase transition");
                self.status = step;
            }
            if !self.status.is_terminal() {
                self.current_phase = self.status;
            }
            self.touch();
        }
        Ok(plan)
    }

    /// Append to the error log
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.touch();
    }

    /// Fold collaborator usage into metrics
    ///
    /// # Errors
    ///
    /// [`WorkflowError::InvalidUsage`] for negative or non-finite cost.
    pub fn record_usage(&mut self, usage: Usage) -> Result<(), WorkflowError> {
        usage.validate()?;
        self.metrics.total_tokens = self.metrics.total_tokens.saturating_add(usage.tokens);
        self.metrics.estimated_cost += usage.cost;
        self.touch();
        Ok(())
    }

    /// Store the design and create one pending module per component
    pub fn set_design(&mut self, design: DesignDocument) {
        self.modules = design.components.iter().map(Module::from_component).collect();
        self.design_document = Some(design);
        self.touch();
    }

    /// Look up a module
    #[must_use]
    pub fn module(&self, id: &ModuleId) -> Option<&Module> {
        self.modules.iter().find(|m| &m.id == id)
    }

    /// Look up a module for mutation
    ///
    /// # Errors
    ///
    /// [`WorkflowError::UnknownModule`] when absent.
    pub fn module_mut(&mut self, id: &ModuleId) -> Result<&mut Module, WorkflowError> {
        self.touch();
        self.modules
            .iter_mut()
            .find(|m| &m.id == id)
            .ok_or_else(|| WorkflowError::UnknownModule(id.clone()))
    }

    /// Recompute `current_iteration` from the modules
    pub fn sync_iteration(&mut self) {
        let highest = self.modules.iter().map(|m| m.iteration).max().unwrap_or(0);
        self.current_iteration = self.current_iteration.max(highest);
    }

    /// Every module passed (and there is at least one)
    #[must_use]
    pub fn all_modules_passed(&self) -> bool {
        !self.modules.is_empty() && self.modules.iter().all(|m| m.status == ModuleStatus::Passed)
    }

    /// Move to `failed`, recording stage and message
    ///
    /// # Errors
    ///
    /// [`WorkflowError::Terminal`] when already terminal.
    pub fn fail(&mut self, info: FailureInfo) -> Result<(), WorkflowError> {
        self.enter_phase(Phase::Failed)?;
        self.errors.push(format!("[{}] {}", info.stage, info.error));
        self.failure = Some(info);
        Ok(())
    }

    /// Move to `cancelled`; returns false when already cancelled
    ///
    /// # Errors
    ///
    /// [`WorkflowError::Terminal`] when completed or failed.
    pub fn cancel(&mut self) -> Result<bool, WorkflowError> {
        match self.enter_phase(Phase::Cancelled)? {
            PhasePlan::Stay => Ok(false),
            _ => Ok(true),
        }
    }

    /// Status view for callers
    #[must_use]
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            flow_id: self.flow_id,
            status: self.status,
            phase: self.current_phase,
            progress: self.progress(),
            error: self.failure.as_ref().map(|f| f.error.clone()),
            failure_stage: self.failure.as_ref().map(|f| f.stage),
            modules: self
                .modules
                .iter()
                .map(|m| ModuleSummary {
                    id: m.id.clone(),
                    status: m.status,
                    iteration: m.iteration,
                })
                .collect(),
            metrics: self.metrics,
            iteration: self.current_iteration,
            updated_at: self.updated_at,
        }
    }
}

/// Module line of a [`WorkflowSummary`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSummary {
    /// Module id
    pub id: ModuleId,
    /// Status
    pub status: ModuleStatus,
    /// Iteration
    pub iteration: u32,
}

/// User-facing workflow status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    /// Workflow id
    pub flow_id: FlowId,
    /// Status
    pub status: Phase,
    /// Phase reached (where it failed, for failed workflows)
    pub phase: Phase,
    /// Progress percentage
    pub progress: u8,
    /// Failure message; never set for cancelled workflows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_stage: Option<FailureStage>,
    /// Modules
    pub modules: Vec<ModuleSummary>,
    /// Usage totals
    pub metrics: Metrics,
    /// Highest module iteration
    pub iteration: u32,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}
