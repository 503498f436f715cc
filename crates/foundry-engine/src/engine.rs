//! Engine facade
//!
//! Wires the orchestrator and the module loop to one bus and one ledger and
//! exposes the caller-facing operations.

use crate::collaborators::Collaborators;
use crate::context::Context;
use crate::dispatch::{spawn_dispatcher, Handler};
use crate::error::EngineError;
use crate::module_loop::ModuleLoop;
use crate::orchestrator::Orchestrator;
use foundry_core::{EngineConfig, EventBus, FlowId, Workflow, WorkflowSummary};
use foundry_store::{WorkflowLedger, WorkflowStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Build/test/refine workflow engine
pub struct Engine {
    ctx: Arc<Context>,
    orchestrator: Arc<Orchestrator>,
    module_loop: Arc<ModuleLoop>,
}

impl Engine {
    /// Create an engine; nothing runs until [`Engine::start`]
    #[must_use]
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        bus: Arc<dyn EventBus>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        let ctx = Arc::new(Context {
            ledger: WorkflowLedger::new(store, &config),
            bus,
            collaborators,
            config,
        });
        Self {
            orchestrator: Arc::new(Orchestrator::new(Arc::clone(&ctx))),
            module_loop: Arc::new(ModuleLoop::new(Arc::clone(&ctx))),
            ctx,
        }
    }

    /// Subscribe both handlers and start dispatching
    ///
    /// Subscriptions are open when this returns.
    #[must_use]
    pub fn start(&self) -> EngineHandle {
        let (stop, shutdown) = watch::channel(false);
        let orchestrator: Arc<dyn Handler> = self.orchestrator.clone();
        let module_loop: Arc<dyn Handler> = self.module_loop.clone();
        let tasks = vec![
            spawn_dispatcher(orchestrator, self.ctx.bus.as_ref(), shutdown.clone()),
            spawn_dispatcher(module_loop, self.ctx.bus.as_ref(), shutdown),
        ];
        tracing::info!(max_iterations = self.ctx.config.max_iterations, "engine started");
        EngineHandle { stop, tasks }
    }

    /// Create a workflow and publish `app_generation.requested`
    ///
    /// # Errors
    ///
    /// Store or bus failures.
    pub async fn submit(&self, request: &str) -> Result<FlowId, EngineError> {
        self.orchestrator.submit(request).await
    }

    /// Cancel a running workflow; `false` when it was already cancelled
    ///
    /// # Errors
    ///
    /// [`foundry_core::WorkflowError::Terminal`] (wrapped) when it already
    /// completed or failed, and store failures.
    pub async fn cancel(&self, flow_id: FlowId) -> Result<bool, EngineError> {
        self.orchestrator.cancel(flow_id).await
    }

    /// Caller-facing status
    ///
    /// # Errors
    ///
    /// Unknown flow id or store failure.
    pub async fn status(&self, flow_id: FlowId) -> Result<WorkflowSummary, EngineError> {
        self.orchestrator.status(flow_id).await
    }

    /// Full workflow record
    ///
    /// # Errors
    ///
    /// Unknown flow id or store failure.
    pub async fn workflow(&self, flow_id: FlowId) -> Result<Workflow, EngineError> {
        Ok(self.ctx.ledger.read(flow_id).await?)
    }

    /// Poll until the workflow is terminal
    ///
    /// # Errors
    ///
    /// [`EngineError::Timeout`] when `timeout` elapses first.
    pub async fn wait_for_terminal(&self, flow_id: FlowId, timeout: Duration) -> Result<Workflow, EngineError> {
        let poll = async {
            loop {
                let workflow = self.ctx.ledger.read(flow_id).await?;
                if workflow.is_terminal() {
                    return Ok::<_, EngineError>(workflow);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| EngineError::Timeout(flow_id, timeout))?
    }

    /// Shared ledger
    #[inline]
    #[must_use]
    pub fn ledger(&self) -> &WorkflowLedger {
        &self.ctx.ledger
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("ledger", &self.ctx.ledger)
            .field("config", &self.ctx.config)
            .finish_non_exhaustive()
    }
}

/// Running dispatchers; stop them with [`EngineHandle::shutdown`]
#[derive(Debug)]
pub struct EngineHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stop dispatching and wait for in-flight handlers
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for joined in futures::future::join_all(self.tasks).await {
            if let Err(err) = joined {
                tracing::error!("dispatcher aborted: {}", err);
            }
        }
        tracing::info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        Generated, ManifestAssembler, MockCodeGenerator, MockDesignGenerator, MockRefiner,
        MockTestDesigner, MockTestExecutor,
    };
    use foundry_artifact::{FileBlock, GeneratedFile, ModuleType};
    use foundry_core::{
        ComponentSpec, DesignDocument, InProcessBus, ModuleStatus, Phase, TestCase, TestResult,
        Topic, Usage,
    };
    use foundry_store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    const WAIT: Duration = Duration::from_secs(5);

    fn one_component() -> DesignDocument {
        DesignDocument {
            summary: "calc".into(),
            components: vec![ComponentSpec::new("calc", "Calc", "adds numbers", ModuleType::Step)],
        }
    }

    fn designer(design: DesignDocument) -> MockDesignGenerator {
        let mut designer = MockDesignGenerator::new();
        designer
            .expect_design()
            .returning(move |_| Ok(Generated::new(design.clone(), Usage::new(100, 0.01))));
        designer
    }

    fn coder() -> MockCodeGenerator {
        let mut coder = MockCodeGenerator::new();
        coder.expect_generate().returning(|component, _| {
            Ok(Generated::new(
                vec![
                    GeneratedFile::new(format!("{}.ts", component.id), "broken", component.module_type),
                    GeneratedFile::new(format!("{}.util.ts", component.id), "broken", component.module_type),
                ],
                Usage::new(50, 0.005),
            ))
        });
        coder
    }

    fn test_designer() -> MockTestDesigner {
        let mut designer = MockTestDesigner::new();
        designer.expect_design_tests().returning(|module| {
            let cases = ["t1", "t2"]
                .iter()
                .map(|id| TestCase::new(*id, module.module_id.clone(), *id, "assert()", "calc.ts"))
                .collect();
            Ok(Generated::free(cases))
        });
        designer
    }

    // Fails both tests until every file contains "fixed".
    fn executor() -> MockTestExecutor {
        let mut executor = MockTestExecutor::new();
        executor.expect_execute().returning(|module, tests| {
            let fixed = module.files.iter().all(|f| f.content == "fixed");
            Ok(tests
                .iter()
                .map(|t| {
                    if fixed {
                        TestResult::pass(t.id.clone())
                    } else {
                        TestResult::fail(t.id.clone(), "wrong answer")
                    }
                })
                .collect())
        });
        executor
    }

    fn engine(refiner: MockRefiner, max_iterations: u32) -> (Engine, Arc<InProcessBus>) {
        let bus = Arc::new(InProcessBus::new());
        let collaborators = Collaborators {
            designer: Arc::new(designer(one_component())),
            coder: Arc::new(coder()),
            test_designer: Arc::new(test_designer()),
            executor: Arc::new(executor()),
            refiner: Arc::new(refiner),
            assembler: Arc::new(ManifestAssembler),
        };
        let config = EngineConfig {
            max_iterations,
            ..EngineConfig::default()
        };
        let engine = Engine::new(Arc::new(MemoryStore::new()), bus.clone(), collaborators, config);
        (engine, bus)
    }

    #[tokio::test]
    async fn refiner_sees_only_failed_results() {
        let mut refiner = MockRefiner::new();
        refiner
            .expect_refine()
            .times(1)
            .withf(|module, failures, tests| {
                module.iteration == 0
                    && failures.len() == 2
                    && failures.iter().all(|r| !r.passed)
                    && tests.len() == 2
            })
            .returning(|module, _, _| {
                let blocks = module
                    .files
                    .iter()
                    .map(|f| FileBlock::new(f.path.clone(), "fixed"))
                    .collect();
                Ok(Generated::new(blocks, Usage::new(10, 0.001)))
            });

        let (engine, _bus) = engine(refiner, 3);
        let handle = engine.start();
        let flow_id = engine.submit("a calculator").await.unwrap();
        let workflow = engine.wait_for_terminal(flow_id, WAIT).await.unwrap();
        handle.shutdown().await;

        assert_eq!(workflow.status, Phase::Completed);
        assert_eq!(workflow.modules[0].status, ModuleStatus::Passed);
        assert_eq!(workflow.modules[0].iteration, 1);
        assert_eq!(workflow.current_iteration, 1);
        assert_eq!(workflow.metrics.total_tokens, 100 + 50 + 10);
    }

    #[tokio::test]
    async fn transient_refiner_error_falls_back_and_is_logged() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let mut refiner = MockRefiner::new();
        refiner.expect_refine().returning(move |module, _, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(foundry_core::CollaboratorError::transient("backend busy"));
            }
            let blocks = module
                .files
                .iter()
                .map(|f| FileBlock::new(f.path.clone(), "fixed"))
                .collect();
            Ok(Generated::free(blocks))
        });

        let (engine, _bus) = engine(refiner, 3);
        let handle = engine.start();
        let flow_id = engine.submit("a calculator").await.unwrap();
        let workflow = engine.wait_for_terminal(flow_id, WAIT).await.unwrap();
        handle.shutdown().await;

        assert_eq!(workflow.status, Phase::Completed);
        assert_eq!(workflow.modules[0].iteration, 2);
        assert!(workflow.errors.iter().any(|e| e.contains("backend busy")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_times_out_without_dispatchers() {
        let (engine, bus) = engine(MockRefiner::new(), 3);
        let mut requests = bus.subscribe(&[Topic::AppGenerationRequested]);
        let flow_id = engine.submit("never started").await.unwrap();
        assert!(requests.recv().await.is_some());

        let err = engine
            .wait_for_terminal(flow_id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(id, _) if id == flow_id));
        assert_eq!(engine.status(flow_id).await.unwrap().status, Phase::Requested);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (engine, _bus) = engine(MockRefiner::new(), 3);
        let flow_id = engine.submit("cancel me").await.unwrap();

        assert!(engine.cancel(flow_id).await.unwrap());
        assert!(!engine.cancel(flow_id).await.unwrap());

        let summary = engine.status(flow_id).await.unwrap();
        assert_eq!(summary.status, Phase::Cancelled);
        assert_eq!(summary.error, None);
    }
}
