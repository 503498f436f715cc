//! Per-module build/test/refine loop
//!
//! ```text
//! module_coding.requested → generate   → module_coding.completed
//! module_coding.completed → test design → tests_designed.ready
//! tests_designed.ready    ┐
//! code_refined.ready      ┴ execute     → tests.passed | tests.failed
//! tests.failed            → refine + merge → code_refined.ready
//! ```
//!
//! Each step re-reads the workflow before calling a collaborator and skips
//! terminal workflows. Each commit re-checks the module's iteration and
//! status, so late and duplicate deliveries are dropped instead of applied
//! twice.

use crate::context::Context;
use crate::dispatch::Handler;
use crate::error::EngineError;
use async_trait::async_trait;
use foundry_artifact::merge_refinement;
use foundry_core::{
    CodeModule, ComponentSpec, DesignDocument, Envelope, Event, FailureStage, FlowId, ModuleId,
    ModuleStatus, TestCase, TestReport, Topic, Usage, WorkflowError,
};
use std::sync::Arc;

const TOPICS: &[Topic] = &[
    Topic::ModuleCodingRequested,
    Topic::ModuleCodingCompleted,
    Topic::TestsDesignedReady,
    Topic::TestsFailed,
    Topic::CodeRefinedReady,
];

enum Verdict {
    Refine(CodeModule),
    Exhausted { failed_tests: usize },
}

pub(crate) struct ModuleLoop {
    ctx: Arc<Context>,
}

impl ModuleLoop {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn generate(
        &self,
        flow_id: FlowId,
        module_id: ModuleId,
        component: ComponentSpec,
        design: DesignDocument,
    ) -> Result<(), EngineError> {
        let Some(wf) = self.ctx.active(flow_id).await? else {
            return Ok(());
        };
        let module = wf
            .module(&module_id)
            .ok_or_else(|| WorkflowError::UnknownModule(module_id.clone()))?;
        if module.status != ModuleStatus::Pending {
            return Err(WorkflowError::Duplicate(format!("{module_id} already generated")).into());
        }

        // No refine cycle exists yet to absorb a coding error; leaving the
        // module pending would stall assembly for ever
        let generated = match self.ctx.collaborators.coder.generate(&component, &design).await {
            Ok(generated) if generated.value.is_empty() => {
                return self
                    .ctx
                    .fail_module(flow_id, &module_id, FailureStage::Coding, "code generator returned no files".into())
                    .await;
            }
            Ok(generated) => generated,
            Err(err) => {
                return self
                    .ctx
                    .fail_module(flow_id, &module_id, FailureStage::Coding, err.to_string())
                    .await;
            }
        };

        let id = module_id.clone();
        let (code, _) = self
            .ctx
            .ledger
            .update(flow_id, move |wf| {
                wf.ensure_active()?;
                let module = wf.module_mut(&id)?;
                if module.status != ModuleStatus::Pending {
                    return Err(WorkflowError::Duplicate(format!("{id} already generated")));
                }
                module.install_generated(generated.value.clone());
                let code = module.snapshot();
                wf.record_usage(generated.usage)?;
                Ok(code)
            })
            .await?;

        tracing::info!(flow_id = %flow_id, module_id = %module_id, files = code.files.len(), "module generated");
        self.ctx
            .publish(Event::ModuleCodingCompleted {
                flow_id,
                module_id,
                code_module: code,
            })
            .await
    }

    async fn design_tests(&self, flow_id: FlowId, module_id: ModuleId, code: CodeModule) -> Result<(), EngineError> {
        if self.ctx.active(flow_id).await?.is_none() {
            return Ok(());
        }

        let store = self.ctx.ledger.store();
        let test_cases = if let Some(existing) = store.get_test_cases(flow_id, &module_id).await? {
            tracing::debug!(flow_id = %flow_id, module_id = %module_id, "reusing stored test cases");
            existing
        } else {
            // Same as coding: without test cases the module can never pass or refine
            let designed = match self.ctx.collaborators.test_designer.design_tests(&code).await {
                Ok(designed) if designed.value.is_empty() => {
                    return self
                        .ctx
                        .fail_module(
                            flow_id,
                            &module_id,
                            FailureStage::TestDesign,
                            "test designer returned no test cases".into(),
                        )
                        .await;
                }
                Ok(designed) => designed,
                Err(err) => {
                    return self
                        .ctx
                        .fail_module(flow_id, &module_id, FailureStage::TestDesign, err.to_string())
                        .await;
                }
            };
            let usage = designed.usage;
            self.ctx
                .ledger
                .update(flow_id, move |wf| {
                    wf.ensure_active()?;
                    wf.record_usage(usage)
                })
                .await?;
            store.put_test_cases_once(flow_id, &module_id, designed.value).await?
        };

        tracing::debug!(flow_id = %flow_id, module_id = %module_id, tests = test_cases.len(), "tests designed");
        self.ctx
            .publish(Event::TestsDesignedReady {
                flow_id,
                module_id,
                test_cases,
                code_module: code,
            })
            .await
    }

    async fn execute(
        &self,
        flow_id: FlowId,
        module_id: ModuleId,
        code: CodeModule,
        tests: Vec<TestCase>,
    ) -> Result<(), EngineError> {
        if self.ctx.active(flow_id).await?.is_none() {
            return Ok(());
        }

        let iteration = code.iteration;
        let mut note = None;
        let report = match self.ctx.collaborators.executor.execute(&code, &tests).await {
            Ok(results) => TestReport::from_results(iteration, results),
            Err(err) if err.is_unrecoverable() => {
                return self
                    .ctx
                    .fail_module(flow_id, &module_id, FailureStage::Testing, err.to_string())
                    .await;
            }
            Err(err) => {
                note = Some(format!("test execution for {module_id} at iteration {iteration}: {err}"));
                TestReport::execution_failure(iteration, err.message)
            }
        };

        let id = module_id.clone();
        let recorded = report.clone();
        let (code, _) = self
            .ctx
            .ledger
            .update(flow_id, move |wf| {
                wf.ensure_active()?;
                let module = wf.module_mut(&id)?;
                module.expect_iteration(iteration)?;
                if module.status != ModuleStatus::Generated
                    || module.reports.iter().any(|r| r.iteration == iteration)
                {
                    return Err(WorkflowError::Duplicate(format!("{id} already tested at iteration {iteration}")));
                }
                module.record_report(recorded.clone());
                if recorded.is_passing() {
                    module.status = ModuleStatus::Passed;
                }
                let code = module.snapshot();
                if let Some(note) = &note {
                    wf.record_error(note.clone());
                }
                Ok(code)
            })
            .await?;

        tracing::info!(
            flow_id = %flow_id,
            module_id = %module_id,
            iteration,
            passed = report.passed_tests,
            failed = report.failed_tests,
            "tests executed"
        );

        let event = if report.is_passing() {
            Event::TestsPassed {
                flow_id,
                module_id,
                test_report: report,
                code_module: code,
            }
        } else {
            Event::TestsFailed {
                flow_id,
                module_id,
                code_module: code,
                test_report: report,
                iteration,
            }
        };
        self.ctx.publish(event).await
    }

    async fn refine(
        &self,
        flow_id: FlowId,
        module_id: ModuleId,
        report: TestReport,
        iteration: u32,
    ) -> Result<(), EngineError> {
        let id = module_id.clone();
        let failed_tests = report.failed_tests;
        let (verdict, _) = self
            .ctx
            .ledger
            .update(flow_id, move |wf| {
                wf.ensure_active()?;
                let max_iterations = wf.max_iterations;
                let module = wf.module_mut(&id)?;
                module.expect_iteration(iteration)?;
                if module.status != ModuleStatus::Generated {
                    return Err(WorkflowError::Duplicate(format!("{id} already refining at iteration {iteration}")));
                }
                if iteration >= max_iterations {
                    module.status = ModuleStatus::Failed;
                    return Ok(Verdict::Exhausted { failed_tests });
                }
                module.status = ModuleStatus::Refined;
                Ok(Verdict::Refine(module.snapshot()))
            })
            .await?;

        let code = match verdict {
            Verdict::Refine(code) => code,
            Verdict::Exhausted { failed_tests } => {
                let error = format!(
                    "module {module_id} still fails {failed_tests} test(s) after {iteration} refinement iteration(s)"
                );
                return self
                    .ctx
                    .report_failure(flow_id, FailureStage::Refinement, Some(module_id), error)
                    .await;
            }
        };

        let tests = self
            .ctx
            .ledger
            .store()
            .get_test_cases(flow_id, &module_id)
            .await?
            .unwrap_or_default();
        let failures = report.failures();

        let (blocks, usage, note) = match self.ctx.collaborators.refiner.refine(&code, &failures, &tests).await {
            Ok(refined) => (refined.value, refined.usage, None),
            Err(err) if err.is_unrecoverable() => {
                return self
                    .ctx
                    .fail_module(flow_id, &module_id, FailureStage::Refinement, err.to_string())
                    .await;
            }
            Err(err) => (
                Vec::new(),
                Usage::ZERO,
                Some(format!("refiner failed for {module_id} at iteration {iteration}: {err}")),
            ),
        };

        let next = iteration + 1;
        let outcome = merge_refinement(&code.files, blocks, next);
        let note = note.or_else(|| {
            if outcome.fallback {
                Some(format!(
                    "refiner named no files for {module_id}; carried {} file(s) to iteration {next}",
                    outcome.files.len()
                ))
            } else if !outcome.changed() {
                Some(format!("refinement of {module_id} at iteration {next} changed nothing"))
            } else {
                None
            }
        });
        if let Some(note) = &note {
            tracing::warn!(flow_id = %flow_id, module_id = %module_id, iteration = next, "{}", note);
        }

        let id = module_id.clone();
        let (code, _) = self
            .ctx
            .ledger
            .update(flow_id, move |wf| {
                wf.ensure_active()?;
                let module = wf.module_mut(&id)?;
                module.expect_iteration(iteration)?;
                if module.status != ModuleStatus::Refined {
                    return Err(WorkflowError::Duplicate(format!("{id} refinement already stored")));
                }
                module.apply_merge(&outcome);
                let code = module.snapshot();
                wf.sync_iteration();
                wf.record_usage(usage)?;
                if let Some(note) = &note {
                    wf.record_error(note.clone());
                }
                Ok(code)
            })
            .await?;

        tracing::info!(flow_id = %flow_id, module_id = %module_id, iteration = next, "module refined");
        self.ctx
            .publish(Event::CodeRefinedReady {
                flow_id,
                module_id,
                code_module: code,
                test_cases: tests,
            })
            .await
    }
}

#[async_trait]
impl Handler for ModuleLoop {
    fn name(&self) -> &'static str {
        "module_loop"
    }

    fn topics(&self) -> &'static [Topic] {
        TOPICS
    }

    async fn handle(&self, envelope: Envelope) -> Result<(), EngineError> {
        match envelope.event {
            Event::ModuleCodingRequested {
                flow_id,
                module_id,
                component,
                design_document,
            } => self.generate(flow_id, module_id, component, design_document).await,
            Event::ModuleCodingCompleted {
                flow_id,
                module_id,
                code_module,
            } => self.design_tests(flow_id, module_id, code_module).await,
            Event::TestsDesignedReady {
                flow_id,
                module_id,
                test_cases,
                code_module,
            }
            | Event::CodeRefinedReady {
                flow_id,
                module_id,
                code_module,
                test_cases,
            } => self.execute(flow_id, module_id, code_module, test_cases).await,
            Event::TestsFailed {
                flow_id,
                module_id,
                test_report,
                iteration,
                ..
            } => self.refine(flow_id, module_id, test_report, iteration).await,
            other => {
                tracing::trace!(topic = %other.topic(), "not handled by module loop");
                Ok(())
            }
        }
    }
}
