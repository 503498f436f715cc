//! Workflow orchestrator
//!
//! Owns workflow-level state: phase, design, assembly latch and terminal
//! outcome. Every phase change is driven by a completion event; the
//! orchestrator never polls module state.
//!
//! Design and assembly are collaborator steps run from here:
//!
//! - `app_generation.requested` → designing → design generator →
//!   `design.completed`
//! - `all_modules.tested` → assembler → `app_generation.completed`

use crate::context::Context;
use crate::dispatch::Handler;
use crate::error::EngineError;
use async_trait::async_trait;
use foundry_core::{
    AssembledArtifact, CodeModule, DesignDocument, Envelope, Event, FailureInfo, FailureStage,
    FlowId, ModuleId, Phase, PhasePlan, Topic, Workflow, WorkflowError, WorkflowSummary,
};
use std::sync::Arc;

const TOPICS: &[Topic] = &[
    Topic::AppGenerationRequested,
    Topic::DesignCompleted,
    Topic::ModuleCodingCompleted,
    Topic::TestsDesignedReady,
    Topic::TestsPassed,
    Topic::TestsFailed,
    Topic::CodeRefinedReady,
    Topic::AllModulesTested,
    Topic::AppGenerationFailed,
    Topic::AppGenerationCompleted,
];

pub(crate) struct Orchestrator {
    ctx: Arc<Context>,
}

impl Orchestrator {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub(crate) async fn submit(&self, request: &str) -> Result<FlowId, EngineError> {
        let workflow = Workflow::new(FlowId::new(), request, self.ctx.config.max_iterations);
        let flow_id = workflow.flow_id;
        self.ctx.ledger.create(workflow).await?;
        tracing::info!(flow_id = %flow_id, "workflow submitted");
        self.ctx
            .publish(Event::AppGenerationRequested {
                flow_id,
                request: request.to_string(),
            })
            .await?;
        Ok(flow_id)
    }

    pub(crate) async fn cancel(&self, flow_id: FlowId) -> Result<bool, EngineError> {
        let (cancelled, _) = self.ctx.ledger.update(flow_id, Workflow::cancel).await?;
        if cancelled {
            tracing::info!(flow_id = %flow_id, "workflow cancelled");
            self.ctx.ledger.retire(flow_id);
        }
        Ok(cancelled)
    }

    pub(crate) async fn status(&self, flow_id: FlowId) -> Result<WorkflowSummary, EngineError> {
        Ok(self.ctx.ledger.read(flow_id).await?.summary())
    }

    async fn start_design(&self, flow_id: FlowId) -> Result<(), EngineError> {
        let (request, _) = self
            .ctx
            .ledger
            .update(flow_id, |wf| {
                if wf.status != Phase::Requested {
                    return Err(WorkflowError::Duplicate(format!("design already started ({})", wf.status)));
                }
                wf.enter_phase(Phase::Designing)?;
                Ok(wf.request.clone())
            })
            .await?;

        let design = match self.ctx.collaborators.designer.design(&request).await {
            Ok(design) => design,
            Err(err) => {
                return self
                    .ctx
                    .report_failure(flow_id, FailureStage::Design, None, err.to_string())
                    .await;
            }
        };

        let usage = design.usage;
        self.ctx
            .ledger
            .update(flow_id, move |wf| {
                wf.ensure_active()?;
                wf.record_usage(usage)
            })
            .await?;
        self.ctx
            .publish(Event::DesignCompleted {
                flow_id,
                design_document: design.value,
            })
            .await
    }

    async fn on_design_completed(&self, flow_id: FlowId, design: DesignDocument) -> Result<(), EngineError> {
        let stored = design.clone();
        let (components, _) = self
            .ctx
            .ledger
            .update(flow_id, move |wf| {
                wf.ensure_active()?;
                if wf.design_document.is_some() {
                    return Err(WorkflowError::Duplicate("design already stored".into()));
                }
                wf.set_design(stored.clone());
                wf.enter_phase(Phase::DesignCompleted)?;
                Ok(stored.components.clone())
            })
            .await?;

        if components.is_empty() {
            return self
                .ctx
                .report_failure(flow_id, FailureStage::Design, None, "design has no components".into())
                .await;
        }

        tracing::info!(flow_id = %flow_id, modules = components.len(), "design completed");
        for component in components {
            self.ctx
                .publish(Event::ModuleCodingRequested {
                    flow_id,
                    module_id: ModuleId::new(component.id.clone()),
                    component,
                    design_document: design.clone(),
                })
                .await?;
        }
        Ok(())
    }

    async fn track_phase(&self, flow_id: FlowId, target: Phase) -> Result<(), EngineError> {
        let (plan, wf) = self
            .ctx
            .ledger
            .update(flow_id, move |wf| wf.enter_phase(target))
            .await?;
        match plan {
            PhasePlan::Steps(_) => {
                tracing::debug!(flow_id = %flow_id, phase = %wf.status, progress = wf.progress(), "phase advanced");
            }
            PhasePlan::Stale => {
                tracing::debug!(flow_id = %flow_id, current = %wf.status, target = %target, "stale phase event");
            }
            PhasePlan::Stay => {}
        }
        Ok(())
    }

    async fn on_tests_passed(&self, flow_id: FlowId) -> Result<(), EngineError> {
        let (ready, _) = self
            .ctx
            .ledger
            .update(flow_id, |wf| {
                wf.ensure_active()?;
                if wf.assembly_triggered || !wf.all_modules_passed() {
                    return Ok(None);
                }
                wf.assembly_triggered = true;
                wf.enter_phase(Phase::Assembling)?;
                let modules: Vec<CodeModule> = wf.modules.iter().map(foundry_core::Module::snapshot).collect();
                Ok(Some((wf.design_document.clone(), modules)))
            })
            .await?;

        let Some((design_document, modules)) = ready else {
            return Ok(());
        };
        tracing::info!(flow_id = %flow_id, modules = modules.len(), "all modules passed");
        self.ctx
            .publish(Event::AllModulesTested {
                flow_id,
                design_document,
                modules,
            })
            .await
    }

    async fn assemble(
        &self,
        flow_id: FlowId,
        design: Option<DesignDocument>,
        modules: Vec<CodeModule>,
    ) -> Result<(), EngineError> {
        if self.ctx.active(flow_id).await?.is_none() {
            return Ok(());
        }
        match self.ctx.collaborators.assembler.assemble(design.as_ref(), &modules).await {
            Ok(artifact) => {
                self.ctx
                    .publish(Event::AppGenerationCompleted { flow_id, artifact })
                    .await
            }
            Err(err) => {
                self.ctx
                    .report_failure(flow_id, FailureStage::Assembly, None, err.to_string())
                    .await
            }
        }
    }

    async fn on_failed(
        &self,
        flow_id: FlowId,
        stage: FailureStage,
        module_id: Option<ModuleId>,
        error: String,
    ) -> Result<(), EngineError> {
        let mut info = FailureInfo::new(stage, error);
        if let Some(module_id) = module_id {
            info = info.with_module(module_id);
        }
        let (_, wf) = self.ctx.ledger.update(flow_id, move |wf| wf.fail(info.clone())).await?;
        tracing::error!(
            flow_id = %flow_id,
            phase = %wf.current_phase,
            stage = %stage,
            "workflow failed: {}",
            wf.failure.as_ref().map_or("", |f| f.error.as_str())
        );
        self.ctx.ledger.retire(flow_id);
        Ok(())
    }

    async fn on_completed(&self, flow_id: FlowId, artifact: &AssembledArtifact) -> Result<(), EngineError> {
        self.ctx
            .ledger
            .update(flow_id, |wf| wf.enter_phase(Phase::Completed))
            .await?;
        tracing::info!(
            flow_id = %flow_id,
            files = artifact.file_count,
            hash = %artifact.content_hash.short(),
            "workflow completed"
        );
        self.ctx.ledger.retire(flow_id);
        Ok(())
    }
}

#[async_trait]
impl Handler for Orchestrator {
    fn name(&self) -> &'static str {
        "orchestrator"
    }

    fn topics(&self) -> &'static [Topic] {
        TOPICS
    }

    async fn handle(&self, envelope: Envelope) -> Result<(), EngineError> {
        match envelope.event {
            Event::AppGenerationRequested { flow_id, .. } => self.start_design(flow_id).await,
            Event::DesignCompleted {
                flow_id,
                design_document,
            } => self.on_design_completed(flow_id, design_document).await,
            Event::ModuleCodingCompleted { flow_id, .. } => self.track_phase(flow_id, Phase::Coding).await,
            Event::TestsDesignedReady { flow_id, .. } | Event::CodeRefinedReady { flow_id, .. } => {
                self.track_phase(flow_id, Phase::Testing).await
            }
            Event::TestsFailed { flow_id, .. } => self.track_phase(flow_id, Phase::Refining).await,
            Event::TestsPassed { flow_id, .. } => self.on_tests_passed(flow_id).await,
            Event::AllModulesTested {
                flow_id,
                design_document,
                modules,
            } => self.assemble(flow_id, design_document, modules).await,
            Event::AppGenerationFailed {
                flow_id,
                phase,
                module_id,
                error,
            } => self.on_failed(flow_id, phase, module_id, error).await,
            Event::AppGenerationCompleted { flow_id, artifact } => self.on_completed(flow_id, &artifact).await,
            other => {
                tracing::trace!(topic = %other.topic(), "not handled by orchestrator");
                Ok(())
            }
        }
    }
}
