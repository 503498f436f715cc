//! State shared by the orchestrator and the module loop

use crate::collaborators::Collaborators;
use crate::error::EngineError;
use foundry_core::{
    EngineConfig, Event, EventBus, FailureStage, FlowId, ModuleId, ModuleStatus, Workflow,
};
use foundry_store::WorkflowLedger;
use std::sync::Arc;

pub(crate) struct Context {
    pub(crate) ledger: WorkflowLedger,
    pub(crate) bus: Arc<dyn EventBus>,
    pub(crate) collaborators: Collaborators,
    pub(crate) config: EngineConfig,
}

impl Context {
    pub(crate) async fn publish(&self, event: Event) -> Result<(), EngineError> {
        tracing::debug!(topic = %event.topic(), flow_id = %event.flow_id(), "publishing");
        self.bus.publish(event).await?;
        Ok(())
    }

    /// Current record, or `None` once it is terminal
    pub(crate) async fn active(&self, flow_id: FlowId) -> Result<Option<Workflow>, EngineError> {
        let workflow = self.ledger.read(flow_id).await?;
        if workflow.is_terminal() {
            tracing::debug!(flow_id = %flow_id, status = %workflow.status, "workflow finished, skipping step");
            return Ok(None);
        }
        Ok(Some(workflow))
    }

    pub(crate) async fn report_failure(
        &self,
        flow_id: FlowId,
        phase: FailureStage,
        module_id: Option<ModuleId>,
        error: String,
    ) -> Result<(), EngineError> {
        tracing::warn!(flow_id = %flow_id, phase = %phase, module_id = ?module_id, "{}", error);
        self.publish(Event::AppGenerationFailed {
            flow_id,
            phase,
            module_id,
            error,
        })
        .await
    }

    /// Mark the module failed, then report the workflow failure
    pub(crate) async fn fail_module(
        &self,
        flow_id: FlowId,
        module_id: &ModuleId,
        phase: FailureStage,
        error: String,
    ) -> Result<(), EngineError> {
        let id = module_id.clone();
        let marked = self
            .ledger
            .update(flow_id, move |wf| {
                wf.ensure_active()?;
                wf.module_mut(&id)?.status = ModuleStatus::Failed;
                Ok(())
            })
            .await;
        match marked {
            Ok(_) => {}
            Err(err) if err.is_stale() => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        self.report_failure(flow_id, phase, Some(module_id.clone()), error).await
    }
}
