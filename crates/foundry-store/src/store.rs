//! Keyed workflow storage
//!
//! [`WorkflowStore`] is the seam to whatever persistence backs the engine.
//! Records carry a `version`; writers commit with
//! [`compare_and_set`](WorkflowStore::compare_and_set) so a concurrent writer
//! outside this process cannot be silently overwritten.

use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use foundry_core::{FlowId, ModuleId, TestCase, Workflow};

/// Workflow record storage
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Fetch a record
    async fn get(&self, flow_id: FlowId) -> Result<Option<Workflow>, StoreError>;

    /// Store a new record at version 1
    async fn insert(&self, workflow: Workflow) -> Result<Workflow, StoreError>;

    /// Replace a record if its stored version is still `expected_version`;
    /// the stored copy gets `expected_version + 1` and is returned
    async fn compare_and_set(
        &self,
        expected_version: u64,
        workflow: Workflow,
    ) -> Result<Workflow, StoreError>;

    /// Point-in-time copy of every record
    async fn scan(&self) -> Result<Vec<Workflow>, StoreError>;

    /// Store test cases for a module unless some are already stored;
    /// returns whichever set is stored afterwards
    async fn put_test_cases_once(
        &self,
        flow_id: FlowId,
        module_id: &ModuleId,
        cases: Vec<TestCase>,
    ) -> Result<Vec<TestCase>, StoreError>;

    /// Stored test cases for a module
    async fn get_test_cases(
        &self,
        flow_id: FlowId,
        module_id: &ModuleId,
    ) -> Result<Option<Vec<TestCase>>, StoreError>;

    /// Snapshot of non-terminal records
    async fn scan_active(&self) -> Result<Vec<Workflow>, StoreError> {
        let mut all = self.scan().await?;
        all.retain(|wf| !wf.is_terminal());
        Ok(all)
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    workflows: DashMap<FlowId, Workflow>,
    test_cases: DashMap<(FlowId, ModuleId), Vec<TestCase>>,
}

impl MemoryStore {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// No records
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn get(&self, flow_id: FlowId) -> Result<Option<Workflow>, StoreError> {
        Ok(self.workflows.get(&flow_id).map(|r| r.value().clone()))
    }

    async fn insert(&self, mut workflow: Workflow) -> Result<Workflow, StoreError> {
        match self.workflows.entry(workflow.flow_id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(workflow.flow_id)),
            Entry::Vacant(slot) => {
                workflow.version = 1;
                slot.insert(workflow.clone());
                Ok(workflow)
            }
        }
    }

    async fn compare_and_set(
        &self,
        expected_version: u64,
        mut workflow: Workflow,
    ) -> Result<Workflow, StoreError> {
        let flow_id = workflow.flow_id;
        let mut stored = self
            .workflows
            .get_mut(&flow_id)
            .ok_or(StoreError::NotFound(flow_id))?;

        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                flow_id,
                expected: expected_version,
                actual: stored.version,
            });
        }

        workflow.version = expected_version + 1;
        *stored = workflow.clone();
        Ok(workflow)
    }

    async fn scan(&self) -> Result<Vec<Workflow>, StoreError> {
        Ok(self.workflows.iter().map(|r| r.value().clone()).collect())
    }

    async fn put_test_cases_once(
        &self,
        flow_id: FlowId,
        module_id: &ModuleId,
        cases: Vec<TestCase>,
    ) -> Result<Vec<TestCase>, StoreError> {
        let stored = self
            .test_cases
            .entry((flow_id, module_id.clone()))
            .or_insert(cases);
        Ok(stored.value().clone())
    }

    async fn get_test_cases(
        &self,
        flow_id: FlowId,
        module_id: &ModuleId,
    ) -> Result<Option<Vec<TestCase>>, StoreError> {
        Ok(self
            .test_cases
            .get(&(flow_id, module_id.clone()))
            .map(|r| r.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foundry_core::Phase;

    fn workflow() -> Workflow {
        Workflow::new(FlowId::new(), "todo api", 3)
    }

    #[tokio::test]
    async fn insert_then_get() {
        let store = MemoryStore::new();
        let wf = store.insert(workflow()).await.unwrap();
        assert_eq!(wf.version, 1);
        assert_eq!(store.get(wf.flow_id).await.unwrap(), Some(wf.clone()));
        assert!(matches!(store.insert(wf).await, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn compare_and_set_checks_version() {
        let store = MemoryStore::new();
        let wf = store.insert(workflow()).await.unwrap();

        let mut next = wf.clone();
        next.record_error("first");
        let stored = store.compare_and_set(1, next.clone()).await.unwrap();
        assert_eq!(stored.version, 2);

        let err = store.compare_and_set(1, next).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            err,
            StoreError::VersionConflict {
                flow_id: wf.flow_id,
                expected: 1,
                actual: 2
            }
        );
    }

    #[tokio::test]
    async fn compare_and_set_on_missing_record() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.compare_and_set(1, workflow()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cases_are_written_once() {
        let store = MemoryStore::new();
        let flow_id = FlowId::new();
        let module = ModuleId::new("m1");
        let first = vec![TestCase::new("t1", module.clone(), "adds", "assert(add(1,1)==2)", "add.ts")];
        let second = vec![TestCase::new("t2", module.clone(), "other", "", "add.ts")];

        assert!(store.get_test_cases(flow_id, &module).await.unwrap().is_none());
        let stored = store.put_test_cases_once(flow_id, &module, first.clone()).await.unwrap();
        assert_eq!(stored, first);
        let again = store.put_test_cases_once(flow_id, &module, second).await.unwrap();
        assert_eq!(again, first);
    }

    #[tokio::test]
    async fn scan_active_skips_terminal_records() {
        let store = MemoryStore::new();
        store.insert(workflow()).await.unwrap();
        let mut done = workflow();
        done.cancel().unwrap();
        store.insert(done).await.unwrap();

        assert_eq!(store.scan().await.unwrap().len(), 2);
        let active = store.scan_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, Phase::Requested);
    }
}
