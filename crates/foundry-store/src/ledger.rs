//! Single writer per workflow
//!
//! Module loops for the same workflow run concurrently and all mutate one
//! record. [`WorkflowLedger`] routes every mutation for a flow to a dedicated
//! writer task over a bounded mailbox, so in-process writers never race.
//! The writer still commits with compare-and-set and re-applies the mutation
//! on conflict, which covers writers outside the process.
//!
//! A writer that sees no work for the idle timeout closes its mailbox, runs
//! whatever was already queued and unregisters itself. The next mutation
//! for that flow spawns a fresh writer.
//!
//! Mutations are closures over `&mut Workflow`. They may run more than once
//! (one run per commit attempt) and must not have side effects beyond the
//! record.

use crate::error::{LedgerError, StoreError};
use crate::store::WorkflowStore;
use async_trait::async_trait;
use dashmap::DashMap;
use foundry_core::{EngineConfig, FlowId, Workflow, WorkflowError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Idle time after which a writer task exits
pub const WRITER_IDLE: Duration = Duration::from_secs(5);

type Writers = DashMap<FlowId, mpsc::Sender<Box<dyn Job>>>;

#[async_trait]
trait Job: Send {
    async fn run(self: Box<Self>, flow_id: FlowId, store: &dyn WorkflowStore, attempts: u32);
}

struct Mutation<R, F> {
    mutate: F,
    reply: oneshot::Sender<Result<(R, Workflow), LedgerError>>,
}

#[async_trait]
impl<R, F> Job for Mutation<R, F>
where
    R: Send + 'static,
    F: FnMut(&mut Workflow) -> Result<R, WorkflowError> + Send + 'static,
{
    async fn run(self: Box<Self>, flow_id: FlowId, store: &dyn WorkflowStore, attempts: u32) {
        let Mutation { mut mutate, reply } = *self;
        let result = commit(flow_id, store, attempts, &mut mutate).await;
        // Caller may have given up waiting
        let _ = reply.send(result);
    }
}

async fn commit<R, F>(
    flow_id: FlowId,
    store: &dyn WorkflowStore,
    attempts: u32,
    mutate: &mut F,
) -> Result<(R, Workflow), LedgerError>
where
    F: FnMut(&mut Workflow) -> Result<R, WorkflowError> + Send,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        let current = store
            .get(flow_id)
            .await?
            .ok_or(StoreError::NotFound(flow_id))?;

        let mut next = current.clone();
        let value = mutate(&mut next)?;
        if next == current {
            return Ok((value, current));
        }

        match store.compare_and_set(current.version, next).await {
            Ok(stored) => return Ok((value, stored)),
            Err(err) if err.is_conflict() => {
                tracing::debug!(flow_id = %flow_id, attempt, "version conflict, re-applying mutation");
            }
            Err(err) => return Err(err.into()),
        }
    }

    tracing::warn!(flow_id = %flow_id, attempts, "mutation abandoned after repeated conflicts");
    Err(LedgerError::Contention { flow_id, attempts })
}

async fn writer_task(
    flow_id: FlowId,
    store: Arc<dyn WorkflowStore>,
    writers: Arc<Writers>,
    attempts: u32,
    idle: Duration,
    mut rx: mpsc::Receiver<Box<dyn Job>>,
) {
    tracing::debug!(flow_id = %flow_id, "writer started");
    loop {
        match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(job)) => job.run(flow_id, store.as_ref(), attempts).await,
            Ok(None) => break,
            Err(_) => {
                rx.close();
                while let Some(job) = rx.recv().await {
                    job.run(flow_id, store.as_ref(), attempts).await;
                }
                writers.remove_if(&flow_id, |_, sender| sender.is_closed());
                tracing::debug!(flow_id = %flow_id, "writer idle");
                break;
            }
        }
    }
    tracing::debug!(flow_id = %flow_id, "writer stopped");
}

/// Serializes mutations per workflow
pub struct WorkflowLedger {
    store: Arc<dyn WorkflowStore>,
    writers: Arc<Writers>,
    mailbox: usize,
    attempts: u32,
    idle: Duration,
}

impl WorkflowLedger {
    /// Create a ledger over `store`
    #[must_use]
    pub fn new(store: Arc<dyn WorkflowStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            writers: Arc::new(DashMap::new()),
            mailbox: config.writer_mailbox.max(1),
            attempts: config.cas_retries.max(1),
            idle: WRITER_IDLE,
        }
    }

    /// Override how long a writer waits for work before exiting
    #[must_use]
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    /// Underlying store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Store a new workflow
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`] for a duplicate id.
    pub async fn create(&self, workflow: Workflow) -> Result<Workflow, LedgerError> {
        Ok(self.store.insert(workflow).await?)
    }

    /// Read the current record
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for an unknown id.
    pub async fn read(&self, flow_id: FlowId) -> Result<Workflow, LedgerError> {
        self.store
            .get(flow_id)
            .await?
            .ok_or(LedgerError::Store(StoreError::NotFound(flow_id)))
    }

    /// Apply `mutate` through the flow's writer
    ///
    /// Returns the closure's value and the record as committed. A mutation
    /// that leaves the record unchanged is not written.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Rejected`] when the closure returns an error (nothing
    /// is written), store errors, or [`LedgerError::Contention`] once every
    /// attempt conflicted.
    pub async fn update<R, F>(&self, flow_id: FlowId, mutate: F) -> Result<(R, Workflow), LedgerError>
    where
        R: Send + 'static,
        F: FnMut(&mut Workflow) -> Result<R, WorkflowError> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let mut job: Box<dyn Job> = Box::new(Mutation { mutate, reply });

        // A writer may go idle between lookup and send; retry once on a fresh one
        for _ in 0..2 {
            match self.writer(flow_id).send(job).await {
                Ok(()) => return rx.await.map_err(|_| LedgerError::Closed(flow_id))?,
                Err(mpsc::error::SendError(returned)) => {
                    self.writers.remove_if(&flow_id, |_, s| s.is_closed());
                    job = returned;
                }
            }
        }
        Err(LedgerError::Closed(flow_id))
    }

    /// Drop the writer for a finished workflow; queued mutations still run
    pub fn retire(&self, flow_id: FlowId) {
        if self.writers.remove(&flow_id).is_some() {
            tracing::debug!(flow_id = %flow_id, "writer retired");
        }
    }

    /// Live writer count
    #[inline]
    #[must_use]
    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }

    fn writer(&self, flow_id: FlowId) -> mpsc::Sender<Box<dyn Job>> {
        self.writers
            .entry(flow_id)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.mailbox);
                tokio::spawn(writer_task(
                    flow_id,
                    Arc::clone(&self.store),
                    Arc::clone(&self.writers),
                    self.attempts,
                    self.idle,
                    rx,
                ));
                tx
            })
            .clone()
    }
}

impl std::fmt::Debug for WorkflowLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowLedger")
            .field("writers", &self.writers.len())
            .field("mailbox", &self.mailbox)
            .field("attempts", &self.attempts)
            .field("idle", &self.idle)
            .finish_non_exhaustive()
    }
}
