//! Event dispatch
//!
//! A dispatcher owns one subscription and hands every delivery to its
//! [`Handler`] on a fresh task, so distinct modules progress concurrently.
//! Handler errors are logged here; stale and duplicate deliveries are
//! expected under at-least-once delivery and only logged at debug level.

use crate::error::EngineError;
use async_trait::async_trait;
use foundry_core::{Envelope, EventBus, Topic};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Consumer of a fixed set of topics
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Topics to subscribe to
    fn topics(&self) -> &'static [Topic];

    /// Handle one delivery
    async fn handle(&self, envelope: Envelope) -> Result<(), EngineError>;
}

/// Subscribe `handler` and run it until `shutdown` flips to true
///
/// The subscription is opened before this returns, so nothing published
/// afterwards is missed. In-flight handler tasks are awaited on shutdown.
pub fn spawn_dispatcher(
    handler: Arc<dyn Handler>,
    bus: &dyn EventBus,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut subscription = bus.subscribe(handler.topics());
    tokio::spawn(async move {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = subscription.recv() => {
                    let Some(envelope) = next else { break };
                    let handler = Arc::clone(&handler);
                    tasks.spawn(async move { run(handler.as_ref(), envelope).await });
                }
            }
            while let Some(joined) = tasks.try_join_next() {
                log_join(handler.name(), joined);
            }
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(handler.name(), joined);
        }
        tracing::debug!(handler = handler.name(), "dispatcher stopped");
    })
}

async fn run(handler: &dyn Handler, envelope: Envelope) {
    let topic = envelope.topic();
    let flow_id = envelope.event.flow_id();
    match handler.handle(envelope).await {
        Ok(()) => {}
        Err(err) if err.is_stale() => {
            tracing::debug!(handler = handler.name(), topic = %topic, flow_id = %flow_id, "ignored: {}", err);
        }
        Err(err) => {
            tracing::error!(
                handler = handler.name(),
                topic = %topic,
                flow_id = %flow_id,
                retryable = err.is_retryable(),
                "handler failed: {}",
                err
            );
        }
    }
}

fn log_join(name: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        tracing::error!(handler = name, "handler task aborted: {}", err);
    }
}
