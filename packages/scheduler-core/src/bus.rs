//! Message bus port: the abstract pub/sub contract implemented concretely
//! by `scheduler-nats`, and in tests by [`crate::testing::InProcessBus`].
//!
//! Grounded on the teacher's `NatsPublisher` trait in `kernel/nats.rs`, with
//! `subscribe`/`unsubscribe` and explicit ack/nack-with-requeue added since
//! the teacher's trait only covers the publish side.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SchedulerError;

pub type BusResult<T> = Result<T, SchedulerError>;

/// Outcome of handling one delivered message.
pub enum HandlerOutcome {
    /// Acknowledge; the message will not be redelivered.
    Ack,
    /// Negative-acknowledge. `requeue = true` asks for immediate redelivery;
    /// `requeue = false` asks the bus to drop the message permanently.
    Nack { requeue: bool, error: anyhow::Error },
}

impl HandlerOutcome {
    pub fn ack() -> Self {
        Self::Ack
    }

    pub fn nack(error: anyhow::Error, requeue: bool) -> Self {
        Self::Nack { requeue, error }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Vec<u8>) -> HandlerOutcome;
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn connect(&self) -> BusResult<()>;
    async fn close(&self) -> BusResult<()>;

    /// Declare an exchange and its queue bindings. `bindings` maps queue
    /// name to the routing keys it should receive.
    async fn register(
        &self,
        exchange: &str,
        bindings: HashMap<String, Vec<String>>,
    ) -> BusResult<()>;

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> BusResult<()>;

    async fn subscribe(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> BusResult<()>;

    async fn unsubscribe(&self, queue: &str) -> BusResult<()>;
}

/// Exchange name a job's messages travel over.
pub fn job_exchange(job_name: &str) -> String {
    format!("scheduler.job.{job_name}")
}

pub fn action_queue(job_name: &str) -> String {
    format!("{job_name}.action")
}

pub fn status_queue(job_name: &str) -> String {
    format!("{job_name}.status")
}

pub fn heartbeat_queue(job_name: &str) -> String {
    format!("{job_name}.heartbeat")
}

pub const ROUTING_KEY_ACTION: &str = "action";
pub const ROUTING_KEY_STATUS: &str = "status";
pub const ROUTING_KEY_HEARTBEAT: &str = "heartbeat";

/// Binding map for a job's exchange: one queue per message kind, each bound
/// to its own routing key.
pub fn job_bindings(job_name: &str) -> HashMap<String, Vec<String>> {
    let mut bindings = HashMap::new();
    bindings.insert(action_queue(job_name), vec![ROUTING_KEY_ACTION.to_string()]);
    bindings.insert(status_queue(job_name), vec![ROUTING_KEY_STATUS.to_string()]);
    bindings.insert(
        heartbeat_queue(job_name),
        vec![ROUTING_KEY_HEARTBEAT.to_string()],
    );
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_names_are_namespaced_by_job() {
        assert_eq!(
            job_exchange("nightly-export"),
            "scheduler.job.nightly-export"
        );
        assert_eq!(action_queue("nightly-export"), "nightly-export.action");
        let bindings = job_bindings("nightly-export");
        assert_eq!(bindings.len(), 3);
        assert!(bindings.contains_key(&status_queue("nightly-export")));
    }
}
