//! NATS JetStream implementation of the `MessageBus` port.
//!
//! Grounded on the teacher's `NatsClientPublisher` in `kernel/nats.rs` for
//! the "thin wrapper over `async_nats::Client`" shape. The teacher only
//! publishes; JetStream's pull consumers are added here because the port
//! needs explicit ack/nack-with-redelivery, which a plain core NATS
//! subscription doesn't give.

use std::collections::HashMap;
use std::sync::Arc;

use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::context::Context as JetStreamContext;
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use scheduler_core::bus::{BusResult, HandlerOutcome, MessageBus, MessageHandler};
use scheduler_core::SchedulerError;

struct Subscription {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct NatsMessageBus {
    url: String,
    client: RwLock<Option<async_nats::Client>>,
    jetstream: RwLock<Option<JetStreamContext>>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl NatsMessageBus {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: RwLock::new(None),
            jetstream: RwLock::new(None),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    async fn jetstream(&self) -> BusResult<JetStreamContext> {
        self.jetstream
            .read()
            .await
            .clone()
            .ok_or_else(|| SchedulerError::Transient(anyhow::anyhow!("not connected to NATS")))
    }

    fn stream_name(exchange: &str) -> String {
        exchange.replace('.', "_")
    }

    fn subject(exchange: &str, routing_key: &str) -> String {
        format!("{exchange}.{routing_key}")
    }
}

#[async_trait]
impl MessageBus for NatsMessageBus {
    async fn connect(&self) -> BusResult<()> {
        let client = async_nats::connect(&self.url)
            .await
            .map_err(|err| SchedulerError::Transient(err.into()))?;
        let jetstream = async_nats::jetstream::new(client.clone());
        *self.client.write().await = Some(client);
        *self.jetstream.write().await = Some(jetstream);
        debug!(url = %self.url, "connected to NATS");
        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        let mut subscriptions = self.subscriptions.write().await;
        for (queue, subscription) in subscriptions.drain() {
            subscription.token.cancel();
            if let Err(err) = subscription.handle.await {
                warn!(%queue, error = %err, "subscriber task panicked during close");
            }
        }
        drop(subscriptions);

        if let Some(client) = self.client.write().await.take() {
            client
                .drain()
                .await
                .map_err(|err| SchedulerError::Transient(err.into()))?;
        }
        *self.jetstream.write().await = None;
        Ok(())
    }

    async fn register(
        &self,
        exchange: &str,
        bindings: HashMap<String, Vec<String>>,
    ) -> BusResult<()> {
        let jetstream = self.jetstream().await?;
        let stream_name = Self::stream_name(exchange);

        let stream = jetstream
            .get_or_create_stream(StreamConfig {
                name: stream_name,
                subjects: vec![format!("{exchange}.>")],
                ..Default::default()
            })
            .await
            .map_err(|err| SchedulerError::Transient(err.into()))?;

        for (queue, routing_keys) in bindings {
            let filter_subject = routing_keys
                .first()
                .map(|rk| Self::subject(exchange, rk))
                .unwrap_or_else(|| format!("{exchange}.>"));

            stream
                .get_or_create_consumer(
                    &queue,
                    PullConfig {
                        durable_name: Some(queue.clone()),
                        filter_subject,
                        ack_policy: AckPolicy::Explicit,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|err| SchedulerError::Transient(err.into()))?;
        }

        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> BusResult<()> {
        let jetstream = self.jetstream().await?;
        let subject = Self::subject(exchange, routing_key);
        jetstream
            .publish(subject, payload.into())
            .await
            .map_err(|err| SchedulerError::Transient(err.into()))?
            .await
            .map_err(|err| SchedulerError::Transient(err.into()))?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> BusResult<()> {
        let jetstream = self.jetstream().await?;
        // The stream name is recovered from the queue's durable consumer
        // record; `register` must run before `subscribe` for this queue.
        let consumer: async_nats::jetstream::consumer::Consumer<PullConfig> = jetstream
            .get_consumer_from_stream(queue, stream_name_for_queue(queue))
            .await
            .map_err(|err| SchedulerError::Transient(err.into()))?;

        let token = CancellationToken::new();
        let child = token.clone();
        let queue_owned = queue.to_string();
        let handle = tokio::spawn(async move {
            run_pull_loop(consumer, handler, child, queue_owned).await;
        });

        self.subscriptions
            .write()
            .await
            .insert(queue.to_string(), Subscription { token, handle });
        Ok(())
    }

    async fn unsubscribe(&self, queue: &str) -> BusResult<()> {
        if let Some(subscription) = self.subscriptions.write().await.remove(queue) {
            subscription.token.cancel();
            if let Err(err) = subscription.handle.await {
                warn!(%queue, error = %err, "subscriber task panicked during unsubscribe");
            }
        }
        Ok(())
    }
}

/// Placeholder recovered at `subscribe` time: queues are namespaced
/// `<job-name>.<kind>`, and streams are namespaced after the job's
/// exchange, so the stream is the queue's prefix up to its last segment.
fn stream_name_for_queue(queue: &str) -> String {
    queue
        .rsplit_once('.')
        .map(|(prefix, _)| format!("scheduler_job_{prefix}"))
        .unwrap_or_else(|| queue.to_string())
}

async fn run_pull_loop(
    consumer: async_nats::jetstream::consumer::Consumer<PullConfig>,
    handler: Arc<dyn MessageHandler>,
    shutdown: CancellationToken,
    queue: String,
) {
    loop {
        let mut messages = match consumer.messages().await {
            Ok(messages) => messages,
            Err(err) => {
                error!(%queue, error = %err, "failed opening pull subscription, retrying");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                next = messages.next() => {
                    let Some(delivery) = next else { break };
                    let message = match delivery {
                        Ok(message) => message,
                        Err(err) => {
                            error!(%queue, error = %err, "error pulling message");
                            continue;
                        }
                    };

                    let outcome = handler.handle(message.payload.to_vec()).await;
                    let ack_result = match outcome {
                        HandlerOutcome::Ack => message.ack().await,
                        HandlerOutcome::Nack { requeue: true, error } => {
                            warn!(%queue, %error, "nack with requeue");
                            message.ack_with(AckKind::Nak(None)).await
                        }
                        HandlerOutcome::Nack { requeue: false, error } => {
                            warn!(%queue, %error, "nack without requeue");
                            message.ack_with(AckKind::Term).await
                        }
                    };
                    if let Err(err) = ack_result {
                        error!(%queue, error = %err, "failed to ack/nack message");
                    }
                }
            }
        }
    }
}
