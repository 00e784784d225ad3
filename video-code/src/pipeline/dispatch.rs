//! Queue boundary between job submission and job execution.
//!
//! The producer publishes serialized [`JobDescriptor`]s to a topic; a pool of
//! consumer workers pulls them and runs [`VideoCodeService::execute_job`].
//! Failures on the execution side never propagate back to the transport.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::pipeline::descriptor::JobDescriptor;
use crate::pipeline::service::VideoCodeService;

/// Topic carrying job descriptors.
pub const JOB_TOPIC: &str = "video-code-topic";

/// One message taken from a topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
}

/// Receiving side of a topic subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Next delivery, or `None` once the topic is closed.
    async fn recv(&self) -> Option<Delivery>;
}

/// Message transport with at-least-once delivery.
#[async_trait]
pub trait JobTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to `topic`. Subscribers of the same topic compete for
    /// deliveries; each message goes to one of them.
    fn subscribe(&self, topic: &str) -> Result<Arc<dyn Subscription>>;
}

struct TopicChannel {
    tx: mpsc::Sender<Bytes>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Bytes>>>,
}

/// In-process transport backed by one bounded channel per topic.
pub struct ChannelTransport {
    capacity: usize,
    topics: DashMap<String, TopicChannel>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: DashMap::new(),
        }
    }

    fn sender(&self, topic: &str) -> mpsc::Sender<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| self.open_channel())
            .tx
            .clone()
    }

    fn receiver(&self, topic: &str) -> Arc<tokio::sync::Mutex<mpsc::Receiver<Bytes>>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| self.open_channel())
            .rx
            .clone()
    }

    fn open_channel(&self) -> TopicChannel {
        let (tx, rx) = mpsc::channel(self.capacity);
        TopicChannel {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    /// Messages waiting in `topic`.
    pub fn pending(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|t| t.tx.max_capacity() - t.tx.capacity())
            .unwrap_or(0)
    }
}

#[async_trait]
impl JobTransport for ChannelTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let tx = self.sender(topic);
        tx.send(payload)
            .await
            .map_err(|_| crate::Error::transport(format!("Topic '{}' is closed", topic)))
    }

    fn subscribe(&self, topic: &str) -> Result<Arc<dyn Subscription>> {
        Ok(Arc::new(ChannelSubscription {
            topic: topic.to_string(),
            rx: self.receiver(topic),
        }))
    }
}

struct ChannelSubscription {
    topic: String,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Bytes>>>,
}

#[async_trait]
impl Subscription for ChannelSubscription {
    async fn recv(&self) -> Option<Delivery> {
        let payload = self.rx.lock().await.recv().await?;
        Some(Delivery {
            topic: self.topic.clone(),
            payload,
        })
    }
}

/// Publishes job descriptors.
#[derive(Clone)]
pub struct JobProducer {
    transport: Arc<dyn JobTransport>,
    topic: String,
}

impl JobProducer {
    pub fn new(transport: Arc<dyn JobTransport>) -> Self {
        Self::with_topic(transport, JOB_TOPIC)
    }

    pub fn with_topic(transport: Arc<dyn JobTransport>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topic.into(),
        }
    }

    /// Publish `descriptor` without waiting for it to be consumed.
    pub async fn send_job(&self, descriptor: &JobDescriptor) -> Result<()> {
        let payload = Bytes::from(descriptor.to_json()?);
        self.transport.publish(&self.topic, payload).await?;
        debug!(job_id = %descriptor.job_id, topic = %self.topic, "Job published");
        Ok(())
    }
}

/// Configuration for a [`JobConsumer`].
#[derive(Debug, Clone)]
pub struct JobConsumerConfig {
    pub workers: usize,
    pub topic: String,
}

impl Default for JobConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            topic: JOB_TOPIC.to_string(),
        }
    }
}

/// Pool of workers executing delivered jobs.
pub struct JobConsumer {
    config: JobConsumerConfig,
    service: Arc<VideoCodeService>,
    transport: Arc<dyn JobTransport>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl JobConsumer {
    pub fn new(
        config: JobConsumerConfig,
        service: Arc<VideoCodeService>,
        transport: Arc<dyn JobTransport>,
    ) -> Self {
        Self {
            config,
            service,
            transport,
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Subscribe and spawn the workers.
    pub fn start(&self) -> Result<()> {
        let subscription = self.transport.subscribe(&self.config.topic)?;
        let workers = self.config.workers.max(1);

        info!(
            topic = %self.config.topic,
            "Starting job consumer with {} workers", workers
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return Err(crate::Error::Other("Job consumer already stopped".to_string()));
        };

        for i in 0..workers {
            let subscription = subscription.clone();
            let service = self.service.clone();
            let cancellation_token = self.cancellation_token.clone();

            join_set.spawn(async move {
                debug!("Consumer worker {} started", i);
                loop {
                    let delivery = tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        delivery = subscription.recv() => delivery,
                    };
                    let Some(delivery) = delivery else {
                        debug!("Consumer worker {}: topic closed", i);
                        break;
                    };
                    handle_delivery(&service, delivery).await;
                }
                debug!("Consumer worker {} shutting down", i);
            });
        }

        Ok(())
    }

    /// Stop accepting deliveries and wait for in-flight jobs to finish.
    pub async fn stop(&self) {
        info!("Stopping job consumer");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Job consumer stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Decode and execute one delivery. Never fails.
async fn handle_delivery(service: &VideoCodeService, delivery: Delivery) {
    let descriptor = match JobDescriptor::from_json(&delivery.payload) {
        Ok(d) => d,
        Err(e) => {
            match JobDescriptor::peek_job_id(&delivery.payload) {
                Some(job_id) => {
                    warn!(topic = %delivery.topic, job_id = %job_id, error = %e, "Undecodable job message");
                    service
                        .reject(&job_id, &format!("Invalid job message: {}", e))
                        .await;
                }
                None => {
                    warn!(topic = %delivery.topic, error = %e, "Dropping undecodable job message");
                }
            }
            return;
        }
    };

    let result = std::panic::AssertUnwindSafe(service.execute_job(&descriptor))
        .catch_unwind()
        .await;

    if let Err(panic) = result {
        let message = format!("Job execution panicked: {}", panic_message(panic.as_ref()));
        error!(job_id = %descriptor.job_id, "{}", message);
        service.abandon(&descriptor.job_id, &message).await;
    }
}
