//! Message-driven job dispatch.
//!
//! Holds one AMQP connection with two topic-exchange channels: a consumer on
//! the durable task queue (prefetch 1, explicit acks) and a publisher
//! towards the durable result queue. At most one job is in flight per
//! worker; programs within a job still fan out concurrently.

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{error, info, warn};

use crate::constants::{
    AMQP_CONN_NAME, AMQP_EXCHANGE_NAME, AMQP_RESULT_QUEUE_NAME, AMQP_TASK_QUEUE_NAME, AMQP_URL,
};
use crate::errors::RunnerError;
use crate::executor::Executor;
use crate::models::{Job, JobResult, TrackingFields};
use crate::runner::run_job;

/// The dispatcher half of the runner: consumes jobs, publishes results.
pub struct Worker {
    channel_in: Channel,
    channel_out: Channel,
}

impl Worker {
    /// Connect to the broker and set up the exchange/queue topology.
    pub async fn connect() -> Result<Self, RunnerError> {
        let url = AMQP_URL
            .as_deref()
            .ok_or_else(|| RunnerError::Config("AMQP_URL environment variable not defined".to_string()))?;

        let properties =
            ConnectionProperties::default().with_connection_name(AMQP_CONN_NAME.as_str().into());
        let connection = Connection::connect(url, properties).await?;
        let channel_in = connection.create_channel().await?;
        let channel_out = connection.create_channel().await?;

        for channel in [&channel_in, &channel_out] {
            channel
                .exchange_declare(
                    AMQP_EXCHANGE_NAME.as_str(),
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        for (channel, queue) in [
            (&channel_in, AMQP_TASK_QUEUE_NAME.as_str()),
            (&channel_out, AMQP_RESULT_QUEUE_NAME.as_str()),
        ] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            channel
                .queue_bind(
                    queue,
                    AMQP_EXCHANGE_NAME.as_str(),
                    queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        channel_in.basic_qos(1, BasicQosOptions::default()).await?;

        Ok(Self {
            channel_in,
            channel_out,
        })
    }

    /// Consume jobs until interrupted.
    pub async fn run(&self, executor: &dyn Executor) -> Result<(), RunnerError> {
        let mut consumer = self
            .channel_in
            .basic_consume(
                AMQP_TASK_QUEUE_NAME.as_str(),
                AMQP_CONN_NAME.as_str(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        info!(queue = AMQP_TASK_QUEUE_NAME.as_str(), "consuming tasks");

        loop {
            let delivery = tokio::select! {
                delivery = consumer.next() => match delivery {
                    Some(delivery) => delivery?,
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, stopping consumer");
                    break;
                }
            };
            self.handle_delivery(executor, delivery).await?;
        }
        Ok(())
    }

    async fn handle_delivery(
        &self,
        executor: &dyn Executor,
        delivery: Delivery,
    ) -> Result<(), RunnerError> {
        info!(bytes = delivery.data.len(), "received message");

        let job = match Job::from_json(&delivery.data) {
            Ok(job) => job,
            Err(err) => {
                warn!(%err, "dropping undecodable job");
                delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await?;
                return Ok(());
            }
        };

        let (compatible, reason) = executor.is_compatible(&job.context);
        if !compatible {
            warn!(%reason, "job is incompatible with this executor");
            self.publish(&failure(reason, &job.tracking)).await?;
            // Requeue once: another worker may satisfy the precondition. A
            // redelivered message is dropped instead of bouncing forever.
            delivery
                .nack(BasicNackOptions {
                    requeue: !delivery.redelivered,
                    ..Default::default()
                })
                .await?;
            return Ok(());
        }

        let result = match run_job(executor, &job).await {
            Ok(results) => JobResult {
                success: true,
                error: None,
                results,
                tracking: job.tracking.clone(),
            },
            Err(err) => {
                // The workspace is preserved for inspection; the job is not
                // worth retrying.
                error!(%err, "job execution failed");
                failure(err.to_string(), &job.tracking)
            }
        };

        self.publish(&result).await?;
        delivery.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn publish(&self, result: &JobResult) -> Result<(), RunnerError> {
        let body = serde_json::to_vec(result)?;
        self.channel_out
            .basic_publish(
                AMQP_EXCHANGE_NAME.as_str(),
                AMQP_RESULT_QUEUE_NAME.as_str(),
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default(),
            )
            .await?;
        info!(bytes = body.len(), success = result.success, "published result");
        Ok(())
    }
}

fn failure(error: String, tracking: &TrackingFields) -> JobResult {
    JobResult {
        success: false,
        error: Some(error),
        results: Vec::new(),
        tracking: tracking.clone(),
    }
}
