use std::future::Future;
use std::sync::Arc;
use std::time;

use health::HealthHandle;
use ingest_common::{
    event::{body_preview, RawEvent},
    masking::mask,
    queue::{QueueClient, QueueError, QueueMessage},
    retry::RetryPolicy,
    sink::Sink,
    validation::is_eligible,
};
use tracing::{error, info, warn};

use crate::error::{ProcessingError, Resolution};

/// How one iteration of the processing loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to receive.
    Empty,
    /// The event was persisted. The message was deleted unless the delete failed.
    Processed,
    /// The message was left in the queue without being persisted.
    Skipped,
    /// The message was forwarded to the dead-letter queue and deleted.
    DeadLettered,
    /// A transient failure; the message stays in the queue for redelivery.
    RetryLater,
    /// The queue could not be reached.
    QueueUnavailable,
}

impl CycleOutcome {
    /// Whether this outcome counts as a consecutive failure for backoff purposes.
    pub fn is_failure(&self) -> bool {
        matches!(self, CycleOutcome::RetryLater | CycleOutcome::QueueUnavailable)
    }
}

/// A worker that receives login events one at a time, masks them and persists
/// them, deleting each message only once its event is stored (or dead-lettered).
pub struct LoginWorker {
    /// An identifier for this worker, attached to log lines.
    name: String,
    /// The queue we receive login events from.
    queue: Arc<dyn QueueClient>,
    /// Where malformed and permanently failing messages are forwarded, if anywhere.
    dead_letter_queue: Option<Arc<dyn QueueClient>>,
    /// Where sanitized events are written.
    sink: Arc<dyn Sink>,
    /// Wait after an empty receive.
    poll_interval: time::Duration,
    /// Upper bound for each call to the queue or the sink.
    request_timeout: time::Duration,
    /// Backoff after consecutive transient failures.
    retry_policy: RetryPolicy,
    /// The liveness check handle, reported healthy whenever the queue answers.
    liveness: HealthHandle,
}

impl LoginWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: Arc<dyn QueueClient>,
        dead_letter_queue: Option<Arc<dyn QueueClient>>,
        sink: Arc<dyn Sink>,
        poll_interval: time::Duration,
        request_timeout: time::Duration,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            dead_letter_queue,
            sink,
            poll_interval,
            request_timeout,
            retry_policy,
            liveness,
        }
    }

    /// Run cycles until `shutdown` resolves. A message being processed when the
    /// signal arrives is finished first; only receiving and waiting are cut short.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut consecutive_failures: u32 = 0;

        info!(worker = %self.name, "starting login worker");

        loop {
            let received = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                received = self.receive() => received,
            };

            let outcome = match received {
                Ok(Some(message)) => self.process_message(message).await,
                Ok(None) => CycleOutcome::Empty,
                Err(outcome) => outcome,
            };

            let wait = if outcome.is_failure() {
                consecutive_failures = consecutive_failures.saturating_add(1);
                let interval = self.retry_policy.retry_interval(consecutive_failures);
                warn!(
                    worker = %self.name,
                    consecutive_failures,
                    "backing off for {:?}", interval
                );
                interval
            } else {
                consecutive_failures = 0;
                if outcome == CycleOutcome::Empty {
                    self.poll_interval
                } else {
                    time::Duration::ZERO
                }
            };

            if !wait.is_zero() {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        info!(worker = %self.name, "login worker stopped, no message in flight");
    }

    /// Receive and process at most one message.
    pub async fn run_cycle(&self) -> CycleOutcome {
        match self.receive().await {
            Ok(Some(message)) => self.process_message(message).await,
            Ok(None) => CycleOutcome::Empty,
            Err(outcome) => outcome,
        }
    }

    async fn receive(&self) -> Result<Option<QueueMessage>, CycleOutcome> {
        match self
            .with_timeout("receive", self.queue.receive_one())
            .await
        {
            Ok(Some(message)) => {
                self.liveness.report_healthy();
                metrics::counter!("login_messages_received").increment(1);
                Ok(Some(message))
            }
            Ok(None) => {
                self.liveness.report_healthy();
                info!("No messages in the queue, waiting for new messages");
                Ok(None)
            }
            Err(error) => {
                metrics::counter!("login_queue_errors", &[("operation", "receive")]).increment(1);
                error!(worker = %self.name, "failed to receive from the queue: {}", error);
                Err(CycleOutcome::QueueUnavailable)
            }
        }
    }

    /// Parse, validate, mask and persist one message, then acknowledge it.
    /// Every failure is resolved here; nothing escapes to the loop.
    pub async fn process_message(&self, message: QueueMessage) -> CycleOutcome {
        let start = tokio::time::Instant::now();

        let event = match RawEvent::from_body(&message.body) {
            Ok(event) => event,
            Err(error) => return self.handle_failure(&message, error.into()).await,
        };

        if !is_eligible(&event) {
            warn!(
                receipt_handle = %message.receipt_handle,
                body = body_preview(&message.body),
                "Invalid message received, skipping"
            );
            metrics::counter!("login_messages_skipped", &[("reason", "invalid")]).increment(1);
            return CycleOutcome::Skipped;
        }

        let sanitized = mask(&event);
        // A timed out insert may still commit, redelivery then appends a second row.
        if let Err(error) = self
            .with_timeout("persist", self.sink.persist(&sanitized))
            .await
        {
            return self.handle_failure(&message, error).await;
        }

        if !self.acknowledge(&message).await {
            warn!(
                receipt_handle = %message.receipt_handle,
                "persisted message was not deleted, redelivery will persist it again"
            );
        }

        metrics::counter!("login_messages_processed").increment(1);
        metrics::histogram!("login_message_processing_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        info!(
            receipt_handle = %message.receipt_handle,
            "Processed and removed message"
        );

        CycleOutcome::Processed
    }

    /// Delete a message that was persisted or forwarded. Returns whether the
    /// message is gone; when it is not, it will be delivered again.
    async fn acknowledge(&self, message: &QueueMessage) -> bool {
        match self
            .with_timeout("delete", self.queue.delete_one(&message.receipt_handle))
            .await
        {
            Ok(()) => true,
            Err(ProcessingError::QueueError(QueueError::InvalidReceiptHandle(_))) => {
                warn!(
                    receipt_handle = %message.receipt_handle,
                    "message was already deleted or its receipt handle expired"
                );
                true
            }
            Err(error) => {
                metrics::counter!("login_queue_errors", &[("operation", "delete")]).increment(1);
                warn!(
                    receipt_handle = %message.receipt_handle,
                    "failed to delete message: {}",
                    error
                );
                false
            }
        }
    }

    async fn handle_failure(&self, message: &QueueMessage, error: ProcessingError) -> CycleOutcome {
        match error.resolution() {
            Resolution::RetryLater => {
                metrics::counter!("login_messages_retried").increment(1);
                error!(
                    receipt_handle = %message.receipt_handle,
                    body = body_preview(&message.body),
                    "failed to process message, leaving it in the queue: {}",
                    error
                );
                CycleOutcome::RetryLater
            }
            Resolution::DeadLetter => self.dead_letter(message, &error).await,
        }
    }

    async fn dead_letter(&self, message: &QueueMessage, error: &ProcessingError) -> CycleOutcome {
        let Some(dead_letter_queue) = &self.dead_letter_queue else {
            metrics::counter!("login_messages_skipped", &[("reason", "unprocessable")])
                .increment(1);
            warn!(
                receipt_handle = %message.receipt_handle,
                body = body_preview(&message.body),
                "unprocessable message left in the queue, no dead-letter queue configured: {}",
                error
            );
            return CycleOutcome::Skipped;
        };

        if let Err(send_error) = self
            .with_timeout("dead-letter", dead_letter_queue.send_one(&message.body))
            .await
        {
            metrics::counter!("login_queue_errors", &[("operation", "dead-letter")]).increment(1);
            error!(
                receipt_handle = %message.receipt_handle,
                "failed to forward message to the dead-letter queue, leaving it in the queue: {}",
                send_error
            );
            return CycleOutcome::RetryLater;
        }

        if !self.acknowledge(message).await {
            error!(
                receipt_handle = %message.receipt_handle,
                "dead-lettered message was not deleted, redelivery will forward it again"
            );
        }

        metrics::counter!("login_messages_dead_lettered").increment(1);
        warn!(
            receipt_handle = %message.receipt_handle,
            body = body_preview(&message.body),
            "moved unprocessable message to the dead-letter queue: {}",
            error
        );
        CycleOutcome::DeadLettered
    }

    async fn with_timeout<T, E, F>(
        &self,
        operation: &'static str,
        future: F,
    ) -> Result<T, ProcessingError>
    where
        F: Future<Output = Result<T, E>>,
        ProcessingError: From<E>,
    {
        match tokio::time::timeout(self.request_timeout, future).await {
            Ok(result) => result.map_err(ProcessingError::from),
            Err(_) => Err(ProcessingError::TimeoutError {
                operation,
                timeout: self.request_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use health::HealthRegistry;
    use ingest_common::event::SanitizedEvent;
    use ingest_common::masking::mask_value;
    use ingest_common::queue::MemoryQueue;
    use ingest_common::sink::{processing_date, MemorySink, SinkFailure, WriteError};

    const SCENARIO_A: &str =
        r#"{"user_id":"u1","device_id":"d1","ip":"1.2.3.4","app_version":"2.0"}"#;
    const SCENARIO_B: &str = r#"{"device_id":"d1","ip":"1.2.3.4"}"#;

    struct Harness {
        queue: Arc<MemoryQueue>,
        dead_letter_queue: Arc<MemoryQueue>,
        sink: Arc<MemorySink>,
        registry: HealthRegistry,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                queue: Arc::new(MemoryQueue::new()),
                dead_letter_queue: Arc::new(MemoryQueue::new()),
                sink: Arc::new(MemorySink::new()),
                registry: HealthRegistry::new("liveness"),
            }
        }

        fn worker(&self, with_dead_letter_queue: bool) -> LoginWorker {
            self.worker_with_sink(with_dead_letter_queue, self.sink.clone())
        }

        fn worker_with_sink(&self, with_dead_letter_queue: bool, sink: Arc<dyn Sink>) -> LoginWorker {
            self.build(self.queue.clone(), with_dead_letter_queue, sink)
        }

        fn build(
            &self,
            queue: Arc<dyn QueueClient>,
            with_dead_letter_queue: bool,
            sink: Arc<dyn Sink>,
        ) -> LoginWorker {
            let dead_letter_queue: Option<Arc<dyn QueueClient>> = if with_dead_letter_queue {
                Some(self.dead_letter_queue.clone())
            } else {
                None
            };
            LoginWorker::new(
                "test-worker",
                queue,
                dead_letter_queue,
                sink,
                time::Duration::from_millis(10),
                time::Duration::from_millis(200),
                RetryPolicy::build(2, time::Duration::from_millis(10))
                    .maximum_interval(time::Duration::from_millis(50))
                    .provide(),
                self.registry
                    .register("worker".to_string(), ::time::Duration::seconds(30)),
            )
        }
    }

    /// A sink that never answers within the worker's request timeout.
    struct StalledSink;

    #[async_trait]
    impl Sink for StalledSink {
        async fn persist(&self, _: &SanitizedEvent) -> Result<(), WriteError> {
            tokio::time::sleep(time::Duration::from_secs(30)).await;
            Ok(())
        }
    }

    /// A sink that takes a while to commit each row.
    struct SlowSink {
        delay: time::Duration,
        rows: Arc<MemorySink>,
    }

    #[async_trait]
    impl Sink for SlowSink {
        async fn persist(&self, event: &SanitizedEvent) -> Result<(), WriteError> {
            tokio::time::sleep(self.delay).await;
            self.rows.persist(event).await
        }
    }

    /// A queue whose deletes always fail, as a throttled or partitioned service would.
    struct UndeletableQueue(Arc<MemoryQueue>);

    #[async_trait]
    impl QueueClient for UndeletableQueue {
        async fn receive_one(&self) -> Result<Option<QueueMessage>, QueueError> {
            self.0.receive_one().await
        }

        async fn delete_one(&self, _: &str) -> Result<(), QueueError> {
            Err(QueueError::RequestError {
                command: "DeleteMessage".to_owned(),
                error: "throttled".to_owned(),
            })
        }

        async fn send_one(&self, body: &str) -> Result<(), QueueError> {
            self.0.send_one(body).await
        }
    }

    #[tokio::test]
    async fn test_valid_message_is_persisted_and_deleted() {
        let harness = Harness::new();
        let id = harness.queue.push(SCENARIO_A);
        let worker = harness.worker(false);

        assert_eq!(worker.run_cycle().await, CycleOutcome::Processed);

        let rows = harness.sink.rows();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.event.user_id.as_deref(), Some("u1"));
        assert_eq!(row.event.masked_device_id, Some(mask_value("d1")));
        assert_eq!(row.event.masked_ip, Some(mask_value("1.2.3.4")));
        assert_eq!(row.event.app_version.as_deref(), Some("2.0"));
        assert!(row.create_date <= processing_date());

        assert_eq!(harness.queue.deleted(), vec![id]);
        assert_eq!(harness.queue.in_flight_len(), 0);
        assert_eq!(harness.queue.visible_len(), 0);
    }

    #[tokio::test]
    async fn test_message_without_user_id_is_skipped_and_kept() {
        let harness = Harness::new();
        harness.queue.push(SCENARIO_B);
        let worker = harness.worker(true);

        assert_eq!(worker.run_cycle().await, CycleOutcome::Skipped);

        assert!(harness.sink.rows().is_empty());
        assert!(harness.queue.deleted().is_empty());
        assert_eq!(harness.queue.pending_bodies(), vec![SCENARIO_B.to_owned()]);
        // Invalid events are not malformed: they are not dead-lettered.
        assert_eq!(harness.dead_letter_queue.visible_len(), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_is_a_no_op() {
        let harness = Harness::new();
        let worker = harness.worker(false);

        assert_eq!(worker.run_cycle().await, CycleOutcome::Empty);
        assert_eq!(worker.run_cycle().await, CycleOutcome::Empty);
        assert!(harness.sink.rows().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_sink_leaves_message_for_redelivery() {
        let harness = Harness::new();
        let id = harness.queue.push(SCENARIO_A);
        let worker = harness.worker(true);

        harness.sink.fail_with(Some(SinkFailure::Unavailable));
        assert_eq!(worker.run_cycle().await, CycleOutcome::RetryLater);
        assert!(harness.sink.rows().is_empty());
        assert!(harness.queue.deleted().is_empty());
        assert_eq!(harness.queue.in_flight_len(), 1);
        assert_eq!(harness.dead_letter_queue.visible_len(), 0);

        // The visibility timeout expires and the database comes back.
        harness.queue.release_in_flight();
        harness.sink.fail_with(None);
        assert_eq!(worker.run_cycle().await, CycleOutcome::Processed);

        assert_eq!(harness.sink.rows().len(), 1);
        assert_eq!(harness.queue.deleted(), vec![id]);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dead_lettered() {
        let harness = Harness::new();
        harness.queue.push("{\"user_id\": \"u1\", oops");
        let worker = harness.worker(true);

        assert_eq!(worker.run_cycle().await, CycleOutcome::DeadLettered);

        assert!(harness.sink.rows().is_empty());
        assert_eq!(harness.queue.deleted().len(), 1);
        assert_eq!(
            harness.dead_letter_queue.pending_bodies(),
            vec!["{\"user_id\": \"u1\", oops".to_owned()]
        );
    }

    #[tokio::test]
    async fn test_malformed_message_without_dead_letter_queue_is_kept() {
        let harness = Harness::new();
        harness.queue.push("[1, 2, 3]");
        let worker = harness.worker(false);

        assert_eq!(worker.run_cycle().await, CycleOutcome::Skipped);
        assert!(harness.queue.deleted().is_empty());
        assert_eq!(harness.queue.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_write_is_dead_lettered() {
        let harness = Harness::new();
        harness.queue.push(SCENARIO_A);
        harness.sink.fail_with(Some(SinkFailure::Rejecting));
        let worker = harness.worker(true);

        assert_eq!(worker.run_cycle().await, CycleOutcome::DeadLettered);
        assert_eq!(harness.queue.deleted().len(), 1);
        assert_eq!(harness.dead_letter_queue.visible_len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_dead_letter_queue_keeps_message() {
        let harness = Harness::new();
        harness.queue.push("not json");
        harness.dead_letter_queue.set_unavailable(true);
        let worker = harness.worker(true);

        assert_eq!(worker.run_cycle().await, CycleOutcome::RetryLater);
        assert!(harness.queue.deleted().is_empty());
        assert_eq!(harness.queue.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn test_stale_receipt_handle_does_not_fail_the_cycle() {
        let harness = Harness::new();
        let worker = harness.worker(false);

        let message = QueueMessage {
            message_id: None,
            receipt_handle: "already-deleted".to_owned(),
            body: SCENARIO_A.to_owned(),
        };
        assert_eq!(
            worker.process_message(message).await,
            CycleOutcome::Processed
        );
        assert_eq!(harness.sink.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_queue_is_reported() {
        let harness = Harness::new();
        harness.queue.push(SCENARIO_A);
        harness.queue.set_unavailable(true);
        let worker = harness.worker(false);

        assert_eq!(worker.run_cycle().await, CycleOutcome::QueueUnavailable);
        assert_eq!(harness.queue.visible_len(), 1);
        assert!(harness.sink.rows().is_empty());
    }

    #[tokio::test]
    async fn test_slow_sink_times_out_and_keeps_message() {
        let harness = Harness::new();
        harness.queue.push(SCENARIO_A);
        let worker = harness.worker_with_sink(false, Arc::new(StalledSink));

        assert_eq!(worker.run_cycle().await, CycleOutcome::RetryLater);
        assert!(harness.queue.deleted().is_empty());
        assert_eq!(harness.queue.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn test_liveness_reported_when_queue_answers() {
        let harness = Harness::new();
        let worker = harness.worker(false);
        assert!(!harness.registry.get_status().healthy);

        worker.run_cycle().await;
        assert!(harness.registry.get_status().healthy);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops_on_shutdown() {
        let harness = Harness::new();
        harness.queue.push(SCENARIO_A);
        harness.queue.push(SCENARIO_B);
        harness.queue.push("not json");
        harness
            .queue
            .push(r#"{"user_id":"u2","device_id":"d2","ip":"10.0.0.1","app_version":3}"#);
        let worker = harness.worker(true);

        worker
            .run(tokio::time::sleep(time::Duration::from_millis(300)))
            .await;

        let rows = harness.sink.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].event.app_version.as_deref(), Some("3"));
        // Persisted and dead-lettered messages are gone, the invalid one stays.
        assert_eq!(harness.queue.deleted().len(), 3);
        assert_eq!(harness.queue.pending_bodies(), vec![SCENARIO_B.to_owned()]);
        assert_eq!(harness.dead_letter_queue.visible_len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_finishes_message_in_flight() {
        let harness = Harness::new();
        let first = harness.queue.push(SCENARIO_A);
        harness
            .queue
            .push(r#"{"user_id":"u2","device_id":"d2","ip":"10.0.0.1"}"#);
        let sink = Arc::new(SlowSink {
            delay: time::Duration::from_millis(100),
            rows: harness.sink.clone(),
        });
        let worker = harness.worker_with_sink(false, sink);

        // The signal arrives while the first row is still being written.
        worker
            .run(tokio::time::sleep(time::Duration::from_millis(20)))
            .await;

        let rows = harness.sink.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event.user_id.as_deref(), Some("u1"));
        assert_eq!(harness.queue.deleted(), vec![first]);
        assert_eq!(harness.queue.in_flight_len(), 0);
        // The second message was never received.
        assert_eq!(harness.queue.visible_len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delete_after_dead_letter_forwards_again() {
        let harness = Harness::new();
        harness.queue.push("not json");
        let queue = Arc::new(UndeletableQueue(harness.queue.clone()));
        let worker = harness.build(queue, true, harness.sink.clone());

        assert_eq!(worker.run_cycle().await, CycleOutcome::DeadLettered);
        assert_eq!(harness.queue.in_flight_len(), 1);

        // Redelivery after the visibility timeout forwards a second copy.
        harness.queue.release_in_flight();
        assert_eq!(worker.run_cycle().await, CycleOutcome::DeadLettered);
        assert_eq!(harness.dead_letter_queue.visible_len(), 2);
        assert!(harness.queue.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_after_persist_writes_again() {
        let harness = Harness::new();
        harness.queue.push(SCENARIO_A);
        let queue = Arc::new(UndeletableQueue(harness.queue.clone()));
        let worker = harness.build(queue, false, harness.sink.clone());

        assert_eq!(worker.run_cycle().await, CycleOutcome::Processed);
        harness.queue.release_in_flight();
        assert_eq!(worker.run_cycle().await, CycleOutcome::Processed);

        assert_eq!(harness.sink.rows().len(), 2);
        assert_eq!(harness.queue.in_flight_len(), 1);
    }

    #[test]
    fn test_failures_drive_backoff() {
        assert!(CycleOutcome::RetryLater.is_failure());
        assert!(CycleOutcome::QueueUnavailable.is_failure());
        assert!(!CycleOutcome::Empty.is_failure());
        assert!(!CycleOutcome::Skipped.is_failure());
        assert!(!CycleOutcome::DeadLettered.is_failure());
        assert!(!CycleOutcome::Processed.is_failure());
    }
}
