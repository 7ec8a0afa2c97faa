use async_trait::async_trait;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::MessageSystemAttributeName;
use aws_sdk_sqs::Client;
use tracing::debug;

use crate::queue::{QueueClient, QueueError, QueueMessage};

/// Connection settings for an SQS compatible queue.
#[derive(Debug, Clone)]
pub struct SqsQueueConfig {
    pub queue_url: String,
    /// Custom endpoint, e.g. LocalStack. `None` uses the regional AWS endpoint.
    pub endpoint_url: Option<String>,
    pub region: String,
    /// Long polling wait for `ReceiveMessage`, 0 to 20 seconds.
    pub wait_time_seconds: i32,
    /// How long a received message stays hidden from other receives.
    pub visibility_timeout_seconds: i32,
}

/// A `QueueClient` for one SQS queue URL.
#[derive(Clone)]
pub struct SqsQueue {
    client: Client,
    queue_url: String,
    wait_time_seconds: i32,
    visibility_timeout_seconds: i32,
}

impl SqsQueue {
    /// Build a client from the default AWS credential chain and the given settings.
    pub async fn new(config: &SqsQueueConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint_url) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        let shared_config = loader.load().await;

        Self::from_client(Client::new(&shared_config), config)
    }

    /// Reuse an existing client, e.g. to point a dead-letter queue at the same endpoint.
    pub fn from_client(client: Client, config: &SqsQueueConfig) -> Self {
        Self {
            client,
            queue_url: config.queue_url.clone(),
            wait_time_seconds: config.wait_time_seconds,
            visibility_timeout_seconds: config.visibility_timeout_seconds,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

fn request_error<E>(command: &str, error: E) -> QueueError
where
    E: std::error::Error,
{
    QueueError::RequestError {
        command: command.to_owned(),
        error: DisplayErrorContext(error).to_string(),
    }
}

#[async_trait]
impl QueueClient for SqsQueue {
    async fn receive_one(&self) -> Result<Option<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(self.wait_time_seconds)
            .visibility_timeout(self.visibility_timeout_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|error| request_error("ReceiveMessage", error))?;

        let Some(message) = output.messages.unwrap_or_default().into_iter().next() else {
            return Ok(None);
        };

        let receipt_handle = message
            .receipt_handle
            .ok_or(QueueError::MissingReceiptHandle)?;
        debug!(
            message_id = message.message_id.as_deref().unwrap_or("unknown"),
            "received message"
        );

        Ok(Some(QueueMessage {
            message_id: message.message_id,
            receipt_handle,
            body: message.body.unwrap_or_default(),
        }))
    }

    async fn delete_one(&self, receipt_handle: &str) -> Result<(), QueueError> {
        match self
            .client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(error) => {
                let invalid_handle = error
                    .as_service_error()
                    .map(|e| e.is_receipt_handle_is_invalid())
                    .unwrap_or(false);
                if invalid_handle {
                    Err(QueueError::InvalidReceiptHandle(receipt_handle.to_owned()))
                } else {
                    Err(request_error("DeleteMessage", error))
                }
            }
        }
    }

    async fn send_one(&self, body: &str) -> Result<(), QueueError> {
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|error| request_error("SendMessage", error))?;

        Ok(())
    }
}
