//! # Queue
//!
//! The message source the worker consumes from. `QueueClient` is the seam between
//! the processing loop and the queue service: `SqsQueue` implements it against an
//! SQS compatible API and `MemoryQueue` keeps everything in process.
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;

/// Enumeration of errors for operations against a queue.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("{command} request failed with: {error}")]
    RequestError { command: String, error: String },
    #[error("received a message without a receipt handle")]
    MissingReceiptHandle,
    #[error("receipt handle {0} is invalid or has expired")]
    InvalidReceiptHandle(String),
}

/// One delivery of a message. The receipt handle identifies this delivery, not
/// the message: it is only valid until the message becomes visible again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: Option<String>,
    pub receipt_handle: String,
    pub body: String,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Wait for at most one message. `Ok(None)` means the queue is empty.
    async fn receive_one(&self) -> Result<Option<QueueMessage>, QueueError>;

    /// Remove a delivered message so it is not delivered again.
    async fn delete_one(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Put a new message on the queue.
    async fn send_one(&self, body: &str) -> Result<(), QueueError>;
}

#[derive(Debug, Clone)]
struct StoredMessage {
    /// Position in push order, used to restore ordering on redelivery.
    seq: u64,
    id: String,
    body: String,
}

#[derive(Default)]
struct MemoryQueueState {
    visible: VecDeque<StoredMessage>,
    in_flight: HashMap<String, StoredMessage>,
    deleted: Vec<String>,
    next_id: u64,
    deliveries: u64,
    unavailable: bool,
}

/// An in-process queue with SQS-like visibility: a received message is hidden
/// until it is deleted or released with `release_in_flight`.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryQueueState> {
        // A panic while holding the lock leaves plain data behind, keep using it.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a message body, returning its message id.
    pub fn push(&self, body: &str) -> String {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("msg-{}", state.next_id);
        let seq = state.next_id;
        state.visible.push_back(StoredMessage {
            seq,
            id: id.clone(),
            body: body.to_owned(),
        });
        id
    }

    /// Make every received but undeleted message visible again, as a visibility
    /// timeout expiring would.
    pub fn release_in_flight(&self) {
        let mut state = self.state();
        let mut released: Vec<StoredMessage> = state.in_flight.drain().map(|(_, m)| m).collect();
        released.sort_by_key(|message| message.seq);
        for message in released.into_iter().rev() {
            state.visible.push_front(message);
        }
    }

    /// Make every request fail, as an unreachable queue service would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Number of messages waiting to be received.
    pub fn visible_len(&self) -> usize {
        self.state().visible.len()
    }

    /// Number of messages received but neither deleted nor released.
    pub fn in_flight_len(&self) -> usize {
        self.state().in_flight.len()
    }

    /// Ids of deleted messages, in deletion order.
    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    /// Bodies of every message not yet deleted, visible or in flight.
    pub fn pending_bodies(&self) -> Vec<String> {
        let state = self.state();
        state
            .visible
            .iter()
            .chain(state.in_flight.values())
            .map(|m| m.body.clone())
            .collect()
    }

    fn check_available(state: &MemoryQueueState, command: &str) -> Result<(), QueueError> {
        if state.unavailable {
            return Err(QueueError::RequestError {
                command: command.to_owned(),
                error: "queue is unavailable".to_owned(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn receive_one(&self) -> Result<Option<QueueMessage>, QueueError> {
        let mut state = self.state();
        Self::check_available(&state, "ReceiveMessage")?;

        let Some(message) = state.visible.pop_front() else {
            return Ok(None);
        };
        state.deliveries += 1;
        let receipt_handle = format!("{}-delivery-{}", message.id, state.deliveries);
        state
            .in_flight
            .insert(receipt_handle.clone(), message.clone());

        Ok(Some(QueueMessage {
            message_id: Some(message.id),
            receipt_handle,
            body: message.body,
        }))
    }

    async fn delete_one(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut state = self.state();
        Self::check_available(&state, "DeleteMessage")?;

        match state.in_flight.remove(receipt_handle) {
            Some(message) => {
                state.deleted.push(message.id);
                Ok(())
            }
            None => Err(QueueError::InvalidReceiptHandle(receipt_handle.to_owned())),
        }
    }

    async fn send_one(&self, body: &str) -> Result<(), QueueError> {
        Self::check_available(&self.state(), "SendMessage")?;
        self.push(body);
        Ok(())
    }
}
