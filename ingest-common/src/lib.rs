pub mod event;
pub mod masking;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod sink;
pub mod sqs;
pub mod validation;
