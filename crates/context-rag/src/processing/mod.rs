//! Document processing: the ingestion coordinator and its queue bridge

mod coordinator;
mod job_queue;
mod worker;

pub use coordinator::{ActivePass, IngestionCoordinator, ProcessOutcome, SkipReason};
pub use job_queue::{
    Delivery, DocumentPublisher, NsqSource, NsqdPublisher, NsqdSubscriber, QueueMessage,
    QueuePublisher, QueueSubscriber, SqliteQueue,
};
pub use worker::{Disposition, QueueConsumer};
