//! The external job queue contract and two implementations.

mod adapter;
mod memory;
mod postgres;

pub use adapter::{Job, QueueAdapter, QueueError, SendOptions, WorkOptions};
pub use memory::InMemoryQueueAdapter;
pub use postgres::PostgresQueueAdapter;
