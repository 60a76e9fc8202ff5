//! The run store: persisted run records, their timeline, and the
//! row-locking contract the handler runner and dispatcher build on.

mod memory;
mod model;
mod postgres;
mod store;

pub use memory::InMemoryRunStore;
pub use model::{
    wait_for_key, RunStatus, ScheduleContext, Timeline, TimelineEntry, WaitForMarker, WorkflowRun,
};
pub use postgres::PostgresRunStore;
pub use store::{ListRunsFilter, NewRun, Page, RunPatch, RunStore, StoreError};
