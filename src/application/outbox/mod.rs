//! Outbox services - transactional storage and background dispatch.
//!
//! ## Flow
//!
//! 1. A caller writes business rows and `OutboxManager::store_event` on the
//!    same transaction, then commits
//! 2. `OutboxDispatcher` workers claim due rows and publish them through
//!    the `EventBus`
//! 3. The maintenance job returns rows with expired leases to PENDING and
//!    deletes PUBLISHED rows past retention

mod dispatcher;
mod manager;

pub use dispatcher::{DispatchReport, DispatcherHandle, OutboxDispatcher};
pub use manager::OutboxManager;
