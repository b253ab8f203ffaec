//! Durable, crash-safe message spool.
//!
//! Messages live as sibling record/body files under one of four queue
//! directories; every mutation happens under a per-entry exclusive lock and
//! lands on disk through a write-temp-then-rename with fsync. Lifecycle
//! transitions are broadcast on the [`events::EventBus`].

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod events;
pub mod record;
pub mod recovery;
pub mod spool;
pub mod types;

pub use config::SpoolConfig;
pub use error::{Result, SpoolError};
pub use events::{EventBus, EventStream, SpoolEvent};
pub use record::{MessageRecord, RelayAttempt};
pub use recovery::RecoveryReport;
pub use spool::{Disposition, Entry, EntryStat, Routing, Spool};
pub use types::{Queue, Status};
