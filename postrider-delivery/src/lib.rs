//! Asynchronous redelivery of spooled messages to downstream SMTP next-hops.
//!
//! The delivery loop dequeues eligible entries, borrows a pooled outbound
//! session from the [`cache::ClientCache`], and applies the pure
//! [`scheduler`] decision to each outcome. All outbound concurrency is
//! governed by the cache's `max_concurrent_send_jobs` budget.

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod cache;
pub mod config;
pub mod error;
pub mod processor;
pub mod scheduler;

pub use cache::{CacheControl, ClientCache, ConnectionOutcome, Connector};
pub use config::{DeliveryConfig, SmtpTimeouts};
pub use error::DeliveryError;
pub use processor::{DeliveryProcessor, process_queue};
pub use scheduler::{Applied, SendOutcome};
