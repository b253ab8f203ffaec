//! Operator control surface: freeze, send, remove, recover, and status
//! operations over spool entries, plus the live event stream.
//!
//! The protocol types are transport-agnostic serde values; wire framing is
//! a collaborator's concern.

#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod handler;
pub mod protocol;

pub use handler::Controller;
pub use protocol::{QueueStatus, RecoverFrom, Request, Response, SpoolStatus};
